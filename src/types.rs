//! Core data model for documents, chunks, and retrieval results

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Flat metadata map attached to documents, chunks, and results
pub type Metadata = HashMap<String, serde_json::Value>;

/// Source type of a registered document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Pdf,
    Spreadsheet,
    Word,
    Text,
    Image,
    Ticket,
    Other,
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceType::Pdf => write!(f, "pdf"),
            SourceType::Spreadsheet => write!(f, "spreadsheet"),
            SourceType::Word => write!(f, "word"),
            SourceType::Text => write!(f, "text"),
            SourceType::Image => write!(f, "image"),
            SourceType::Ticket => write!(f, "ticket"),
            SourceType::Other => write!(f, "other"),
        }
    }
}

impl SourceType {
    /// Classify by file extension
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_lowercase().as_str() {
            "pdf" => SourceType::Pdf,
            "xls" | "xlsx" | "csv" => SourceType::Spreadsheet,
            "doc" | "docx" => SourceType::Word,
            "txt" | "md" | "text" => SourceType::Text,
            "png" | "jpg" | "jpeg" | "gif" | "bmp" => SourceType::Image,
            _ => SourceType::Other,
        }
    }
}

/// A registered source item. Immutable after creation except for deletion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Stable ID derived from source path + content hash
    pub doc_id: String,
    /// File path or external ticket number
    pub source: String,
    pub source_type: SourceType,
    pub original_name: String,
    pub uploaded_at: DateTime<Utc>,
    pub content_hash: String,
    /// Name of the processor that produced the chunks
    pub processor: String,
    pub metadata: Metadata,
}

/// An embeddable unit of text owned by exactly one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub metadata: Metadata,
    /// Precomputed embedding, present once the chunk reached the store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// A retrieval hit carried through scoring, reranking, and selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub text: String,
    pub source_label: String,
    pub metadata: Metadata,
    /// Raw similarity from the vector index
    pub similarity_score: f32,
    /// similarity x variant confidence
    pub weighted_score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_score: Option<f32>,
    #[serde(default)]
    pub diversity_score: f32,
    #[serde(default)]
    pub final_score: f32,
}

impl RetrievedChunk {
    /// Score used for ranking: rerank score when present, else weighted
    pub fn relevance(&self) -> f32 {
        self.rerank_score.unwrap_or(self.weighted_score)
    }

    pub fn source_type(&self) -> String {
        self.metadata
            .get("source_type")
            .and_then(|v| v.as_str())
            .unwrap_or("other")
            .to_string()
    }

    pub fn author(&self) -> Option<String> {
        self.metadata
            .get("author")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}

/// Diversity metrics reported alongside query responses
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiversityMetrics {
    pub unique_documents: usize,
    pub unique_source_types: usize,
    /// Average diversity score of the selected results
    pub diversity_index: f32,
    /// Fraction of selected results from distinct documents
    pub coverage_score: f32,
}

/// Confidence bucket for a query response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
}

impl ConfidenceLevel {
    pub fn from_score(score: f32) -> Self {
        if score >= 0.7 {
            ConfidenceLevel::High
        } else if score >= 0.4 {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }
}

/// Details of a query-variant substitution surfaced to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEnhancement {
    pub original_query: String,
    pub enhanced_query: String,
    pub variant_label: String,
    pub original_avg_score: f32,
    pub enhanced_avg_score: f32,
}

/// Final response of the query engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub query: String,
    pub response: String,
    pub confidence_score: f32,
    pub confidence_level: ConfidenceLevel,
    pub sources: Vec<RetrievedChunk>,
    pub total_sources: usize,
    pub diversity_metrics: DiversityMetrics,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_enhancement: Option<QueryEnhancement>,
}

impl QueryResponse {
    /// The empty-response object returned when nothing meets the threshold
    pub fn empty(query: &str) -> Self {
        Self {
            query: query.to_string(),
            response: String::new(),
            confidence_score: 0.0,
            confidence_level: ConfidenceLevel::Low,
            sources: Vec::new(),
            total_sources: 0,
            diversity_metrics: DiversityMetrics::default(),
            timestamp: Utc::now(),
            query_enhancement: None,
        }
    }
}

/// Hex SHA-256 digest of arbitrary bytes
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Stable document ID from source path + content hash
pub fn make_doc_id(source: &str, content_hash: &str) -> String {
    let digest = Sha256::digest(format!("{}:{}", source, content_hash).as_bytes());
    format!("doc_{:x}", digest)[..20].to_string()
}

/// Stable chunk ID from doc id, chunk index, and text hash
pub fn make_chunk_id(doc_id: &str, chunk_index: usize, text: &str) -> String {
    let text_digest = Sha256::digest(text.as_bytes());
    let digest = Sha256::digest(format!("{}:{}:{:x}", doc_id, chunk_index, text_digest).as_bytes());
    format!("chunk_{:x}", digest)[..22].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_type_from_extension() {
        assert_eq!(SourceType::from_extension("pdf"), SourceType::Pdf);
        assert_eq!(SourceType::from_extension("XLSX"), SourceType::Spreadsheet);
        assert_eq!(SourceType::from_extension("md"), SourceType::Text);
        assert_eq!(SourceType::from_extension("bin"), SourceType::Other);
    }

    #[test]
    fn test_stable_ids() {
        let hash = content_hash(b"hello world");
        let doc_a = make_doc_id("/tmp/a.txt", &hash);
        let doc_b = make_doc_id("/tmp/a.txt", &hash);
        assert_eq!(doc_a, doc_b);
        assert!(doc_a.starts_with("doc_"));

        let other = make_doc_id("/tmp/b.txt", &hash);
        assert_ne!(doc_a, other);

        let chunk_a = make_chunk_id(&doc_a, 0, "some text");
        let chunk_b = make_chunk_id(&doc_a, 1, "some text");
        assert_ne!(chunk_a, chunk_b);
        assert!(chunk_a.starts_with("chunk_"));
    }

    #[test]
    fn test_confidence_level_buckets() {
        assert_eq!(ConfidenceLevel::from_score(0.9), ConfidenceLevel::High);
        assert_eq!(ConfidenceLevel::from_score(0.5), ConfidenceLevel::Medium);
        assert_eq!(ConfidenceLevel::from_score(0.1), ConfidenceLevel::Low);
    }

    #[test]
    fn test_empty_response() {
        let response = QueryResponse::empty("anything");
        assert_eq!(response.confidence_score, 0.0);
        assert!(response.sources.is_empty());
        assert_eq!(response.total_sources, 0);
    }
}
