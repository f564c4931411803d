//! Document processors
//!
//! A processor turns a source file into text chunks plus document-level
//! metadata. Chunk text is non-empty UTF-8 and metadata maps stay flat.
//! The registry is open: format-specific extractors plug in through the
//! [`DocumentProcessor`] trait.

use crate::config::IngestionConfig;
use crate::embedder::Embedder;
use crate::error::{RagError, Result};
use crate::ingestion::chunker::Chunker;
use crate::ingestion::semantic::SemanticChunker;
use crate::types::{Metadata, SourceType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Processing outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Success,
    Skipped,
    Error,
}

/// A chunk as produced by a processor, before IDs are assigned
#[derive(Debug, Clone)]
pub struct RawChunk {
    pub text: String,
    pub metadata: Metadata,
}

/// Output contract of every processor
#[derive(Debug, Clone)]
pub struct ProcessorOutput {
    pub status: ProcessStatus,
    pub chunks: Vec<RawChunk>,
    pub metadata: Metadata,
}

/// Contract implemented by format-specific extractors
#[async_trait]
pub trait DocumentProcessor: Send + Sync {
    fn name(&self) -> &str;

    fn can_process(&self, path: &Path) -> bool;

    async fn process(&self, path: &Path, metadata: Option<Metadata>) -> Result<ProcessorOutput>;
}

/// Plain text and markdown processor
pub struct TextProcessor {
    chunker: Chunker,
    semantic: Option<SemanticChunker>,
}

impl TextProcessor {
    pub fn new(config: IngestionConfig, embedder: Arc<Embedder>) -> Self {
        let semantic = if config.use_semantic_chunking {
            Some(SemanticChunker::new(embedder, config.clone()))
        } else {
            None
        };
        Self {
            chunker: Chunker::new(config),
            semantic,
        }
    }
}

#[async_trait]
impl DocumentProcessor for TextProcessor {
    fn name(&self) -> &str {
        "text_processor"
    }

    fn can_process(&self, path: &Path) -> bool {
        matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("txt") | Some("md") | Some("text") | Some("log")
        )
    }

    async fn process(&self, path: &Path, metadata: Option<Metadata>) -> Result<ProcessorOutput> {
        let content = tokio::fs::read_to_string(path).await?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("txt");

        let mut doc_metadata = metadata.unwrap_or_default();
        doc_metadata.insert("file_name".to_string(), json!(file_name));
        doc_metadata.insert(
            "source_type".to_string(),
            json!(SourceType::from_extension(extension).to_string()),
        );

        if content.trim().is_empty() {
            return Ok(ProcessorOutput {
                status: ProcessStatus::Skipped,
                chunks: Vec::new(),
                metadata: doc_metadata,
            });
        }

        // Semantic chunking degrades to the recursive strategy on failure
        let pieces = match &self.semantic {
            Some(semantic) => match semantic.chunk_text(&content, Some(&doc_metadata)).await {
                Ok(pieces) => pieces,
                Err(e) => {
                    warn!("Semantic chunking failed, using recursive: {}", e);
                    self.chunker.chunk_text(&content, Some(&doc_metadata))?
                }
            },
            None => self.chunker.chunk_text(&content, Some(&doc_metadata))?,
        };

        debug!("Processed {} into {} chunks", file_name, pieces.len());

        Ok(ProcessorOutput {
            status: ProcessStatus::Success,
            chunks: pieces
                .into_iter()
                .map(|piece| RawChunk {
                    text: piece.text,
                    metadata: piece.metadata,
                })
                .collect(),
            metadata: doc_metadata,
        })
    }
}

/// Extension-based processor registry
pub struct ProcessorRegistry {
    processors: Vec<Arc<dyn DocumentProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self {
            processors: Vec::new(),
        }
    }

    pub fn register(&mut self, processor: Arc<dyn DocumentProcessor>) {
        self.processors.push(processor);
    }

    /// Select the first processor that accepts the path
    pub fn select(&self, path: &Path) -> Result<Arc<dyn DocumentProcessor>> {
        self.processors
            .iter()
            .find(|p| p.can_process(path))
            .cloned()
            .ok_or_else(|| {
                RagError::Ingestion(format!("no processor for {}", path.display()))
            })
    }
}

impl Default for ProcessorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::embedder::EmbeddingProvider;
    use std::io::Write;

    struct NullProvider;

    #[async_trait]
    impl EmbeddingProvider for NullProvider {
        fn name(&self) -> &str {
            "null"
        }

        fn get_dimension(&self) -> usize {
            4
        }

        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![0.0; 4]).collect())
        }
    }

    fn text_processor() -> TextProcessor {
        let embedder = Arc::new(Embedder::new(
            Arc::new(NullProvider),
            EmbeddingConfig {
                dimension: 4,
                ..EmbeddingConfig::default()
            },
        ));
        TextProcessor::new(IngestionConfig::default(), embedder)
    }

    #[test]
    fn test_can_process_extensions() {
        let processor = text_processor();
        assert!(processor.can_process(Path::new("/tmp/notes.txt")));
        assert!(processor.can_process(Path::new("/tmp/readme.md")));
        assert!(!processor.can_process(Path::new("/tmp/image.png")));
    }

    #[tokio::test]
    async fn test_process_text_file() {
        let mut file = tempfile::NamedTempFile::with_suffix(".txt").unwrap();
        writeln!(file, "Hello from the test file. It has two sentences.").unwrap();

        let processor = text_processor();
        let output = processor.process(file.path(), None).await.unwrap();

        assert_eq!(output.status, ProcessStatus::Success);
        assert_eq!(output.chunks.len(), 1);
        assert!(output.chunks[0].text.contains("Hello"));
        assert_eq!(output.metadata["source_type"], "text");
    }

    #[tokio::test]
    async fn test_process_empty_file_skips() {
        let file = tempfile::NamedTempFile::with_suffix(".txt").unwrap();

        let processor = text_processor();
        let output = processor.process(file.path(), None).await.unwrap();
        assert_eq!(output.status, ProcessStatus::Skipped);
        assert!(output.chunks.is_empty());
    }

    #[tokio::test]
    async fn test_registry_selects_by_extension() {
        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(text_processor()));

        assert!(registry.select(Path::new("/tmp/a.txt")).is_ok());
        assert!(registry.select(Path::new("/tmp/a.parquet")).is_err());
    }
}
