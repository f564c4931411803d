//! Cross-encoder reranking with similarity fallback

use crate::error::Result;
use crate::types::RetrievedChunk;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Capability of a cross-encoder scorer: relevance per (query, text) pair
#[async_trait]
pub trait CrossEncoderProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn score_pairs(&self, pairs: &[(String, String)]) -> Result<Vec<f32>>;
}

/// Re-orders candidate chunks by relevance to the query
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Re-score and re-order; adds `rerank_score`, preserves the original
    /// score, and never changes the result shape
    async fn rerank(
        &self,
        query: &str,
        documents: Vec<RetrievedChunk>,
        top_k: Option<usize>,
    ) -> Vec<RetrievedChunk>;

    fn is_enabled(&self) -> bool;
}

/// Cross-encoder reranker processing pairs in bounded batches
pub struct CrossEncoderReranker {
    provider: Arc<dyn CrossEncoderProvider>,
    batch_size: usize,
    fallback: SimilarityReranker,
}

impl CrossEncoderReranker {
    pub fn new(provider: Arc<dyn CrossEncoderProvider>, batch_size: usize) -> Self {
        info!("Reranker initialized with provider: {}", provider.name());
        Self {
            provider,
            batch_size: batch_size.max(1),
            fallback: SimilarityReranker::new(),
        }
    }

    async fn predict_scores(&self, query: &str, documents: &[RetrievedChunk]) -> Result<Vec<f32>> {
        let pairs: Vec<(String, String)> = documents
            .iter()
            .map(|doc| (query.to_string(), doc.text.clone()))
            .collect();

        let mut scores = Vec::with_capacity(pairs.len());
        for batch in pairs.chunks(self.batch_size) {
            scores.extend(self.provider.score_pairs(batch).await?);
        }
        Ok(scores)
    }
}

#[async_trait]
impl Reranker for CrossEncoderReranker {
    async fn rerank(
        &self,
        query: &str,
        documents: Vec<RetrievedChunk>,
        top_k: Option<usize>,
    ) -> Vec<RetrievedChunk> {
        if documents.is_empty() {
            return documents;
        }

        let scores = match self.predict_scores(query, &documents).await {
            Ok(scores) if scores.len() == documents.len() => scores,
            Ok(_) | Err(_) => {
                warn!("Cross-encoder unavailable, using similarity fallback");
                return self.fallback.rerank(query, documents, top_k).await;
            }
        };

        let mut reranked: Vec<RetrievedChunk> = documents
            .into_iter()
            .zip(scores)
            .map(|(mut doc, score)| {
                doc.original_score = Some(doc.similarity_score);
                doc.rerank_score = Some(score);
                doc
            })
            .collect();

        reranked.sort_by(|a, b| {
            b.rerank_score
                .partial_cmp(&a.rerank_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if let Some(k) = top_k {
            reranked.truncate(k);
        }
        info!("Reranked {} documents", reranked.len());
        reranked
    }

    fn is_enabled(&self) -> bool {
        true
    }
}

/// Fallback reranker ordering by the similarity scores already present
pub struct SimilarityReranker;

impl SimilarityReranker {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SimilarityReranker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Reranker for SimilarityReranker {
    async fn rerank(
        &self,
        _query: &str,
        documents: Vec<RetrievedChunk>,
        top_k: Option<usize>,
    ) -> Vec<RetrievedChunk> {
        let mut sorted: Vec<RetrievedChunk> = documents
            .into_iter()
            .map(|mut doc| {
                doc.original_score = Some(doc.similarity_score);
                doc.rerank_score = Some(doc.similarity_score);
                doc
            })
            .collect();

        sorted.sort_by(|a, b| {
            b.similarity_score
                .partial_cmp(&a.similarity_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        if let Some(k) = top_k {
            sorted.truncate(k);
        }
        sorted
    }

    fn is_enabled(&self) -> bool {
        true
    }
}
