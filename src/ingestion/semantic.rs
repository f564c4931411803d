//! Semantic boundary chunking
//!
//! Splits text into sentences, embeds them, and places chunk boundaries
//! where consecutive-sentence similarity drops below an adaptive threshold
//! derived from the per-document similarity distribution. Large inputs are
//! pre-bucketed by size so sentence embeddings stay bounded in memory.

use crate::config::IngestionConfig;
use crate::embedder::Embedder;
use crate::error::Result;
use crate::ingestion::chunker::{clean_text, split_sentences};
use crate::ingestion::ChunkPiece;
use crate::types::Metadata;
use crate::vector_store::cosine_similarity;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};

/// Inputs beyond this many sentences are pre-bucketed before refinement
const PRE_BUCKET_SENTENCES: usize = 500;

pub struct SemanticChunker {
    embedder: Arc<Embedder>,
    config: IngestionConfig,
}

impl SemanticChunker {
    pub fn new(embedder: Arc<Embedder>, config: IngestionConfig) -> Self {
        info!(
            "Semantic chunker initialized: size={}, min={}, max={}",
            config.chunk_size, config.min_chunk_size, config.max_chunk_size
        );
        Self { embedder, config }
    }

    /// Split text at semantic boundaries. Output shape matches the recursive
    /// strategy; a single-sentence input produces exactly one chunk.
    pub async fn chunk_text(
        &self,
        text: &str,
        metadata: Option<&Metadata>,
    ) -> Result<Vec<ChunkPiece>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let cleaned = clean_text(text);
        let sentences = split_sentences(&cleaned);
        if sentences.is_empty() {
            return Ok(Vec::new());
        }

        let texts = if sentences.len() == 1 {
            vec![sentences[0].clone()]
        } else if sentences.len() > PRE_BUCKET_SENTENCES {
            let mut all = Vec::new();
            for bucket in pre_bucket(&sentences, self.config.chunk_size * 10) {
                all.extend(self.refine(&bucket).await?);
            }
            all
        } else {
            self.refine(&sentences).await?
        };

        let total = texts.len();
        let chunks = texts
            .into_iter()
            .enumerate()
            .map(|(i, chunk_text)| {
                let mut chunk_metadata = Metadata::new();
                chunk_metadata.insert("chunk_index".to_string(), json!(i));
                chunk_metadata.insert("chunk_size".to_string(), json!(chunk_text.chars().count()));
                chunk_metadata.insert("total_chunks".to_string(), json!(total));
                chunk_metadata.insert("chunking_method".to_string(), json!("semantic"));
                if let Some(caller) = metadata {
                    for (key, value) in caller {
                        chunk_metadata.insert(key.clone(), value.clone());
                    }
                }
                ChunkPiece {
                    text: chunk_text,
                    chunk_index: i,
                    metadata: chunk_metadata,
                }
            })
            .collect::<Vec<_>>();

        info!("Created {} semantic chunks from text", chunks.len());
        Ok(chunks)
    }

    /// Embed sentences and cut where similarity drops below the adaptive
    /// threshold, honouring min/max chunk sizes
    async fn refine(&self, sentences: &[String]) -> Result<Vec<String>> {
        if sentences.len() == 1 {
            return Ok(vec![sentences[0].clone()]);
        }

        let embeddings = self.embedder.embed_texts(sentences).await?;

        let similarities: Vec<f32> = embeddings
            .windows(2)
            .map(|pair| cosine_similarity(&pair[0], &pair[1]))
            .collect();

        let mean = similarities.iter().sum::<f32>() / similarities.len() as f32;
        let variance = similarities
            .iter()
            .map(|s| (s - mean).powi(2))
            .sum::<f32>()
            / similarities.len() as f32;
        let threshold = mean - 0.5 * variance.sqrt();
        debug!(
            "Semantic boundary threshold: {:.4} (mean={:.4}, std={:.4})",
            threshold,
            mean,
            variance.sqrt()
        );

        let mut chunks = Vec::new();
        let mut current = String::new();

        for (i, sentence) in sentences.iter().enumerate() {
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(sentence);

            let current_len = current.chars().count();
            let at_boundary = i < similarities.len() && similarities[i] < threshold;
            let over_max = current_len >= self.config.max_chunk_size.min(self.config.chunk_size);

            if (at_boundary && current_len >= self.config.min_chunk_size) || over_max {
                chunks.push(current.trim().to_string());
                current = String::new();
            }
        }

        if !current.trim().is_empty() {
            // A trailing fragment below the minimum folds into the last chunk
            if current.chars().count() < self.config.min_chunk_size && !chunks.is_empty() {
                let last = chunks.last_mut().expect("chunks non-empty");
                last.push(' ');
                last.push_str(current.trim());
            } else {
                chunks.push(current.trim().to_string());
            }
        }

        Ok(chunks)
    }
}

/// Group sentences into rough size buckets for bounded embedding memory
fn pre_bucket(sentences: &[String], bucket_chars: usize) -> Vec<Vec<String>> {
    let mut buckets = Vec::new();
    let mut current = Vec::new();
    let mut current_chars = 0usize;

    for sentence in sentences {
        let len = sentence.chars().count();
        if current_chars + len > bucket_chars && !current.is_empty() {
            buckets.push(std::mem::take(&mut current));
            current_chars = 0;
        }
        current.push(sentence.clone());
        current_chars += len;
    }

    if !current.is_empty() {
        buckets.push(current);
    }
    buckets
}
