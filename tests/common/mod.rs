//! Shared test fixtures: deterministic providers and system construction

use async_trait::async_trait;
use std::sync::Arc;
use the_librarian::{
    EmbeddingConfig, EmbeddingProvider, Providers, RagConfig, RagSystem, Result, StorageConfig,
};

pub const TEST_DIMENSION: usize = 64;

/// Deterministic embedder projecting word presence onto hashed axes.
/// Texts sharing words get high cosine similarity; disjoint texts do not.
pub struct HashEmbeddingProvider {
    dimension: usize,
}

impl HashEmbeddingProvider {
    pub fn new() -> Self {
        Self {
            dimension: TEST_DIMENSION,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbeddingProvider {
    fn name(&self) -> &str {
        "hash-test"
    }

    fn get_dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut vector = vec![0.0f32; self.dimension];
                for word in text
                    .to_lowercase()
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| !w.is_empty())
                {
                    let mut hash = 0usize;
                    for byte in word.bytes() {
                        hash = hash.wrapping_mul(31).wrapping_add(byte as usize);
                    }
                    vector[hash % self.dimension] += 1.0;
                }
                vector
            })
            .collect())
    }
}

/// A config with in-memory stores and no LLM dependency
pub fn test_config() -> RagConfig {
    let mut config = RagConfig::default();
    config.storage = StorageConfig {
        vector_db_url: "sqlite::memory:".to_string(),
        metadata_db_url: "sqlite::memory:".to_string(),
        vector_capacity: 10_000,
    };
    config.embedding = EmbeddingConfig {
        dimension: TEST_DIMENSION,
        ..EmbeddingConfig::default()
    };
    config.conversation.enable_llm_query_analysis = false;
    config
}

/// Assemble a system over the deterministic embedder, without an LLM
pub async fn test_system(config: RagConfig) -> RagSystem {
    let providers = Providers {
        embedding: Arc::new(HashEmbeddingProvider::new()),
        llm: Vec::new(),
        cross_encoder: None,
    };
    RagSystem::with_providers(config, providers)
        .await
        .expect("test system builds")
}
