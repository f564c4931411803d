//! Text embedding with provider capabilities and adaptive batching

use crate::config::EmbeddingConfig;
use crate::error::{EmbeddingError, RagError, Result};
use crate::vector_store::cosine_similarity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::System;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Capability implemented by concrete embedding providers
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &str;

    /// Embedding dimension; stable across calls
    fn get_dimension(&self) -> usize;

    /// Embed a batch of texts, one vector per text
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Ollama embedding provider
pub struct OllamaEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dimension: usize,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct OllamaEmbedRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embedding: Vec<f32>,
}

impl OllamaEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            model: config.model_name.clone(),
            dimension: config.dimension,
            timeout: Duration::from_secs(config.timeout),
        }
    }

    fn api_url(&self) -> String {
        format!("{}/api/embeddings", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddingProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn get_dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            let request = OllamaEmbedRequest {
                model: self.model.clone(),
                prompt: text.clone(),
            };

            let response = timeout(
                self.timeout,
                self.client.post(self.api_url()).json(&request).send(),
            )
            .await
            .map_err(|_| EmbeddingError::ProviderUnavailable("request timed out".to_string()))?
            .map_err(|e| EmbeddingError::ProviderUnavailable(e.to_string()))?;

            if response.status().as_u16() == 429 {
                return Err(EmbeddingError::RateLimited.into());
            }
            if !response.status().is_success() {
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown error".to_string());
                return Err(EmbeddingError::Failed(error_text).into());
            }

            let parsed: OllamaEmbedResponse = response
                .json()
                .await
                .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
            embeddings.push(parsed.embedding);
        }
        Ok(embeddings)
    }
}

/// Cohere embedding provider
pub struct CohereEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    dimension: usize,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct CohereEmbedRequest {
    texts: Vec<String>,
    model: String,
    input_type: String,
}

#[derive(Debug, Deserialize)]
struct CohereEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl CohereEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .or_else(|| std::env::var("COHERE_API_KEY").ok())
            .ok_or_else(|| {
                RagError::Config("Cohere API key not provided".to_string())
            })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .expect("Failed to create HTTP client");

        Ok(Self {
            client,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.cohere.ai".to_string()),
            model: config.model_name.clone(),
            api_key,
            dimension: config.dimension,
            timeout: Duration::from_secs(config.timeout),
        })
    }

    fn api_url(&self) -> String {
        format!("{}/v1/embed", self.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl EmbeddingProvider for CohereEmbeddingProvider {
    fn name(&self) -> &str {
        "cohere"
    }

    fn get_dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let request = CohereEmbedRequest {
            texts: texts.to_vec(),
            model: self.model.clone(),
            input_type: "search_document".to_string(),
        };

        let response = timeout(
            self.timeout,
            self.client
                .post(self.api_url())
                .bearer_auth(&self.api_key)
                .json(&request)
                .send(),
        )
        .await
        .map_err(|_| EmbeddingError::ProviderUnavailable("request timed out".to_string()))?
        .map_err(|e| EmbeddingError::ProviderUnavailable(e.to_string()))?;

        if response.status().as_u16() == 429 {
            return Err(EmbeddingError::RateLimited.into());
        }
        if !response.status().is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(EmbeddingError::Failed(error_text).into());
        }

        let parsed: CohereEmbedResponse = response
            .json()
            .await
            .map_err(|e| EmbeddingError::InvalidResponse(e.to_string()))?;
        Ok(parsed.embeddings)
    }
}

/// Build the configured provider variant
pub fn create_embedding_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.to_lowercase().as_str() {
        "ollama" => Ok(Arc::new(OllamaEmbeddingProvider::new(config))),
        "cohere" => Ok(Arc::new(CohereEmbeddingProvider::new(config)?)),
        other => Err(RagError::Config(format!(
            "Unsupported embedding provider: {}",
            other
        ))),
    }
}

/// Embedder wrapping a provider with adaptive batch sizing.
///
/// Batch size is derived from available process memory and the text length
/// distribution, never exceeding twice the configured batch size. Very long
/// outliers halve the batch.
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    config: EmbeddingConfig,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: EmbeddingConfig) -> Self {
        info!(
            "Embedder initialized with provider: {} (dimension {})",
            provider.name(),
            provider.get_dimension()
        );
        Self { provider, config }
    }

    pub fn get_dimension(&self) -> usize {
        self.provider.get_dimension()
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Compute the optimal batch size for a set of text lengths
    pub fn calculate_optimal_batch_size(&self, text_lengths: &[usize]) -> usize {
        if text_lengths.is_empty() {
            return self.config.batch_size.min(32).max(1);
        }

        let mut sys = System::new();
        sys.refresh_memory();
        let available_memory = sys.available_memory();

        let avg_len = text_lengths.iter().sum::<usize>() as f64 / text_lengths.len() as f64;
        let max_len = *text_lengths.iter().max().unwrap_or(&0) as f64;
        let dimension = self.get_dimension() as f64;

        // ~4 bytes per character plus the embedding itself, with 3x
        // processing overhead; use 40% of available memory
        let estimated_per_text = (avg_len * 4.0 + dimension * 4.0) * 3.0;
        let mut batch = ((available_memory as f64 * 0.4) / estimated_per_text) as usize;

        batch = batch.clamp(1, self.config.batch_size * 2);

        if max_len > avg_len * 3.0 {
            batch = (batch / 2).max(1);
        }

        debug!(
            "Optimal batch size: {} (available_memory: {:.1}MB, avg_text_length: {:.1}, dimension: {})",
            batch,
            available_memory as f64 / 1024.0 / 1024.0,
            avg_len,
            dimension
        );
        batch
    }

    /// Embed texts in adaptive batches.
    ///
    /// A 429-equivalent signal gets exactly one retry after an exponential
    /// delay; any other failure surfaces immediately for the caller's policy.
    pub async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let text_lengths: Vec<usize> = texts.iter().map(|t| t.len()).collect();
        let batch_size = self.calculate_optimal_batch_size(&text_lengths);

        let mut all_embeddings = Vec::with_capacity(texts.len());
        let total_batches = texts.len().div_ceil(batch_size);
        for (batch_idx, batch) in texts.chunks(batch_size).enumerate() {
            let embeddings = match self.provider.embed_texts(batch).await {
                Ok(embeddings) => embeddings,
                Err(RagError::Embedding(EmbeddingError::RateLimited)) => {
                    let delay = Duration::from_millis(1000 * 2u64.pow(1));
                    warn!(
                        "Embedding provider rate limited, retrying once after {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    self.provider.embed_texts(batch).await?
                }
                Err(e) => return Err(e),
            };

            if embeddings.len() != batch.len() {
                return Err(EmbeddingError::InvalidResponse(format!(
                    "expected {} embeddings, got {}",
                    batch.len(),
                    embeddings.len()
                ))
                .into());
            }

            all_embeddings.extend(embeddings);
            debug!(
                "Processed batch {}/{} ({} texts, batch_size: {})",
                batch_idx + 1,
                total_batches,
                batch.len(),
                batch_size
            );
        }

        Ok(all_embeddings)
    }

    /// Embed a single text
    pub async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let mut embeddings = self.embed_texts(&[text.to_string()]).await?;
        embeddings
            .pop()
            .ok_or_else(|| EmbeddingError::InvalidResponse("empty embedding batch".to_string()).into())
    }

    /// Cosine similarity between two texts
    pub async fn similarity(&self, text1: &str, text2: &str) -> Result<f32> {
        let embeddings = self
            .embed_texts(&[text1.to_string(), text2.to_string()])
            .await?;
        Ok(cosine_similarity(&embeddings[0], &embeddings[1]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    /// Deterministic stub provider for batching tests
    struct StubProvider {
        dimension: usize,
        calls: AtomicUsize,
        fail_first_with_429: bool,
    }

    #[async_trait]
    impl EmbeddingProvider for StubProvider {
        fn name(&self) -> &str {
            "stub"
        }

        fn get_dimension(&self) -> usize {
            self.dimension
        }

        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first_with_429 && call == 0 {
                return Err(EmbeddingError::RateLimited.into());
            }
            Ok(texts.iter().map(|_| vec![0.5; self.dimension]).collect())
        }
    }

    fn test_config(batch_size: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            batch_size,
            dimension: 8,
            ..EmbeddingConfig::default()
        }
    }

    #[tokio::test]
    async fn test_embed_texts_batches_everything() {
        let provider = Arc::new(StubProvider {
            dimension: 8,
            calls: AtomicUsize::new(0),
            fail_first_with_429: false,
        });
        let embedder = Embedder::new(provider, test_config(4));

        let texts: Vec<String> = (0..10).map(|i| format!("text number {}", i)).collect();
        let embeddings = embedder.embed_texts(&texts).await.unwrap();
        assert_eq!(embeddings.len(), 10);
        assert!(embeddings.iter().all(|e| e.len() == 8));
    }

    #[tokio::test]
    async fn test_rate_limit_retried_once() {
        let provider = Arc::new(StubProvider {
            dimension: 8,
            calls: AtomicUsize::new(0),
            fail_first_with_429: true,
        });
        let embedder = Embedder::new(provider, test_config(32));

        let embeddings = embedder
            .embed_texts(&["one".to_string(), "two".to_string()])
            .await
            .unwrap();
        assert_eq!(embeddings.len(), 2);
    }

    #[test]
    fn test_optimal_batch_size_bounds() {
        let provider = Arc::new(StubProvider {
            dimension: 8,
            calls: AtomicUsize::new(0),
            fail_first_with_429: false,
        });
        let embedder = Embedder::new(provider, test_config(32));

        // Uniform short texts stay within [1, 2x configured]
        let batch = embedder.calculate_optimal_batch_size(&[100; 50]);
        assert!(batch >= 1);
        assert!(batch <= 64);

        // A long outlier halves the batch relative to the uniform case
        let mut lengths = vec![100; 50];
        lengths.push(10_000);
        let halved = embedder.calculate_optimal_batch_size(&lengths);
        assert!(halved <= batch);

        // Empty input falls back to the configured default
        assert_eq!(embedder.calculate_optimal_batch_size(&[]), 32);
    }

    #[test]
    fn test_dimension_is_stable() {
        let provider = Arc::new(StubProvider {
            dimension: 8,
            calls: AtomicUsize::new(0),
            fail_first_with_429: false,
        });
        let embedder = Embedder::new(provider, test_config(32));
        assert_eq!(embedder.get_dimension(), 8);
        assert_eq!(embedder.get_dimension(), 8);
    }

    #[tokio::test]
    async fn test_ollama_provider_against_mock_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "embedding": [0.1, 0.2, 0.3, 0.4]
                })),
            )
            .mount(&server)
            .await;

        let config = EmbeddingConfig {
            base_url: Some(server.uri()),
            dimension: 4,
            ..EmbeddingConfig::default()
        };
        let provider = OllamaEmbeddingProvider::new(&config);

        let embeddings = provider
            .embed_texts(&["hello".to_string()])
            .await
            .unwrap();
        assert_eq!(embeddings.len(), 1);
        assert_eq!(embeddings[0], vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[tokio::test]
    async fn test_ollama_provider_surfaces_429() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/embeddings"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let config = EmbeddingConfig {
            base_url: Some(server.uri()),
            dimension: 4,
            ..EmbeddingConfig::default()
        };
        let provider = OllamaEmbeddingProvider::new(&config);

        let result = provider.embed_texts(&["hello".to_string()]).await;
        assert!(matches!(
            result,
            Err(RagError::Embedding(EmbeddingError::RateLimited))
        ));
    }
}
