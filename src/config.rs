//! Configuration management for the RAG framework

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Main configuration for the RAG system
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RagConfig {
    /// Ingestion pipeline configuration
    #[serde(default)]
    pub ingestion: IngestionConfig,

    /// Retrieval configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// LLM gateway configuration
    #[serde(default)]
    pub llm: LlmConfig,

    /// Embedder configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Conversation engine configuration
    #[serde(default)]
    pub conversation: ConversationConfig,

    /// Conversation memory limits
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Storage paths
    #[serde(default)]
    pub storage: StorageConfig,

    /// ServiceNow integration configuration
    #[serde(default)]
    pub servicenow: ServiceNowConfig,
}

/// Ingestion pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Target chunk size in characters
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Default chunk overlap in characters (prose baseline for smart overlap)
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,

    /// Enable semantic boundary detection
    #[serde(default)]
    pub use_semantic_chunking: bool,

    /// Minimum chunk size for the semantic chunker
    #[serde(default = "default_min_chunk_size")]
    pub min_chunk_size: usize,

    /// Maximum chunk text length accepted by the store
    #[serde(default = "default_max_chunk_size")]
    pub max_chunk_size: usize,

    /// Worker pool size for directory ingestion
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

fn default_chunk_size() -> usize {
    1000
}

fn default_chunk_overlap() -> usize {
    200
}

fn default_min_chunk_size() -> usize {
    100
}

fn default_max_chunk_size() -> usize {
    8000
}

fn default_max_workers() -> usize {
    4
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            use_semantic_chunking: false,
            min_chunk_size: default_min_chunk_size(),
            max_chunk_size: default_max_chunk_size(),
            max_workers: default_max_workers(),
        }
    }
}

/// Retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Number of results returned to the caller
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Minimum similarity for a result to survive filtering
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    /// Enable cross-encoder reranking
    #[serde(default)]
    pub enable_reranking: bool,

    /// Candidate count fed into the reranker
    #[serde(default = "default_rerank_top_k")]
    pub rerank_top_k: usize,

    /// Enable source-diversity selection
    #[serde(default = "default_true")]
    pub enable_source_diversity: bool,

    /// Weight of diversity in the final score
    #[serde(default = "default_diversity_weight")]
    pub diversity_weight: f32,

    /// Maximum chunks admitted from a single document
    #[serde(default = "default_max_chunks_per_doc")]
    pub max_chunks_per_doc: usize,

    /// Minimum distinct source types targeted by diverse selection
    #[serde(default = "default_min_source_types")]
    pub min_source_types: usize,
}

fn default_top_k() -> usize {
    5
}

fn default_similarity_threshold() -> f32 {
    0.5
}

fn default_rerank_top_k() -> usize {
    20
}

fn default_diversity_weight() -> f32 {
    0.3
}

fn default_max_chunks_per_doc() -> usize {
    3
}

fn default_min_source_types() -> usize {
    2
}

fn default_true() -> bool {
    true
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            similarity_threshold: default_similarity_threshold(),
            enable_reranking: false,
            rerank_top_k: default_rerank_top_k(),
            enable_source_diversity: true,
            diversity_weight: default_diversity_weight(),
            max_chunks_per_doc: default_max_chunks_per_doc(),
            min_source_types: default_min_source_types(),
        }
    }
}

/// LLM gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider name ("ollama", "openai", "anthropic")
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    /// Model name for text generation
    #[serde(default = "default_llm_model")]
    pub model_name: String,

    /// Base URL for API calls
    pub base_url: Option<String>,

    /// API key (usually from environment variable)
    pub api_key: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout: u64,

    /// Maximum tokens for generation
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Temperature for generation
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum requests per minute (process-global)
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Minimum gap between requests in milliseconds
    #[serde(default = "default_min_interval_ms")]
    pub min_request_interval_ms: u64,

    /// Enable fallback to lower-priority providers
    #[serde(default = "default_true")]
    pub enable_fallback: bool,
}

fn default_llm_provider() -> String {
    "ollama".to_string()
}

fn default_llm_model() -> String {
    "llama3.2".to_string()
}

fn default_llm_timeout() -> u64 {
    30
}

fn default_max_tokens() -> u32 {
    1000
}

fn default_temperature() -> f32 {
    0.1
}

fn default_requests_per_minute() -> u32 {
    30
}

fn default_min_interval_ms() -> u64 {
    250
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model_name: default_llm_model(),
            base_url: None,
            api_key: None,
            timeout: default_llm_timeout(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            requests_per_minute: default_requests_per_minute(),
            min_request_interval_ms: default_min_interval_ms(),
            enable_fallback: true,
        }
    }
}

/// Embedder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Provider name ("ollama", "cohere")
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    /// Embedding model name
    #[serde(default = "default_embedding_model")]
    pub model_name: String,

    /// Base URL for API calls
    pub base_url: Option<String>,

    /// API key (usually from environment variable)
    pub api_key: Option<String>,

    /// Configured batch size; adaptive batching never exceeds 2x this
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Embedding dimension
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout: u64,
}

fn default_embedding_provider() -> String {
    "ollama".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_batch_size() -> usize {
    32
}

fn default_embedding_dimension() -> usize {
    768
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model_name: default_embedding_model(),
            base_url: None,
            api_key: None,
            batch_size: default_batch_size(),
            dimension: default_embedding_dimension(),
            timeout: default_llm_timeout(),
        }
    }
}

/// Conversation engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Use the LLM gateway for query analysis (heuristics otherwise)
    #[serde(default = "default_true")]
    pub enable_llm_query_analysis: bool,

    /// Maximum sub-queries produced by decomposition
    #[serde(default = "default_max_decomposed")]
    pub max_decomposed_queries: usize,

    /// Expand query variants with entity synonyms
    #[serde(default = "default_true")]
    pub synonym_expansion_enabled: bool,

    /// Enable query decomposition
    #[serde(default = "default_true")]
    pub enable_query_decomposition: bool,

    /// Enable aggregation query detection
    #[serde(default = "default_true")]
    pub enable_aggregation_detection: bool,

    /// Enable LLM response synthesis (extractive answers otherwise)
    #[serde(default = "default_true")]
    pub enable_response_synthesis: bool,
}

fn default_max_decomposed() -> usize {
    10
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            enable_llm_query_analysis: true,
            max_decomposed_queries: default_max_decomposed(),
            synonym_expansion_enabled: true,
            enable_query_decomposition: true,
            enable_aggregation_detection: true,
            enable_response_synthesis: true,
        }
    }
}

/// Conversation memory limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Maximum messages retained per thread
    #[serde(default = "default_max_history")]
    pub max_conversation_history: usize,

    /// Messages considered for contextual query enhancement
    #[serde(default = "default_max_relevant_history")]
    pub max_relevant_history: usize,

    /// Character budget for assembled prompt context
    #[serde(default = "default_max_context_length")]
    pub max_context_length: usize,

    /// Idle hours after which a thread is pruned
    #[serde(default = "default_conversation_timeout")]
    pub conversation_timeout_hours: i64,
}

fn default_max_history() -> usize {
    20
}

fn default_max_relevant_history() -> usize {
    6
}

fn default_max_context_length() -> usize {
    4000
}

fn default_conversation_timeout() -> i64 {
    24
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_conversation_history: default_max_history(),
            max_relevant_history: default_max_relevant_history(),
            max_context_length: default_max_context_length(),
            conversation_timeout_hours: default_conversation_timeout(),
        }
    }
}

/// Storage paths for the persistent stores
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database URL for the vector index + sidecar mapping
    #[serde(default = "default_vector_db")]
    pub vector_db_url: String,

    /// SQLite database URL for the metadata collections
    #[serde(default = "default_metadata_db")]
    pub metadata_db_url: String,

    /// Maximum vectors the index accepts
    #[serde(default = "default_capacity")]
    pub vector_capacity: usize,
}

fn default_vector_db() -> String {
    "sqlite:data/vectors.db".to_string()
}

fn default_metadata_db() -> String {
    "sqlite:data/metadata.db".to_string()
}

fn default_capacity() -> usize {
    1_000_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            vector_db_url: default_vector_db(),
            metadata_db_url: default_metadata_db(),
            vector_capacity: default_capacity(),
        }
    }
}

/// ServiceNow integration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceNowConfig {
    /// Enable the scheduler
    #[serde(default)]
    pub enabled: bool,

    /// Instance base URL, e.g. https://example.service-now.com
    #[serde(default)]
    pub instance_url: String,

    /// Basic-auth username
    #[serde(default)]
    pub username: String,

    /// Basic-auth password
    #[serde(default)]
    pub password: String,

    /// Minutes between scheduler ticks
    #[serde(default = "default_fetch_interval")]
    pub fetch_interval_minutes: u64,

    /// Page size for incident fetches
    #[serde(default = "default_sn_batch_size")]
    pub batch_size: usize,

    /// Per-fetch incident cap
    #[serde(default = "default_max_incidents")]
    pub max_incidents_per_fetch: usize,

    /// Priority values included in the fetch filter
    #[serde(default = "default_priority_filter")]
    pub priority_filter: Vec<String>,

    /// State values included in the fetch filter
    #[serde(default = "default_state_filter")]
    pub state_filter: Vec<String>,

    /// Lookback window in days
    #[serde(default = "default_days_back")]
    pub days_back: i64,

    /// Feed changed tickets straight into the ingestion engine
    #[serde(default = "default_true")]
    pub auto_ingest: bool,

    /// Cache entry TTL in hours
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_hours: i64,

    /// Minimum gap between API calls in milliseconds
    #[serde(default = "default_api_gap_ms")]
    pub min_api_interval_ms: u64,

    /// Request timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout: u64,
}

fn default_fetch_interval() -> u64 {
    15
}

fn default_sn_batch_size() -> usize {
    100
}

fn default_max_incidents() -> usize {
    1000
}

fn default_priority_filter() -> Vec<String> {
    vec!["1".to_string(), "2".to_string(), "3".to_string()]
}

fn default_state_filter() -> Vec<String> {
    vec!["1".to_string(), "2".to_string(), "3".to_string()]
}

fn default_days_back() -> i64 {
    7
}

fn default_cache_ttl() -> i64 {
    1
}

fn default_api_gap_ms() -> u64 {
    500
}

impl Default for ServiceNowConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            instance_url: String::new(),
            username: String::new(),
            password: String::new(),
            fetch_interval_minutes: default_fetch_interval(),
            batch_size: default_sn_batch_size(),
            max_incidents_per_fetch: default_max_incidents(),
            priority_filter: default_priority_filter(),
            state_filter: default_state_filter(),
            days_back: default_days_back(),
            auto_ingest: true,
            cache_ttl_hours: default_cache_ttl(),
            min_api_interval_ms: default_api_gap_ms(),
            timeout: default_llm_timeout(),
        }
    }
}

impl RagConfig {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<std::path::Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(&path)?;
        let config = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            Some("toml") => toml::from_str(&content)?,
            Some("yaml") | Some("yml") => serde_yml::from_str(&content)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<std::path::Path>>(&self, path: P) -> anyhow::Result<()> {
        let content = match path.as_ref().extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::to_string_pretty(self)?,
            Some("toml") => toml::to_string(self)?,
            Some("yaml") | Some("yml") => serde_yml::to_string(self)?,
            _ => return Err(anyhow::anyhow!("Unsupported config file format")),
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ingestion.chunk_size == 0 {
            return Err(anyhow::anyhow!("Chunk size must be greater than 0"));
        }

        if self.ingestion.chunk_overlap >= self.ingestion.chunk_size {
            return Err(anyhow::anyhow!(
                "Chunk overlap must be smaller than chunk size"
            ));
        }

        if self.ingestion.max_workers == 0 {
            return Err(anyhow::anyhow!("Worker pool size must be greater than 0"));
        }

        if self.embedding.dimension == 0 {
            return Err(anyhow::anyhow!(
                "Embedding dimension must be greater than 0"
            ));
        }

        if !(0.0..=1.0).contains(&self.retrieval.similarity_threshold) {
            return Err(anyhow::anyhow!(
                "Similarity threshold must be between 0.0 and 1.0"
            ));
        }

        if !(0.0..=1.0).contains(&self.retrieval.diversity_weight) {
            return Err(anyhow::anyhow!(
                "Diversity weight must be between 0.0 and 1.0"
            ));
        }

        if self.retrieval.top_k == 0 {
            return Err(anyhow::anyhow!("top_k must be greater than 0"));
        }

        if self.memory.max_conversation_history == 0 {
            return Err(anyhow::anyhow!(
                "Max conversation history must be greater than 0"
            ));
        }

        if self.servicenow.enabled {
            if !self.servicenow.instance_url.starts_with("http") {
                return Err(anyhow::anyhow!(
                    "Invalid ServiceNow instance URL: {}",
                    self.servicenow.instance_url
                ));
            }
            if self.servicenow.username.is_empty() {
                return Err(anyhow::anyhow!("ServiceNow username cannot be empty"));
            }
        }

        Ok(())
    }

    /// Per-call option overrides merged with defaults
    pub fn effective_top_k(&self, requested: Option<usize>) -> usize {
        requested.unwrap_or(self.retrieval.top_k)
    }
}

/// Extra metadata attached to config-driven components for logging
pub type OptionsMap = HashMap<String, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RagConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ingestion.chunk_size, 1000);
        assert_eq!(config.ingestion.chunk_overlap, 200);
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.retrieval.max_chunks_per_doc, 3);
        assert_eq!(config.memory.max_conversation_history, 20);
        assert_eq!(config.servicenow.fetch_interval_minutes, 15);
    }

    #[test]
    fn test_config_validation() {
        let mut config = RagConfig::default();
        assert!(config.validate().is_ok());

        config.ingestion.chunk_overlap = 2000;
        assert!(config.validate().is_err());

        config = RagConfig::default();
        config.retrieval.similarity_threshold = 1.5;
        assert!(config.validate().is_err());

        config = RagConfig::default();
        config.servicenow.enabled = true;
        config.servicenow.instance_url = "not-a-url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_roundtrip_json() {
        let config = RagConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: RagConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.retrieval.top_k, config.retrieval.top_k);
        assert_eq!(
            parsed.servicenow.priority_filter,
            config.servicenow.priority_filter
        );
    }
}
