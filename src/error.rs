//! Error handling for the RAG framework

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;

/// Result type alias for the RAG framework
pub type Result<T> = std::result::Result<T, RagError>;

/// Main error type for the RAG framework
#[derive(Error, Debug)]
pub enum RagError {
    #[error("Vector store error: {0}")]
    VectorStore(#[from] VectorStoreError),

    #[error("Metadata store error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Chunking error: {0}")]
    Chunking(String),

    #[error("Ingestion error: {0}")]
    Ingestion(String),

    #[error("Retrieval error: {0}")]
    Retrieval(String),

    #[error("Integration error: {0}")]
    Integration(#[from] IntegrationError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(String),
}

/// Errors related to the vector store
#[derive(Error, Debug)]
pub enum VectorStoreError {
    #[error("Dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Store full: capacity {capacity} exhausted")]
    StoreFull { capacity: usize },

    #[error("Store is read-only after persist failure")]
    WriteDegraded,

    #[error("Persist failed: {0}")]
    PersistFailed(String),

    #[error("Search failed: {0}")]
    SearchFailed(String),
}

/// Errors related to the metadata store
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    #[error("Storage failed: {0}")]
    StorageFailed(String),

    #[error("Record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },
}

/// Errors related to embedding operations
#[derive(Error, Debug)]
pub enum EmbeddingError {
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Rate limited by provider")]
    RateLimited,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Embedding failed: {0}")]
    Failed(String),
}

/// Errors related to language model operations
#[derive(Error, Debug)]
pub enum LlmError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Generation failed: {0}")]
    GenerationFailed(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Timeout: operation took too long")]
    Timeout,

    #[error("All providers failed")]
    AllProvidersFailed,
}

/// Errors related to external integrations (ServiceNow)
#[derive(Error, Debug)]
pub enum IntegrationError {
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("API request failed: {0}")]
    ApiFailed(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
}

impl RagError {
    /// Check if the error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RagError::Llm(LlmError::Timeout)
                | RagError::Llm(LlmError::ConnectionFailed(_))
                | RagError::Embedding(EmbeddingError::RateLimited)
                | RagError::Embedding(EmbeddingError::ProviderUnavailable(_))
                | RagError::Integration(IntegrationError::ConnectionFailed(_))
                | RagError::Http(_)
        )
    }

    /// Get error category for logging/metrics
    pub fn category(&self) -> &'static str {
        match self {
            RagError::VectorStore(_) => "vector_store",
            RagError::Metadata(_) => "metadata",
            RagError::Embedding(_) => "embedding",
            RagError::Llm(_) => "llm",
            RagError::Chunking(_) => "chunking",
            RagError::Ingestion(_) => "ingestion",
            RagError::Retrieval(_) => "retrieval",
            RagError::Integration(_) => "integration",
            RagError::Config(_) => "config",
            RagError::Validation(_) => "validation",
            RagError::Resource(_) => "resource",
            RagError::Io(_) => "io",
            RagError::Serialization(_) => "serialization",
            RagError::Http(_) => "http",
            RagError::Database(_) => "database",
            RagError::Generic(_) => "generic",
            RagError::NotFound(_) => "not_found",
        }
    }
}

/// A recorded error with structured context
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub component: String,
    pub operation: String,
    pub category: &'static str,
    pub details: String,
    pub count: u64,
    pub first_seen: Instant,
    pub last_seen: Instant,
}

/// Aggregates errors per (component, operation) with rate-limited logging.
///
/// Orchestrators record failures here instead of logging every occurrence;
/// repeated identical failures within the log window only bump a counter.
pub struct ErrorTracker {
    records: Mutex<HashMap<(String, String), ErrorRecord>>,
    log_interval: Duration,
}

impl ErrorTracker {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            log_interval: Duration::from_secs(60),
        }
    }

    pub fn with_log_interval(mut self, interval: Duration) -> Self {
        self.log_interval = interval;
        self
    }

    /// Record an error against a component/operation pair
    pub fn record(&self, component: &str, operation: &str, error: &RagError) {
        let key = (component.to_string(), operation.to_string());
        let now = Instant::now();
        let mut records = self.records.lock().expect("error tracker lock poisoned");

        match records.get_mut(&key) {
            Some(record) => {
                record.count += 1;
                record.details = error.to_string();
                if now.duration_since(record.last_seen) >= self.log_interval {
                    warn!(
                        component = %record.component,
                        operation = %record.operation,
                        count = record.count,
                        "Recurring error: {}",
                        record.details
                    );
                    record.last_seen = now;
                }
            }
            None => {
                warn!(
                    component = %component,
                    operation = %operation,
                    "Error: {}",
                    error
                );
                records.insert(
                    key,
                    ErrorRecord {
                        component: component.to_string(),
                        operation: operation.to_string(),
                        category: error.category(),
                        details: error.to_string(),
                        count: 1,
                        first_seen: now,
                        last_seen: now,
                    },
                );
            }
        }
    }

    /// Total recorded errors across all keys
    pub fn total_errors(&self) -> u64 {
        let records = self.records.lock().expect("error tracker lock poisoned");
        records.values().map(|r| r.count).sum()
    }

    /// Snapshot of all error records
    pub fn snapshot(&self) -> Vec<ErrorRecord> {
        let records = self.records.lock().expect("error tracker lock poisoned");
        records.values().cloned().collect()
    }
}

impl Default for ErrorTracker {
    fn default() -> Self {
        Self::new()
    }
}
