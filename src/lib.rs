//! The Librarian
//!
//! A retrieval-augmented generation framework that integrates:
//! - Content-aware chunking with dynamic overlap and semantic boundaries
//! - A dense vector store with metadata projections and SQLite persistence
//! - Multi-variant retrieval with reranking and source-diversity selection
//! - A stateful conversation graph with context-poisoning defences
//! - Scheduled ServiceNow incident ingestion with change detection
//!
//! # Example
//!
//! ```rust,no_run
//! use the_librarian::{RagConfig, RagSystem};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = RagConfig::default();
//!     let system = RagSystem::new(config).await?;
//!
//!     system.ingest(std::path::Path::new("notes.txt"), None).await?;
//!     let answer = system.query("What do my notes say?", None, None).await?;
//!
//!     println!("{}", answer.response);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod conversation;
pub mod embedder;
pub mod error;
pub mod ingestion;
pub mod llm;
pub mod metadata_store;
pub mod models;
pub mod retrieval;
pub mod servicenow;
pub mod system;
pub mod types;
pub mod vector_store;

// Re-export main types
pub use config::{
    ConversationConfig, EmbeddingConfig, IngestionConfig, LlmConfig, MemoryConfig, RagConfig,
    RetrievalConfig, ServiceNowConfig, StorageConfig,
};
pub use conversation::{
    ContextManager, ContextQuality, ConversationGraph, ConversationMessage, ConversationNodes,
    ConversationPhase, ConversationState, ConversationTurn, MessageRole, ResponseValidator,
    ValidationReport,
};
pub use embedder::{CohereEmbeddingProvider, Embedder, EmbeddingProvider, OllamaEmbeddingProvider};
pub use error::{
    EmbeddingError, ErrorTracker, IntegrationError, LlmError, MetadataError, RagError, Result,
    VectorStoreError,
};
pub use ingestion::{
    Chunker, DocumentProcessor, IngestResult, IngestStatus, IngestionEngine, IngestionSummary,
    ProcessorRegistry, SemanticChunker, TextProcessor,
};
pub use llm::{
    AnthropicProvider, LlmGateway, LlmProvider, OllamaProvider, OpenAiProvider, ProviderConfig,
    ProviderType, RateLimiter,
};
pub use metadata_store::MetadataStore;
pub use models::{ModelHandle, ModelMemoryManager};
pub use retrieval::{
    CrossEncoderProvider, CrossEncoderReranker, Intent, QueryAnalysis, QueryAnalyzer, QueryEngine,
    QueryOptions, QueryType, Reranker, SimilarityReranker,
};
pub use servicenow::{ServiceNowConnector, TicketProcessor, TicketScheduler};
pub use system::{Providers, RagSystem, SystemStats};
pub use types::{
    Chunk, ConfidenceLevel, DiversityMetrics, Document, Metadata, QueryResponse, RetrievedChunk,
    SourceType,
};
pub use vector_store::{DistanceMetric, IndexInfo, SearchHit, VectorStore};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.starts_with(char::is_numeric));
    }
}
