//! System facade wiring the subsystems behind the public API
//!
//! The vector and metadata stores are process-wide singletons; the vector
//! store sits behind a read/write lock so searches proceed concurrently
//! while ingestion writes are exclusive. Providers are injectable: pass
//! your own embedding provider, LLM providers, and cross-encoder, or let
//! the facade build the configured defaults.

use crate::config::RagConfig;
use crate::conversation::{ConversationGraph, ConversationNodes, ConversationTurn};
use crate::embedder::{create_embedding_provider, Embedder, EmbeddingProvider};
use crate::error::{ErrorTracker, Result};
use crate::ingestion::{
    IngestResult, IngestionEngine, IngestionSummary, ProcessorRegistry, TextProcessor,
};
use crate::llm::{LlmGateway, LlmProvider};
use crate::metadata_store::{MetadataStore, COLLECTION_CHUNKS, COLLECTION_DOCUMENTS};
use crate::models::ModelMemoryManager;
use crate::retrieval::{
    CrossEncoderProvider, CrossEncoderReranker, QueryAnalyzer, QueryEngine, QueryOptions, Reranker,
    SimilarityReranker,
};
use crate::servicenow::{FetchOutcome, TicketScheduler};
use crate::types::{Metadata, QueryResponse};
use crate::vector_store::{DistanceMetric, VectorStore};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;

/// Injectable provider set for [`RagSystem::with_providers`]
pub struct Providers {
    pub embedding: Arc<dyn EmbeddingProvider>,
    pub llm: Vec<Arc<dyn LlmProvider>>,
    pub cross_encoder: Option<Arc<dyn CrossEncoderProvider>>,
}

/// Aggregate statistics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub documents: usize,
    pub chunks: usize,
    pub vectors: usize,
    pub dimension: usize,
    pub active_conversations: usize,
    pub total_errors: u64,
    pub vector_store_read_only: bool,
}

/// The assembled RAG system
pub struct RagSystem {
    config: RagConfig,
    vector_store: Arc<RwLock<VectorStore>>,
    metadata_store: Arc<MetadataStore>,
    engine: Arc<IngestionEngine>,
    query_engine: Arc<QueryEngine>,
    conversation: ConversationGraph,
    scheduler: Option<Arc<TicketScheduler>>,
    error_tracker: Arc<ErrorTracker>,
    models: Arc<ModelMemoryManager>,
}

impl RagSystem {
    /// Build the system with providers constructed from configuration
    pub async fn new(config: RagConfig) -> Result<Self> {
        let providers = Providers {
            embedding: create_embedding_provider(&config.embedding)?,
            llm: Vec::new(),
            cross_encoder: None,
        };
        Self::build(config, providers, true).await
    }

    /// Build the system with an injected provider set
    pub async fn with_providers(config: RagConfig, providers: Providers) -> Result<Self> {
        Self::build(config, providers, false).await
    }

    async fn build(
        config: RagConfig,
        providers: Providers,
        gateway_from_config: bool,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| crate::error::RagError::Config(e.to_string()))?;

        let error_tracker = Arc::new(ErrorTracker::new());
        let embedder = Arc::new(Embedder::new(providers.embedding, config.embedding.clone()));
        let dimension = embedder.get_dimension();

        let vector_store = Arc::new(RwLock::new(
            VectorStore::open(&config.storage, dimension, DistanceMetric::Cosine).await?,
        ));
        let metadata_store = Arc::new(MetadataStore::open(&config.storage).await?);

        let gateway: Option<Arc<LlmGateway>> = if gateway_from_config {
            Some(Arc::new(LlmGateway::from_config(config.llm.clone())?))
        } else if providers.llm.is_empty() {
            None
        } else {
            Some(Arc::new(LlmGateway::new(
                providers.llm,
                config.llm.clone(),
            )))
        };

        let mut registry = ProcessorRegistry::new();
        registry.register(Arc::new(TextProcessor::new(
            config.ingestion.clone(),
            Arc::clone(&embedder),
        )));

        let engine = Arc::new(IngestionEngine::new(
            registry,
            Arc::clone(&embedder),
            Arc::clone(&vector_store),
            Arc::clone(&metadata_store),
            Arc::clone(&error_tracker),
            config.ingestion.clone(),
        ));

        let analyzer = Arc::new(QueryAnalyzer::new(
            gateway.clone(),
            config.conversation.clone(),
        ));

        let reranker: Arc<dyn Reranker> = match &providers.cross_encoder {
            Some(cross_encoder) if config.retrieval.enable_reranking => Arc::new(
                CrossEncoderReranker::new(Arc::clone(cross_encoder), config.embedding.batch_size),
            ),
            _ => Arc::new(SimilarityReranker::new()),
        };

        let query_engine = Arc::new(QueryEngine::new(
            Arc::clone(&vector_store),
            Arc::clone(&embedder),
            gateway.clone(),
            Arc::clone(&analyzer),
            reranker,
            config.retrieval.clone(),
            config.conversation.clone(),
            Arc::clone(&error_tracker),
        ));

        let nodes = ConversationNodes::new(
            Arc::clone(&query_engine),
            Arc::clone(&analyzer),
            gateway.clone(),
            config.memory.clone(),
        );
        let conversation = ConversationGraph::new(nodes, config.memory.clone());

        let scheduler = if config.servicenow.enabled {
            Some(TicketScheduler::new(
                Arc::clone(&engine),
                Arc::clone(&metadata_store),
                config.servicenow.clone(),
            ))
        } else {
            None
        };

        let models = ModelMemoryManager::new(
            4 * 1024 * 1024 * 1024, // 4 GiB cap for loaded model handles
            Duration::from_secs(15 * 60),
        );
        Arc::clone(&models).spawn_sweeper(Duration::from_secs(5 * 60));

        info!(
            "RAG system assembled (dimension {}, scheduler {})",
            dimension,
            if scheduler.is_some() { "on" } else { "off" }
        );

        Ok(Self {
            config,
            vector_store,
            metadata_store,
            engine,
            query_engine,
            conversation,
            scheduler,
            error_tracker,
            models,
        })
    }

    /// Ingest one file
    pub async fn ingest(&self, path: &Path, metadata: Option<Metadata>) -> Result<IngestResult> {
        self.engine.ingest_file(path, metadata).await
    }

    /// Ingest a directory tree with the configured worker pool
    pub async fn ingest_directory(
        &self,
        path: &Path,
        max_depth: usize,
        workers: Option<usize>,
    ) -> Result<IngestionSummary> {
        Arc::clone(&self.engine)
            .ingest_directory(path, max_depth, workers)
            .await
    }

    /// Delete a document and everything derived from it
    pub async fn delete_document(&self, doc_id: &str) -> Result<usize> {
        self.engine.delete_document(doc_id).await
    }

    /// Answer a query against the indexed corpus
    pub async fn query(
        &self,
        text: &str,
        filters: Option<Metadata>,
        top_k: Option<usize>,
    ) -> Result<QueryResponse> {
        let options = QueryOptions {
            filters,
            top_k,
            ..QueryOptions::default()
        };
        self.query_engine.process_query(text, options).await
    }

    /// Open a new conversation thread
    pub async fn start_conversation(&self) -> ConversationTurn {
        self.conversation.start_conversation().await
    }

    /// Send a message on an existing thread
    pub async fn send_message(&self, thread_id: &str, text: &str) -> Result<ConversationTurn> {
        self.conversation.send_message(thread_id, text).await
    }

    /// Drop conversation threads idle beyond the configured timeout
    pub async fn prune_idle_conversations(&self) -> usize {
        self.conversation.prune_idle_threads().await
    }

    /// Start the ServiceNow scheduler, if configured
    pub async fn start_scheduler(&self) {
        if let Some(scheduler) = &self.scheduler {
            Arc::clone(scheduler).start().await;
        }
    }

    /// Stop the ServiceNow scheduler, draining the in-flight fetch
    pub async fn stop_scheduler(&self) {
        if let Some(scheduler) = &self.scheduler {
            scheduler.stop().await;
        }
    }

    /// Run one manual ServiceNow sync
    pub async fn sync_servicenow(&self) -> Option<FetchOutcome> {
        match &self.scheduler {
            Some(scheduler) => Some(scheduler.sync_now().await),
            None => None,
        }
    }

    /// Compact tombstoned vectors
    pub async fn compact_vector_store(&self) -> Result<usize> {
        let mut store = self.vector_store.write().await;
        store.compact().await
    }

    /// Aggregate statistics
    pub async fn stats(&self) -> Result<SystemStats> {
        let (vectors, dimension, read_only) = {
            let store = self.vector_store.read().await;
            let index_info = store.get_index_info();
            (index_info.ntotal, index_info.dimension, store.is_read_only())
        };

        Ok(SystemStats {
            documents: self.metadata_store.count(COLLECTION_DOCUMENTS).await?,
            chunks: self.metadata_store.count(COLLECTION_CHUNKS).await?,
            vectors,
            dimension,
            active_conversations: self.conversation.active_threads().await,
            total_errors: self.error_tracker.total_errors(),
            vector_store_read_only: read_only,
        })
    }

    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    pub fn model_manager(&self) -> &Arc<ModelMemoryManager> {
        &self.models
    }
}
