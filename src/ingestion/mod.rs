//! Ingestion pipeline: processor -> chunker -> embedder -> stores
//!
//! The engine is idempotent over document IDs derived from source path and
//! content hash. Vector writes are a single atomic append; metadata writes
//! that fail afterwards are compensated by deleting the document's vectors,
//! so a partially ingested document is never observable.

pub mod chunker;
pub mod processors;
pub mod semantic;

pub use chunker::{classify_content, ChunkPiece, Chunker, ContentType};
pub use processors::{
    DocumentProcessor, ProcessStatus, ProcessorOutput, ProcessorRegistry, RawChunk, TextProcessor,
};
pub use semantic::SemanticChunker;

use crate::config::IngestionConfig;
use crate::embedder::Embedder;
use crate::error::{ErrorTracker, RagError, Result};
use crate::metadata_store::{MetadataStore, COLLECTION_CHUNKS, COLLECTION_DOCUMENTS};
use crate::types::{
    content_hash, make_chunk_id, make_doc_id, Chunk, Document, Metadata, SourceType,
};
use crate::vector_store::VectorStore;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Outcome of a single ingestion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Success,
    Skipped,
    Error,
}

/// Result of ingesting one source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResult {
    pub status: IngestStatus,
    pub doc_id: Option<String>,
    pub chunk_count: usize,
    pub embedding_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IngestResult {
    fn skipped(doc_id: Option<String>) -> Self {
        Self {
            status: IngestStatus::Skipped,
            doc_id,
            chunk_count: 0,
            embedding_count: 0,
            error: None,
        }
    }
}

/// Summary of a directory ingestion
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestionSummary {
    pub total_files: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Orchestrates processing, embedding, and transactional store writes
pub struct IngestionEngine {
    registry: ProcessorRegistry,
    chunker: Chunker,
    embedder: Arc<Embedder>,
    vector_store: Arc<RwLock<VectorStore>>,
    metadata_store: Arc<MetadataStore>,
    error_tracker: Arc<ErrorTracker>,
    config: IngestionConfig,
}

impl IngestionEngine {
    pub fn new(
        registry: ProcessorRegistry,
        embedder: Arc<Embedder>,
        vector_store: Arc<RwLock<VectorStore>>,
        metadata_store: Arc<MetadataStore>,
        error_tracker: Arc<ErrorTracker>,
        config: IngestionConfig,
    ) -> Self {
        Self {
            registry,
            chunker: Chunker::new(config.clone()),
            embedder,
            vector_store,
            metadata_store,
            error_tracker,
            config,
        }
    }

    /// Ingest a single file. Re-ingesting an unchanged file is a no-op.
    pub async fn ingest_file(
        &self,
        path: &Path,
        metadata: Option<Metadata>,
    ) -> Result<IngestResult> {
        let bytes = tokio::fs::read(path).await?;
        let hash = content_hash(&bytes);
        let source = path.display().to_string();
        let doc_id = make_doc_id(&source, &hash);

        if self.document_unchanged(&doc_id, &hash).await? {
            debug!("Document {} unchanged, skipping", doc_id);
            return Ok(IngestResult::skipped(Some(doc_id)));
        }

        let processor = self.registry.select(path)?;
        let output = processor.process(path, metadata).await?;
        if output.status == ProcessStatus::Error {
            return Ok(IngestResult {
                status: IngestStatus::Error,
                doc_id: Some(doc_id),
                chunk_count: 0,
                embedding_count: 0,
                error: Some("processor reported failure".to_string()),
            });
        }
        if output.chunks.is_empty() {
            return Ok(IngestResult::skipped(Some(doc_id)));
        }

        let original_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let source_type = path
            .extension()
            .and_then(|e| e.to_str())
            .map(SourceType::from_extension)
            .unwrap_or(SourceType::Other);

        self.store_document(
            doc_id,
            source,
            source_type,
            original_name,
            hash,
            processor.name().to_string(),
            output.chunks,
            output.metadata,
        )
        .await
    }

    /// Ingest pre-extracted text (external records such as tickets)
    pub async fn ingest_text(
        &self,
        source: &str,
        source_type: SourceType,
        text: &str,
        metadata: Metadata,
    ) -> Result<IngestResult> {
        let hash = content_hash(text.as_bytes());
        let doc_id = make_doc_id(source, &hash);

        if self.document_unchanged(&doc_id, &hash).await? {
            debug!("Document {} unchanged, skipping", doc_id);
            return Ok(IngestResult::skipped(Some(doc_id)));
        }

        let pieces = self.chunker.chunk_text(text, Some(&metadata))?;
        if pieces.is_empty() {
            return Ok(IngestResult::skipped(Some(doc_id)));
        }

        let chunks = pieces
            .into_iter()
            .map(|piece| RawChunk {
                text: piece.text,
                metadata: piece.metadata,
            })
            .collect();

        self.store_document(
            doc_id,
            source.to_string(),
            source_type,
            source.to_string(),
            hash,
            "text_ingest".to_string(),
            chunks,
            metadata,
        )
        .await
    }

    async fn document_unchanged(&self, doc_id: &str, hash: &str) -> Result<bool> {
        match self.metadata_store.get(COLLECTION_DOCUMENTS, doc_id).await? {
            Some(existing) => Ok(existing
                .get("content_hash")
                .and_then(|v| v.as_str())
                .map(|h| h == hash)
                .unwrap_or(false)),
            None => Ok(false),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn store_document(
        &self,
        doc_id: String,
        source: String,
        source_type: SourceType,
        original_name: String,
        hash: String,
        processor_name: String,
        raw_chunks: Vec<RawChunk>,
        doc_metadata: Metadata,
    ) -> Result<IngestResult> {
        // Stale revisions of the same source are replaced
        self.remove_stale_revisions(&source, &doc_id).await?;

        let mut chunks = Vec::with_capacity(raw_chunks.len());
        let mut texts = Vec::with_capacity(raw_chunks.len());
        for (index, raw) in raw_chunks.into_iter().enumerate() {
            if raw.text.trim().is_empty() {
                continue;
            }
            let text = if raw.text.chars().count() > self.config.max_chunk_size {
                raw.text
                    .chars()
                    .take(self.config.max_chunk_size)
                    .collect::<String>()
            } else {
                raw.text
            };

            let chunk_id = make_chunk_id(&doc_id, index, &text);
            let mut chunk_metadata = doc_metadata.clone();
            for (key, value) in raw.metadata {
                chunk_metadata.insert(key, value);
            }
            chunk_metadata.insert("doc_id".to_string(), json!(doc_id.clone()));
            chunk_metadata.insert("chunk_id".to_string(), json!(chunk_id.clone()));
            chunk_metadata.insert("chunk_index".to_string(), json!(index));
            chunk_metadata.insert("source_type".to_string(), json!(source_type.to_string()));
            chunk_metadata.insert("source_label".to_string(), json!(original_name.clone()));

            texts.push(text.clone());
            chunks.push(Chunk {
                chunk_id,
                doc_id: doc_id.clone(),
                chunk_index: index,
                text,
                metadata: chunk_metadata,
                embedding: None,
            });
        }

        if chunks.is_empty() {
            return Ok(IngestResult::skipped(Some(doc_id)));
        }

        // Transient embedding failures get exactly one engine-level retry
        let embeddings = match self.embedder.embed_texts(&texts).await {
            Ok(embeddings) => embeddings,
            Err(e) if e.is_retryable() => {
                warn!("Embedding failed ({}), retrying once", e);
                self.error_tracker.record("ingestion", "embed", &e);
                self.embedder.embed_texts(&texts).await?
            }
            Err(e) => {
                self.error_tracker.record("ingestion", "embed", &e);
                return Err(e);
            }
        };

        let embedding_count = embeddings.len();
        let mut projections = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            let mut projection = chunk.metadata.clone();
            projection.insert("text".to_string(), json!(chunk.text));
            projections.push(projection);
        }

        {
            let mut store = self.vector_store.write().await;
            store.add_vectors(embeddings.clone(), projections).await?;
        }

        let document = Document {
            doc_id: doc_id.clone(),
            source,
            source_type,
            original_name,
            uploaded_at: Utc::now(),
            content_hash: hash,
            processor: processor_name,
            metadata: doc_metadata,
        };

        if let Err(e) = self.write_records(&document, &chunks, &embeddings).await {
            // No orphans: roll the vectors back before surfacing the error
            warn!("Metadata write failed, compensating vector append: {}", e);
            self.error_tracker.record("ingestion", "metadata_write", &e);
            let mut store = self.vector_store.write().await;
            let _ = store.delete_by_doc_id(&doc_id).await;
            return Err(e);
        }

        info!(
            "Ingested {} ({} chunks, {} embeddings)",
            doc_id,
            chunks.len(),
            embedding_count
        );

        Ok(IngestResult {
            status: IngestStatus::Success,
            doc_id: Some(doc_id),
            chunk_count: chunks.len(),
            embedding_count,
            error: None,
        })
    }

    async fn write_records(
        &self,
        document: &Document,
        chunks: &[Chunk],
        embeddings: &[Vec<f32>],
    ) -> Result<()> {
        self.metadata_store
            .put(
                COLLECTION_DOCUMENTS,
                &document.doc_id,
                &serde_json::to_value(document)?,
            )
            .await?;

        for (chunk, embedding) in chunks.iter().zip(embeddings.iter()) {
            let mut stored = chunk.clone();
            stored.embedding = Some(embedding.clone());
            self.metadata_store
                .put(
                    COLLECTION_CHUNKS,
                    &chunk.chunk_id,
                    &serde_json::to_value(&stored)?,
                )
                .await?;
        }
        Ok(())
    }

    async fn remove_stale_revisions(&self, source: &str, new_doc_id: &str) -> Result<()> {
        let stale = self
            .metadata_store
            .list(COLLECTION_DOCUMENTS, |record| {
                record.get("source").and_then(|v| v.as_str()) == Some(source)
                    && record.get("doc_id").and_then(|v| v.as_str()) != Some(new_doc_id)
            })
            .await?;

        for record in stale {
            if let Some(old_id) = record.get("doc_id").and_then(|v| v.as_str()) {
                info!("Replacing stale revision {} of {}", old_id, source);
                self.delete_document(old_id).await?;
            }
        }
        Ok(())
    }

    /// Cascade-delete a document: its chunks and every vector carrying its id
    pub async fn delete_document(&self, doc_id: &str) -> Result<usize> {
        let removed = {
            let mut store = self.vector_store.write().await;
            store.delete_by_doc_id(doc_id).await?
        };

        self.metadata_store
            .delete_where(COLLECTION_CHUNKS, |record| {
                record.get("doc_id").and_then(|v| v.as_str()) == Some(doc_id)
            })
            .await?;
        self.metadata_store.delete(COLLECTION_DOCUMENTS, doc_id).await?;

        Ok(removed)
    }

    /// Ingest every processable file under a directory with a worker pool.
    ///
    /// A single file failure is recorded and does not abort the batch.
    pub async fn ingest_directory(
        self: Arc<Self>,
        path: &Path,
        max_depth: usize,
        workers: Option<usize>,
    ) -> Result<IngestionSummary> {
        let mut files = Vec::new();
        collect_files(path, max_depth, &mut files)?;
        let total_files = files.len();
        info!(
            "Ingesting directory {} ({} files)",
            path.display(),
            total_files
        );

        let worker_count = workers.unwrap_or(self.config.max_workers).max(1);
        let (work_tx, work_rx) = flume::unbounded::<PathBuf>();
        let (result_tx, result_rx) = flume::unbounded::<std::result::Result<IngestResult, String>>();

        for file in files {
            let _ = work_tx.send(file);
        }
        drop(work_tx);

        let mut handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let engine = Arc::clone(&self);
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            handles.push(tokio::spawn(async move {
                while let Ok(file) = work_rx.recv_async().await {
                    let outcome = engine
                        .ingest_file(&file, None)
                        .await
                        .map_err(|e| format!("{}: {}", file.display(), e));
                    let _ = result_tx.send_async(outcome).await;
                }
            }));
        }
        drop(result_tx);

        let mut summary = IngestionSummary {
            total_files,
            ..IngestionSummary::default()
        };
        while let Ok(outcome) = result_rx.recv_async().await {
            match outcome {
                Ok(result) => match result.status {
                    IngestStatus::Success => summary.succeeded += 1,
                    IngestStatus::Skipped => summary.skipped += 1,
                    IngestStatus::Error => {
                        summary.failed += 1;
                        if let Some(error) = result.error {
                            summary.errors.push(error);
                        }
                    }
                },
                Err(error) => {
                    summary.failed += 1;
                    summary.errors.push(error);
                }
            }
        }

        for handle in handles {
            let _ = handle.await;
        }

        info!(
            "Directory ingestion finished: {} ok, {} skipped, {} failed",
            summary.succeeded, summary.skipped, summary.failed
        );
        Ok(summary)
    }
}

fn collect_files(path: &Path, max_depth: usize, files: &mut Vec<PathBuf>) -> Result<()> {
    if !path.is_dir() {
        return Err(RagError::Ingestion(format!(
            "not a directory: {}",
            path.display()
        )));
    }

    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let entry_path = entry.path();
        if entry_path.is_dir() {
            if max_depth > 0 {
                collect_files(&entry_path, max_depth - 1, files)?;
            }
        } else {
            files.push(entry_path);
        }
    }
    Ok(())
}
