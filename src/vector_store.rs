//! Dense vector index with metadata projections and SQLite persistence
//!
//! The index is a flat in-memory scan over fixed-dimension vectors with a
//! parallel position-to-chunk-id mapping. Every mutation is persisted to
//! SQLite (vector blob + metadata projection per row); deletion tombstones
//! rows until a compaction cycle rewrites the table.

use crate::config::StorageConfig;
use crate::error::{RagError, Result, VectorStoreError};
use crate::types::Metadata;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Similarity metric, fixed at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceMetric {
    Cosine,
    InnerProduct,
}

impl std::fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DistanceMetric::Cosine => write!(f, "cosine"),
            DistanceMetric::InnerProduct => write!(f, "inner_product"),
        }
    }
}

impl FromStr for DistanceMetric {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "cosine" => Ok(DistanceMetric::Cosine),
            "inner_product" => Ok(DistanceMetric::InnerProduct),
            other => Err(format!("unknown metric: {}", other)),
        }
    }
}

/// Index statistics
#[derive(Debug, Clone, Serialize)]
pub struct IndexInfo {
    pub ntotal: usize,
    pub dimension: usize,
    pub metric: DistanceMetric,
}

/// A search hit with its metadata projection
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub chunk_id: String,
    pub vector_id: usize,
    pub similarity_score: f32,
    pub metadata: Metadata,
}

struct VectorRow {
    chunk_id: String,
    vector: Vec<f32>,
    metadata: Metadata,
    deleted: bool,
}

/// Flat dense vector store with SQLite persistence
pub struct VectorStore {
    pool: SqlitePool,
    dimension: usize,
    metric: DistanceMetric,
    capacity: usize,
    rows: Vec<VectorRow>,
    read_only: bool,
}

impl VectorStore {
    /// Open (or create) a store at the configured database URL
    pub async fn open(
        config: &StorageConfig,
        dimension: usize,
        metric: DistanceMetric,
    ) -> Result<Self> {
        info!(
            "Opening vector store at {} (dimension={}, metric={})",
            config.vector_db_url, dimension, metric
        );

        let url = config
            .vector_db_url
            .strip_prefix("sqlite:")
            .unwrap_or(&config.vector_db_url);
        if let Some(parent) = std::path::Path::new(url).parent() {
            if !parent.as_os_str().is_empty() && url != ":memory:" {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&config.vector_db_url)
            .map_err(|e| RagError::Config(e.to_string()))?
            .create_if_missing(true);
        // In-memory databases are per-connection; a single connection keeps
        // the schema visible across all queries
        let max_connections = if config.vector_db_url.contains(":memory:") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS index_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS vectors (
                position INTEGER PRIMARY KEY,
                chunk_id TEXT NOT NULL,
                embedding BLOB NOT NULL,
                metadata TEXT NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_vectors_chunk ON vectors(chunk_id)")
            .execute(&pool)
            .await?;

        // A stored index must keep its construction-time dimension and metric
        let stored_dim: Option<(String,)> =
            sqlx::query_as("SELECT value FROM index_meta WHERE key = 'dimension'")
                .fetch_optional(&pool)
                .await?;
        match stored_dim {
            Some((value,)) => {
                let stored: usize = value
                    .parse()
                    .map_err(|_| RagError::Config(format!("corrupt index_meta dimension: {}", value)))?;
                if stored != dimension {
                    return Err(VectorStoreError::DimensionMismatch {
                        expected: stored,
                        actual: dimension,
                    }
                    .into());
                }
            }
            None => {
                sqlx::query("INSERT INTO index_meta (key, value) VALUES ('dimension', ?1)")
                    .bind(dimension.to_string())
                    .execute(&pool)
                    .await?;
                sqlx::query("INSERT INTO index_meta (key, value) VALUES ('metric', ?1)")
                    .bind(metric.to_string())
                    .execute(&pool)
                    .await?;
            }
        }

        let mut store = Self {
            pool,
            dimension,
            metric,
            capacity: config.vector_capacity,
            rows: Vec::new(),
            read_only: false,
        };
        store.load().await?;
        Ok(store)
    }

    async fn load(&mut self) -> Result<()> {
        let rows = sqlx::query("SELECT position, chunk_id, embedding, metadata, deleted FROM vectors ORDER BY position")
            .fetch_all(&self.pool)
            .await?;

        self.rows.clear();
        for row in rows {
            let chunk_id: String = row.get("chunk_id");
            let blob: Vec<u8> = row.get("embedding");
            let metadata_json: String = row.get("metadata");
            let deleted: bool = row.get("deleted");
            self.rows.push(VectorRow {
                chunk_id,
                vector: deserialize_embedding(&blob),
                metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
                deleted,
            });
        }

        debug!("Loaded {} vector rows from disk", self.rows.len());
        Ok(())
    }

    /// Append a batch of vectors with their metadata projections.
    ///
    /// Atomic: either all vectors are appended and persisted, or none are.
    pub async fn add_vectors(
        &mut self,
        vectors: Vec<Vec<f32>>,
        metadata_list: Vec<Metadata>,
    ) -> Result<Vec<usize>> {
        if self.read_only {
            return Err(VectorStoreError::WriteDegraded.into());
        }
        if vectors.len() != metadata_list.len() {
            return Err(RagError::Validation(format!(
                "vector/metadata count mismatch: {} vs {}",
                vectors.len(),
                metadata_list.len()
            )));
        }
        for vector in &vectors {
            if vector.len() != self.dimension {
                return Err(VectorStoreError::DimensionMismatch {
                    expected: self.dimension,
                    actual: vector.len(),
                }
                .into());
            }
        }
        if self.rows.len() + vectors.len() > self.capacity {
            return Err(VectorStoreError::StoreFull {
                capacity: self.capacity,
            }
            .into());
        }

        let start = self.rows.len();
        let mut new_rows = Vec::with_capacity(vectors.len());
        for (vector, metadata) in vectors.into_iter().zip(metadata_list.into_iter()) {
            let chunk_id = metadata
                .get("chunk_id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    RagError::Validation("metadata projection missing chunk_id".to_string())
                })?
                .to_string();
            new_rows.push(VectorRow {
                chunk_id,
                vector,
                metadata,
                deleted: false,
            });
        }

        match self.persist_append(start, &new_rows).await {
            Ok(()) => {}
            Err(first) => {
                warn!("Vector persist failed, retrying once: {}", first);
                if let Err(second) = self.persist_append(start, &new_rows).await {
                    warn!(
                        "Vector persist failed twice, store is now read-only: {}",
                        second
                    );
                    self.read_only = true;
                    return Err(VectorStoreError::WriteDegraded.into());
                }
            }
        }

        self.rows.extend(new_rows);
        let ids: Vec<usize> = (start..self.rows.len()).collect();
        debug!("Added {} vectors (total {})", ids.len(), self.rows.len());
        Ok(ids)
    }

    async fn persist_append(
        &self,
        start: usize,
        rows: &[VectorRow],
    ) -> std::result::Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for (offset, row) in rows.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT OR REPLACE INTO vectors (position, chunk_id, embedding, metadata, deleted)
                VALUES (?1, ?2, ?3, ?4, 0)
                "#,
            )
            .bind((start + offset) as i64)
            .bind(&row.chunk_id)
            .bind(serialize_embedding(&row.vector))
            .bind(serde_json::to_string(&row.metadata).unwrap_or_else(|_| "{}".to_string()))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await
    }

    /// Search for the k nearest neighbours of a query vector.
    ///
    /// Ordering is stable: descending score, ties broken by ascending
    /// vector id.
    pub fn search_with_metadata(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        if query.len() != self.dimension {
            return Err(VectorStoreError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            }
            .into());
        }

        let mut hits: Vec<SearchHit> = self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| !row.deleted)
            .map(|(id, row)| SearchHit {
                chunk_id: row.chunk_id.clone(),
                vector_id: id,
                similarity_score: self.score(query, &row.vector),
                metadata: row.metadata.clone(),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.similarity_score
                .partial_cmp(&a.similarity_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.vector_id.cmp(&b.vector_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    fn score(&self, query: &[f32], candidate: &[f32]) -> f32 {
        match self.metric {
            DistanceMetric::Cosine => cosine_similarity(query, candidate),
            DistanceMetric::InnerProduct => {
                query.iter().zip(candidate.iter()).map(|(a, b)| a * b).sum()
            }
        }
    }

    /// Tombstone every vector whose metadata projection carries the doc id.
    /// Returns the number of tombstoned vectors.
    pub async fn delete_by_doc_id(&mut self, doc_id: &str) -> Result<usize> {
        if self.read_only {
            return Err(VectorStoreError::WriteDegraded.into());
        }

        let positions: Vec<usize> = self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| {
                !row.deleted
                    && row
                        .metadata
                        .get("doc_id")
                        .and_then(|v| v.as_str())
                        .map(|d| d == doc_id)
                        .unwrap_or(false)
            })
            .map(|(id, _)| id)
            .collect();

        if positions.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for position in &positions {
            sqlx::query("UPDATE vectors SET deleted = 1 WHERE position = ?1")
                .bind(*position as i64)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        for position in &positions {
            self.rows[*position].deleted = true;
        }

        info!("Tombstoned {} vectors for doc {}", positions.len(), doc_id);
        Ok(positions.len())
    }

    /// Drop tombstoned rows and rewrite the index. Run on a background cycle.
    pub async fn compact(&mut self) -> Result<usize> {
        if self.read_only {
            return Err(VectorStoreError::WriteDegraded.into());
        }

        let before = self.rows.len();
        let live: Vec<VectorRow> = std::mem::take(&mut self.rows)
            .into_iter()
            .filter(|row| !row.deleted)
            .collect();
        let removed = before - live.len();

        if removed == 0 {
            self.rows = live;
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM vectors").execute(&mut *tx).await?;
        for (position, row) in live.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO vectors (position, chunk_id, embedding, metadata, deleted)
                VALUES (?1, ?2, ?3, ?4, 0)
                "#,
            )
            .bind(position as i64)
            .bind(&row.chunk_id)
            .bind(serialize_embedding(&row.vector))
            .bind(serde_json::to_string(&row.metadata).unwrap_or_else(|_| "{}".to_string()))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.rows = live;
        info!("Compacted vector store, removed {} tombstones", removed);
        Ok(removed)
    }

    /// Count distinct documents whose metadata projection matches all
    /// filters. String filter values match as case-insensitive substrings;
    /// other values require equality.
    pub fn count_documents(&self, filters: &Metadata) -> usize {
        let mut doc_ids = std::collections::HashSet::new();
        for row in self.rows.iter().filter(|r| !r.deleted) {
            if metadata_matches(&row.metadata, filters) {
                if let Some(doc_id) = row.metadata.get("doc_id").and_then(|v| v.as_str()) {
                    doc_ids.insert(doc_id.to_string());
                }
            }
        }
        doc_ids.len()
    }

    pub fn get_index_info(&self) -> IndexInfo {
        IndexInfo {
            ntotal: self.rows.iter().filter(|r| !r.deleted).count(),
            dimension: self.dimension,
            metric: self.metric,
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

fn metadata_matches(metadata: &Metadata, filters: &Metadata) -> bool {
    filters.iter().all(|(key, expected)| {
        // "text_contains" matches against the projected chunk text
        let target_key = if key == "text_contains" { "text" } else { key };
        match metadata.get(target_key) {
            Some(actual) => match (actual.as_str(), expected.as_str()) {
                (Some(actual_str), Some(expected_str)) => actual_str
                    .to_lowercase()
                    .contains(&expected_str.to_lowercase()),
                _ => actual == expected,
            },
            None => false,
        }
    })
}

/// Cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

/// Serialize embedding for storage
pub fn serialize_embedding(embedding: &[f32]) -> Vec<u8> {
    embedding
        .iter()
        .flat_map(|f| f.to_le_bytes().to_vec())
        .collect()
}

/// Deserialize embedding from storage
pub fn deserialize_embedding(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_storage() -> StorageConfig {
        StorageConfig {
            vector_db_url: "sqlite::memory:".to_string(),
            metadata_db_url: "sqlite::memory:".to_string(),
            vector_capacity: 100,
        }
    }

    fn meta(chunk_id: &str, doc_id: &str) -> Metadata {
        let mut m = Metadata::new();
        m.insert("chunk_id".to_string(), json!(chunk_id));
        m.insert("doc_id".to_string(), json!(doc_id));
        m
    }

    async fn test_store(dimension: usize) -> VectorStore {
        VectorStore::open(&test_storage(), dimension, DistanceMetric::Cosine)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_add_and_search() {
        let mut store = test_store(4).await;

        let ids = store
            .add_vectors(
                vec![vec![1.0, 0.0, 0.0, 0.0], vec![0.0, 1.0, 0.0, 0.0]],
                vec![meta("c1", "d1"), meta("c2", "d1")],
            )
            .await
            .unwrap();
        assert_eq!(ids, vec![0, 1]);

        let hits = store
            .search_with_metadata(&[1.0, 0.0, 0.0, 0.0], 2)
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, "c1");
        assert!(hits[0].similarity_score > 0.99);
    }

    #[tokio::test]
    async fn test_dimension_mismatch_is_atomic() {
        let mut store = test_store(4).await;

        let result = store
            .add_vectors(
                vec![vec![1.0, 0.0, 0.0, 0.0], vec![1.0, 0.0]],
                vec![meta("c1", "d1"), meta("c2", "d1")],
            )
            .await;
        assert!(matches!(
            result,
            Err(RagError::VectorStore(
                VectorStoreError::DimensionMismatch { .. }
            ))
        ));
        // Nothing was appended
        assert_eq!(store.get_index_info().ntotal, 0);
    }

    #[tokio::test]
    async fn test_store_full() {
        let config = StorageConfig {
            vector_capacity: 1,
            ..test_storage()
        };
        let mut store = VectorStore::open(&config, 2, DistanceMetric::Cosine)
            .await
            .unwrap();

        store
            .add_vectors(vec![vec![1.0, 0.0]], vec![meta("c1", "d1")])
            .await
            .unwrap();
        let result = store
            .add_vectors(vec![vec![0.0, 1.0]], vec![meta("c2", "d1")])
            .await;
        assert!(matches!(
            result,
            Err(RagError::VectorStore(VectorStoreError::StoreFull { .. }))
        ));
    }

    #[tokio::test]
    async fn test_delete_by_doc_id_and_compact() {
        let mut store = test_store(2).await;

        store
            .add_vectors(
                vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.5, 0.5]],
                vec![meta("c1", "d1"), meta("c2", "d1"), meta("c3", "d2")],
            )
            .await
            .unwrap();

        let deleted = store.delete_by_doc_id("d1").await.unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(store.get_index_info().ntotal, 1);

        // Tombstoned vectors never surface in search
        let hits = store.search_with_metadata(&[1.0, 0.0], 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk_id, "c3");

        let removed = store.compact().await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.get_index_info().ntotal, 1);
    }

    #[tokio::test]
    async fn test_search_ordering_ties_by_vector_id() {
        let mut store = test_store(2).await;

        // Two identical vectors tie on score; ascending id wins
        store
            .add_vectors(
                vec![vec![1.0, 0.0], vec![1.0, 0.0]],
                vec![meta("c1", "d1"), meta("c2", "d2")],
            )
            .await
            .unwrap();

        let hits = store.search_with_metadata(&[1.0, 0.0], 2).unwrap();
        assert_eq!(hits[0].vector_id, 0);
        assert_eq!(hits[1].vector_id, 1);
    }

    #[tokio::test]
    async fn test_count_documents_with_filters() {
        let mut store = test_store(2).await;

        let mut m1 = meta("c1", "d1");
        m1.insert("created_date".to_string(), json!("2025-12-03"));
        m1.insert("source_type".to_string(), json!("ticket"));
        let mut m2 = meta("c2", "d2");
        m2.insert("created_date".to_string(), json!("2025-11-20"));
        m2.insert("source_type".to_string(), json!("ticket"));
        // Second chunk of d1 must not double-count the document
        let mut m3 = meta("c3", "d1");
        m3.insert("created_date".to_string(), json!("2025-12-03"));
        m3.insert("source_type".to_string(), json!("ticket"));

        store
            .add_vectors(
                vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.5, 0.5]],
                vec![m1, m2, m3],
            )
            .await
            .unwrap();

        let mut filters = Metadata::new();
        filters.insert("created_date".to_string(), json!("-12-"));
        assert_eq!(store.count_documents(&filters), 1);

        filters.clear();
        filters.insert("source_type".to_string(), json!("ticket"));
        assert_eq!(store.count_documents(&filters), 2);
    }

    #[tokio::test]
    async fn test_search_over_random_corpus() {
        use rand::Rng;

        let mut store = test_store(8).await;
        let mut rng = rand::rng();

        let mut vectors = Vec::new();
        let mut metadata_list = Vec::new();
        for i in 0..50 {
            let vector: Vec<f32> = (0..8).map(|_| rng.random_range(-1.0f32..1.0f32)).collect();
            vectors.push(vector);
            metadata_list.push(meta(&format!("c{}", i), &format!("d{}", i % 5)));
        }
        store.add_vectors(vectors.clone(), metadata_list).await.unwrap();

        let hits = store.search_with_metadata(&vectors[7], 10).unwrap();
        assert_eq!(hits.len(), 10);
        // The query vector's own row is its best match
        assert_eq!(hits[0].vector_id, 7);
        for pair in hits.windows(2) {
            assert!(pair[0].similarity_score >= pair[1].similarity_score);
        }
    }

    #[test]
    fn test_embedding_serialization() {
        let embedding = vec![1.5, -2.3, 0.0, 42.1];
        let serialized = serialize_embedding(&embedding);
        let deserialized = deserialize_embedding(&serialized);

        assert_eq!(embedding.len(), deserialized.len());
        for (orig, deser) in embedding.iter().zip(deserialized.iter()) {
            assert!((orig - deser).abs() < f32::EPSILON);
        }
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        let c = vec![0.0, 1.0, 0.0];

        assert_eq!(cosine_similarity(&a, &b), 1.0);
        assert_eq!(cosine_similarity(&a, &c), 0.0);
    }
}
