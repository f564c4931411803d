//! Collection/key/record metadata store over SQLite
//!
//! Collections are logical namespaces inside a single table. Writes are
//! durable on every call (WAL journal); a crash loses at most the write in
//! flight.

use crate::config::StorageConfig;
use crate::error::{MetadataError, RagError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::{debug, info};

/// Known collections
pub const COLLECTION_DOCUMENTS: &str = "documents";
pub const COLLECTION_CHUNKS: &str = "chunks";
pub const COLLECTION_TICKETS_CACHE: &str = "tickets_cache";
pub const COLLECTION_FETCH_HISTORY: &str = "fetch_history";

const KNOWN_COLLECTIONS: &[&str] = &[
    COLLECTION_DOCUMENTS,
    COLLECTION_CHUNKS,
    COLLECTION_TICKETS_CACHE,
    COLLECTION_FETCH_HISTORY,
];

/// SQLite-backed collection store for document and chunk registries
pub struct MetadataStore {
    pool: SqlitePool,
}

impl MetadataStore {
    /// Open (or create) the store at the configured database URL
    pub async fn open(config: &StorageConfig) -> Result<Self> {
        info!("Opening metadata store at {}", config.metadata_db_url);

        let url = config
            .metadata_db_url
            .strip_prefix("sqlite:")
            .unwrap_or(&config.metadata_db_url);
        if let Some(parent) = std::path::Path::new(url).parent() {
            if !parent.as_os_str().is_empty() && url != ":memory:" {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&config.metadata_db_url)
            .map_err(|e| RagError::Config(e.to_string()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let max_connections = if config.metadata_db_url.contains(":memory:") {
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
            CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                record TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_updated ON records(updated_at)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    fn check_collection(collection: &str) -> Result<()> {
        if KNOWN_COLLECTIONS.contains(&collection) {
            Ok(())
        } else {
            Err(MetadataError::UnknownCollection(collection.to_string()).into())
        }
    }

    /// Insert or replace a record
    pub async fn put(
        &self,
        collection: &str,
        id: &str,
        record: &serde_json::Value,
    ) -> Result<()> {
        Self::check_collection(collection)?;

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO records (collection, id, record, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(record.to_string())
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        debug!("Stored {}/{}", collection, id);
        Ok(())
    }

    /// Fetch a record by id
    pub async fn get(&self, collection: &str, id: &str) -> Result<Option<serde_json::Value>> {
        Self::check_collection(collection)?;

        let row = sqlx::query("SELECT record FROM records WHERE collection = ?1 AND id = ?2")
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let record: String = row.get("record");
                Ok(Some(serde_json::from_str(&record)?))
            }
            None => Ok(None),
        }
    }

    /// List all records in a collection that pass the filter
    pub async fn list<F>(&self, collection: &str, filter: F) -> Result<Vec<serde_json::Value>>
    where
        F: Fn(&serde_json::Value) -> bool,
    {
        Self::check_collection(collection)?;

        let rows = sqlx::query(
            "SELECT record FROM records WHERE collection = ?1 ORDER BY updated_at DESC",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        let mut records = Vec::new();
        for row in rows {
            let raw: String = row.get("record");
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) {
                if filter(&value) {
                    records.push(value);
                }
            }
        }
        Ok(records)
    }

    /// Delete a record; returns whether it existed
    pub async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        Self::check_collection(collection)?;

        let result = sqlx::query("DELETE FROM records WHERE collection = ?1 AND id = ?2")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Delete all records in a collection that pass the filter; returns count
    pub async fn delete_where<F>(&self, collection: &str, filter: F) -> Result<usize>
    where
        F: Fn(&serde_json::Value) -> bool,
    {
        let matching = self.list(collection, filter).await?;
        let mut deleted = 0;
        for record in &matching {
            if let Some(id) = record_id(record) {
                if self.delete(collection, &id).await? {
                    deleted += 1;
                }
            }
        }
        Ok(deleted)
    }

    /// Number of records in a collection
    pub async fn count(&self, collection: &str) -> Result<usize> {
        Self::check_collection(collection)?;

        let row = sqlx::query("SELECT COUNT(*) as count FROM records WHERE collection = ?1")
            .bind(collection)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.get("count");
        Ok(count as usize)
    }
}

/// Extract the natural id field of a stored record
fn record_id(record: &serde_json::Value) -> Option<String> {
    for key in ["chunk_id", "doc_id", "sys_id", "id"] {
        if let Some(id) = record.get(key).and_then(|v| v.as_str()) {
            return Some(id.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_store() -> MetadataStore {
        let config = StorageConfig {
            vector_db_url: "sqlite::memory:".to_string(),
            metadata_db_url: "sqlite::memory:".to_string(),
            vector_capacity: 100,
        };
        MetadataStore::open(&config).await.unwrap()
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = test_store().await;

        let record = json!({"doc_id": "d1", "source": "/tmp/a.txt"});
        store
            .put(COLLECTION_DOCUMENTS, "d1", &record)
            .await
            .unwrap();

        let fetched = store.get(COLLECTION_DOCUMENTS, "d1").await.unwrap();
        assert_eq!(fetched.unwrap()["source"], "/tmp/a.txt");

        assert!(store.delete(COLLECTION_DOCUMENTS, "d1").await.unwrap());
        assert!(store.get(COLLECTION_DOCUMENTS, "d1").await.unwrap().is_none());
        assert!(!store.delete(COLLECTION_DOCUMENTS, "d1").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_with_filter() {
        let store = test_store().await;

        for i in 0..4 {
            let record = json!({"chunk_id": format!("c{}", i), "doc_id": if i < 2 { "d1" } else { "d2" }});
            store
                .put(COLLECTION_CHUNKS, &format!("c{}", i), &record)
                .await
                .unwrap();
        }

        let d1_chunks = store
            .list(COLLECTION_CHUNKS, |r| r["doc_id"] == "d1")
            .await
            .unwrap();
        assert_eq!(d1_chunks.len(), 2);

        let all = store.list(COLLECTION_CHUNKS, |_| true).await.unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(store.count(COLLECTION_CHUNKS).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_delete_where_cascade() {
        let store = test_store().await;

        for i in 0..3 {
            let record = json!({"chunk_id": format!("c{}", i), "doc_id": "d1"});
            store
                .put(COLLECTION_CHUNKS, &format!("c{}", i), &record)
                .await
                .unwrap();
        }

        let deleted = store
            .delete_where(COLLECTION_CHUNKS, |r| r["doc_id"] == "d1")
            .await
            .unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(store.count(COLLECTION_CHUNKS).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_collection_rejected() {
        let store = test_store().await;
        let result = store.put("nope", "x", &json!({})).await;
        assert!(matches!(
            result,
            Err(RagError::Metadata(MetadataError::UnknownCollection(_)))
        ));
    }
}
