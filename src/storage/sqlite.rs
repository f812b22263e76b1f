//! SQLite-backed blob store: one table, keys as primary key.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use super::{validate_key, BlobStore, BlobStoreError};

pub struct SqliteBlobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBlobStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, BlobStoreError> {
        let conn = Connection::open(path.as_ref())?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        info!("Opened SQLite blob store at {}", path.as_ref().display());
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self, BlobStoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.initialize_schema()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<(), BlobStoreError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;

            CREATE TABLE IF NOT EXISTS blobs (
                key TEXT PRIMARY KEY,
                body BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, BlobStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, BlobStoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await?
    }
}

#[async_trait]
impl BlobStore for SqliteBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), BlobStoreError> {
        validate_key(key)?;
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO blobs (key, body, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET body = excluded.body, updated_at = excluded.updated_at",
                params![key, bytes, Utc::now().timestamp_millis()],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BlobStoreError> {
        validate_key(key)?;
        let key = key.to_string();
        self.with_conn(move |conn| {
            let body = conn
                .query_row("SELECT body FROM blobs WHERE key = ?1", params![key], |row| {
                    row.get::<_, Vec<u8>>(0)
                })
                .optional()?;
            Ok(body)
        })
        .await
    }

    async fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>, BlobStoreError> {
        let prefix = prefix.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key FROM blobs WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
            )?;
            let keys = stmt
                .query_map(params![prefix], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(keys)
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), BlobStoreError> {
        validate_key(key)?;
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM blobs WHERE key = ?1", params![key])?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip_and_prefix() {
        let store = SqliteBlobStore::in_memory().unwrap();

        store.put("symbol_results/r1/A.json", b"a".to_vec()).await.unwrap();
        store.put("symbol_results/r1/B.json", b"b".to_vec()).await.unwrap();
        store.put("symbol_results/r10/C.json", b"c".to_vec()).await.unwrap();
        store.put("symbol_results/r1/A.json", b"a2".to_vec()).await.unwrap();

        assert_eq!(
            store.get("symbol_results/r1/A.json").await.unwrap(),
            Some(b"a2".to_vec())
        );
        assert_eq!(
            store.list_by_prefix("symbol_results/r1/").await.unwrap(),
            vec!["symbol_results/r1/A.json", "symbol_results/r1/B.json"]
        );

        store.delete("symbol_results/r1/A.json").await.unwrap();
        assert!(store.get("symbol_results/r1/A.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blobs.db");
        {
            let store = SqliteBlobStore::new(&path).unwrap();
            store.put("results/r1.json", b"{}".to_vec()).await.unwrap();
        }
        let reopened = SqliteBlobStore::new(&path).unwrap();
        assert_eq!(reopened.get("results/r1.json").await.unwrap(), Some(b"{}".to_vec()));
    }
}
