//! SQLite-backed key-value store.

use crate::storage::KeyValueStore;
use crate::{HandReceiptError, Result};
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Thread-safe SQLite store with a single `kv_store` table.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::with_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| HandReceiptError::Storage(format!("Lock error: {}", e)))
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        let value = conn
            .query_row("SELECT value FROM kv_store WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            rusqlite::params![key, value, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute("DELETE FROM kv_store WHERE key = ?1", [key])?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT key FROM kv_store ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    async fn remove_many(&self, keys: &[String]) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare("DELETE FROM kv_store WHERE key = ?1")?;
            for key in keys {
                stmt.execute([key])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn values_persist_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("handreceipt.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.set("property:abc", r#"{"id":"abc"}"#).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(
            store.get("property:abc").await.unwrap().as_deref(),
            Some(r#"{"id":"abc"}"#)
        );
    }

    #[tokio::test]
    async fn upsert_replaces_value() {
        let store = SqliteStore::in_memory().unwrap();
        store.set("sync_queue", "[]").await.unwrap();
        store.set("sync_queue", "[1]").await.unwrap();
        assert_eq!(store.get("sync_queue").await.unwrap().as_deref(), Some("[1]"));
        assert_eq!(store.keys().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_many_in_one_transaction() {
        let store = SqliteStore::in_memory().unwrap();
        for key in ["property:1", "property:2", "hybrid_key"] {
            store.set(key, "{}").await.unwrap();
        }

        store
            .remove_many(&["property:1".to_string(), "property:2".to_string()])
            .await
            .unwrap();

        assert_eq!(store.keys().await.unwrap(), vec!["hybrid_key".to_string()]);
        assert_eq!(store.get("property:1").await.unwrap(), None);
    }
}
