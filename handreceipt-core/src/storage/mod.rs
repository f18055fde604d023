//! Key-value storage port used for local records, the outbox, and keys.

#[cfg(any(windows, target_os = "macos"))]
mod keychain;
mod sqlite;

#[cfg(any(windows, target_os = "macos"))]
pub use keychain::{KeychainStore, KEYCHAIN_SERVICE};
pub use sqlite::SqliteStore;

use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use zeroize::Zeroizing;

/// Durable string key-value storage.
///
/// Values are JSON documents; the store does not interpret them.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Every key currently present.
    async fn keys(&self) -> Result<Vec<String>>;

    async fn remove_many(&self, keys: &[String]) -> Result<()> {
        for key in keys {
            self.remove(key).await?;
        }
        Ok(())
    }
}

/// Volatile store for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.entries.read().await.keys().cloned().collect())
    }

    async fn remove_many(&self, keys: &[String]) -> Result<()> {
        let mut entries = self.entries.write().await;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }
}

/// Store for key material in the OS credential store, where the platform
/// has one.
pub fn platform_secret_store() -> Option<Arc<dyn KeyValueStore>> {
    #[cfg(any(windows, target_os = "macos"))]
    return Some(Arc::new(KeychainStore::new(KEYCHAIN_SERVICE)));

    #[cfg(not(any(windows, target_os = "macos")))]
    return None;
}

/// Move `key` from `from` into `to` unless `to` already holds it.
///
/// Returns whether a value was moved.
pub async fn move_entry(from: &dyn KeyValueStore, to: &dyn KeyValueStore, key: &str) -> Result<bool> {
    if to.get(key).await?.is_some() {
        return Ok(false);
    }
    let Some(value) = from.get(key).await?.map(Zeroizing::new) else {
        return Ok(false);
    };
    to.set(key, &value).await?;
    from.remove(key).await?;
    debug!(key, "Moved store entry");
    Ok(true)
}
