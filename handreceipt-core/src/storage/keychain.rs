//! Key-value store over the OS credential store.

use crate::storage::KeyValueStore;
use crate::{HandReceiptError, Result};
use async_trait::async_trait;

/// Service name secrets are filed under.
pub const KEYCHAIN_SERVICE: &str = "handreceipt.secrets";

/// Keeps each value as one entry in the OS credential store.
///
/// The credential store cannot list its entries, so `keys` fails.
pub struct KeychainStore {
    service: String,
}

impl KeychainStore {
    pub fn new(service: &str) -> Self {
        Self {
            service: service.to_string(),
        }
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, key)
            .map_err(|e| HandReceiptError::Storage(format!("Failed to open keyring entry: {}", e)))
    }
}

#[async_trait]
impl KeyValueStore for KeychainStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(HandReceiptError::Storage(format!(
                "Failed to read keyring entry: {}",
                e
            ))),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| HandReceiptError::Storage(format!("Failed to write keyring entry: {}", e)))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(HandReceiptError::Storage(format!(
                "Failed to delete keyring entry: {}",
                e
            ))),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Err(HandReceiptError::Storage(
            "The OS credential store cannot list entries".to_string(),
        ))
    }
}
