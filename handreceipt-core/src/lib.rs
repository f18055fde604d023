//! HandReceipt Core Library
//!
//! Offline-first synchronization for custody records on field devices:
//! versioned entities, pluggable conflict resolution, a durable outbox,
//! hybrid record signing, and the property service that composes them.

pub mod audit;
pub mod config;
pub mod crypto;
pub mod ledger;
pub mod metadata;
pub mod property;
pub mod storage;
pub mod sync;

#[cfg(test)]
pub(crate) mod test_support;

pub use audit::{AuditEventType, AuditLogger};
pub use config::HandReceiptConfig;
pub use crypto::key_manager::{HybridPublicKey, KeyManager, ProvisionedKey};
pub use crypto::{CryptoError, PublicKey, SignatureAlgorithm};
pub use ledger::{BatchStatus, LedgerClient};
pub use metadata::{Metadata, MetadataValue, SIGNATURE_KEY};
pub use property::service::PropertyService;
pub use property::{CreatePropertyInput, PropertyRecord, PropertyStatus, PropertyUpdate};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore};
pub use sync::client::ApiClient;
pub use sync::conflict::{ConflictResolver, MergeResolver, TimestampResolver};
pub use sync::engine::SyncService;
pub use sync::models::{SyncEvent, SyncOptions, SyncOutcome, Versioned};
pub use sync::queue::SyncQueue;

use thiserror::Error;

/// Result type for HandReceipt operations
pub type Result<T> = std::result::Result<T, HandReceiptError>;

/// General error type for HandReceipt operations
#[derive(Error, Debug)]
pub enum HandReceiptError {
    /// Transport-level failure: unreachable host, refused connection, timeout.
    #[error("Network unavailable: {0}")]
    Network(String),

    #[error("Remote error {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Merge failed: {0}")]
    Merge(String),

    /// The remote copy moved past the write being applied.
    #[error("Version conflict: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HandReceiptError {
    /// Whether this error is attributable to the network rather than the data.
    ///
    /// Connectivity errors are the only ones that defer a write to the outbox
    /// or earn a queued event another replay attempt.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Map a non-success HTTP status to an error.
    ///
    /// Gateway failures (502, 503, 504) say nothing about the request and are
    /// treated as connectivity errors.
    pub fn from_status(status: u16, message: String) -> Self {
        match status {
            502..=504 => Self::Network(format!("HTTP {}: {}", status, message)),
            _ => Self::Remote { status, message },
        }
    }
}

impl From<rusqlite::Error> for HandReceiptError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<reqwest::Error> for HandReceiptError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() || e.is_request() {
            Self::Network(e.to_string())
        } else if e.is_decode() || e.is_body() {
            Self::InvalidInput(format!("Malformed response: {}", e))
        } else {
            Self::from_status(
                e.status().map(|s| s.as_u16()).unwrap_or_default(),
                e.to_string(),
            )
        }
    }
}
