//! Sync data models: the versioned-entity contract and outbox entries.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration as StdDuration;
use uuid::Uuid;

/// A record ordered by a monotonic version counter and a last-modified time.
///
/// `version` starts at 1 and strictly increases on every local mutation or
/// successful merge.
pub trait Versioned:
    Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn id(&self) -> &str;

    fn version(&self) -> u64;

    fn updated_at(&self) -> DateTime<Utc>;

    /// Overwrite the version counter and modification time.
    fn stamp(&mut self, version: u64, updated_at: DateTime<Utc>);
}

/// Current time, but never earlier than one microsecond after `after`.
///
/// Keeps `updated_at` strictly increasing across a mutation even when the
/// wall clock is coarse or has stepped backwards.
pub fn next_timestamp(after: DateTime<Utc>) -> DateTime<Utc> {
    Utc::now().max(after + Duration::microseconds(1))
}

/// A deferred sync operation held in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: Uuid,
    /// Entity-type name the payload belongs to (e.g. `property`).
    pub event_type: String,
    /// Serialized entity to replay against the remote store.
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    /// Number of failed replay attempts so far.
    pub retry_count: u32,
}

/// Caller-supplied part of a [`SyncEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSyncEvent {
    pub event_type: String,
    pub payload: serde_json::Value,
}

/// Options for foreground sync and the background drain loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// Defer to the outbox on connectivity failure instead of returning the error.
    pub retry_on_failure: bool,
    /// When set, `start_sync` keeps draining the outbox at this period.
    pub interval: Option<StdDuration>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            retry_on_failure: true,
            interval: None,
        }
    }
}

impl SyncOptions {
    /// Surface connectivity errors to the caller instead of queueing.
    pub fn without_retry() -> Self {
        Self {
            retry_on_failure: false,
            interval: None,
        }
    }

    pub fn with_interval(mut self, interval: StdDuration) -> Self {
        self.interval = Some(interval);
        self
    }
}

/// What `sync_entity` did with a write.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome<T> {
    /// Reconciled with the remote copy.
    Synced(T),
    /// Stored locally and queued in the outbox.
    Deferred(T),
}

impl<T> SyncOutcome<T> {
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            Self::Synced(entity) | Self::Deferred(entity) => entity,
        }
    }
}

/// Outcome of one pass over the outbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    /// Replayed successfully and removed.
    pub completed: usize,
    /// Kept for another attempt.
    pub retrying: usize,
    /// Removed without success (retry bound reached or non-retryable).
    pub dropped: usize,
}
