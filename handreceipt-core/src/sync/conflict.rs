//! Conflict resolution between local and remote copies of an entity.

use crate::sync::models::{next_timestamp, Versioned};
use crate::Result;
use std::cmp::Ordering;
use tracing::warn;

/// Conflict resolution outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Accept the remote entry (remote is newer).
    AcceptRemote,
    /// Keep the local entry.
    KeepLocal,
}

/// Picks or builds the winner between two copies of the same entity.
pub trait ConflictResolver<T: Versioned>: Send + Sync {
    fn resolve(&self, local: &T, remote: &T) -> T;
}

/// Version-then-timestamp resolution.
///
/// Rules:
/// 1. Higher `version` wins.
/// 2. If versions are equal, later `updated_at` wins.
/// 3. If both are equal, the copy with the greater canonical JSON wins, so
///    the outcome never depends on which side is called local.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimestampResolver;

impl TimestampResolver {
    pub fn decide<T: Versioned>(local: &T, remote: &T) -> Resolution {
        let ordering = local
            .version()
            .cmp(&remote.version())
            .then_with(|| local.updated_at().cmp(&remote.updated_at()))
            .then_with(|| {
                let local_json = serde_json::to_vec(local).ok();
                let remote_json = serde_json::to_vec(remote).ok();
                local_json.cmp(&remote_json)
            });

        match ordering {
            Ordering::Less => Resolution::AcceptRemote,
            Ordering::Equal | Ordering::Greater => Resolution::KeepLocal,
        }
    }
}

impl<T: Versioned> ConflictResolver<T> for TimestampResolver {
    fn resolve(&self, local: &T, remote: &T) -> T {
        match Self::decide(local, remote) {
            Resolution::KeepLocal => local.clone(),
            Resolution::AcceptRemote => remote.clone(),
        }
    }
}

type MergeFn<T> = dyn Fn(&T, &T) -> Result<T> + Send + Sync;

/// Resolution through a domain-specific merge function.
///
/// A successful merge is always stamped with `max(version) + 1` and a fresh
/// timestamp, even if no visible field changed. A failing merge falls back
/// to [`TimestampResolver`].
pub struct MergeResolver<T> {
    merge: Box<MergeFn<T>>,
}

impl<T: Versioned> MergeResolver<T> {
    pub fn new<F>(merge: F) -> Self
    where
        F: Fn(&T, &T) -> Result<T> + Send + Sync + 'static,
    {
        Self {
            merge: Box::new(merge),
        }
    }
}

impl<T: Versioned> ConflictResolver<T> for MergeResolver<T> {
    fn resolve(&self, local: &T, remote: &T) -> T {
        match (self.merge)(local, remote) {
            Ok(mut merged) => {
                let version = local.version().max(remote.version()) + 1;
                let latest = local.updated_at().max(remote.updated_at());
                merged.stamp(version, next_timestamp(latest));
                merged
            }
            Err(e) => {
                warn!(
                    id = local.id(),
                    "Merge failed, falling back to timestamp resolution: {}", e
                );
                TimestampResolver.resolve(local, remote)
            }
        }
    }
}
