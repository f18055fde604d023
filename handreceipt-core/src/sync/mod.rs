//! Offline-first sync for versioned entities
//!
//! - Version-then-timestamp and merge-based conflict resolution
//! - Local-first writes with a durable, bounded-retry outbox
//! - Background outbox drain on a caller-chosen period

pub mod client;
pub mod conflict;
pub mod engine;
pub mod models;
pub mod queue;

pub use client::{ApiClient, KeyRegistry, PublicKeyDirectory, RemoteEntityApi, SyncApi};
pub use conflict::{ConflictResolver, MergeResolver, Resolution, TimestampResolver};
pub use engine::{RecordSealer, SyncService};
pub use models::{DrainReport, NewSyncEvent, SyncEvent, SyncOptions, SyncOutcome, Versioned};
pub use queue::SyncQueue;
