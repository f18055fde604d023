//! Persistent outbox of sync operations deferred by connectivity failures.
//!
//! Each event moves through:
//!
//! ```text
//! Pending ──process──▶ Completed (removed)
//!                   ├─▶ Retrying  (retry_count + 1, kept)
//!                   └─▶ Dropped   (attempt bound reached, or non-retryable error)
//! ```

use crate::storage::KeyValueStore;
use crate::sync::client::SyncApi;
use crate::sync::models::{DrainReport, NewSyncEvent, SyncEvent};
use crate::Result;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Storage key holding the serialized outbox.
pub const SYNC_QUEUE_KEY: &str = "sync_queue";

/// Replay attempts an event gets before it is dropped.
pub const MAX_SYNC_ATTEMPTS: u32 = 3;

/// Durable list of deferred sync events.
pub struct SyncQueue {
    store: Arc<dyn KeyValueStore>,
    api: Arc<dyn SyncApi>,
    /// Serializes read-modify-write of the persisted list.
    list_lock: Mutex<()>,
}

impl SyncQueue {
    pub fn new(store: Arc<dyn KeyValueStore>, api: Arc<dyn SyncApi>) -> Self {
        Self {
            store,
            api,
            list_lock: Mutex::new(()),
        }
    }

    /// Append an event with a fresh id, the current time, and no retries.
    pub async fn push(&self, event: NewSyncEvent) -> Result<SyncEvent> {
        let queued = SyncEvent {
            id: Uuid::new_v4(),
            event_type: event.event_type,
            payload: event.payload,
            timestamp: Utc::now(),
            retry_count: 0,
        };

        let _guard = self.list_lock.lock().await;
        let mut events = self.load().await?;
        events.push(queued.clone());
        self.save(&events).await?;

        debug!(
            event_id = %queued.id,
            event_type = %queued.event_type,
            queued = events.len(),
            "Queued sync event"
        );
        Ok(queued)
    }

    /// Port queued events are replayed through by [`process`](Self::process).
    pub fn api(&self) -> &Arc<dyn SyncApi> {
        &self.api
    }

    /// Replay every queued event once through the injected port.
    pub async fn process(&self) -> Result<DrainReport> {
        self.process_with(self.api.as_ref()).await
    }

    /// Replay every queued event once through `api`.
    ///
    /// Survivors replace the persisted list when the pass ends. Events pushed
    /// while the pass was in flight are kept after the survivors.
    pub async fn process_with(&self, api: &dyn SyncApi) -> Result<DrainReport> {
        let snapshot = {
            let _guard = self.list_lock.lock().await;
            self.load().await?
        };

        let mut report = DrainReport::default();
        if snapshot.is_empty() {
            return Ok(report);
        }

        let mut survivors = Vec::new();
        for mut event in snapshot.iter().cloned() {
            match api.replay(&event).await {
                Ok(()) => {
                    debug!(event_id = %event.id, "Replayed sync event");
                    report.completed += 1;
                }
                Err(e) if e.is_connectivity() => {
                    let attempts = event.retry_count + 1;
                    if attempts >= MAX_SYNC_ATTEMPTS {
                        warn!(
                            event_id = %event.id,
                            event_type = %event.event_type,
                            attempts,
                            "Dropping sync event after repeated network failures: {}", e
                        );
                        report.dropped += 1;
                    } else {
                        event.retry_count = attempts;
                        survivors.push(event);
                        report.retrying += 1;
                    }
                }
                Err(e) => {
                    error!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        "Dropping sync event rejected by remote: {}", e
                    );
                    report.dropped += 1;
                }
            }
        }

        let _guard = self.list_lock.lock().await;
        let processed: HashSet<Uuid> = snapshot.iter().map(|e| e.id).collect();
        let arrived = self
            .load()
            .await?
            .into_iter()
            .filter(|e| !processed.contains(&e.id));
        survivors.extend(arrived);
        self.save(&survivors).await?;

        info!(
            completed = report.completed,
            retrying = report.retrying,
            dropped = report.dropped,
            "Sync queue pass finished"
        );
        Ok(report)
    }

    /// Remove every queued event.
    pub async fn clear(&self) -> Result<()> {
        let _guard = self.list_lock.lock().await;
        self.store.remove(SYNC_QUEUE_KEY).await
    }

    /// Currently queued events, oldest first.
    pub async fn get_events(&self) -> Result<Vec<SyncEvent>> {
        self.load().await
    }

    async fn load(&self) -> Result<Vec<SyncEvent>> {
        match self.store.get(SYNC_QUEUE_KEY).await? {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Vec::new()),
        }
    }

    async fn save(&self, events: &[SyncEvent]) -> Result<()> {
        let json = serde_json::to_string(events)?;
        self.store.set(SYNC_QUEUE_KEY, &json).await
    }
}
