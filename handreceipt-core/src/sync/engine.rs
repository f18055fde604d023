//! Sync service: orchestrates fetch → resolve → persist → push for one entity type.

use crate::storage::KeyValueStore;
use crate::sync::client::{RemoteEntityApi, SyncApi};
use crate::sync::conflict::ConflictResolver;
use crate::sync::models::{DrainReport, NewSyncEvent, SyncEvent, SyncOptions, SyncOutcome, Versioned};
use crate::sync::queue::SyncQueue;
use crate::{HandReceiptError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Prefix of the per-record keys holding the last remote state seen.
pub const SYNC_BASE_PREFIX: &str = "sync_base:";

/// Hook applied to a resolved entity before it is stored and pushed.
///
/// Used to restore invariants a resolver cannot know about, such as a
/// signature covering the merged state.
#[async_trait]
pub trait RecordSealer<T: Versioned>: Send + Sync {
    async fn seal(&self, record: T) -> Result<T>;
}

/// Remote state of one record as last confirmed by this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct SyncBase {
    version: u64,
    updated_at: DateTime<Utc>,
}

impl SyncBase {
    fn of<T: Versioned>(entity: &T) -> Self {
        Self {
            version: entity.version(),
            updated_at: entity.updated_at(),
        }
    }

    fn matches<T: Versioned>(&self, entity: &T) -> bool {
        *self == Self::of(entity)
    }
}

/// Keeps one entity type's local copies reconciled with the remote store.
pub struct SyncService<T: Versioned> {
    api: Arc<dyn RemoteEntityApi<T>>,
    resolver: Arc<dyn ConflictResolver<T>>,
    store: Arc<dyn KeyValueStore>,
    queue: Arc<SyncQueue>,
    entity_name: String,
    sealer: Option<Arc<dyn RecordSealer<T>>>,
    draining: AtomicBool,
}

/// Clears the drain flag even if the pass errors out.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl<T: Versioned> SyncService<T> {
    /// Create a sync service for `entity_name`.
    pub fn new(
        api: Arc<dyn RemoteEntityApi<T>>,
        resolver: Arc<dyn ConflictResolver<T>>,
        store: Arc<dyn KeyValueStore>,
        queue: Arc<SyncQueue>,
        entity_name: &str,
    ) -> Self {
        Self {
            api,
            resolver,
            store,
            queue,
            entity_name: entity_name.to_string(),
            sealer: None,
            draining: AtomicBool::new(false),
        }
    }

    pub fn with_sealer(mut self, sealer: Arc<dyn RecordSealer<T>>) -> Self {
        self.sealer = Some(sealer);
        self
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn queue(&self) -> &Arc<SyncQueue> {
        &self.queue
    }

    /// Reconcile `entity` with its remote copy.
    ///
    /// The entity is stored locally first. On a connectivity failure with
    /// `retry_on_failure` set, the push is deferred to the outbox and the
    /// locally stored copy is returned. Every other error is returned as is.
    pub async fn sync_entity(&self, entity: T, options: &SyncOptions) -> Result<T> {
        self.sync_entity_outcome(entity, options)
            .await
            .map(SyncOutcome::into_inner)
    }

    /// Like [`sync_entity`](Self::sync_entity), but reports whether the
    /// write was deferred.
    pub async fn sync_entity_outcome(
        &self,
        entity: T,
        options: &SyncOptions,
    ) -> Result<SyncOutcome<T>> {
        self.save_local(&entity).await?;

        match self.reconcile(&entity).await {
            Ok(resolved) => Ok(SyncOutcome::Synced(resolved)),
            Err(e) if e.is_connectivity() && options.retry_on_failure => {
                warn!(
                    entity = %self.entity_name,
                    id = entity.id(),
                    "Remote unreachable, deferring sync: {}", e
                );
                // A merge may have been stored before the push failed.
                let stored = self.get_local_entity(entity.id()).await?;
                let pending = stored.unwrap_or(entity);
                self.queue
                    .push(NewSyncEvent {
                        event_type: self.entity_name.clone(),
                        payload: serde_json::to_value(&pending)?,
                    })
                    .await?;
                Ok(SyncOutcome::Deferred(pending))
            }
            Err(e) => Err(e),
        }
    }

    async fn reconcile(&self, entity: &T) -> Result<T> {
        let Some(remote) = self.api.fetch(&self.entity_name, entity.id()).await? else {
            debug!(entity = %self.entity_name, id = entity.id(), "First write to remote");
            self.api.put(&self.entity_name, entity).await?;
            self.save_base(entity).await?;
            return Ok(entity.clone());
        };

        if remote == *entity {
            debug!(entity = %self.entity_name, id = entity.id(), "Already in sync");
            self.save_base(&remote).await?;
            return Ok(remote);
        }

        // Fast-forward only over the remote state this device last saw.
        let remote_unchanged = self
            .load_base(entity.id())
            .await?
            .is_some_and(|base| base.matches(&remote));
        let mut resolved = if remote_unchanged && entity.version() > remote.version() {
            entity.clone()
        } else {
            self.resolver.resolve(entity, &remote)
        };
        self.save_base(&remote).await?;

        if resolved != *entity {
            if let Some(sealer) = &self.sealer {
                resolved = sealer.seal(resolved).await?;
            }
            self.save_local(&resolved).await?;
        }

        if resolved != remote {
            self.api.put(&self.entity_name, &resolved).await?;
            self.save_base(&resolved).await?;
        }

        debug!(
            entity = %self.entity_name,
            id = resolved.id(),
            version = resolved.version(),
            "Reconciled with remote"
        );
        Ok(resolved)
    }

    /// Fetch the remote copy of `id` and cache it locally.
    pub async fn pull_entity(&self, id: &str) -> Result<Option<T>> {
        let remote = self.api.fetch(&self.entity_name, id).await?;
        if let Some(entity) = &remote {
            self.save_local(entity).await?;
            self.save_base(entity).await?;
        }
        Ok(remote)
    }

    /// Drain the outbox once and, with an interval set, keep draining in the
    /// background.
    ///
    /// The returned handle owns the background loop; abort it to stop. A zero
    /// interval is rejected before anything runs.
    pub async fn start_sync(self: &Arc<Self>, options: SyncOptions) -> Result<Option<JoinHandle<()>>> {
        if options.interval.is_some_and(|period| period.is_zero()) {
            return Err(HandReceiptError::InvalidInput(
                "sync interval must be positive".to_string(),
            ));
        }

        self.drain().await?;

        let Some(period) = options.interval else {
            return Ok(None);
        };

        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            // A pass that overruns its slot skips the missed ticks instead of
            // firing them back to back.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if let Err(e) = service.drain().await {
                    warn!(entity = %service.entity_name, "Background sync pass failed: {}", e);
                }
            }
        });

        info!(
            entity = %self.entity_name,
            period_ms = period.as_millis() as u64,
            "Background sync started"
        );
        Ok(Some(handle))
    }

    /// Run one outbox pass unless one is already running on this instance.
    ///
    /// Events of this entity type are reconciled through the resolver; other
    /// events go to the queue's own port.
    pub async fn drain(&self) -> Result<Option<DrainReport>> {
        if self.draining.swap(true, Ordering::SeqCst) {
            debug!(entity = %self.entity_name, "Sync pass already running, skipping");
            return Ok(None);
        }
        let _guard = DrainGuard(&self.draining);
        self.queue.process_with(self).await.map(Some)
    }

    pub async fn get_local_entity(&self, id: &str) -> Result<Option<T>> {
        match self.store.get(&self.storage_key(id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub async fn save_local(&self, entity: &T) -> Result<()> {
        let json = serde_json::to_string(entity)?;
        self.store.set(&self.storage_key(entity.id()), &json).await
    }

    /// Remove every locally stored entity of this type, with its sync base.
    pub async fn clear_local_storage(&self) -> Result<()> {
        let prefix = format!("{}:", self.entity_name);
        let base_prefix = self.base_key("");
        let keys: Vec<String> = self
            .store
            .keys()
            .await?
            .into_iter()
            .filter(|key| key.starts_with(&prefix) || key.starts_with(&base_prefix))
            .collect();

        debug!(entity = %self.entity_name, count = keys.len(), "Clearing local entities");
        self.store.remove_many(&keys).await
    }

    fn storage_key(&self, id: &str) -> String {
        format!("{}:{}", self.entity_name, id)
    }

    fn base_key(&self, id: &str) -> String {
        format!("{}{}:{}", SYNC_BASE_PREFIX, self.entity_name, id)
    }

    async fn load_base(&self, id: &str) -> Result<Option<SyncBase>> {
        match self.store.get(&self.base_key(id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save_base(&self, remote: &T) -> Result<()> {
        let json = serde_json::to_string(&SyncBase::of(remote))?;
        self.store.set(&self.base_key(remote.id()), &json).await
    }
}

#[async_trait]
impl<T: Versioned> SyncApi for SyncService<T> {
    async fn replay(&self, event: &SyncEvent) -> Result<()> {
        if event.event_type != self.entity_name {
            return self.queue.api().replay(event).await;
        }

        let queued: T = serde_json::from_value(event.payload.clone())?;
        // Local edits made after the event was queued supersede it.
        let entity = match self.get_local_entity(queued.id()).await? {
            Some(local) if local.version() >= queued.version() => local,
            _ => queued,
        };
        self.reconcile(&entity).await.map(|_| ())
    }
}
