//! Property service: signed custody records kept in sync with the remote store.

use crate::audit::{AuditEventType, AuditLogger};
use crate::crypto::key_manager::KeyManager;
use crate::property::{
    property_merge, CreatePropertyInput, PropertyRecord, PropertyUpdate, PROPERTY_ENTITY,
};
use crate::storage::KeyValueStore;
use crate::sync::client::{PublicKeyDirectory, RemoteEntityApi, SyncApi};
use crate::sync::conflict::MergeResolver;
use crate::sync::engine::{RecordSealer, SyncService};
use crate::sync::models::{next_timestamp, SyncOptions, SyncOutcome, Versioned};
use crate::sync::queue::SyncQueue;
use crate::{HandReceiptError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default period of the background outbox drain.
pub const DEFAULT_AUTO_SYNC_INTERVAL: Duration = Duration::from_secs(60);

/// Re-signs records whose signature was dropped during conflict resolution.
struct PropertySealer {
    key_manager: Arc<KeyManager>,
}

#[async_trait]
impl RecordSealer<PropertyRecord> for PropertySealer {
    async fn seal(&self, mut record: PropertyRecord) -> Result<PropertyRecord> {
        if record.signature().is_none() {
            debug!(id = %record.id, version = record.version, "Re-signing resolved record");
            sign_record(&self.key_manager, &mut record).await?;
        }
        Ok(record)
    }
}

async fn sign_record(key_manager: &KeyManager, record: &mut PropertyRecord) -> Result<()> {
    let signature = key_manager.sign(&record.canonical_bytes()?).await?;
    record.set_signature(signature);
    Ok(())
}

/// Creates, updates, reads and verifies property records.
pub struct PropertyService {
    key_manager: Arc<KeyManager>,
    directory: Arc<dyn PublicKeyDirectory>,
    sync: Arc<SyncService<PropertyRecord>>,
    audit: Option<Arc<AuditLogger>>,
}

impl PropertyService {
    /// Wire a property service over one remote API and one local store.
    pub fn new<A>(key_manager: Arc<KeyManager>, api: Arc<A>, store: Arc<dyn KeyValueStore>) -> Self
    where
        A: RemoteEntityApi<PropertyRecord> + SyncApi + PublicKeyDirectory + 'static,
    {
        let queue = Arc::new(SyncQueue::new(Arc::clone(&store), api.clone()));
        let sealer = Arc::new(PropertySealer {
            key_manager: Arc::clone(&key_manager),
        });
        let sync = SyncService::new(
            api.clone(),
            Arc::new(MergeResolver::new(property_merge)),
            store,
            queue,
            PROPERTY_ENTITY,
        )
        .with_sealer(sealer);

        Self {
            key_manager,
            directory: api,
            sync: Arc::new(sync),
            audit: None,
        }
    }

    pub fn with_audit(mut self, audit: Arc<AuditLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn sync_service(&self) -> &Arc<SyncService<PropertyRecord>> {
        &self.sync
    }

    /// Register a new property item, sign it and sync it.
    pub async fn create_property(&self, input: CreatePropertyInput) -> Result<PropertyRecord> {
        let mut record = PropertyRecord {
            id: Uuid::new_v4().to_string(),
            version: 1,
            updated_at: Utc::now(),
            name: input.name,
            description: input.description,
            status: input.status,
            metadata: input.metadata,
        };
        sign_record(&self.key_manager, &mut record).await?;

        let record = self.sync_and_audit(record).await?;

        info!(id = %record.id, "Property created");
        self.audit(
            AuditEventType::PropertyCreated {
                property_id: record.id.clone(),
                version: record.version,
            },
            &record.name,
        );
        Ok(record)
    }

    /// Apply `updates` to the local copy of `id`, bump its version, re-sign
    /// and sync.
    pub async fn update_property(&self, id: &str, updates: PropertyUpdate) -> Result<PropertyRecord> {
        let current = self
            .sync
            .get_local_entity(id)
            .await?
            .ok_or_else(|| HandReceiptError::NotFound(format!("Property {}", id)))?;

        let mut updated = current.clone();
        updates.apply_to(&mut updated);
        updated.stamp(current.version + 1, next_timestamp(current.updated_at));
        sign_record(&self.key_manager, &mut updated).await?;

        let record = self.sync_and_audit(updated).await?;

        debug!(id = %record.id, version = record.version, "Property updated");
        self.audit(
            AuditEventType::PropertyUpdated {
                property_id: record.id.clone(),
                version: record.version,
            },
            &record.name,
        );
        Ok(record)
    }

    /// Sync `id` and return the result.
    ///
    /// Without connectivity the last known local copy is returned instead.
    /// With no local copy the remote one is pulled; `None` if neither exists.
    pub async fn get_property(&self, id: &str) -> Result<Option<PropertyRecord>> {
        let local = self.sync.get_local_entity(id).await?;

        let synced = match local {
            Some(record) => self
                .sync
                .sync_entity(record, &SyncOptions::without_retry())
                .await
                .map(Some),
            None => self.sync.pull_entity(id).await,
        };

        match synced {
            Ok(record) => Ok(record),
            Err(e) if e.is_connectivity() => {
                warn!(id, "Remote unreachable, serving local copy: {}", e);
                self.sync.get_local_entity(id).await
            }
            Err(e) => Err(e),
        }
    }

    /// Check the record's signature against a registered key of its signer.
    ///
    /// Keys are looked up out of band, and only keys the key registry
    /// confirms are trusted. A missing signature, an unreachable directory or
    /// no registered key all verify as `false`.
    pub async fn verify_property_signature(&self, record: &PropertyRecord) -> Result<bool> {
        let Some(signature) = record.signature() else {
            debug!(id = %record.id, "Record carries no signature");
            return Ok(false);
        };
        let data = record.canonical_bytes()?;

        let candidates = match self.directory.fetch_public_keys(&record.id).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(id = %record.id, "Failed to fetch public keys: {}", e);
                return Ok(false);
            }
        };

        let mut valid = false;
        for key in candidates {
            if !self.key_manager.verify(signature, &data, &key) {
                continue;
            }
            match self.key_manager.validate_key(&key).await {
                Ok(registered) => {
                    self.audit(AuditEventType::KeyValidated { registered }, &record.id);
                    if registered {
                        valid = true;
                        break;
                    }
                    warn!(id = %record.id, "Signature matches an unregistered key");
                }
                Err(e) => warn!(id = %record.id, "Key validation failed: {}", e),
            }
        }

        self.audit(
            AuditEventType::SignatureVerified {
                property_id: record.id.clone(),
                valid,
            },
            "",
        );
        Ok(valid)
    }

    /// Drain the outbox now and every `interval` after.
    pub async fn start_auto_sync(&self, interval: Duration) -> Result<Option<JoinHandle<()>>> {
        self.sync
            .start_sync(SyncOptions::default().with_interval(interval))
            .await
    }

    async fn sync_and_audit(&self, record: PropertyRecord) -> Result<PropertyRecord> {
        match self
            .sync
            .sync_entity_outcome(record, &SyncOptions::default())
            .await?
        {
            SyncOutcome::Synced(record) => Ok(record),
            SyncOutcome::Deferred(record) => {
                self.audit(
                    AuditEventType::SyncDeferred {
                        property_id: record.id.clone(),
                    },
                    &record.name,
                );
                Ok(record)
            }
        }
    }

    fn audit(&self, event: AuditEventType, context: &str) {
        if let Some(audit) = &self.audit {
            audit.record(event, context);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{Metadata, MetadataValue};
    use crate::property::PropertyStatus;
    use crate::storage::MemoryStore;
    use crate::sync::conflict::{ConflictResolver, TimestampResolver};
    use crate::test_support::{FakeNativeCapability, FakeRemote, RemoteMode};
    use tempfile::TempDir;

    struct Harness {
        remote: Arc<FakeRemote>,
        service: PropertyService,
    }

    async fn harness() -> Harness {
        let remote = Arc::new(FakeRemote::default());
        let store = Arc::new(MemoryStore::new());
        let key_manager = Arc::new(KeyManager::new(store.clone(), remote.clone()));
        let public = key_manager.generate_key_pair().await.unwrap();
        remote.register_key(public.software.clone());
        remote.publish_keys(public.keys());

        let service = PropertyService::new(key_manager, remote.clone(), store);
        Harness { remote, service }
    }

    fn rifle() -> CreatePropertyInput {
        CreatePropertyInput {
            name: "Rifle M4".to_string(),
            description: "Carbine, serial W123".to_string(),
            status: PropertyStatus::Active,
            metadata: Metadata::new(),
        }
    }

    #[tokio::test]
    async fn create_signs_and_pushes() {
        let h = harness().await;
        let created = h.service.create_property(rifle()).await.unwrap();

        assert_eq!(created.version, 1);
        assert!(created.signature().is_some());
        assert_eq!(
            h.remote.stored::<PropertyRecord>(PROPERTY_ENTITY, &created.id),
            Some(created.clone())
        );
        assert!(h.service.verify_property_signature(&created).await.unwrap());
    }

    #[tokio::test]
    async fn mutation_without_resigning_fails_verification() {
        let h = harness().await;
        let created = h.service.create_property(rifle()).await.unwrap();

        let mut renamed = created.clone();
        renamed.name = "Rifle M16".to_string();
        assert!(!h.service.verify_property_signature(&renamed).await.unwrap());

        let mut bumped = created.clone();
        bumped.version += 1;
        assert!(!h.service.verify_property_signature(&bumped).await.unwrap());

        let mut tagged = created.clone();
        tagged
            .metadata
            .insert("location".to_string(), MetadataValue::from("Arms room"));
        assert!(!h.service.verify_property_signature(&tagged).await.unwrap());

        let mut unsigned = created;
        unsigned.clear_signature();
        assert!(!h.service.verify_property_signature(&unsigned).await.unwrap());
    }

    #[tokio::test]
    async fn unregistered_signer_is_not_trusted() {
        let h = harness().await;
        let created = h.service.create_property(rifle()).await.unwrap();

        // A forger publishes their own key for the record.
        let forger = KeyManager::new(Arc::new(MemoryStore::new()), h.remote.clone());
        let forged_key = forger.generate_key_pair().await.unwrap();
        let mut forged = created.clone();
        forged.name = "Radio".to_string();
        let signature = forger.sign(&forged.canonical_bytes().unwrap()).await.unwrap();
        forged.set_signature(signature);
        h.remote.publish_keys(forged_key.keys());

        assert!(!h.service.verify_property_signature(&forged).await.unwrap());
    }

    #[tokio::test]
    async fn native_signature_verifies_with_registered_native_key() {
        let remote = Arc::new(FakeRemote::default());
        let store = Arc::new(MemoryStore::new());
        let key_manager = Arc::new(
            KeyManager::new(store.clone(), remote.clone())
                .with_native_capability(Arc::new(FakeNativeCapability::default())),
        );
        let public = key_manager.generate_key_pair().await.unwrap();
        let native = public.native.clone().expect("native key");
        remote.register_key(native);
        remote.publish_keys(public.keys());

        let service = PropertyService::new(key_manager, remote.clone(), store);
        let created = service.create_property(rifle()).await.unwrap();
        assert!(service.verify_property_signature(&created).await.unwrap());
    }

    #[tokio::test]
    async fn update_bumps_version_by_one_and_resigns() {
        let h = harness().await;
        let created = h.service.create_property(rifle()).await.unwrap();

        let updated = h
            .service
            .update_property(&created.id, PropertyUpdate::status(PropertyStatus::Pending))
            .await
            .unwrap();

        assert_eq!(updated.version, 2);
        assert!(updated.updated_at > created.updated_at);
        assert_eq!(updated.status, PropertyStatus::Pending);
        assert_ne!(updated.signature(), created.signature());
        assert!(h.service.verify_property_signature(&updated).await.unwrap());

        let again = h
            .service
            .update_property(&created.id, PropertyUpdate::status(PropertyStatus::Inactive))
            .await
            .unwrap();
        assert_eq!(again.version, 3);
    }

    #[tokio::test]
    async fn update_of_unknown_property_is_not_found() {
        let h = harness().await;
        let err = h
            .service
            .update_property("missing", PropertyUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, HandReceiptError::NotFound(_)));
    }

    #[tokio::test]
    async fn rifle_scenario_keeps_pending_status() {
        let h = harness().await;
        let created = h.service.create_property(rifle()).await.unwrap();
        assert_eq!(created.version, 1);

        h.remote.set_mode(RemoteMode::Offline);
        let local = h
            .service
            .update_property(&created.id, PropertyUpdate::status(PropertyStatus::Pending))
            .await
            .unwrap();
        assert_eq!(local.version, 2);
        assert!(local.updated_at > created.updated_at);

        let mut remote = created.clone();
        remote.version = 2;
        let winner = TimestampResolver.resolve(&local, &remote);
        assert_eq!(winner.status, PropertyStatus::Pending);
        assert_eq!(winner, local);
    }

    #[tokio::test]
    async fn offline_writes_are_queued_and_drained() {
        let h = harness().await;
        h.remote.set_mode(RemoteMode::Offline);

        let created = h.service.create_property(rifle()).await.unwrap();
        assert_eq!(created.version, 1);
        let queue = h.service.sync_service().queue();
        assert_eq!(queue.get_events().await.unwrap().len(), 1);

        h.remote.set_mode(RemoteMode::Online);
        let handle = h.service.start_auto_sync(DEFAULT_AUTO_SYNC_INTERVAL).await.unwrap();
        assert!(queue.get_events().await.unwrap().is_empty());
        assert_eq!(
            h.remote.stored::<PropertyRecord>(PROPERTY_ENTITY, &created.id),
            Some(created)
        );
        handle.expect("background loop").abort();
    }

    #[tokio::test]
    async fn get_serves_local_copy_when_offline() {
        let h = harness().await;
        let created = h.service.create_property(rifle()).await.unwrap();

        h.remote.set_mode(RemoteMode::Offline);
        let fetched = h.service.get_property(&created.id).await.unwrap();
        assert_eq!(fetched, Some(created));
        assert!(h
            .service
            .sync_service()
            .queue()
            .get_events()
            .await
            .unwrap()
            .is_empty());

        assert_eq!(h.service.get_property("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_pulls_unknown_record_from_remote() {
        let h = harness().await;
        let created = h.service.create_property(rifle()).await.unwrap();
        h.service.sync_service().clear_local_storage().await.unwrap();

        let fetched = h.service.get_property(&created.id).await.unwrap();
        assert_eq!(fetched, Some(created.clone()));
        assert_eq!(
            h.service.sync_service().get_local_entity(&created.id).await.unwrap(),
            Some(created)
        );
    }

    #[tokio::test]
    async fn get_surfaces_remote_rejection() {
        let h = harness().await;
        let created = h.service.create_property(rifle()).await.unwrap();

        h.remote.set_mode(RemoteMode::Rejecting);
        let err = h.service.get_property(&created.id).await.unwrap_err();
        assert!(matches!(err, HandReceiptError::Remote { .. }));
    }

    #[tokio::test]
    async fn concurrent_edit_is_merged_and_resigned() {
        let h = harness().await;
        let mut input = rifle();
        input
            .metadata
            .insert("location".to_string(), MetadataValue::from("Arms room"));
        let created = h.service.create_property(input).await.unwrap();

        // Another device moves the item to a new hand receipt.
        let mut theirs = created.clone();
        theirs
            .metadata
            .insert("hand_receipt".to_string(), MetadataValue::from("HR-77"));
        theirs.stamp(2, next_timestamp(created.updated_at));
        let other_device = KeyManager::new(Arc::new(MemoryStore::new()), h.remote.clone());
        other_device.generate_key_pair().await.unwrap();
        let signature = other_device.sign(&theirs.canonical_bytes().unwrap()).await.unwrap();
        theirs.set_signature(signature);
        h.remote.insert(PROPERTY_ENTITY, &theirs.id, &theirs);

        // This device edits its stale copy meanwhile.
        h.remote.set_mode(RemoteMode::Offline);
        h.service
            .update_property(&created.id, PropertyUpdate::status(PropertyStatus::Inactive))
            .await
            .unwrap();
        h.remote.set_mode(RemoteMode::Online);

        let merged = h.service.get_property(&created.id).await.unwrap().unwrap();
        assert_eq!(merged.version, 3);
        assert_eq!(merged.status, PropertyStatus::Inactive);
        assert_eq!(merged.metadata["hand_receipt"].as_str(), Some("HR-77"));
        assert_eq!(merged.metadata["location"].as_str(), Some("Arms room"));
        assert!(h.service.verify_property_signature(&merged).await.unwrap());
        assert_eq!(
            h.remote.stored::<PropertyRecord>(PROPERTY_ENTITY, &created.id),
            Some(merged)
        );
    }

    #[tokio::test]
    async fn audit_trail_records_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let audit = Arc::new(AuditLogger::new(tmp.path()).unwrap());
        let h = harness().await;
        let service = h.service.with_audit(Arc::clone(&audit));

        let created = service.create_property(rifle()).await.unwrap();
        service
            .update_property(&created.id, PropertyUpdate::status(PropertyStatus::Pending))
            .await
            .unwrap();

        let entries = audit.get_entries(10).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(matches!(
            entries[0].event_type,
            AuditEventType::PropertyUpdated { version: 2, .. }
        ));
        assert_eq!(audit.verify_chain().unwrap(), 2);
    }

    /// Remote copy at v2 from another device, carrying a new hand receipt.
    async fn publish_remote_edit(h: &Harness, base: &PropertyRecord) -> PropertyRecord {
        let mut theirs = base.clone();
        theirs
            .metadata
            .insert("hand_receipt".to_string(), MetadataValue::from("HR-77"));
        theirs.stamp(2, next_timestamp(base.updated_at));
        let other_device = KeyManager::new(Arc::new(MemoryStore::new()), h.remote.clone());
        other_device.generate_key_pair().await.unwrap();
        let signature = other_device.sign(&theirs.canonical_bytes().unwrap()).await.unwrap();
        theirs.set_signature(signature);
        h.remote.insert(PROPERTY_ENTITY, &theirs.id, &theirs);
        theirs
    }

    #[tokio::test]
    async fn remote_edit_survives_several_offline_updates() {
        let h = harness().await;
        let created = h.service.create_property(rifle()).await.unwrap();
        publish_remote_edit(&h, &created).await;

        h.remote.set_mode(RemoteMode::Offline);
        h.service
            .update_property(&created.id, PropertyUpdate::status(PropertyStatus::Pending))
            .await
            .unwrap();
        let local = h
            .service
            .update_property(&created.id, PropertyUpdate::status(PropertyStatus::Inactive))
            .await
            .unwrap();
        assert_eq!(local.version, 3);
        h.remote.set_mode(RemoteMode::Online);

        let merged = h.service.get_property(&created.id).await.unwrap().unwrap();
        assert_eq!(merged.version, 4);
        assert_eq!(merged.status, PropertyStatus::Inactive);
        assert_eq!(merged.metadata["hand_receipt"].as_str(), Some("HR-77"));
        assert!(h.service.verify_property_signature(&merged).await.unwrap());

        // The two queued snapshots are superseded by the merge.
        let report = h.service.sync_service().drain().await.unwrap().unwrap();
        assert_eq!(report.completed, 2);
        assert_eq!(
            h.remote.stored::<PropertyRecord>(PROPERTY_ENTITY, &created.id),
            Some(merged)
        );
    }

    #[tokio::test]
    async fn get_returns_stored_merge_when_push_fails() {
        let h = harness().await;
        let created = h.service.create_property(rifle()).await.unwrap();
        publish_remote_edit(&h, &created).await;

        h.remote.set_mode(RemoteMode::Offline);
        h.service
            .update_property(&created.id, PropertyUpdate::status(PropertyStatus::Pending))
            .await
            .unwrap();

        h.remote.set_mode(RemoteMode::WritesOffline);
        let fetched = h.service.get_property(&created.id).await.unwrap().unwrap();
        assert_eq!(fetched.version, 3);
        assert_eq!(fetched.metadata["hand_receipt"].as_str(), Some("HR-77"));
        assert_eq!(
            h.service.sync_service().get_local_entity(&created.id).await.unwrap(),
            Some(fetched.clone())
        );
        assert!(h.service.verify_property_signature(&fetched).await.unwrap());
    }

    #[tokio::test]
    async fn zero_auto_sync_interval_is_rejected() {
        let h = harness().await;
        let err = h.service.start_auto_sync(Duration::ZERO).await.unwrap_err();
        assert!(matches!(err, HandReceiptError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn audit_records_deferral_and_key_checks() {
        let tmp = TempDir::new().unwrap();
        let audit = Arc::new(AuditLogger::new(tmp.path()).unwrap());
        let h = harness().await;
        let service = h.service.with_audit(Arc::clone(&audit));

        h.remote.set_mode(RemoteMode::Offline);
        let created = service.create_property(rifle()).await.unwrap();
        h.remote.set_mode(RemoteMode::Online);
        assert!(service.verify_property_signature(&created).await.unwrap());

        let events: Vec<AuditEventType> = audit
            .get_entries(10)
            .unwrap()
            .into_iter()
            .rev()
            .map(|entry| entry.event_type)
            .collect();
        assert_eq!(
            events,
            vec![
                AuditEventType::SyncDeferred {
                    property_id: created.id.clone(),
                },
                AuditEventType::PropertyCreated {
                    property_id: created.id.clone(),
                    version: 1,
                },
                AuditEventType::KeyValidated { registered: true },
                AuditEventType::SignatureVerified {
                    property_id: created.id.clone(),
                    valid: true,
                },
            ]
        );
    }
}
