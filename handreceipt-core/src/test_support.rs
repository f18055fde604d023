//! In-process fakes for the remote ports and the native key store.

use crate::crypto::native::{NativeKeyCapability, NativeKeyRef};
use crate::crypto::{CryptoError, CryptoResult, PublicKey};
use crate::sync::client::{KeyRegistry, PublicKeyDirectory, RemoteEntityApi, SyncApi};
use crate::sync::models::{SyncEvent, Versioned};
use crate::{HandReceiptError, Result};
use async_trait::async_trait;
use ed25519_dalek::{Signer as _, SigningKey};
use rand::rngs::OsRng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RemoteMode {
    #[default]
    Online,
    /// Every call fails with a connectivity error.
    Offline,
    /// Every call fails with a non-retryable remote error.
    Rejecting,
    /// Reads succeed; writes fail with a connectivity error.
    WritesOffline,
}

/// Remote store, outbox endpoint, key registry and key directory in one.
#[derive(Default)]
pub struct FakeRemote {
    mode: Mutex<RemoteMode>,
    entities: Mutex<HashMap<(String, String), serde_json::Value>>,
    registered: Mutex<Vec<PublicKey>>,
    published: Mutex<Vec<PublicKey>>,
    replay_gate: Mutex<Option<Arc<Notify>>>,
    fetch_calls: AtomicUsize,
    replay_calls: AtomicUsize,
    put_calls: AtomicUsize,
}

impl FakeRemote {
    pub fn set_mode(&self, mode: RemoteMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn stored_json(&self, entity: &str, id: &str) -> Option<serde_json::Value> {
        self.entities
            .lock()
            .unwrap()
            .get(&(entity.to_string(), id.to_string()))
            .cloned()
    }

    pub fn stored<T: DeserializeOwned>(&self, entity: &str, id: &str) -> Option<T> {
        self.stored_json(entity, id)
            .map(|json| serde_json::from_value(json).unwrap())
    }

    pub fn insert<T: Serialize>(&self, entity: &str, id: &str, value: &T) {
        self.entities.lock().unwrap().insert(
            (entity.to_string(), id.to_string()),
            serde_json::to_value(value).unwrap(),
        );
    }

    /// Mark a key as registered with the key registry.
    pub fn register_key(&self, key: PublicKey) {
        self.registered.lock().unwrap().push(key);
    }

    /// Keys returned by the directory for every record.
    pub fn publish_keys(&self, keys: Vec<PublicKey>) {
        *self.published.lock().unwrap() = keys;
    }

    /// Make replays and fetches block until the returned notifier fires.
    pub fn gate_requests(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.replay_gate.lock().unwrap() = Some(Arc::clone(&gate));
        gate
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn replay_calls(&self) -> usize {
        self.replay_calls.load(Ordering::SeqCst)
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    async fn wait_for_gate(&self) {
        let gate = self.replay_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    fn check_read(&self) -> Result<()> {
        let mode = *self.mode.lock().unwrap();
        match mode {
            RemoteMode::WritesOffline => Ok(()),
            _ => self.check(),
        }
    }

    fn check(&self) -> Result<()> {
        match *self.mode.lock().unwrap() {
            RemoteMode::Online => Ok(()),
            RemoteMode::Offline | RemoteMode::WritesOffline => Err(HandReceiptError::Network(
                "connection refused".to_string(),
            )),
            RemoteMode::Rejecting => Err(HandReceiptError::Remote {
                status: 422,
                message: "validation failed".to_string(),
            }),
        }
    }
}

#[async_trait]
impl<T: Versioned> RemoteEntityApi<T> for FakeRemote {
    async fn fetch(&self, entity: &str, id: &str) -> Result<Option<T>> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.wait_for_gate().await;
        self.check_read()?;
        Ok(self
            .stored_json(entity, id)
            .map(serde_json::from_value)
            .transpose()?)
    }

    async fn put(&self, entity: &str, value: &T) -> Result<()> {
        self.check()?;
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.insert(entity, value.id(), value);
        Ok(())
    }
}

#[async_trait]
impl SyncApi for FakeRemote {
    async fn replay(&self, event: &SyncEvent) -> Result<()> {
        self.replay_calls.fetch_add(1, Ordering::SeqCst);
        self.wait_for_gate().await;
        self.check()?;

        let id = event.payload["id"].as_str().unwrap_or_default().to_string();
        self.entities
            .lock()
            .unwrap()
            .insert((event.event_type.clone(), id), event.payload.clone());
        Ok(())
    }
}

#[async_trait]
impl KeyRegistry for FakeRemote {
    async fn validate_key(&self, public_key: &PublicKey) -> Result<bool> {
        self.check_read()?;
        Ok(self.registered.lock().unwrap().contains(public_key))
    }
}

#[async_trait]
impl PublicKeyDirectory for FakeRemote {
    async fn fetch_public_keys(&self, _record_id: &str) -> Result<Vec<PublicKey>> {
        self.check_read()?;
        Ok(self.published.lock().unwrap().clone())
    }
}

/// Native key store kept in memory, with switchable failures.
#[derive(Default)]
pub struct FakeNativeCapability {
    keys: Mutex<HashMap<String, SigningKey>>,
    pub fail_generate: AtomicBool,
    pub fail_sign: AtomicBool,
}

impl NativeKeyCapability for FakeNativeCapability {
    fn is_available(&self) -> bool {
        true
    }

    fn generate_key_pair(&self, alias: &str) -> CryptoResult<NativeKeyRef> {
        if self.fail_generate.load(Ordering::SeqCst) {
            return Err(CryptoError::NativeUnavailable("secure enclave busy".into()));
        }
        let key = SigningKey::generate(&mut OsRng);
        let public_key = key.verifying_key().to_bytes().to_vec();
        self.keys.lock().unwrap().insert(alias.to_string(), key);
        Ok(NativeKeyRef {
            alias: alias.to_string(),
            public_key,
        })
    }

    fn sign(&self, alias: &str, data: &[u8]) -> CryptoResult<Vec<u8>> {
        if self.fail_sign.load(Ordering::SeqCst) {
            return Err(CryptoError::SigningFailed("user cancelled".into()));
        }
        let keys = self.keys.lock().unwrap();
        let key = keys
            .get(alias)
            .ok_or_else(|| CryptoError::InvalidKey(format!("no native key {}", alias)))?;
        Ok(key.sign(data).to_bytes().to_vec())
    }
}
