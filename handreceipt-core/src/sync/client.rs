//! Remote ports and the HTTP client that implements them.

use crate::crypto::PublicKey;
use crate::sync::models::{SyncEvent, Versioned};
use crate::{HandReceiptError, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Read/write access to the authoritative copy of entities.
#[async_trait]
pub trait RemoteEntityApi<T: Versioned>: Send + Sync {
    /// Fetch the remote copy. `Ok(None)` means no remote copy exists yet.
    async fn fetch(&self, entity: &str, id: &str) -> Result<Option<T>>;

    /// Create or replace the remote copy.
    async fn put(&self, entity: &str, value: &T) -> Result<()>;
}

/// Replays one queued outbox event.
///
/// Connectivity errors earn the event another attempt; any other error
/// drops it.
#[async_trait]
pub trait SyncApi: Send + Sync {
    async fn replay(&self, event: &SyncEvent) -> Result<()>;
}

/// Remote registry of recognized device keys.
#[async_trait]
pub trait KeyRegistry: Send + Sync {
    async fn validate_key(&self, public_key: &PublicKey) -> Result<bool>;
}

/// Out-of-band lookup of the keys that claim to have signed a record.
#[async_trait]
pub trait PublicKeyDirectory: Send + Sync {
    async fn fetch_public_keys(&self, record_id: &str) -> Result<Vec<PublicKey>>;
}

#[derive(Deserialize)]
struct PublicKeysResponse {
    public_keys: Vec<PublicKey>,
}

/// HTTP client for the HandReceipt API.
#[derive(Clone)]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    /// Create a new API client.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HandReceiptError::Config(format!("HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn put_json(&self, path: &str, body: &serde_json::Value) -> Result<()> {
        let resp = self.client.put(self.url(path)).json(body).send().await?;
        Self::check_status(resp).await?;
        Ok(())
    }

    async fn fetch_state<D: DeserializeOwned>(&self, entity: &str, id: &str) -> Result<Option<D>> {
        let path = format!("/api/state/{}/{}", entity, id);
        let resp = self.client.get(self.url(&path)).send().await?;

        if resp.status() == StatusCode::NOT_FOUND {
            debug!(entity, id, "No remote copy");
            return Ok(None);
        }

        let resp = Self::check_status(resp).await?;
        Ok(Some(resp.json().await?))
    }

    /// Turn a non-success response into an error.
    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let body = resp.text().await.unwrap_or_else(|_| "unknown".to_string());
        Err(HandReceiptError::from_status(status.as_u16(), body))
    }
}

#[async_trait]
impl<T: Versioned> RemoteEntityApi<T> for ApiClient {
    async fn fetch(&self, entity: &str, id: &str) -> Result<Option<T>> {
        self.fetch_state(entity, id).await
    }

    async fn put(&self, entity: &str, value: &T) -> Result<()> {
        let path = format!("/api/{}/{}", entity, value.id());
        self.put_json(&path, &serde_json::to_value(value)?).await
    }
}

fn payload_version(payload: &serde_json::Value) -> u64 {
    payload.get("version").and_then(|v| v.as_u64()).unwrap_or_default()
}

/// Blind replay of a queued payload, guarded by a version precondition: the
/// write is refused with [`HandReceiptError::Conflict`] once the remote copy
/// is at the same or a later version.
#[async_trait]
impl SyncApi for ApiClient {
    async fn replay(&self, event: &SyncEvent) -> Result<()> {
        let id = event.payload.get("id").and_then(|v| v.as_str()).ok_or_else(|| {
            HandReceiptError::InvalidInput(format!("Sync event {} has no entity id", event.id))
        })?;
        let queued_version = payload_version(&event.payload);

        let remote: Option<serde_json::Value> = self.fetch_state(&event.event_type, id).await?;
        if let Some(remote) = remote {
            if remote == event.payload {
                debug!(event_id = %event.id, id, "Queued write already applied");
                return Ok(());
            }
            let remote_version = payload_version(&remote);
            if remote_version >= queued_version {
                return Err(HandReceiptError::Conflict(format!(
                    "{} {} is at version {} remotely, queued write has version {}",
                    event.event_type, id, remote_version, queued_version
                )));
            }
        }

        let path = format!("/api/{}/{}", event.event_type, id);
        self.put_json(&path, &event.payload).await
    }
}

#[async_trait]
impl KeyRegistry for ApiClient {
    async fn validate_key(&self, public_key: &PublicKey) -> Result<bool> {
        let body = serde_json::json!({ "public_key": public_key.to_base64() });
        let resp = self
            .client
            .post(self.url("/api/keys/validate"))
            .json(&body)
            .send()
            .await?;

        match resp.status() {
            s if s.is_success() => Ok(true),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => Ok(false),
            _ => Self::check_status(resp).await.map(|_| false),
        }
    }
}

#[async_trait]
impl PublicKeyDirectory for ApiClient {
    async fn fetch_public_keys(&self, record_id: &str) -> Result<Vec<PublicKey>> {
        let path = format!("/api/properties/{}/key", record_id);
        let resp = self.client.get(self.url(&path)).send().await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body: PublicKeysResponse = Self::check_status(resp).await?.json().await?;
        Ok(body.public_keys)
    }
}
