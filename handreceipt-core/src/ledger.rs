//! Client for the distributed-ledger batch API.
//!
//! The ledger is an external service: transactions are submitted as JSON and
//! their batch status is polled until it settles.

use crate::crypto::PublicKey;
use crate::{HandReceiptError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Longest `wait_for_commit` keeps polling by default.
pub const BATCH_STATUS_TIMEOUT: Duration = Duration::from_secs(300);

/// Settlement state of a submitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Committed,
    Invalid,
    #[serde(other)]
    Unknown,
}

impl BatchStatus {
    /// Whether the batch has reached a final state.
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Committed | Self::Invalid)
    }
}

#[derive(Serialize)]
struct SubmitRequest<'a> {
    action: &'a str,
    data: &'a serde_json::Value,
    public_key: String,
}

#[derive(Deserialize)]
struct SubmitResponse {
    batch_id: String,
}

#[derive(Deserialize)]
struct StatusEntry {
    id: String,
    status: BatchStatus,
}

#[derive(Deserialize)]
struct StatusResponse {
    data: Vec<StatusEntry>,
}

/// HTTP client for ledger submission and status polling.
#[derive(Clone)]
pub struct LedgerClient {
    client: reqwest::Client,
    base_url: String,
}

impl LedgerClient {
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

    /// Submit one transaction; returns the pending batch id.
    pub async fn submit_transaction(
        &self,
        action: &str,
        data: &serde_json::Value,
        public_key: &PublicKey,
    ) -> Result<String> {
        let body = SubmitRequest {
            action,
            data,
            public_key: public_key.to_base64(),
        };
        let resp = self
            .client
            .post(format!("{}/api/transactions", self.base_url))
            .json(&body)
            .send()
            .await?;

        let resp = check_status(resp).await?;
        let submitted: SubmitResponse = resp.json().await?;
        info!(action, batch_id = %submitted.batch_id, "Submitted ledger transaction");
        Ok(submitted.batch_id)
    }

    /// Current status of `batch_id`; `Unknown` if the ledger does not report it.
    pub async fn batch_status(&self, batch_id: &str) -> Result<BatchStatus> {
        let resp = self
            .client
            .get(format!("{}/api/batch_statuses", self.base_url))
            .query(&[("id", batch_id)])
            .send()
            .await?;

        let body: StatusResponse = check_status(resp).await?.json().await?;
        let status = body
            .data
            .into_iter()
            .find(|entry| entry.id == batch_id)
            .map(|entry| entry.status)
            .unwrap_or(BatchStatus::Unknown);

        debug!(batch_id, ?status, "Batch status");
        Ok(status)
    }

    /// Poll until the batch is committed or invalid, or `timeout` elapses.
    ///
    /// Returns the last status seen, which is non-final on timeout.
    pub async fn wait_for_commit(
        &self,
        batch_id: &str,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<BatchStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            let status = self.batch_status(batch_id).await?;
            if status.is_final() || Instant::now() + poll_interval > deadline {
                return Ok(status);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status();
    let body = resp.text().await.unwrap_or_else(|_| "unknown".to_string());
    Err(HandReceiptError::from_status(status.as_u16(), body))
}
