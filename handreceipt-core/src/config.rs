//! Device configuration.

use crate::{HandReceiptError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandReceiptConfig {
    pub api_base_url: String,
    pub ledger_base_url: String,
    pub storage_path: PathBuf,
    pub request_timeout_secs: u64,
    pub sync_interval_secs: u64,
    pub audit_log_dir: Option<PathBuf>,
    /// Use the OS key store for the preferred signing key and to hold the
    /// software key secret, when the platform has one.
    pub native_keys: bool,
}

impl Default for HandReceiptConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8080".to_string(),
            ledger_base_url: "http://127.0.0.1:8008".to_string(),
            storage_path: PathBuf::from("handreceipt.db"),
            request_timeout_secs: 30,
            sync_interval_secs: 60,
            audit_log_dir: None,
            native_keys: true,
        }
    }
}

impl HandReceiptConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| HandReceiptError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.request_timeout_secs == 0 {
            return Err(HandReceiptError::Config(
                "request_timeout_secs must be positive".to_string(),
            ));
        }
        if self.sync_interval_secs == 0 {
            return Err(HandReceiptError::Config(
                "sync_interval_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}
