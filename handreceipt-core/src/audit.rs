//! Tamper-evident audit log for custody and key events.
//!
//! Entries are appended as JSON lines. Each entry carries the hash of its
//! predecessor and its own SHA-256 hash over the entry body, so editing or
//! removing any line breaks the chain from that point on.

use crate::{HandReceiptError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

/// `prev_hash` of the first entry in a log.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Audit log entry types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AuditEventType {
    /// Identity
    KeyGenerated {
        native: bool,
    },
    KeyValidated {
        registered: bool,
    },

    /// Property records
    PropertyCreated {
        property_id: String,
        version: u64,
    },
    PropertyUpdated {
        property_id: String,
        version: u64,
    },
    SignatureVerified {
        property_id: String,
        valid: bool,
    },

    /// Sync
    SyncDeferred {
        property_id: String,
    },
    OutboxDrained {
        completed: usize,
        dropped: usize,
    },

    /// Ledger
    LedgerSubmitted {
        batch_id: String,
    },
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    /// Event severity (0-5, where 5 is most critical)
    pub severity: u8,
    pub context: String,
    pub prev_hash: String,
    pub hash: String,
}

/// Fields covered by an entry's hash.
#[derive(Serialize)]
struct HashedFields<'a> {
    sequence: u64,
    timestamp: &'a DateTime<Utc>,
    event_type: &'a AuditEventType,
    severity: u8,
    context: &'a str,
    prev_hash: &'a str,
}

impl AuditEntry {
    fn compute_hash(&self) -> Result<String> {
        let fields = HashedFields {
            sequence: self.sequence,
            timestamp: &self.timestamp,
            event_type: &self.event_type,
            severity: self.severity,
            context: &self.context,
            prev_hash: &self.prev_hash,
        };
        let bytes = serde_json::to_vec(&fields)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }
}

struct ChainHead {
    file: File,
    next_sequence: u64,
    last_hash: String,
}

/// Append-only, hash-chained audit logger
pub struct AuditLogger {
    log_file: PathBuf,
    head: Mutex<ChainHead>,
}

impl AuditLogger {
    /// Open (or create) `audit.log` in `log_dir` and resume its chain.
    pub fn new(log_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(log_dir)?;
        let log_file = log_dir.join("audit.log");

        let existing = read_entries(&log_file)?;
        let (next_sequence, last_hash) = match existing.last() {
            Some(last) => (last.sequence + 1, last.hash.clone()),
            None => (0, GENESIS_HASH.to_string()),
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)?;

        info!("Audit logger initialized: {:?}", log_file);

        Ok(Self {
            log_file,
            head: Mutex::new(ChainHead {
                file,
                next_sequence,
                last_hash,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.log_file
    }

    /// Append an event to the chain.
    pub fn log(&self, event_type: AuditEventType, context: &str) -> Result<()> {
        let mut head = self
            .head
            .lock()
            .map_err(|_| HandReceiptError::Storage("Audit writer lock poisoned".to_string()))?;

        let severity = Self::severity_for_event(&event_type);
        let mut entry = AuditEntry {
            sequence: head.next_sequence,
            timestamp: Utc::now(),
            event_type,
            severity,
            context: context.to_string(),
            prev_hash: head.last_hash.clone(),
            hash: String::new(),
        };
        entry.hash = entry.compute_hash()?;

        let line = format!("{}\n", serde_json::to_string(&entry)?);
        head.file.write_all(line.as_bytes())?;
        head.file.flush()?;

        head.next_sequence += 1;
        head.last_hash = entry.hash;
        Ok(())
    }

    /// Log an event, reporting failures through tracing instead of the caller.
    pub fn record(&self, event_type: AuditEventType, context: &str) {
        if let Err(e) = self.log(event_type, context) {
            warn!("Failed to write audit entry: {}", e);
        }
    }

    fn severity_for_event(event: &AuditEventType) -> u8 {
        match event {
            AuditEventType::SignatureVerified { valid: false, .. } => 5,
            AuditEventType::KeyGenerated { .. } => 4,
            AuditEventType::KeyValidated { registered: false } => 3,
            AuditEventType::PropertyCreated { .. }
            | AuditEventType::PropertyUpdated { .. }
            | AuditEventType::LedgerSubmitted { .. } => 2,
            AuditEventType::SyncDeferred { .. } | AuditEventType::OutboxDrained { .. } => 1,
            AuditEventType::SignatureVerified { valid: true, .. }
            | AuditEventType::KeyValidated { registered: true } => 0,
        }
    }

    /// Most recent entries first.
    pub fn get_entries(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        Ok(read_entries(&self.log_file)?
            .into_iter()
            .rev()
            .take(limit)
            .collect())
    }

    pub fn get_entries_by_severity(&self, min_severity: u8) -> Result<Vec<AuditEntry>> {
        Ok(read_entries(&self.log_file)?
            .into_iter()
            .filter(|entry| entry.severity >= min_severity)
            .collect())
    }

    /// Check the whole chain; returns the number of verified entries.
    pub fn verify_chain(&self) -> Result<usize> {
        verify_chain(&self.log_file)
    }
}

fn read_entries(path: &Path) -> Result<Vec<AuditEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)?;
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str::<AuditEntry>(line).map_err(Into::into))
        .collect()
}

/// Verify the hash chain of the audit log at `path`.
///
/// Fails with `InvalidInput` naming the first broken entry.
pub fn verify_chain(path: &Path) -> Result<usize> {
    let entries = read_entries(path)?;
    let mut expected_prev = GENESIS_HASH.to_string();

    for (index, entry) in entries.iter().enumerate() {
        if entry.sequence != index as u64 {
            return Err(HandReceiptError::InvalidInput(format!(
                "Audit entry {} has sequence {}",
                index, entry.sequence
            )));
        }
        if entry.prev_hash != expected_prev {
            return Err(HandReceiptError::InvalidInput(format!(
                "Audit entry {} does not follow its predecessor",
                index
            )));
        }
        if entry.compute_hash()? != entry.hash {
            return Err(HandReceiptError::InvalidInput(format!(
                "Audit entry {} was modified",
                index
            )));
        }
        expected_prev = entry.hash.clone();
    }

    Ok(entries.len())
}
