//! Property (custody) records and their merge strategy.

pub mod service;

use crate::metadata::{Metadata, MetadataValue, SIGNATURE_KEY};
use crate::sync::models::Versioned;
use crate::{HandReceiptError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Entity-type name used for storage keys, queue tags and API paths.
pub const PROPERTY_ENTITY: &str = "property";

/// Lifecycle status of a property item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyStatus {
    Active,
    Inactive,
    Pending,
}

impl PropertyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Pending => "pending",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "pending" => Ok(Self::Pending),
            other => Err(HandReceiptError::InvalidInput(format!(
                "Unknown property status: {}",
                other
            ))),
        }
    }
}

/// A signed custody record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyRecord {
    pub id: String,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub description: String,
    pub status: PropertyStatus,
    #[serde(default)]
    pub metadata: Metadata,
}

impl PropertyRecord {
    /// Bytes the record signature covers: the JSON form with the signature
    /// entry removed from metadata.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut unsigned = self.clone();
        unsigned.metadata.remove(SIGNATURE_KEY);
        Ok(serde_json::to_vec(&unsigned)?)
    }

    pub fn signature(&self) -> Option<&[u8]> {
        self.metadata.get(SIGNATURE_KEY).and_then(MetadataValue::as_bytes)
    }

    pub fn set_signature(&mut self, signature: Vec<u8>) {
        self.metadata
            .insert(SIGNATURE_KEY.to_string(), MetadataValue::Bytes(signature));
    }

    pub fn clear_signature(&mut self) {
        self.metadata.remove(SIGNATURE_KEY);
    }
}

impl Versioned for PropertyRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn stamp(&mut self, version: u64, updated_at: DateTime<Utc>) {
        self.version = version;
        self.updated_at = updated_at;
    }
}

/// Fields supplied when registering a new property item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatePropertyInput {
    pub name: String,
    pub description: String,
    pub status: PropertyStatus,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Partial update of a property record.
///
/// `None` leaves a field untouched; metadata entries are upserted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropertyUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub status: Option<PropertyStatus>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl PropertyUpdate {
    pub fn status(status: PropertyStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub(crate) fn apply_to(self, record: &mut PropertyRecord) {
        if let Some(name) = self.name {
            record.name = name;
        }
        if let Some(description) = self.description {
            record.description = description;
        }
        if let Some(status) = self.status {
            record.status = status;
        }
        record.metadata.extend(self.metadata);
    }
}

/// Merge two divergent copies of a property record.
///
/// - metadata: union, local wins on key collisions
/// - signature: dropped; it cannot cover the merged state
/// - status: from the copy with the later `updated_at` (local on a tie)
/// - everything else: local
pub fn property_merge(local: &PropertyRecord, remote: &PropertyRecord) -> Result<PropertyRecord> {
    if local.id != remote.id {
        return Err(HandReceiptError::Merge(format!(
            "Cannot merge property {} with {}",
            local.id, remote.id
        )));
    }

    let mut merged = local.clone();

    let mut metadata = remote.metadata.clone();
    metadata.extend(local.metadata.clone());
    metadata.remove(SIGNATURE_KEY);
    merged.metadata = metadata;

    if remote.updated_at > local.updated_at {
        merged.status = remote.status;
    }

    Ok(merged)
}
