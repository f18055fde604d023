//! Tagged-value metadata carried alongside domain records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata key under which a record's own signature bytes are stored.
pub const SIGNATURE_KEY: &str = "signature";

/// Open-ended extension map attached to a record.
///
/// Ordered keys keep the serialized form stable, which the canonical
/// signing form depends on.
pub type Metadata = BTreeMap<String, MetadataValue>;

/// A single metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MetadataValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    Bytes(#[serde(with = "crate::crypto::base64_bytes")] Vec<u8>),
    List(Vec<MetadataValue>),
    Map(BTreeMap<String, MetadataValue>),
}

impl MetadataValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for MetadataValue {
    fn from(n: i64) -> Self {
        Self::Integer(n)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Vec<u8>> for MetadataValue {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_serialization_shape() {
        let json = serde_json::to_value(MetadataValue::Integer(7)).unwrap();
        assert_eq!(json, serde_json::json!({"type": "integer", "value": 7}));

        let json = serde_json::to_value(MetadataValue::Null).unwrap();
        assert_eq!(json, serde_json::json!({"type": "null"}));
    }

    #[test]
    fn bytes_are_base64_on_the_wire() {
        let json = serde_json::to_value(MetadataValue::Bytes(vec![1, 2, 3])).unwrap();
        assert_eq!(json, serde_json::json!({"type": "bytes", "value": "AQID"}));

        let back: MetadataValue = serde_json::from_value(json).unwrap();
        assert_eq!(back.as_bytes(), Some(&[1u8, 2, 3][..]));
    }

    #[test]
    fn nested_map_serializes_with_sorted_keys() {
        let mut inner = BTreeMap::new();
        inner.insert("zulu".to_string(), MetadataValue::from(true));
        inner.insert("alpha".to_string(), MetadataValue::from("serial-01"));

        let mut metadata = Metadata::new();
        metadata.insert("location".to_string(), MetadataValue::Map(inner));

        let text = serde_json::to_string(&metadata).unwrap();
        assert!(text.find("alpha").unwrap() < text.find("zulu").unwrap());
    }
}
