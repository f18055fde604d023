//! Record signing primitives.
//!
//! This module provides:
//! - ECDSA P-256 software signing (portable baseline)
//! - Ed25519 signing through an optional platform key store
//! - The hybrid key manager that tries signers in priority order

pub mod key_manager;
pub mod native;
pub mod signer;

pub use key_manager::{HybridPublicKey, KeyManager, ProvisionedKey};
pub use native::{NativeKeyCapability, NativeKeyRef};
pub use signer::{verify_signature, NativeSigner, Signer, SoftwareSigner};

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur in signing operations
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("No signing key has been generated for this device")]
    KeyNotInitialized,

    #[error("No signer could produce a signature")]
    NoSignerAvailable,

    #[error("Native key store unavailable: {0}")]
    NativeUnavailable(String),
}

/// Result type for crypto operations
pub type CryptoResult<T> = std::result::Result<T, CryptoError>;

/// Signature scheme a key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureAlgorithm {
    /// ECDSA over NIST P-256 with SHA-256, fixed 64-byte `r || s` signatures.
    EcdsaP256,
    /// Ed25519, 64-byte signatures.
    Ed25519,
}

/// A public verification key tagged with its algorithm.
///
/// P-256 keys are SEC1 uncompressed points; Ed25519 keys are the raw 32 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    pub algorithm: SignatureAlgorithm,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
}

impl PublicKey {
    pub fn new(algorithm: SignatureAlgorithm, bytes: Vec<u8>) -> Self {
        Self { algorithm, bytes }
    }

    /// Base64 form used on the wire (key validation requests).
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.bytes)
    }
}

/// Custom base64 serialization for `Vec<u8>`.
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}
