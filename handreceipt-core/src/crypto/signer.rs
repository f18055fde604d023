//! Signing strategies and signature verification.

use crate::crypto::native::{NativeKeyCapability, NativeKeyRef};
use crate::crypto::{CryptoError, CryptoResult, PublicKey, SignatureAlgorithm};
use p256::ecdsa::signature::{Signer as _, Verifier as _};
use rand::rngs::OsRng;
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

/// One way of producing a record signature.
///
/// The key manager holds an ordered list of these and uses the first one
/// that is available and succeeds.
pub trait Signer: Send + Sync {
    fn algorithm(&self) -> SignatureAlgorithm;

    /// Capability check, evaluated before every signing attempt.
    fn is_available(&self) -> bool;

    fn sign(&self, data: &[u8]) -> CryptoResult<Vec<u8>>;

    fn public_key(&self) -> PublicKey;
}

/// Portable ECDSA P-256 signer held in process memory.
pub struct SoftwareSigner {
    key: p256::ecdsa::SigningKey,
}

impl SoftwareSigner {
    /// Generate a fresh random P-256 key.
    pub fn generate() -> Self {
        Self {
            key: p256::ecdsa::SigningKey::random(&mut OsRng),
        }
    }

    /// Restore a signer from its 32-byte secret scalar.
    pub fn from_secret(secret: &[u8]) -> CryptoResult<Self> {
        let key = p256::ecdsa::SigningKey::from_slice(secret)
            .map_err(|e| CryptoError::InvalidKey(format!("P-256 secret: {}", e)))?;
        Ok(Self { key })
    }

    /// Secret scalar bytes, wiped when the returned buffer is dropped.
    pub fn secret_bytes(&self) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(self.key.to_bytes().to_vec())
    }
}

impl Signer for SoftwareSigner {
    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::EcdsaP256
    }

    fn is_available(&self) -> bool {
        true
    }

    fn sign(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        let signature: p256::ecdsa::Signature = self
            .key
            .try_sign(data)
            .map_err(|e| CryptoError::SigningFailed(e.to_string()))?;
        Ok(signature.to_bytes().to_vec())
    }

    fn public_key(&self) -> PublicKey {
        let point = self.key.verifying_key().to_encoded_point(false);
        PublicKey::new(SignatureAlgorithm::EcdsaP256, point.as_bytes().to_vec())
    }
}

/// Ed25519 signer delegating to the platform key store.
pub struct NativeSigner {
    capability: Arc<dyn NativeKeyCapability>,
    key: NativeKeyRef,
}

impl NativeSigner {
    pub fn new(capability: Arc<dyn NativeKeyCapability>, key: NativeKeyRef) -> Self {
        Self { capability, key }
    }
}

impl Signer for NativeSigner {
    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::Ed25519
    }

    fn is_available(&self) -> bool {
        self.capability.is_available()
    }

    fn sign(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        self.capability.sign(&self.key.alias, data)
    }

    fn public_key(&self) -> PublicKey {
        PublicKey::new(SignatureAlgorithm::Ed25519, self.key.public_key.clone())
    }
}

/// Verify `signature` over `data` in software.
///
/// Malformed keys or signatures are reported as a failed verification.
pub fn verify_signature(public_key: &PublicKey, data: &[u8], signature: &[u8]) -> bool {
    let result = match public_key.algorithm {
        SignatureAlgorithm::EcdsaP256 => verify_p256(&public_key.bytes, data, signature),
        SignatureAlgorithm::Ed25519 => verify_ed25519(&public_key.bytes, data, signature),
    };

    match result {
        Ok(valid) => valid,
        Err(e) => {
            debug!("Signature verification rejected input: {}", e);
            false
        }
    }
}

fn verify_p256(key: &[u8], data: &[u8], signature: &[u8]) -> CryptoResult<bool> {
    let verifying_key = p256::ecdsa::VerifyingKey::from_sec1_bytes(key)
        .map_err(|e| CryptoError::InvalidKey(format!("P-256 public key: {}", e)))?;
    let signature = p256::ecdsa::Signature::from_slice(signature)
        .map_err(|e| CryptoError::InvalidKey(format!("P-256 signature: {}", e)))?;
    Ok(verifying_key.verify(data, &signature).is_ok())
}

fn verify_ed25519(key: &[u8], data: &[u8], signature: &[u8]) -> CryptoResult<bool> {
    let key: [u8; 32] = key.try_into().map_err(|_| {
        CryptoError::InvalidKey(format!("Ed25519 public key must be 32 bytes, got {}", key.len()))
    })?;
    let verifying_key = ed25519_dalek::VerifyingKey::from_bytes(&key)
        .map_err(|e| CryptoError::InvalidKey(format!("Ed25519 public key: {}", e)))?;
    let signature = ed25519_dalek::Signature::from_slice(signature)
        .map_err(|e| CryptoError::InvalidKey(format!("Ed25519 signature: {}", e)))?;
    Ok(verifying_key.verify_strict(data, &signature).is_ok())
}
