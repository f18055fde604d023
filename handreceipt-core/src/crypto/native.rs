//! Platform-backed Ed25519 keys (Windows Credential Manager, macOS Keychain)

use crate::crypto::CryptoResult;
#[cfg(any(windows, target_os = "macos"))]
use crate::crypto::CryptoError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[cfg(any(windows, target_os = "macos"))]
const NATIVE_SERVICE_NAME: &str = "handreceipt.signing";

/// Handle to a key that lives in the platform key store.
///
/// Only the alias and public half are persisted by the key manager; the
/// secret never leaves the platform store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NativeKeyRef {
    pub alias: String,
    #[serde(with = "crate::crypto::base64_bytes")]
    pub public_key: Vec<u8>,
}

/// Optional host capability for generating and using hardware/OS-held keys.
pub trait NativeKeyCapability: Send + Sync {
    /// Whether the platform store can be used right now.
    fn is_available(&self) -> bool;

    /// Create (or replace) an Ed25519 key under `alias`.
    fn generate_key_pair(&self, alias: &str) -> CryptoResult<NativeKeyRef>;

    /// Sign `data` with the key stored under `alias`.
    fn sign(&self, alias: &str, data: &[u8]) -> CryptoResult<Vec<u8>>;
}

/// Returns the native capability for the current platform, if there is one.
pub fn platform_capability() -> Option<Arc<dyn NativeKeyCapability>> {
    #[cfg(any(windows, target_os = "macos"))]
    return Some(Arc::new(keychain::KeychainCapability));

    #[cfg(not(any(windows, target_os = "macos")))]
    return None;
}

#[cfg(any(windows, target_os = "macos"))]
mod keychain {
    use super::*;
    use base64::{engine::general_purpose::STANDARD, Engine};
    use ed25519_dalek::{Signer as _, SigningKey};
    use rand::rngs::OsRng;
    use zeroize::Zeroize;

    /// Keeps the Ed25519 seed in the OS credential store.
    pub struct KeychainCapability;

    impl KeychainCapability {
        fn entry(alias: &str) -> CryptoResult<keyring::Entry> {
            keyring::Entry::new(NATIVE_SERVICE_NAME, alias).map_err(|e| {
                CryptoError::NativeUnavailable(format!("Failed to open keyring entry: {}", e))
            })
        }
    }

    impl NativeKeyCapability for KeychainCapability {
        fn is_available(&self) -> bool {
            Self::entry("probe").is_ok()
        }

        fn generate_key_pair(&self, alias: &str) -> CryptoResult<NativeKeyRef> {
            let signing_key = SigningKey::generate(&mut OsRng);
            let mut seed = STANDARD.encode(signing_key.to_bytes());
            let stored = Self::entry(alias)?.set_password(&seed).map_err(|e| {
                CryptoError::KeyGeneration(format!("Failed to store native key: {}", e))
            });
            seed.zeroize();
            stored?;

            Ok(NativeKeyRef {
                alias: alias.to_string(),
                public_key: signing_key.verifying_key().to_bytes().to_vec(),
            })
        }

        fn sign(&self, alias: &str, data: &[u8]) -> CryptoResult<Vec<u8>> {
            let mut encoded = Self::entry(alias)?.get_password().map_err(|e| {
                CryptoError::NativeUnavailable(format!("Native key not readable: {}", e))
            })?;
            let decoded = STANDARD.decode(&encoded);
            encoded.zeroize();

            let mut seed = decoded.map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
            let bytes: CryptoResult<[u8; 32]> = seed.as_slice().try_into().map_err(|_| {
                CryptoError::InvalidKey(format!("expected 32-byte seed, got {}", seed.len()))
            });
            seed.zeroize();

            let signing_key = SigningKey::from_bytes(&bytes?);
            Ok(signing_key.sign(data).to_bytes().to_vec())
        }
    }
}
