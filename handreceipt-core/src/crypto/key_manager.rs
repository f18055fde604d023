//! Hybrid signing identity.
//!
//! Every device holds a portable ECDSA P-256 key. When the host platform
//! offers a native key store, an Ed25519 key is created there as well and
//! preferred for signing:
//!
//! ```text
//! sign(data) → [NativeSigner (Ed25519)] → SoftwareSigner (P-256)
//! ```
//!
//! Both halves are persisted together as one record in the secure store.

use crate::crypto::native::{NativeKeyCapability, NativeKeyRef};
use crate::crypto::signer::{verify_signature, NativeSigner, Signer, SoftwareSigner};
use crate::crypto::{CryptoError, PublicKey, SignatureAlgorithm};
use crate::storage::KeyValueStore;
use crate::sync::client::KeyRegistry;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use zeroize::{ZeroizeOnDrop, Zeroizing};

/// Storage key of the persisted hybrid key record.
pub const HYBRID_KEY_STORAGE_KEY: &str = "hybrid_key";

/// Alias of the device key inside the native key store.
pub const NATIVE_KEY_ALIAS: &str = "handreceipt.device";

/// Persisted form of the hybrid key.
#[derive(Serialize, Deserialize, ZeroizeOnDrop)]
struct StoredHybridKey {
    #[serde(with = "crate::crypto::base64_bytes")]
    software_secret: Vec<u8>,
    #[zeroize(skip)]
    native: Option<NativeKeyRef>,
    #[zeroize(skip)]
    created_at: DateTime<Utc>,
}

/// Public half of the device identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HybridPublicKey {
    pub software: PublicKey,
    pub native: Option<PublicKey>,
    pub created_at: DateTime<Utc>,
}

impl HybridPublicKey {
    /// All verification keys of this identity, native first.
    pub fn keys(&self) -> Vec<PublicKey> {
        self.native
            .iter()
            .cloned()
            .chain(std::iter::once(self.software.clone()))
            .collect()
    }
}

/// Result of [`KeyManager::provision`].
#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionedKey {
    pub public: HybridPublicKey,
    /// Whether a new key was created rather than loaded.
    pub generated: bool,
}

struct LoadedIdentity {
    public: HybridPublicKey,
    /// Signing strategies in priority order.
    signers: Vec<Box<dyn Signer>>,
}

/// Produces and uses the device's signing identity.
pub struct KeyManager {
    store: Arc<dyn KeyValueStore>,
    registry: Arc<dyn KeyRegistry>,
    native: Option<Arc<dyn NativeKeyCapability>>,
    identity: RwLock<Option<LoadedIdentity>>,
}

impl KeyManager {
    /// Create a key manager backed by `store` for key persistence and
    /// `registry` for remote key validation.
    pub fn new(store: Arc<dyn KeyValueStore>, registry: Arc<dyn KeyRegistry>) -> Self {
        Self {
            store,
            registry,
            native: None,
            identity: RwLock::new(None),
        }
    }

    /// Enable the platform key store as the preferred signer.
    pub fn with_native_capability(mut self, capability: Arc<dyn NativeKeyCapability>) -> Self {
        self.native = Some(capability);
        self
    }

    /// Generate a new hybrid key, replacing any existing one.
    ///
    /// The software key is always created. The native key is best effort:
    /// any failure is logged and the identity falls back to software only.
    pub async fn generate_key_pair(&self) -> Result<HybridPublicKey> {
        let software = SoftwareSigner::generate();
        let native = self.native.as_ref().and_then(|cap| Self::try_native(cap.as_ref()));

        let stored = StoredHybridKey {
            software_secret: software.secret_bytes().to_vec(),
            native: native.clone(),
            created_at: Utc::now(),
        };
        let json = Zeroizing::new(serde_json::to_string(&stored)?);
        self.store.set(HYBRID_KEY_STORAGE_KEY, &json).await?;

        let identity = self.assemble(software, native, stored.created_at);
        let public = identity.public.clone();
        *self.identity.write().await = Some(identity);

        info!(
            native = public.native.is_some(),
            "Generated hybrid signing key"
        );
        Ok(public)
    }

    /// Load the persisted identity, if one exists.
    pub async fn load(&self) -> Result<Option<HybridPublicKey>> {
        let Some(json) = self.store.get(HYBRID_KEY_STORAGE_KEY).await? else {
            return Ok(None);
        };
        let json = Zeroizing::new(json);
        let stored: StoredHybridKey = serde_json::from_str(&json)?;
        let software = SoftwareSigner::from_secret(&stored.software_secret)?;

        let identity = self.assemble(software, stored.native.clone(), stored.created_at);
        let public = identity.public.clone();
        *self.identity.write().await = Some(identity);

        debug!("Loaded hybrid signing key");
        Ok(Some(public))
    }

    /// Load the persisted identity or generate one on first use.
    pub async fn load_or_generate(&self) -> Result<HybridPublicKey> {
        self.provision(false).await.map(|provisioned| provisioned.public)
    }

    /// Make sure an identity exists, generating one when none is stored or
    /// `rotate` is set.
    pub async fn provision(&self, rotate: bool) -> Result<ProvisionedKey> {
        if !rotate {
            if let Some(public) = self.load().await? {
                return Ok(ProvisionedKey {
                    public,
                    generated: false,
                });
            }
        }
        Ok(ProvisionedKey {
            public: self.generate_key_pair().await?,
            generated: true,
        })
    }

    /// Public half of the current identity.
    pub async fn public_key(&self) -> Option<HybridPublicKey> {
        self.identity
            .read()
            .await
            .as_ref()
            .map(|identity| identity.public.clone())
    }

    /// Sign `data` with the first available signer that succeeds.
    pub async fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        self.ensure_loaded().await?;

        let guard = self.identity.read().await;
        let identity = guard.as_ref().ok_or(CryptoError::KeyNotInitialized)?;

        for signer in identity.signers.iter().filter(|s| s.is_available()) {
            match signer.sign(data) {
                Ok(signature) => return Ok(signature),
                Err(e) => warn!(
                    algorithm = ?signer.algorithm(),
                    "Signer failed, falling back: {}", e
                ),
            }
        }

        Err(CryptoError::NoSignerAvailable.into())
    }

    /// Verify a signature in software against `public_key`.
    pub fn verify(&self, signature: &[u8], data: &[u8], public_key: &PublicKey) -> bool {
        verify_signature(public_key, data, signature)
    }

    /// Ask the remote registry whether `public_key` is a recognized device key.
    pub async fn validate_key(&self, public_key: &PublicKey) -> Result<bool> {
        self.registry.validate_key(public_key).await
    }

    async fn ensure_loaded(&self) -> Result<()> {
        if self.identity.read().await.is_some() {
            return Ok(());
        }
        match self.load().await? {
            Some(_) => Ok(()),
            None => Err(CryptoError::KeyNotInitialized.into()),
        }
    }

    fn try_native(capability: &dyn NativeKeyCapability) -> Option<NativeKeyRef> {
        if !capability.is_available() {
            debug!("Native key store not available, using software key only");
            return None;
        }
        match capability.generate_key_pair(NATIVE_KEY_ALIAS) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!("Native key generation failed, using software key only: {}", e);
                None
            }
        }
    }

    fn assemble(
        &self,
        software: SoftwareSigner,
        native: Option<NativeKeyRef>,
        created_at: DateTime<Utc>,
    ) -> LoadedIdentity {
        let native_public = native
            .as_ref()
            .map(|key| PublicKey::new(SignatureAlgorithm::Ed25519, key.public_key.clone()));

        let mut signers: Vec<Box<dyn Signer>> = Vec::with_capacity(2);
        if let (Some(capability), Some(key)) = (&self.native, native) {
            signers.push(Box::new(NativeSigner::new(Arc::clone(capability), key)));
        }
        let software_public = software.public_key();
        signers.push(Box::new(software));

        LoadedIdentity {
            public: HybridPublicKey {
                software: software_public,
                native: native_public,
                created_at,
            },
            signers,
        }
    }
}
