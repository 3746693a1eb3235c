//! Session key material and its one-time provisioning.

use std::fmt;
use std::sync::Arc;

use base64::Engine;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// CBC initialization vector length in bytes.
pub const IV_LEN: usize = 16;

/// Symmetric key bytes; the length selects the AES variant.
#[derive(Clone, PartialEq, Eq)]
pub(crate) enum KeyBytes {
    Aes128([u8; 16]),
    Aes256([u8; 32]),
}

/// A symmetric key and initialization vector pair.
///
/// The `Debug` output never includes key bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    key: KeyBytes,
    iv: [u8; IV_LEN],
}

impl KeyMaterial {
    /// Build key material from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKeyMaterial`] unless the key is 16 or 32 bytes
    /// and the IV is 16 bytes.
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        let key = match key.len() {
            16 => {
                let mut k = [0u8; 16];
                k.copy_from_slice(key);
                KeyBytes::Aes128(k)
            }
            32 => {
                let mut k = [0u8; 32];
                k.copy_from_slice(key);
                KeyBytes::Aes256(k)
            }
            n => {
                return Err(Error::invalid_key(format!(
                    "key must be 16 or 32 bytes, got {n}"
                )))
            }
        };
        let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| {
            Error::invalid_key(format!("iv must be {IV_LEN} bytes, got {}", iv.len()))
        })?;
        Ok(Self { key, iv })
    }

    /// Build key material from base64-encoded key and IV.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidKeyMaterial`] if either value is not valid
    /// base64 or decodes to the wrong length.
    pub fn from_base64(key: &str, iv: &str) -> Result<Self> {
        let engine = base64::engine::general_purpose::STANDARD;
        let key = engine
            .decode(key.trim())
            .map_err(|e| Error::invalid_key(format!("key is not valid base64: {e}")))?;
        let iv = engine
            .decode(iv.trim())
            .map_err(|e| Error::invalid_key(format!("iv is not valid base64: {e}")))?;
        Self::new(&key, &iv)
    }

    /// Generate fresh random key material.
    ///
    /// # Errors
    ///
    /// Returns an error if the operating system RNG is unavailable.
    pub fn generate(aes256: bool) -> Result<Self> {
        let mut key = vec![0u8; if aes256 { 32 } else { 16 }];
        let mut iv = [0u8; IV_LEN];
        getrandom::getrandom(&mut key)
            .and_then(|()| getrandom::getrandom(&mut iv))
            .map_err(|e| Error::internal(format!("failed to generate random key: {e}")))?;
        Self::new(&key, &iv)
    }

    /// Key bytes as standard base64.
    #[must_use]
    pub fn key_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.key_bytes())
    }

    /// IV bytes as standard base64.
    #[must_use]
    pub fn iv_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.iv)
    }

    /// Key size in bits.
    #[must_use]
    pub fn key_bits(&self) -> usize {
        self.key_bytes().len() * 8
    }

    pub(crate) fn key(&self) -> &KeyBytes {
        &self.key
    }

    pub(crate) fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    fn key_bytes(&self) -> &[u8] {
        match &self.key {
            KeyBytes::Aes128(k) => k.as_slice(),
            KeyBytes::Aes256(k) => k.as_slice(),
        }
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("cipher", &format_args!("aes-{}-cbc", self.key_bits()))
            .finish_non_exhaustive()
    }
}

/// What a provisioning call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    /// The session moved from absent to provisioned.
    Fresh,
    /// Identical material was already present; nothing changed.
    Unchanged,
}

/// Key material for one pipeline session.
///
/// Starts absent and transitions to provisioned exactly once. Clones share
/// the same state, so the client handoff and the server decryptor each hold
/// a handle rather than reading ambient globals.
#[derive(Debug, Clone)]
pub struct KeySession {
    state: Arc<watch::Sender<Option<Arc<KeyMaterial>>>>,
}

impl KeySession {
    /// Create a session with no key material yet.
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
        }
    }

    /// Create a session that is already provisioned.
    #[must_use]
    pub fn with_material(material: KeyMaterial) -> Self {
        let (state, _) = watch::channel(Some(Arc::new(material)));
        Self {
            state: Arc::new(state),
        }
    }

    /// Deliver key material.
    ///
    /// Re-delivering identical material is a no-op and does not wake anything
    /// waiting on the session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyMismatch`] if different material was provisioned
    /// earlier; the existing material stays in place.
    pub fn provision(&self, material: KeyMaterial) -> Result<Provisioned> {
        let mut outcome = Ok(Provisioned::Fresh);
        self.state.send_if_modified(|current| match current {
            None => {
                *current = Some(Arc::new(material));
                true
            }
            Some(existing) if **existing == material => {
                outcome = Ok(Provisioned::Unchanged);
                false
            }
            Some(_) => {
                outcome = Err(Error::KeyMismatch);
                false
            }
        });

        match &outcome {
            Ok(Provisioned::Fresh) => info!("Key material provisioned"),
            Ok(Provisioned::Unchanged) => debug!("Ignoring duplicate key provisioning"),
            Err(_) => warn!("Rejected key provisioning with different material"),
        }
        outcome
    }

    /// Current key material, if provisioned.
    #[must_use]
    pub fn material(&self) -> Option<Arc<KeyMaterial>> {
        self.state.borrow().clone()
    }

    /// Whether key material has been delivered.
    #[must_use]
    pub fn is_provisioned(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// Watch for the provisioning transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<KeyMaterial>>> {
        self.state.subscribe()
    }

    /// Wait until key material is available.
    pub async fn wait(&self) -> Arc<KeyMaterial> {
        let mut rx = self.subscribe();
        loop {
            if let Some(material) = rx.borrow_and_update().clone() {
                return material;
            }
            // The sender lives as long as `self`, so this cannot close.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for KeySession {
    fn default() -> Self {
        Self::new()
    }
}
