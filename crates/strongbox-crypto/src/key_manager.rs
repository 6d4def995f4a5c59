//! Key manager - one key per installation
//!
//! "Not found" and "generate" happen inside one critical section. Two
//! concurrent first callers would otherwise each generate a key, and the
//! records sealed under the loser's key would be orphaned.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::keystore::{Keystore, KeystoreError};
use crate::{CryptoError, EncryptionKey, Result};

pub struct KeyManager {
    keystore: Box<dyn Keystore>,
    /// Key handle cached after the first successful load; `lock()` drops it
    cached: Mutex<Option<Arc<EncryptionKey>>>,
    generated: AtomicUsize,
}

impl KeyManager {
    pub fn new(keystore: Box<dyn Keystore>) -> Self {
        Self {
            keystore,
            cached: Mutex::new(None),
            generated: AtomicUsize::new(0),
        }
    }

    /// Return the installation key, creating and saving it on first use.
    pub fn get_or_create_key(&self) -> Result<Arc<EncryptionKey>> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| CryptoError::KeyUnavailable("key manager poisoned".to_string()))?;

        if let Some(key) = cached.as_ref() {
            return Ok(Arc::clone(key));
        }

        let key = match self.keystore.load() {
            Ok(Some(material)) => EncryptionKey::from_slice(&material).map_err(|e| {
                // Replacing an unreadable key would orphan every record
                error!("Keystore entry has unexpected shape: {}", e);
                CryptoError::KeyUnavailable("keystore entry is malformed".to_string())
            })?,
            Ok(None) => self.create_key()?,
            Err(KeystoreError::Locked) => {
                warn!("Keystore locked, encryption key unavailable");
                return Err(CryptoError::KeyUnavailable("keystore is locked".to_string()));
            }
            Err(e) => return Err(CryptoError::KeyUnavailable(e.to_string())),
        };

        let key = Arc::new(key);
        *cached = Some(Arc::clone(&key));
        Ok(key)
    }

    fn create_key(&self) -> Result<EncryptionKey> {
        let key = EncryptionKey::generate()?;
        self.keystore.save(key.as_bytes()).map_err(|e| match e {
            KeystoreError::Locked => {
                CryptoError::KeyUnavailable("keystore is locked".to_string())
            }
            other => {
                error!("Failed to persist new encryption key: {}", other);
                CryptoError::KeystoreWriteFailed(other.to_string())
            }
        })?;
        self.generated.fetch_add(1, Ordering::SeqCst);
        info!("Generated new installation encryption key");
        Ok(key)
    }

    /// Drop the in-memory key handle. The next operation re-reads the keystore.
    pub fn lock(&self) {
        if let Ok(mut cached) = self.cached.lock() {
            if cached.take().is_some() {
                debug!("Encryption key handle released");
            }
        }
    }

    /// Whether a key handle is currently held in memory
    pub fn is_unlocked(&self) -> bool {
        self.cached.lock().map(|c| c.is_some()).unwrap_or(false)
    }

    /// Delete the keystore entry. Every record sealed under it becomes unreadable.
    pub fn destroy_key(&self) -> Result<()> {
        let mut cached = self
            .cached
            .lock()
            .map_err(|_| CryptoError::KeyUnavailable("key manager poisoned".to_string()))?;
        self.keystore.delete().map_err(|e| match e {
            KeystoreError::Locked => {
                CryptoError::KeyUnavailable("keystore is locked".to_string())
            }
            other => CryptoError::KeystoreWriteFailed(other.to_string()),
        })?;
        *cached = None;
        warn!("Installation encryption key destroyed");
        Ok(())
    }

    /// Number of keys this manager has generated
    pub fn generated_keys(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }
}
