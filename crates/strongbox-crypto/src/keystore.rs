//! Secure keystore backends
//!
//! The keystore is the only place the record key exists at rest.
//! Implementations must keep the entry local to this device: no sync,
//! no export, available only while the device is unlocked.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum KeystoreError {
    #[error("Keystore is locked")]
    Locked,
    #[error("Keystore write failed: {0}")]
    Write(String),
    #[error("Platform error: {0}")]
    Platform(String),
}

/// Storage boundary for the record key
pub trait Keystore: Send + Sync {
    /// Load the key material, `None` when no entry exists yet
    fn load(&self) -> Result<Option<Zeroizing<Vec<u8>>>, KeystoreError>;

    /// Create or replace the entry
    fn save(&self, material: &[u8]) -> Result<(), KeystoreError>;

    /// Delete the entry; deleting a missing entry is not an error
    fn delete(&self) -> Result<(), KeystoreError>;
}

impl<K: Keystore + ?Sized> Keystore for std::sync::Arc<K> {
    fn load(&self) -> Result<Option<Zeroizing<Vec<u8>>>, KeystoreError> {
        (**self).load()
    }

    fn save(&self, material: &[u8]) -> Result<(), KeystoreError> {
        (**self).save(material)
    }

    fn delete(&self) -> Result<(), KeystoreError> {
        (**self).delete()
    }
}

const KEY_ACCOUNT: &str = "encryption_key";

/// OS keychain backend (macOS Keychain, Secret Service, Windows Credential Manager)
pub struct KeychainKeystore {
    service_name: String,
}

impl KeychainKeystore {
    pub fn new(service_name: &str) -> Self {
        Self { service_name: service_name.to_string() }
    }

    fn entry(&self) -> Result<keyring::Entry, KeystoreError> {
        keyring::Entry::new(&self.service_name, KEY_ACCOUNT).map_err(map_keyring_error)
    }
}

fn map_keyring_error(e: keyring::Error) -> KeystoreError {
    match e {
        keyring::Error::NoStorageAccess(_) => KeystoreError::Locked,
        other => KeystoreError::Platform(other.to_string()),
    }
}

impl Keystore for KeychainKeystore {
    fn load(&self) -> Result<Option<Zeroizing<Vec<u8>>>, KeystoreError> {
        let encoded = match self.entry()?.get_password() {
            Ok(encoded) => Zeroizing::new(encoded),
            Err(keyring::Error::NoEntry) => return Ok(None),
            Err(e) => return Err(map_keyring_error(e)),
        };
        decode_hex(&encoded).map(Some)
    }

    fn save(&self, material: &[u8]) -> Result<(), KeystoreError> {
        let encoded = Zeroizing::new(material.iter().map(|b| format!("{:02x}", b)).collect::<String>());
        self.entry()?
            .set_password(&encoded)
            .map_err(|e| match e {
                keyring::Error::NoStorageAccess(_) => KeystoreError::Locked,
                other => KeystoreError::Write(other.to_string()),
            })
    }

    fn delete(&self) -> Result<(), KeystoreError> {
        match self.entry()?.delete_password() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(map_keyring_error(e)),
        }
    }
}

fn decode_hex(encoded: &str) -> Result<Zeroizing<Vec<u8>>, KeystoreError> {
    if encoded.len() % 2 != 0 || !encoded.is_ascii() {
        return Err(KeystoreError::Platform("malformed key entry".to_string()));
    }
    let bytes = (0..encoded.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&encoded[i..i + 2], 16)
                .map_err(|_| KeystoreError::Platform("malformed key entry".to_string()))
        })
        .collect::<Result<Vec<u8>, _>>()?;
    Ok(Zeroizing::new(bytes))
}

/// In-process keystore for tests and ephemeral sessions.
///
/// `lock()` simulates a device that has not been unlocked since boot;
/// `fail_writes(true)` simulates a keystore that rejects new entries.
#[derive(Default)]
pub struct MemoryKeystore {
    material: Mutex<Option<Zeroizing<Vec<u8>>>>,
    locked: AtomicBool,
    fail_writes: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryKeystore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) {
        self.locked.store(true, Ordering::SeqCst);
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `save` calls
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn check_unlocked(&self) -> Result<(), KeystoreError> {
        if self.locked.load(Ordering::SeqCst) {
            Err(KeystoreError::Locked)
        } else {
            Ok(())
        }
    }
}

impl Keystore for MemoryKeystore {
    fn load(&self) -> Result<Option<Zeroizing<Vec<u8>>>, KeystoreError> {
        self.check_unlocked()?;
        let guard = self.material.lock().map_err(|e| KeystoreError::Platform(e.to_string()))?;
        Ok(guard.as_ref().map(|m| Zeroizing::new(m.to_vec())))
    }

    fn save(&self, material: &[u8]) -> Result<(), KeystoreError> {
        self.check_unlocked()?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(KeystoreError::Write("write rejected".to_string()));
        }
        let mut guard = self.material.lock().map_err(|e| KeystoreError::Platform(e.to_string()))?;
        *guard = Some(Zeroizing::new(material.to_vec()));
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self) -> Result<(), KeystoreError> {
        self.check_unlocked()?;
        let mut guard = self.material.lock().map_err(|e| KeystoreError::Platform(e.to_string()))?;
        *guard = None;
        Ok(())
    }
}
