//! Record encryption key
//!
//! Key material is wrapped in `Zeroizing<>` so it's scrubbed from memory
//! on drop. The `Debug` impl never prints bytes.

use ring::rand::{SecureRandom, SystemRandom};
use std::fmt;
use zeroize::Zeroizing;

use crate::{CryptoError, Result};

/// 256-bit key (32 bytes)
pub const KEY_SIZE: usize = 32;

pub struct EncryptionKey {
    bytes: Zeroizing<[u8; KEY_SIZE]>,
}

impl EncryptionKey {
    /// Generate a fresh key from the system CSPRNG
    pub fn generate() -> Result<Self> {
        let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
        SystemRandom::new()
            .fill(bytes.as_mut())
            .map_err(|_| CryptoError::KeyGenerationFailed)?;
        Ok(Self { bytes })
    }

    /// Rebuild a key from keystore material
    pub fn from_slice(material: &[u8]) -> Result<Self> {
        if material.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeySize {
                expected: KEY_SIZE,
                actual: material.len(),
            });
        }
        let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
        bytes.copy_from_slice(material);
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.bytes.as_ref()
    }
}

impl fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}
