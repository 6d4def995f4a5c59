use strongbox_crypto::CryptoError;
use thiserror::Error;

use crate::codec::DecodeError;
use crate::substrate::SubstrateError;

/// Errors surfaced by the store.
///
/// Only "cannot proceed" failures reach callers. Records that exist but
/// cannot be opened or decoded come back as `Ok(None)` instead.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Encryption key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("Key generation failed")]
    KeyGenerationFailed,

    #[error("Keystore write failed: {0}")]
    KeystoreWriteFailed(String),

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Substrate error: {0}")]
    Substrate(#[from] SubstrateError),

    #[error("Flush incomplete: {failed} of {attempted} writes re-queued")]
    FlushIncomplete { attempted: usize, failed: usize },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<CryptoError> for StoreError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::KeyUnavailable(reason) => Self::KeyUnavailable(reason),
            CryptoError::KeyGenerationFailed => Self::KeyGenerationFailed,
            CryptoError::KeystoreWriteFailed(reason) => Self::KeystoreWriteFailed(reason),
            CryptoError::EncryptionFailed => Self::EncryptionFailed,
            CryptoError::DecryptionFailed => Self::DecryptionFailed,
            CryptoError::InvalidKeySize { .. } => {
                Self::KeyUnavailable("key material has the wrong size".to_string())
            }
        }
    }
}

impl StoreError {
    /// Whether retrying later (e.g. after device unlock) can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::KeyUnavailable(_) | Self::Substrate(_) | Self::FlushIncomplete { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
