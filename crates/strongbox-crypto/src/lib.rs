//! Strongbox Crypto - key lifecycle and record sealing
//!
//! This crate provides:
//! - A 256-bit record key that never outlives its keystore entry
//! - Keystore backends (OS keychain, in-memory)
//! - A key manager with atomic get-or-create
//! - ChaCha20-Poly1305 sealing with per-record associated data

pub mod cipher;
pub mod key;
pub mod key_manager;
pub mod keystore;

pub use key::EncryptionKey;
pub use key_manager::KeyManager;
pub use keystore::{KeychainKeystore, Keystore, KeystoreError, MemoryKeystore};

/// Errors that can occur in key management and cryptographic operations
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Encryption key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("Key generation failed")]
    KeyGenerationFailed,

    #[error("Could not persist a new key to the keystore: {0}")]
    KeystoreWriteFailed(String),

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed - data may be corrupted or tampered")]
    DecryptionFailed,

    #[error("Invalid key size: expected {expected}, got {actual}")]
    InvalidKeySize { expected: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, CryptoError>;
