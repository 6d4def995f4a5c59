//! ChaCha20-Poly1305 record sealing
//!
//! Every call to [`seal`] draws a fresh 96-bit nonce from the OS CSPRNG and
//! prepends it to the output, so a sealed record carries everything needed
//! to open it except the key. The logical record key goes in as associated
//! data: a record copied under another name fails to open.

use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    ChaCha20Poly1305, Nonce,
};
use zeroize::Zeroizing;

use crate::{CryptoError, EncryptionKey, Result};

/// 96-bit nonce (12 bytes)
pub const NONCE_SIZE: usize = 12;
/// Poly1305 tag (16 bytes)
pub const TAG_SIZE: usize = 16;

/// Seal plaintext under `key`, binding `aad`.
///
/// Returns: nonce || ciphertext || tag
pub fn seal(key: &EncryptionKey, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes()).map_err(|_| {
        CryptoError::InvalidKeySize {
            expected: crate::key::KEY_SIZE,
            actual: key.as_bytes().len(),
        }
    })?;

    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(nonce.as_slice());
    sealed.extend_from_slice(&ciphertext);

    Ok(sealed)
}

/// Open a record produced by [`seal`].
///
/// Expects: nonce || ciphertext || tag
pub fn open(key: &EncryptionKey, aad: &[u8], sealed: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CryptoError::DecryptionFailed);
    }

    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes())
        .map_err(|_| CryptoError::DecryptionFailed)?;

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);

    let plaintext = cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::DecryptionFailed)?;

    Ok(Zeroizing::new(plaintext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = EncryptionKey::generate().unwrap();
        let plaintext = b"selected_model=gemma-3n";

        let sealed = seal(&key, b"model", plaintext).unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + plaintext.len() + TAG_SIZE);
        assert_ne!(&sealed[NONCE_SIZE..NONCE_SIZE + plaintext.len()], plaintext);

        let opened = open(&key, b"model", &sealed).unwrap();
        assert_eq!(opened.as_slice(), plaintext);
    }

    #[test]
    fn test_nonce_is_fresh_per_call() {
        let key = EncryptionKey::generate().unwrap();

        let a = seal(&key, b"k", b"same plaintext").unwrap();
        let b = seal(&key, b"k", b"same plaintext").unwrap();

        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = EncryptionKey::generate().unwrap();
        let mut sealed = seal(&key, b"k", b"secret data").unwrap();

        sealed[NONCE_SIZE] ^= 0x01;

        assert!(matches!(
            open(&key, b"k", &sealed),
            Err(CryptoError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_wrong_key_fails() {
        let key1 = EncryptionKey::generate().unwrap();
        let key2 = EncryptionKey::generate().unwrap();

        let sealed = seal(&key1, b"k", b"secret data").unwrap();

        assert!(open(&key2, b"k", &sealed).is_err());
    }

    #[test]
    fn test_associated_data_is_bound() {
        let key = EncryptionKey::generate().unwrap();
        let sealed = seal(&key, b"language", b"\"english\"").unwrap();

        assert!(open(&key, b"transcript", &sealed).is_err());
    }

    #[test]
    fn test_truncated_input_fails() {
        let key = EncryptionKey::generate().unwrap();
        assert!(open(&key, b"k", &[0u8; NONCE_SIZE]).is_err());
        assert!(open(&key, b"k", &[]).is_err());
    }
}
