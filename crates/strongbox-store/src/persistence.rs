//! Encrypted persistence layer
//!
//! encode -> seal -> substrate on the way down, the reverse on the way up.
//! Records live under `namespace + key` and carry the logical key as AEAD
//! associated data.
//!
//! Read-side policy: a record that exists but cannot be opened (tampered,
//! foreign key after a keystore reset) or decoded (malformed, older layout
//! version) is reported as absent and logged. Callers treat "never stored"
//! and "unreadable" the same way. Key unavailability is not swallowed.

use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use strongbox_crypto::{cipher, KeyManager};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::codec::Codec;
use crate::substrate::Substrate;
use crate::Result;

pub struct EncryptedPersistence {
    keys: Arc<KeyManager>,
    substrate: Box<dyn Substrate>,
    codec: Codec,
    namespace: String,
}

impl EncryptedPersistence {
    pub fn new(keys: Arc<KeyManager>, substrate: Box<dyn Substrate>, namespace: impl Into<String>) -> Self {
        Self {
            keys,
            substrate,
            codec: Codec::current(),
            namespace: namespace.into(),
        }
    }

    /// Use a specific codec version (layout migrations, tests)
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn key_manager(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    fn record_key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    /// Encode, seal under a fresh nonce, and write the record for `key`
    pub fn store<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let encoded = Zeroizing::new(self.codec.encode(value)?);
        self.store_encoded(key, &encoded)
    }

    /// Seal and write bytes that are already codec-encoded
    pub fn store_encoded(&self, key: &str, encoded: &[u8]) -> Result<()> {
        let enc_key = self.keys.get_or_create_key()?;
        let sealed = cipher::seal(&enc_key, key.as_bytes(), encoded)?;
        self.substrate.put(&self.record_key(key), &sealed)?;
        debug!("Stored record {} ({} bytes sealed)", key, sealed.len());
        Ok(())
    }

    /// Read, open and decode the record for `key`
    pub fn retrieve<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(sealed) = self.substrate.get(&self.record_key(key))? else {
            return Ok(None);
        };

        let enc_key = self.keys.get_or_create_key()?;

        let encoded = match cipher::open(&enc_key, key.as_bytes(), &sealed) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("Record {} unreadable ({} bytes): {}", key, sealed.len(), e);
                return Ok(None);
            }
        };

        match self.codec.decode::<T>(&encoded) {
            Ok(value) => {
                debug!("Retrieved record {} ({} bytes)", key, encoded.len());
                Ok(Some(value))
            }
            Err(e) => {
                warn!("Record {} not decodable ({} bytes): {}", key, encoded.len(), e);
                Ok(None)
            }
        }
    }

    /// Whether a record exists, without opening it
    pub fn contains(&self, key: &str) -> Result<bool> {
        Ok(self.substrate.get(&self.record_key(key))?.is_some())
    }

    /// Delete the record for `key`. Idempotent.
    pub fn remove(&self, key: &str) -> Result<()> {
        if self.substrate.delete(&self.record_key(key))? {
            debug!("Removed record {}", key);
        }
        Ok(())
    }

    /// Logical key names of every record in this namespace
    pub fn keys(&self) -> Result<Vec<String>> {
        Ok(self
            .substrate
            .keys_with_prefix(&self.namespace)?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.namespace).map(str::to_string))
            .collect())
    }

    /// Delete every record in this namespace
    pub fn clear_all(&self) -> Result<usize> {
        self.purge_except(&[])
    }

    /// Delete every record in this namespace except the listed logical keys
    pub fn purge_except(&self, keep: &[&str]) -> Result<usize> {
        let mut removed = 0;
        for key in self.keys()? {
            if keep.contains(&key.as_str()) {
                continue;
            }
            if self.substrate.delete(&self.record_key(&key))? {
                removed += 1;
            }
        }
        info!("Purged {} records from namespace {:?} (kept {})", removed, self.namespace, keep.len());
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::MemorySubstrate;
    use crate::StoreError;
    use strongbox_crypto::MemoryKeystore;

    fn layer() -> (EncryptedPersistence, Arc<MemorySubstrate>, Arc<MemoryKeystore>) {
        let keystore = Arc::new(MemoryKeystore::new());
        let substrate = Arc::new(MemorySubstrate::new());
        let keys = Arc::new(KeyManager::new(Box::new(Arc::clone(&keystore))));
        let layer = EncryptedPersistence::new(keys, Box::new(Arc::clone(&substrate)), "secure_");
        (layer, substrate, keystore)
    }

    #[test]
    fn test_store_retrieve_roundtrip() {
        let (layer, substrate, _) = layer();
        layer.store("language", "english").unwrap();

        assert_eq!(layer.retrieve::<String>("language").unwrap(), Some("english".to_string()));
        assert!(substrate.raw_get("secure_language").is_some());
    }

    #[test]
    fn test_missing_record_is_none() {
        let (layer, _, _) = layer();
        assert_eq!(layer.retrieve::<String>("nothing").unwrap(), None);
    }

    #[test]
    fn test_plaintext_never_reaches_substrate() {
        let (layer, substrate, _) = layer();
        let secret = "user asked about their medical history";
        layer.store("transcript", secret).unwrap();

        let raw = substrate.raw_dump();
        assert!(!raw.windows(secret.len()).any(|w| w == secret.as_bytes()));
    }

    #[test]
    fn test_tampered_record_is_none() {
        let (layer, substrate, _) = layer();
        layer.store("count", &41u32).unwrap();

        assert!(substrate.corrupt("secure_count", cipher::NONCE_SIZE + 1));
        assert_eq!(layer.retrieve::<u32>("count").unwrap(), None);
    }

    #[test]
    fn test_record_moved_to_other_key_is_none() {
        let (layer, substrate, _) = layer();
        layer.store("a", "alpha").unwrap();
        let blob = substrate.raw_get("secure_a").unwrap();
        substrate.raw_put("secure_b", blob);

        assert_eq!(layer.retrieve::<String>("b").unwrap(), None);
    }

    #[test]
    fn test_version_drift_is_none() {
        let (layer, substrate, keystore) = layer();
        layer.store("mode", "dark").unwrap();

        let keys = Arc::new(KeyManager::new(Box::new(Arc::clone(&keystore))));
        let newer = EncryptedPersistence::new(keys, Box::new(Arc::clone(&substrate)), "secure_")
            .with_codec(Codec::new(layer.codec().version() + 1));

        assert_eq!(newer.retrieve::<String>("mode").unwrap(), None);
    }

    #[test]
    fn test_locked_keystore_propagates() {
        let (layer, _, keystore) = layer();
        keystore.lock();
        assert!(matches!(layer.store("k", &1u8), Err(StoreError::KeyUnavailable(_))));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let (layer, _, _) = layer();
        layer.store("k", &1u8).unwrap();
        layer.remove("k").unwrap();
        layer.remove("k").unwrap();
        assert_eq!(layer.retrieve::<u8>("k").unwrap(), None);
    }

    #[test]
    fn test_clear_all_scoped_to_namespace() {
        let (layer, substrate, _) = layer();
        layer.store("a", &1u8).unwrap();
        layer.store("b", &2u8).unwrap();
        substrate.raw_put("foreign_c", vec![1, 2, 3]);

        assert_eq!(layer.keys().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(layer.clear_all().unwrap(), 2);
        assert!(layer.keys().unwrap().is_empty());
        assert!(substrate.raw_get("foreign_c").is_some());
    }

    #[test]
    fn test_purge_except_keeps_listed() {
        let (layer, _, _) = layer();
        layer.store("selected_llm_model", "gemma").unwrap();
        layer.store("transcript", "hello").unwrap();

        assert_eq!(layer.purge_except(&["selected_llm_model"]).unwrap(), 1);
        assert!(layer.contains("selected_llm_model").unwrap());
        assert!(!layer.contains("transcript").unwrap());
    }
}
