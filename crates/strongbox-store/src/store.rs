//! SecureStore - the public store handle
//!
//! Ties the cache, the write coalescer and encrypted persistence together.
//! Reads go cache, then pending batch, then disk. Every write is staged in
//! the batch and mirrored into the cache under the batch lock, so the cache
//! and the eventual disk state follow the same order of writes. A caller
//! always reads back its own last write, whether or not it has reached disk.
//!
//! Fills from the batch or disk are conditional: each mutation bumps a
//! counter before it touches anything, and a fill only lands if the
//! counter is unchanged since the read began.

use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use strongbox_crypto::KeyManager;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::cache::{AdaptiveCache, CacheStats, DeviceProfile, ThermalState};
use crate::coalescer::{FlushTask, WriteCoalescer};
use crate::config::StoreConfig;
use crate::persistence::EncryptedPersistence;
use crate::substrate::Substrate;
use crate::{Result, StoreError};

/// Values the store can hold: serialisable for disk, cloneable for the cache
pub trait StoreValue: Serialize + DeserializeOwned + Any + Clone + Send + Sync {}

impl<T> StoreValue for T where T: Serialize + DeserializeOwned + Any + Clone + Send + Sync {}

pub struct SecureStore {
    config: StoreConfig,
    keys: Arc<KeyManager>,
    cache: AdaptiveCache,
    persistence: Arc<EncryptedPersistence>,
    coalescer: Arc<WriteCoalescer>,
    device: Mutex<DeviceProfile>,
    mutations: AtomicU64,
}

impl SecureStore {
    /// Open a store over `substrate`, sizing the cache from the current device
    pub fn open(config: StoreConfig, keys: Arc<KeyManager>, substrate: Box<dyn Substrate>) -> Result<Self> {
        Self::open_with_profile(config, keys, substrate, DeviceProfile::probe())
    }

    pub fn open_with_profile(
        config: StoreConfig,
        keys: Arc<KeyManager>,
        substrate: Box<dyn Substrate>,
        profile: DeviceProfile,
    ) -> Result<Self> {
        config.validate()?;

        let persistence = Arc::new(EncryptedPersistence::new(
            Arc::clone(&keys),
            substrate,
            config.namespace.clone(),
        ));
        let cache = AdaptiveCache::new(
            profile.cache_capacity(),
            config.cache_ttl(),
            config.eviction_load_factor,
        );
        let coalescer = Arc::new(WriteCoalescer::new(Arc::clone(&persistence)));

        info!(
            "Opened secure store (namespace {:?}, cache capacity {})",
            config.namespace,
            cache.capacity()
        );

        Ok(Self {
            config,
            keys,
            cache,
            persistence,
            coalescer,
            device: Mutex::new(profile),
            mutations: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn persistence(&self) -> &Arc<EncryptedPersistence> {
        &self.persistence
    }

    pub fn key_manager(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    fn begin_mutation(&self) {
        self.mutations.fetch_add(1, Ordering::SeqCst);
    }

    fn stage_value<T: StoreValue>(&self, value: &T, key: &str) -> Result<()> {
        let encoded = Zeroizing::new(self.persistence.codec().encode(value)?);
        self.begin_mutation();
        self.coalescer
            .stage_with(key, encoded, || self.cache.put(key, value.clone()));
        Ok(())
    }

    /// Write `value` under `key` and persist it before returning.
    ///
    /// If the disk write fails the error is returned and the value stays
    /// queued; the next flush retries it. Reads keep returning it meanwhile.
    pub fn store<T: StoreValue>(&self, value: &T, key: &str) -> Result<()> {
        self.stage_value(value, key)?;
        self.coalescer.flush_key(key).map(|_| ())
    }

    /// Write `value` under `key`; with `deferred` the disk write joins the
    /// next batch flush instead of happening now
    pub fn store_deferred<T: StoreValue>(&self, value: &T, key: &str, deferred: bool) -> Result<()> {
        if !deferred {
            return self.store(value, key);
        }
        self.stage_value(value, key)
    }

    /// Read `key`. Unreadable records come back as `None`.
    pub fn retrieve<T: StoreValue>(&self, key: &str) -> Result<Option<T>> {
        let seen = self.mutations.load(Ordering::SeqCst);

        if let Some(value) = self.cache.get::<T>(key) {
            return Ok(Some(value));
        }

        if let Some(encoded) = self.coalescer.pending_value(key) {
            return match self.persistence.codec().decode::<T>(&encoded) {
                Ok(value) => {
                    self.fill(key, &value, seen);
                    Ok(Some(value))
                }
                Err(e) => {
                    warn!("Pending value for {} not decodable as requested type: {}", key, e);
                    Ok(None)
                }
            };
        }

        let value = self.persistence.retrieve::<T>(key)?;
        if let Some(ref v) = value {
            self.fill(key, v, seen);
        }
        Ok(value)
    }

    fn fill<T: StoreValue>(&self, key: &str, value: &T, seen: u64) {
        self.cache.put_if(key, value.clone(), || {
            self.mutations.load(Ordering::SeqCst) == seen
        });
    }

    /// Forget `key` everywhere: cache, pending batch and disk
    pub fn remove(&self, key: &str) -> Result<()> {
        self.begin_mutation();
        self.coalescer.discard(key, || {
            self.cache.invalidate(key);
        })
    }

    /// Remove every value in this store's namespace
    pub fn clear_all(&self) -> Result<usize> {
        self.begin_mutation();
        let removed = self.coalescer.discard_all(|| self.cache.clear())?;
        info!("Cleared secure store ({} records)", removed);
        Ok(removed)
    }

    /// Remove every value except the listed keys. The cache is emptied.
    pub fn purge_except(&self, keep: &[&str]) -> Result<usize> {
        self.begin_mutation();
        self.coalescer.discard_except(keep, || self.cache.clear())
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys = self.persistence.keys()?;
        for key in self.coalescer.pending_keys() {
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    pub fn clear_expired_cache_entries(&self) -> usize {
        self.cache.purge_expired()
    }

    /// Persist all deferred writes now
    pub fn flush(&self) -> Result<usize> {
        self.coalescer.flush()
    }

    pub fn pending_writes(&self) -> usize {
        self.coalescer.pending_len()
    }

    /// Start the timed flush on the current tokio runtime
    pub fn start_background_flush(&self) -> Result<FlushTask> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| StoreError::Config(format!("background flush needs a tokio runtime: {}", e)))?;
        Ok(self.coalescer.spawn_timer(self.config.flush_interval()))
    }

    pub fn device_profile(&self) -> DeviceProfile {
        *self.device.lock()
    }

    /// Thermal state changed. Capacity shrinks or grows on the next insert.
    pub fn on_thermal_change(&self, thermal: ThermalState) {
        let mut device = self.device.lock();
        *device = device.with_thermal(thermal);
        self.cache.apply_profile(&device);
        debug!("Thermal state {:?}, cache capacity {}", thermal, self.cache.capacity());
    }

    /// Memory figures changed. The current thermal state is kept.
    pub fn on_memory_profile(&self, profile: DeviceProfile) {
        let mut device = self.device.lock();
        *device = profile.with_thermal(device.thermal);
        self.cache.apply_profile(&device);
        debug!("Memory profile updated, cache capacity {}", self.cache.capacity());
    }

    /// Follow device profile updates published on a watch channel.
    ///
    /// The task ends when the sender is dropped or the store is dropped.
    pub fn subscribe_device(self: &Arc<Self>, mut updates: watch::Receiver<DeviceProfile>) -> JoinHandle<()> {
        let store: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let profile = *updates.borrow_and_update();
                let Some(store) = store.upgrade() else {
                    break;
                };
                *store.device.lock() = profile;
                store.cache.apply_profile(&profile);
                debug!("Device profile update, cache capacity {}", store.cache.capacity());
            }
        })
    }

    /// Drop decrypted state from memory and lock the key.
    ///
    /// Deferred writes are flushed first. Writes that cannot be flushed
    /// (keystore already locked) stay queued, zeroized on drop, and are
    /// retried by the timer or the next flush. Returns how many are still
    /// waiting.
    pub fn security_wipe(&self) -> usize {
        self.begin_mutation();
        if let Err(e) = self.coalescer.flush() {
            warn!("Flush before security wipe failed, writes kept for retry: {}", e);
        }
        self.cache.clear();
        self.keys.lock();
        let waiting = self.coalescer.pending_len();
        info!("Security wipe complete ({} writes awaiting unlock)", waiting);
        waiting
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

impl Drop for SecureStore {
    fn drop(&mut self) {
        self.coalescer.request_shutdown();
        if self.coalescer.pending_len() > 0 {
            if let Err(e) = self.coalescer.flush() {
                warn!("Flush on close failed: {}", e);
            }
        }
    }
}
