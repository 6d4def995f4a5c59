//! Adaptive in-memory cache
//!
//! Decrypted values keyed by record key and tagged with their Rust type.
//! A lookup with a different type than the one stored is a miss, never an
//! unchecked downcast.
//!
//! Eviction runs when an insert would push the entry count past capacity:
//! 1. drop everything idle longer than the TTL;
//! 2. if still over, evict by `idle / max(1, access_count)` (highest first)
//!    down to `capacity * load_factor`, leaving headroom so single-item
//!    churn does not evict on every insert.
//!
//! Reads share a read lock and bump per-entry atomics; every structural
//! mutation takes the write lock.

pub mod capacity;

pub use capacity::{DeviceProfile, ThermalState, MIN_CAPACITY};

use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Access bookkeeping the eviction pass needs, independent of value type
pub trait AccessStats {
    /// Milliseconds since the cache epoch of the last read or write
    fn last_access_ms(&self) -> u64;
    fn access_count(&self) -> u64;

    fn idle_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_access_ms())
    }

    /// Higher is more evictable
    fn eviction_score(&self, now_ms: u64) -> f64 {
        self.idle_ms(now_ms) as f64 / self.access_count().max(1) as f64
    }
}

struct CacheEntry {
    value: Arc<dyn Any + Send + Sync>,
    type_id: TypeId,
    last_access_ms: AtomicU64,
    access_count: AtomicU64,
}

impl CacheEntry {
    fn new<T: Any + Send + Sync>(value: T, now_ms: u64, access_count: u64) -> Self {
        Self {
            value: Arc::new(value),
            type_id: TypeId::of::<T>(),
            last_access_ms: AtomicU64::new(now_ms),
            access_count: AtomicU64::new(access_count),
        }
    }

    fn touch(&self, now_ms: u64) {
        self.last_access_ms.fetch_max(now_ms, Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }
}

impl AccessStats for CacheEntry {
    fn last_access_ms(&self) -> u64 {
        self.last_access_ms.load(Ordering::Relaxed)
    }

    fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }
}

/// Keys ordered most-evictable first
fn eviction_order<'a, E, I>(entries: I, now_ms: u64) -> Vec<String>
where
    E: AccessStats + 'a,
    I: Iterator<Item = (&'a String, &'a E)>,
{
    let mut scored: Vec<(f64, u64, &String)> = entries
        .map(|(key, entry)| (entry.eviction_score(now_ms), entry.last_access_ms(), key))
        .collect();
    scored.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(CmpOrdering::Equal)
            .then_with(|| a.1.cmp(&b.1))
            .then_with(|| a.2.cmp(b.2))
    });
    scored.into_iter().map(|(_, _, key)| key.clone()).collect()
}

/// Cache counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

pub struct AdaptiveCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    capacity: AtomicUsize,
    ttl: Duration,
    load_factor: f64,
    epoch: Instant,
    counters: Counters,
}

impl AdaptiveCache {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
    pub const DEFAULT_LOAD_FACTOR: f64 = 0.8;

    pub fn new(capacity: usize, ttl: Duration, load_factor: f64) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(capacity)),
            capacity: AtomicUsize::new(capacity.max(1)),
            ttl,
            load_factor: load_factor.clamp(0.0, 1.0),
            epoch: Instant::now(),
            counters: Counters::default(),
        }
    }

    /// Cache sized from the given device profile, default TTL and load factor
    pub fn for_device(profile: &DeviceProfile) -> Self {
        Self::new(profile.cache_capacity(), Self::DEFAULT_TTL, Self::DEFAULT_LOAD_FACTOR)
    }

    fn now_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    fn ttl_ms(&self) -> u64 {
        self.ttl.as_millis() as u64
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Change capacity. Takes effect on the next insert; nothing is evicted now.
    pub fn set_capacity(&self, capacity: usize) {
        let capacity = capacity.max(1);
        let previous = self.capacity.swap(capacity, Ordering::SeqCst);
        if previous != capacity {
            debug!("Cache capacity {} -> {}", previous, capacity);
        }
    }

    /// Recompute capacity from a device profile (lazy, like `set_capacity`)
    pub fn apply_profile(&self, profile: &DeviceProfile) {
        self.set_capacity(profile.cache_capacity());
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Cached value for `key` if present, fresh, and stored as a `T`
    pub fn get<T: Any + Clone + Send + Sync>(&self, key: &str) -> Option<T> {
        self.get_at(key, Instant::now())
    }

    pub(crate) fn get_at<T: Any + Clone + Send + Sync>(&self, key: &str, now: Instant) -> Option<T> {
        let now_ms = self.now_ms(now);
        let entries = self.entries.read();

        let hit = entries.get(key).and_then(|entry| {
            if entry.type_id != TypeId::of::<T>() || entry.idle_ms(now_ms) > self.ttl_ms() {
                return None;
            }
            let value = entry.value.downcast_ref::<T>()?.clone();
            entry.touch(now_ms);
            Some(value)
        });

        if hit.is_some() {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Insert or overwrite `key`, evicting first if this would exceed capacity
    pub fn put<T: Any + Send + Sync>(&self, key: &str, value: T) {
        self.put_at(key, value, Instant::now());
    }

    pub(crate) fn put_at<T: Any + Send + Sync>(&self, key: &str, value: T, now: Instant) {
        let now_ms = self.now_ms(now);
        let mut entries = self.entries.write();
        self.insert_locked(&mut entries, key, value, now_ms);
    }

    /// Insert only if `still_current` holds once the write lock is taken.
    ///
    /// Used for fills from disk: a writer that changes the key between the
    /// read and the fill makes `still_current` false, so the fill cannot
    /// land on top of a newer value or bring back a removed one.
    pub fn put_if<T, F>(&self, key: &str, value: T, still_current: F) -> bool
    where
        T: Any + Send + Sync,
        F: FnOnce() -> bool,
    {
        let now_ms = self.now_ms(Instant::now());
        let mut entries = self.entries.write();
        if !still_current() {
            debug!("Cache fill for {} skipped, key changed during read", key);
            return false;
        }
        self.insert_locked(&mut entries, key, value, now_ms);
        true
    }

    fn insert_locked<T: Any + Send + Sync>(
        &self,
        entries: &mut HashMap<String, CacheEntry>,
        key: &str,
        value: T,
        now_ms: u64,
    ) {
        let exists = entries.contains_key(key);
        let projected = entries.len() + usize::from(!exists);
        if projected > self.capacity() {
            self.evict_locked(entries, key, now_ms);
        }

        let prior_count = entries.get(key).map(|e| e.access_count()).unwrap_or(0);
        entries.insert(key.to_string(), CacheEntry::new(value, now_ms, prior_count + 1));
        self.counters.inserts.fetch_add(1, Ordering::Relaxed);
    }

    fn evict_locked(&self, entries: &mut HashMap<String, CacheEntry>, incoming: &str, now_ms: u64) {
        let expired = Self::drop_expired(entries, now_ms, self.ttl_ms());
        self.counters.expirations.fetch_add(expired as u64, Ordering::Relaxed);

        let capacity = self.capacity();
        let others = entries.len() - usize::from(entries.contains_key(incoming));
        if others < capacity {
            if expired > 0 {
                debug!("Cache eviction: {} expired, no pressure left", expired);
            }
            return;
        }

        // Room for the incoming entry below the target occupancy
        let target = ((capacity as f64 * self.load_factor).floor() as usize).min(capacity - 1);
        let excess = others.saturating_sub(target);

        let victims: Vec<String> = eviction_order(
            entries.iter().filter(|(k, _)| k.as_str() != incoming),
            now_ms,
        )
        .into_iter()
        .take(excess)
        .collect();

        for key in &victims {
            entries.remove(key);
        }
        self.counters.evictions.fetch_add(victims.len() as u64, Ordering::Relaxed);
        debug!(
            "Cache eviction: {} expired, {} evicted by score, {} remain (capacity {})",
            expired,
            victims.len(),
            entries.len(),
            capacity
        );
    }

    fn drop_expired(entries: &mut HashMap<String, CacheEntry>, now_ms: u64, ttl_ms: u64) -> usize {
        let before = entries.len();
        entries.retain(|_, entry| entry.idle_ms(now_ms) <= ttl_ms);
        before - entries.len()
    }

    /// Drop every entry idle longer than the TTL, regardless of capacity
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub(crate) fn purge_expired_at(&self, now: Instant) -> usize {
        let now_ms = self.now_ms(now);
        let mut entries = self.entries.write();
        let expired = Self::drop_expired(&mut entries, now_ms, self.ttl_ms());
        self.counters.expirations.fetch_add(expired as u64, Ordering::Relaxed);
        if expired > 0 {
            debug!("Cache purged {} expired entries", expired);
        }
        expired
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut entries = self.entries.write();
        let count = entries.len();
        entries.clear();
        debug!("Cache cleared ({} entries)", count);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            inserts: self.counters.inserts.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            entries: self.len(),
            capacity: self.capacity(),
        }
    }
}
