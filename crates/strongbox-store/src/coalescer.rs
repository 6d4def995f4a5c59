//! Write coalescer - deferred, batched persistence
//!
//! Staged writes land in a pending batch (one value per key, last write
//! wins). A flush moves the batch to an in-flight slot under the batch lock
//! and does the sealing and I/O outside it, so staging never waits on disk.
//! Readers see in-flight values until they are on disk.
//!
//! Flushes are serialised with each other and with discards by a separate
//! I/O lock. Without it, an older batch still being written could land
//! after a newer write for the same key.
//!
//! A write that fails to persist goes back into the pending batch (unless
//! a newer value was staged meanwhile) and the timer is re-armed. Nothing
//! staged is ever dropped on the floor.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::persistence::EncryptedPersistence;
use crate::{Result, StoreError};

type Batch = HashMap<String, Zeroizing<Vec<u8>>>;

#[derive(Default)]
struct Batches {
    pending: Batch,
    /// Batch currently being written, readable until it is on disk
    in_flight: Arc<Batch>,
}

pub struct WriteCoalescer {
    persistence: Arc<EncryptedPersistence>,
    batches: Mutex<Batches>,
    io: Mutex<()>,
    armed: AtomicBool,
    wake: Notify,
    shutdown: Notify,
}

impl WriteCoalescer {
    pub fn new(persistence: Arc<EncryptedPersistence>) -> Self {
        Self {
            persistence,
            batches: Mutex::new(Batches::default()),
            io: Mutex::new(()),
            armed: AtomicBool::new(false),
            wake: Notify::new(),
            shutdown: Notify::new(),
        }
    }

    /// Add or overwrite a pending write and arm the flush timer
    pub fn stage(&self, key: &str, encoded: Zeroizing<Vec<u8>>) {
        self.stage_with(key, encoded, || {});
    }

    /// Like `stage`, running `update` while the batch is locked so the
    /// caller's view of the key changes in the same order as the batch
    pub fn stage_with<F: FnOnce()>(&self, key: &str, encoded: Zeroizing<Vec<u8>>, update: F) {
        let replaced = {
            let mut batches = self.batches.lock();
            update();
            batches.pending.insert(key.to_string(), encoded).is_some()
        };
        debug!("Staged write for {}{}", key, if replaced { " (coalesced)" } else { "" });
        self.arm();
    }

    fn arm(&self) {
        if !self.armed.swap(true, Ordering::SeqCst) {
            self.wake.notify_one();
        }
    }

    /// Value for `key` that is staged or being written, if any
    pub fn pending_value(&self, key: &str) -> Option<Zeroizing<Vec<u8>>> {
        let batches = self.batches.lock();
        batches
            .pending
            .get(key)
            .or_else(|| batches.in_flight.get(key))
            .cloned()
    }

    pub fn is_pending(&self, key: &str) -> bool {
        let batches = self.batches.lock();
        batches.pending.contains_key(key) || batches.in_flight.contains_key(key)
    }

    pub fn pending_keys(&self) -> Vec<String> {
        let batches = self.batches.lock();
        let mut keys: Vec<String> = batches.pending.keys().cloned().collect();
        for key in batches.in_flight.keys() {
            if !batches.pending.contains_key(key) {
                keys.push(key.clone());
            }
        }
        keys
    }

    /// Writes not yet on disk
    pub fn pending_len(&self) -> usize {
        let batches = self.batches.lock();
        batches.pending.len()
            + batches
                .in_flight
                .keys()
                .filter(|k| !batches.pending.contains_key(*k))
                .count()
    }

    /// Persist everything staged so far. Returns the number of records written.
    pub fn flush(&self) -> Result<usize> {
        let _io = self.io.lock();
        let batch = {
            let mut batches = self.batches.lock();
            let batch = Arc::new(std::mem::take(&mut batches.pending));
            batches.in_flight = Arc::clone(&batch);
            batch
        };
        self.write_batch(batch)
    }

    /// Persist the staged value for one key, leaving the rest of the batch
    pub fn flush_key(&self, key: &str) -> Result<usize> {
        let _io = self.io.lock();
        let batch = {
            let mut batches = self.batches.lock();
            let Some(encoded) = batches.pending.remove(key) else {
                return Ok(0);
            };
            let batch = Arc::new(HashMap::from([(key.to_string(), encoded)]));
            batches.in_flight = Arc::clone(&batch);
            batch
        };
        self.write_batch(batch)
    }

    /// Caller holds the I/O lock and has published `batch` as in flight
    fn write_batch(&self, batch: Arc<Batch>) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let attempted = batch.len();
        let mut failed: Vec<&String> = Vec::new();
        let mut first_error: Option<StoreError> = None;

        for (key, encoded) in batch.iter() {
            if let Err(e) = self.persistence.store_encoded(key, encoded) {
                warn!("Deferred write for {} failed: {}", key, e);
                first_error.get_or_insert(e);
                failed.push(key);
            }
        }

        let failed_count = failed.len();
        {
            let mut batches = self.batches.lock();
            for key in failed {
                if let Some(encoded) = batch.get(key) {
                    // A newer staged value supersedes the one that failed
                    batches
                        .pending
                        .entry(key.clone())
                        .or_insert_with(|| encoded.clone());
                }
            }
            batches.in_flight = Arc::default();
        }

        if failed_count == 0 {
            info!("Flushed {} deferred writes", attempted);
            return Ok(attempted);
        }
        self.arm();

        match first_error {
            Some(e) if attempted == 1 => Err(e),
            Some(e @ StoreError::KeyUnavailable(_)) if failed_count == attempted => Err(e),
            _ => Err(StoreError::FlushIncomplete {
                attempted,
                failed: failed_count,
            }),
        }
    }

    /// Drop any pending write for `key` and delete its record.
    /// `update` runs while the batch is locked.
    pub fn discard<F: FnOnce()>(&self, key: &str, update: F) -> Result<()> {
        let _io = self.io.lock();
        {
            let mut batches = self.batches.lock();
            update();
            batches.pending.remove(key);
        }
        self.persistence.remove(key)
    }

    /// Drop every pending write and every record in the namespace
    pub fn discard_all<F: FnOnce()>(&self, update: F) -> Result<usize> {
        let _io = self.io.lock();
        let dropped = {
            let mut batches = self.batches.lock();
            update();
            std::mem::take(&mut batches.pending).len()
        };
        if dropped > 0 {
            debug!("Dropped {} pending writes", dropped);
        }
        self.persistence.clear_all()
    }

    /// Drop every pending write and record except the listed keys
    pub fn discard_except<F: FnOnce()>(&self, keep: &[&str], update: F) -> Result<usize> {
        let _io = self.io.lock();
        {
            let mut batches = self.batches.lock();
            update();
            batches.pending.retain(|key, _| keep.contains(&key.as_str()));
        }
        self.persistence.purge_except(keep)
    }

    /// Start the flush timer on the current tokio runtime.
    ///
    /// The first stage after a flush arms the timer; `interval` later the
    /// batch is flushed on a blocking thread. Staging during the wait just
    /// joins the same batch.
    pub fn spawn_timer(self: &Arc<Self>, interval: Duration) -> FlushTask {
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = this.wake.notified() => {}
                    _ = this.shutdown.notified() => break,
                }

                let stop = tokio::select! {
                    _ = tokio::time::sleep(interval) => false,
                    _ = this.shutdown.notified() => true,
                };

                this.armed.store(false, Ordering::SeqCst);
                Self::flush_blocking(&this).await;

                if stop {
                    break;
                }
            }
            Self::flush_blocking(&this).await;
            debug!("Flush timer stopped");
        });

        FlushTask {
            handle,
            coalescer: Arc::clone(self),
        }
    }

    async fn flush_blocking(this: &Arc<Self>) {
        if this.pending_len() == 0 {
            return;
        }
        let coalescer = Arc::clone(this);
        match tokio::task::spawn_blocking(move || coalescer.flush()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Timed flush incomplete, will retry: {}", e),
            Err(e) => warn!("Flush task panicked: {}", e),
        }
    }

    /// Ask a running timer to flush and exit
    pub fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// Handle on the background flush timer
pub struct FlushTask {
    handle: JoinHandle<()>,
    coalescer: Arc<WriteCoalescer>,
}

impl FlushTask {
    /// Stop the timer after a final flush
    pub async fn shutdown(self) {
        self.coalescer.request_shutdown();
        if let Err(e) = self.handle.await {
            warn!("Flush timer ended abnormally: {}", e);
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::substrate::MemorySubstrate;
    use strongbox_crypto::{KeyManager, MemoryKeystore};

    fn coalescer() -> (Arc<WriteCoalescer>, Arc<EncryptedPersistence>, Arc<MemorySubstrate>) {
        let substrate = Arc::new(MemorySubstrate::new());
        let keys = Arc::new(KeyManager::new(Box::new(MemoryKeystore::new())));
        let persistence = Arc::new(EncryptedPersistence::new(
            keys,
            Box::new(Arc::clone(&substrate)),
            "secure_",
        ));
        (
            Arc::new(WriteCoalescer::new(Arc::clone(&persistence))),
            persistence,
            substrate,
        )
    }

    fn enc<T: serde::Serialize>(value: &T) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(codec::encode(value).unwrap())
    }

    #[test]
    fn test_last_write_wins_within_batch() {
        let (c, persistence, substrate) = coalescer();
        c.stage("model", enc(&"v1"));
        c.stage("model", enc(&"v2"));
        assert_eq!(c.pending_len(), 1);
        assert_eq!(substrate.write_count(), 0);

        assert_eq!(c.flush().unwrap(), 1);
        assert_eq!(substrate.write_count(), 1);
        assert_eq!(persistence.retrieve::<String>("model").unwrap(), Some("v2".to_string()));
    }

    #[test]
    fn test_flush_is_idempotent() {
        let (c, _, substrate) = coalescer();
        c.stage("a", enc(&1u8));
        assert_eq!(c.flush().unwrap(), 1);
        assert_eq!(c.flush().unwrap(), 0);
        assert_eq!(substrate.write_count(), 1);
    }

    #[test]
    fn test_failed_flush_requeues() {
        let (c, persistence, substrate) = coalescer();
        c.stage("a", enc(&1u8));
        c.stage("b", enc(&2u8));

        substrate.fail_writes(true);
        assert!(matches!(
            c.flush(),
            Err(StoreError::FlushIncomplete { attempted: 2, failed: 2 })
        ));
        assert_eq!(c.pending_len(), 2);

        substrate.fail_writes(false);
        assert_eq!(c.flush().unwrap(), 2);
        assert_eq!(persistence.retrieve::<u8>("b").unwrap(), Some(2));
    }

    #[test]
    fn test_flush_key_leaves_rest_of_batch() {
        let (c, persistence, substrate) = coalescer();
        c.stage("a", enc(&"first"));
        c.stage("b", enc(&"second"));

        assert_eq!(c.flush_key("a").unwrap(), 1);
        assert_eq!(c.flush_key("a").unwrap(), 0);
        assert_eq!(substrate.write_count(), 1);
        assert!(!c.is_pending("a"));
        assert!(c.is_pending("b"));
        assert_eq!(persistence.retrieve::<String>("a").unwrap(), Some("first".to_string()));
    }

    #[test]
    fn test_failed_flush_key_returns_cause_and_requeues() {
        let (c, _, substrate) = coalescer();
        c.stage("a", enc(&1u8));

        substrate.fail_writes(true);
        assert!(matches!(c.flush_key("a"), Err(StoreError::Substrate(_))));
        assert!(c.is_pending("a"));

        substrate.fail_writes(false);
        assert_eq!(c.flush().unwrap(), 1);
    }

    #[test]
    fn test_discard_drops_pending_and_record() {
        let (c, persistence, _) = coalescer();
        persistence.store("k", "persisted").unwrap();
        c.stage("k", enc(&"pending"));

        let mut hook_ran = false;
        c.discard("k", || hook_ran = true).unwrap();
        assert!(hook_ran);
        c.flush().unwrap();
        assert_eq!(persistence.retrieve::<String>("k").unwrap(), None);
    }

    #[test]
    fn test_concurrent_stage_and_flush_loses_nothing() {
        let (c, persistence, _) = coalescer();

        let stagers: Vec<_> = (0..4)
            .map(|t| {
                let c = Arc::clone(&c);
                std::thread::spawn(move || {
                    for i in 0..50u32 {
                        c.stage(&format!("t{}-{}", t, i), enc(&i));
                    }
                })
            })
            .collect();
        let flusher = {
            let c = Arc::clone(&c);
            std::thread::spawn(move || {
                for _ in 0..20 {
                    let _ = c.flush();
                }
            })
        };

        for s in stagers {
            s.join().unwrap();
        }
        flusher.join().unwrap();
        c.flush().unwrap();

        assert_eq!(persistence.keys().unwrap().len(), 200);
        assert_eq!(persistence.retrieve::<u32>("t3-49").unwrap(), Some(49));
    }

    #[tokio::test]
    async fn test_timer_flushes_after_interval() {
        let (c, persistence, substrate) = coalescer();
        let task = c.spawn_timer(Duration::from_millis(200));

        c.stage("a", enc(&"x"));
        c.stage("b", enc(&"y"));
        assert_eq!(substrate.write_count(), 0);

        for _ in 0..100 {
            if substrate.write_count() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(substrate.write_count(), 2);
        assert_eq!(c.pending_len(), 0);
        assert_eq!(persistence.retrieve::<String>("a").unwrap(), Some("x".to_string()));

        task.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending() {
        let (c, persistence, _) = coalescer();
        let task = c.spawn_timer(Duration::from_secs(3600));

        c.stage("k", enc(&7u32));
        task.shutdown().await;

        assert_eq!(c.pending_len(), 0);
        assert_eq!(persistence.retrieve::<u32>("k").unwrap(), Some(7));
    }

    #[tokio::test]
    async fn test_shutdown_with_failing_disk_keeps_writes() {
        let (c, _, substrate) = coalescer();
        let task = c.spawn_timer(Duration::from_secs(3600));

        substrate.fail_writes(true);
        c.stage("k", enc(&7u32));
        task.shutdown().await;

        assert_eq!(c.pending_len(), 1);
        assert_eq!(substrate.write_count(), 0);
    }
}
