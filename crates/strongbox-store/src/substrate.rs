//! Durable key-value substrate
//!
//! One opaque blob per key, last write wins. The substrate only ever sees
//! sealed records; it has no notion of plaintext.

use parking_lot::Mutex as PlMutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SubstrateError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Substrate lock poisoned")]
    Poisoned,

    #[error("Write rejected: {0}")]
    Rejected(String),
}

pub trait Substrate: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SubstrateError>;

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), SubstrateError>;

    /// Returns whether a record existed. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<bool, SubstrateError>;

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, SubstrateError>;
}

impl<S: Substrate + ?Sized> Substrate for std::sync::Arc<S> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SubstrateError> {
        (**self).get(key)
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), SubstrateError> {
        (**self).put(key, bytes)
    }

    fn delete(&self, key: &str) -> Result<bool, SubstrateError> {
        (**self).delete(key)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, SubstrateError> {
        (**self).keys_with_prefix(prefix)
    }
}

/// SQLite-backed substrate
pub struct SqliteSubstrate {
    conn: Mutex<Connection>,
}

impl SqliteSubstrate {
    /// Open or create the record database
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SubstrateError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        // WAL for concurrent readers while the flush path writes
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    /// Private in-memory database
    pub fn open_in_memory() -> Result<Self, SubstrateError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, SubstrateError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS records (
                key TEXT PRIMARY KEY NOT NULL,
                value BLOB NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, SubstrateError> {
        self.conn.lock().map_err(|_| SubstrateError::Poisoned)
    }
}

impl Substrate for SqliteSubstrate {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SubstrateError> {
        let conn = self.conn()?;
        let value = conn
            .query_row(
                "SELECT value FROM records WHERE key = ?1",
                params![key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), SubstrateError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO records (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
            params![key, bytes],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, SubstrateError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM records WHERE key = ?1", params![key])?;
        Ok(deleted > 0)
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, SubstrateError> {
        let conn = self.conn()?;
        // substr() instead of LIKE: '%' and '_' are legal in key names
        let mut stmt = conn.prepare(
            "SELECT key FROM records WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for row in rows {
            keys.push(row?);
        }
        Ok(keys)
    }
}

/// In-memory substrate with raw access for inspection and fault injection
#[derive(Default)]
pub struct MemorySubstrate {
    records: PlMutex<BTreeMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemorySubstrate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail until reset
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `put` calls
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn raw_get(&self, key: &str) -> Option<Vec<u8>> {
        self.records.lock().get(key).cloned()
    }

    pub fn raw_put(&self, key: &str, bytes: Vec<u8>) {
        self.records.lock().insert(key.to_string(), bytes);
    }

    /// Flip one bit of the stored blob at `index`. Returns false if absent or out of range.
    pub fn corrupt(&self, key: &str, index: usize) -> bool {
        let mut records = self.records.lock();
        match records.get_mut(key).and_then(|blob| blob.get_mut(index)) {
            Some(byte) => {
                *byte ^= 0x01;
                true
            }
            None => false,
        }
    }

    /// Every stored blob concatenated, for plaintext scans
    pub fn raw_dump(&self) -> Vec<u8> {
        let records = self.records.lock();
        let mut out = Vec::new();
        for (key, blob) in records.iter() {
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(blob);
        }
        out
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl Substrate for MemorySubstrate {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SubstrateError> {
        Ok(self.records.lock().get(key).cloned())
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), SubstrateError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SubstrateError::Rejected("fault injected".to_string()));
        }
        self.records.lock().insert(key.to_string(), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool, SubstrateError> {
        Ok(self.records.lock().remove(key).is_some())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, SubstrateError> {
        Ok(self
            .records
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(substrate: &dyn Substrate) {
        assert!(substrate.get("secure_a").unwrap().is_none());

        substrate.put("secure_a", &[1, 2, 3]).unwrap();
        substrate.put("secure_a", &[4, 5]).unwrap();
        substrate.put("secure_b", &[6]).unwrap();
        substrate.put("other_c", &[7]).unwrap();

        assert_eq!(substrate.get("secure_a").unwrap(), Some(vec![4, 5]));
        assert_eq!(
            substrate.keys_with_prefix("secure_").unwrap(),
            vec!["secure_a".to_string(), "secure_b".to_string()]
        );

        assert!(substrate.delete("secure_a").unwrap());
        assert!(!substrate.delete("secure_a").unwrap());
        assert!(substrate.get("secure_a").unwrap().is_none());
    }

    #[test]
    fn test_sqlite_substrate() {
        let dir = TempDir::new().unwrap();
        let substrate = SqliteSubstrate::open(dir.path().join("nested").join("store.db")).unwrap();
        exercise(&substrate);
    }

    #[test]
    fn test_sqlite_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.db");
        {
            let substrate = SqliteSubstrate::open(&path).unwrap();
            substrate.put("secure_k", b"sealed").unwrap();
        }
        let substrate = SqliteSubstrate::open(&path).unwrap();
        assert_eq!(substrate.get("secure_k").unwrap(), Some(b"sealed".to_vec()));
    }

    #[test]
    fn test_sqlite_prefix_with_wildcards() {
        let substrate = SqliteSubstrate::open_in_memory().unwrap();
        substrate.put("a_%x", &[1]).unwrap();
        substrate.put("abx", &[2]).unwrap();
        assert_eq!(substrate.keys_with_prefix("a_%").unwrap(), vec!["a_%x".to_string()]);
    }

    #[test]
    fn test_memory_substrate() {
        let substrate = MemorySubstrate::new();
        exercise(&substrate);
        assert_eq!(substrate.write_count(), 4);
    }

    #[test]
    fn test_memory_substrate_fault_injection() {
        let substrate = MemorySubstrate::new();
        substrate.fail_writes(true);
        assert!(substrate.put("k", &[1]).is_err());
        assert!(substrate.is_empty());

        substrate.fail_writes(false);
        substrate.put("k", &[1]).unwrap();
        assert!(substrate.corrupt("k", 0));
        assert_eq!(substrate.raw_get("k"), Some(vec![0]));
        assert!(!substrate.corrupt("k", 5));
    }
}
