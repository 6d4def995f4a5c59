//! Strongbox store - encrypted key-value storage for on-device session state
//!
//! Values are cached in memory (sized to the device), persisted as sealed
//! records, and may be written through or batched by the write coalescer.

pub mod cache;
pub mod coalescer;
pub mod codec;
pub mod config;
pub mod error;
pub mod persistence;
pub mod retention;
pub mod store;
pub mod substrate;

pub use cache::{AdaptiveCache, CacheStats, DeviceProfile, ThermalState};
pub use coalescer::{FlushTask, WriteCoalescer};
pub use codec::{Codec, DecodeError, FORMAT_VERSION};
pub use config::{RetentionConfig, StoreConfig};
pub use error::{Result, StoreError};
pub use persistence::EncryptedPersistence;
pub use retention::{RetentionOutcome, RetentionPolicy, LAST_CLEANUP_KEY};
pub use store::{SecureStore, StoreValue};
pub use substrate::{MemorySubstrate, SqliteSubstrate, Substrate, SubstrateError};
