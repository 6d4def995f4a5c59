//! Periodic data-retention sweep
//!
//! Once per interval, every stored value except a short list of essential
//! keys is deleted. The time of the last sweep is itself kept (encrypted)
//! under [`LAST_CLEANUP_KEY`].

use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::RetentionConfig;
use crate::store::SecureStore;
use crate::Result;

pub const LAST_CLEANUP_KEY: &str = "last_data_cleanup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionOutcome {
    /// First run: timestamp recorded, nothing deleted
    Initialized,
    NotDue,
    /// Sweep ran and deleted this many records
    Purged(usize),
}

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    interval: chrono::Duration,
    essential_keys: Vec<String>,
}

impl RetentionPolicy {
    pub fn new(interval: chrono::Duration, essential_keys: Vec<String>) -> Self {
        let mut essential_keys = essential_keys;
        if !essential_keys.iter().any(|k| k == LAST_CLEANUP_KEY) {
            essential_keys.push(LAST_CLEANUP_KEY.to_string());
        }
        Self {
            interval,
            essential_keys,
        }
    }

    pub fn from_config(config: &RetentionConfig) -> Self {
        Self::new(config.interval(), config.essential_keys.clone())
    }

    pub fn essential_keys(&self) -> &[String] {
        &self.essential_keys
    }

    /// Sweep `store` if at least one interval has passed since the last sweep
    pub fn run_if_due(&self, store: &SecureStore, now: DateTime<Utc>) -> Result<RetentionOutcome> {
        let Some(last) = store.retrieve::<DateTime<Utc>>(LAST_CLEANUP_KEY)? else {
            store.store(&now, LAST_CLEANUP_KEY)?;
            info!("Retention timestamp initialised");
            return Ok(RetentionOutcome::Initialized);
        };

        if now.signed_duration_since(last) < self.interval {
            return Ok(RetentionOutcome::NotDue);
        }

        let keep: Vec<&str> = self.essential_keys.iter().map(String::as_str).collect();
        let purged = store.purge_except(&keep)?;
        store.store(&now, LAST_CLEANUP_KEY)?;
        info!("Retention sweep removed {} records", purged);
        Ok(RetentionOutcome::Purged(purged))
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from_config(&RetentionConfig::default())
    }
}
