use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::{Result, StoreError};

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Prefix prepended to every record key in the substrate
    pub namespace: String,
    pub cache_ttl_secs: u64,
    /// Fraction of capacity the cache shrinks to when eviction runs
    pub eviction_load_factor: f64,
    pub flush_interval_ms: u64,
    /// Keychain service name the encryption key lives under
    pub keystore_service: String,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub interval_hours: u64,
    /// Logical keys that survive a retention sweep
    pub essential_keys: Vec<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: "secure_".to_string(),
            cache_ttl_secs: 300,
            eviction_load_factor: 0.8,
            flush_interval_ms: 2000,
            keystore_service: "strongbox".to_string(),
            retention: RetentionConfig::default(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval_hours: 24,
            essential_keys: vec![
                "last_data_cleanup".to_string(),
                "selected_llm_model".to_string(),
                "app_session_start_time".to_string(),
            ],
        }
    }
}

impl StoreConfig {
    /// Load configuration from a JSON file. Missing fields take defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| StoreError::Config(format!("{}: {}", path.display(), e)))?;
        let config: StoreConfig = serde_json::from_str(&content)
            .map_err(|e| StoreError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.eviction_load_factor > 0.0 && self.eviction_load_factor <= 1.0) {
            return Err(StoreError::Config(format!(
                "eviction_load_factor must be in (0, 1], got {}",
                self.eviction_load_factor
            )));
        }
        if self.cache_ttl_secs == 0 {
            return Err(StoreError::Config("cache_ttl_secs must be positive".to_string()));
        }
        if self.flush_interval_ms == 0 {
            return Err(StoreError::Config("flush_interval_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

impl RetentionConfig {
    pub fn interval(&self) -> chrono::Duration {
        chrono::Duration::hours(self.interval_hours as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.namespace, "secure_");
        assert_eq!(config.cache_ttl(), Duration::from_secs(300));
        assert_eq!(config.flush_interval(), Duration::from_secs(2));
        assert_eq!(config.retention.interval(), chrono::Duration::hours(24));
        assert!(config
            .retention
            .essential_keys
            .contains(&"last_data_cleanup".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_takes_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"namespace": "vault_", "retention": {{"interval_hours": 6}}}}"#).unwrap();

        let config = StoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.namespace, "vault_");
        assert_eq!(config.cache_ttl_secs, 300);
        assert_eq!(config.retention.interval_hours, 6);
        assert_eq!(config.retention.essential_keys.len(), 3);
    }

    #[test]
    fn test_rejects_bad_load_factor() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"eviction_load_factor": 1.5}}"#).unwrap();
        assert!(matches!(
            StoreConfig::from_file(file.path()),
            Err(StoreError::Config(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            StoreConfig::from_file("/nonexistent/strongbox.json"),
            Err(StoreError::Config(_))
        ));
    }
}
