//! Configuration for the engine and its backing store
//!
//! An [`EngineConfig`] selects the backing store (in-process memory or a
//! local directory) and carries every tunable of the save, backup and cache
//! paths. Configs can be built in code, parsed from a storage URI or loaded
//! from a JSON file; missing fields take their defaults.

use crate::backup::{DEFAULT_BACKUP_MAX_AGE_DAYS, DEFAULT_MAX_BACKUPS};
use crate::cache::DEFAULT_CACHE_CAPACITY;
use crate::compression::{BestEffortCompressor, COMPRESSION_THRESHOLD, MIN_COMPRESSION_GAIN};
use crate::{DraftError, Result};
use drafthold_retry::{RetryPolicy, DEFAULT_RETRIES};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const MEMORY_URI: &str = "memory://";
const FILE_URI_PREFIX: &str = "file://";

/// Backing store selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-process store; contents are lost when the engine is dropped
    Memory,
    /// One file per key under `base_path`
    Local { base_path: PathBuf },
}

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub backend: StorageBackend,
    /// Byte limit enforced by the store; `None` means unlimited
    pub quota_bytes: Option<u64>,
    /// Backups kept per document
    pub max_backups: usize,
    /// Export cache entries
    pub cache_capacity: usize,
    /// Payloads below this size are stored raw
    pub compression_threshold: usize,
    /// Relative size reduction required to keep a compressed payload
    pub min_compression_gain: f64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Backups older than this are purged when the store is full
    pub backup_max_age_days: i64,
    /// Retries used by `SaveOptions::default()`
    pub default_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            quota_bytes: None,
            max_backups: DEFAULT_MAX_BACKUPS,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            compression_threshold: COMPRESSION_THRESHOLD,
            min_compression_gain: MIN_COMPRESSION_GAIN,
            backoff_base_ms: 1000,
            backoff_cap_ms: 10_000,
            backup_max_age_days: DEFAULT_BACKUP_MAX_AGE_DAYS,
            default_retries: DEFAULT_RETRIES,
        }
    }
}

impl EngineConfig {
    /// Defaults with an in-memory store
    pub fn memory() -> Self {
        Self::default()
    }

    /// Defaults with a local directory store
    pub fn local<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            backend: StorageBackend::Local {
                base_path: base_path.as_ref().to_path_buf(),
            },
            ..Self::default()
        }
    }

    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    /// Parse a storage URI
    ///
    /// Supports formats:
    /// - `memory://` for the in-process store
    /// - `file:///var/lib/drafthold` or a plain path for a local directory
    pub fn from_uri(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if uri == MEMORY_URI {
            return Ok(Self::memory());
        }
        if let Some(rest) = uri.strip_prefix("memory:") {
            return Err(DraftError::config(format!(
                "Invalid memory URI '{uri}': unexpected '{rest}'"
            )));
        }

        let path = uri.strip_prefix(FILE_URI_PREFIX).unwrap_or(uri);
        if path.is_empty() {
            return Err(DraftError::config("Storage URI is missing a path"));
        }
        Ok(Self::local(path))
    }

    /// Load and validate a JSON config file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            DraftError::config(format!("Failed to read config {}: {e}", path.display()))
        })?;
        let config: Self = serde_json::from_str(&contents).map_err(|e| {
            DraftError::config(format!("Failed to parse config {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if let StorageBackend::Local { base_path } = &self.backend {
            if base_path.as_os_str().is_empty() {
                return Err(DraftError::config("Local backend requires a base path"));
            }
        }
        if self.max_backups == 0 {
            return Err(DraftError::config("max_backups must be at least 1"));
        }
        if !(0.0..1.0).contains(&self.min_compression_gain) {
            return Err(DraftError::config(format!(
                "min_compression_gain must be in [0, 1), got {}",
                self.min_compression_gain
            )));
        }
        if self.backup_max_age_days < 0 {
            return Err(DraftError::config("backup_max_age_days must not be negative"));
        }
        self.retry_policy(self.default_retries)?;
        Ok(())
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    /// Retry policy with this config's backoff schedule
    pub fn retry_policy(&self, retries: u32) -> Result<RetryPolicy> {
        RetryPolicy::new(retries, self.backoff_base(), self.backoff_cap())
            .map_err(|e| DraftError::config(format!("Invalid backoff schedule: {e}")))
    }

    pub fn backup_max_age(&self) -> chrono::Duration {
        chrono::Duration::days(self.backup_max_age_days)
    }

    /// Gzip compressor honouring the threshold and gain settings
    pub fn compressor(&self) -> BestEffortCompressor {
        BestEffortCompressor::new()
            .with_threshold(self.compression_threshold)
            .with_min_gain(self.min_compression_gain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.backend, StorageBackend::Memory);
        assert_eq!(config.max_backups, 5);
        assert_eq!(config.cache_capacity, 20);
        assert_eq!(config.compression_threshold, 51_200);
        assert_eq!(config.backup_max_age(), chrono::Duration::days(30));
        assert_eq!(config.default_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_uri_memory() {
        assert_eq!(
            EngineConfig::from_uri("memory://").unwrap().backend,
            StorageBackend::Memory
        );
        assert!(EngineConfig::from_uri("memory://extra").is_err());
    }

    #[test]
    fn test_from_uri_local() {
        let config = EngineConfig::from_uri("/var/lib/drafthold").unwrap();
        assert_eq!(
            config.backend,
            StorageBackend::Local {
                base_path: PathBuf::from("/var/lib/drafthold")
            }
        );

        let config = EngineConfig::from_uri("file://./data").unwrap();
        assert_eq!(
            config.backend,
            StorageBackend::Local {
                base_path: PathBuf::from("./data")
            }
        );
    }

    #[test]
    fn test_from_uri_empty() {
        let err = EngineConfig::from_uri("file://").unwrap_err();
        assert!(err.to_string().contains("missing a path"));
        assert!(EngineConfig::from_uri("  ").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.max_backups = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.min_compression_gain = 1.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.backoff_cap_ms = 10;
        assert!(config.validate().is_err());

        let config = EngineConfig::local("");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_json_file_fills_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"backend": {{"type": "local", "base_path": "/tmp/drafts"}}, "max_backups": 2}}"#
        )
        .unwrap();

        let config = EngineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.max_backups, 2);
        assert_eq!(config.cache_capacity, DEFAULT_CACHE_CAPACITY);
        assert!(matches!(config.backend, StorageBackend::Local { .. }));
    }

    #[test]
    fn test_from_json_file_reports_parse_errors() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();

        let err = EngineConfig::from_json_file(file.path()).unwrap_err();
        assert!(matches!(err, DraftError::Config(_)));
    }

    #[test]
    fn test_retry_policy_uses_schedule() {
        let mut config = EngineConfig::default();
        config.backoff_base_ms = 10;
        config.backoff_cap_ms = 25;

        let policy = config.retry_policy(4).unwrap();
        assert_eq!(policy.delay_for(0), Duration::from_millis(10));
        assert_eq!(policy.delay_for(3), Duration::from_millis(25));
    }
}
