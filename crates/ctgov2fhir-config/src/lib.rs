// ctgov2fhir-config - Runtime configuration
//
// Supports configuration from multiple sources:
// 1. Environment variables (highest priority)
// 2. Config file path from CTGOV2FHIR_CONFIG env var
// 3. Config file contents from CTGOV2FHIR_CONFIG_CONTENT env var
// 4. Default config file location (./ctgov2fhir.toml)
// 5. Built-in defaults (lowest priority)

use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

mod sources;

/// Default ClinicalTrials.gov v2 API root.
pub const DEFAULT_ENDPOINT: &str = "https://clinicaltrials.gov/api/v2";

/// Main runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub cleanup: CleanupConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            storage: StorageConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

/// Upstream service tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub endpoint: String,
    pub max_trials_per_request: usize,
    pub max_entry_size_bytes: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            max_trials_per_request: 128,
            max_entry_size_bytes: 128 * 1024 * 1024,
        }
    }
}

impl ServiceConfig {
    /// Batch size, floored at one trial per request.
    pub fn trials_per_request(&self) -> usize {
        if self.max_trials_per_request == 0 {
            warn!(
                target: "ctgovservice",
                "max_trials_per_request of 0 raised to 1"
            );
            1
        } else {
            self.max_trials_per_request
        }
    }
}

/// Expiry sweeper tunables, both in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    /// How often the sweeper runs. 0 disables sweeping entirely.
    pub cleanup_interval_ms: u64,
    /// How long an entry may go unaccessed before it expires.
    pub expiration_timeout_ms: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: 3_600_000,
            expiration_timeout_ms: 3_600_000,
        }
    }
}

const MIN_CLEANUP_INTERVAL_MS: u64 = 60_000;
const MAX_CLEANUP_INTERVAL_MS: u64 = i32::MAX as u64;
const MIN_EXPIRATION_TIMEOUT_MS: u64 = 1_000;

impl CleanupConfig {
    /// Sweep interval clamped to [60 s, 2^31-1 ms]; `None` when disabled.
    pub fn cleanup_interval(&self) -> Option<Duration> {
        if self.cleanup_interval_ms == 0 {
            return None;
        }
        let clamped = self
            .cleanup_interval_ms
            .clamp(MIN_CLEANUP_INTERVAL_MS, MAX_CLEANUP_INTERVAL_MS);
        if clamped != self.cleanup_interval_ms {
            warn!(
                target: "ctgovservice",
                requested = self.cleanup_interval_ms,
                actual = clamped,
                "cleanup interval clamped"
            );
        }
        Some(Duration::from_millis(clamped))
    }

    /// Idle expiration, floored at one second.
    pub fn expiration_timeout(&self) -> Duration {
        let floored = self.expiration_timeout_ms.max(MIN_EXPIRATION_TIMEOUT_MS);
        if floored != self.expiration_timeout_ms {
            warn!(
                target: "ctgovservice",
                requested = self.expiration_timeout_ms,
                actual = floored,
                "expiration timeout floored"
            );
        }
        Duration::from_millis(floored)
    }
}

/// Durable store backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlite: Option<SqliteConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs: Option<FsConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            sqlite: Some(SqliteConfig::default()),
            fs: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Fs,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Sqlite => write!(f, "sqlite"),
            StorageBackend::Fs => write!(f, "fs"),
        }
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sqlite" | "db" => Ok(StorageBackend::Sqlite),
            "fs" | "filesystem" => Ok(StorageBackend::Fs),
            _ => anyhow::bail!("Unsupported storage backend: {}. Supported: sqlite, fs", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Path of the database file.
    pub path: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: "./ctgov-cache.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Root directory; record files live under `{path}/data/`.
    pub path: String,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            path: "./ctgov-cache".to_string(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from all sources with priority.
    pub fn load() -> Result<Self> {
        sources::load_config()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        match self.storage.backend {
            StorageBackend::Sqlite if self.storage.sqlite.is_none() => {
                anyhow::bail!("sqlite config required for the sqlite storage backend")
            }
            StorageBackend::Fs if self.storage.fs.is_none() => {
                anyhow::bail!("fs config required for the filesystem storage backend")
            }
            _ => {}
        }
        if self.service.endpoint.is_empty() {
            anyhow::bail!("service endpoint must not be empty");
        }
        if self.service.max_entry_size_bytes == 0 {
            anyhow::bail!("max_entry_size_bytes must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.service.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.service.trials_per_request(), 128);
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(
            config.cleanup.cleanup_interval(),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(
            config.cleanup.expiration_timeout(),
            Duration::from_secs(3600)
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_storage_backend_from_str() {
        assert_eq!(
            "sqlite".parse::<StorageBackend>().unwrap(),
            StorageBackend::Sqlite
        );
        assert_eq!("fs".parse::<StorageBackend>().unwrap(), StorageBackend::Fs);
        assert_eq!(
            "filesystem".parse::<StorageBackend>().unwrap(),
            StorageBackend::Fs
        );
        assert!("parquet".parse::<StorageBackend>().is_err());
    }

    #[test]
    fn test_clamps() {
        let cleanup = CleanupConfig {
            cleanup_interval_ms: 10,
            expiration_timeout_ms: 10,
        };
        assert_eq!(cleanup.cleanup_interval(), Some(Duration::from_secs(60)));
        assert_eq!(cleanup.expiration_timeout(), Duration::from_secs(1));

        let disabled = CleanupConfig {
            cleanup_interval_ms: 0,
            expiration_timeout_ms: 3_600_000,
        };
        assert_eq!(disabled.cleanup_interval(), None);

        let huge = CleanupConfig {
            cleanup_interval_ms: u64::MAX,
            expiration_timeout_ms: 3_600_000,
        };
        assert_eq!(
            huge.cleanup_interval(),
            Some(Duration::from_millis(i32::MAX as u64))
        );

        let service = ServiceConfig {
            max_trials_per_request: 0,
            ..Default::default()
        };
        assert_eq!(service.trials_per_request(), 1);
    }

    #[test]
    fn test_validation_rejects_mismatched_backend() {
        let mut config = RuntimeConfig::default();
        config.storage.backend = StorageBackend::Fs;
        config.storage.fs = None;
        assert!(config.validate().is_err());
    }
}
