// Where configuration comes from, in priority order: CTGOV2FHIR_* variables
// beat a TOML file (explicit path, inline content, or ./ctgov2fhir.toml),
// which beats the built-in defaults.

use crate::*;
use anyhow::{Context, Result};
use std::env;
use std::path::Path;

const ENV_PREFIX: &str = "CTGOV2FHIR_";

/// Load configuration from all sources.
pub fn load_config() -> Result<RuntimeConfig> {
    let mut config = match toml_source()? {
        Some((origin, text)) => toml::from_str(&text)
            .with_context(|| format!("config from {} is not valid TOML", origin))?,
        None => RuntimeConfig::default(),
    };

    apply_env_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

/// The TOML text to start from, if any, labeled with its origin for error
/// reporting. An explicit file path wins over inline content, which wins
/// over the conventional file next to the process.
fn toml_source() -> Result<Option<(String, String)>> {
    if let Some(path) = env_override::<String>("CONFIG")? {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("could not read config file {}", path))?;
        return Ok(Some((path, text)));
    }

    if let Some(text) = env_override::<String>("CONFIG_CONTENT")? {
        return Ok(Some(("CTGOV2FHIR_CONFIG_CONTENT".to_string(), text)));
    }

    let conventional = Path::new("./ctgov2fhir.toml");
    if conventional.exists() {
        let origin = conventional.display().to_string();
        let text = std::fs::read_to_string(conventional)
            .with_context(|| format!("could not read config file {}", origin))?;
        return Ok(Some((origin, text)));
    }

    Ok(None)
}

/// Apply environment variable overrides (highest priority).
fn apply_env_overrides(config: &mut RuntimeConfig) -> Result<()> {
    if let Some(endpoint) = env_override("ENDPOINT")? {
        config.service.endpoint = endpoint;
    }
    if let Some(batch) = env_override("MAX_TRIALS_PER_REQUEST")? {
        config.service.max_trials_per_request = batch;
    }
    if let Some(cap) = env_override("MAX_ENTRY_SIZE_BYTES")? {
        config.service.max_entry_size_bytes = cap;
    }
    if let Some(interval) = env_override("CLEANUP_INTERVAL_MS")? {
        config.cleanup.cleanup_interval_ms = interval;
    }
    if let Some(timeout) = env_override("EXPIRATION_TIMEOUT_MS")? {
        config.cleanup.expiration_timeout_ms = timeout;
    }
    if let Some(backend) = env_override("STORAGE_BACKEND")? {
        config.storage.backend = backend;
    }
    if let Some(path) = env_override("SQLITE_PATH")? {
        config.storage.sqlite = Some(SqliteConfig { path });
    }
    if let Some(path) = env_override("STORAGE_PATH")? {
        config.storage.fs = Some(FsConfig { path });
    }

    // A backend selected purely via env still needs its section
    match config.storage.backend {
        StorageBackend::Sqlite if config.storage.sqlite.is_none() => {
            config.storage.sqlite = Some(SqliteConfig::default());
        }
        StorageBackend::Fs if config.storage.fs.is_none() => {
            config.storage.fs = Some(FsConfig::default());
        }
        _ => {}
    }

    Ok(())
}

/// Read `CTGOV2FHIR_<key>` and parse it.
///
/// Unset and empty variables mean "no override". A variable that is set but
/// does not parse is a hard error; silently ignoring a typo'd tunable would
/// be worse than refusing to start.
fn env_override<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let name = format!("{ENV_PREFIX}{key}");
    let raw = match env::var(&name) {
        Ok(raw) => raw,
        Err(env::VarError::NotPresent) => return Ok(None),
        Err(error) => anyhow::bail!("{name} is unreadable: {error}"),
    };
    if raw.is_empty() {
        return Ok(None);
    }
    match raw.parse() {
        Ok(value) => Ok(Some(value)),
        Err(error) => anyhow::bail!("{name}={raw} did not parse: {error}"),
    }
}
