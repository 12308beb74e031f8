//! Cache configuration
//!
//! Defaults mirror a small thumbnail list: two workers, no eviction and no
//! per-fetch timeout. A JSON file in the platform config directory and
//! `THUMBCACHE_*` environment variables can override them.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default number of concurrent fetch workers
pub const DEFAULT_WORKERS: usize = 2;

/// Default connect timeout for the HTTP client
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Tunables for [`crate::ImageCache`] and [`crate::HttpFetcher`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Maximum number of fetch-and-decode tasks running at once
    pub workers: usize,
    /// Upper bound on completed entries; `None` keeps every image forever
    pub max_entries: Option<u64>,
    /// Per-fetch timeout; `None` lets a hung fetch hold its worker slot
    pub fetch_timeout_secs: Option<u64>,
    /// TCP connect timeout for the HTTP client
    pub connect_timeout_secs: u64,
    /// User-Agent header sent with every download
    pub user_agent: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_entries: None,
            fetch_timeout_secs: None,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            user_agent: concat!("thumbcache/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl CacheConfig {
    /// Load configuration from the default file (if present) and environment
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match Self::default_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON config file; missing fields keep their defaults
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "Loaded cache config");
        Ok(config)
    }

    /// `<config_dir>/thumbcache/config.json`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("thumbcache").join("config.json"))
    }

    /// Apply `THUMBCACHE_*` overrides using the given variable lookup
    fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup("THUMBCACHE_WORKERS") {
            self.workers = parse_var("THUMBCACHE_WORKERS", &raw)?;
        }
        if let Some(raw) = lookup("THUMBCACHE_MAX_ENTRIES") {
            self.max_entries = Some(parse_var("THUMBCACHE_MAX_ENTRIES", &raw)?);
        }
        if let Some(raw) = lookup("THUMBCACHE_FETCH_TIMEOUT_SECS") {
            self.fetch_timeout_secs = Some(parse_var("THUMBCACHE_FETCH_TIMEOUT_SECS", &raw)?);
        }
        Ok(())
    }

    /// Reject values the cache cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }
        if self.max_entries == Some(0) {
            return Err(ConfigError::Invalid("maxEntries must be at least 1".to_string()));
        }
        if self.fetch_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "fetchTimeoutSecs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Per-fetch timeout as a Duration
    pub fn fetch_timeout(&self) -> Option<Duration> {
        self.fetch_timeout_secs.map(Duration::from_secs)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{} has invalid value '{}'", key, raw)))
}
