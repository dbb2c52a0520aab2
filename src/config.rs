// src/config.rs

//! Engine configuration
//!
//! Loaded from TOML. Every field has a default, so an empty file (or no file
//! at all) yields a usable configuration.
//!
//! ```toml
//! cache_root = "/var/cache/corral"
//! detect_workers = 8
//! cache_workers = 4
//! acquire_attempts = 3
//! files_in_use_retry_ceiling = 10
//! execute_timeout_secs = 1800
//! lock_retries = 5
//! ```

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunables for a detect/plan/apply session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Package cache directory
    pub cache_root: PathBuf,

    /// Concurrent package detections
    pub detect_workers: usize,

    /// Concurrent payload acquisitions during the cache stage
    pub cache_workers: usize,

    /// Passes over the local, cached, download source chain per payload
    pub acquire_attempts: u32,

    /// Hard ceiling on files-in-use retries, applied on top of policy
    pub files_in_use_retry_ceiling: Option<u32>,

    /// Timeout for each command-backend process
    pub execute_timeout_secs: u64,

    /// Attempts to take the session lock before giving up
    pub lock_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_root: default_cache_root(),
            detect_workers: 4,
            cache_workers: 4,
            acquire_attempts: 3,
            files_in_use_retry_ceiling: None,
            execute_timeout_secs: 3600,
            lock_retries: 5,
        }
    }
}

fn default_cache_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("corral")
        .join("packages")
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::ConfigError(format!("cannot read {}: {}", path.display(), e))
        })?;
        let config: EngineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall the engine
    pub fn validate(&self) -> Result<()> {
        if self.detect_workers == 0 {
            return Err(Error::ConfigError("detect_workers must be at least 1".into()));
        }
        if self.cache_workers == 0 {
            return Err(Error::ConfigError("cache_workers must be at least 1".into()));
        }
        if self.acquire_attempts == 0 {
            return Err(Error::ConfigError("acquire_attempts must be at least 1".into()));
        }
        if self.execute_timeout_secs == 0 {
            return Err(Error::ConfigError(
                "execute_timeout_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn execute_timeout(&self) -> Duration {
        Duration::from_secs(self.execute_timeout_secs)
    }

    /// Builder-style override of the cache root
    pub fn with_cache_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cache_root = root.into();
        self
    }
}
