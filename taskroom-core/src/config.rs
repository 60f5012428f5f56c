//! Configuration loading for the Taskroom sync engine.
//!
//! Durations are given in milliseconds in TOML. `Default` carries the
//! reference values; a loaded file must spell out every field.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Retry policy applied to each operation during one drain pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Attempts per operation before the pass stops (>= 1).
    pub attempts_per_pass: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl RetryConfig {
    /// Backoff before the given retry (1-based), capped at `max_backoff_ms`.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(16) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.powi(exp);
        Duration::from_millis((millis as u64).min(self.max_backoff_ms))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts_per_pass: 1,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Key prefix owning every local entry this engine writes.
    pub namespace: String,
    pub store_path: PathBuf,
    pub store_max_size_mb: usize,
    pub cache_ttl_ms: u64,
    pub write_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Consecutive heartbeat failures before heartbeats pause until the
    /// next online transition.
    pub heartbeat_max_failures: u32,
    pub record_retention_days: u32,
    pub drain_retry: RetryConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            namespace: "taskroom".to_string(),
            store_path: PathBuf::from("taskroom-cache"),
            store_max_size_mb: 64,
            cache_ttl_ms: 24 * 60 * 60 * 1000,
            write_timeout_ms: 15_000,
            heartbeat_interval_ms: 5 * 60 * 1000,
            heartbeat_max_failures: 6,
            record_retention_days: 30,
            drain_retry: RetryConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.namespace.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "namespace",
                reason: "must not be empty".to_string(),
            });
        }
        if self.store_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "store_path",
                reason: "must not be empty".to_string(),
            });
        }
        if self.store_max_size_mb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "store_max_size_mb",
                reason: "must be > 0".to_string(),
            });
        }
        if self.cache_ttl_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "cache_ttl_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "write_timeout_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "heartbeat_interval_ms",
                reason: "must be > 0".to_string(),
            });
        }
        if self.heartbeat_max_failures == 0 {
            return Err(ConfigError::InvalidValue {
                field: "heartbeat_max_failures",
                reason: "must be > 0".to_string(),
            });
        }
        if self.record_retention_days == 0 {
            return Err(ConfigError::InvalidValue {
                field: "record_retention_days",
                reason: "must be > 0".to_string(),
            });
        }
        if self.drain_retry.attempts_per_pass == 0 {
            return Err(ConfigError::InvalidValue {
                field: "drain_retry.attempts_per_pass",
                reason: "must be >= 1".to_string(),
            });
        }
        if self.drain_retry.max_backoff_ms < self.drain_retry.initial_backoff_ms {
            return Err(ConfigError::InvalidValue {
                field: "drain_retry.max_backoff_ms",
                reason: "must be >= initial_backoff_ms".to_string(),
            });
        }
        if self.drain_retry.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue {
                field: "drain_retry.multiplier",
                reason: "must be >= 1.0".to_string(),
            });
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.cache_ttl_ms as i64)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn record_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.record_retention_days as i64)
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var("TASKROOM_CONFIG").ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
