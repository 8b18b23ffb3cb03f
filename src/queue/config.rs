//! Queue configuration.
//!
//! A [`QueueConfig`] is immutable once a queue is constructed. Configurations
//! are usually resolved from a [`QueueSettings`] document that carries a
//! `default` section plus per-queue overrides:
//!
//! ```yaml
//! default:
//!   workers: 1
//!   boost_workers: 1
//!   queue_length: 100
//! queues:
//!   push_update:
//!     batch_length: 5
//!     backend:
//!       type: disk
//!       data_dir: /var/lib/forge/queues
//!   mirror:
//!     unique: true
//!     backend:
//!       type: redis
//!       addresses: "10.0.0.1:6379,10.0.0.2:6379"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default number of baseline workers.
pub const DEFAULT_WORKERS: usize = 1;
/// Default number of transient boost workers.
pub const DEFAULT_BOOST_WORKERS: usize = 1;
/// Default idle time before boost workers retire.
pub const DEFAULT_BOOST_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Default dequeue wait before re-polling.
pub const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(1);
/// Default maximum tasks per handler call.
pub const DEFAULT_BATCH_LENGTH: usize = 20;
/// Default in-memory buffer capacity.
pub const DEFAULT_QUEUE_LENGTH: usize = 100;
/// Default number of deliveries before a failing task is discarded.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Default fill ratio that triggers a boost.
pub const DEFAULT_HIGH_WATER_MARK: f64 = 0.8;

/// Prefix for configuration environment variables.
const ENV_PREFIX: &str = "FORGE_QUEUE";

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration value is invalid.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The settings document is not valid YAML.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Storage/transport used to hold pending tasks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Bounded in-process buffer; tasks are lost on crash.
    #[default]
    Memory,
    /// Remote list broker.
    Redis {
        /// Comma-separated `host:port` list; more than one means cluster mode.
        addresses: String,
        /// Optional password for single-node connections.
        #[serde(default)]
        password: Option<String>,
        /// Database index for single-node connections.
        #[serde(default)]
        db_index: i64,
    },
    /// In-memory buffer backed by an on-disk log.
    Disk {
        /// Root directory; each queue gets `<data_dir>/<name>`.
        data_dir: PathBuf,
        /// Fsync the log after every write.
        #[serde(default)]
        sync_writes: bool,
    },
}

impl BackendConfig {
    /// Short name used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::Memory => "memory",
            BackendConfig::Redis { .. } => "redis",
            BackendConfig::Disk { .. } => "disk",
        }
    }
}

/// Configuration for a single named queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Queue name, used for registries and backend namespaces.
    pub name: String,
    /// Baseline number of concurrent workers.
    pub workers: usize,
    /// Extra workers started when the buffer is nearly full.
    pub boost_workers: usize,
    /// Idle time after which boost workers retire.
    #[serde(with = "duration_ms")]
    pub boost_timeout: Duration,
    /// Maximum wait for a dequeue before polling again.
    #[serde(with = "duration_ms")]
    pub block_timeout: Duration,
    /// Maximum tasks delivered to the handler per call.
    pub batch_length: usize,
    /// Capacity of the in-memory buffer.
    pub queue_length: usize,
    /// Deliveries before a failing task is discarded; 0 retries forever.
    pub max_attempts: u32,
    /// Buffer fill ratio that triggers a boost.
    pub high_water_mark: f64,
    /// Deduplicate in-flight tasks by identity.
    pub unique: bool,
    /// Backend holding pending tasks.
    pub backend: BackendConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            workers: DEFAULT_WORKERS,
            boost_workers: DEFAULT_BOOST_WORKERS,
            boost_timeout: DEFAULT_BOOST_TIMEOUT,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            batch_length: DEFAULT_BATCH_LENGTH,
            queue_length: DEFAULT_QUEUE_LENGTH,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            unique: false,
            backend: BackendConfig::Memory,
        }
    }
}

impl QueueConfig {
    /// Creates a configuration with default values for the named queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Sets the baseline worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Sets the boost worker count.
    pub fn with_boost_workers(mut self, boost_workers: usize) -> Self {
        self.boost_workers = boost_workers;
        self
    }

    /// Sets the boost idle timeout.
    pub fn with_boost_timeout(mut self, timeout: Duration) -> Self {
        self.boost_timeout = timeout;
        self
    }

    /// Sets the dequeue block timeout.
    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    /// Sets the maximum batch length.
    pub fn with_batch_length(mut self, batch_length: usize) -> Self {
        self.batch_length = batch_length;
        self
    }

    /// Sets the in-memory buffer capacity.
    pub fn with_queue_length(mut self, queue_length: usize) -> Self {
        self.queue_length = queue_length;
        self
    }

    /// Sets the delivery cap for failing tasks.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sets the boost high-water mark.
    pub fn with_high_water_mark(mut self, ratio: f64) -> Self {
        self.high_water_mark = ratio;
        self
    }

    /// Enables or disables in-flight deduplication.
    pub fn with_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Sets the backend.
    pub fn with_backend(mut self, backend: BackendConfig) -> Self {
        self.backend = backend;
        self
    }

    /// Upper bound on live workers.
    pub fn max_workers(&self) -> usize {
        self.workers + self.boost_workers
    }

    /// Checks the configuration for values the queue cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "queue name must not be empty".to_string(),
            ));
        }
        if self.name.contains(['/', '\\']) || self.name == "." || self.name == ".." {
            return Err(ConfigError::InvalidValue {
                key: "name".to_string(),
                message: format!("'{}' cannot be used as a directory name", self.name),
            });
        }
        if self.queue_length == 0 {
            return Err(ConfigError::InvalidValue {
                key: "queue_length".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.batch_length == 0 {
            return Err(ConfigError::InvalidValue {
                key: "batch_length".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.max_workers() == 0 {
            return Err(ConfigError::ValidationFailed(
                "workers and boost_workers cannot both be 0".to_string(),
            ));
        }
        if self.block_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "block_timeout".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.high_water_mark) {
            return Err(ConfigError::InvalidValue {
                key: "high_water_mark".to_string(),
                message: format!("{} is not within 0.0..=1.0", self.high_water_mark),
            });
        }
        match &self.backend {
            BackendConfig::Redis { addresses, .. } if parse_addresses(addresses).is_empty() => {
                Err(ConfigError::InvalidValue {
                    key: "addresses".to_string(),
                    message: "no redis host found".to_string(),
                })
            }
            BackendConfig::Disk { data_dir, .. } if data_dir.as_os_str().is_empty() => {
                Err(ConfigError::InvalidValue {
                    key: "data_dir".to_string(),
                    message: "must not be empty".to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Applies `<prefix>_<FIELD>` environment overrides.
    fn apply_env_with_prefix(&mut self, prefix: &str) -> Result<(), ConfigError> {
        if let Some(v) = env_parse::<usize>(prefix, "WORKERS")? {
            self.workers = v;
        }
        if let Some(v) = env_parse::<usize>(prefix, "BOOST_WORKERS")? {
            self.boost_workers = v;
        }
        if let Some(v) = env_parse::<u64>(prefix, "BOOST_TIMEOUT_MS")? {
            self.boost_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>(prefix, "BLOCK_TIMEOUT_MS")? {
            self.block_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<usize>(prefix, "BATCH_LENGTH")? {
            self.batch_length = v;
        }
        if let Some(v) = env_parse::<usize>(prefix, "QUEUE_LENGTH")? {
            self.queue_length = v;
        }
        if let Some(v) = env_parse::<u32>(prefix, "MAX_ATTEMPTS")? {
            self.max_attempts = v;
        }
        if let Some(v) = env_parse::<bool>(prefix, "UNIQUE")? {
            self.unique = v;
        }
        if let Some(addresses) = env_string(prefix, "REDIS_ADDRESSES") {
            let (password, db_index) = match &self.backend {
                BackendConfig::Redis {
                    password, db_index, ..
                } => (password.clone(), *db_index),
                _ => (None, 0),
            };
            self.backend = BackendConfig::Redis {
                addresses,
                password: env_string(prefix, "REDIS_PASSWORD").or(password),
                db_index: env_parse::<i64>(prefix, "REDIS_DB")?.unwrap_or(db_index),
            };
        } else if let Some(dir) = env_string(prefix, "DATA_DIR") {
            self.backend = BackendConfig::Disk {
                data_dir: PathBuf::from(dir),
                sync_writes: env_parse::<bool>(prefix, "SYNC_WRITES")?.unwrap_or(false),
            };
        }
        Ok(())
    }
}

/// Splits a comma-separated address list, dropping blanks.
pub fn parse_addresses(addresses: &str) -> Vec<String> {
    addresses
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

/// Settings document covering every queue in the process.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    /// Values applied to every queue.
    pub default: QueueConfig,
    /// Per-queue overrides, keyed by queue name.
    pub queues: HashMap<String, serde_yaml::Value>,
}

impl QueueSettings {
    /// Creates settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses settings from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Reads settings from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Applies environment overrides to the default section.
    ///
    /// # Environment Variables
    ///
    /// - `FORGE_QUEUE_WORKERS`, `FORGE_QUEUE_BOOST_WORKERS`
    /// - `FORGE_QUEUE_BOOST_TIMEOUT_MS`, `FORGE_QUEUE_BLOCK_TIMEOUT_MS`
    /// - `FORGE_QUEUE_BATCH_LENGTH`, `FORGE_QUEUE_QUEUE_LENGTH`
    /// - `FORGE_QUEUE_MAX_ATTEMPTS`, `FORGE_QUEUE_UNIQUE`
    /// - `FORGE_QUEUE_REDIS_ADDRESSES`, `FORGE_QUEUE_REDIS_PASSWORD`, `FORGE_QUEUE_REDIS_DB`
    /// - `FORGE_QUEUE_DATA_DIR`, `FORGE_QUEUE_SYNC_WRITES`
    ///
    /// Per-queue overrides use `FORGE_QUEUE_<NAME>_<FIELD>` and are applied
    /// by [`QueueSettings::config_for`].
    pub fn apply_env(mut self) -> Result<Self, ConfigError> {
        self.default.apply_env_with_prefix(ENV_PREFIX)?;
        Ok(self)
    }

    /// Resolves the configuration for a named queue.
    ///
    /// Per-queue YAML keys override the default section, then
    /// `FORGE_QUEUE_<NAME>_*` variables override both.
    pub fn config_for(&self, name: &str) -> Result<QueueConfig, ConfigError> {
        let mut merged = serde_yaml::to_value(&self.default)?;
        if let Some(overrides) = self.queues.get(name) {
            merge_yaml(&mut merged, overrides);
        }

        let mut config: QueueConfig = serde_yaml::from_value(merged)?;
        config.name = name.to_string();

        let prefix = format!("{}_{}", ENV_PREFIX, name.to_uppercase().replace('-', "_"));
        config.apply_env_with_prefix(&prefix)?;
        config.validate()?;
        Ok(config)
    }
}

/// Recursively overlays `overrides` onto `base`.
///
/// Mappings merge key by key, except that a `backend` override replaces the
/// whole backend section so fields never leak between backend kinds.
fn merge_yaml(base: &mut serde_yaml::Value, overrides: &serde_yaml::Value) {
    match (base, overrides) {
        (serde_yaml::Value::Mapping(base_map), serde_yaml::Value::Mapping(over_map)) => {
            for (key, value) in over_map {
                if key.as_str() != Some("backend") {
                    if let Some(existing) = base_map.get_mut(key) {
                        merge_yaml(existing, value);
                        continue;
                    }
                }
                base_map.insert(key.clone(), value.clone());
            }
        }
        (base, overrides) => *base = overrides.clone(),
    }
}

fn env_string(prefix: &str, field: &str) -> Option<String> {
    std::env::var(format!("{}_{}", prefix, field))
        .ok()
        .filter(|v| !v.is_empty())
}

fn env_parse<T>(prefix: &str, field: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let key = format!("{}_{}", prefix, field);
    match env_string(prefix, field) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key,
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

/// Serializes durations as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
