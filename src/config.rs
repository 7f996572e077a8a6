//! Pipeline configuration loading from environment variables or TOML.
//!
//! Values are loaded from `TRANSMISSION_*` environment variables with
//! sensible defaults. Invalid values fall back to defaults without crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `TRANSMISSION_BUFFER_CAPACITY` | 10000 | In-memory buffer capacity (items) |
//! | `TRANSMISSION_ENQUEUE_TIMEOUT_MS` | 100 | Bounded wait on a full buffer |
//! | `TRANSMISSION_BATCH_MAX_SIZE` | 100 | Max items per batch |
//! | `TRANSMISSION_BATCH_MAX_LINGER_MS` | 1000 | Max age of an open batch |
//! | `TRANSMISSION_BATCH_MAX_PENDING` | 16 | Sealed batches awaiting the sender |
//! | `TRANSMISSION_SPOOL_DIR` | ./transmission-spool | Overflow spool directory |
//! | `TRANSMISSION_SPOOL_POLL_MS` | 250 | Spool rescan interval when idle |
//! | `TRANSMISSION_RETRY_ATTEMPTS` | 5 | Send attempts per batch |
//! | `TRANSMISSION_RETRY_INITIAL_MS` | 100 | First backoff delay |
//! | `TRANSMISSION_RETRY_MAX_MS` | 10000 | Backoff ceiling |
//! | `TRANSMISSION_DISPOSE_TIMEOUT_MS` | 5000 | Bounded drain wait on close |

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::aggregator::AggregatorConfig;
use crate::buffer::BufferConfig;
use crate::sender::RetryConfig;
use crate::storage::StorageConfig;

/// Default bound on how long `close` waits for the stages to stop.
pub const DEFAULT_DISPOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid TOML: {0}")]
    Parse(String),
    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Complete pipeline configuration.
#[derive(Debug, Clone)]
pub struct TransmissionConfig {
    pub buffer: BufferConfig,
    pub aggregator: AggregatorConfig,
    pub storage: StorageConfig,
    pub retry: RetryConfig,
    pub dispose_timeout: Duration,
}

impl Default for TransmissionConfig {
    fn default() -> Self {
        Self {
            buffer: BufferConfig::default(),
            aggregator: AggregatorConfig::default(),
            storage: StorageConfig::default(),
            retry: RetryConfig::default(),
            dispose_timeout: DEFAULT_DISPOSE_TIMEOUT,
        }
    }
}

impl TransmissionConfig {
    /// Load configuration from `TRANSMISSION_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            buffer: load_buffer_config(),
            aggregator: load_aggregator_config(),
            storage: load_storage_config(),
            retry: load_retry_config(),
            dispose_timeout: parse_millis("TRANSMISSION_DISPOSE_TIMEOUT_MS", DEFAULT_DISPOSE_TIMEOUT),
        }
    }

    /// Parse a TOML document. Missing sections and fields take defaults.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let config = file.into_config();
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make a stage degenerate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer.capacity == 0 {
            return Err(invalid("buffer.capacity", "must be positive"));
        }
        if self.aggregator.max_batch_size == 0 {
            return Err(invalid("aggregator.max_batch_size", "must be positive"));
        }
        if self.aggregator.max_linger.is_zero() {
            return Err(invalid("aggregator.max_linger", "must be positive"));
        }
        if self.aggregator.max_pending_batches == 0 {
            return Err(invalid("aggregator.max_pending_batches", "must be positive"));
        }
        if self.storage.poll_interval.is_zero() {
            return Err(invalid("storage.poll_interval", "must be positive"));
        }
        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.retry.max_backoff < self.retry.initial_backoff {
            return Err(invalid("retry.max_backoff", "must not be below initial_backoff"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.to_string() }
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u32` env var, returning `default` on missing or invalid.
fn parse_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u32>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a millisecond env var into a `Duration`.
fn parse_millis(key: &str, default: Duration) -> Duration {
    match std::env::var(key) {
        Ok(val) => val
            .parse::<u64>()
            .ok()
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(default),
        Err(_) => default,
    }
}

fn load_buffer_config() -> BufferConfig {
    let defaults = BufferConfig::default();
    let capacity = parse_usize("TRANSMISSION_BUFFER_CAPACITY", defaults.capacity).max(1);
    let enqueue_timeout = parse_millis("TRANSMISSION_ENQUEUE_TIMEOUT_MS", defaults.enqueue_timeout);
    BufferConfig { capacity, enqueue_timeout }
}

fn load_aggregator_config() -> AggregatorConfig {
    let defaults = AggregatorConfig::default();
    AggregatorConfig {
        max_batch_size: parse_usize("TRANSMISSION_BATCH_MAX_SIZE", defaults.max_batch_size).max(1),
        max_linger: parse_millis("TRANSMISSION_BATCH_MAX_LINGER_MS", defaults.max_linger),
        max_pending_batches: parse_usize("TRANSMISSION_BATCH_MAX_PENDING", defaults.max_pending_batches)
            .max(1),
    }
}

fn load_storage_config() -> StorageConfig {
    let defaults = StorageConfig::default();
    let directory = std::env::var("TRANSMISSION_SPOOL_DIR")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or(defaults.directory);
    StorageConfig {
        directory,
        poll_interval: parse_millis("TRANSMISSION_SPOOL_POLL_MS", defaults.poll_interval),
    }
}

fn load_retry_config() -> RetryConfig {
    let defaults = RetryConfig::default();
    let max_attempts = parse_u32("TRANSMISSION_RETRY_ATTEMPTS", defaults.max_attempts).max(1);
    let initial_backoff = parse_millis("TRANSMISSION_RETRY_INITIAL_MS", defaults.initial_backoff);
    let max_backoff = parse_millis("TRANSMISSION_RETRY_MAX_MS", defaults.max_backoff).max(initial_backoff);
    RetryConfig { max_attempts, initial_backoff, max_backoff }
}

/// On-disk representation. Durations are expressed in milliseconds.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
    dispose_timeout_ms: Option<u64>,
    buffer: BufferSection,
    aggregator: AggregatorSection,
    storage: StorageSection,
    retry: RetrySection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct BufferSection {
    capacity: Option<usize>,
    enqueue_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct AggregatorSection {
    max_batch_size: Option<usize>,
    max_linger_ms: Option<u64>,
    max_pending_batches: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct StorageSection {
    directory: Option<PathBuf>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RetrySection {
    max_attempts: Option<u32>,
    initial_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
}

impl ConfigFile {
    fn into_config(self) -> TransmissionConfig {
        let d = TransmissionConfig::default();
        let ms = |v: Option<u64>, default: Duration| v.map(Duration::from_millis).unwrap_or(default);

        TransmissionConfig {
            buffer: BufferConfig {
                capacity: self.buffer.capacity.unwrap_or(d.buffer.capacity),
                enqueue_timeout: ms(self.buffer.enqueue_timeout_ms, d.buffer.enqueue_timeout),
            },
            aggregator: AggregatorConfig {
                max_batch_size: self.aggregator.max_batch_size.unwrap_or(d.aggregator.max_batch_size),
                max_linger: ms(self.aggregator.max_linger_ms, d.aggregator.max_linger),
                max_pending_batches: self
                    .aggregator
                    .max_pending_batches
                    .unwrap_or(d.aggregator.max_pending_batches),
            },
            storage: StorageConfig {
                directory: self.storage.directory.unwrap_or(d.storage.directory),
                poll_interval: ms(self.storage.poll_interval_ms, d.storage.poll_interval),
            },
            retry: RetryConfig {
                max_attempts: self.retry.max_attempts.unwrap_or(d.retry.max_attempts),
                initial_backoff: ms(self.retry.initial_backoff_ms, d.retry.initial_backoff),
                max_backoff: ms(self.retry.max_backoff_ms, d.retry.max_backoff),
            },
            dispose_timeout: ms(self.dispose_timeout_ms, d.dispose_timeout),
        }
    }
}
