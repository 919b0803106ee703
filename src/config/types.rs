use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::telemetry::TracingConfig;

/// Root configuration for dispatchd
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Log fed by `dispatch()`
    #[serde(default = "default_instant_queue")]
    pub instant_queue: QueueConfig,

    /// Retry tiers, in escalation order
    #[serde(default = "default_delayed_queues")]
    pub delayed_queues: Vec<DelayedQueueConfig>,

    /// Backoff between tiers
    #[serde(default)]
    pub retry: RetryConfig,

    /// Processor loop tuning
    #[serde(default)]
    pub processor: ProcessorConfig,

    /// Storage backend
    #[serde(default)]
    pub store: StoreConfig,

    /// Mock connector used by the daemon
    #[serde(default)]
    pub connector: ConnectorConfig,

    /// Logging
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instant_queue: default_instant_queue(),
            delayed_queues: default_delayed_queues(),
            retry: RetryConfig::default(),
            processor: ProcessorConfig::default(),
            store: StoreConfig::default(),
            connector: ConnectorConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Config {
    /// Visibility delay of delayed tier `tier`.
    pub fn tier_delay(&self, tier: usize) -> Duration {
        self.delayed_queues
            .get(tier)
            .and_then(|q| q.delay)
            .unwrap_or_else(|| self.retry.backoff(tier as u32))
    }
}

fn default_instant_queue() -> QueueConfig {
    QueueConfig::new("instant", default_max_queue_length())
}

fn default_delayed_queues() -> Vec<DelayedQueueConfig> {
    (0..3)
        .map(|i| DelayedQueueConfig::new(QueueConfig::new(format!("delayed-{i}"), default_max_queue_length())))
        .collect()
}

// =============================================================================
// Queues
// =============================================================================

/// Settings of one reliable log.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct QueueConfig {
    /// Queue name; also names its store partitions
    pub name: String,

    /// Ring size. One slot stays free, so capacity is one less.
    #[serde(default = "default_max_queue_length")]
    pub max_queue_length: i64,

    /// How long a message stays deliverable after its send time
    #[serde(default = "default_event_ttl", with = "humantime_serde")]
    pub event_time_to_live: Duration,

    /// Return append failures to the caller instead of logging them
    #[serde(default)]
    pub strict_append: bool,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, max_queue_length: i64) -> Self {
        Self {
            name: name.into(),
            max_queue_length,
            event_time_to_live: default_event_ttl(),
            strict_append: false,
        }
    }

    pub fn with_strict_append(mut self, strict: bool) -> Self {
        self.strict_append = strict;
        self
    }

    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.event_time_to_live = ttl;
        self
    }
}

fn default_max_queue_length() -> i64 {
    100_000
}

fn default_event_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

/// A retry tier: a queue plus an optional fixed visibility delay.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DelayedQueueConfig {
    #[serde(flatten)]
    pub queue: QueueConfig,

    /// Overrides the backoff computed from `retry`
    #[serde(default, with = "humantime_serde::option")]
    pub delay: Option<Duration>,
}

impl DelayedQueueConfig {
    pub fn new(queue: QueueConfig) -> Self {
        Self { queue, delay: None }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Exponential backoff between tiers.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay", with = "humantime_serde")]
    pub base_delay: Duration,

    #[serde(default = "default_max_delay", with = "humantime_serde")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
        }
    }
}

impl RetryConfig {
    /// `base_delay * 2^attempt`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let delay = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        let capped = delay.min(self.max_delay.as_millis() as u64);
        Duration::from_millis(capped)
    }
}

fn default_base_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60 * 60)
}

// =============================================================================
// Processors
// =============================================================================

/// Processor loop tuning, shared by every tier.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    /// Records per read
    #[serde(default = "default_read_batch_size")]
    pub read_batch_size: usize,

    /// How long a read waits for data before the loop goes around
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,

    /// Connector calls in flight per processor
    #[serde(default = "default_delivery_concurrency")]
    pub delivery_concurrency: usize,

    /// Grace period for shutdown
    #[serde(default = "default_close_timeout", with = "humantime_serde")]
    pub close_timeout: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            read_batch_size: default_read_batch_size(),
            read_timeout: default_read_timeout(),
            delivery_concurrency: default_delivery_concurrency(),
            close_timeout: default_close_timeout(),
        }
    }
}

fn default_read_batch_size() -> usize {
    100
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(1)
}

fn default_delivery_concurrency() -> usize {
    16
}

fn default_close_timeout() -> Duration {
    Duration::from_secs(10)
}

// =============================================================================
// Store
// =============================================================================

/// Storage configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    /// Storage backend type
    #[serde(default)]
    pub backend: StorageBackend,

    /// Fjall-specific settings
    #[serde(default)]
    pub fjall: FjallConfig,
}

impl StoreConfig {
    pub fn memory() -> Self {
        Self {
            backend: StorageBackend::Memory,
            fjall: FjallConfig::default(),
        }
    }

    pub fn fjall(path: impl Into<PathBuf>) -> Self {
        Self {
            backend: StorageBackend::Fjall,
            fjall: FjallConfig {
                path: Some(path.into()),
            },
        }
    }
}

/// Storage backend type
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-memory storage (volatile)
    #[default]
    Memory,
    /// Fjall LSM-tree storage (persistent)
    Fjall,
}

/// Fjall storage configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FjallConfig {
    /// Data directory. Defaults to the platform data dir.
    pub path: Option<PathBuf>,
}

// =============================================================================
// Connector
// =============================================================================

/// Mock connector configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    /// Response type
    #[serde(default)]
    pub response: MockResponse,

    /// Fraction of calls failing transiently in `random` mode
    #[serde(default = "default_error_rate")]
    pub error_rate: f32,

    /// Simulated latency
    #[serde(default, with = "humantime_serde")]
    pub latency: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            response: MockResponse::default(),
            error_rate: default_error_rate(),
            latency: Duration::ZERO,
        }
    }
}

fn default_error_rate() -> f32 {
    0.1
}

/// Mock response type
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MockResponse {
    /// Every target delivered
    #[default]
    Success,
    /// Every target rejected permanently
    Error,
    /// Every target failed transiently
    Retry,
    /// Transient failures at `error_rate`
    Random,
}

// =============================================================================
// Telemetry
// =============================================================================

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

impl TelemetryConfig {
    pub fn tracing_config(&self) -> TracingConfig {
        TracingConfig {
            log_level: self.log_level.clone(),
            json_logs: self.json_logs,
            ..TracingConfig::default()
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Humantime duration deserialization
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
