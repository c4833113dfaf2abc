//! Typed configuration for limiters, caches and the batch executor.
//!
//! Every component is built from one of these structs. Values are validated
//! once at construction and never re-read afterwards.

use crate::cache::RecordFormat;
use crate::errors::ConfigError;
use crate::executor::{BackoffStrategy, JitterStrategy};
use crate::limiter::LimiterStrategy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

fn ensure_positive(field: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(field, format!("must be a positive number, got {value}")))
    }
}

/// Configuration for a single limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Throttling algorithm.
    #[serde(default)]
    pub strategy: LimiterStrategy,
    /// Units per second for bucket strategies, units per window for window strategies.
    pub rate: f64,
    /// Bucket size, or the largest single grant for a leaky bucket. Defaults to `rate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<f64>,
    /// Window length in seconds for window strategies.
    #[serde(default = "default_window_size")]
    pub window_size_secs: f64,
    /// Sleep between attempts inside `wait_for_token`.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

fn default_window_size() -> f64 {
    1.0
}

fn default_poll_interval() -> u64 {
    20
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            strategy: LimiterStrategy::default(),
            rate: 10.0,
            capacity: None,
            window_size_secs: default_window_size(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl LimiterConfig {
    /// Creates a config for the given rate with defaults elsewhere.
    #[must_use]
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            ..Self::default()
        }
    }

    /// Sets the strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: LimiterStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the capacity.
    #[must_use]
    pub fn with_capacity(mut self, capacity: f64) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Sets the window size.
    #[must_use]
    pub fn with_window_size(mut self, window: Duration) -> Self {
        self.window_size_secs = window.as_secs_f64();
        self
    }

    /// Sets the `wait_for_token` polling interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Effective capacity.
    #[must_use]
    pub fn capacity(&self) -> f64 {
        self.capacity.unwrap_or(self.rate)
    }

    /// Window size as a duration.
    #[must_use]
    pub fn window_size(&self) -> Duration {
        Duration::try_from_secs_f64(self.window_size_secs).unwrap_or(Duration::from_secs(1))
    }

    /// Polling interval as a duration.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_positive("rate", self.rate)?;
        ensure_positive("capacity", self.capacity())?;
        ensure_positive("window_size_secs", self.window_size_secs)?;
        // Sub-nanosecond and out-of-range windows have no usable Duration.
        let window = Duration::try_from_secs_f64(self.window_size_secs).unwrap_or_default();
        if window.is_zero() {
            return Err(ConfigError::invalid(
                "window_size_secs",
                format!("must be representable as at least 1ns, got {}", self.window_size_secs),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("poll_interval_ms", "must be at least 1ms"));
        }
        Ok(())
    }
}

/// Configuration for the durable cache variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableCacheConfig {
    /// Directory holding one record file per key.
    pub dir: PathBuf,
    /// Total byte budget across all records.
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    /// Record encoding.
    #[serde(default)]
    pub format: RecordFormat,
}

pub(crate) fn default_max_bytes() -> u64 {
    256 * 1024 * 1024 // 256MB
}

impl DurableCacheConfig {
    /// Creates a durable config rooted at `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_bytes: default_max_bytes(),
            format: RecordFormat::default(),
        }
    }

    /// Sets the byte budget.
    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Sets the record format.
    #[must_use]
    pub fn with_format(mut self, format: RecordFormat) -> Self {
        self.format = format;
        self
    }
}

/// Configuration for a cache instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries.
    #[serde(default = "default_max_size")]
    pub max_size: usize,
    /// TTL applied when `set` gets none. 0 means entries never expire.
    #[serde(default = "default_ttl")]
    pub default_ttl_secs: f64,
    /// Persist entries instead of keeping them in memory only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub durable: Option<DurableCacheConfig>,
}

fn default_max_size() -> usize {
    1000
}

fn default_ttl() -> f64 {
    3600.0
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            default_ttl_secs: default_ttl(),
            durable: None,
        }
    }
}

impl CacheConfig {
    /// Creates a new cache configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum entry count.
    #[must_use]
    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    /// Sets the default TTL. `Duration::ZERO` disables expiry.
    #[must_use]
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl_secs = ttl.as_secs_f64();
        self
    }

    /// Makes the cache durable.
    #[must_use]
    pub fn with_durable(mut self, durable: DurableCacheConfig) -> Self {
        self.durable = Some(durable);
        self
    }

    /// Default TTL as a duration.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::try_from_secs_f64(self.default_ttl_secs).unwrap_or(Duration::ZERO)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::invalid("max_size", "must be at least 1"));
        }
        if !self.default_ttl_secs.is_finite() || self.default_ttl_secs < 0.0 {
            return Err(ConfigError::invalid(
                "default_ttl_secs",
                format!("must be zero or positive, got {}", self.default_ttl_secs),
            ));
        }
        if let Some(durable) = &self.durable {
            if durable.max_bytes == 0 {
                return Err(ConfigError::invalid("durable.max_bytes", "must be at least 1"));
            }
            if durable.dir.as_os_str().is_empty() {
                return Err(ConfigError::invalid("durable.dir", "must not be empty"));
            }
        }
        Ok(())
    }
}

/// Retry behaviour for failed jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries allowed for transient failures.
    #[serde(default = "default_transient_retries", alias = "retry_max")]
    pub max_transient_retries: u32,
    /// Retries allowed after content rejection, each with a mutated payload.
    #[serde(default = "default_content_retries")]
    pub max_content_retries: u32,
    /// Base delay between retries in milliseconds.
    #[serde(default = "default_base_delay", alias = "backoff_base")]
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Backoff strategy.
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    #[serde(default)]
    pub jitter_strategy: JitterStrategy,
}

fn default_transient_retries() -> u32 {
    3
}

fn default_content_retries() -> u32 {
    2
}

fn default_base_delay() -> u64 {
    500
}

fn default_max_delay() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_transient_retries: default_transient_retries(),
            max_content_retries: default_content_retries(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::Full,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the transient retry budget.
    #[must_use]
    pub fn with_max_transient_retries(mut self, retries: u32) -> Self {
        self.max_transient_retries = retries;
        self
    }

    /// Sets the content-rejection retry budget.
    #[must_use]
    pub fn with_max_content_retries(mut self, retries: u32) -> Self {
        self.max_content_retries = retries;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::invalid(
                "retry.max_delay_ms",
                "must not be smaller than base_delay_ms",
            ));
        }
        Ok(())
    }
}

/// Configuration for the batch executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Default cap on in-flight jobs.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Retry behaviour.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_max_concurrency() -> usize {
    4
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            retry: RetryConfig::default(),
        }
    }
}

impl ExecutorConfig {
    /// Creates a new executor config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default concurrency cap.
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::invalid("max_concurrency", "must be at least 1"));
        }
        self.retry.validate()
    }
}

/// Top-level configuration handed over by the application layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenflowConfig {
    /// Named limiters, one per endpoint.
    #[serde(default)]
    pub limiters: BTreeMap<String, LimiterConfig>,
    /// Cache configuration.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Executor configuration.
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl GenflowConfig {
    /// Parses and validates a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section, prefixing field paths with the section name.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, limiter) in &self.limiters {
            limiter.validate().map_err(|e| prefix(&format!("limiters.{name}"), e))?;
        }
        self.cache.validate().map_err(|e| prefix("cache", e))?;
        self.executor.validate().map_err(|e| prefix("executor", e))?;
        Ok(())
    }
}

fn prefix(section: &str, err: ConfigError) -> ConfigError {
    match err {
        ConfigError::Invalid { field, reason } => ConfigError::Invalid {
            field: format!("{section}.{field}"),
            reason,
        },
        other => other,
    }
}
