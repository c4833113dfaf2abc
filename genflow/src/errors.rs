//! Error types for the genflow engine.
//!
//! Two families live here. [`GenflowError`] and its component errors cover
//! construction and infrastructure failures (bad configuration, unknown
//! limiter, unreadable cache record). [`JobError`] is the per-job taxonomy
//! that pipeline stages return as a value and that the batch executor turns
//! into a failed [`JobResult`](crate::executor::JobResult).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// The main error type for genflow operations.
#[derive(Debug, Error)]
pub enum GenflowError {
    /// A limiter operation failed.
    #[error("{0}")]
    Limiter(#[from] LimiterError),

    /// A cache operation failed.
    #[error("{0}")]
    Cache(#[from] CacheError),

    /// Configuration was rejected at construction.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A pipeline could not be assembled.
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A global subscriber could not be installed.
    #[error("Tracing init error: {0}")]
    Tracing(String),
}

impl From<serde_json::Error> for GenflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors raised by limiters and the limiter registry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LimiterError {
    /// No limiter is registered under the name.
    #[error("Limiter not found: {name}")]
    NotFound {
        /// The requested limiter name.
        name: String,
    },

    /// The request can never be satisfied by this limiter.
    #[error("Requested {requested} units but limiter capacity is {capacity}")]
    ExceedsCapacity {
        /// Units requested.
        requested: f64,
        /// Maximum units the limiter can ever grant at once.
        capacity: f64,
    },

    /// The requested amount is zero, negative or not finite.
    #[error("Invalid acquire amount: {requested}")]
    InvalidAmount {
        /// Units requested.
        requested: f64,
    },
}

impl LimiterError {
    /// Creates a not found error.
    #[must_use]
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Checks `n` against `capacity`, returning the matching error if the
    /// request is malformed or can never succeed.
    pub fn check_request(n: f64, capacity: f64) -> Result<(), Self> {
        if !n.is_finite() || n <= 0.0 {
            return Err(Self::InvalidAmount { requested: n });
        }
        if n > capacity {
            return Err(Self::ExceedsCapacity {
                requested: n,
                capacity,
            });
        }
        Ok(())
    }
}

/// Errors raised by cache implementations and persistence backends.
#[derive(Debug, Error)]
pub enum CacheError {
    /// IO error from a persistence backend.
    #[error("Cache IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded.
    #[error("Cache serialization error: {0}")]
    Serialization(String),

    /// A persisted record is unreadable.
    #[error("Corrupt cache record '{id}': {reason}")]
    Corrupt {
        /// Backend record id.
        id: String,
        /// What was wrong with it.
        reason: String,
    },

    /// A single record is larger than the whole byte budget.
    #[error("Cache record of {size} bytes exceeds budget of {budget} bytes")]
    TooLarge {
        /// Encoded record size.
        size: u64,
        /// Configured byte budget.
        budget: u64,
    },

    /// A backend-specific failure.
    #[error("Cache backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Errors raised while validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A field holds an unusable value.
    #[error("Invalid config field '{field}': {reason}")]
    Invalid {
        /// Dotted field path.
        field: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The configuration document could not be parsed.
    #[error("Config parse error: {0}")]
    Parse(String),
}

impl ConfigError {
    /// Creates an invalid field error.
    #[must_use]
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// The kind of a [`JobError`], without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobErrorKind {
    /// Waiting for limiter capacity exceeded its deadline.
    RateLimitTimeout,
    /// The external service flagged the payload.
    ContentRejected,
    /// A retryable network or server-side failure.
    TransientFailure,
    /// A non-retryable failure.
    PermanentFailure,
}

impl fmt::Display for JobErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimitTimeout => write!(f, "rate_limit_timeout"),
            Self::ContentRejected => write!(f, "content_rejected"),
            Self::TransientFailure => write!(f, "transient_failure"),
            Self::PermanentFailure => write!(f, "permanent_failure"),
        }
    }
}

/// A job-level failure, returned by pipeline stages as a value.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobError {
    /// `wait_for_token` exceeded its deadline.
    #[error("Rate limit wait timed out after {timeout_ms}ms")]
    RateLimitTimeout {
        /// The wait deadline in milliseconds.
        timeout_ms: u64,
    },

    /// The external call flagged the payload.
    #[error("Content rejected: {reason}")]
    ContentRejected {
        /// Service-provided reason.
        reason: String,
        /// Terms the service reported as offending, if any.
        #[serde(default)]
        flagged_terms: Vec<String>,
    },

    /// A retryable failure (timeout, connection, 5xx, remote rate limit).
    #[error("Transient failure: {message}")]
    TransientFailure {
        /// Failure description.
        message: String,
        /// Minimum delay the remote asked for before retrying.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },

    /// A non-retryable failure.
    #[error("Permanent failure: {message}")]
    PermanentFailure {
        /// Failure description.
        message: String,
    },
}

impl JobError {
    /// Creates a rate limit timeout error.
    #[must_use]
    pub fn rate_limit_timeout(timeout: Duration) -> Self {
        Self::RateLimitTimeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Creates a content rejected error.
    #[must_use]
    pub fn content_rejected(reason: impl Into<String>, flagged_terms: Vec<String>) -> Self {
        Self::ContentRejected {
            reason: reason.into(),
            flagged_terms,
        }
    }

    /// Creates a transient failure.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::TransientFailure {
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Creates a transient failure carrying a remote retry-after hint.
    #[must_use]
    pub fn transient_after(message: impl Into<String>, retry_after: Duration) -> Self {
        Self::TransientFailure {
            message: message.into(),
            retry_after_ms: Some(u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX)),
        }
    }

    /// Creates a permanent failure.
    #[must_use]
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::PermanentFailure {
            message: message.into(),
        }
    }

    /// Classifies an HTTP-like status code returned by a remote service.
    ///
    /// 408, 429 and 5xx are transient; every other 4xx is permanent.
    #[must_use]
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = format!("status {status}: {}", message.into());
        match status {
            408 | 429 | 500..=599 => Self::transient(message),
            _ => Self::permanent(message),
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub fn kind(&self) -> JobErrorKind {
        match self {
            Self::RateLimitTimeout { .. } => JobErrorKind::RateLimitTimeout,
            Self::ContentRejected { .. } => JobErrorKind::ContentRejected,
            Self::TransientFailure { .. } => JobErrorKind::TransientFailure,
            Self::PermanentFailure { .. } => JobErrorKind::PermanentFailure,
        }
    }

    /// Returns true if the executor may retry the job after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ContentRejected { .. } | Self::TransientFailure { .. }
        )
    }

    /// Returns the remote retry-after hint, if any.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::TransientFailure {
                retry_after_ms: Some(ms),
                ..
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.kind().to_string()));
        map.insert("retryable".to_string(), serde_json::json!(self.is_retryable()));

        match self {
            Self::RateLimitTimeout { timeout_ms } => {
                map.insert("timeout_ms".to_string(), serde_json::json!(timeout_ms));
            }
            Self::ContentRejected {
                reason,
                flagged_terms,
            } => {
                map.insert("reason".to_string(), serde_json::json!(reason));
                map.insert("flagged_terms".to_string(), serde_json::json!(flagged_terms));
            }
            Self::TransientFailure {
                retry_after_ms, ..
            } => {
                if let Some(ms) = retry_after_ms {
                    map.insert("retry_after_ms".to_string(), serde_json::json!(ms));
                }
            }
            Self::PermanentFailure { .. } => {}
        }

        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map
    }
}
