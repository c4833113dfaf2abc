//! Retry decisions with configurable backoff and jitter.
//!
//! Transient failures are retried after an exponential (or linear, or
//! constant) backoff. Content rejections are retried at once with a mutated
//! payload. Each kind has its own budget.

use crate::config::RetryConfig;
use crate::errors::JobError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^retry
    #[default]
    Exponential,
    /// delay = base * (retry + 1)
    Linear,
    /// delay = base (constant)
    Constant,
}

/// Jitter strategy to prevent thundering herd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    #[default]
    Full,
    /// Half fixed, half random
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after `delay`, mutating the payload first if `mutate` is set.
    Retry {
        /// Wait before the next attempt.
        delay: Duration,
        /// The payload must be mutated before the next attempt.
        mutate: bool,
    },
    /// The error is retryable but its budget is spent.
    GiveUp,
    /// The error is not retryable.
    NotRetryable,
}

/// Retry bookkeeping for one job.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Transient retries taken so far.
    pub transient_retries: u32,
    /// Content-rejection retries taken so far.
    pub content_retries: u32,
    previous_delay_ms: Option<u64>,
}

impl RetryState {
    /// Creates a new retry state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Retries of either kind.
    #[must_use]
    pub fn total_retries(&self) -> u32 {
        self.transient_retries + self.content_retries
    }

    /// Decides what to do after `error`, consuming budget when retrying.
    pub fn decide(&mut self, error: &JobError, config: &RetryConfig) -> RetryDecision {
        match error {
            JobError::ContentRejected { .. } => {
                if self.content_retries >= config.max_content_retries {
                    return RetryDecision::GiveUp;
                }
                self.content_retries += 1;
                RetryDecision::Retry {
                    delay: Duration::ZERO,
                    mutate: true,
                }
            }
            JobError::TransientFailure { .. } => {
                if self.transient_retries >= config.max_transient_retries {
                    return RetryDecision::GiveUp;
                }
                let backoff = self.calculate_delay(config);
                let delay = backoff.max(error.retry_after().unwrap_or_default());
                self.transient_retries += 1;
                RetryDecision::Retry {
                    delay,
                    mutate: false,
                }
            }
            JobError::RateLimitTimeout { .. } | JobError::PermanentFailure { .. } => {
                RetryDecision::NotRetryable
            }
        }
    }

    /// Backoff before the next transient retry.
    #[must_use]
    pub fn calculate_delay(&mut self, config: &RetryConfig) -> Duration {
        let base = config.base_delay_ms;
        let max = config.max_delay_ms;
        let retry = self.transient_retries;

        let delay = match config.backoff_strategy {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(retry)).min(max),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(retry) + 1).min(max),
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match config.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let prev = self.previous_delay_ms.unwrap_or(base);
                let upper = prev.saturating_mul(3).min(max);
                let next = if upper <= base {
                    base
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                };
                self.previous_delay_ms = Some(next);
                next
            }
        };

        Duration::from_millis(jittered)
    }
}
