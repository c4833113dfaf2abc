//! Rate limiters.
//!
//! This module provides:
//! - A uniform [`Limiter`] contract shared by four strategies
//! - Token-bucket, fixed-window, sliding-window and leaky-bucket implementations
//! - A [`LimiterRegistry`] of independent named limiters
//!
//! All limiter state sits behind a `parking_lot` mutex and is only touched
//! through the public methods, so one instance can be shared by reference
//! across tasks and threads. Time is read through `tokio::time::Instant`,
//! which is the process clock unless a paused test runtime is driving it.

mod fixed_window;
mod leaky_bucket;
mod registry;
mod sliding_window;
mod token_bucket;

pub use fixed_window::FixedWindow;
pub use leaky_bucket::LeakyBucket;
pub use registry::LimiterRegistry;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

use crate::config::LimiterConfig;
use crate::errors::{ConfigError, LimiterError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Throttling algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterStrategy {
    /// Continuous refill up to a burst capacity.
    #[default]
    TokenBucket,
    /// Counter reset at aligned window boundaries.
    FixedWindow,
    /// Log of grants over a moving window.
    SlidingWindow,
    /// Queue drained at a constant rate.
    LeakyBucket,
}

impl fmt::Display for LimiterStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokenBucket => write!(f, "token_bucket"),
            Self::FixedWindow => write!(f, "fixed_window"),
            Self::SlidingWindow => write!(f, "sliding_window"),
            Self::LeakyBucket => write!(f, "leaky_bucket"),
        }
    }
}

/// Uniform throttling contract.
///
/// `try_acquire` never blocks. The `wait_for_token` variants retry it every
/// [`poll_interval`](Limiter::poll_interval) until it succeeds or the
/// timeout passes. A timed-out wait consumes nothing. No ordering is
/// promised between competing waiters: whichever polls first after capacity
/// frees up wins.
#[async_trait]
pub trait Limiter: Send + Sync + fmt::Debug {
    /// Returns the strategy implemented by this limiter.
    fn strategy(&self) -> LimiterStrategy;

    /// Units per second, or units per window for window strategies.
    fn rate(&self) -> f64;

    /// Largest amount a single acquire can ever be granted.
    fn capacity(&self) -> f64;

    /// Interval between attempts inside `wait_for_token`.
    fn poll_interval(&self) -> Duration;

    /// Attempts to take `n` units without waiting.
    ///
    /// Returns `Ok(false)` and leaves state untouched when capacity is short.
    /// Requests larger than [`capacity`](Limiter::capacity) fail with
    /// [`LimiterError::ExceedsCapacity`] since they could never succeed.
    fn try_acquire(&self, n: f64) -> Result<bool, LimiterError>;

    /// Units that could be acquired right now.
    fn available(&self) -> f64;

    /// Restores the initial state.
    fn reset(&self);

    /// Waits up to `timeout` for `n` units.
    async fn wait_for_token(&self, n: f64, timeout: Duration) -> Result<bool, LimiterError> {
        LimiterError::check_request(n, self.capacity())?;
        let deadline = Instant::now() + timeout;

        loop {
            if self.try_acquire(n)? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(strategy = %self.strategy(), requested = n, "wait_for_token timed out");
                return Ok(false);
            }
            tokio::time::sleep(self.poll_interval().min(deadline - now)).await;
        }
    }

    /// Thread-blocking variant of [`wait_for_token`](Limiter::wait_for_token).
    ///
    /// Must not be called from inside an async task.
    fn wait_for_token_blocking(&self, n: f64, timeout: Duration) -> Result<bool, LimiterError> {
        LimiterError::check_request(n, self.capacity())?;
        let deadline = std::time::Instant::now() + timeout;

        loop {
            if self.try_acquire(n)? {
                return Ok(true);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                debug!(strategy = %self.strategy(), requested = n, "wait_for_token_blocking timed out");
                return Ok(false);
            }
            std::thread::sleep(self.poll_interval().min(deadline - now));
        }
    }
}

/// Builds a limiter of the given strategy from `config`.
///
/// The strategy argument overrides `config.strategy`.
pub fn new_limiter(
    strategy: LimiterStrategy,
    config: &LimiterConfig,
) -> Result<Arc<dyn Limiter>, ConfigError> {
    config.validate()?;
    let limiter: Arc<dyn Limiter> = match strategy {
        LimiterStrategy::TokenBucket => Arc::new(TokenBucket::from_config(config)),
        LimiterStrategy::FixedWindow => Arc::new(FixedWindow::from_config(config)),
        LimiterStrategy::SlidingWindow => Arc::new(SlidingWindow::from_config(config)),
        LimiterStrategy::LeakyBucket => Arc::new(LeakyBucket::from_config(config)),
    };
    Ok(limiter)
}
