//! Token-bucket limiter.

use super::{Limiter, LimiterStrategy};
use crate::config::LimiterConfig;
use crate::errors::LimiterError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct BucketState {
    available: f64,
    last_refill: Instant,
}

/// A bucket of `capacity` tokens refilled continuously at `rate` per second.
///
/// Starts full, so up to `capacity` units can be spent in one burst.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    poll_interval: Duration,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Creates a full bucket.
    #[must_use]
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            rate,
            capacity,
            poll_interval: LimiterConfig::default().poll_interval(),
            state: Mutex::new(BucketState {
                available: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Creates a bucket from a validated config.
    #[must_use]
    pub fn from_config(config: &LimiterConfig) -> Self {
        Self::new(config.rate, config.capacity()).with_poll_interval(config.poll_interval())
    }

    /// Sets the polling interval used while waiting.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed > Duration::ZERO {
            state.available = (state.available + elapsed.as_secs_f64() * self.rate).min(self.capacity);
            state.last_refill = now;
        }
    }
}

#[async_trait]
impl Limiter for TokenBucket {
    fn strategy(&self) -> LimiterStrategy {
        LimiterStrategy::TokenBucket
    }

    fn rate(&self) -> f64 {
        self.rate
    }

    fn capacity(&self) -> f64 {
        self.capacity
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn try_acquire(&self, n: f64) -> Result<bool, LimiterError> {
        LimiterError::check_request(n, self.capacity)?;
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        if state.available < n {
            return Ok(false);
        }
        state.available -= n;
        Ok(true)
    }

    fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state, Instant::now());
        state.available
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.available = self.capacity;
        state.last_refill = Instant::now();
    }
}
