//! Sliding-window limiter.

use super::{Limiter, LimiterStrategy};
use crate::config::LimiterConfig;
use crate::errors::LimiterError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct LogState {
    /// Grants in time order.
    grants: VecDeque<(Instant, f64)>,
    /// Sum of the weights in `grants`.
    total: f64,
}

/// Admits at most `rate` units within any interval of length `window_size`.
///
/// Keeps a time-ordered log of granted weights and drops entries as they
/// fall out of the window.
#[derive(Debug)]
pub struct SlidingWindow {
    rate: f64,
    window_size: Duration,
    poll_interval: Duration,
    state: Mutex<LogState>,
}

impl SlidingWindow {
    /// Creates a limiter admitting `rate` units per moving `window_size`.
    #[must_use]
    pub fn new(rate: f64, window_size: Duration) -> Self {
        Self {
            rate,
            window_size,
            poll_interval: LimiterConfig::default().poll_interval(),
            state: Mutex::new(LogState::default()),
        }
    }

    /// Creates a limiter from a validated config.
    #[must_use]
    pub fn from_config(config: &LimiterConfig) -> Self {
        Self::new(config.rate, config.window_size()).with_poll_interval(config.poll_interval())
    }

    /// Sets the polling interval used while waiting.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Window length.
    #[must_use]
    pub fn window_size(&self) -> Duration {
        self.window_size
    }

    /// Number of grants currently inside the window.
    #[must_use]
    pub fn depth(&self) -> usize {
        let mut state = self.state.lock();
        self.evict(&mut state, Instant::now());
        state.grants.len()
    }

    fn evict(&self, state: &mut LogState, now: Instant) {
        while let Some(&(granted_at, weight)) = state.grants.front() {
            if now.saturating_duration_since(granted_at) < self.window_size {
                break;
            }
            state.grants.pop_front();
            state.total -= weight;
        }
        if state.grants.is_empty() {
            // Drop accumulated float error whenever the log drains.
            state.total = 0.0;
        }
    }
}

#[async_trait]
impl Limiter for SlidingWindow {
    fn strategy(&self) -> LimiterStrategy {
        LimiterStrategy::SlidingWindow
    }

    fn rate(&self) -> f64 {
        self.rate
    }

    fn capacity(&self) -> f64 {
        self.rate
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn try_acquire(&self, n: f64) -> Result<bool, LimiterError> {
        LimiterError::check_request(n, self.rate)?;
        let now = Instant::now();
        let mut state = self.state.lock();
        self.evict(&mut state, now);
        if state.total + n > self.rate {
            return Ok(false);
        }
        state.grants.push_back((now, n));
        state.total += n;
        Ok(true)
    }

    fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.evict(&mut state, Instant::now());
        (self.rate - state.total).max(0.0)
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.grants.clear();
        state.total = 0.0;
    }
}
