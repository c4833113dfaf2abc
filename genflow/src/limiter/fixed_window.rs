//! Fixed-window limiter.

use super::{Limiter, LimiterStrategy};
use crate::config::LimiterConfig;
use crate::errors::LimiterError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct WindowState {
    window_start: Instant,
    used: f64,
}

/// Admits up to `rate` units per aligned window of `window_size`.
///
/// Two bursts on either side of a boundary can together admit up to
/// `2 * rate` units inside one window-length interval. That is inherent to
/// fixed windows; use [`SlidingWindow`](super::SlidingWindow) when it matters.
#[derive(Debug)]
pub struct FixedWindow {
    rate: f64,
    window_size: Duration,
    poll_interval: Duration,
    state: Mutex<WindowState>,
}

impl FixedWindow {
    /// Creates a limiter admitting `rate` units per `window_size`.
    #[must_use]
    pub fn new(rate: f64, window_size: Duration) -> Self {
        Self {
            rate,
            window_size,
            poll_interval: LimiterConfig::default().poll_interval(),
            state: Mutex::new(WindowState {
                window_start: Instant::now(),
                used: 0.0,
            }),
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

    // Windows stay aligned to the construction instant, so a long idle gap
    // jumps forward by whole windows instead of restarting at `now`.
    fn roll(&self, state: &mut WindowState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.window_start);
        if elapsed >= self.window_size {
            let window_ns = self.window_size.as_nanos().max(1);
            let elapsed_ns = elapsed.as_nanos();
            let skipped = elapsed_ns - elapsed_ns % window_ns;
            // `skipped <= elapsed`, so the new start never passes `now`.
            state.window_start += Duration::from_nanos(u64::try_from(skipped).unwrap_or(u64::MAX));
            state.used = 0.0;
        }
    }
}

#[async_trait]
impl Limiter for FixedWindow {
    fn strategy(&self) -> LimiterStrategy {
        LimiterStrategy::FixedWindow
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
        let mut state = self.state.lock();
        self.roll(&mut state, Instant::now());
        if state.used + n > self.rate {
            return Ok(false);
        }
        state.used += n;
        Ok(true)
    }

    fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.roll(&mut state, Instant::now());
        (self.rate - state.used).max(0.0)
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        state.window_start = Instant::now();
        state.used = 0.0;
    }
}
