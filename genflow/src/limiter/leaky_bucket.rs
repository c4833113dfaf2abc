//! Leaky-bucket limiter.

use super::{Limiter, LimiterStrategy};
use crate::config::LimiterConfig;
use crate::errors::LimiterError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Longest drain time a single grant can schedule.
const MAX_SLOT: Duration = Duration::from_secs(u32::MAX as u64);

#[derive(Debug)]
struct QueueState {
    /// When the units granted so far have fully drained.
    drained_at: Instant,
}

/// A queue drained at a constant `rate` units per second.
///
/// A grant puts `n` units in the queue and is only made once the previous
/// grant has drained, so admissions are spaced `n / rate` seconds apart and
/// an idle period never banks a burst. `capacity` is the largest single
/// grant. Polling slightly late keeps the schedule instead of restarting it,
/// so steady callers still get `rate` on average.
#[derive(Debug)]
pub struct LeakyBucket {
    rate: f64,
    capacity: f64,
    poll_interval: Duration,
    state: Mutex<QueueState>,
}

impl LeakyBucket {
    /// Creates an empty queue.
    #[must_use]
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            rate,
            capacity,
            poll_interval: LimiterConfig::default().poll_interval(),
            state: Mutex::new(QueueState {
                drained_at: Instant::now(),
            }),
        }
    }

    /// Creates a queue from a validated config.
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

    /// Units still draining from the queue.
    #[must_use]
    pub fn queue_depth(&self) -> f64 {
        let state = self.state.lock();
        state
            .drained_at
            .saturating_duration_since(Instant::now())
            .as_secs_f64()
            * self.rate
    }

    fn drain_time(&self, n: f64) -> Duration {
        Duration::try_from_secs_f64(n / self.rate)
            .unwrap_or(MAX_SLOT)
            .min(MAX_SLOT)
    }
}

#[async_trait]
impl Limiter for LeakyBucket {
    fn strategy(&self) -> LimiterStrategy {
        LimiterStrategy::LeakyBucket
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
        let now = Instant::now();
        let mut state = self.state.lock();
        if now < state.drained_at {
            return Ok(false);
        }

        let slot = self.drain_time(n);
        // Less than one slot late: continue the schedule. The next grant
        // still lands after `now`.
        let start = if now.saturating_duration_since(state.drained_at) < slot {
            state.drained_at
        } else {
            now
        };
        state.drained_at = start.checked_add(slot).unwrap_or(now);
        Ok(true)
    }

    fn available(&self) -> f64 {
        if Instant::now() < self.state.lock().drained_at {
            0.0
        } else {
            self.capacity
        }
    }

    fn reset(&self) {
        self.state.lock().drained_at = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::TokenBucket;

    fn grants_now(limiter: &dyn Limiter, attempts: usize) -> usize {
        (0..attempts)
            .filter(|_| limiter.try_acquire(1.0).unwrap())
            .count()
    }

    #[tokio::test(start_paused = true)]
    async fn test_admissions_are_spaced_by_drain_rate() {
        let bucket = LeakyBucket::new(10.0, 10.0);
        assert!(bucket.try_acquire(1.0).unwrap());
        assert!(!bucket.try_acquire(1.0).unwrap());

        tokio::time::advance(Duration::from_millis(99)).await;
        assert!(!bucket.try_acquire(1.0).unwrap());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(bucket.try_acquire(1.0).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_period_banks_no_burst_unlike_token_bucket() {
        let leaky = LeakyBucket::new(10.0, 10.0);
        let token = TokenBucket::new(10.0, 10.0);
        assert_eq!(grants_now(&leaky, 10), 1);
        assert_eq!(grants_now(&token, 10), 10);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(grants_now(&leaky, 10), 1);
        assert_eq!(grants_now(&token, 10), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_polls_keep_the_average_rate() {
        let bucket = LeakyBucket::new(10.0, 10.0);
        let mut granted = 0;
        // Polls at 0, 30, ..., 990ms.
        for _ in 0..34 {
            if bucket.try_acquire(1.0).unwrap() {
                granted += 1;
            }
            tokio::time::advance(Duration::from_millis(30)).await;
        }
        assert_eq!(granted, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heavier_grants_drain_longer() {
        let bucket = LeakyBucket::new(2.0, 4.0);
        assert!(bucket.try_acquire(4.0).unwrap());
        assert_eq!(bucket.queue_depth(), 4.0);
        assert_eq!(bucket.available(), 0.0);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(bucket.queue_depth(), 3.0);

        tokio::time::advance(Duration::from_millis(1499)).await;
        assert!(!bucket.try_acquire(1.0).unwrap());
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(bucket.queue_depth(), 0.0);
        assert_eq!(bucket.available(), 4.0);
        assert!(bucket.try_acquire(1.0).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_over_capacity_fails_fast() {
        let bucket = LeakyBucket::new(1.0, 2.0);
        assert!(matches!(
            bucket.try_acquire(3.0),
            Err(LimiterError::ExceedsCapacity { .. })
        ));
        assert!(bucket.try_acquire(2.0).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_empties_queue() {
        let bucket = LeakyBucket::new(1.0, 2.0);
        assert!(bucket.try_acquire(2.0).unwrap());
        assert!(!bucket.try_acquire(1.0).unwrap());
        bucket.reset();
        assert_eq!(bucket.queue_depth(), 0.0);
        assert!(bucket.try_acquire(1.0).unwrap());
    }
}
