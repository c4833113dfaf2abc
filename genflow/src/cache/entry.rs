//! Cache entry with TTL bookkeeping.

use std::time::Duration;
use tokio::time::Instant;

/// A single cached value.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The key the entry is stored under.
    pub key: String,
    /// Opaque serialized value.
    pub value: Vec<u8>,
    /// When the entry was written.
    pub created_at: Instant,
    /// Time to live. `Duration::ZERO` never expires.
    pub ttl: Duration,
    /// Approximate memory held by key and value.
    pub size_estimate: usize,
}

impl CacheEntry {
    /// Creates an entry stamped with the current time.
    #[must_use]
    pub fn new(key: impl Into<String>, value: Vec<u8>, ttl: Duration) -> Self {
        let key = key.into();
        let size_estimate = key.len() + value.len();
        Self {
            key,
            value,
            created_at: Instant::now(),
            ttl,
            size_estimate,
        }
    }

    /// Returns true once more than `ttl` has passed since creation.
    #[must_use]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        !self.ttl.is_zero() && now.saturating_duration_since(self.created_at) > self.ttl
    }

    /// Returns true if the entry has expired as of now.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    /// Time left before expiry, `None` for entries that never expire.
    #[must_use]
    pub fn remaining_ttl(&self) -> Option<Duration> {
        if self.ttl.is_zero() {
            return None;
        }
        Some(self.ttl.saturating_sub(self.created_at.elapsed()))
    }
}
