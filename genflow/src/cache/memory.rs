//! Bounded in-memory LRU cache with per-entry TTL.

use super::{Cache, CacheEntry, CacheStats, KeyLocks};
use crate::config::CacheConfig;
use crate::errors::CacheError;
use lru::LruCache;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug)]
struct MemoryInner {
    /// Recency order: `get` and `set` promote, `exists` does not.
    entries: LruCache<String, CacheEntry>,
    stats: CacheStats,
}

impl MemoryInner {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.stats.bytes = self.stats.bytes.saturating_sub(entry.size_estimate as u64);
        self.stats.size = self.entries.len();
        Some(entry)
    }

    fn expire(&mut self, key: &str) {
        if self.remove(key).is_some() {
            self.stats.expirations += 1;
        }
    }
}

/// In-memory cache holding at most `max_size` entries.
///
/// Inserting past the limit evicts the least recently used entries. Expired
/// entries are dropped lazily on access or in bulk by `cleanup_expired`.
#[derive(Debug)]
pub struct MemoryCache {
    max_size: usize,
    default_ttl: Duration,
    inner: Mutex<MemoryInner>,
    locks: KeyLocks,
}

impl MemoryCache {
    /// Creates an empty cache from a validated config.
    #[must_use]
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            max_size: config.max_size.max(1),
            default_ttl: config.default_ttl(),
            inner: Mutex::new(MemoryInner {
                entries: LruCache::unbounded(),
                stats: CacheStats::new(),
            }),
            locks: KeyLocks::new(),
        }
    }

    /// Maximum number of entries.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// TTL applied when `set` gets none.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        match inner.entries.peek(key).map(|e| e.is_expired_at(now)) {
            None => {
                inner.stats.misses += 1;
                Ok(None)
            }
            Some(true) => {
                inner.expire(key);
                inner.stats.misses += 1;
                debug!(key, "Cache entry expired on read");
                Ok(None)
            }
            Some(false) => {
                let value = inner.entries.get(key).map(|e| e.value.clone());
                inner.stats.hits += 1;
                Ok(value)
            }
        }
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheError> {
        let entry = CacheEntry::new(key, value, ttl.unwrap_or(self.default_ttl));
        let added = entry.size_estimate as u64;

        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if let Some(previous) = inner.entries.put(key.to_string(), entry) {
            inner.stats.bytes = inner.stats.bytes.saturating_sub(previous.size_estimate as u64);
        }
        inner.stats.bytes += added;
        inner.stats.writes += 1;

        while inner.entries.len() > self.max_size {
            let Some((evicted, old)) = inner.entries.pop_lru() else {
                break;
            };
            inner.stats.bytes = inner.stats.bytes.saturating_sub(old.size_estimate as u64);
            inner.stats.evictions += 1;
            debug!(key = %evicted, "Evicted least recently used entry");
        }
        inner.stats.size = inner.entries.len();
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.entries.peek(key).map(|e| e.is_expired_at(now)) {
            None => Ok(false),
            Some(true) => {
                inner.expire(key);
                Ok(false)
            }
            Some(false) => Ok(true),
        }
    }

    fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.inner.lock().remove(key).is_some())
    }

    fn clear(&self) -> Result<(), CacheError> {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.stats = CacheStats::new();
        Ok(())
    }

    fn cleanup_expired(&self) -> Result<usize, CacheError> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let expired: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            inner.expire(key);
        }
        if !expired.is_empty() {
            debug!(removed = expired.len(), "Swept expired cache entries");
        }
        Ok(expired.len())
    }

    fn get_stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }

    fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    fn key_locks(&self) -> &KeyLocks {
        &self.locks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn cache(max_size: usize, ttl: Duration) -> MemoryCache {
        MemoryCache::new(
            &CacheConfig::new()
                .with_max_size(max_size)
                .with_default_ttl(ttl),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_round_trip() {
        let cache = cache(10, Duration::from_secs(60));
        cache.set("k", b"v".to_vec(), Some(Duration::from_secs(1))).unwrap();

        tokio::time::advance(Duration::from_millis(900)).await;
        assert_eq!(cache.get("k").unwrap(), Some(b"v".to_vec()));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(cache.get("k").unwrap(), None);
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_expired_after_ttl() {
        let cache = cache(10, Duration::from_secs(1));
        cache.set("k", b"v".to_vec(), None).unwrap();
        cache.set("forever", b"v".to_vec(), Some(Duration::ZERO)).unwrap();

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(cache.get("k").unwrap(), None);

        cache.set("k", b"v".to_vec(), None).unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(cache.cleanup_expired().unwrap(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.exists("forever").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_unreachable_before_sweep() {
        let cache = cache(10, Duration::from_secs(1));
        cache.set("k", b"v".to_vec(), None).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        // Still physically present until touched or swept.
        assert_eq!(cache.len(), 1);
        assert!(!cache.exists("k").unwrap());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_lru_evicts_least_recently_touched() {
        let cache = cache(3, Duration::ZERO);
        cache.set("a", b"1".to_vec(), None).unwrap();
        cache.set("b", b"2".to_vec(), None).unwrap();
        cache.set("c", b"3".to_vec(), None).unwrap();
        cache.set("d", b"4".to_vec(), None).unwrap();

        assert!(!cache.exists("a").unwrap());
        assert!(cache.exists("b").unwrap());
        assert_eq!(cache.get_stats().evictions, 1);
    }

    #[test]
    fn test_get_protects_from_eviction() {
        let cache = cache(3, Duration::ZERO);
        cache.set("a", b"1".to_vec(), None).unwrap();
        cache.set("b", b"2".to_vec(), None).unwrap();
        cache.set("c", b"3".to_vec(), None).unwrap();

        assert!(cache.get("a").unwrap().is_some());
        cache.set("d", b"4".to_vec(), None).unwrap();

        assert!(cache.exists("a").unwrap());
        assert!(!cache.exists("b").unwrap());
    }

    #[test]
    fn test_exists_does_not_touch_recency() {
        let cache = cache(2, Duration::ZERO);
        cache.set("a", b"1".to_vec(), None).unwrap();
        cache.set("b", b"2".to_vec(), None).unwrap();

        assert!(cache.exists("a").unwrap());
        cache.set("c", b"3".to_vec(), None).unwrap();

        assert!(!cache.exists("a").unwrap());
        assert_eq!(cache.get_stats().hits, 0);
    }

    #[test]
    fn test_overwrite_does_not_evict() {
        let cache = cache(2, Duration::ZERO);
        cache.set("a", b"1".to_vec(), None).unwrap();
        cache.set("b", b"2".to_vec(), None).unwrap();
        cache.set("a", b"11".to_vec(), None).unwrap();

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a").unwrap(), Some(b"11".to_vec()));
        assert_eq!(cache.get_stats().evictions, 0);
    }

    #[test]
    fn test_stats_lifecycle() {
        let cache = cache(10, Duration::ZERO);
        cache.set("a", b"12345".to_vec(), None).unwrap();
        cache.get("a").unwrap();
        cache.get("missing").unwrap();

        let stats = cache.get_stats();
        assert_eq!(
            stats,
            CacheStats {
                hits: 1,
                misses: 1,
                writes: 1,
                evictions: 0,
                expirations: 0,
                size: 1,
                bytes: 6,
            }
        );
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);

        cache.clear().unwrap();
        assert_eq!(cache.get_stats(), CacheStats::new());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_delete() {
        let cache = cache(10, Duration::ZERO);
        cache.set("a", b"1".to_vec(), None).unwrap();
        assert!(cache.delete("a").unwrap());
        assert!(!cache.delete("a").unwrap());
        assert_eq!(cache.get_stats().bytes, 0);
    }
}
