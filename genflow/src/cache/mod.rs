//! Caches.
//!
//! This module provides:
//! - A uniform [`Cache`] contract over opaque byte values
//! - [`MemoryCache`], a bounded LRU with per-entry TTL
//! - [`DurableCache`], which persists one record per key through a
//!   [`PersistenceBackend`] and enforces a byte budget
//! - [`CacheExt::get_or_set`], which runs its factory at most once per key
//!   even under concurrent callers

mod backend;
mod durable;
mod entry;
pub(crate) mod format;
mod memory;
mod stats;

pub use backend::{FsBackend, MemoryBackend, PersistenceBackend};
pub use durable::DurableCache;
pub use entry::CacheEntry;
pub use format::RecordFormat;
pub use memory::MemoryCache;
pub use stats::CacheStats;

use crate::config::CacheConfig;
use crate::errors::{CacheError, GenflowError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Uniform cache contract.
///
/// `ttl: None` on `set` applies the cache's default TTL; `Some(Duration::ZERO)`
/// stores an entry that never expires. An expired entry is never returned,
/// whether or not it has been physically removed yet.
pub trait Cache: Send + Sync + fmt::Debug {
    /// Returns the value for `key`. Expired entries count as misses and are removed.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Inserts or overwrites `key`.
    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheError>;

    /// Returns true if a fresh entry exists. Does not affect recency or hit counters.
    fn exists(&self, key: &str) -> Result<bool, CacheError>;

    /// Removes `key`. Returns false if it was absent.
    fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Removes every entry and zeroes the stats.
    fn clear(&self) -> Result<(), CacheError>;

    /// Removes all expired entries, returning how many were removed.
    fn cleanup_expired(&self) -> Result<usize, CacheError>;

    /// Snapshot of the counters.
    fn get_stats(&self) -> CacheStats;

    /// Number of stored entries, expired ones included until swept.
    fn len(&self) -> usize;

    /// Returns true if nothing is stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Per-key locks backing [`CacheExt::get_or_set`].
    fn key_locks(&self) -> &KeyLocks;
}

/// Helpers available on every [`Cache`].
#[async_trait]
pub trait CacheExt: Cache {
    /// Returns the cached value, or runs `factory` once, stores and returns its result.
    ///
    /// Concurrent callers for the same key are serialized on a per-key lock,
    /// so the factory runs at most once while the entry stays fresh. A failed
    /// factory stores nothing.
    async fn get_or_set<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        factory: F,
    ) -> Result<Vec<u8>, E>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Vec<u8>, E>> + Send,
        E: From<CacheError> + Send;

    /// Reads and deserializes a JSON value.
    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError>;

    /// Serializes and stores a JSON value.
    fn set_json<T: Serialize + Sync + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError>;
}

#[async_trait]
impl<C: Cache + ?Sized> CacheExt for C {
    async fn get_or_set<F, Fut, E>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        factory: F,
    ) -> Result<Vec<u8>, E>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Vec<u8>, E>> + Send,
        E: From<CacheError> + Send,
    {
        let _guard = self.key_locks().lock(key).await;
        if let Some(value) = self.get(key)? {
            return Ok(value);
        }
        let value = factory().await?;
        self.set(key, value.clone(), ttl)?;
        Ok(value)
    }

    fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn set_json<T: Serialize + Sync + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, bytes, ttl)
    }
}

/// Lazily created async mutexes, one per key.
///
/// A key's mutex is dropped from the map once the last holder releases it.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KeyLocks {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> KeyGuard<'_> {
        let mutex = Arc::clone(self.locks.entry(key.to_string()).or_default().value());
        let guard = mutex.lock_owned().await;
        KeyGuard {
            locks: self,
            key: key.to_string(),
            guard: Some(guard),
        }
    }

    /// Number of keys with a live lock.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Returns true if no key is locked or awaited.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Exclusive access to one key of a [`KeyLocks`] table.
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own handle left means nobody holds or awaits it.
        self.locks
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}

/// Hex SHA-256 digest, used for cache keys and record ids.
#[must_use]
pub fn digest_key(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hex::encode(hasher.finalize())
}

/// Builds a cache from configuration.
///
/// A `durable` section selects [`DurableCache`] over an [`FsBackend`];
/// otherwise the cache is an in-memory [`MemoryCache`].
pub fn new_cache(config: &CacheConfig) -> Result<Arc<dyn Cache>, GenflowError> {
    config.validate()?;
    let cache: Arc<dyn Cache> = match &config.durable {
        Some(durable) => {
            let backend = FsBackend::new(&durable.dir)?;
            Arc::new(DurableCache::open(Arc::new(backend), config)?)
        }
        None => Arc::new(MemoryCache::new(config)),
    };
    Ok(cache)
}
