//! Durable cache persisting one record per key.
//!
//! Values live only in the backend. The in-process index tracks record
//! metadata so the byte budget can be enforced without reading values back.

use super::format::{expired_at, DurableRecord};
use super::{digest_key, Cache, CacheStats, KeyLocks, PersistenceBackend, RecordFormat};
use crate::config::{default_max_bytes, CacheConfig};
use crate::errors::CacheError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct IndexEntry {
    id: String,
    created_at: DateTime<Utc>,
    ttl_ms: u64,
    size: u64,
}

impl IndexEntry {
    fn from_record(id: &str, record: &DurableRecord, size: u64) -> Self {
        Self {
            id: id.to_string(),
            created_at: record.created_at,
            ttl_ms: record.ttl_ms,
            size,
        }
    }

    fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        expired_at(self.created_at, self.ttl_ms, now)
    }
}

#[derive(Debug, Default)]
struct DurableInner {
    index: HashMap<String, IndexEntry>,
    total_bytes: u64,
    stats: CacheStats,
}

impl DurableInner {
    fn track(&mut self, key: &str, entry: IndexEntry) {
        self.forget(key);
        self.total_bytes += entry.size;
        self.index.insert(key.to_string(), entry);
        self.sync_stats();
    }

    fn forget(&mut self, key: &str) -> Option<IndexEntry> {
        let entry = self.index.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        self.sync_stats();
        Some(entry)
    }

    fn sync_stats(&mut self) {
        self.stats.size = self.index.len();
        self.stats.bytes = self.total_bytes;
    }
}

enum Loaded {
    Missing,
    Corrupt,
    Found(DurableRecord, u64),
}

/// Cache whose entries survive the process.
///
/// Records are written through a [`PersistenceBackend`] under the SHA-256 of
/// their key. Two instances opened over the same backend see each other's
/// writes. Unreadable records are logged, deleted and treated as misses.
///
/// Inserting past `max_bytes` or `max_entries` first purges expired records,
/// then evicts the oldest records by creation time, largest first on ties.
pub struct DurableCache {
    backend: Arc<dyn PersistenceBackend>,
    format: RecordFormat,
    max_bytes: u64,
    max_entries: usize,
    default_ttl: Duration,
    inner: Mutex<DurableInner>,
    locks: KeyLocks,
}

impl fmt::Debug for DurableCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableCache")
            .field("backend", &self.backend)
            .field("format", &self.format)
            .field("max_bytes", &self.max_bytes)
            .field("max_entries", &self.max_entries)
            .field("entries", &self.inner.try_lock().map(|inner| inner.index.len()))
            .finish_non_exhaustive()
    }
}

impl DurableCache {
    /// Opens a cache over `backend`, indexing the records already there.
    ///
    /// Byte budget and format come from `config.durable`, falling back to
    /// defaults when it is absent.
    pub fn open(backend: Arc<dyn PersistenceBackend>, config: &CacheConfig) -> Result<Self, CacheError> {
        let (format, max_bytes) = config
            .durable
            .as_ref()
            .map_or((RecordFormat::default(), default_max_bytes()), |d| {
                (d.format, d.max_bytes)
            });

        let cache = Self {
            backend,
            format,
            max_bytes,
            max_entries: config.max_size.max(1),
            default_ttl: config.default_ttl(),
            inner: Mutex::new(DurableInner::default()),
            locks: KeyLocks::new(),
        };

        {
            let mut inner = cache.inner.lock();
            let purged = cache.rescan(&mut inner)?;
            cache.make_room(&mut inner, 0, None, Utc::now())?;
            debug!(
                entries = inner.index.len(),
                bytes = inner.total_bytes,
                purged,
                "Opened durable cache"
            );
        }
        Ok(cache)
    }

    /// Total byte budget.
    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Record encoding in use.
    #[must_use]
    pub fn format(&self) -> RecordFormat {
        self.format
    }

    /// Reads and validates one record, deleting it if unreadable.
    fn load(&self, id: &str) -> Result<Loaded, CacheError> {
        let Some(bytes) = self.backend.read(id)? else {
            return Ok(Loaded::Missing);
        };
        let size = bytes.len() as u64;
        let reason = match DurableRecord::decode(&bytes, self.format) {
            Ok(record) if digest_key(record.key.as_bytes()) == id => {
                return Ok(Loaded::Found(record, size));
            }
            Ok(_) => "key does not match record id".to_string(),
            Err(e) => e.to_string(),
        };
        warn!(record_id = id, %reason, "Deleting corrupt cache record");
        self.backend.delete(id)?;
        Ok(Loaded::Corrupt)
    }

    /// Rebuilds the index from the backend, dropping corrupt and expired
    /// records. Returns how many expired records were removed.
    fn rescan(&self, inner: &mut DurableInner) -> Result<usize, CacheError> {
        let now = Utc::now();
        let mut index = HashMap::new();
        let mut total_bytes = 0;
        let mut expired = 0;

        for id in self.backend.ids()? {
            let Loaded::Found(record, size) = self.load(&id)? else {
                continue;
            };
            if record.is_expired_at(now) {
                self.backend.delete(&id)?;
                expired += 1;
                continue;
            }
            total_bytes += size;
            index.insert(record.key.clone(), IndexEntry::from_record(&id, &record, size));
        }

        inner.index = index;
        inner.total_bytes = total_bytes;
        inner.stats.expirations += expired as u64;
        inner.sync_stats();
        Ok(expired)
    }

    /// Removes indexed records that have expired by `now`.
    fn purge_expired(&self, inner: &mut DurableInner, now: DateTime<Utc>) -> Result<usize, CacheError> {
        let expired: Vec<String> = inner
            .index
            .iter()
            .filter(|(_, entry)| entry.is_expired_at(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            if let Some(entry) = inner.forget(key) {
                self.backend.delete(&entry.id)?;
                inner.stats.expirations += 1;
            }
        }
        Ok(expired.len())
    }

    /// True if storing `incoming` bytes under `replacing` would break a
    /// budget. The record being replaced does not count against it.
    fn over_budget(&self, inner: &DurableInner, incoming: u64, replacing: Option<&str>) -> bool {
        let replaced = replacing.and_then(|key| inner.index.get(key));
        let freed = replaced.map_or(0, |entry| entry.size);
        let new_entries = usize::from(incoming > 0 && replaced.is_none());
        inner.total_bytes.saturating_sub(freed) + incoming > self.max_bytes
            || inner.index.len() + new_entries > self.max_entries
    }

    /// Frees space for a record of `incoming` bytes stored under `replacing`.
    ///
    /// The replaced record itself is never evicted here; it is overwritten
    /// by the write that follows.
    fn make_room(
        &self,
        inner: &mut DurableInner,
        incoming: u64,
        replacing: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        if !self.over_budget(inner, incoming, replacing) {
            return Ok(());
        }
        self.purge_expired(inner, now)?;

        while self.over_budget(inner, incoming, replacing) {
            let victim = inner
                .index
                .iter()
                .filter(|(key, _)| Some(key.as_str()) != replacing)
                .min_by(|(_, a), (_, b)| {
                    a.created_at
                        .cmp(&b.created_at)
                        .then_with(|| b.size.cmp(&a.size))
                })
                .map(|(key, _)| key.clone());
            let Some(victim) = victim else {
                break;
            };
            if let Some(entry) = inner.forget(&victim) {
                self.backend.delete(&entry.id)?;
                inner.stats.evictions += 1;
                debug!(key = %victim, size = entry.size, "Evicted durable cache record");
            }
        }
        Ok(())
    }
}

impl Cache for DurableCache {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let id = digest_key(key.as_bytes());
        let mut inner = self.inner.lock();

        match self.load(&id)? {
            Loaded::Found(record, _) if record.is_expired_at(Utc::now()) => {
                self.backend.delete(&id)?;
                inner.forget(key);
                inner.stats.expirations += 1;
                inner.stats.misses += 1;
                Ok(None)
            }
            Loaded::Found(record, size) => {
                inner.track(key, IndexEntry::from_record(&id, &record, size));
                inner.stats.hits += 1;
                Ok(Some(record.value))
            }
            Loaded::Missing | Loaded::Corrupt => {
                inner.forget(key);
                inner.stats.misses += 1;
                Ok(None)
            }
        }
    }

    fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CacheError> {
        let id = digest_key(key.as_bytes());
        let record = DurableRecord::new(key, value, ttl.unwrap_or(self.default_ttl));
        let bytes = record.encode(self.format)?;
        let size = bytes.len() as u64;
        if size > self.max_bytes {
            return Err(CacheError::TooLarge {
                size,
                budget: self.max_bytes,
            });
        }

        let mut inner = self.inner.lock();
        self.make_room(&mut inner, size, Some(key), record.created_at)?;
        // The index keeps the old record until the write lands, so a failed
        // write leaves it accurate.
        self.backend.write(&id, &bytes)?;
        inner.track(key, IndexEntry::from_record(&id, &record, size));
        inner.stats.writes += 1;
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let id = digest_key(key.as_bytes());
        let mut inner = self.inner.lock();

        match self.load(&id)? {
            Loaded::Found(record, _) if record.is_expired_at(Utc::now()) => {
                self.backend.delete(&id)?;
                inner.forget(key);
                inner.stats.expirations += 1;
                Ok(false)
            }
            Loaded::Found(record, size) => {
                inner.track(key, IndexEntry::from_record(&id, &record, size));
                Ok(true)
            }
            Loaded::Missing | Loaded::Corrupt => {
                inner.forget(key);
                Ok(false)
            }
        }
    }

    fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let id = digest_key(key.as_bytes());
        let mut inner = self.inner.lock();
        inner.forget(key);
        self.backend.delete(&id)
    }

    fn clear(&self) -> Result<(), CacheError> {
        let mut inner = self.inner.lock();
        for id in self.backend.ids()? {
            self.backend.delete(&id)?;
        }
        *inner = DurableInner::default();
        Ok(())
    }

    fn cleanup_expired(&self) -> Result<usize, CacheError> {
        let mut inner = self.inner.lock();
        let removed = self.rescan(&mut inner)?;
        if removed > 0 {
            debug!(removed, "Swept expired durable records");
        }
        Ok(removed)
    }

    fn get_stats(&self) -> CacheStats {
        self.inner.lock().stats.clone()
    }

    fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    fn key_locks(&self) -> &KeyLocks {
        &self.locks
    }
}
