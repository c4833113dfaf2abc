//! Persistence backends for the durable cache.
//!
//! A backend is a flat id → bytes store. Ids are opaque to it; the durable
//! cache derives them from cache keys.

use crate::errors::CacheError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Key → bytes storage with enumerate and delete.
pub trait PersistenceBackend: Send + Sync + fmt::Debug {
    /// Reads a record. `Ok(None)` if it does not exist.
    fn read(&self, id: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Writes a record, replacing any previous one.
    fn write(&self, id: &str, bytes: &[u8]) -> Result<(), CacheError>;

    /// Deletes a record. Returns false if it did not exist.
    fn delete(&self, id: &str) -> Result<bool, CacheError>;

    /// Lists every record id.
    fn ids(&self) -> Result<Vec<String>, CacheError>;
}

const RECORD_EXTENSION: &str = "rec";

/// One file per record inside a directory.
///
/// Writes go to a temporary file that is renamed into place, so a crashed
/// writer never leaves a half-written record under a live id.
#[derive(Debug, Clone)]
pub struct FsBackend {
    dir: PathBuf,
}

impl FsBackend {
    /// Opens (and creates if needed) the record directory.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// The record directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.{RECORD_EXTENSION}"))
    }
}

impl PersistenceBackend for FsBackend {
    fn read(&self, id: &str) -> Result<Option<Vec<u8>>, CacheError> {
        match fs::read(self.path_for(id)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, id: &str, bytes: &[u8]) -> Result<(), CacheError> {
        let tmp = self.dir.join(format!("{id}.{}.tmp", uuid::Uuid::new_v4().simple()));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        if let Err(e) = fs::rename(&tmp, self.path_for(id)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool, CacheError> {
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn ids(&self) -> Result<Vec<String>, CacheError> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        Ok(ids)
    }
}

/// Process-local backend, handy for tests and ephemeral deployments.
///
/// Share it through an `Arc` to let several cache instances see the same
/// records, the way separate processes share a directory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceBackend for MemoryBackend {
    fn read(&self, id: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Ok(self.records.lock().get(id).cloned())
    }

    fn write(&self, id: &str, bytes: &[u8]) -> Result<(), CacheError> {
        self.records.lock().insert(id.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, id: &str) -> Result<bool, CacheError> {
        Ok(self.records.lock().remove(id).is_some())
    }

    fn ids(&self) -> Result<Vec<String>, CacheError> {
        Ok(self.records.lock().keys().cloned().collect())
    }
}
