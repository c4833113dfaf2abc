//! Named collection of independent limiters.

use super::{new_limiter, Limiter};
use crate::config::LimiterConfig;
use crate::errors::{ConfigError, LimiterError};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Per-endpoint limiters keyed by name.
///
/// Each limiter keeps its own lock, so contention on one name never slows
/// another. Async waits clone the limiter handle out of the map first and
/// never hold a map shard across an await.
#[derive(Debug, Default)]
pub struct LimiterRegistry {
    limiters: DashMap<String, Arc<dyn Limiter>>,
}

impl LimiterRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds one limiter per config entry.
    pub fn from_config(configs: &BTreeMap<String, LimiterConfig>) -> Result<Self, ConfigError> {
        let registry = Self::new();
        for (name, config) in configs {
            let limiter = new_limiter(config.strategy, config).map_err(|e| match e {
                ConfigError::Invalid { field, reason } => ConfigError::Invalid {
                    field: format!("limiters.{name}.{field}"),
                    reason,
                },
                other => other,
            })?;
            registry.add(name.clone(), limiter);
        }
        Ok(registry)
    }

    /// Registers a limiter, returning the one it replaced.
    pub fn add(&self, name: impl Into<String>, limiter: Arc<dyn Limiter>) -> Option<Arc<dyn Limiter>> {
        let name = name.into();
        debug!(limiter = %name, strategy = %limiter.strategy(), "Registering limiter");
        self.limiters.insert(name, limiter)
    }

    /// Looks up a limiter.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Limiter>, LimiterError> {
        self.limiters
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| LimiterError::not_found(name))
    }

    /// Removes a limiter. Returns false if it was not registered.
    pub fn remove(&self, name: &str) -> bool {
        self.limiters.remove(name).is_some()
    }

    /// Non-blocking acquire on the named limiter.
    pub fn acquire(&self, name: &str, n: f64) -> Result<bool, LimiterError> {
        self.get(name)?.try_acquire(n)
    }

    /// Waits on the named limiter.
    pub async fn wait_for_token(
        &self,
        name: &str,
        n: f64,
        timeout: Duration,
    ) -> Result<bool, LimiterError> {
        let limiter = self.get(name)?;
        limiter.wait_for_token(n, timeout).await
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.limiters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Returns the number of registered limiters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    /// Returns true if no limiter is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}
