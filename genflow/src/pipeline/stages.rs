//! Built-in stages for generation jobs.

use super::{Artifact, GenerationClient, JobState, PayloadShaper, PipelineContext, Stage};
use crate::cache::{Cache, CacheExt};
use crate::errors::{JobError, LimiterError};
use crate::limiter::{Limiter, LimiterRegistry};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Answers the job from the cache when a fresh artifact exists.
#[derive(Debug, Clone)]
pub struct CacheLookupStage {
    cache: Arc<dyn Cache>,
}

impl CacheLookupStage {
    /// Stage name.
    pub const NAME: &'static str = "cache_lookup";

    /// Creates a lookup stage over `cache`.
    #[must_use]
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Stage for CacheLookupStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<(), JobError> {
        let key = ctx.job.cache_key();
        match self.cache.get_json::<Artifact>(&key) {
            Ok(Some(artifact)) => {
                debug!(index = ctx.job.index, key = %key, "Cache hit");
                ctx.complete_from_cache(artifact);
            }
            Ok(None) => debug!(index = ctx.job.index, key = %key, "Cache miss"),
            // A broken cache must not fail the job.
            Err(e) => warn!(index = ctx.job.index, key = %key, error = %e, "Cache lookup failed"),
        }
        ctx.cache_key = Some(key);
        Ok(())
    }
}

/// Where the rate-limit stage gets its limiter.
#[derive(Debug, Clone)]
pub enum LimiterSource {
    /// A limiter handed over at construction.
    Direct(Arc<dyn Limiter>),
    /// A named limiter resolved through a registry on every call.
    Registry {
        /// Shared registry.
        registry: Arc<LimiterRegistry>,
        /// Limiter name.
        name: String,
    },
}

impl LimiterSource {
    fn resolve(&self) -> Result<Arc<dyn Limiter>, LimiterError> {
        match self {
            Self::Direct(limiter) => Ok(Arc::clone(limiter)),
            Self::Registry { registry, name } => registry.get(name),
        }
    }
}

/// Acquires rate-limit capacity before dispatch.
///
/// Tries a non-blocking acquire first and only then waits up to `timeout`.
/// A wait that runs out fails the attempt with `RateLimitTimeout`.
#[derive(Debug, Clone)]
pub struct RateLimitStage {
    source: LimiterSource,
    tokens: f64,
    timeout: Duration,
}

impl RateLimitStage {
    /// Stage name.
    pub const NAME: &'static str = "rate_limit";

    /// Creates a stage acquiring one unit from `source` per job.
    #[must_use]
    pub fn new(source: LimiterSource, timeout: Duration) -> Self {
        Self {
            source,
            tokens: 1.0,
            timeout,
        }
    }

    /// Sets how many units each job costs.
    #[must_use]
    pub fn with_tokens(mut self, tokens: f64) -> Self {
        self.tokens = tokens;
        self
    }
}

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<(), JobError> {
        ctx.transition(JobState::Throttled);
        let limiter = self.source.resolve().map_err(limiter_failure)?;

        if limiter.try_acquire(self.tokens).map_err(limiter_failure)? {
            return Ok(());
        }

        ctx.transition(JobState::Waiting);
        debug!(
            index = ctx.job.index,
            limiter = %limiter.strategy(),
            timeout_ms = self.timeout.as_millis() as u64,
            "Waiting for rate-limit capacity"
        );
        let acquired = limiter
            .wait_for_token(self.tokens, self.timeout)
            .await
            .map_err(limiter_failure)?;
        if acquired {
            Ok(())
        } else {
            Err(JobError::rate_limit_timeout(self.timeout))
        }
    }
}

fn limiter_failure(err: LimiterError) -> JobError {
    JobError::permanent(err.to_string())
}

/// Applies a [`PayloadShaper`] to the working payload.
#[derive(Debug, Clone)]
pub struct PayloadShapingStage {
    shaper: PayloadShaper,
}

impl PayloadShapingStage {
    /// Stage name.
    pub const NAME: &'static str = "payload_shaping";

    /// Creates a shaping stage.
    #[must_use]
    pub fn new(shaper: PayloadShaper) -> Self {
        Self { shaper }
    }
}

#[async_trait]
impl Stage for PayloadShapingStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<(), JobError> {
        ctx.payload = self.shaper.shape(&ctx.payload)?;
        Ok(())
    }
}

/// Calls the generation service.
///
/// With a timeout set, the stage stops waiting after it elapses and reports
/// a transient failure. The remote call itself is not cancelled: the client
/// future is dropped, but work already accepted by the service may still
/// complete on its side.
#[derive(Debug, Clone)]
pub struct ExternalCallStage {
    client: Arc<dyn GenerationClient>,
    timeout: Option<Duration>,
}

impl ExternalCallStage {
    /// Stage name.
    pub const NAME: &'static str = "external_call";

    /// Creates a stage calling `client` without a timeout.
    #[must_use]
    pub fn new(client: Arc<dyn GenerationClient>) -> Self {
        Self {
            client,
            timeout: None,
        }
    }

    /// Bounds each call.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl Stage for ExternalCallStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<(), JobError> {
        ctx.transition(JobState::Dispatched);
        debug!(index = ctx.job.index, attempt = ctx.attempt, "Dispatching external call");

        let call = self.client.invoke(&ctx.payload);
        let artifact = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, call).await.map_err(|_| {
                JobError::transient(format!(
                    "external call timed out after {}ms",
                    timeout.as_millis()
                ))
            })??,
            None => call.await?,
        };

        ctx.task_id = Some(artifact.task_id.clone());
        ctx.artifact = Some(artifact);
        ctx.transition(JobState::Success);
        Ok(())
    }
}

/// Stores freshly generated artifacts.
///
/// Cache hits are not written back. Store failures are logged and do not
/// fail the job.
#[derive(Debug, Clone)]
pub struct CacheStoreStage {
    cache: Arc<dyn Cache>,
    ttl: Option<Duration>,
}

impl CacheStoreStage {
    /// Stage name.
    pub const NAME: &'static str = "cache_store";

    /// Creates a store stage. `ttl: None` uses the cache default.
    #[must_use]
    pub fn new(cache: Arc<dyn Cache>, ttl: Option<Duration>) -> Self {
        Self { cache, ttl }
    }
}

#[async_trait]
impl Stage for CacheStoreStage {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<(), JobError> {
        if ctx.cache_hit {
            return Ok(());
        }
        let Some(artifact) = &ctx.artifact else {
            return Ok(());
        };
        let key = ctx
            .cache_key
            .clone()
            .unwrap_or_else(|| ctx.job.cache_key());
        if let Err(e) = self.cache.set_json(&key, artifact, self.ttl) {
            warn!(index = ctx.job.index, key = %key, error = %e, "Cache store failed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::CacheConfig;
    use crate::limiter::TokenBucket;
    use crate::pipeline::client::MockGenerationClient;
    use crate::pipeline::{JobSpec, Payload};
    use pretty_assertions::assert_eq;

    fn ctx(prompt: &str) -> PipelineContext {
        PipelineContext::new(JobSpec::new(0, Payload::new(prompt)))
    }

    fn memory_cache() -> Arc<dyn Cache> {
        Arc::new(MemoryCache::new(&CacheConfig::new()))
    }

    #[tokio::test]
    async fn test_cache_lookup_hit_and_miss() {
        let cache = memory_cache();
        let stage = CacheLookupStage::new(Arc::clone(&cache));

        let mut miss = ctx("forest");
        stage.execute(&mut miss).await.unwrap();
        assert!(!miss.is_terminal());
        assert_eq!(miss.cache_key, Some(miss.job.cache_key()));

        let artifact = Artifact::new("t-1", vec![1, 2], "image/png");
        cache.set_json(&miss.job.cache_key(), &artifact, None).unwrap();

        let mut hit = ctx("forest");
        stage.execute(&mut hit).await.unwrap();
        assert!(hit.cache_hit);
        assert!(hit.is_terminal());
        assert_eq!(hit.artifact, Some(artifact));
    }

    #[tokio::test]
    async fn test_cache_lookup_ignores_undecodable_entry() {
        let cache = memory_cache();
        let mut c = ctx("forest");
        cache.set(&c.job.cache_key(), b"not json".to_vec(), None).unwrap();

        CacheLookupStage::new(cache).execute(&mut c).await.unwrap();
        assert!(!c.cache_hit);
    }

    #[tokio::test]
    async fn test_cache_store_skips_hits_and_missing_artifacts() {
        let cache = memory_cache();
        let stage = CacheStoreStage::new(Arc::clone(&cache), None);

        let mut empty = ctx("a");
        stage.execute(&mut empty).await.unwrap();
        assert!(cache.is_empty());

        let mut hit = ctx("b");
        hit.complete_from_cache(Artifact::new("t", vec![], "image/png"));
        stage.execute(&mut hit).await.unwrap();
        assert!(cache.is_empty());

        let mut fresh = ctx("c");
        fresh.artifact = Some(Artifact::new("t", vec![9], "image/png"));
        stage.execute(&mut fresh).await.unwrap();
        assert!(cache.exists(&fresh.job.cache_key()).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_waits_then_times_out() {
        let bucket: Arc<dyn Limiter> = Arc::new(TokenBucket::new(1.0, 1.0));
        let stage = RateLimitStage::new(LimiterSource::Direct(bucket), Duration::from_millis(200));

        let mut first = ctx("a");
        stage.execute(&mut first).await.unwrap();
        assert_eq!(first.history(), &[JobState::Throttled]);

        let mut second = ctx("b");
        let err = stage.execute(&mut second).await.unwrap_err();
        assert_eq!(err, JobError::rate_limit_timeout(Duration::from_millis(200)));
        assert_eq!(second.history(), &[JobState::Throttled, JobState::Waiting]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_resolves_through_registry() {
        let registry = Arc::new(LimiterRegistry::new());
        let stage = RateLimitStage::new(
            LimiterSource::Registry {
                registry: Arc::clone(&registry),
                name: "images".to_string(),
            },
            Duration::from_secs(1),
        );

        let err = stage.execute(&mut ctx("a")).await.unwrap_err();
        assert!(matches!(err, JobError::PermanentFailure { .. }));

        registry.add("images", Arc::new(TokenBucket::new(5.0, 5.0)));
        stage.execute(&mut ctx("a")).await.unwrap();
        assert_eq!(registry.get("images").unwrap().available(), 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_request_over_capacity_is_permanent() {
        let bucket: Arc<dyn Limiter> = Arc::new(TokenBucket::new(1.0, 2.0));
        let stage = RateLimitStage::new(LimiterSource::Direct(bucket), Duration::from_secs(1))
            .with_tokens(3.0);
        let err = stage.execute(&mut ctx("a")).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_external_call_success() {
        let mut client = MockGenerationClient::new();
        client
            .expect_invoke()
            .withf(|payload| payload.prompt == "forest")
            .times(1)
            .returning(|_| Ok(Artifact::new("remote-7", vec![1], "image/png")));

        let stage = ExternalCallStage::new(Arc::new(client));
        let mut c = ctx("forest");
        stage.execute(&mut c).await.unwrap();
        assert_eq!(c.task_id.as_deref(), Some("remote-7"));
        assert_eq!(c.history(), &[JobState::Dispatched, JobState::Success]);
    }

    #[tokio::test]
    async fn test_external_call_propagates_client_error() {
        let mut client = MockGenerationClient::new();
        client
            .expect_invoke()
            .returning(|_| Err(JobError::from_status(503, "unavailable")));

        let err = ExternalCallStage::new(Arc::new(client))
            .execute(&mut ctx("forest"))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::TransientFailure { .. }));
    }

    #[derive(Debug)]
    struct StalledClient;

    #[async_trait]
    impl GenerationClient for StalledClient {
        async fn invoke(&self, _payload: &Payload) -> Result<Artifact, JobError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Artifact::new("late", vec![], "image/png"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_external_call_timeout_is_transient() {
        let stage = ExternalCallStage::new(Arc::new(StalledClient))
            .with_timeout(Duration::from_secs(5));
        let err = stage.execute(&mut ctx("forest")).await.unwrap_err();
        assert!(matches!(err, JobError::TransientFailure { .. }));
        assert!(err.to_string().contains("timed out after 5000ms"));
    }

    #[tokio::test]
    async fn test_shaping_stage_updates_working_payload() {
        let stage = PayloadShapingStage::new(PayloadShaper::new());
        let mut c = ctx("forest --ar 1:1");
        stage.execute(&mut c).await.unwrap();
        assert_eq!(c.payload.prompt, "forest");
        assert_eq!(c.job.payload.prompt, "forest --ar 1:1");
    }
}
