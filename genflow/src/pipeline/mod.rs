//! Job pipelines.
//!
//! This module provides:
//! - Job inputs and outputs ([`JobSpec`], [`Payload`], [`Artifact`])
//! - The per-attempt [`PipelineContext`] and [`JobState`] machine
//! - The [`Stage`] trait and the built-in generation stages
//! - [`JobPipeline`], an ordered chain of stages that stops at the first
//!   stage leaving the context terminal

mod client;
mod context;
mod shaping;
mod stage;
mod stages;

pub use client::GenerationClient;
pub use context::{Artifact, JobSpec, JobState, Payload, PipelineContext};
pub use shaping::PayloadShaper;
pub(crate) use shaping::collapse_whitespace;
pub use stage::{FnStage, Stage};
pub use stages::{
    CacheLookupStage, CacheStoreStage, ExternalCallStage, LimiterSource, PayloadShapingStage,
    RateLimitStage,
};

#[cfg(test)]
pub use client::MockGenerationClient;

use crate::cache::Cache;
use crate::errors::{GenflowError, JobError};
use crate::limiter::{Limiter, LimiterRegistry};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// An ordered, short-circuiting chain of stages.
#[derive(Debug, Clone)]
pub struct JobPipeline {
    stages: Vec<Arc<dyn Stage>>,
}

impl JobPipeline {
    /// Starts an empty builder.
    #[must_use]
    pub fn builder() -> JobPipelineBuilder {
        JobPipelineBuilder::default()
    }

    /// Starts the canonical generation pipeline around `client`.
    ///
    /// Only the external call is mandatory; cache, throttling and shaping
    /// stages are added by the builder's `with_*` methods.
    #[must_use]
    pub fn generation(client: Arc<dyn GenerationClient>) -> GenerationPipelineBuilder {
        GenerationPipelineBuilder::new(client)
    }

    /// Stage names in execution order.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Runs one attempt.
    ///
    /// Stages run in order until one fails or leaves the context terminal.
    /// Returns the artifact, or the error that ended the attempt; the error
    /// is also recorded on the context.
    pub async fn run(&self, ctx: &mut PipelineContext) -> Result<Artifact, JobError> {
        for stage in &self.stages {
            if ctx.is_terminal() {
                debug!(index = ctx.job.index, stage = stage.name(), "Skipping stage");
                continue;
            }
            if let Err(err) = stage.execute(ctx).await {
                debug!(index = ctx.job.index, stage = stage.name(), error = %err, "Stage failed");
                ctx.fail(err);
            }
        }

        if let Some(err) = &ctx.error {
            return Err(err.clone());
        }
        if let Some(artifact) = &ctx.artifact {
            return Ok(artifact.clone());
        }
        let err = JobError::permanent("pipeline finished without an artifact");
        ctx.fail(err.clone());
        Err(err)
    }
}

/// Builder for an arbitrary [`JobPipeline`].
#[derive(Debug, Default)]
pub struct JobPipelineBuilder {
    stages: Vec<Arc<dyn Stage>>,
}

impl JobPipelineBuilder {
    /// Appends a stage.
    #[must_use]
    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    /// Validates and builds the pipeline.
    ///
    /// # Errors
    ///
    /// Fails if there are no stages or two stages share a name.
    pub fn build(self) -> Result<JobPipeline, GenflowError> {
        if self.stages.is_empty() {
            return Err(GenflowError::Pipeline("pipeline has no stages".to_string()));
        }
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name()) {
                return Err(GenflowError::Pipeline(format!(
                    "duplicate stage name '{}'",
                    stage.name()
                )));
            }
        }
        Ok(JobPipeline {
            stages: self.stages,
        })
    }
}

/// Builder for the canonical generation pipeline:
/// cache lookup → rate limit → payload shaping → external call → cache store.
#[derive(Debug)]
pub struct GenerationPipelineBuilder {
    client: Arc<dyn GenerationClient>,
    call_timeout: Option<Duration>,
    cache: Option<(Arc<dyn Cache>, Option<Duration>)>,
    limiter: Option<RateLimitStage>,
    shaper: Option<PayloadShaper>,
}

impl GenerationPipelineBuilder {
    fn new(client: Arc<dyn GenerationClient>) -> Self {
        Self {
            client,
            call_timeout: None,
            cache: None,
            limiter: None,
            shaper: None,
        }
    }

    /// Adds cache lookup and store. `ttl: None` uses the cache default.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn Cache>, ttl: Option<Duration>) -> Self {
        self.cache = Some((cache, ttl));
        self
    }

    /// Throttles every attempt on `limiter`, waiting at most `timeout`.
    #[must_use]
    pub fn with_limiter(mut self, limiter: Arc<dyn Limiter>, timeout: Duration) -> Self {
        self.limiter = Some(RateLimitStage::new(LimiterSource::Direct(limiter), timeout));
        self
    }

    /// Throttles on a named registry limiter resolved at call time.
    #[must_use]
    pub fn with_registry_limiter(
        mut self,
        registry: Arc<LimiterRegistry>,
        name: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let source = LimiterSource::Registry {
            registry,
            name: name.into(),
        };
        self.limiter = Some(RateLimitStage::new(source, timeout));
        self
    }

    /// Sets the units each job costs on the configured limiter.
    #[must_use]
    pub fn with_tokens(mut self, tokens: f64) -> Self {
        self.limiter = self.limiter.map(|stage| stage.with_tokens(tokens));
        self
    }

    /// Shapes the payload before dispatch.
    #[must_use]
    pub fn with_shaper(mut self, shaper: PayloadShaper) -> Self {
        self.shaper = Some(shaper);
        self
    }

    /// Bounds each external call.
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Builds the pipeline.
    #[must_use]
    pub fn build(self) -> JobPipeline {
        let mut stages: Vec<Arc<dyn Stage>> = Vec::with_capacity(5);
        if let Some((cache, _)) = &self.cache {
            stages.push(Arc::new(CacheLookupStage::new(Arc::clone(cache))));
        }
        if let Some(limiter) = self.limiter {
            stages.push(Arc::new(limiter));
        }
        if let Some(shaper) = self.shaper {
            stages.push(Arc::new(PayloadShapingStage::new(shaper)));
        }
        let mut call = ExternalCallStage::new(self.client);
        if let Some(timeout) = self.call_timeout {
            call = call.with_timeout(timeout);
        }
        stages.push(Arc::new(call));
        if let Some((cache, ttl)) = self.cache {
            stages.push(Arc::new(CacheStoreStage::new(cache, ttl)));
        }
        JobPipeline { stages }
    }
}
