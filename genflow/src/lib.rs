//! # Genflow
//!
//! Throttling, caching and batch execution for clients of slow, rate-limited
//! generation services.
//!
//! Genflow provides:
//!
//! - **Rate limiting**: token bucket, fixed window, sliding window and leaky
//!   bucket limiters behind one [`Limiter`](limiter::Limiter) trait, plus a
//!   named [`LimiterRegistry`](limiter::LimiterRegistry)
//! - **Caching**: a bounded LRU cache with per-entry TTL and a durable cache
//!   that survives restarts
//! - **Job pipelines**: an ordered chain of stages (cache lookup, throttle,
//!   payload shaping, external call, cache store) that short-circuits
//! - **Batch execution**: bounded concurrency, retries with backoff and
//!   payload mutation, one result per job in submission order
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use genflow::prelude::*;
//!
//! let limiter = new_limiter(LimiterStrategy::TokenBucket, &LimiterConfig::new(10.0))?;
//! let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new(&CacheConfig::new()));
//!
//! let pipeline = JobPipeline::generation(client)
//!     .with_cache(cache, None)
//!     .with_limiter(limiter, Duration::from_secs(30))
//!     .build();
//!
//! let results = BatchExecutor::new(pipeline)
//!     .submit_batch(JobSpec::batch(payloads), 3)
//!     .await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation
)]

pub mod cache;
pub mod config;
pub mod errors;
pub mod events;
pub mod executor;
pub mod limiter;
pub mod observability;
pub mod pipeline;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::{Cache, CacheExt, CacheStats, DurableCache, MemoryCache, new_cache};
    pub use crate::config::{
        CacheConfig, DurableCacheConfig, ExecutorConfig, GenflowConfig, LimiterConfig,
        RetryConfig,
    };
    pub use crate::errors::{
        CacheError, ConfigError, GenflowError, JobError, JobErrorKind, LimiterError,
    };
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::executor::{
        BackoffStrategy, BatchExecutor, BatchSummary, FlaggedTermStripper, JitterStrategy,
        JobResult, PayloadMutator,
    };
    pub use crate::limiter::{new_limiter, Limiter, LimiterRegistry, LimiterStrategy};
    pub use crate::pipeline::{
        Artifact, GenerationClient, JobPipeline, JobSpec, JobState, Payload, PayloadShaper,
        PipelineContext, Stage,
    };
}
