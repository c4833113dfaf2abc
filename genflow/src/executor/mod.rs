//! Batch execution of generation jobs.
//!
//! This module provides:
//! - [`BatchExecutor`] for bounded-concurrency, order-preserving batches
//! - Retry decisions with backoff and jitter ([`RetryState`])
//! - Payload mutation after content rejections ([`PayloadMutator`])
//! - Per-job results and batch summaries

mod batch;
mod mutation;
mod result;
mod retry;

#[cfg(test)]
mod integration_tests;

pub use batch::BatchExecutor;
pub use mutation::{FlaggedTermStripper, PayloadMutator};
pub use result::{BatchSummary, JobResult};
pub use retry::{BackoffStrategy, JitterStrategy, RetryDecision, RetryState};
