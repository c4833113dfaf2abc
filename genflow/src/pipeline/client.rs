//! The external generation service, as the pipeline sees it.

use super::{Artifact, Payload};
use crate::errors::JobError;
use async_trait::async_trait;
use std::fmt::Debug;

/// Client for a remote generation service.
///
/// Implementations classify their own failures: remote throttling, timeouts
/// and 5xx answers as [`JobError::TransientFailure`], flagged content as
/// [`JobError::ContentRejected`], anything else as
/// [`JobError::PermanentFailure`]. [`JobError::from_status`] covers the
/// HTTP-shaped cases.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GenerationClient: Send + Sync + Debug {
    /// Submits `payload` and waits for the finished artifact.
    async fn invoke(&self, payload: &Payload) -> Result<Artifact, JobError>;
}
