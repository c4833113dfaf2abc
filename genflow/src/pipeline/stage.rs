//! Stage trait and the function-backed stage.

use super::PipelineContext;
use crate::errors::JobError;
use async_trait::async_trait;
use std::fmt::Debug;

/// One link in a job pipeline.
///
/// A stage reads and updates the context. Returning an error ends the
/// attempt; calling [`PipelineContext::complete_from_cache`] ends it
/// successfully. Either way the remaining stages are skipped.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the name of the stage. Unique within a pipeline.
    fn name(&self) -> &str;

    /// Executes the stage.
    async fn execute(&self, ctx: &mut PipelineContext) -> Result<(), JobError>;
}

/// A synchronous function-based stage.
pub struct FnStage<F>
where
    F: Fn(&mut PipelineContext) -> Result<(), JobError> + Send + Sync,
{
    name: String,
    func: F,
}

impl<F> FnStage<F>
where
    F: Fn(&mut PipelineContext) -> Result<(), JobError> + Send + Sync,
{
    /// Creates a new function-based stage.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(&mut PipelineContext) -> Result<(), JobError> + Send + Sync,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnStage").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(&mut PipelineContext) -> Result<(), JobError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<(), JobError> {
        (self.func)(ctx)
    }
}
