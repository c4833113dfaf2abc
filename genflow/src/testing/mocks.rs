//! Test doubles for the generation client and pipeline stages.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use crate::errors::JobError;
use crate::pipeline::{Artifact, GenerationClient, Payload, PipelineContext, Stage};

/// Payload param that overrides [`ScriptedClient`] latency for one call.
pub const LATENCY_PARAM: &str = "latency_ms";

/// A scripted [`GenerationClient`].
///
/// Each call pops the next scripted outcome; once the script runs out every
/// call succeeds with an artifact whose data is the prompt. Prompts containing
/// a rejected term (ignoring case) are rejected with that term flagged,
/// without consuming the script.
#[derive(Debug, Default)]
pub struct ScriptedClient {
    script: Mutex<VecDeque<Result<(), JobError>>>,
    rejected_terms: Vec<String>,
    latency: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    dispatches: Mutex<Vec<Instant>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedClient {
    /// Creates a client that always succeeds immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps for `latency` on every call.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Appends outcomes to the script.
    #[must_use]
    pub fn with_script(self, outcomes: impl IntoIterator<Item = Result<(), JobError>>) -> Self {
        self.script.lock().extend(outcomes);
        self
    }

    /// Rejects prompts containing any of `terms`.
    #[must_use]
    pub fn with_rejected_terms<I, S>(mut self, terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rejected_terms.extend(terms.into_iter().map(Into::into));
        self
    }

    /// Appends one outcome to the script.
    pub fn push_outcome(&self, outcome: Result<(), JobError>) {
        self.script.lock().push_back(outcome);
    }

    /// Number of calls started.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls that were in flight at once.
    #[must_use]
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// When each call started, in call order.
    #[must_use]
    pub fn dispatch_times(&self) -> Vec<Instant> {
        self.dispatches.lock().clone()
    }

    /// Call start times relative to `origin`.
    #[must_use]
    pub fn dispatch_offsets(&self, origin: Instant) -> Vec<Duration> {
        self.dispatches
            .lock()
            .iter()
            .map(|at| at.saturating_duration_since(origin))
            .collect()
    }

    /// Prompts received, in call order.
    #[must_use]
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    fn flagged_terms(&self, prompt: &str) -> Vec<String> {
        let lowered = prompt.to_lowercase();
        self.rejected_terms
            .iter()
            .filter(|term| lowered.contains(&term.to_lowercase()))
            .cloned()
            .collect()
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl GenerationClient for ScriptedClient {
    async fn invoke(&self, payload: &Payload) -> Result<Artifact, JobError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.dispatches.lock().push(Instant::now());
        self.prompts.lock().push(payload.prompt.clone());

        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        let latency = payload
            .params
            .get(LATENCY_PARAM)
            .and_then(Value::as_u64)
            .map_or(self.latency, Duration::from_millis);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let flagged = self.flagged_terms(&payload.prompt);
        if !flagged.is_empty() {
            return Err(JobError::content_rejected("prompt flagged", flagged));
        }

        let scripted = self.script.lock().pop_front();
        if let Some(Err(err)) = scripted {
            return Err(err);
        }

        Ok(Artifact::new(
            Uuid::new_v4().to_string(),
            payload.prompt.as_bytes().to_vec(),
            "image/png",
        )
        .with_metadata("prompt", payload.prompt.clone()))
    }
}

/// A stage that panics, for exercising failure isolation.
#[derive(Debug)]
pub struct PanickingStage {
    name: String,
    indices: Option<BTreeSet<usize>>,
}

impl PanickingStage {
    /// Panics on every job.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indices: None,
        }
    }

    /// Panics only on jobs whose index is in `indices`.
    #[must_use]
    pub fn for_indices(name: impl Into<String>, indices: impl IntoIterator<Item = usize>) -> Self {
        Self {
            name: name.into(),
            indices: Some(indices.into_iter().collect()),
        }
    }
}

#[async_trait]
impl Stage for PanickingStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &mut PipelineContext) -> Result<(), JobError> {
        let index = ctx.job.index;
        if self.indices.as_ref().map_or(true, |set| set.contains(&index)) {
            panic!("{} panicked on job {index}", self.name);
        }
        Ok(())
    }
}
