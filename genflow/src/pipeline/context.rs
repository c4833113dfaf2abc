//! Job inputs, outputs and the per-job scratch state stages work on.

use crate::cache::digest_key;
use crate::errors::JobError;
use crate::events::{event_types, job_event_data, EventSink, NoOpEventSink};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Request sent to the generation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// Free-text prompt.
    pub prompt: String,
    /// Service parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, Value>,
}

impl Payload {
    /// Creates a payload with no parameters.
    #[must_use]
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            params: BTreeMap::new(),
        }
    }

    /// Adds a parameter.
    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }
}

/// One unit of work submitted to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Submission order, echoed back on the result.
    pub index: usize,
    /// The request as submitted.
    pub payload: Payload,
    /// Higher priorities are dispatched first.
    #[serde(default)]
    pub priority: i32,
    /// Variant tag (style, size, ...). Part of the cache key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl JobSpec {
    /// Creates a job with default priority and no variant.
    #[must_use]
    pub fn new(index: usize, payload: Payload) -> Self {
        Self {
            index,
            payload,
            priority: 0,
            variant: None,
        }
    }

    /// Sets the dispatch priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the variant tag.
    #[must_use]
    pub fn with_variant(mut self, variant: impl Into<String>) -> Self {
        self.variant = Some(variant.into());
        self
    }

    /// Numbers payloads in order.
    pub fn batch(payloads: impl IntoIterator<Item = Payload>) -> Vec<Self> {
        payloads
            .into_iter()
            .enumerate()
            .map(|(index, payload)| Self::new(index, payload))
            .collect()
    }

    /// Cache key for this job's original request.
    ///
    /// Derived from the submitted payload and variant, never from a shaped or
    /// mutated copy, so retries and repeats of the same request share a key.
    #[must_use]
    pub fn cache_key(&self) -> String {
        let params = Value::Object(
            self.payload
                .params
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
        let material = format!(
            "{}\u{1f}{}\u{1f}{}",
            self.payload.prompt,
            params,
            self.variant.as_deref().unwrap_or_default()
        );
        format!("gen:{}", digest_key(material.as_bytes()))
    }
}

/// Output of a successful generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    /// Task handle assigned by the remote service.
    pub task_id: String,
    /// Raw artifact bytes.
    #[serde(with = "crate::cache::format::base64_bytes")]
    pub data: Vec<u8>,
    /// MIME type of `data`.
    pub content_type: String,
    /// Extra service metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, Value>,
}

impl Artifact {
    /// Creates an artifact.
    #[must_use]
    pub fn new(task_id: impl Into<String>, data: Vec<u8>, content_type: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            data,
            content_type: content_type.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Adds a metadata field.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// States a job moves through.
///
/// `Pending → CacheHit → Done`, or
/// `Pending → Throttled → Waiting → Dispatched → Success → Done`, with
/// `Error → Retrying → (Dispatched | Failed)` on failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Accepted, not yet started.
    Pending,
    /// Answered from the cache.
    CacheHit,
    /// Acquiring rate-limit capacity.
    Throttled,
    /// Blocked until capacity frees up.
    Waiting,
    /// External call issued.
    Dispatched,
    /// External call returned an artifact.
    Success,
    /// An attempt failed.
    Error,
    /// A failed attempt will be retried.
    Retrying,
    /// Retries exhausted or the error was not retryable.
    Failed,
    /// Finished with an artifact.
    Done,
}

impl JobState {
    /// Returns the lifecycle event emitted on entering this state, if any.
    #[must_use]
    pub fn event_type(self) -> Option<&'static str> {
        match self {
            Self::CacheHit => Some(event_types::JOB_CACHE_HIT),
            Self::Throttled => Some(event_types::JOB_THROTTLED),
            Self::Dispatched => Some(event_types::JOB_DISPATCHED),
            _ => None,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::CacheHit => "cache_hit",
            Self::Throttled => "throttled",
            Self::Waiting => "waiting",
            Self::Dispatched => "dispatched",
            Self::Success => "success",
            Self::Error => "error",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
            Self::Done => "done",
        };
        write!(f, "{s}")
    }
}

/// Mutable state for one attempt of one job.
///
/// Created fresh for every attempt. A stage finishes the job early by
/// calling [`complete_from_cache`](Self::complete_from_cache) or by setting
/// an error; either makes the context terminal and the remaining stages are
/// skipped.
#[derive(Debug)]
pub struct PipelineContext {
    /// The job as submitted.
    pub job: JobSpec,
    /// Working copy of the payload; shaped and mutated in place.
    pub payload: Payload,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Cache key, set by the cache lookup stage.
    pub cache_key: Option<String>,
    /// Remote task handle.
    pub task_id: Option<String>,
    /// Result artifact.
    pub artifact: Option<Artifact>,
    /// Failure of this attempt.
    pub error: Option<JobError>,
    /// True when the artifact came from the cache.
    pub cache_hit: bool,
    completed: bool,
    history: Vec<JobState>,
    events: Arc<dyn EventSink>,
}

impl PipelineContext {
    /// Creates a context for the first attempt of `job`.
    #[must_use]
    pub fn new(job: JobSpec) -> Self {
        let payload = job.payload.clone();
        Self {
            job,
            payload,
            attempt: 1,
            cache_key: None,
            task_id: None,
            artifact: None,
            error: None,
            cache_hit: false,
            completed: false,
            history: Vec::new(),
            events: Arc::new(NoOpEventSink),
        }
    }

    /// Replaces the working payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the attempt number.
    #[must_use]
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Routes state-change events to `sink`.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Records a state change and emits its event.
    pub fn transition(&mut self, state: JobState) {
        self.history.push(state);
        if let Some(event_type) = state.event_type() {
            self.events
                .try_emit(event_type, Some(job_event_data(self.job.index, self.attempt)));
        }
    }

    /// Finishes the job with a cached artifact.
    pub fn complete_from_cache(&mut self, artifact: Artifact) {
        self.task_id = Some(artifact.task_id.clone());
        self.artifact = Some(artifact);
        self.cache_hit = true;
        self.completed = true;
        self.transition(JobState::CacheHit);
    }

    /// Records a failed attempt.
    pub fn fail(&mut self, error: JobError) {
        self.error = Some(error);
        self.transition(JobState::Error);
    }

    /// True once the remaining stages must be skipped.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.completed || self.error.is_some()
    }

    /// States recorded so far.
    #[must_use]
    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    /// Moves the recorded states out.
    pub fn take_history(&mut self) -> Vec<JobState> {
        std::mem::take(&mut self.history)
    }

    /// The sink events are routed to.
    #[must_use]
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }
}
