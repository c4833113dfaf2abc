//! Job lifecycle events.
//!
//! The executor and the built-in stages report progress through an
//! [`EventSink`]. Event names are listed in [`event_types`].

mod sink;

pub use sink::{EventSink, LoggingEventSink, NoOpEventSink};

use serde_json::{json, Value};

/// Event names emitted by the executor and pipeline stages.
pub mod event_types {
    /// A batch was accepted.
    pub const BATCH_STARTED: &str = "batch.started";
    /// Every job of a batch has a result.
    pub const BATCH_COMPLETED: &str = "batch.completed";
    /// A job acquired a concurrency slot.
    pub const JOB_STARTED: &str = "job.started";
    /// A job was answered from the cache.
    pub const JOB_CACHE_HIT: &str = "job.cache_hit";
    /// A job is acquiring rate-limit capacity.
    pub const JOB_THROTTLED: &str = "job.throttled";
    /// A job's external call was issued.
    pub const JOB_DISPATCHED: &str = "job.dispatched";
    /// A failed attempt will be retried.
    pub const JOB_RETRYING: &str = "job.retrying";
    /// A job produced an artifact.
    pub const JOB_COMPLETED: &str = "job.completed";
    /// A job ended without an artifact.
    pub const JOB_FAILED: &str = "job.failed";
}

/// Builds the payload shared by every job event.
#[must_use]
pub fn job_event_data(index: usize, attempt: u32) -> Value {
    json!({ "index": index, "attempt": attempt })
}

/// Like [`job_event_data`] with extra fields merged in.
#[must_use]
pub fn job_event_data_with(index: usize, attempt: u32, extra: Value) -> Value {
    let mut data = job_event_data(index, attempt);
    if let (Some(base), Value::Object(extra)) = (data.as_object_mut(), extra) {
        base.extend(extra);
    }
    data
}
