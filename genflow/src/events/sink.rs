//! Event sink trait and implementations.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use tracing::{debug, info, warn, Level};

/// Receives job lifecycle events.
///
/// Sinks are injected into the executor and threaded through each job's
/// pipeline context; nothing in the crate reaches for a global sink.
#[async_trait]
pub trait EventSink: Send + Sync + fmt::Debug {
    /// Emits an event asynchronously.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The type of event (e.g., "job.started")
    /// * `data` - Optional event data
    async fn emit(&self, event_type: &str, data: Option<Value>);

    /// Emits an event without blocking.
    ///
    /// Must never panic. Delivery failures are logged and dropped.
    fn try_emit(&self, event_type: &str, data: Option<Value>);
}

/// Discards all events. Used when no sink is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event_type: &str, _data: Option<Value>) {}

    fn try_emit(&self, _event_type: &str, _data: Option<Value>) {}
}

/// Forwards events to `tracing`.
#[derive(Debug, Clone)]
pub struct LoggingEventSink {
    level: Level,
}

impl Default for LoggingEventSink {
    fn default() -> Self {
        Self { level: Level::INFO }
    }
}

impl LoggingEventSink {
    /// Creates a logging sink at the given level.
    #[must_use]
    pub fn new(level: Level) -> Self {
        Self { level }
    }

    /// Creates a debug-level logging sink.
    #[must_use]
    pub fn debug() -> Self {
        Self::new(Level::DEBUG)
    }

    /// Creates an info-level logging sink.
    #[must_use]
    pub fn info() -> Self {
        Self::new(Level::INFO)
    }

    fn log_event(&self, event_type: &str, data: Option<&Value>) {
        match self.level {
            Level::TRACE | Level::DEBUG => {
                debug!(event_type, event_data = ?data, "Event: {}", event_type);
            }
            Level::WARN | Level::ERROR => {
                warn!(event_type, event_data = ?data, "Event: {}", event_type);
            }
            _ => {
                info!(event_type, event_data = ?data, "Event: {}", event_type);
            }
        }
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event_type: &str, data: Option<Value>) {
        self.log_event(event_type, data.as_ref());
    }

    fn try_emit(&self, event_type: &str, data: Option<Value>) {
        self.log_event(event_type, data.as_ref());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_sink() {
        let sink = NoOpEventSink;
        sink.emit("job.started", None).await;
        sink.try_emit("job.started", Some(serde_json::json!({"index": 1})));
    }

    #[tokio::test]
    async fn test_logging_sink_levels() {
        for sink in [
            LoggingEventSink::default(),
            LoggingEventSink::debug(),
            LoggingEventSink::new(Level::WARN),
        ] {
            sink.emit("job.failed", Some(serde_json::json!({"index": 3})))
                .await;
            sink.try_emit("batch.completed", None);
        }
    }
}
