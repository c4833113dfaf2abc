//! Testing utilities for genflow pipelines.
//!
//! This module provides:
//! - [`ScriptedClient`], a generation client with scripted outcomes
//! - [`RecordingEventSink`] for asserting on emitted events
//! - [`PanickingStage`] for failure-isolation tests

mod mocks;
mod sink;

pub use mocks::{PanickingStage, ScriptedClient, LATENCY_PARAM};
pub use sink::RecordingEventSink;
