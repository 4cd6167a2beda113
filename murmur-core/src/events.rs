//! Status events broadcast by the capture pipeline.
//!
//! | Event | Source |
//! |-------|--------|
//! | `CaptureStateEvent` | `DspHandle::subscribe` |
//! | `PipelineStatusEvent` | `DspPipeline::subscribe_status` |
//!
//! Both serialize to camelCase JSON so a UI or LED controller in another
//! process can consume them as is.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Capture state
// ---------------------------------------------------------------------------

/// Mode of the capture state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    /// Mic audio is being forwarded to the recognizer.
    Streaming,
    /// Listening for the wake word only.
    Stopped,
    /// Mic writes are dropped and wake word detection is off.
    Muted,
}

/// What opened a dialog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialogTrigger {
    Wakeword,
    Tap,
    /// Explicit start from the application, no recognize call.
    Manual,
}

/// Emitted whenever the capture state machine changes mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureStateEvent {
    /// Monotonically increasing event sequence number.
    pub seq: u64,
    pub state: CaptureState,
    pub previous: CaptureState,
    /// Set when the transition opened a dialog.
    pub trigger: Option<DialogTrigger>,
}

// ---------------------------------------------------------------------------
// Pipeline status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStatus {
    /// Threads are up and the command queue is being served.
    Running,
    /// Shut down cleanly.
    Stopped,
    /// A worker died; the pipeline must be rebuilt.
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatusEvent {
    pub status: PipelineStatus,
    /// Optional human-readable detail (e.g. error message).
    pub detail: Option<String>,
}
