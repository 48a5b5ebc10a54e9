//! Push-channel message types and parser.
//!
//! The backend sends JSON messages over WebSocket with the shape
//! `{"type": "<kind>", "data": {...}}`. This module deserializes them
//! into a strongly-typed [`PushMessage`] enum.

use serde::Deserialize;

/// All known push-channel message types.
///
/// Deserialized via the internally-tagged `"type"` field with
/// associated `"data"` content.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PushMessage {
    /// Server status broadcast (queue depth, etc.).
    #[serde(rename = "status")]
    Status(StatusData),

    /// A job has started executing.
    #[serde(rename = "execution_start")]
    ExecutionStart(ExecutionStartData),

    /// Some nodes were skipped because their outputs are cached.
    #[serde(rename = "execution_cached")]
    ExecutionCached(ExecutionCachedData),

    /// A specific node is currently executing; `node: null` signals
    /// that the whole graph has finished executing.
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    /// Step-level progress from a long-running node (e.g. the sampler).
    #[serde(rename = "progress")]
    Progress(ProgressData),

    /// A node has finished and produced output.
    #[serde(rename = "executed")]
    Executed(ExecutedData),

    /// Execution failed with an error.
    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),
}

/// Queue status information.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

/// Current queue state.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

/// Execution queue statistics.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: i32,
}

/// Payload for `execution_start` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionStartData {
    pub prompt_id: String,
}

/// Payload for `execution_cached` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    /// Node IDs whose outputs were served from cache.
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Payload for `executing` messages.
///
/// When `node` is `None`, execution of the graph has completed. That
/// alone does not prove outputs exist; completion is confirmed through
/// the ledger.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `progress` messages (step-level progress).
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ProgressData {
    /// Current step number.
    pub value: u32,
    /// Total number of steps.
    pub max: u32,
}

impl ProgressData {
    /// Normalized completion in `0..=1`.
    ///
    /// The denominator is clamped to at least 1 so a zero `max` can
    /// never divide by zero, and the result never exceeds 1.
    pub fn fraction(self) -> f64 {
        (f64::from(self.value) / f64::from(self.max.max(1))).min(1.0)
    }
}

/// Payload for `executed` messages (per-node output).
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    /// The node that produced this output.
    pub node: String,
    /// Raw output value (images, filenames, etc.).
    pub output: serde_json::Value,
    pub prompt_id: String,
}

/// Payload for `execution_error` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

/// Parse a push-channel text frame into a typed message.
///
/// Returns `Err` for malformed JSON or unknown `type` values. Callers
/// should log unknown types and continue reading.
pub fn parse_message(text: &str) -> Result<PushMessage, serde_json::Error> {
    serde_json::from_str(text)
}
