//! Session lifecycle events broadcast to observers.

use fluxdeck_core::types::HistoryEntry;

/// Events emitted over the orchestrator's broadcast channel.
///
/// Exactly one terminal event (`Completed`, `Failed`, `TimedOut`, or
/// `Cancelled`) is emitted per session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The edit source image was uploaded; carries the server-side name.
    Uploaded { name: String },

    /// The workflow was accepted by the backend.
    Submitted { prompt_id: String },

    /// Step-level progress, normalized to `0..=1`.
    Progress { value: u32, max: u32, fraction: f64 },

    /// Outputs were confirmed in the job ledger; carries the recorded
    /// history entry (the job's first output image).
    Completed { entries: Vec<HistoryEntry> },

    /// The job failed (execution error or a failed ledger poll).
    Failed { reason: String },

    /// No outputs appeared within the session deadline.
    TimedOut,

    /// The session was cancelled locally.
    Cancelled,
}
