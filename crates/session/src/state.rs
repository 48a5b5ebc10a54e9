//! Pure session state machine.
//!
//! Every event source (push channel, ledger polls, the deadline, the
//! cancel token) is reduced to an [`Input`] and fed through a single
//! [`transition`] function. Terminal phases absorb all further inputs,
//! so a stale poll result arriving after a cancel or timeout can never
//! resurrect a session.

/// Lifecycle phase of a generation session.
#[derive(Debug, Clone, PartialEq)]
pub enum Phase {
    /// No job in flight.
    Idle,
    /// Edit source image upload in progress.
    Uploading,
    /// Workflow accepted; no execution evidence yet.
    Submitted,
    /// Execution evidence observed (progress or node activity).
    Tracking,
    /// Terminal.
    Done(Outcome),
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Outputs confirmed in the job ledger.
    Completed,
    /// Execution error or failed ledger poll.
    Failed(String),
    /// Deadline elapsed before outputs appeared.
    TimedOut,
    /// Cancelled locally.
    Cancelled,
}

/// A lifecycle event from any source, normalized.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    /// Edit upload began.
    UploadStarted,
    /// Edit upload finished.
    UploadFinished,
    /// The backend accepted the workflow.
    SubmitAccepted,
    /// Step-level progress arrived on the push channel.
    Progress,
    /// A node began (or finished) executing.
    NodeActivity,
    /// The push channel reported the whole graph finished executing.
    ///
    /// Informational only; completion requires ledger confirmation.
    GraphFinished,
    /// The push channel reported an execution error.
    ExecutionErrored(String),
    /// The push channel closed.
    ///
    /// Not terminal; ledger polling continues without it.
    ChannelClosed,
    /// A ledger poll found outputs.
    OutputsConfirmed,
    /// A ledger poll failed.
    PollFailed(String),
    /// The session deadline elapsed.
    DeadlineElapsed,
    /// Cancellation was requested.
    CancelRequested,
}

/// Compute the next phase for an input.
///
/// Terminal phases are absorbing. Cancellation wins from any live
/// phase and is a no-op afterwards.
pub fn transition(phase: &Phase, input: &Input) -> Phase {
    if let Phase::Done(_) = phase {
        return phase.clone();
    }

    match input {
        Input::CancelRequested => Phase::Done(Outcome::Cancelled),
        Input::DeadlineElapsed => Phase::Done(Outcome::TimedOut),
        Input::OutputsConfirmed => Phase::Done(Outcome::Completed),
        Input::PollFailed(reason) => Phase::Done(Outcome::Failed(reason.clone())),
        Input::ExecutionErrored(reason) => Phase::Done(Outcome::Failed(reason.clone())),
        Input::UploadStarted => Phase::Uploading,
        Input::UploadFinished => Phase::Uploading,
        Input::SubmitAccepted => Phase::Submitted,
        Input::Progress | Input::NodeActivity => match phase {
            Phase::Submitted | Phase::Tracking => Phase::Tracking,
            other => other.clone(),
        },
        Input::GraphFinished | Input::ChannelClosed => phase.clone(),
    }
}
