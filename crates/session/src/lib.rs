//! Generation session orchestration for fluxdeck.
//!
//! Owns the lifecycle of a single in-flight generation job: parameter
//! validation, source-image upload for edits, workflow submission,
//! progress tracking over the push channel, and completion confirmed
//! against the job ledger. One job at a time; a second submission while
//! one is active is rejected.

pub mod events;
pub mod orchestrator;
pub mod state;

pub use events::SessionEvent;
pub use orchestrator::{Orchestrator, SessionConfig, SessionError, SourceImage};
pub use state::{Input, Outcome, Phase};
