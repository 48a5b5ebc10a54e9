//! Domain types, validation, and pure workflow-graph logic for fluxdeck.
//!
//! Everything in this crate is I/O-free: generation parameters, the
//! history entry shape, workflow construction for create/edit jobs, and
//! heuristic parameter recovery from previously submitted graphs.

pub mod config;
pub mod error;
pub mod types;
pub mod workflow;
pub mod workflow_scan;
