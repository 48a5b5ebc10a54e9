//! ComfyUI WebSocket and REST client for fluxdeck.
//!
//! Provides typed push-message parsing, WebSocket connection
//! establishment scoped to a client correlation id, and HTTP wrappers
//! for the endpoints the control panel consumes: workflow submission,
//! image upload, the job ledger, the raw output listing, LoRA
//! discovery, and the canonical `/view` display locator.

pub mod api;
pub mod client;
pub mod messages;

pub use api::{ComfyUIApi, ComfyUIApiError};
pub use client::{ComfyUIClient, ComfyUIClientError, ComfyUIConnection};
pub use messages::PushMessage;
