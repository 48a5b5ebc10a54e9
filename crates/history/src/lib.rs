//! Result history and modifier settings for fluxdeck.
//!
//! The backend is the durable source of truth but exposes it only as
//! raw job records, so this crate keeps an in-memory history list,
//! mirrors it to a local JSON cache, and can resynchronize from the
//! backend through a tiered fallback chain. It also owns the persisted
//! LoRA enablement/strength settings.

pub mod local;
pub mod reload;
pub mod settings;
pub mod store;

pub use reload::{output_images, OutputImage};
pub use settings::LoraRegistry;
pub use store::HistoryStore;
