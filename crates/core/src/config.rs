//! Environment-derived backend configuration.
//!
//! The backend base URL depends on where the server runs (local
//! loopback vs. LAN host), so it is read from the environment with a
//! loopback default. The WebSocket URL is derived from the HTTP URL
//! unless overridden.

use std::path::PathBuf;

/// Default HTTP base URL for a locally running backend.
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8188";

/// Default directory for durable local state.
pub const DEFAULT_DATA_DIR: &str = ".fluxdeck";

/// Resolved connection and storage configuration.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// HTTP base URL, e.g. `http://host:8188`.
    pub api_url: String,
    /// WebSocket base URL, e.g. `ws://host:8188`.
    pub ws_url: String,
    /// Directory holding `history.json` and `lora-settings.json`.
    pub data_dir: PathBuf,
}

impl BackendConfig {
    /// Load configuration from `FLUXDECK_API_URL`, `FLUXDECK_WS_URL`,
    /// and `FLUXDECK_DATA_DIR`, falling back to defaults.
    pub fn from_env() -> Self {
        let api_url = std::env::var("FLUXDECK_API_URL")
            .unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let ws_url = std::env::var("FLUXDECK_WS_URL")
            .unwrap_or_else(|_| derive_ws_url(&api_url));
        let data_dir = std::env::var("FLUXDECK_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR));
        Self {
            api_url,
            ws_url,
            data_dir,
        }
    }

    /// Build a config pointing at an explicit HTTP base URL.
    pub fn for_api_url(api_url: impl Into<String>) -> Self {
        let api_url = api_url.into();
        let ws_url = derive_ws_url(&api_url);
        Self {
            api_url,
            ws_url,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
        }
    }

    /// Path to the durable history record.
    pub fn history_path(&self) -> PathBuf {
        self.data_dir.join("history.json")
    }

    /// Path to the persisted LoRA settings record.
    pub fn lora_settings_path(&self) -> PathBuf {
        self.data_dir.join("lora-settings.json")
    }
}

/// Swap the URL scheme http(s) -> ws(s).
fn derive_ws_url(api_url: &str) -> String {
    if let Some(rest) = api_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = api_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        api_url.to_string()
    }
}
