//! Durable local storage for history and LoRA settings.
//!
//! JSON files acting as a resilience cache, not a primary store:
//! writes are best-effort and reads tolerate legacy shapes. Early
//! versions persisted history as a bare list of locator strings; those
//! are upgraded to the full entry shape on load.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde_json::Value;

use fluxdeck_core::types::{HistoryEntry, LoraSetting, WorkflowMode};
use fluxdeck_core::workflow_scan::{FALLBACK_DIMENSION, FALLBACK_GUIDANCE, FALLBACK_STEPS};

/// Prompt placeholder for entries whose originating prompt is unknown.
pub const UNKNOWN_PROMPT: &str = "Unknown prompt";

/// Errors from the local storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed record: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// The on-disk history record.
pub struct HistoryFile {
    path: PathBuf,
}

impl HistoryFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load the persisted history list.
    ///
    /// A missing file yields an empty list. Legacy entries (bare
    /// locator strings) are upgraded in place to the full shape with
    /// placeholder metadata; entries that fail to parse are dropped
    /// with a warning rather than poisoning the whole record.
    pub fn load(&self) -> Result<Vec<HistoryEntry>, StorageError> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let values: Vec<Value> = serde_json::from_str(&raw)?;
        let now = chrono::Utc::now();

        let mut entries = Vec::with_capacity(values.len());
        for (index, value) in values.into_iter().enumerate() {
            match value {
                Value::String(url) => entries.push(upgrade_legacy_entry(url, index, now)),
                other => match serde_json::from_value::<HistoryEntry>(other) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => {
                        tracing::warn!(error = %e, "Dropping unparseable history entry");
                    }
                },
            }
        }
        Ok(entries)
    }

    /// Persist the history list, creating the parent directory if
    /// needed.
    pub fn save(&self, entries: &[HistoryEntry]) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string(entries)?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }

    /// Remove the durable record entirely.
    pub fn clear(&self) -> Result<(), StorageError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Upgrade a legacy bare-locator entry to the full shape.
fn upgrade_legacy_entry(url: String, index: usize, now: fluxdeck_core::types::Timestamp) -> HistoryEntry {
    HistoryEntry {
        url,
        timestamp: now - chrono::Duration::seconds(index as i64),
        prompt: UNKNOWN_PROMPT.to_string(),
        seed: 0,
        steps: FALLBACK_STEPS,
        guidance: FALLBACK_GUIDANCE,
        mode: WorkflowMode::Create,
        filename: "unknown.png".to_string(),
        width: FALLBACK_DIMENSION,
        height: FALLBACK_DIMENSION,
        lora_settings: None,
        edit_prompt: None,
    }
}

/// The on-disk LoRA settings record, keyed by LoRA name.
pub struct SettingsFile {
    path: PathBuf,
}

impl SettingsFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load persisted settings; a missing or malformed file yields an
    /// empty map (settings are reconstructable, never load-bearing).
    pub fn load(&self) -> BTreeMap<String, LoraSetting> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(error = %e, "Failed to read LoRA settings");
                }
                return BTreeMap::new();
            }
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Malformed LoRA settings record, starting fresh");
            BTreeMap::new()
        })
    }

    /// Persist the settings map.
    pub fn save(&self, settings: &BTreeMap<String, LoraSetting>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string(settings)?;
        std::fs::write(&self.path, raw)?;
        Ok(())
    }
}
