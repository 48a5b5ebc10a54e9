//! Backend resync for the history store.
//!
//! Three tiers, tried in order until one succeeds:
//!   1. the backend job ledger (`GET /history`), richest metadata;
//!   2. the raw output-file listing, filenames only;
//!   3. the durable local record.
//!
//! A tier that succeeds is authoritative even when it comes back empty;
//! the next tier is consulted only when the call itself fails. A
//! cleared backend therefore clears the history rather than letting
//! stale local entries resurface.
//!
//! Resync rebuilds the list wholesale; timestamps are approximated as a
//! strictly decreasing sequence from now since neither backend source
//! reports creation times.

use serde_json::Value;

use fluxdeck_comfyui::{ComfyUIApi, ComfyUIApiError};
use fluxdeck_core::types::HistoryEntry;
use fluxdeck_core::workflow_scan::{self, ScannedParams};

use crate::local::UNKNOWN_PROMPT;
use crate::store::{dedupe_by_url, HistoryStore, HISTORY_CAP};

/// Output file extensions recognized as displayable images.
const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp"];

impl HistoryStore {
    /// Rebuild the history from the backend, falling back tier by tier.
    ///
    /// The loading flag is held for the duration so callers can surface
    /// resync-in-progress. Never fails: if both backend tiers are
    /// unreachable the store keeps what the local record held.
    pub async fn reload_from_backend(&self, api: &ComfyUIApi) {
        self.set_loading(true);
        let entries = self.resync_entries(api).await;
        self.replace_all(entries);
        self.set_loading(false);
    }

    async fn resync_entries(&self, api: &ComfyUIApi) -> Vec<HistoryEntry> {
        match api.get_full_history().await {
            Ok(ledger) => {
                let entries = entries_from_ledger(&ledger, api);
                tracing::info!(count = entries.len(), "Resynced history from job ledger");
                return entries;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Job ledger unavailable, trying file listing");
            }
        }

        match self.resync_from_file_listing(api).await {
            Ok(entries) => {
                tracing::info!(count = entries.len(), "Resynced history from file listing");
                return entries;
            }
            Err(e) => {
                tracing::warn!(error = %e, "File listing unavailable, keeping local record");
            }
        }

        self.entries()
    }

    async fn resync_from_file_listing(
        &self,
        api: &ComfyUIApi,
    ) -> Result<Vec<HistoryEntry>, ComfyUIApiError> {
        let files = api.list_output_files().await?;
        Ok(entries_from_file_listing(files, api))
    }
}

/// Build history entries from the full job ledger.
///
/// Jobs are visited newest first (ledger keys in descending order),
/// each contributing one entry per output image. Generation metadata is
/// recovered by scanning the job's submitted graph.
pub fn entries_from_ledger(ledger: &Value, api: &ComfyUIApi) -> Vec<HistoryEntry> {
    let Some(jobs) = ledger.as_object() else {
        return Vec::new();
    };

    let mut keys: Vec<&String> = jobs.keys().collect();
    keys.sort_unstable_by(|a, b| b.cmp(a));

    let now = chrono::Utc::now();
    let mut entries = Vec::new();

    for key in keys.into_iter().take(HISTORY_CAP) {
        let job = &jobs[key];
        let scanned = job
            .get("prompt")
            .and_then(workflow_scan::extract_graph)
            .map(workflow_scan::scan_workflow)
            .unwrap_or_default();

        for image in output_images(job) {
            let Ok(url) = api.view_url(&image.filename, &image.subfolder, &image.file_type) else {
                continue;
            };
            entries.push(entry_from_scan(
                url,
                image.filename,
                &scanned,
                now - chrono::Duration::seconds(entries.len() as i64),
            ));
            if entries.len() >= HISTORY_CAP {
                return dedupe_by_url(entries);
            }
        }
    }

    dedupe_by_url(entries)
}

/// Build placeholder entries from a raw output-file listing.
///
/// Only image files are kept. Names are sorted descending so the
/// timestamp-prefixed filenames the backend produces land newest first.
pub fn entries_from_file_listing(files: Vec<String>, api: &ComfyUIApi) -> Vec<HistoryEntry> {
    let mut images: Vec<String> = files.into_iter().filter(|f| is_image_file(f)).collect();
    images.sort_unstable_by(|a, b| b.cmp(a));
    images.truncate(HISTORY_CAP);

    let now = chrono::Utc::now();
    let mut entries = Vec::new();

    for path in images {
        let (subfolder, filename) = split_output_path(&path);
        let Ok(url) = api.view_url(filename, subfolder, "output") else {
            continue;
        };
        entries.push(entry_from_scan(
            url,
            filename.to_string(),
            &ScannedParams::default(),
            now - chrono::Duration::seconds(entries.len() as i64),
        ));
    }

    dedupe_by_url(entries)
}

/// One output image reported by a ledger job entry.
#[derive(Debug, Clone)]
pub struct OutputImage {
    pub filename: String,
    pub subfolder: String,
    pub file_type: String,
}

/// Collect the output images reported by a ledger job entry.
pub fn output_images(job: &Value) -> Vec<OutputImage> {
    let Some(outputs) = job.get("outputs").and_then(|v| v.as_object()) else {
        return Vec::new();
    };

    let mut images = Vec::new();
    for node_output in outputs.values() {
        let Some(items) = node_output.get("images").and_then(|v| v.as_array()) else {
            continue;
        };
        for item in items {
            let Some(filename) = item.get("filename").and_then(|v| v.as_str()) else {
                continue;
            };
            images.push(OutputImage {
                filename: filename.to_string(),
                subfolder: item
                    .get("subfolder")
                    .and_then(|v| v.as_str())
                    .unwrap_or("")
                    .to_string(),
                file_type: item
                    .get("type")
                    .and_then(|v| v.as_str())
                    .unwrap_or("output")
                    .to_string(),
            });
        }
    }
    images
}

fn entry_from_scan(
    url: String,
    filename: String,
    scanned: &ScannedParams,
    timestamp: fluxdeck_core::types::Timestamp,
) -> HistoryEntry {
    HistoryEntry {
        url,
        timestamp,
        prompt: if scanned.prompt.is_empty() {
            UNKNOWN_PROMPT.to_string()
        } else {
            scanned.prompt.clone()
        },
        seed: scanned.seed,
        steps: scanned.steps,
        guidance: scanned.guidance,
        mode: scanned.mode,
        filename,
        width: scanned.width,
        height: scanned.height,
        lora_settings: None,
        edit_prompt: None,
    }
}

fn is_image_file(path: &str) -> bool {
    path.rsplit('.')
        .next()
        .map(|ext| IMAGE_EXTENSIONS.iter().any(|e| ext.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Split an output listing path into `(subfolder, filename)`.
fn split_output_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((subfolder, filename)) => (subfolder, filename),
        None => ("", path),
    }
}
