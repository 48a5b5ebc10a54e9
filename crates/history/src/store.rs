//! In-memory result history with best-effort durable backing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use fluxdeck_core::types::HistoryEntry;

use crate::local::HistoryFile;

/// Maximum number of entries the history retains.
pub const HISTORY_CAP: usize = 50;

/// Bounded, deduplicated store of completed jobs.
///
/// Newest entries first. Entries are keyed by display locator: adding
/// an entry whose `url` is already present replaces the older copy.
/// Every mutation persists the full list to the backing file; a failed
/// write is logged and otherwise ignored, the in-memory list stays
/// authoritative for the session.
pub struct HistoryStore {
    entries: RwLock<Vec<HistoryEntry>>,
    file: HistoryFile,
    loading: AtomicBool,
}

impl HistoryStore {
    /// Open the store, seeding from the durable record if one exists.
    pub fn open(file: HistoryFile) -> Self {
        let mut seeded = file.load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to load history record, starting empty");
            Vec::new()
        });
        seeded.truncate(HISTORY_CAP);
        Self {
            entries: RwLock::new(seeded),
            file,
            loading: AtomicBool::new(false),
        }
    }

    /// Record a completed job at the front of the history.
    ///
    /// The entry is re-stamped with the current time so ordering
    /// reflects insertion, not generation start.
    pub fn add(&self, mut entry: HistoryEntry) {
        entry.timestamp = chrono::Utc::now();
        {
            let mut entries = self.entries.write().expect("history lock poisoned");
            entries.retain(|e| e.url != entry.url);
            entries.insert(0, entry);
            entries.truncate(HISTORY_CAP);
        }
        self.persist();
    }

    /// Remove the entry with the given display locator, if present.
    pub fn remove(&self, url: &str) {
        let removed = {
            let mut entries = self.entries.write().expect("history lock poisoned");
            let before = entries.len();
            entries.retain(|e| e.url != url);
            entries.len() != before
        };
        if removed {
            self.persist();
        }
    }

    /// Drop all entries, in memory and on disk.
    pub fn clear(&self) {
        self.entries.write().expect("history lock poisoned").clear();
        if let Err(e) = self.file.clear() {
            tracing::warn!(error = %e, "Failed to clear history record");
        }
    }

    /// Replace the whole list, deduplicating by locator and capping.
    pub fn replace_all(&self, new_entries: Vec<HistoryEntry>) {
        let deduped = dedupe_by_url(new_entries);
        {
            let mut entries = self.entries.write().expect("history lock poisoned");
            *entries = deduped;
        }
        self.persist();
    }

    /// Snapshot of the current entries, newest first.
    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.entries.read().expect("history lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("history lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a backend resync is currently in flight.
    pub fn is_loading(&self) -> bool {
        self.loading.load(Ordering::Acquire)
    }

    pub(crate) fn set_loading(&self, value: bool) {
        self.loading.store(value, Ordering::Release);
    }

    fn persist(&self) {
        let entries = self.entries.read().expect("history lock poisoned");
        if let Err(e) = self.file.save(&entries) {
            tracing::warn!(error = %e, "Failed to persist history record");
        }
    }
}

/// Keep the first occurrence of each locator, capped to [`HISTORY_CAP`].
pub(crate) fn dedupe_by_url(entries: Vec<HistoryEntry>) -> Vec<HistoryEntry> {
    let mut seen = std::collections::HashSet::new();
    entries
        .into_iter()
        .filter(|e| seen.insert(e.url.clone()))
        .take(HISTORY_CAP)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxdeck_core::types::WorkflowMode;

    fn entry(url: &str) -> HistoryEntry {
        HistoryEntry {
            url: url.to_string(),
            timestamp: chrono::Utc::now(),
            prompt: "p".to_string(),
            seed: 0,
            steps: 20,
            guidance: 3.5,
            mode: WorkflowMode::Create,
            filename: "f.png".to_string(),
            width: 1024,
            height: 1024,
            lora_settings: None,
            edit_prompt: None,
        }
    }

    fn store() -> (HistoryStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let file = HistoryFile::new(dir.path().join("history.json"));
        (HistoryStore::open(file), dir)
    }

    #[test]
    fn add_puts_newest_first() {
        let (store, _dir) = store();
        store.add(entry("a"));
        store.add(entry("b"));
        let entries = store.entries();
        assert_eq!(entries[0].url, "b");
        assert_eq!(entries[1].url, "a");
    }

    #[test]
    fn add_replaces_duplicate_locator() {
        let (store, _dir) = store();
        store.add(entry("a"));
        store.add(entry("b"));
        store.add(entry("a"));
        let entries = store.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].url, "a");
    }

    #[test]
    fn cap_is_enforced() {
        let (store, _dir) = store();
        for i in 0..(HISTORY_CAP + 5) {
            store.add(entry(&format!("u{i}")));
        }
        assert_eq!(store.len(), HISTORY_CAP);
        assert_eq!(store.entries()[0].url, format!("u{}", HISTORY_CAP + 4));
    }

    #[test]
    fn remove_and_clear() {
        let (store, _dir) = store();
        store.add(entry("a"));
        store.add(entry("b"));
        store.remove("a");
        assert_eq!(store.len(), 1);
        store.clear();
        assert!(store.is_empty());
    }

    #[test]
    fn persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        {
            let store = HistoryStore::open(HistoryFile::new(path.clone()));
            store.add(entry("a"));
        }
        let reopened = HistoryStore::open(HistoryFile::new(path));
        assert_eq!(reopened.entries()[0].url, "a");
    }

    #[test]
    fn replace_all_dedupes_and_caps() {
        let (store, _dir) = store();
        let mut list: Vec<_> = (0..(HISTORY_CAP + 10)).map(|i| entry(&format!("u{i}"))).collect();
        list.push(entry("u0"));
        store.replace_all(list);
        assert_eq!(store.len(), HISTORY_CAP);
        assert_eq!(store.entries()[0].url, "u0");
    }
}
