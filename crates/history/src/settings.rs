//! LoRA discovery and per-adapter settings.

use std::collections::BTreeMap;
use std::sync::RwLock;

use fluxdeck_comfyui::{ComfyUIApi, ComfyUIApiError};
use fluxdeck_core::types::{LoraConfig, LoraSetting};

use crate::local::SettingsFile;

/// Registry of backend-discovered LoRAs and their persisted settings.
///
/// The backend's adapter list is the source of truth for which names
/// exist; settings for names the backend no longer reports are dropped
/// on refresh. Newly discovered adapters start disabled with default
/// strengths. Chain order is name order, which keeps graph construction
/// deterministic across refreshes.
pub struct LoraRegistry {
    settings: RwLock<BTreeMap<String, LoraSetting>>,
    file: SettingsFile,
}

impl LoraRegistry {
    /// Open the registry, seeding from the durable record.
    pub fn open(file: SettingsFile) -> Self {
        let seeded = file.load();
        Self {
            settings: RwLock::new(seeded),
            file,
        }
    }

    /// Refresh the adapter list from the backend and reconcile settings.
    ///
    /// Persists only when reconciliation actually changed something.
    pub async fn refresh(&self, api: &ComfyUIApi) -> Result<(), ComfyUIApiError> {
        let names = api.list_lora_names().await?;
        let changed = {
            let mut settings = self.settings.write().expect("settings lock poisoned");
            let merged = merge_settings(&settings, &names);
            let changed = merged != *settings;
            *settings = merged;
            changed
        };
        if changed {
            self.persist();
        }
        Ok(())
    }

    /// Update the setting for a known adapter. Unknown names are
    /// ignored with a warning, the backend list decides what exists.
    pub fn set(&self, name: &str, setting: LoraSetting) {
        let known = {
            let mut settings = self.settings.write().expect("settings lock poisoned");
            match settings.get_mut(name) {
                Some(slot) => {
                    *slot = setting;
                    true
                }
                None => false,
            }
        };
        if known {
            self.persist();
        } else {
            tracing::warn!(name, "Ignoring settings update for unknown LoRA");
        }
    }

    /// Snapshot of all adapters and their settings.
    pub fn all(&self) -> BTreeMap<String, LoraSetting> {
        self.settings.read().expect("settings lock poisoned").clone()
    }

    /// Enabled adapters in chain order.
    pub fn enabled_chain(&self) -> Vec<LoraConfig> {
        self.settings
            .read()
            .expect("settings lock poisoned")
            .iter()
            .filter(|(_, s)| s.enabled)
            .map(|(name, setting)| LoraConfig {
                name: name.clone(),
                setting: *setting,
            })
            .collect()
    }

    fn persist(&self) {
        let settings = self.settings.read().expect("settings lock poisoned");
        if let Err(e) = self.file.save(&settings) {
            tracing::warn!(error = %e, "Failed to persist LoRA settings");
        }
    }
}

/// Reconcile persisted settings against the backend's adapter list.
///
/// Keeps existing settings for names the backend still reports, drops
/// the rest, and defaults any newly discovered name.
fn merge_settings(
    existing: &BTreeMap<String, LoraSetting>,
    names: &[String],
) -> BTreeMap<String, LoraSetting> {
    names
        .iter()
        .map(|name| {
            let setting = existing.get(name).copied().unwrap_or_default();
            (name.clone(), setting)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enabled(model: f64, clip: f64) -> LoraSetting {
        LoraSetting {
            enabled: true,
            model_strength: model,
            clip_strength: clip,
        }
    }

    #[test]
    fn merge_keeps_known_drops_stale_defaults_new() {
        let mut existing = BTreeMap::new();
        existing.insert("detail".to_string(), enabled(0.8, 0.7));
        existing.insert("gone".to_string(), enabled(0.3, 0.3));

        let names = vec!["detail".to_string(), "fresh".to_string()];
        let merged = merge_settings(&existing, &names);

        assert_eq!(merged.len(), 2);
        assert_eq!(merged["detail"], enabled(0.8, 0.7));
        assert_eq!(merged["fresh"], LoraSetting::default());
        assert!(!merged["fresh"].enabled);
        assert!(!merged.contains_key("gone"));
    }

    #[test]
    fn enabled_chain_is_name_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let registry = LoraRegistry::open(SettingsFile::new(dir.path().join("s.json")));
        {
            let mut settings = registry.settings.write().unwrap();
            settings.insert("zeta".to_string(), enabled(0.5, 0.5));
            settings.insert("alpha".to_string(), enabled(0.5, 0.5));
            settings.insert("mid".to_string(), LoraSetting::default());
        }
        let chain = registry.enabled_chain();
        let names: Vec<_> = chain.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[test]
    fn set_ignores_unknown_names() {
        let dir = tempfile::tempdir().unwrap();
        let registry = LoraRegistry::open(SettingsFile::new(dir.path().join("s.json")));
        registry.set("ghost", enabled(0.9, 0.9));
        assert!(registry.all().is_empty());
    }

    #[test]
    fn set_updates_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.json");
        {
            let registry = LoraRegistry::open(SettingsFile::new(path.clone()));
            registry
                .settings
                .write()
                .unwrap()
                .insert("detail".to_string(), LoraSetting::default());
            registry.set("detail", enabled(0.6, 0.4));
        }
        let reopened = LoraRegistry::open(SettingsFile::new(path));
        assert_eq!(reopened.all()["detail"], enabled(0.6, 0.4));
    }
}
