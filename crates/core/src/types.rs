//! Shared domain types for generation jobs and their history.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Which workflow backbone a job uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowMode {
    /// Text-to-image generation.
    Create,
    /// Image editing against an uploaded reference image.
    Edit,
}

impl WorkflowMode {
    /// Stable string form used in logs and history records.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Edit => "edit",
        }
    }
}

/// Per-LoRA strength settings.
///
/// Both strengths are bounded in `[0, 1]`. New LoRAs start disabled so
/// that a freshly discovered adapter never silently changes output.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoraSetting {
    pub enabled: bool,
    pub model_strength: f64,
    pub clip_strength: f64,
}

impl Default for LoraSetting {
    fn default() -> Self {
        Self {
            enabled: false,
            model_strength: 0.5,
            clip_strength: 0.45,
        }
    }
}

/// A named LoRA with its settings. Order in [`GenerationParams::loras`]
/// is the order adapters are chained into the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    pub name: String,
    #[serde(flatten)]
    pub setting: LoraSetting,
}

/// Immutable snapshot of everything needed to build a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    pub mode: WorkflowMode,
    pub prompt: String,
    pub steps: u32,
    pub seed: u64,
    pub cfg: f64,
    pub guidance: f64,
    pub width: u32,
    pub height: u32,
    /// LoRAs in configured chain order; disabled entries are skipped.
    #[serde(default)]
    pub loras: Vec<LoraConfig>,
}

/// Default guidance for create-mode jobs.
pub const DEFAULT_CREATE_GUIDANCE: f64 = 3.5;

/// Default guidance for edit-mode jobs.
pub const DEFAULT_EDIT_GUIDANCE: f64 = 2.5;

/// Default sampling step count.
pub const DEFAULT_STEPS: u32 = 20;

/// Default output width in pixels.
pub const DEFAULT_WIDTH: u32 = 1616;

/// Default output height in pixels.
pub const DEFAULT_HEIGHT: u32 = 1088;

impl GenerationParams {
    /// Validate parameter bounds before any graph is built.
    ///
    /// Rejects non-positive dimensions, a zero step count, and LoRA
    /// strengths outside `[0, 1]`.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.width == 0 || self.height == 0 {
            return Err(CoreError::Validation(format!(
                "Output dimensions must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if self.steps < 1 {
            return Err(CoreError::Validation(
                "Step count must be at least 1".to_string(),
            ));
        }
        for lora in &self.loras {
            let LoraSetting {
                model_strength,
                clip_strength,
                ..
            } = lora.setting;
            if !(0.0..=1.0).contains(&model_strength) || !(0.0..=1.0).contains(&clip_strength) {
                return Err(CoreError::Validation(format!(
                    "LoRA '{}' strengths must be in [0, 1], got {model_strength}/{clip_strength}",
                    lora.name
                )));
            }
        }
        Ok(())
    }

    /// LoRAs that are enabled, in chain order.
    pub fn enabled_loras(&self) -> impl Iterator<Item = &LoraConfig> {
        self.loras.iter().filter(|l| l.setting.enabled)
    }
}

/// One completed job in the result history.
///
/// Entries are uniquely keyed by `url` (the display locator).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Canonical `/view` URL for the output image.
    pub url: String,
    pub timestamp: Timestamp,
    pub prompt: String,
    pub seed: u64,
    pub steps: u32,
    pub guidance: f64,
    pub mode: WorkflowMode,
    /// Output filename as reported by the backend.
    pub filename: String,
    pub width: u32,
    pub height: u32,
    /// LoRA settings active at generation time (create mode only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora_settings: Option<BTreeMap<String, LoraSetting>>,
    /// The edit instruction (edit mode only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_prompt: Option<String>,
}
