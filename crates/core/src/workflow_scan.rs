//! Heuristic parameter recovery from previously submitted graphs.
//!
//! The backend's job ledger stores the originating graph of every job
//! but no purpose-built metadata, so resynchronizing history means
//! scanning nodes for the values we care about. This is best-effort:
//! graphs mixing node types atypically can be misclassified.

use serde_json::Value;

use crate::types::WorkflowMode;
use crate::workflow::{
    CLIP_TEXT_ENCODE_CLASS, EMPTY_LATENT_CLASS, FLUX_GUIDANCE_CLASS, KSAMPLER_CLASS,
    LOAD_IMAGE_CLASS, VAE_ENCODE_CLASS,
};

/// Placeholder step count when a graph carries no sampler.
pub const FALLBACK_STEPS: u32 = 20;

/// Placeholder guidance when a graph carries no guidance node.
pub const FALLBACK_GUIDANCE: f64 = 3.5;

/// Placeholder dimensions when a graph carries no latent initializer.
pub const FALLBACK_DIMENSION: u32 = 1024;

/// Parameters recovered from a submitted workflow graph.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedParams {
    /// Empty when no text-conditioning node with a literal prompt exists.
    pub prompt: String,
    pub seed: u64,
    pub steps: u32,
    pub guidance: f64,
    pub width: u32,
    pub height: u32,
    pub mode: WorkflowMode,
}

impl Default for ScannedParams {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            seed: 0,
            steps: FALLBACK_STEPS,
            guidance: FALLBACK_GUIDANCE,
            width: FALLBACK_DIMENSION,
            height: FALLBACK_DIMENSION,
            mode: WorkflowMode::Create,
        }
    }
}

/// Scan a node-map graph for generation parameters.
///
/// Recovers the prompt from the first text-conditioning node with a
/// literal (non-reference) text input, seed/steps from the sampler,
/// guidance from the guidance node, and dimensions from the latent
/// initializer. Presence of an image-load or image-encode node is
/// treated as evidence of edit mode.
pub fn scan_workflow(graph: &Value) -> ScannedParams {
    let mut scanned = ScannedParams::default();

    let Some(nodes) = graph.as_object() else {
        return scanned;
    };

    for node in nodes.values() {
        let Some(class_type) = node.get("class_type").and_then(Value::as_str) else {
            continue;
        };
        let inputs = node.get("inputs");

        match class_type {
            CLIP_TEXT_ENCODE_CLASS => {
                if scanned.prompt.is_empty() {
                    if let Some(text) = get_input(inputs, "text").and_then(Value::as_str) {
                        scanned.prompt = text.to_string();
                    }
                }
            }
            KSAMPLER_CLASS => {
                if let Some(seed) = get_input(inputs, "seed").and_then(Value::as_u64) {
                    scanned.seed = seed;
                }
                if let Some(steps) = get_input(inputs, "steps").and_then(Value::as_u64) {
                    scanned.steps = steps as u32;
                }
            }
            FLUX_GUIDANCE_CLASS => {
                if let Some(guidance) = get_input(inputs, "guidance").and_then(Value::as_f64) {
                    scanned.guidance = guidance;
                }
            }
            EMPTY_LATENT_CLASS => {
                if let Some(width) = get_input(inputs, "width").and_then(Value::as_u64) {
                    scanned.width = width as u32;
                }
                if let Some(height) = get_input(inputs, "height").and_then(Value::as_u64) {
                    scanned.height = height as u32;
                }
            }
            LOAD_IMAGE_CLASS | VAE_ENCODE_CLASS => {
                scanned.mode = WorkflowMode::Edit;
            }
            _ => {}
        }
    }

    scanned
}

/// Locate the node-map graph inside a ledger entry's `prompt` field.
///
/// The ledger wraps the graph in a positional array alongside the queue
/// number and execution metadata; the graph itself is the first element
/// whose values look like node descriptors.
pub fn extract_graph(prompt_field: &Value) -> Option<&Value> {
    match prompt_field {
        Value::Array(items) => items.iter().find(|item| is_node_map(item)),
        other if is_node_map(other) => Some(other),
        _ => None,
    }
}

fn is_node_map(value: &Value) -> bool {
    value
        .as_object()
        .is_some_and(|obj| !obj.is_empty() && obj.values().any(|n| n.get("class_type").is_some()))
}

fn get_input<'a>(inputs: Option<&'a Value>, name: &str) -> Option<&'a Value> {
    inputs?.get(name)
}
