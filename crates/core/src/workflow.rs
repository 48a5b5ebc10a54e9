//! Workflow graph construction for create and edit jobs.
//!
//! Builds the node-graph JSON the backend executes. Both builders are
//! pure: the same parameters always produce the same graph. The create
//! backbone optionally threads a LoRA adapter chain between the base
//! loaders and the sampler/conditioning nodes; the edit backbone loads
//! an uploaded reference image and runs single-sided conditioning.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::CoreError;
use crate::types::GenerationParams;

// ---------------------------------------------------------------------------
// Node class types
// ---------------------------------------------------------------------------

/// CLIP text conditioning node.
pub const CLIP_TEXT_ENCODE_CLASS: &str = "CLIPTextEncode";

/// Sampler node carrying seed/steps/cfg.
pub const KSAMPLER_CLASS: &str = "KSampler";

/// Guidance-scale node.
pub const FLUX_GUIDANCE_CLASS: &str = "FluxGuidance";

/// Latent-space initializer sized to the output dimensions.
pub const EMPTY_LATENT_CLASS: &str = "EmptySD3LatentImage";

/// LoRA adapter node producing a new (model, clip) pair.
pub const LORA_LOADER_CLASS: &str = "LoraLoader";

/// Reference-image loader (edit mode).
pub const LOAD_IMAGE_CLASS: &str = "LoadImage";

/// Pixel-space to latent-space encoder (edit mode).
pub const VAE_ENCODE_CLASS: &str = "VAEEncode";

/// Terminal output-writer node.
pub const SAVE_IMAGE_CLASS: &str = "SaveImage";

// ---------------------------------------------------------------------------
// Fixed node ids (stable across sessions so history scans can match them)
// ---------------------------------------------------------------------------

const POSITIVE_PROMPT_ID: &str = "6";
const DECODE_ID: &str = "8";
const SAVE_ID: &str = "9";
const LATENT_ID: &str = "27";
const SAMPLER_ID: &str = "31";
const NEGATIVE_PROMPT_ID: &str = "33";
const GUIDANCE_ID: &str = "35";
const UNET_LOADER_ID: &str = "38";
const CLIP_LOADER_ID: &str = "39";
const VAE_LOADER_ID: &str = "40";

/// First node id used for the LoRA chain.
const LORA_CHAIN_BASE_ID: u32 = 41;

// Edit-backbone ids (the edit graph uses a partially different layout).
const EDIT_UNET_LOADER_ID: &str = "37";
const EDIT_CLIP_LOADER_ID: &str = "38";
const EDIT_VAE_LOADER_ID: &str = "39";
const EDIT_SCALE_ID: &str = "42";
const EDIT_ENCODE_ID: &str = "124";
const EDIT_ZERO_OUT_ID: &str = "135";
const EDIT_LOAD_IMAGE_ID: &str = "142";
const EDIT_STITCH_ID: &str = "146";
const EDIT_REFERENCE_ID: &str = "177";

// ---------------------------------------------------------------------------
// Model files (domain defaults, not user-tunable)
// ---------------------------------------------------------------------------

const CREATE_UNET: &str = "flux1-krea-dev-Q6_K.gguf";
const EDIT_UNET: &str = "flux1-kontext-dev-Q6_K.gguf";
const VAE_NAME: &str = "ae.safetensors";

/// Output filename prefix for create-mode jobs.
pub const CREATE_OUTPUT_PREFIX: &str = "generated/create";

/// Output filename prefix for edit-mode jobs.
pub const EDIT_OUTPUT_PREFIX: &str = "generated/edit";

// ---------------------------------------------------------------------------
// Graph shape
// ---------------------------------------------------------------------------

/// One node of a workflow graph, in the wire shape the backend accepts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// Named inputs: literals or `[node_id, output_slot]` references.
    pub inputs: serde_json::Map<String, Value>,
    pub class_type: String,
    #[serde(rename = "_meta")]
    pub meta: NodeMeta,
}

/// Display metadata attached to each node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeMeta {
    pub title: String,
}

/// A complete workflow: node id -> node descriptor.
pub type Workflow = BTreeMap<String, WorkflowNode>;

/// Reference to another node's output slot.
fn link(node_id: &str, slot: u32) -> Value {
    json!([node_id, slot])
}

fn node(class_type: &str, title: &str, inputs: Value) -> WorkflowNode {
    let inputs = match inputs {
        Value::Object(map) => map,
        other => {
            // All call sites pass a json!({...}) object literal.
            debug_assert!(false, "node inputs must be an object, got {other}");
            serde_json::Map::new()
        }
    };
    WorkflowNode {
        inputs,
        class_type: class_type.to_string(),
        meta: NodeMeta {
            title: title.to_string(),
        },
    }
}

// ---------------------------------------------------------------------------
// Create mode
// ---------------------------------------------------------------------------

/// Build the create-mode workflow graph.
///
/// The backbone wires text conditioning, a latent initializer sized to
/// the requested dimensions, the sampler, decoder, and output writer to
/// the base model/CLIP/VAE loaders. Enabled LoRAs are chained in
/// configured order, each consuming the previous link's (model, clip)
/// pair; when at least one is enabled, the sampler and both
/// conditioning nodes are rewired to the final link of the chain.
pub fn build_create_workflow(params: &GenerationParams) -> Result<Workflow, CoreError> {
    params.validate()?;

    let mut workflow = Workflow::new();

    workflow.insert(
        POSITIVE_PROMPT_ID.to_string(),
        node(
            CLIP_TEXT_ENCODE_CLASS,
            "CLIP Text Encode (Positive Prompt)",
            json!({
                "text": params.prompt,
                "clip": link(CLIP_LOADER_ID, 0),
            }),
        ),
    );
    workflow.insert(
        NEGATIVE_PROMPT_ID.to_string(),
        node(
            CLIP_TEXT_ENCODE_CLASS,
            "CLIP Text Encode (Negative Prompt)",
            json!({
                "text": "",
                "clip": link(CLIP_LOADER_ID, 0),
            }),
        ),
    );
    workflow.insert(
        LATENT_ID.to_string(),
        node(
            EMPTY_LATENT_CLASS,
            "EmptySD3LatentImage",
            json!({
                "width": params.width,
                "height": params.height,
                "batch_size": 1,
            }),
        ),
    );
    workflow.insert(
        SAMPLER_ID.to_string(),
        node(
            KSAMPLER_CLASS,
            "KSampler",
            json!({
                "seed": params.seed,
                "steps": params.steps,
                "cfg": params.cfg,
                "sampler_name": "heun",
                "scheduler": "simple",
                "denoise": 1,
                "model": link(UNET_LOADER_ID, 0),
                "positive": link(GUIDANCE_ID, 0),
                "negative": link(NEGATIVE_PROMPT_ID, 0),
                "latent_image": link(LATENT_ID, 0),
            }),
        ),
    );
    workflow.insert(
        GUIDANCE_ID.to_string(),
        node(
            FLUX_GUIDANCE_CLASS,
            "FluxGuidance",
            json!({
                "guidance": params.guidance,
                "conditioning": link(POSITIVE_PROMPT_ID, 0),
            }),
        ),
    );
    workflow.insert(
        DECODE_ID.to_string(),
        node(
            "VAEDecode",
            "VAE Decode",
            json!({
                "samples": link(SAMPLER_ID, 0),
                "vae": link(VAE_LOADER_ID, 0),
            }),
        ),
    );
    workflow.insert(
        SAVE_ID.to_string(),
        node(
            SAVE_IMAGE_CLASS,
            "Save Image",
            json!({
                "filename_prefix": CREATE_OUTPUT_PREFIX,
                "images": link(DECODE_ID, 0),
            }),
        ),
    );
    workflow.insert(
        UNET_LOADER_ID.to_string(),
        node(
            "UnetLoaderGGUF",
            "Unet Loader (GGUF)",
            json!({ "unet_name": CREATE_UNET }),
        ),
    );
    workflow.insert(
        CLIP_LOADER_ID.to_string(),
        node(
            "DualCLIPLoader",
            "DualCLIPLoader",
            json!({
                "clip_name1": "t5xxl_fp8_e4m3fn.safetensors",
                "clip_name2": "clip_l.safetensors",
                "type": "flux",
                "device": "default",
            }),
        ),
    );
    workflow.insert(
        VAE_LOADER_ID.to_string(),
        node("VAELoader", "Load VAE", json!({ "vae_name": VAE_NAME })),
    );

    // Thread the LoRA chain. Each adapter consumes the previous link's
    // (model, clip) outputs; the base CLIP loader exposes clip at slot 0,
    // LoraLoader exposes it at slot 1.
    let mut current_model = UNET_LOADER_ID.to_string();
    let mut current_clip = CLIP_LOADER_ID.to_string();
    let mut next_id = LORA_CHAIN_BASE_ID;
    let mut chained = 0u32;

    for lora in params.enabled_loras() {
        let clip_slot = if chained == 0 { 0 } else { 1 };
        let id = next_id.to_string();
        workflow.insert(
            id.clone(),
            node(
                LORA_LOADER_CLASS,
                &format!("Load LoRA - {}", lora.name),
                json!({
                    "lora_name": format!("{}.safetensors", lora.name),
                    "strength_model": lora.setting.model_strength,
                    "strength_clip": lora.setting.clip_strength,
                    "model": link(&current_model, 0),
                    "clip": link(&current_clip, clip_slot),
                }),
            ),
        );
        current_model = id.clone();
        current_clip = id;
        next_id += 1;
        chained += 1;
    }

    // Rewire the sampler and both conditioning nodes to the end of the
    // chain. With zero adapters this is a no-op back onto the loaders.
    let clip_slot = if chained > 0 { 1 } else { 0 };
    set_input(&mut workflow, POSITIVE_PROMPT_ID, "clip", link(&current_clip, clip_slot));
    set_input(&mut workflow, NEGATIVE_PROMPT_ID, "clip", link(&current_clip, clip_slot));
    set_input(&mut workflow, SAMPLER_ID, "model", link(&current_model, 0));

    Ok(workflow)
}

// ---------------------------------------------------------------------------
// Edit mode
// ---------------------------------------------------------------------------

/// Build the edit-mode workflow graph.
///
/// `source_image` is the server-side name returned by the image upload.
/// The reference image is stitched into the conditioning pipeline via a
/// latent reference; the negative branch is zeroed out (edit workflows
/// use single-sided conditioning), and outputs are tagged with the
/// edit-mode filename prefix.
pub fn build_edit_workflow(
    params: &GenerationParams,
    source_image: &str,
) -> Result<Workflow, CoreError> {
    params.validate()?;
    if source_image.trim().is_empty() {
        return Err(CoreError::Validation(
            "Edit mode requires an uploaded source image".to_string(),
        ));
    }

    let mut workflow = Workflow::new();

    workflow.insert(
        POSITIVE_PROMPT_ID.to_string(),
        node(
            CLIP_TEXT_ENCODE_CLASS,
            "CLIP Text Encode (Positive Prompt)",
            json!({
                "text": params.prompt,
                "clip": link(EDIT_CLIP_LOADER_ID, 0),
            }),
        ),
    );
    workflow.insert(
        DECODE_ID.to_string(),
        node(
            "VAEDecode",
            "VAE Decode",
            json!({
                "samples": link(SAMPLER_ID, 0),
                "vae": link(EDIT_VAE_LOADER_ID, 0),
            }),
        ),
    );
    workflow.insert(
        SAMPLER_ID.to_string(),
        node(
            KSAMPLER_CLASS,
            "KSampler",
            json!({
                "seed": params.seed,
                "steps": params.steps,
                "cfg": 1,
                "sampler_name": "euler",
                "scheduler": "simple",
                "denoise": 1,
                "model": link(EDIT_UNET_LOADER_ID, 0),
                "positive": link(GUIDANCE_ID, 0),
                "negative": link(EDIT_ZERO_OUT_ID, 0),
                "latent_image": link(EDIT_ENCODE_ID, 0),
            }),
        ),
    );
    workflow.insert(
        GUIDANCE_ID.to_string(),
        node(
            FLUX_GUIDANCE_CLASS,
            "FluxGuidance",
            json!({
                "guidance": params.guidance,
                "conditioning": link(EDIT_REFERENCE_ID, 0),
            }),
        ),
    );
    workflow.insert(
        EDIT_UNET_LOADER_ID.to_string(),
        node(
            "UnetLoaderGGUF",
            "Unet Loader (GGUF)",
            json!({ "unet_name": EDIT_UNET }),
        ),
    );
    workflow.insert(
        EDIT_CLIP_LOADER_ID.to_string(),
        node(
            "DualCLIPLoader",
            "DualCLIPLoader",
            json!({
                "clip_name1": "clip_l.safetensors",
                "clip_name2": "t5xxl_fp8_e4m3fn_scaled.safetensors",
                "type": "flux",
                "device": "default",
            }),
        ),
    );
    workflow.insert(
        EDIT_VAE_LOADER_ID.to_string(),
        node("VAELoader", "Load VAE", json!({ "vae_name": VAE_NAME })),
    );
    workflow.insert(
        EDIT_SCALE_ID.to_string(),
        node(
            "FluxKontextImageScale",
            "FluxKontextImageScale",
            json!({ "image": link(EDIT_STITCH_ID, 0) }),
        ),
    );
    workflow.insert(
        EDIT_ENCODE_ID.to_string(),
        node(
            VAE_ENCODE_CLASS,
            "VAE Encode",
            json!({
                "pixels": link(EDIT_SCALE_ID, 0),
                "vae": link(EDIT_VAE_LOADER_ID, 0),
            }),
        ),
    );
    workflow.insert(
        EDIT_ZERO_OUT_ID.to_string(),
        node(
            "ConditioningZeroOut",
            "ConditioningZeroOut",
            json!({ "conditioning": link(POSITIVE_PROMPT_ID, 0) }),
        ),
    );
    workflow.insert(
        EDIT_LOAD_IMAGE_ID.to_string(),
        node(
            LOAD_IMAGE_CLASS,
            "Load Image",
            json!({ "image": source_image }),
        ),
    );
    workflow.insert(
        EDIT_STITCH_ID.to_string(),
        node(
            "ImageStitch",
            "Image Stitch",
            json!({
                "direction": "right",
                "match_image_size": true,
                "spacing_width": 0,
                "spacing_color": "white",
                "image1": link(EDIT_LOAD_IMAGE_ID, 0),
            }),
        ),
    );
    workflow.insert(
        EDIT_REFERENCE_ID.to_string(),
        node(
            "ReferenceLatent",
            "ReferenceLatent",
            json!({
                "conditioning": link(POSITIVE_PROMPT_ID, 0),
                "latent": link(EDIT_ENCODE_ID, 0),
            }),
        ),
    );
    workflow.insert(
        SAVE_ID.to_string(),
        node(
            SAVE_IMAGE_CLASS,
            "Save Image",
            json!({
                "filename_prefix": EDIT_OUTPUT_PREFIX,
                "images": link(DECODE_ID, 0),
            }),
        ),
    );

    Ok(workflow)
}

fn set_input(workflow: &mut Workflow, node_id: &str, input: &str, value: Value) {
    if let Some(n) = workflow.get_mut(node_id) {
        n.inputs.insert(input.to_string(), value);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LoraConfig, LoraSetting, WorkflowMode};

    fn params() -> GenerationParams {
        GenerationParams {
            mode: WorkflowMode::Create,
            prompt: "test".to_string(),
            steps: 20,
            seed: 42,
            cfg: 1.0,
            guidance: 3.5,
            width: 512,
            height: 512,
            loras: Vec::new(),
        }
    }

    fn lora(name: &str, model: f64, clip: f64) -> LoraConfig {
        LoraConfig {
            name: name.to_string(),
            setting: LoraSetting {
                enabled: true,
                model_strength: model,
                clip_strength: clip,
            },
        }
    }

    fn input<'a>(wf: &'a Workflow, node: &str, name: &str) -> &'a Value {
        wf.get(node)
            .unwrap_or_else(|| panic!("missing node {node}"))
            .inputs
            .get(name)
            .unwrap_or_else(|| panic!("missing input {node}.{name}"))
    }

    #[test]
    fn create_without_loras_wires_base_loaders() {
        let wf = build_create_workflow(&params()).unwrap();

        assert_eq!(input(&wf, SAMPLER_ID, "model"), &json!(["38", 0]));
        assert_eq!(input(&wf, POSITIVE_PROMPT_ID, "clip"), &json!(["39", 0]));
        assert_eq!(input(&wf, NEGATIVE_PROMPT_ID, "clip"), &json!(["39", 0]));
    }

    #[test]
    fn create_carries_sampling_settings() {
        let wf = build_create_workflow(&params()).unwrap();

        assert_eq!(input(&wf, SAMPLER_ID, "seed"), &json!(42));
        assert_eq!(input(&wf, SAMPLER_ID, "steps"), &json!(20));
        assert_eq!(input(&wf, LATENT_ID, "width"), &json!(512));
        assert_eq!(input(&wf, LATENT_ID, "height"), &json!(512));
        assert_eq!(input(&wf, GUIDANCE_ID, "guidance"), &json!(3.5));

        // Exactly one latent initializer and one sampler.
        let latents = wf
            .values()
            .filter(|n| n.class_type == EMPTY_LATENT_CLASS)
            .count();
        let samplers = wf.values().filter(|n| n.class_type == KSAMPLER_CLASS).count();
        assert_eq!(latents, 1);
        assert_eq!(samplers, 1);
    }

    #[test]
    fn create_output_writer_tags_create_prefix() {
        let wf = build_create_workflow(&params()).unwrap();
        assert_eq!(
            input(&wf, SAVE_ID, "filename_prefix"),
            &json!(CREATE_OUTPUT_PREFIX)
        );
    }

    #[test]
    fn single_lora_rewires_sampler_and_conditioning() {
        let mut p = params();
        p.loras = vec![lora("detail", 0.5, 0.4)];
        let wf = build_create_workflow(&p).unwrap();

        // Adapter consumes the base loaders.
        assert_eq!(input(&wf, "41", "model"), &json!(["38", 0]));
        assert_eq!(input(&wf, "41", "clip"), &json!(["39", 0]));
        assert_eq!(input(&wf, "41", "lora_name"), &json!("detail.safetensors"));

        // Sampler and conditioning reference the adapter, not the loaders.
        assert_eq!(input(&wf, SAMPLER_ID, "model"), &json!(["41", 0]));
        assert_eq!(input(&wf, POSITIVE_PROMPT_ID, "clip"), &json!(["41", 1]));
        assert_eq!(input(&wf, NEGATIVE_PROMPT_ID, "clip"), &json!(["41", 1]));
    }

    #[test]
    fn two_loras_chain_in_order() {
        let mut p = params();
        p.loras = vec![lora("A", 0.5, 0.4), lora("B", 0.8, 0.8)];
        let wf = build_create_workflow(&p).unwrap();

        // B consumes A's outputs (chain, not fan-out).
        assert_eq!(input(&wf, "42", "model"), &json!(["41", 0]));
        assert_eq!(input(&wf, "42", "clip"), &json!(["41", 1]));
        assert_eq!(input(&wf, "42", "strength_model"), &json!(0.8));

        // Final consumers reference B.
        assert_eq!(input(&wf, SAMPLER_ID, "model"), &json!(["42", 0]));
        assert_eq!(input(&wf, POSITIVE_PROMPT_ID, "clip"), &json!(["42", 1]));
    }

    #[test]
    fn disabled_loras_are_not_chained() {
        let mut p = params();
        p.loras = vec![LoraConfig {
            name: "off".to_string(),
            setting: LoraSetting::default(),
        }];
        let wf = build_create_workflow(&p).unwrap();

        assert!(!wf.contains_key("41"));
        assert_eq!(input(&wf, SAMPLER_ID, "model"), &json!(["38", 0]));
    }

    #[test]
    fn create_rejects_invalid_params() {
        let mut p = params();
        p.steps = 0;
        assert!(build_create_workflow(&p).is_err());

        let mut p = params();
        p.height = 0;
        assert!(build_create_workflow(&p).is_err());
    }

    #[test]
    fn edit_requires_source_image() {
        let mut p = params();
        p.mode = WorkflowMode::Edit;
        assert!(build_edit_workflow(&p, "").is_err());
        assert!(build_edit_workflow(&p, "   ").is_err());
    }

    #[test]
    fn edit_loads_and_stitches_source_image() {
        let mut p = params();
        p.mode = WorkflowMode::Edit;
        p.guidance = 2.5;
        let wf = build_edit_workflow(&p, "upload-123.png").unwrap();

        assert_eq!(input(&wf, EDIT_LOAD_IMAGE_ID, "image"), &json!("upload-123.png"));
        assert_eq!(input(&wf, EDIT_STITCH_ID, "image1"), &json!(["142", 0]));
        assert_eq!(input(&wf, EDIT_ENCODE_ID, "pixels"), &json!(["42", 0]));
    }

    #[test]
    fn edit_zeroes_negative_conditioning() {
        let mut p = params();
        p.mode = WorkflowMode::Edit;
        let wf = build_edit_workflow(&p, "ref.png").unwrap();

        assert_eq!(input(&wf, SAMPLER_ID, "negative"), &json!(["135", 0]));
        assert_eq!(
            wf.get(EDIT_ZERO_OUT_ID).unwrap().class_type,
            "ConditioningZeroOut"
        );
        // Single-sided: there is no separate negative text node.
        let text_nodes = wf
            .values()
            .filter(|n| n.class_type == CLIP_TEXT_ENCODE_CLASS)
            .count();
        assert_eq!(text_nodes, 1);
    }

    #[test]
    fn edit_output_writer_tags_edit_prefix() {
        let mut p = params();
        p.mode = WorkflowMode::Edit;
        let wf = build_edit_workflow(&p, "ref.png").unwrap();
        assert_eq!(
            input(&wf, SAVE_ID, "filename_prefix"),
            &json!(EDIT_OUTPUT_PREFIX)
        );
    }

    #[test]
    fn edit_uses_distinct_sampler_defaults() {
        let mut p = params();
        p.mode = WorkflowMode::Edit;
        let wf = build_edit_workflow(&p, "ref.png").unwrap();

        assert_eq!(input(&wf, SAMPLER_ID, "sampler_name"), &json!("euler"));
        assert_eq!(input(&wf, SAMPLER_ID, "cfg"), &json!(1));
        assert_eq!(
            input(&wf, EDIT_UNET_LOADER_ID, "unet_name"),
            &json!(EDIT_UNET)
        );
    }

    #[test]
    fn builders_are_deterministic() {
        let p = params();
        let a = serde_json::to_string(&build_create_workflow(&p).unwrap()).unwrap();
        let b = serde_json::to_string(&build_create_workflow(&p).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn node_serializes_wire_shape() {
        let wf = build_create_workflow(&params()).unwrap();
        let v = serde_json::to_value(&wf).unwrap();
        let sampler = &v[SAMPLER_ID];
        assert_eq!(sampler["class_type"], "KSampler");
        assert_eq!(sampler["_meta"]["title"], "KSampler");
        assert!(sampler["inputs"].is_object());
    }
}
