//! Dependencies referenced by a ComfyUI workflow export
//!
//! Only the UI export format (a top-level `nodes` array) is understood.
//! Model files are recognized by extension among each node's
//! `widgets_values`; custom node packs by the `cnr_id`/`aux_id` node
//! properties newer ComfyUI versions record.

use crate::error::{ProvisionError, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

const MODEL_EXTENSIONS: &[&str] = &[".safetensors", ".ckpt", ".pt", ".pth", ".bin", ".onnx"];

/// Node-pack id ComfyUI records for its built-in nodes
const CORE_NODE_PACK: &str = "comfy-core";

/// Substrings of a lowercased node type and the category they load from.
/// More specific keys come first.
const NODE_TYPE_CATEGORIES: &[(&str, &str)] = &[
    ("checkpoint", "checkpoints"),
    ("clipvision", "clip_vision"),
    ("controlnet", "controlnet"),
    ("lora", "loras"),
    ("vae", "vae"),
    ("unet", "unet"),
    ("clip", "clip"),
    ("textualinversion", "embeddings"),
    ("embedding", "embeddings"),
    ("hypernetwork", "hypernetworks"),
    ("upscale", "upscale_models"),
    ("facedetection", "insightface"),
    ("facerestore", "facerestore_models"),
    ("ultralytics", "ultralytics"),
    ("samloader", "sams"),
    ("llm", "LLM"),
];

/// A model file a workflow node loads
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ModelReference {
    pub category: String,
    /// As written in the workflow, possibly with a subdirectory
    pub name: String,
}

/// Everything a workflow needs besides ComfyUI itself
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WorkflowDependencies {
    pub models: BTreeSet<ModelReference>,
    /// Lowercased `cnr_id`/`aux_id` values, core nodes excluded
    pub node_packs: BTreeSet<String>,
}

#[derive(Deserialize)]
struct RawWorkflow {
    nodes: Vec<Value>,
}

#[derive(Deserialize)]
struct RawNode {
    #[serde(default, rename = "type")]
    node_type: Option<String>,
    #[serde(default)]
    properties: Option<Map<String, Value>>,
    #[serde(default)]
    widgets_values: Option<Value>,
}

impl WorkflowDependencies {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&contents).map_err(|e| {
            ProvisionError::Packaging(format!("{} is not valid JSON: {e}", path.display()))
        })?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let workflow = RawWorkflow::deserialize(value).map_err(|e| {
            ProvisionError::Packaging(format!("workflow has no usable nodes array: {e}"))
        })?;

        let mut deps = Self::default();
        for node in &workflow.nodes {
            // Groups, notes and reroutes can carry odd shapes; skip what does not fit
            let Ok(node) = RawNode::deserialize(node) else {
                continue;
            };
            deps.add_node(&node);
        }

        tracing::debug!(
            "Workflow references {} models and {} node packs",
            deps.models.len(),
            deps.node_packs.len()
        );
        Ok(deps)
    }

    fn add_node(&mut self, node: &RawNode) {
        if let Some(props) = &node.properties {
            let id = ["cnr_id", "aux_id"]
                .iter()
                .find_map(|key| props.get(*key).and_then(Value::as_str));
            if let Some(id) = id.map(str::to_lowercase) {
                if !id.is_empty() && id != CORE_NODE_PACK {
                    self.node_packs.insert(id);
                }
            }
        }

        let Some(Value::Array(values)) = &node.widgets_values else {
            return;
        };
        let node_category = node.node_type.as_deref().and_then(category_for_node_type);
        for name in values.iter().filter_map(Value::as_str) {
            if !is_model_file(name) {
                continue;
            }
            let category = node_category.unwrap_or_else(|| category_for_file_name(name));
            self.models.insert(ModelReference {
                category: category.to_string(),
                name: name.to_string(),
            });
        }
    }
}

fn is_model_file(value: &str) -> bool {
    let lower = value.to_lowercase();
    MODEL_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

/// Category a loader node reads its files from, if the type says so
#[must_use]
pub fn category_for_node_type(node_type: &str) -> Option<&'static str> {
    let lower = node_type.to_lowercase();
    NODE_TYPE_CATEGORIES
        .iter()
        .find(|(key, _)| lower.contains(key))
        .map(|(_, category)| *category)
}

/// Best guess from the file name alone; defaults to `checkpoints`
#[must_use]
pub fn category_for_file_name(name: &str) -> &'static str {
    let lower = name.to_lowercase();
    let has = |needle: &str| lower.contains(needle);

    if lower.ends_with(".safetensors") || lower.ends_with(".ckpt") {
        if has("lora") {
            return "loras";
        }
        if has("vae") {
            return "vae";
        }
        if has("embed") {
            return "embeddings";
        }
        if has("controlnet") || has("control_") {
            return "controlnet";
        }
    } else if lower.ends_with(".pt") || lower.ends_with(".pth") {
        if has("sam") {
            return "sams";
        }
        if has("gfpgan") || has("codeformer") || has("face") {
            return "facerestore_models";
        }
        if has("upscale") || has("esrgan") {
            return "upscale_models";
        }
    } else if lower.ends_with(".onnx") && has("inswapper") {
        return "insightface";
    }
    "checkpoints"
}
