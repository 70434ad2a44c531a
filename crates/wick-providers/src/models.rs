//! Fixed catalog of models known to run well in-process.

use crate::capabilities::{capability_set, context_window, model_family};
use crate::embedded::PROVIDER_SLUG;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Modalities {
    pub input: Vec<String>,
    pub output: Vec<String>,
}

impl Modalities {
    fn text_only() -> Self {
        Self {
            input: vec!["text".to_string()],
            output: vec!["text".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    pub provider: String,
    pub family: String,
    pub context_window: u32,
    pub modalities: Modalities,
    pub capabilities: BTreeSet<String>,
}

impl ModelInfo {
    fn from_catalog(id: &str, display_name: &str) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            provider: PROVIDER_SLUG.to_string(),
            family: model_family(id).to_string(),
            context_window: context_window(id),
            modalities: Modalities::text_only(),
            capabilities: capability_set(id),
        }
    }
}

/// Catalog entry standing in for any local GGUF file
pub const GGUF_ENTRY_ID: &str = "gguf";

const CATALOG: &[(&str, &str)] = &[
    ("google/gemma-3-4b-it-qat-q4_0-gguf", "Gemma 3 4B Instruct (Quantized)"),
    ("TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF", "TinyLlama 1.1B Chat (Quantized)"),
    ("TinyLlama/TinyLlama-1.1B-Chat-v1.0", "TinyLlama 1.1B Chat"),
    ("TheBloke/Mistral-7B-Instruct-v0.2-GGUF", "Mistral 7B Instruct v0.2 (Quantized)"),
    ("mistralai/Mistral-7B-Instruct-v0.3", "Mistral 7B Instruct v0.3"),
    ("Qwen/Qwen2.5-1.5B-Instruct-GGUF", "Qwen 2.5 1.5B Instruct (Quantized)"),
    ("microsoft/Phi-3-mini-4k-instruct", "Phi 3 Mini 4K Instruct"),
];

/// The fixed catalog followed by the synthetic GGUF entry.
pub fn list_models() -> Vec<ModelInfo> {
    let mut models: Vec<ModelInfo> = CATALOG
        .iter()
        .map(|(id, name)| ModelInfo::from_catalog(id, name))
        .collect();

    let mut gguf = ModelInfo::from_catalog(GGUF_ENTRY_ID, "GGUF quantized models");
    gguf.capabilities.insert("chat".to_string());
    gguf.capabilities.insert("quantized".to_string());
    models.push(gguf);
    models
}
