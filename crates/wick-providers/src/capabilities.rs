//! Capability lookup by model id.
//!
//! Everything here is derived from case-insensitive substring matching on the
//! id. Order matters: more specific patterns are checked first.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const DEFAULT_CONTEXT_WINDOW: u32 = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    pub context_window: u32,
    pub supports_vision: bool,
    pub supports_functions: bool,
    pub supports_structured_output: bool,
    pub supports_streaming: bool,
    pub model_family: String,
}

/// Describe a model. Structured output and function-style output are
/// reported for every id; nothing is negotiated at runtime.
pub fn describe(model_id: &str) -> ModelCapabilities {
    ModelCapabilities {
        context_window: context_window(model_id),
        supports_vision: false,
        supports_functions: true,
        supports_structured_output: true,
        supports_streaming: true,
        model_family: model_family(model_id).to_string(),
    }
}

pub fn context_window(model_id: &str) -> u32 {
    let id = model_id.to_lowercase();

    if id.contains("mistral") {
        if id.contains("v0.3") || id.contains("v0.2") {
            return 32768;
        }
        return 8192;
    }
    if id.contains("tinyllama") {
        return 2048;
    }
    if id.contains("llama-3.1") || id.contains("llama-3.2") || id.contains("llama-3.3") {
        return 131072;
    }
    if id.contains("llama-3") || id.contains("llama3") {
        return 8192;
    }
    if id.contains("llama") {
        return 4096;
    }
    if id.contains("gemma-3") {
        return 131072;
    }
    if id.contains("gemma") {
        return 8192;
    }
    if id.contains("qwen") {
        return 32768;
    }
    if id.contains("phi-3") || id.contains("phi3") {
        if id.contains("128k") {
            return 131072;
        }
        return 4096;
    }
    if id.contains("phi") {
        return 2048;
    }
    DEFAULT_CONTEXT_WINDOW
}

pub fn model_family(model_id: &str) -> &'static str {
    let id = model_id.to_lowercase();
    if id.contains("mistral") {
        "mistral"
    } else if id.contains("llama") {
        "llama"
    } else if id.contains("gemma") {
        "gemma"
    } else if id.contains("qwen") {
        "qwen"
    } else if id.contains("phi") {
        "phi"
    } else {
        "unknown"
    }
}

/// True for chat/instruction-tuned ids ("chat", "instruct", or an "-it" segment).
pub fn is_chat_model(model_id: &str) -> bool {
    let id = model_id.to_lowercase();
    id.contains("chat")
        || id.contains("instruct")
        || id
            .split(|c: char| c == '-' || c == '/' || c == '_')
            .any(|segment| segment == "it")
}

pub fn is_quantized(model_id: &str) -> bool {
    let id = model_id.to_lowercase();
    id.contains("gguf") || id.contains("q4_") || id.contains("q8_")
}

/// Capability tags for the model catalog
pub fn capability_set(model_id: &str) -> BTreeSet<String> {
    let mut caps: BTreeSet<String> = ["streaming", "structured_output", "function_calling"]
        .into_iter()
        .map(String::from)
        .collect();
    if is_chat_model(model_id) {
        caps.insert("chat".to_string());
    }
    if is_quantized(model_id) {
        caps.insert("quantized".to_string());
    }
    caps
}
