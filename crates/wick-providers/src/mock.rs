#![allow(dead_code)]
//! Mock inference engine for testing
//!
//! Provides a scriptable [`InferenceBackend`] so the embedded provider can be
//! exercised without model weights. It records every device request, load,
//! prompt and generation config it sees.
//!
//! # Example
//!
//! ```rust,ignore
//! use wick_providers::mock::MockBackend;
//!
//! // Stream three tokens for every model
//! let backend = MockBackend::new().with_tokens(vec!["Hel", "lo", "!"]);
//!
//! // Engine reports a different name than the requested id
//! let backend = MockBackend::new().with_alias("tiny", "TinyLlama/TinyLlama-1.1B-Chat-v1.0");
//!
//! // Pretend the engine library is not installed
//! let backend = MockBackend::unavailable();
//! ```

use crate::engine::{
    ConstraintKind, DecodingConstraint, Device, DeviceKind, EngineHandle, GenerationConfig,
    InferenceBackend, StructuredOutput,
};
use crate::grammar;
use anyhow::Result;
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Errors raised by the mock engine, so tests can check they arrive unchanged
#[derive(Debug, thiserror::Error)]
pub enum MockEngineError {
    #[error("Model '{0}' not found")]
    ModelNotFound(String),
    #[error("Generation interrupted after {0} tokens")]
    StreamInterrupted(usize),
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),
    #[error("Invalid regex: {0}")]
    InvalidRegex(String),
}

/// What a generation call was configured with
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedConfig {
    Balanced,
    Explicit {
        temperature: Option<f32>,
        max_tokens: Option<u32>,
        constraint: Option<ConstraintKind>,
    },
}

impl From<&GenerationConfig> for RecordedConfig {
    fn from(config: &GenerationConfig) -> Self {
        match config {
            GenerationConfig::Balanced => Self::Balanced,
            GenerationConfig::Explicit(options) => Self::Explicit {
                temperature: options.temperature,
                max_tokens: options.max_tokens,
                constraint: options.constraint.as_ref().map(|c| c.kind()),
            },
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    loads: usize,
    devices: Vec<DeviceKind>,
    prompts: Vec<String>,
    configs: Vec<RecordedConfig>,
    panicked_loads: HashSet<String>,
}

#[derive(Debug, Clone)]
struct Script {
    tokens: Vec<String>,
    engine_text: Option<String>,
    fail_stream_after: Option<usize>,
    panic_stream_after: Option<usize>,
    regex_output: Option<String>,
    structured_output: Option<StructuredOutput>,
}

/// A scripted engine library
#[derive(Debug)]
pub struct MockBackend {
    available: bool,
    script: Script,
    aliases: HashMap<String, String>,
    failing_models: HashSet<String>,
    panicking_models: HashSet<String>,
    load_delay: Option<Duration>,
    state: Arc<Mutex<MockState>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            available: true,
            script: Script {
                tokens: vec!["Hello".to_string(), ",".to_string(), " world".to_string()],
                engine_text: None,
                fail_stream_after: None,
                panic_stream_after: None,
                regex_output: None,
                structured_output: None,
            },
            aliases: HashMap::new(),
            failing_models: HashSet::new(),
            panicking_models: HashSet::new(),
            load_delay: None,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// A backend whose engine library is missing
    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::new()
        }
    }

    /// Tokens produced by every generation call
    pub fn with_tokens(mut self, tokens: Vec<&str>) -> Self {
        self.script.tokens = tokens.into_iter().map(String::from).collect();
        self
    }

    /// Text `generate_stream` returns after streaming, instead of the token concatenation
    pub fn with_engine_text(mut self, text: &str) -> Self {
        self.script.engine_text = Some(text.to_string());
        self
    }

    /// Make loads of `requested` report `reported` as their model name
    pub fn with_alias(mut self, requested: &str, reported: &str) -> Self {
        self.aliases.insert(requested.to_string(), reported.to_string());
        self
    }

    /// Loading `model_id` fails with [`MockEngineError::ModelNotFound`]
    pub fn failing_load(mut self, model_id: &str) -> Self {
        self.failing_models.insert(model_id.to_string());
        self
    }

    /// The first load of `model_id` panics; later loads succeed
    pub fn panicking_load(mut self, model_id: &str) -> Self {
        self.panicking_models.insert(model_id.to_string());
        self
    }

    /// Streaming panics after `count` tokens were delivered
    pub fn panicking_stream_after(mut self, count: usize) -> Self {
        self.script.panic_stream_after = Some(count);
        self
    }

    /// Streaming fails after `count` tokens were delivered
    pub fn failing_stream_after(mut self, count: usize) -> Self {
        self.script.fail_stream_after = Some(count);
        self
    }

    pub fn with_regex_output(mut self, text: &str) -> Self {
        self.script.regex_output = Some(text.to_string());
        self
    }

    pub fn with_structured_output(mut self, output: StructuredOutput) -> Self {
        self.script.structured_output = Some(output);
        self
    }

    /// Sleep during each load, to widen race windows in tests
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        lock_state(&self.state)
    }

    /// Number of `from_pretrained` calls, failed ones included
    pub fn load_count(&self) -> usize {
        self.state().loads
    }

    pub fn device_requests(&self) -> Vec<DeviceKind> {
        self.state().devices.clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.state().prompts.clone()
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.state().prompts.last().cloned()
    }

    pub fn configs(&self) -> Vec<RecordedConfig> {
        self.state().configs.clone()
    }

    pub fn last_config(&self) -> Option<RecordedConfig> {
        self.state().configs.last().cloned()
    }
}

fn lock_state(state: &Mutex<MockState>) -> MutexGuard<'_, MockState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl InferenceBackend for MockBackend {
    fn name(&self) -> &str {
        "mock engine"
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn device(&self, kind: DeviceKind) -> Result<Device> {
        self.state().devices.push(kind);
        Ok(match kind {
            DeviceKind::Cpu => Device::Cpu,
            DeviceKind::Metal => Device::Metal(0),
            DeviceKind::Cuda => Device::Cuda(0),
        })
    }

    fn from_pretrained(&self, model_id: &str, _device: &Device) -> Result<Arc<dyn EngineHandle>> {
        self.state().loads += 1;
        if let Some(delay) = self.load_delay {
            std::thread::sleep(delay);
        }
        if self.failing_models.contains(model_id) {
            return Err(MockEngineError::ModelNotFound(model_id.to_string()).into());
        }
        if self.panicking_models.contains(model_id)
            && self.state().panicked_loads.insert(model_id.to_string())
        {
            panic!("mock engine crashed loading '{}'", model_id);
        }

        let name = self
            .aliases
            .get(model_id)
            .cloned()
            .unwrap_or_else(|| model_id.to_string());
        Ok(Arc::new(MockEngine {
            name,
            script: self.script.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

/// A loaded mock model
#[derive(Debug)]
pub struct MockEngine {
    name: String,
    script: Script,
    state: Arc<Mutex<MockState>>,
}

impl MockEngine {
    fn record(&self, prompt: &str, config: Option<&GenerationConfig>) {
        let mut state = lock_state(&self.state);
        state.prompts.push(prompt.to_string());
        if let Some(config) = config {
            state.configs.push(RecordedConfig::from(config));
        }
    }

    fn full_text(&self) -> String {
        self.script.tokens.concat()
    }
}

impl EngineHandle for MockEngine {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn generate(&self, prompt: &str, config: &GenerationConfig) -> Result<String> {
        self.record(prompt, Some(config));
        if let Some(constraint) = config.constraint() {
            constraint.ensure_compiled_for(&self.name)?;
        }
        Ok(self.full_text())
    }

    fn generate_stream(
        &self,
        prompt: &str,
        config: &GenerationConfig,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<String> {
        self.record(prompt, Some(config));
        if let Some(constraint) = config.constraint() {
            constraint.ensure_compiled_for(&self.name)?;
        }
        for (i, token) in self.script.tokens.iter().enumerate() {
            if self.script.fail_stream_after == Some(i) {
                return Err(MockEngineError::StreamInterrupted(i).into());
            }
            if self.script.panic_stream_after == Some(i) {
                panic!("mock engine crashed after {} tokens", i);
            }
            on_token(token);
        }
        Ok(self
            .script
            .engine_text
            .clone()
            .unwrap_or_else(|| self.full_text()))
    }

    fn constraint_from_schema(&self, schema: &Value) -> Result<DecodingConstraint> {
        let gbnf = grammar::schema_to_gbnf(schema)
            .map_err(|e| MockEngineError::InvalidSchema(e.to_string()))?;
        Ok(DecodingConstraint::new(ConstraintKind::JsonSchema, &self.name, gbnf))
    }

    fn constraint_from_regex(&self, pattern: &str) -> Result<DecodingConstraint> {
        let gbnf = grammar::regex_to_gbnf(pattern)
            .map_err(|e| MockEngineError::InvalidRegex(e.to_string()))?;
        Ok(DecodingConstraint::new(ConstraintKind::Regex, &self.name, gbnf))
    }

    fn generate_structured(&self, prompt: &str, schema: &Value) -> Result<StructuredOutput> {
        self.record(prompt, None);
        self.constraint_from_schema(schema)?;
        Ok(self
            .script
            .structured_output
            .clone()
            .unwrap_or_else(|| StructuredOutput::Json(example_for_schema(schema))))
    }

    fn generate_regex(&self, prompt: &str, pattern: &str) -> Result<String> {
        self.record(prompt, None);
        self.constraint_from_regex(pattern)?;
        Ok(self
            .script
            .regex_output
            .clone()
            .unwrap_or_else(|| self.full_text()))
    }
}

/// Smallest value satisfying `schema`: first enum value, first union option,
/// every declared property.
pub fn example_for_schema(schema: &Value) -> Value {
    let Some(obj) = schema.as_object() else {
        return Value::Null;
    };
    if let Some(value) = obj.get("const") {
        return value.clone();
    }
    if let Some(first) = obj.get("enum").and_then(Value::as_array).and_then(|v| v.first()) {
        return first.clone();
    }
    for keyword in ["anyOf", "oneOf"] {
        if let Some(first) = obj.get(keyword).and_then(Value::as_array).and_then(|v| v.first()) {
            return example_for_schema(first);
        }
    }

    let ty = match obj.get("type") {
        Some(Value::String(ty)) => ty.as_str(),
        Some(Value::Array(types)) => types.first().and_then(Value::as_str).unwrap_or("null"),
        _ if obj.contains_key("properties") => "object",
        _ => "null",
    };
    match ty {
        "string" => json!("example"),
        "integer" => json!(0),
        "number" => json!(0.0),
        "boolean" => json!(false),
        "array" => match obj.get("items") {
            Some(items) => json!([example_for_schema(items)]),
            None => json!([]),
        },
        "object" => {
            let mut out = Map::new();
            if let Some(properties) = obj.get("properties").and_then(Value::as_object) {
                for (key, prop) in properties {
                    out.insert(key.clone(), example_for_schema(prop));
                }
            }
            Value::Object(out)
        }
        _ => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_example_for_schema() {
        let schema = json!({
            "type": "object",
            "properties": {
                "mood": {"type": "string", "enum": ["happy", "sad"]},
                "score": {"type": "integer"},
                "tags": {"type": "array", "items": {"type": "string"}}
            }
        });
        assert_eq!(
            example_for_schema(&schema),
            json!({"mood": "happy", "score": 0, "tags": ["example"]})
        );
    }

    #[test]
    fn test_stream_failure_after_tokens() {
        let backend = MockBackend::new()
            .with_tokens(vec!["a", "b", "c"])
            .failing_stream_after(2);
        let engine = backend.from_pretrained("m", &Device::Cpu).unwrap();

        let mut seen = Vec::new();
        let result = engine.generate_stream("p", &GenerationConfig::Balanced, &mut |t: &str| {
            seen.push(t.to_string())
        });
        assert!(result.is_err());
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[test]
    fn test_foreign_constraint_is_rejected() {
        let backend = MockBackend::new();
        let a = backend.from_pretrained("model-a", &Device::Cpu).unwrap();
        let b = backend.from_pretrained("model-b", &Device::Cpu).unwrap();

        let constraint = a.constraint_from_regex("[a-z]+").unwrap();
        let config = GenerationConfig::Explicit(crate::engine::GenerationOptions {
            constraint: Some(constraint),
            ..Default::default()
        });
        assert!(a.generate("p", &config).is_ok());
        assert!(b.generate("p", &config).is_err());
    }
}
