//! Boundary between the provider and an in-process inference engine.
//!
//! The provider only talks to engines through [`InferenceBackend`] (device
//! and model construction) and [`EngineHandle`] (one loaded model).

#[cfg(feature = "llama")]
mod llama;

#[cfg(feature = "llama")]
pub use llama::{LlamaCppBackend, LlamaOptions};

use crate::error::ProviderError;
use anyhow::Result;
use serde_json::Value;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Kind of compute device a model can be placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeviceKind {
    #[default]
    Cpu,
    Metal,
    Cuda,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Metal => "metal",
            Self::Cuda => "cuda",
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device handle produced by an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Cpu,
    Metal(usize),
    Cuda(usize),
}

impl Device {
    pub fn kind(&self) -> DeviceKind {
        match self {
            Self::Cpu => DeviceKind::Cpu,
            Self::Metal(_) => DeviceKind::Metal,
            Self::Cuda(_) => DeviceKind::Cuda,
        }
    }
}

/// An inference engine library: constructs devices and loads models.
pub trait InferenceBackend: Send + Sync {
    /// Human-readable engine name used in diagnostics
    fn name(&self) -> &str;

    /// Whether the engine library is present in this build
    fn is_available(&self) -> bool;

    /// Install guidance shown when the engine is missing
    fn install_hint(&self) -> String {
        format!(
            "Rebuild wick with the `llama` feature (cargo build --features llama) to enable {}.",
            self.name()
        )
    }

    fn device(&self, kind: DeviceKind) -> Result<Device>;

    fn from_pretrained(&self, model_id: &str, device: &Device) -> Result<Arc<dyn EngineHandle>>;
}

/// A loaded model.
pub trait EngineHandle: Send + Sync {
    /// Name the engine reports for the loaded model
    fn model_name(&self) -> &str;

    fn generate(&self, prompt: &str, config: &GenerationConfig) -> Result<String>;

    /// Generate token by token, calling `on_token` before the next token is
    /// produced. Returns the engine's own view of the full text.
    fn generate_stream(
        &self,
        prompt: &str,
        config: &GenerationConfig,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<String>;

    fn constraint_from_schema(&self, schema: &Value) -> Result<DecodingConstraint>;

    fn constraint_from_regex(&self, pattern: &str) -> Result<DecodingConstraint>;

    fn generate_structured(&self, prompt: &str, schema: &Value) -> Result<StructuredOutput>;

    fn generate_regex(&self, prompt: &str, pattern: &str) -> Result<String>;
}

/// What a decoding constraint was compiled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    JsonSchema,
    Regex,
}

/// Engine-compiled constraint restricting which tokens may be generated.
///
/// Tied to the model it was compiled for; it is deliberately not `Clone`.
#[derive(Debug)]
pub struct DecodingConstraint {
    kind: ConstraintKind,
    model: String,
    grammar: String,
}

impl DecodingConstraint {
    pub fn new(kind: ConstraintKind, model: impl Into<String>, grammar: impl Into<String>) -> Self {
        Self {
            kind,
            model: model.into(),
            grammar: grammar.into(),
        }
    }

    pub fn kind(&self) -> ConstraintKind {
        self.kind
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn grammar(&self) -> &str {
        &self.grammar
    }

    /// Fail unless this constraint was compiled for `model_name`.
    pub fn ensure_compiled_for(&self, model_name: &str) -> Result<()> {
        if self.model != model_name {
            anyhow::bail!(
                "Decoding constraint was compiled for '{}' and cannot be used with '{}'",
                self.model,
                model_name
            );
        }
        Ok(())
    }
}

/// Options an engine generates with.
#[derive(Debug)]
pub enum GenerationConfig {
    /// The engine's own balanced sampling profile
    Balanced,
    Explicit(GenerationOptions),
}

#[derive(Debug, Default)]
pub struct GenerationOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub constraint: Option<DecodingConstraint>,
}

impl GenerationConfig {
    /// Explicit config carrying only `constraint`.
    pub fn constrained(constraint: DecodingConstraint) -> Self {
        Self::Explicit(GenerationOptions {
            constraint: Some(constraint),
            ..Default::default()
        })
    }

    pub fn constraint(&self) -> Option<&DecodingConstraint> {
        match self {
            Self::Balanced => None,
            Self::Explicit(options) => options.constraint.as_ref(),
        }
    }
}

/// Result of schema-constrained generation.
#[derive(Debug, Clone, PartialEq)]
pub enum StructuredOutput {
    Json(Value),
    Text(String),
}

impl StructuredOutput {
    /// Message content for this output: JSON values are serialized, text is kept verbatim.
    pub fn into_content(self) -> Result<String> {
        match self {
            Self::Json(value) => Ok(serde_json::to_string(&value)?),
            Self::Text(text) => Ok(text),
        }
    }
}

/// Availability of the engine library, probed once when a provider is built.
#[derive(Debug, Clone)]
pub struct Availability {
    available: bool,
    dependency: String,
    guidance: String,
}

impl Availability {
    pub fn probe(backend: &dyn InferenceBackend) -> Self {
        Self {
            available: backend.is_available(),
            dependency: backend.name().to_string(),
            guidance: backend.install_hint(),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Fail with a configuration error when the engine is missing.
    pub fn ensure(&self) -> Result<()> {
        if self.available {
            return Ok(());
        }
        Err(ProviderError::Configuration {
            dependency: self.dependency.clone(),
            guidance: self.guidance.clone(),
        }
        .into())
    }
}

/// Stand-in backend for builds without an inference engine.
#[derive(Debug, Clone)]
pub struct MissingBackend {
    dependency: String,
}

impl MissingBackend {
    pub fn new(dependency: impl Into<String>) -> Self {
        Self {
            dependency: dependency.into(),
        }
    }

    fn missing(&self) -> anyhow::Error {
        ProviderError::Configuration {
            dependency: self.dependency.clone(),
            guidance: self.install_hint(),
        }
        .into()
    }
}

impl InferenceBackend for MissingBackend {
    fn name(&self) -> &str {
        &self.dependency
    }

    fn is_available(&self) -> bool {
        false
    }

    fn device(&self, _kind: DeviceKind) -> Result<Device> {
        Err(self.missing())
    }

    fn from_pretrained(&self, _model_id: &str, _device: &Device) -> Result<Arc<dyn EngineHandle>> {
        Err(self.missing())
    }
}

/// Settings for the engine compiled into this build.
#[derive(Debug, Clone, Default)]
pub struct BackendOptions {
    /// Directory searched for model files
    pub model_dir: Option<PathBuf>,
    pub max_tokens: Option<u32>,
    pub context_length: Option<u32>,
    pub threads: Option<u32>,
}

/// The engine compiled into this build, or [`MissingBackend`] when there is none.
#[cfg(feature = "llama")]
pub fn default_backend(options: BackendOptions) -> Arc<dyn InferenceBackend> {
    Arc::new(LlamaCppBackend::new(LlamaOptions::from(options)))
}

/// The engine compiled into this build, or [`MissingBackend`] when there is none.
#[cfg(not(feature = "llama"))]
pub fn default_backend(_options: BackendOptions) -> Arc<dyn InferenceBackend> {
    Arc::new(MissingBackend::new("llama.cpp inference engine"))
}
