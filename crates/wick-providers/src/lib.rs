//! Chat-completion provider abstractions for wick, plus the `red_candle`
//! provider that runs models in-process.

mod error;
mod streaming;

pub mod capabilities;
pub mod embedded;
pub mod engine;
pub mod grammar;
pub mod mock;
pub mod models;

pub use capabilities::ModelCapabilities;
pub use embedded::{EmbeddedProvider, EmbeddedSettings};
pub use error::ProviderError;
pub use models::ModelInfo;
pub use streaming::{
    decode_utf8_streaming, make_text_chunk, ChunkTranslator, ScanStep, StopScanner,
};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Trait implemented by every chat-completion provider, local or remote.
#[async_trait::async_trait]
pub trait LLMProvider: Send + Sync {
    /// Run one completion.
    ///
    /// When `request.stream` is set, each generated chunk is handed to
    /// `on_chunk` (if given) as it is produced. Either way the final message
    /// is returned once generation ends.
    async fn complete(
        &self,
        request: CompletionRequest,
        on_chunk: Option<ChunkCallback>,
    ) -> Result<CompletionResponse>;

    /// Stream a completion as an async sequence of chunks.
    async fn stream(&self, request: CompletionRequest) -> Result<CompletionStream>;

    /// Provider slug, e.g. "red_candle"
    fn name(&self) -> &str;

    /// Endpoint used for single-shot completions (HTTP providers only)
    fn completion_url(&self) -> Result<String>;

    /// Endpoint used for model listing (HTTP providers only)
    fn models_url(&self) -> Result<String>;

    /// Endpoint used for streamed completions (HTTP providers only)
    fn stream_url(&self) -> Result<String>;

    /// Models this provider can serve
    fn list_models(&self) -> Vec<ModelInfo>;

    /// Capability description for a model id
    fn capabilities(&self, model_id: &str) -> ModelCapabilities;
}

/// Callback receiving streamed chunks in emission order.
pub type ChunkCallback = Box<dyn FnMut(CompletionChunk) + Send>;

pub type CompletionStream = tokio_stream::wrappers::ReceiverStream<Result<CompletionChunk>>;

/// Role of a chat message. Parsed case-insensitively, always rendered lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    /// Any role name outside the three above, stored lowercase
    Other(String),
}

impl MessageRole {
    pub fn parse(value: &str) -> Self {
        let lowered = value.trim().to_lowercase();
        match lowered.as_str() {
            "system" => Self::System,
            "user" => Self::User,
            "assistant" => Self::Assistant,
            _ => Self::Other(lowered),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Other(name) => name,
        }
    }
}

impl fmt::Display for MessageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for MessageRole {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<MessageRole> for String {
    fn from(role: MessageRole) -> Self {
        role.as_str().to_string()
    }
}

/// One input message. A message without a role is plain completion text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<MessageRole>,
    #[serde(default)]
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role: Some(role),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    /// A message with no role, rendered as plain prompt text
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            role: None,
            content: content.into(),
        }
    }

    /// Convert a loosely shaped JSON message into a `ChatMessage`.
    ///
    /// Objects contribute their `role` and `content` keys; a missing or
    /// non-string role leaves the message unroled. Bare strings become plain
    /// text and any other value is kept as its JSON text, so content is never
    /// lost.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Object(map) => {
                let role = map.get("role").and_then(Value::as_str).map(MessageRole::parse);
                let content = match map.get("content") {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                };
                Self { role, content }
            }
            Value::String(s) => Self::text(s.clone()),
            other => Self::text(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionRequest {
    pub messages: Vec<ChatMessage>,
    /// Accepted for interface parity; local models get no tool wire format
    pub tools: Option<Vec<Tool>>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Requested model id; `None` selects the configured default
    pub model: Option<String>,
    pub stream: bool,
    /// JSON schema the output must satisfy
    pub schema: Option<Value>,
    /// Host connection handle; local providers never dial out
    pub connection: Option<Value>,
    /// Provider-specific extras, ignored by local providers
    pub params: HashMap<String, Value>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// Final assistant message of a completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub role: MessageRole,
    /// Name reported by the loaded model, which may differ from the requested id
    pub model_id: String,
}

impl CompletionResponse {
    pub fn assistant(content: String, model_id: impl Into<String>) -> Self {
        Self {
            content,
            role: MessageRole::Assistant,
            model_id: model_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChunk {
    pub content: String,
    pub role: MessageRole,
    /// Local engines never report one
    pub finish_reason: Option<String>,
    pub model_id: String,
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool: String,
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Provider registry for routing requests across several providers
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn LLMProvider>>,
    default_provider: String,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: String::new(),
        }
    }

    pub fn register(&mut self, provider: Arc<dyn LLMProvider>) {
        let name = provider.name().to_string();
        self.providers.insert(name.clone(), provider);

        if self.default_provider.is_empty() {
            self.default_provider = name;
        }
    }

    pub fn set_default(&mut self, provider_name: &str) -> Result<()> {
        if !self.providers.contains_key(provider_name) {
            anyhow::bail!("Provider '{}' not found", provider_name);
        }
        self.default_provider = provider_name.to_string();
        Ok(())
    }

    pub fn get(&self, provider_name: Option<&str>) -> Result<Arc<dyn LLMProvider>> {
        let name = provider_name.unwrap_or(&self.default_provider);
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Provider '{}' not found", name))
    }

    /// Find the provider whose catalog lists `model_id`, falling back to the default.
    pub fn provider_for_model(&self, model_id: &str) -> Result<Arc<dyn LLMProvider>> {
        let mut names: Vec<&String> = self.providers.keys().collect();
        names.sort();
        for name in names {
            let provider = &self.providers[name];
            if provider.list_models().iter().any(|m| m.id == model_id) {
                return Ok(Arc::clone(provider));
            }
        }
        self.get(None)
    }

    pub fn list_providers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
