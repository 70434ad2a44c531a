//! The `red_candle` provider.
//!
//! Engine calls block, so every request runs on tokio's blocking pool. There
//! is no cancellation: once started, a generation runs to completion.

use super::device::parse_device_kind;
use super::generation::{build_config, ConstraintSpec};
use super::loader::ModelLoader;
use super::template::format_prompt;
use crate::engine::{EngineHandle, InferenceBackend};
use crate::error::ProviderError;
use crate::streaming::ChunkTranslator;
use crate::{
    capabilities, models, ChunkCallback, CompletionChunk, CompletionRequest, CompletionResponse,
    CompletionStream, LLMProvider, ModelCapabilities, ModelInfo,
};
use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

pub const PROVIDER_SLUG: &str = "red_candle";

/// Settings consumed from the host configuration.
#[derive(Debug, Clone, Default)]
pub struct EmbeddedSettings {
    /// "cpu", "metal" or "cuda" (case-insensitive); anything else means cpu
    pub device: Option<String>,
    pub default_model: Option<String>,
}

pub struct EmbeddedProvider {
    loader: Arc<ModelLoader>,
}

impl EmbeddedProvider {
    /// Create a provider over `backend`. Engine availability is probed here, once.
    pub fn new(backend: Arc<dyn InferenceBackend>, settings: EmbeddedSettings) -> Self {
        let device_kind = parse_device_kind(settings.device.as_deref());
        let loader = ModelLoader::new(backend, device_kind, settings.default_model);
        if !loader.availability().is_available() {
            warn!("Inference engine not available; red_candle requests will fail");
        }
        Self {
            loader: Arc::new(loader),
        }
    }

    pub fn resolve_model(&self, requested: Option<&str>) -> String {
        self.loader.resolve(requested)
    }

    /// Number of engine handles currently cached
    pub fn cached_models(&self) -> usize {
        self.loader.cached_models()
    }

    /// Generate output constrained by a JSON schema.
    ///
    /// `prompt` goes to the engine as-is, without chat formatting. Structured
    /// values are serialized to JSON text for the message content.
    pub async fn generate_structured(
        &self,
        prompt: &str,
        schema: Value,
        model: Option<&str>,
    ) -> Result<CompletionResponse> {
        self.loader.availability().ensure()?;
        let loader = Arc::clone(&self.loader);
        let model_id = loader.resolve(model);
        let prompt = prompt.to_string();

        run_blocking(move || {
            let engine = loader.load(&model_id)?;
            debug!("Structured generation with {}", engine.model_name());
            let output = engine.generate_structured(&prompt, &schema)?;
            Ok(CompletionResponse::assistant(
                output.into_content()?,
                engine.model_name(),
            ))
        })
        .await
    }

    /// Generate output matching a regular expression, with `prompt` passed as-is.
    pub async fn generate_regex(
        &self,
        prompt: &str,
        pattern: &str,
        model: Option<&str>,
    ) -> Result<CompletionResponse> {
        self.loader.availability().ensure()?;
        let loader = Arc::clone(&self.loader);
        let model_id = loader.resolve(model);
        let prompt = prompt.to_string();
        let pattern = pattern.to_string();

        run_blocking(move || {
            let engine = loader.load(&model_id)?;
            debug!("Regex-constrained generation with {}", engine.model_name());
            let text = engine.generate_regex(&prompt, &pattern)?;
            Ok(CompletionResponse::assistant(text, engine.model_name()))
        })
        .await
    }
}

/// Run `job` on the blocking pool.
async fn run_blocking<T, F>(job: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(job)
        .await
        .map_err(|e| ProviderError::Blocking(e.to_string()))?
}

/// One completion, start to finish, on the calling thread.
fn run_completion(
    loader: &ModelLoader,
    request: CompletionRequest,
    mut on_chunk: Option<ChunkCallback>,
) -> Result<CompletionResponse> {
    let model_id = loader.resolve(request.model.as_deref());
    let engine = loader.load(&model_id)?;

    let constraint = request.schema.map(ConstraintSpec::JsonSchema);
    let config = build_config(
        request.temperature,
        request.max_tokens,
        constraint.as_ref().map(|spec| (spec, engine.as_ref() as &dyn EngineHandle)),
    )?;

    let prompt = format_prompt(&request.messages, engine.model_name());
    debug!(
        "Formatted {} messages into {} chars for {}",
        request.messages.len(),
        prompt.len(),
        engine.model_name()
    );

    if !request.stream {
        let text = engine.generate(&prompt, &config)?;
        return Ok(CompletionResponse::assistant(text, engine.model_name()));
    }

    let mut translator = ChunkTranslator::new(engine.model_name());
    let engine_text = engine.generate_stream(&prompt, &config, &mut |token: &str| {
        let chunk = translator.translate(token);
        if let Some(deliver) = on_chunk.as_mut() {
            deliver(chunk);
        }
    })?;

    if engine_text != translator.accumulated() {
        debug!(
            "Engine final text differs from streamed tokens ({} vs {} chars); using streamed text",
            engine_text.len(),
            translator.accumulated().len()
        );
    }
    debug!("Streamed {} chunks", translator.chunks_emitted());
    Ok(translator.finish())
}

#[async_trait::async_trait]
impl LLMProvider for EmbeddedProvider {
    async fn complete(
        &self,
        request: CompletionRequest,
        on_chunk: Option<ChunkCallback>,
    ) -> Result<CompletionResponse> {
        self.loader.availability().ensure()?;
        debug!(
            "Processing {} request with {} messages",
            if request.stream { "streaming" } else { "completion" },
            request.messages.len()
        );

        let loader = Arc::clone(&self.loader);
        run_blocking(move || run_completion(&loader, request, on_chunk)).await
    }

    async fn stream(&self, mut request: CompletionRequest) -> Result<CompletionStream> {
        self.loader.availability().ensure()?;
        request.stream = true;

        // Capacity 1: the engine produces at most one token ahead of the reader.
        let (tx, rx) = mpsc::channel::<Result<CompletionChunk>>(1);
        let loader = Arc::clone(&self.loader);
        let failure_tx = tx.clone();

        let worker = tokio::task::spawn_blocking(move || {
            let chunk_tx = tx.clone();
            let on_chunk: ChunkCallback = Box::new(move |chunk| {
                // A dropped receiver cannot stop the engine; remaining chunks are discarded.
                let _ = chunk_tx.blocking_send(Ok(chunk));
            });

            if let Err(e) = run_completion(&loader, request, Some(on_chunk)) {
                let _ = tx.blocking_send(Err(e));
            }
        });

        // A panicking engine must end the stream with an error, not a silent close
        tokio::spawn(async move {
            if let Err(e) = worker.await {
                warn!("Streaming generation task failed: {}", e);
                let _ = failure_tx
                    .send(Err(ProviderError::Blocking(e.to_string()).into()))
                    .await;
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    fn name(&self) -> &str {
        PROVIDER_SLUG
    }

    fn completion_url(&self) -> Result<String> {
        Err(ProviderError::UnsupportedHttpSurface("completion_url").into())
    }

    fn models_url(&self) -> Result<String> {
        Err(ProviderError::UnsupportedHttpSurface("models_url").into())
    }

    fn stream_url(&self) -> Result<String> {
        Err(ProviderError::UnsupportedHttpSurface("stream_url").into())
    }

    fn list_models(&self) -> Vec<ModelInfo> {
        models::list_models()
    }

    fn capabilities(&self, model_id: &str) -> ModelCapabilities {
        capabilities::describe(model_id)
    }
}
