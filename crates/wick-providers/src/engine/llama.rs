//! llama.cpp engine for local GGUF models.
//!
//! Model ids are mapped onto files on disk: an existing path is used as-is,
//! otherwise the id is looked up under the configured model directory. A
//! directory resolves to the first `.gguf` file it contains.

use super::{
    BackendOptions, ConstraintKind, DecodingConstraint, Device, DeviceKind, EngineHandle,
    GenerationConfig, GenerationOptions, InferenceBackend, StructuredOutput,
};
use crate::grammar;
use crate::streaming::{ScanStep, StopScanner};
use anyhow::{Context, Result};
use llama_cpp_2::{
    context::params::LlamaContextParams,
    context::LlamaContext,
    llama_backend::LlamaBackend,
    llama_batch::LlamaBatch,
    model::{params::LlamaModelParams, AddBos, LlamaModel, Special},
    sampling::LlamaSampler,
};
use serde_json::Value;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

/// llama.cpp can only be initialized once per process
static LLAMA_BACKEND: OnceLock<Arc<LlamaBackend>> = OnceLock::new();

const DEFAULT_MAX_TOKENS: u32 = 512;
const BALANCED_TEMPERATURE: f32 = 0.7;
const BALANCED_TOP_K: i32 = 40;
const BALANCED_TOP_P: f32 = 0.95;
const SAMPLER_SEED: u32 = 1234;

fn get_or_init_backend() -> Result<Arc<LlamaBackend>> {
    if let Some(backend) = LLAMA_BACKEND.get() {
        return Ok(Arc::clone(backend));
    }

    suppress_llama_logging();

    debug!("Initializing llama.cpp backend...");
    let backend = LlamaBackend::init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize llama.cpp backend: {:?}", e))?;

    // Another thread may have won the race
    let backend = LLAMA_BACKEND.get_or_init(|| Arc::new(backend));
    Ok(Arc::clone(backend))
}

fn suppress_llama_logging() {
    unsafe extern "C" fn void_log(
        _level: std::ffi::c_int,
        _text: *const std::os::raw::c_char,
        _user_data: *mut std::os::raw::c_void,
    ) {
    }

    extern "C" {
        fn llama_log_set(
            log_callback: Option<
                unsafe extern "C" fn(
                    std::ffi::c_int,
                    *const std::os::raw::c_char,
                    *mut std::os::raw::c_void,
                ),
            >,
            user_data: *mut std::os::raw::c_void,
        );
    }

    unsafe {
        llama_log_set(Some(void_log), std::ptr::null_mut());
    }
}

#[derive(Debug, Clone, Default)]
pub struct LlamaOptions {
    pub model_dir: Option<PathBuf>,
    pub max_tokens: Option<u32>,
    /// Context size; the model's training context when unset
    pub context_length: Option<u32>,
    pub threads: Option<u32>,
}

impl From<BackendOptions> for LlamaOptions {
    fn from(options: BackendOptions) -> Self {
        Self {
            model_dir: options.model_dir,
            max_tokens: options.max_tokens,
            context_length: options.context_length,
            threads: options.threads,
        }
    }
}

pub struct LlamaCppBackend {
    options: LlamaOptions,
}

impl LlamaCppBackend {
    pub fn new(options: LlamaOptions) -> Self {
        Self { options }
    }

    /// Find the GGUF file for `model_id`.
    fn model_path(&self, model_id: &str) -> Result<PathBuf> {
        let direct = PathBuf::from(shellexpand::tilde(model_id).as_ref());
        let mut candidates = vec![direct];
        if let Some(dir) = &self.options.model_dir {
            let dir = PathBuf::from(shellexpand::tilde(&dir.to_string_lossy()).as_ref());
            candidates.push(dir.join(model_id));
        }

        for candidate in &candidates {
            if candidate.is_file() {
                return Ok(candidate.clone());
            }
            if candidate.is_dir() {
                if let Some(file) = first_gguf_in(candidate)? {
                    return Ok(file);
                }
            }
        }

        anyhow::bail!(
            "Model file not found for '{}' (looked in: {})",
            model_id,
            candidates
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )
    }
}

fn first_gguf_in(dir: &Path) -> Result<Option<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read model directory {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.extension()
                .map(|ext| ext.eq_ignore_ascii_case("gguf"))
                .unwrap_or(false)
        })
        .collect();
    files.sort();
    Ok(files.into_iter().next())
}

impl InferenceBackend for LlamaCppBackend {
    fn name(&self) -> &str {
        "llama.cpp"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn device(&self, kind: DeviceKind) -> Result<Device> {
        match kind {
            DeviceKind::Cpu => Ok(Device::Cpu),
            DeviceKind::Metal if cfg!(feature = "metal") => Ok(Device::Metal(0)),
            DeviceKind::Cuda if cfg!(feature = "cuda") => Ok(Device::Cuda(0)),
            other => anyhow::bail!(
                "{} support is not compiled in; rebuild with `--features {}`",
                other,
                other.as_str()
            ),
        }
    }

    fn from_pretrained(&self, model_id: &str, device: &Device) -> Result<Arc<dyn EngineHandle>> {
        let path = self.model_path(model_id)?;
        let backend = get_or_init_backend()?;

        let n_gpu_layers = match device {
            Device::Cpu => 0,
            Device::Metal(_) | Device::Cuda(_) => 99,
        };
        let model_params = LlamaModelParams::default().with_n_gpu_layers(n_gpu_layers);
        debug!("Loading {} with {} GPU layers", path.display(), n_gpu_layers);

        let model = LlamaModel::load_from_file(&backend, &path, &model_params)
            .map_err(|e| anyhow::anyhow!("Failed to load model {}: {:?}", path.display(), e))?;

        let context_length = self
            .options
            .context_length
            .unwrap_or_else(|| model.n_ctx_train());
        info!(
            "Loaded {} (context {}) on {}",
            model_id,
            context_length,
            device.kind()
        );

        Ok(Arc::new(LlamaEngine {
            name: model_id.to_string(),
            model,
            backend,
            context_length,
            max_tokens: self.options.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            threads: self.options.threads,
        }))
    }
}

struct LlamaEngine {
    name: String,
    model: LlamaModel,
    backend: Arc<LlamaBackend>,
    context_length: u32,
    max_tokens: u32,
    threads: Option<u32>,
}

/// Context with the prompt already decoded.
struct PreparedContext<'a> {
    ctx: LlamaContext<'a>,
    batch: LlamaBatch,
    position: i32,
}

impl LlamaEngine {
    fn prepare_context(&self, prompt: &str) -> Result<PreparedContext<'_>> {
        let n_ctx = NonZeroU32::new(self.context_length).or(NonZeroU32::new(4096));
        let mut ctx_params = LlamaContextParams::default()
            .with_n_ctx(n_ctx)
            .with_n_batch(self.context_length);
        if let Some(n_threads) = self.threads {
            ctx_params = ctx_params.with_n_threads(n_threads as i32);
        }

        let mut ctx = self
            .model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| anyhow::anyhow!("Failed to create context: {:?}", e))?;

        let tokens = self
            .model
            .str_to_token(prompt, AddBos::Always)
            .map_err(|e| anyhow::anyhow!("Failed to tokenize: {:?}", e))?;
        debug!("Tokenized prompt: {} tokens", tokens.len());

        let mut batch = LlamaBatch::new(std::cmp::max(512, tokens.len()), 1);
        for (i, token) in tokens.iter().enumerate() {
            batch
                .add(*token, i as i32, &[0], i == tokens.len() - 1)
                .map_err(|e| anyhow::anyhow!("Failed to add token to batch: {:?}", e))?;
        }
        ctx.decode(&mut batch)
            .map_err(|e| anyhow::anyhow!("Failed to decode prompt: {:?}", e))?;

        Ok(PreparedContext {
            ctx,
            batch,
            position: tokens.len() as i32,
        })
    }

    fn sampler(&self, config: &GenerationConfig) -> Result<LlamaSampler> {
        let options = match config {
            GenerationConfig::Balanced => {
                return Ok(LlamaSampler::chain_simple([
                    LlamaSampler::top_k(BALANCED_TOP_K),
                    LlamaSampler::top_p(BALANCED_TOP_P, 1),
                    LlamaSampler::temp(BALANCED_TEMPERATURE),
                    LlamaSampler::dist(SAMPLER_SEED),
                ]))
            }
            GenerationConfig::Explicit(options) => options,
        };

        let mut samplers = Vec::new();
        if let Some(constraint) = checked_constraint(options, &self.name)? {
            // Older releases return Option, newer ones Result
            let grammar = LlamaSampler::grammar(&self.model, constraint.grammar(), "root")
                .into_iter()
                .next()
                .ok_or_else(|| anyhow::anyhow!("llama.cpp rejected the compiled grammar"))?;
            samplers.push(grammar);
        }
        samplers.push(LlamaSampler::temp(
            options.temperature.unwrap_or(BALANCED_TEMPERATURE),
        ));
        samplers.push(LlamaSampler::dist(SAMPLER_SEED));
        Ok(LlamaSampler::chain_simple(samplers))
    }

    fn token_budget(&self, config: &GenerationConfig) -> u32 {
        match config {
            GenerationConfig::Explicit(options) => options.max_tokens.unwrap_or(self.max_tokens),
            GenerationConfig::Balanced => self.max_tokens,
        }
    }

    /// Generate until end of generation, a turn marker, or the token budget.
    fn run(
        &self,
        prompt: &str,
        config: &GenerationConfig,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<String> {
        let mut prepared = self.prepare_context(prompt)?;
        let mut sampler = self.sampler(config)?;
        let mut scanner = StopScanner::new();
        let mut stopped = false;

        for _ in 0..self.token_budget(config) {
            let token = sampler.sample(&prepared.ctx, prepared.batch.n_tokens() - 1);
            sampler.accept(token);

            if self.model.is_eog_token(token) {
                debug!("End of generation after {} chars", scanner.text().len());
                break;
            }

            let bytes = self
                .model
                .token_to_bytes(token, Special::Tokenize)
                .map_err(|e| anyhow::anyhow!("Failed to detokenize: {:?}", e))?;
            match scanner.push(&bytes) {
                ScanStep::Emit(piece) => {
                    if !piece.is_empty() {
                        on_token(&piece);
                    }
                }
                ScanStep::Stop(piece) => {
                    if !piece.is_empty() {
                        on_token(&piece);
                    }
                    stopped = true;
                    break;
                }
            }

            prepared.batch.clear();
            prepared
                .batch
                .add(token, prepared.position, &[0], true)
                .map_err(|e| anyhow::anyhow!("Failed to add token to batch: {:?}", e))?;
            prepared.position += 1;
            prepared
                .ctx
                .decode(&mut prepared.batch)
                .map_err(|e| anyhow::anyhow!("Failed to decode: {:?}", e))?;
        }

        if !stopped {
            let rest = scanner.flush();
            if !rest.is_empty() {
                on_token(&rest);
            }
        }
        Ok(scanner.text().to_string())
    }
}

/// The request's constraint, if any, after checking it was compiled for `model_name`.
fn checked_constraint<'a>(
    options: &'a GenerationOptions,
    model_name: &str,
) -> Result<Option<&'a DecodingConstraint>> {
    match options.constraint.as_ref() {
        Some(constraint) => {
            constraint.ensure_compiled_for(model_name)?;
            Ok(Some(constraint))
        }
        None => Ok(None),
    }
}

impl EngineHandle for LlamaEngine {
    fn model_name(&self) -> &str {
        &self.name
    }

    fn generate(&self, prompt: &str, config: &GenerationConfig) -> Result<String> {
        let text = self.run(prompt, config, &mut |_: &str| {})?;
        Ok(text.trim().to_string())
    }

    fn generate_stream(
        &self,
        prompt: &str,
        config: &GenerationConfig,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<String> {
        self.run(prompt, config, on_token)
    }

    fn constraint_from_schema(&self, schema: &Value) -> Result<DecodingConstraint> {
        let gbnf = grammar::schema_to_gbnf(schema)?;
        Ok(DecodingConstraint::new(ConstraintKind::JsonSchema, &self.name, gbnf))
    }

    fn constraint_from_regex(&self, pattern: &str) -> Result<DecodingConstraint> {
        let gbnf = grammar::regex_to_gbnf(pattern)?;
        Ok(DecodingConstraint::new(ConstraintKind::Regex, &self.name, gbnf))
    }

    fn generate_structured(&self, prompt: &str, schema: &Value) -> Result<StructuredOutput> {
        let config = GenerationConfig::constrained(self.constraint_from_schema(schema)?);
        let text = self.generate(prompt, &config)?;
        Ok(match serde_json::from_str(&text) {
            Ok(value) => StructuredOutput::Json(value),
            Err(_) => StructuredOutput::Text(text),
        })
    }

    fn generate_regex(&self, prompt: &str, pattern: &str) -> Result<String> {
        let config = GenerationConfig::constrained(self.constraint_from_regex(pattern)?);
        self.run(prompt, &config, &mut |_: &str| {})
    }
}
