//! wick CLI - run completions against the red_candle provider from the command line.

mod cli_args;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, warn};

use wick_config::Config;
use wick_providers::engine::{default_backend, BackendOptions, InferenceBackend};
use wick_providers::{
    ChatMessage, CompletionRequest, EmbeddedProvider, EmbeddedSettings, LLMProvider,
};

pub use cli_args::Cli;
use clap::Parser;

pub async fn run() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load_with_overrides(
        cli.config.as_deref(),
        cli.device.clone(),
        cli.model.clone(),
    )?;

    initialize_logging(cli.verbose, &config.logging.level);
    debug!("Loaded configuration: {:?}", config);
    for warning in config.warnings() {
        warn!("{}", warning);
    }

    let provider = build_provider(&config, default_backend(backend_options(&config)));

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    execute(&cli, &provider, &mut out).await
}

fn initialize_logging(verbose: bool, level: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let level = if verbose { "debug" } else { level };
    let level = level.to_lowercase();
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("wick={}", level).parse().unwrap())
        .add_directive(format!("wick_cli={}", level).parse().unwrap())
        .add_directive(format!("wick_config={}", level).parse().unwrap())
        .add_directive(format!("wick_providers={}", level).parse().unwrap())
        .add_directive("llama_cpp_2=off".parse().unwrap())
        .add_directive("llama=off".parse().unwrap());

    // Completions go to stdout; logs stay on stderr
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

pub fn backend_options(config: &Config) -> BackendOptions {
    BackendOptions {
        model_dir: config.candle.model_dir_path(),
        max_tokens: config.candle.max_tokens,
        context_length: config.candle.context_length,
        threads: config.candle.threads,
    }
}

pub fn build_provider(config: &Config, backend: Arc<dyn InferenceBackend>) -> EmbeddedProvider {
    EmbeddedProvider::new(
        backend,
        EmbeddedSettings {
            device: config.candle.device.clone(),
            default_model: config.candle.default_model.clone(),
        },
    )
}

/// Carry out the action selected by `cli`, writing results to `out`.
///
/// The model given on the command line is applied through the provider's
/// configured default, so requests here never name a model themselves.
pub async fn execute(cli: &Cli, provider: &EmbeddedProvider, out: &mut dyn Write) -> Result<()> {
    if cli.list_models {
        for model in provider.list_models() {
            writeln!(
                out,
                "{:<45} {:<40} {:>7}  {}",
                model.id,
                model.display_name,
                model.context_window,
                model.capabilities.iter().cloned().collect::<Vec<_>>().join(",")
            )?;
        }
        return Ok(());
    }

    if let Some(model_id) = &cli.capabilities {
        let caps = provider.capabilities(model_id);
        writeln!(out, "{}", serde_json::to_string_pretty(&caps)?)?;
        return Ok(());
    }

    let Some(prompt) = cli.prompt.as_deref() else {
        anyhow::bail!("No prompt given. Run `wick --help` for usage.");
    };

    if let Some(pattern) = &cli.regex {
        let response = provider.generate_regex(prompt, pattern, None).await?;
        writeln!(out, "{}", response.content)?;
        return Ok(());
    }

    if let Some(schema_path) = &cli.schema {
        let schema = read_schema(schema_path)?;
        let response = provider.generate_structured(prompt, schema, None).await?;
        writeln!(out, "{}", response.content)?;
        return Ok(());
    }

    let mut messages = Vec::new();
    if let Some(system) = &cli.system {
        messages.push(ChatMessage::system(system.clone()));
    }
    messages.push(ChatMessage::user(prompt));

    let mut request = CompletionRequest::new(messages);
    request.temperature = cli.temperature;

    if cli.stream {
        let mut stream = provider.stream(request).await?;
        while let Some(chunk) = stream.next().await {
            write!(out, "{}", chunk?.content)?;
            out.flush()?;
        }
        writeln!(out)?;
    } else {
        let response = provider.complete(request, None).await?;
        debug!("Completed with {}", response.model_id);
        writeln!(out, "{}", response.content)?;
    }
    Ok(())
}

fn read_schema(path: &std::path::Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read schema file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Schema file {} is not valid JSON", path.display()))
}
