//! CLI tests: argument parsing and command execution against the mock engine.

use clap::Parser;
use std::sync::Arc;
use wick_cli::{backend_options, build_provider, execute, Cli};
use wick_config::Config;
use wick_providers::mock::MockBackend;

fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(std::iter::once("wick").chain(args.iter().copied())).unwrap()
}

async fn run_with(cli: &Cli, config: &Config, backend: Arc<MockBackend>) -> anyhow::Result<String> {
    let provider = build_provider(config, backend);
    let mut out = Vec::new();
    execute(cli, &provider, &mut out).await?;
    Ok(String::from_utf8(out).unwrap())
}

#[test]
fn test_parse_generation_flags() {
    let cli = parse(&[
        "Tell me a joke",
        "--model",
        "tiny",
        "--device",
        "metal",
        "--stream",
        "--system",
        "Be funny",
        "--temperature",
        "0.3",
        "-v",
    ]);

    assert_eq!(cli.prompt.as_deref(), Some("Tell me a joke"));
    assert_eq!(cli.model.as_deref(), Some("tiny"));
    assert_eq!(cli.device.as_deref(), Some("metal"));
    assert!(cli.stream);
    assert_eq!(cli.system.as_deref(), Some("Be funny"));
    assert_eq!(cli.temperature, Some(0.3));
    assert!(cli.verbose);
}

#[test]
fn test_constraint_flags_conflict() {
    let result = Cli::try_parse_from(["wick", "x", "--regex", "a+", "--schema", "s.json"]);
    assert!(result.is_err());

    let result = Cli::try_parse_from(["wick", "x", "--stream", "--regex", "a+"]);
    assert!(result.is_err());
}

#[tokio::test]
async fn test_list_models_prints_catalog() {
    let output = run_with(
        &parse(&["--list-models"]),
        &Config::default(),
        Arc::new(MockBackend::new()),
    )
    .await
    .unwrap();

    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(lines.len(), 8);
    assert!(lines[0].starts_with("google/gemma-3-4b-it-qat-q4_0-gguf"));
    assert!(lines.last().unwrap().contains("GGUF quantized models"));
}

#[tokio::test]
async fn test_capabilities_prints_json() {
    let output = run_with(
        &parse(&["--capabilities", "mistralai/Mistral-7B-Instruct-v0.3"]),
        &Config::default(),
        Arc::new(MockBackend::new()),
    )
    .await
    .unwrap();

    let caps: serde_json::Value = serde_json::from_str(&output).unwrap();
    assert_eq!(caps["context_window"], 32768);
    assert_eq!(caps["model_family"], "mistral");
    assert_eq!(caps["supports_vision"], false);
}

#[tokio::test]
async fn test_completion_uses_configured_model() {
    let backend = Arc::new(MockBackend::new().with_tokens(vec!["Hi", " there"]));
    let mut config = Config::default();
    config.candle.default_model = Some("Qwen/Qwen2.5-1.5B-Instruct-GGUF".to_string());

    let output = run_with(
        &parse(&["hello", "--system", "Be kind"]),
        &config,
        backend.clone(),
    )
    .await
    .unwrap();

    assert_eq!(output, "Hi there\n");
    let prompt = backend.last_prompt().unwrap();
    assert!(prompt.starts_with("<|im_start|>system\nBe kind<|im_end|>"));
}

#[tokio::test]
async fn test_streaming_output() {
    let backend = Arc::new(MockBackend::new());
    let output = run_with(&parse(&["hello", "--stream"]), &Config::default(), backend)
        .await
        .unwrap();

    assert_eq!(output, "Hello, world\n");
}

#[tokio::test]
async fn test_schema_file_constrains_output() {
    let dir = tempfile::tempdir().unwrap();
    let schema_path = dir.path().join("color.json");
    std::fs::write(
        &schema_path,
        r#"{"type": "object", "properties": {"color": {"enum": ["red", "blue"]}}, "required": ["color"]}"#,
    )
    .unwrap();

    let output = run_with(
        &parse(&["Pick", "--schema", schema_path.to_str().unwrap()]),
        &Config::default(),
        Arc::new(MockBackend::new()),
    )
    .await
    .unwrap();

    let value: serde_json::Value = serde_json::from_str(output.trim()).unwrap();
    assert!(["red", "blue"].contains(&value["color"].as_str().unwrap()));
}

#[tokio::test]
async fn test_missing_prompt_is_an_error() {
    let result = run_with(&parse(&[]), &Config::default(), Arc::new(MockBackend::new())).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_missing_engine_reports_install_guidance() {
    let err = run_with(
        &parse(&["hello"]),
        &Config::default(),
        Arc::new(MockBackend::unavailable()),
    )
    .await
    .unwrap_err();

    assert!(err.to_string().contains("is not available"));
}

#[test]
fn test_backend_options_from_config() {
    let mut config = Config::default();
    config.candle.model_dir = Some("/opt/models".to_string());
    config.candle.max_tokens = Some(64);

    let options = backend_options(&config);
    assert_eq!(options.model_dir, Some(std::path::PathBuf::from("/opt/models")));
    assert_eq!(options.max_tokens, Some(64));
    assert!(options.threads.is_none());
}

#[test]
fn test_unknown_device_override_is_kept_for_reporting() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[candle]\nmax_tokens = 32\n").unwrap();

    let config =
        Config::load_with_overrides(path.to_str(), Some("tpu".to_string()), None).unwrap();

    assert_eq!(config.candle.device.as_deref(), Some("tpu"));
    assert!(config.warnings()[0].contains("cpu will be used"));
}
