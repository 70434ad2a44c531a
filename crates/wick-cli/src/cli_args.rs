//! CLI argument parsing for wick.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Clone, Debug)]
#[command(name = "wick")]
#[command(about = "Run chat completions against a local in-process model")]
#[command(version)]
pub struct Cli {
    /// Prompt to complete
    pub prompt: Option<String>,

    /// Model id or local GGUF path (overrides candle.default_model)
    #[arg(short, long, value_name = "MODEL")]
    pub model: Option<String>,

    /// Device to run on: cpu, metal or cuda
    #[arg(short, long, value_name = "DEVICE")]
    pub device: Option<String>,

    /// Print tokens as they are generated
    #[arg(long, conflicts_with_all = ["schema", "regex"])]
    pub stream: bool,

    /// Constrain output to the JSON schema in this file
    #[arg(long, value_name = "FILE", conflicts_with = "regex")]
    pub schema: Option<PathBuf>,

    /// Constrain output to match this regular expression
    #[arg(long, value_name = "PATTERN")]
    pub regex: Option<String>,

    /// System message sent before the prompt
    #[arg(long, value_name = "TEXT")]
    pub system: Option<String>,

    /// Sampling temperature
    #[arg(short, long)]
    pub temperature: Option<f32>,

    /// List the model catalog and exit
    #[arg(long)]
    pub list_models: bool,

    /// Show capabilities of a model and exit
    #[arg(long, value_name = "MODEL")]
    pub capabilities: Option<String>,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}
