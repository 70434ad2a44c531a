use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable overriding `candle.device`
pub const DEVICE_ENV: &str = "WICK_DEVICE";
/// Environment variable overriding `candle.default_model`
pub const DEFAULT_MODEL_ENV: &str = "WICK_DEFAULT_MODEL";

const KNOWN_DEVICES: &[&str] = &["cpu", "metal", "cuda"];
const KNOWN_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub candle: CandleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Settings for the in-process red_candle provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandleConfig {
    /// cpu, metal or cuda (case-insensitive)
    pub device: Option<String>,
    pub default_model: Option<String>,
    /// Directory holding local model files; `~` is expanded
    pub model_dir: Option<String>,
    pub max_tokens: Option<u32>,
    pub context_length: Option<u32>,
    pub threads: Option<u32>,
}

impl CandleConfig {
    pub fn model_dir_path(&self) -> Option<PathBuf> {
        self.model_dir
            .as_deref()
            .map(|dir| PathBuf::from(shellexpand::tilde(dir).as_ref()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Config files searched when no explicit path is given, in priority order.
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("./wick.toml")];
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config").join("wick").join("config.toml"));
        paths.push(home.join(".wick.toml"));
    }
    paths
}

impl Config {
    /// Load from `config_path`, or from the first default location that exists.
    ///
    /// With no explicit path and no file present, defaults are returned.
    /// Environment overrides are applied last.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::load_from(config_path, &default_config_paths())?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn load_from(config_path: Option<&str>, search_paths: &[PathBuf]) -> Result<Self> {
        let path_to_load = match config_path {
            Some(path) => {
                let expanded = PathBuf::from(shellexpand::tilde(path).as_ref());
                if !expanded.exists() {
                    anyhow::bail!("Config file not found: {}", expanded.display());
                }
                Some(expanded)
            }
            None => search_paths.iter().find(|path| path.exists()).cloned(),
        };

        match path_to_load {
            Some(path) => Self::read(&path),
            None => {
                debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    fn read(path: &Path) -> Result<Self> {
        debug!("Loading config from {}", path.display());
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config file {}: {}", path.display(), e))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(device) = std::env::var(DEVICE_ENV) {
            if !device.is_empty() {
                self.candle.device = Some(device);
            }
        }
        if let Ok(model) = std::env::var(DEFAULT_MODEL_ENV) {
            if !model.is_empty() {
                self.candle.default_model = Some(model);
            }
        }
    }

    /// Problems worth reporting that do not stop the run.
    ///
    /// Returned rather than logged so callers can report them once logging is up.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if let Some(device) = &self.candle.device {
            if !KNOWN_DEVICES.contains(&device.to_lowercase().as_str()) {
                warnings.push(format!(
                    "Unknown device '{}' (expected one of: {}); cpu will be used",
                    device,
                    KNOWN_DEVICES.join(", ")
                ));
            }
        }
        warnings
    }

    /// Check values that would otherwise fail late.
    ///
    /// An unknown device is not an error here, see [`Config::warnings`].
    pub fn validate(&self) -> Result<()> {
        if self.candle.max_tokens == Some(0) {
            anyhow::bail!("candle.max_tokens must be greater than 0");
        }
        if self.candle.context_length == Some(0) {
            anyhow::bail!("candle.context_length must be greater than 0");
        }
        if !KNOWN_LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid logging.level '{}'. Use one of: {}",
                self.logging.level,
                KNOWN_LOG_LEVELS.join(", ")
            );
        }
        Ok(())
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    /// Load, then apply command-line overrides on top of file and environment.
    pub fn load_with_overrides(
        config_path: Option<&str>,
        device_override: Option<String>,
        model_override: Option<String>,
    ) -> Result<Self> {
        let mut config = Self::load(config_path)?;

        if let Some(device) = device_override {
            config.candle.device = Some(device);
        }
        if let Some(model) = model_override {
            config.candle.default_model = Some(model);
        }

        config.validate()?;
        Ok(config)
    }
}
