use thiserror::Error;

/// Errors raised by the provider layer itself.
///
/// Failures reported by an inference engine are not represented here; they
/// reach the caller unchanged inside `anyhow::Error`.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{dependency} is not available. {guidance}")]
    Configuration {
        dependency: String,
        guidance: String,
    },

    #[error("{0} is not supported: red_candle runs models in-process and has no HTTP endpoints")]
    UnsupportedHttpSurface(&'static str),

    #[error("Generation task failed: {0}")]
    Blocking(String),
}
