//! The `red_candle` provider: runs models in-process through an
//! [`InferenceBackend`](crate::engine::InferenceBackend).
//!
//! Request flow: resolve the model id, load (or reuse) the engine handle on
//! the configured device, build generation options, render the chat prompt,
//! then generate either in one shot or token by token.

mod device;
mod generation;
mod loader;
mod provider;
mod template;

pub use device::{parse_device_kind, select_device};
pub use generation::{build_config, ConstraintSpec};
pub use loader::{resolve_model, ModelLoader, FALLBACK_MODEL};
pub use provider::{EmbeddedProvider, EmbeddedSettings, PROVIDER_SLUG};
pub use template::{format_prompt, ChatTemplate};
