use crate::engine::{EngineHandle, GenerationConfig, GenerationOptions};
use anyhow::Result;
use serde_json::Value;
use tracing::debug;

/// Description of a decoding constraint before it is compiled by an engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstraintSpec {
    JsonSchema(Value),
    Regex(String),
}

/// Build the generation config for one request.
///
/// With nothing requested the engine's balanced profile is used. Otherwise
/// the config carries exactly the given options. A constraint can only be
/// supplied together with the engine that compiles it.
pub fn build_config(
    temperature: Option<f32>,
    max_tokens: Option<u32>,
    constraint: Option<(&ConstraintSpec, &dyn EngineHandle)>,
) -> Result<GenerationConfig> {
    if temperature.is_none() && max_tokens.is_none() && constraint.is_none() {
        return Ok(GenerationConfig::Balanced);
    }

    let constraint = match constraint {
        Some((ConstraintSpec::JsonSchema(schema), engine)) => {
            debug!("Compiling JSON schema constraint for {}", engine.model_name());
            Some(engine.constraint_from_schema(schema)?)
        }
        Some((ConstraintSpec::Regex(pattern), engine)) => {
            debug!("Compiling regex constraint for {}", engine.model_name());
            Some(engine.constraint_from_regex(pattern)?)
        }
        None => None,
    };

    Ok(GenerationConfig::Explicit(GenerationOptions {
        temperature,
        max_tokens,
        constraint,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ConstraintKind, Device, InferenceBackend};
    use crate::mock::MockBackend;
    use serde_json::json;

    fn engine() -> std::sync::Arc<dyn EngineHandle> {
        MockBackend::new().from_pretrained("model-a", &Device::Cpu).unwrap()
    }

    #[test]
    fn test_no_options_uses_balanced_profile() {
        let config = build_config(None, None, None).unwrap();
        assert!(matches!(config, GenerationConfig::Balanced));
    }

    #[test]
    fn test_temperature_only() {
        let config = build_config(Some(0.3), None, None).unwrap();
        match config {
            GenerationConfig::Explicit(options) => {
                assert_eq!(options.temperature, Some(0.3));
                assert_eq!(options.max_tokens, None);
                assert!(options.constraint.is_none());
            }
            GenerationConfig::Balanced => panic!("expected explicit config"),
        }
    }

    #[test]
    fn test_schema_constraint_compiled_against_engine() {
        let engine = engine();
        let spec = ConstraintSpec::JsonSchema(json!({
            "type": "object",
            "properties": {"answer": {"type": "string"}},
            "required": ["answer"]
        }));
        let config = build_config(None, None, Some((&spec, engine.as_ref()))).unwrap();

        let constraint = config.constraint().expect("constraint attached");
        assert_eq!(constraint.kind(), ConstraintKind::JsonSchema);
        assert_eq!(constraint.model(), "model-a");
        assert!(matches!(config, GenerationConfig::Explicit(ref o) if o.temperature.is_none()));
    }

    #[test]
    fn test_regex_constraint() {
        let engine = engine();
        let spec = ConstraintSpec::Regex("[0-9]{3}".to_string());
        let config = build_config(Some(0.0), None, Some((&spec, engine.as_ref()))).unwrap();
        assert_eq!(config.constraint().unwrap().kind(), ConstraintKind::Regex);
    }

    #[test]
    fn test_invalid_schema_error_propagates() {
        let engine = engine();
        let spec = ConstraintSpec::JsonSchema(json!("not a schema"));
        assert!(build_config(None, None, Some((&spec, engine.as_ref()))).is_err());
    }
}
