//! Model registry: pricing and provider defaults from `models.yaml`.
//!
//! The registry ships embedded in the binary; `CONVEYOR_MODEL_REGISTRY`
//! can point at an external file to override it (e.g. when prices move
//! faster than releases). Pricing is consulted only for cost estimates —
//! an unknown model silently falls back to the registry defaults.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use serde::Deserialize;

use crate::config::RunMode;

const EMBEDDED_REGISTRY: &str = include_str!("models.yaml");
const REGISTRY_ENV_VAR: &str = "CONVEYOR_MODEL_REGISTRY";

#[derive(Debug, Clone, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProviderInfo {
    #[serde(default)]
    pub env_var: String,
    #[serde(default)]
    pub default_model: Option<String>,
    #[serde(default)]
    pub realtime_multiplier: Option<f64>,
    #[serde(default)]
    pub models: BTreeMap<String, ModelPricing>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryDefaults {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub realtime_multiplier: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelRegistry {
    pub defaults: RegistryDefaults,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderInfo>,
}

fn builtin_defaults() -> RegistryDefaults {
    RegistryDefaults {
        input_per_million: 1.00,
        output_per_million: 2.00,
        realtime_multiplier: 2.0,
    }
}

/// The loaded registry. Falls back to hard defaults if even the embedded
/// YAML fails to parse (which would be a packaging bug, not a run error).
pub fn registry() -> &'static ModelRegistry {
    static REGISTRY: OnceLock<ModelRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let external = std::env::var(REGISTRY_ENV_VAR)
            .ok()
            .and_then(|path| std::fs::read_to_string(path).ok());
        let source = external.as_deref().unwrap_or(EMBEDDED_REGISTRY);
        serde_yaml::from_str(source).unwrap_or(ModelRegistry {
            defaults: builtin_defaults(),
            providers: BTreeMap::new(),
        })
    })
}

pub fn provider_info(provider: &str) -> Option<&'static ProviderInfo> {
    registry().providers.get(&provider.to_lowercase())
}

pub fn default_model(provider: &str) -> Option<String> {
    provider_info(provider).and_then(|info| info.default_model.clone())
}

/// (input rate, output rate, realtime multiplier) for a provider/model,
/// falling back through the provider's default model to the registry
/// defaults.
pub fn rates_for(provider: &str, model: &str) -> (f64, f64, f64) {
    let defaults = &registry().defaults;
    let Some(info) = provider_info(provider) else {
        return (
            defaults.input_per_million,
            defaults.output_per_million,
            defaults.realtime_multiplier,
        );
    };
    let multiplier = info.realtime_multiplier.unwrap_or(defaults.realtime_multiplier);
    let pricing = info.models.get(model).or_else(|| {
        info.default_model
            .as_ref()
            .and_then(|name| info.models.get(name))
    });
    match pricing {
        Some(p) => (p.input_per_million, p.output_per_million, multiplier),
        None => (
            defaults.input_per_million,
            defaults.output_per_million,
            multiplier,
        ),
    }
}

/// Cost in USD for the given token usage. Realtime runs pay the
/// provider's realtime multiplier over batch rates.
pub fn compute_cost(
    provider: &str,
    model: &str,
    mode: RunMode,
    input_tokens: u64,
    output_tokens: u64,
) -> f64 {
    let (input_rate, output_rate, multiplier) = rates_for(provider, model);
    let multiplier = if mode == RunMode::Realtime { multiplier } else { 1.0 };
    ((input_tokens as f64 / 1_000_000.0) * input_rate
        + (output_tokens as f64 / 1_000_000.0) * output_rate)
        * multiplier
}
