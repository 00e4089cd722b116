//! Pipeline configuration model.
//!
//! A pipeline is described by a single YAML file with five sections:
//! `pipeline` (the ordered steps), `processing` (unit enumeration and
//! chunking), `prompts` (step → template file), `schemas` (step →
//! provider structured-output schema file), `validation` (step →
//! required/types/ranges/rules), and `api` (provider settings). The file
//! is snapshotted into the run directory at init so a run never depends
//! on the live config tree.

pub mod validate;

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Execution scope of a pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepScope {
    #[default]
    Chunk,
    Expression,
    Run,
}

/// One pipeline step descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub name: String,
    #[serde(default)]
    pub scope: StepScope,
    /// Template file for chunk-LLM steps; falls back to the `prompts`
    /// section keyed by step name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_template: Option<String>,
    /// Per-step provider override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    /// Per-step model override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Expression steps: bindings evaluated once before the first
    /// iteration, in declaration order.
    #[serde(default, skip_serializing_if = "serde_yaml::Mapping::is_empty")]
    pub init: serde_yaml::Mapping,
    /// Expression steps: the loop body, evaluated in declaration order
    /// once per iteration with results bound back into the namespace.
    #[serde(default, skip_serializing_if = "serde_yaml::Mapping::is_empty")]
    pub expressions: serde_yaml::Mapping,
    /// Expression steps: loop terminates when this becomes truthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_until: Option<String>,
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
}

fn default_max_iterations() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSection {
    #[serde(default)]
    pub name: String,
    pub steps: Vec<StepConfig>,
}

/// Unit enumeration strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    Permutation,
    CrossProduct,
    Direct,
}

/// A position in the enumeration. Permutation positions are bare names;
/// cross-product positions name the item list they draw from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PositionConfig {
    Name(String),
    Sourced { name: String, source_key: String },
}

impl PositionConfig {
    pub fn name(&self) -> &str {
        match self {
            PositionConfig::Name(name) => name,
            PositionConfig::Sourced { name, .. } => name,
        }
    }

    pub fn source_key(&self) -> Option<&str> {
        match self {
            PositionConfig::Name(_) => None,
            PositionConfig::Sourced { source_key, .. } => Some(source_key),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemsConfig {
    /// Path to the items YAML, relative to the config file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Key of the item list inside the items file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    #[serde(default)]
    pub strategy: Strategy,
    pub chunk_size: usize,
    #[serde(default)]
    pub positions: Vec<PositionConfig>,
    pub items: ItemsConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_units: Option<u64>,
    #[serde(default)]
    pub seed: u64,
    /// Fraction of a chunk's units that must already be validated for a
    /// step to be considered done on resume (absent a `.bak` sentinel).
    #[serde(default = "default_resume_coverage")]
    pub resume_coverage_threshold: f64,
}

fn default_resume_coverage() -> f64 {
    0.9
}

/// Backoff settings for batch creation and realtime retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay")]
    pub initial_delay_seconds: f64,
    #[serde(default = "default_retry_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_retry_attempts() -> u32 {
    5
}
fn default_retry_delay() -> f64 {
    30.0
}
fn default_retry_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            initial_delay_seconds: default_retry_delay(),
            backoff_multiplier: default_retry_multiplier(),
        }
    }
}

/// Run mode: asynchronous provider batches, or per-unit synchronous calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Batch,
    Realtime,
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunMode::Batch => write!(f, "batch"),
            RunMode::Realtime => write!(f, "realtime"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub mode: RunMode,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    #[serde(default = "default_max_inflight")]
    pub max_inflight_batches: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds between realtime calls.
    #[serde(default = "default_call_delay")]
    pub delay_between_calls: f64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    #[serde(default = "default_subprocess_timeout")]
    pub subprocess_timeout_seconds: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_provider() -> String {
    "gemini".to_string()
}
fn default_poll_interval() -> u64 {
    30
}
fn default_max_inflight() -> usize {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_call_delay() -> f64 {
    0.5
}
fn default_request_timeout() -> u64 {
    120
}
fn default_subprocess_timeout() -> u64 {
    600
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            mode: RunMode::default(),
            poll_interval: default_poll_interval(),
            max_inflight_batches: default_max_inflight(),
            max_retries: default_max_retries(),
            delay_between_calls: default_call_delay(),
            request_timeout_seconds: default_request_timeout(),
            subprocess_timeout_seconds: default_subprocess_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

/// A validation rule: `expr` must evaluate truthy, gated by `when`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    pub expr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Per-step schema + rules, keyed by step name in the `validation` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepValidation {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub types: BTreeMap<String, String>,
    #[serde(default)]
    pub ranges: BTreeMap<String, [f64; 2]>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// The full pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub pipeline: PipelineSection,
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub prompts: BTreeMap<String, String>,
    #[serde(default)]
    pub schemas: BTreeMap<String, String>,
    #[serde(default)]
    pub validation: BTreeMap<String, StepValidation>,
    #[serde(default)]
    pub api: ApiConfig,
}

impl PipelineConfig {
    /// Load and parse a pipeline config YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: PipelineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config YAML: {}", path.display()))?;
        Ok(config)
    }

    /// Ordered names of the chunk-state-machine steps (chunk + expression
    /// scope). Run-scope steps execute after all chunks validate and are
    /// not part of chunk states.
    pub fn chunk_scope_steps(&self) -> Vec<&StepConfig> {
        self.pipeline
            .steps
            .iter()
            .filter(|s| matches!(s.scope, StepScope::Chunk | StepScope::Expression))
            .collect()
    }

    pub fn chunk_scope_step_names(&self) -> Vec<String> {
        self.chunk_scope_steps()
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn run_scope_steps(&self) -> Vec<&StepConfig> {
        self.pipeline
            .steps
            .iter()
            .filter(|s| s.scope == StepScope::Run)
            .collect()
    }

    pub fn step(&self, name: &str) -> Option<&StepConfig> {
        self.pipeline.steps.iter().find(|s| s.name == name)
    }

    /// Template file name for a chunk-LLM step: the step's own
    /// `prompt_template`, else the `prompts` section entry.
    pub fn template_for<'a>(&'a self, step: &'a StepConfig) -> Option<&'a str> {
        step.prompt_template
            .as_deref()
            .or_else(|| self.prompts.get(&step.name).map(String::as_str))
    }

    /// Structured-output schema file for a step, if configured.
    pub fn schema_file_for(&self, step_name: &str) -> Option<&str> {
        self.schemas.get(step_name).map(String::as_str)
    }

    pub fn validation_for(&self, step_name: &str) -> StepValidation {
        self.validation.get(step_name).cloned().unwrap_or_default()
    }

    pub fn has_llm_steps(&self) -> bool {
        self.pipeline
            .steps
            .iter()
            .any(|s| s.scope == StepScope::Chunk)
    }
}

#[cfg(test)]
pub(crate) fn sample_config_yaml() -> &'static str {
    r#"
pipeline:
  name: npc-dialog
  steps:
    - name: generate
      prompt_template: generate.jinja2
    - name: score
      prompt_template: score.jinja2
    - name: sim
      scope: expression
      init:
        x: "0"
      expressions:
        x: "x + 1"
      loop_until: "x >= 3"
      max_iterations: 10
    - name: rollup
      scope: run
      expressions:
        total: "len(units)"
processing:
  strategy: cross_product
  chunk_size: 2
  positions:
    - name: npc
      source_key: npcs
    - name: mood
      source_key: moods
  items:
    source: items.yaml
    key: npcs
validation:
  generate:
    required: [dialog]
    types:
      dialog: string
    rules:
      - name: nonempty
        expr: "len(dialog) > 0"
api:
  provider: gemini
  model: gemini-2.0-flash-001
  max_retries: 3
"#
}
