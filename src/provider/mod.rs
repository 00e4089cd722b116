//! Provider port: a uniform interface over the supported LLM providers.
//!
//! The engine sees eight operations — one synchronous call plus the batch
//! submit/poll/collect/cancel set — and three normalised error kinds
//! (rate-limit, authentication, other). Everything provider-specific
//! lives behind this port so Gemini/OpenAI/Anthropic are swappable
//! plug-ins.
//!
//! Provider status codes are normalised in two tiers: an exact static map
//! per provider, then a substring heuristic for codes the map has never
//! seen. The heuristic keeps the engine alive across provider version
//! drift; an unknown code is treated as still running.

pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod registry;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::config::{ApiConfig, RetryConfig, StepConfig};
use crate::errors::ProviderError;

/// Normalised status of a provider batch job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Detailed status for a batch job.
#[derive(Debug, Clone)]
pub struct BatchStatusInfo {
    pub status: BatchStatus,
    /// e.g. "45/100"
    pub progress: Option<String>,
    pub error: Option<String>,
    /// Raw provider status code, for diagnostics.
    pub provider_status: String,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// One unit's result from a collected batch.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub unit_id: String,
    pub content: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub error: Option<String>,
}

/// Batch-level metadata from a collect.
#[derive(Debug, Clone, Default)]
pub struct BatchMetadata {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub provider: String,
    pub model: String,
}

/// Result of one realtime call.
#[derive(Debug, Clone)]
pub struct RealtimeResult {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub finish_reason: String,
}

/// The port every provider implements.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &'static str;

    fn model(&self) -> &str;

    fn api_key_env_var(&self) -> &'static str;

    /// Single synchronous request.
    async fn generate_realtime(
        &self,
        prompt: &str,
        schema: Option<&JsonValue>,
    ) -> Result<RealtimeResult, ProviderError>;

    /// Format one unit as a line of the provider's batch-input JSONL.
    fn format_batch_request(
        &self,
        unit_id: &str,
        prompt: &str,
        schema: Option<&JsonValue>,
    ) -> JsonValue;

    /// Upload a batch-input file. Providers whose batch endpoint accepts
    /// inline requests return the path unchanged.
    async fn upload_batch_file(&self, path: &Path) -> Result<String, ProviderError>;

    /// Create a batch job. Retries rate-limit/transient errors with
    /// exponential backoff internally.
    async fn create_batch(&self, file_id: &str) -> Result<String, ProviderError>;

    async fn get_batch_status(&self, batch_id: &str) -> Result<BatchStatusInfo, ProviderError>;

    async fn download_batch_results(
        &self,
        batch_id: &str,
    ) -> Result<(Vec<BatchResult>, BatchMetadata), ProviderError>;

    /// Cancel a running batch. Returns false if it was already terminal.
    async fn cancel_batch(&self, batch_id: &str) -> Result<bool, ProviderError>;

    /// Estimated USD cost for the given token usage.
    fn estimate_cost(&self, input_tokens: u64, output_tokens: u64, is_batch: bool) -> f64;
}

/// Substring fallback for provider status codes absent from the static
/// maps. Unknown codes are treated as still running.
pub fn heuristic_status(raw: &str) -> BatchStatus {
    let upper = raw.to_uppercase();
    if upper.contains("SUCCEEDED") || upper.contains("COMPLETED") || upper.contains("ENDED") {
        BatchStatus::Completed
    } else if upper.contains("CANCELL") || upper.contains("CANCELED") {
        BatchStatus::Cancelled
    } else if upper.contains("FAILED") || upper.contains("EXPIRED") {
        BatchStatus::Failed
    } else if upper.contains("PENDING") || upper.contains("QUEUED") || upper.contains("VALIDATING")
    {
        BatchStatus::Pending
    } else {
        BatchStatus::Running
    }
}

/// Run `op`, retrying rate-limit/transient errors with exponential
/// backoff up to `retry.max_attempts`.
pub(crate) async fn with_backoff<T, F, Fut>(
    retry: &RetryConfig,
    what: &str,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    let mut delay = retry.initial_delay_seconds.max(0.0);
    let attempts = retry.max_attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < attempts => {
                tracing::warn!(
                    attempt,
                    max_attempts = attempts,
                    wait_seconds = delay,
                    "{what} hit a retryable error: {e}"
                );
                tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
                delay *= retry.backoff_multiplier.max(1.0);
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| ProviderError::Api(format!("{what} failed after retries"))))
}

/// Build the provider configured in the `api` section.
pub fn get_provider(api: &ApiConfig) -> Result<Arc<dyn Provider>, ProviderError> {
    provider_for(&api.provider, api.model.as_deref(), api)
}

/// Build the provider for a step, honouring per-step overrides.
pub fn get_step_provider(
    api: &ApiConfig,
    step: &StepConfig,
) -> Result<Arc<dyn Provider>, ProviderError> {
    let provider_name = step.provider.as_deref().unwrap_or(&api.provider);
    let model = step.model.as_deref().or(api.model.as_deref());
    provider_for(provider_name, model, api)
}

fn provider_for(
    name: &str,
    model: Option<&str>,
    api: &ApiConfig,
) -> Result<Arc<dyn Provider>, ProviderError> {
    let name = name.to_lowercase();
    let model = model
        .map(String::from)
        .or_else(|| registry::default_model(&name))
        .ok_or_else(|| ProviderError::Api(format!("no model configured for provider '{name}'")))?;

    match name.as_str() {
        "gemini" => Ok(Arc::new(gemini::GeminiProvider::new(api, model)?)),
        "openai" => Ok(Arc::new(openai::OpenAiProvider::new(api, model)?)),
        "anthropic" => Ok(Arc::new(anthropic::AnthropicProvider::new(api, model)?)),
        other => Err(ProviderError::Api(format!("unknown provider '{other}'"))),
    }
}

/// Fetch the provider's API key from the environment, or fail the run.
pub(crate) fn require_api_key(env_var: &'static str) -> Result<String, ProviderError> {
    match std::env::var(env_var) {
        Ok(key) if !key.is_empty() => Ok(key),
        _ => Err(ProviderError::Authentication(format!(
            "{env_var} environment variable not set"
        ))),
    }
}

pub(crate) fn http_client(api: &ApiConfig) -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(api.request_timeout_seconds))
        .build()
        .map_err(ProviderError::Http)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heuristic_normalises_common_spellings() {
        assert_eq!(heuristic_status("JOB_STATE_SUCCEEDED"), BatchStatus::Completed);
        assert_eq!(heuristic_status("batch_completed"), BatchStatus::Completed);
        assert_eq!(heuristic_status("SOMETHING_FAILED"), BatchStatus::Failed);
        assert_eq!(heuristic_status("expired"), BatchStatus::Failed);
        assert_eq!(heuristic_status("CANCELLED"), BatchStatus::Cancelled);
        assert_eq!(heuristic_status("canceling"), BatchStatus::Cancelled);
        assert_eq!(heuristic_status("QUEUED"), BatchStatus::Pending);
        assert_eq!(heuristic_status("validating"), BatchStatus::Pending);
        assert_eq!(heuristic_status("in_progress"), BatchStatus::Running);
    }

    #[test]
    fn heuristic_treats_unknown_as_running() {
        assert_eq!(heuristic_status("SOME_NEW_STATE"), BatchStatus::Running);
    }

    #[test]
    fn batch_status_terminality() {
        assert!(BatchStatus::Completed.is_terminal());
        assert!(BatchStatus::Failed.is_terminal());
        assert!(BatchStatus::Cancelled.is_terminal());
        assert!(!BatchStatus::Pending.is_terminal());
        assert!(!BatchStatus::Running.is_terminal());
    }

    #[tokio::test]
    async fn with_backoff_returns_first_success() {
        let retry = RetryConfig {
            max_attempts: 3,
            initial_delay_seconds: 0.0,
            backoff_multiplier: 1.0,
        };
        let mut calls = 0;
        let result: Result<u32, _> = with_backoff(&retry, "test", || {
            calls += 1;
            let attempt = calls;
            async move {
                if attempt < 2 {
                    Err(ProviderError::RateLimit("slow down".into()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn with_backoff_gives_up_after_max_attempts() {
        let retry = RetryConfig {
            max_attempts: 2,
            initial_delay_seconds: 0.0,
            backoff_multiplier: 1.0,
        };
        let result: Result<(), _> = with_backoff(&retry, "test", || async {
            Err(ProviderError::RateLimit("always".into()))
        })
        .await;
        assert!(matches!(result.unwrap_err(), ProviderError::RateLimit(_)));
    }

    #[tokio::test]
    async fn with_backoff_does_not_retry_fatal_errors() {
        let retry = RetryConfig {
            max_attempts: 5,
            initial_delay_seconds: 0.0,
            backoff_multiplier: 1.0,
        };
        let mut calls = 0;
        let result: Result<(), _> = with_backoff(&retry, "test", || {
            calls += 1;
            async { Err(ProviderError::Authentication("bad key".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn unknown_provider_rejected() {
        let api = ApiConfig {
            provider: "cohere".into(),
            model: Some("m".into()),
            ..ApiConfig::default()
        };
        assert!(get_provider(&api).is_err());
    }
}
