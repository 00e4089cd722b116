//! Anthropic provider: the Messages API and its inline batch endpoint.
//!
//! Anthropic's batch endpoint takes requests inline rather than by file
//! reference, so `upload_batch_file` is a no-op returning the path; the
//! file is read and inlined at `create_batch` time.
//!
//! Requires `ANTHROPIC_API_KEY`.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};

use crate::config::{ApiConfig, RetryConfig};
use crate::errors::ProviderError;

use super::{
    BatchMetadata, BatchResult, BatchStatus, BatchStatusInfo, Provider, RealtimeResult, registry,
    heuristic_status, require_api_key, with_backoff,
};

const BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u64 = 4096;

fn map_status(state: &str) -> BatchStatus {
    match state {
        "in_progress" | "canceling" => BatchStatus::Running,
        "ended" => BatchStatus::Completed,
        other => heuristic_status(other),
    }
}

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    retry: RetryConfig,
    input_rate: f64,
    output_rate: f64,
    realtime_multiplier: f64,
}

impl AnthropicProvider {
    pub fn new(api: &ApiConfig, model: String) -> Result<Self, ProviderError> {
        let api_key = require_api_key("ANTHROPIC_API_KEY")?;
        let (input_rate, output_rate, realtime_multiplier) =
            registry::rates_for("anthropic", &model);
        Ok(Self {
            client: super::http_client(api)?,
            api_key,
            model,
            retry: api.retry.clone(),
            input_rate,
            output_rate,
            realtime_multiplier,
        })
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
    }

    async fn get_json(&self, url: &str) -> Result<JsonValue, ProviderError> {
        let response = self.request(reqwest::Method::GET, url).send().await?;
        Self::decode(response).await
    }

    async fn post_json(&self, url: &str, body: &JsonValue) -> Result<JsonValue, ProviderError> {
        let response = self
            .request(reqwest::Method::POST, url)
            .json(body)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode(response: reqwest::Response) -> Result<JsonValue, ProviderError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(ProviderError::from_status(status.as_u16(), &body));
        }
        serde_json::from_str(&body)
            .map_err(|e| ProviderError::Api(format!("undecodable Anthropic response: {e}")))
    }

    fn message_params(&self, prompt: &str, schema: Option<&JsonValue>) -> JsonValue {
        // No structured-output parameter on this endpoint; the schema is
        // folded into the prompt as a formatting instruction.
        let content = match schema {
            Some(schema) => format!(
                "{prompt}\n\nRespond with JSON matching this schema:\n{schema}"
            ),
            None => prompt.to_string(),
        };
        json!({
            "model": self.model,
            "max_tokens": DEFAULT_MAX_TOKENS,
            "messages": [{"role": "user", "content": content}]
        })
    }

    /// Parse one line of batch results into a unit result.
    fn parse_batch_line(&self, raw: &JsonValue) -> BatchResult {
        let unit_id = raw
            .get("custom_id")
            .and_then(JsonValue::as_str)
            .unwrap_or("unknown")
            .to_string();

        let result_type = raw
            .pointer("/result/type")
            .and_then(JsonValue::as_str)
            .unwrap_or("errored");
        let message = raw.pointer("/result/message").cloned().unwrap_or(JsonValue::Null);

        let input_tokens = message
            .pointer("/usage/input_tokens")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0);
        let output_tokens = message
            .pointer("/usage/output_tokens")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0);

        if result_type != "succeeded" {
            let detail = raw
                .pointer("/result/error/error/message")
                .or_else(|| raw.pointer("/result/error/message"))
                .and_then(JsonValue::as_str)
                .unwrap_or(result_type);
            return BatchResult {
                unit_id,
                content: None,
                input_tokens,
                output_tokens,
                error: Some(detail.to_string()),
            };
        }

        let content = message
            .pointer("/content/0/text")
            .and_then(JsonValue::as_str)
            .unwrap_or("");
        if content.is_empty() {
            BatchResult {
                unit_id,
                content: None,
                input_tokens,
                output_tokens,
                error: Some("empty_response".to_string()),
            }
        } else {
            BatchResult {
                unit_id,
                content: Some(content.to_string()),
                input_tokens,
                output_tokens,
                error: None,
            }
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn api_key_env_var(&self) -> &'static str {
        "ANTHROPIC_API_KEY"
    }

    async fn generate_realtime(
        &self,
        prompt: &str,
        schema: Option<&JsonValue>,
    ) -> Result<RealtimeResult, ProviderError> {
        let url = format!("{BASE_URL}/messages");
        let response = self.post_json(&url, &self.message_params(prompt, schema)).await?;

        Ok(RealtimeResult {
            content: response
                .pointer("/content/0/text")
                .and_then(JsonValue::as_str)
                .unwrap_or("")
                .to_string(),
            input_tokens: response
                .pointer("/usage/input_tokens")
                .and_then(JsonValue::as_u64)
                .unwrap_or(0),
            output_tokens: response
                .pointer("/usage/output_tokens")
                .and_then(JsonValue::as_u64)
                .unwrap_or(0),
            finish_reason: response
                .get("stop_reason")
                .and_then(JsonValue::as_str)
                .unwrap_or("end_turn")
                .to_string(),
        })
    }

    fn format_batch_request(
        &self,
        unit_id: &str,
        prompt: &str,
        schema: Option<&JsonValue>,
    ) -> JsonValue {
        json!({
            "custom_id": unit_id,
            "params": self.message_params(prompt, schema)
        })
    }

    /// Inline batch endpoint: nothing to upload.
    async fn upload_batch_file(&self, path: &Path) -> Result<String, ProviderError> {
        Ok(path.to_string_lossy().into_owned())
    }

    async fn create_batch(&self, file_id: &str) -> Result<String, ProviderError> {
        let content = tokio::fs::read_to_string(file_id).await?;
        let mut requests = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let request: JsonValue = serde_json::from_str(line)
                .map_err(|e| ProviderError::Api(format!("bad batch input line: {e}")))?;
            requests.push(request);
        }

        let url = format!("{BASE_URL}/messages/batches");
        let body = json!({"requests": requests});
        let response =
            with_backoff(&self.retry, "anthropic create_batch", || self.post_json(&url, &body))
                .await?;
        response
            .get("id")
            .and_then(JsonValue::as_str)
            .map(String::from)
            .ok_or_else(|| ProviderError::Api("batch create response missing id".into()))
    }

    async fn get_batch_status(&self, batch_id: &str) -> Result<BatchStatusInfo, ProviderError> {
        let batch = self.get_json(&format!("{BASE_URL}/messages/batches/{batch_id}")).await?;

        let provider_status = batch
            .get("processing_status")
            .and_then(JsonValue::as_str)
            .unwrap_or("unknown")
            .to_string();
        let mut status = map_status(&provider_status);

        let succeeded = batch
            .pointer("/request_counts/succeeded")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0);
        let errored = batch
            .pointer("/request_counts/errored")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0);
        let processing = batch
            .pointer("/request_counts/processing")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0);
        let total = succeeded + errored + processing;

        // a batch that ended with nothing succeeded is a failure
        if status == BatchStatus::Completed && succeeded == 0 && errored > 0 {
            status = BatchStatus::Failed;
        }

        let progress = if total > 0 {
            Some(format!("{}/{total}", succeeded + errored))
        } else {
            None
        };
        let error = if status == BatchStatus::Failed {
            Some(format!("{errored} request(s) errored"))
        } else {
            None
        };

        Ok(BatchStatusInfo {
            status,
            progress,
            error,
            provider_status,
            created_at: batch.get("created_at").and_then(JsonValue::as_str).map(String::from),
            updated_at: batch.get("ended_at").and_then(JsonValue::as_str).map(String::from),
        })
    }

    async fn download_batch_results(
        &self,
        batch_id: &str,
    ) -> Result<(Vec<BatchResult>, BatchMetadata), ProviderError> {
        let status_info = self.get_batch_status(batch_id).await?;
        if !matches!(status_info.status, BatchStatus::Completed | BatchStatus::Failed) {
            return Err(ProviderError::Api(format!(
                "batch not completed, current status: {}",
                status_info.status
            )));
        }

        let batch = self.get_json(&format!("{BASE_URL}/messages/batches/{batch_id}")).await?;
        let results_url = batch
            .get("results_url")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| ProviderError::Api("no results available for batch".into()))?;

        let response = self.request(reqwest::Method::GET, results_url).send().await?;
        let status = response.status();
        let content = response.text().await?;
        if !status.is_success() {
            return Err(ProviderError::from_status(status.as_u16(), &content));
        }

        let mut results = Vec::new();
        let mut total_input_tokens = 0;
        let mut total_output_tokens = 0;
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<JsonValue>(line) {
                Ok(raw) => {
                    let result = self.parse_batch_line(&raw);
                    total_input_tokens += result.input_tokens;
                    total_output_tokens += result.output_tokens;
                    results.push(result);
                }
                Err(e) => {
                    tracing::warn!("skipping undecodable Anthropic result line: {e}");
                }
            }
        }

        let metadata = BatchMetadata {
            total_input_tokens,
            total_output_tokens,
            started_at: status_info.created_at.clone(),
            completed_at: status_info.updated_at.clone(),
            provider: "anthropic".into(),
            model: self.model.clone(),
        };
        Ok((results, metadata))
    }

    async fn cancel_batch(&self, batch_id: &str) -> Result<bool, ProviderError> {
        let status_info = self.get_batch_status(batch_id).await?;
        if status_info.status.is_terminal() {
            return Ok(false);
        }
        self.post_json(
            &format!("{BASE_URL}/messages/batches/{batch_id}/cancel"),
            &json!({}),
        )
        .await?;
        Ok(true)
    }

    fn estimate_cost(&self, input_tokens: u64, output_tokens: u64, is_batch: bool) -> f64 {
        let multiplier = if is_batch { 1.0 } else { self.realtime_multiplier };
        ((input_tokens as f64 / 1_000_000.0) * self.input_rate
            + (output_tokens as f64 / 1_000_000.0) * self.output_rate)
            * multiplier
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> AnthropicProvider {
        AnthropicProvider {
            client: reqwest::Client::new(),
            api_key: "test-key".into(),
            model: "claude-3-5-haiku-20241022".into(),
            retry: RetryConfig::default(),
            input_rate: 0.40,
            output_rate: 2.00,
            realtime_multiplier: 2.0,
        }
    }

    #[test]
    fn status_map_covers_processing_states() {
        assert_eq!(map_status("in_progress"), BatchStatus::Running);
        assert_eq!(map_status("canceling"), BatchStatus::Running);
        assert_eq!(map_status("ended"), BatchStatus::Completed);
    }

    #[test]
    fn format_batch_request_inlines_params() {
        let request = provider().format_batch_request("u1", "hello", None);
        assert_eq!(request["custom_id"], "u1");
        assert_eq!(request["params"]["messages"][0]["content"], "hello");
        assert_eq!(request["params"]["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn schema_is_folded_into_prompt() {
        let schema = json!({"type": "object"});
        let request = provider().format_batch_request("u1", "hello", Some(&schema));
        let content = request["params"]["messages"][0]["content"].as_str().unwrap();
        assert!(content.starts_with("hello"));
        assert!(content.contains("schema"));
    }

    #[tokio::test]
    async fn upload_is_a_no_op_returning_the_path() {
        let file_id = provider()
            .upload_batch_file(Path::new("/tmp/batch_input.jsonl"))
            .await
            .unwrap();
        assert_eq!(file_id, "/tmp/batch_input.jsonl");
    }

    #[test]
    fn parse_batch_line_success() {
        let raw = json!({
            "custom_id": "u1",
            "result": {
                "type": "succeeded",
                "message": {
                    "content": [{"type": "text", "text": "{\"y\": 2}"}],
                    "usage": {"input_tokens": 11, "output_tokens": 4}
                }
            }
        });
        let result = provider().parse_batch_line(&raw);
        assert_eq!(result.content.as_deref(), Some("{\"y\": 2}"));
        assert_eq!(result.input_tokens, 11);
        assert_eq!(result.output_tokens, 4);
    }

    #[test]
    fn parse_batch_line_errored() {
        let raw = json!({
            "custom_id": "u2",
            "result": {
                "type": "errored",
                "error": {"error": {"message": "overloaded"}}
            }
        });
        let result = provider().parse_batch_line(&raw);
        assert_eq!(result.error.as_deref(), Some("overloaded"));
    }

    #[test]
    fn parse_batch_line_expired_uses_type_as_error() {
        let raw = json!({"custom_id": "u3", "result": {"type": "expired"}});
        let result = provider().parse_batch_line(&raw);
        assert_eq!(result.error.as_deref(), Some("expired"));
    }
}
