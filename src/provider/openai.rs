//! OpenAI provider: chat completions realtime plus the files/batches API.
//!
//! Requires `OPENAI_API_KEY`.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};

use crate::config::{ApiConfig, RetryConfig};
use crate::errors::ProviderError;

use super::{
    BatchMetadata, BatchResult, BatchStatus, BatchStatusInfo, Provider, RealtimeResult, registry,
    heuristic_status, require_api_key, with_backoff,
};

const BASE_URL: &str = "https://api.openai.com/v1";
const BATCH_ENDPOINT: &str = "/v1/chat/completions";
const COMPLETION_WINDOW: &str = "24h";

fn map_status(state: &str) -> BatchStatus {
    match state {
        "validating" => BatchStatus::Pending,
        "in_progress" | "finalizing" | "cancelling" => BatchStatus::Running,
        "completed" => BatchStatus::Completed,
        "failed" | "expired" => BatchStatus::Failed,
        "cancelled" => BatchStatus::Cancelled,
        other => heuristic_status(other),
    }
}

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    retry: RetryConfig,
    input_rate: f64,
    output_rate: f64,
    realtime_multiplier: f64,
}

impl OpenAiProvider {
    pub fn new(api: &ApiConfig, model: String) -> Result<Self, ProviderError> {
        let api_key = require_api_key("OPENAI_API_KEY")?;
        let (input_rate, output_rate, realtime_multiplier) = registry::rates_for("openai", &model);
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

    async fn get_json(&self, url: &str) -> Result<JsonValue, ProviderError> {
        let response = self.client.get(url).bearer_auth(&self.api_key).send().await?;
        Self::decode(response).await
    }

    async fn post_json(&self, url: &str, body: &JsonValue) -> Result<JsonValue, ProviderError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
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
            .map_err(|e| ProviderError::Api(format!("undecodable OpenAI response: {e}")))
    }

    fn chat_body(&self, prompt: &str, schema: Option<&JsonValue>) -> JsonValue {
        let mut body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": prompt}]
        });
        if let Some(schema) = schema {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {"name": "response", "schema": schema, "strict": true}
            });
        }
        body
    }

    /// Parse one line of batch output into a unit result.
    fn parse_batch_line(&self, raw: &JsonValue) -> BatchResult {
        let unit_id = raw
            .get("custom_id")
            .and_then(JsonValue::as_str)
            .unwrap_or("unknown")
            .to_string();

        if let Some(error) = raw.get("error").filter(|e| !e.is_null()) {
            return BatchResult {
                unit_id,
                content: None,
                input_tokens: 0,
                output_tokens: 0,
                error: Some(error.to_string()),
            };
        }

        let body = raw.pointer("/response/body").cloned().unwrap_or(JsonValue::Null);
        let status_code = raw
            .pointer("/response/status_code")
            .and_then(JsonValue::as_u64)
            .unwrap_or(200);
        let input_tokens = body
            .pointer("/usage/prompt_tokens")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0);
        let output_tokens = body
            .pointer("/usage/completion_tokens")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0);

        if status_code >= 400 {
            return BatchResult {
                unit_id,
                content: None,
                input_tokens,
                output_tokens,
                error: Some(format!("http_{status_code}")),
            };
        }

        let content = body
            .pointer("/choices/0/message/content")
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
impl Provider for OpenAiProvider {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn api_key_env_var(&self) -> &'static str {
        "OPENAI_API_KEY"
    }

    async fn generate_realtime(
        &self,
        prompt: &str,
        schema: Option<&JsonValue>,
    ) -> Result<RealtimeResult, ProviderError> {
        let url = format!("{BASE_URL}/chat/completions");
        let response = self.post_json(&url, &self.chat_body(prompt, schema)).await?;

        Ok(RealtimeResult {
            content: response
                .pointer("/choices/0/message/content")
                .and_then(JsonValue::as_str)
                .unwrap_or("")
                .to_string(),
            input_tokens: response
                .pointer("/usage/prompt_tokens")
                .and_then(JsonValue::as_u64)
                .unwrap_or(0),
            output_tokens: response
                .pointer("/usage/completion_tokens")
                .and_then(JsonValue::as_u64)
                .unwrap_or(0),
            finish_reason: response
                .pointer("/choices/0/finish_reason")
                .and_then(JsonValue::as_str)
                .unwrap_or("stop")
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
            "method": "POST",
            "url": BATCH_ENDPOINT,
            "body": self.chat_body(prompt, schema)
        })
    }

    async fn upload_batch_file(&self, path: &Path) -> Result<String, ProviderError> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "batch_input.jsonl".to_string());
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/jsonl")
            .map_err(|e| ProviderError::Api(format!("bad multipart: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .text("purpose", "batch")
            .part("file", part);

        let response = self
            .client
            .post(format!("{BASE_URL}/files"))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;
        let parsed = Self::decode(response).await?;
        parsed
            .get("id")
            .and_then(JsonValue::as_str)
            .map(String::from)
            .ok_or_else(|| ProviderError::Api("file upload response missing id".into()))
    }

    async fn create_batch(&self, file_id: &str) -> Result<String, ProviderError> {
        let url = format!("{BASE_URL}/batches");
        let body = json!({
            "input_file_id": file_id,
            "endpoint": BATCH_ENDPOINT,
            "completion_window": COMPLETION_WINDOW
        });
        let response =
            with_backoff(&self.retry, "openai create_batch", || self.post_json(&url, &body))
                .await?;
        response
            .get("id")
            .and_then(JsonValue::as_str)
            .map(String::from)
            .ok_or_else(|| ProviderError::Api("batch create response missing id".into()))
    }

    async fn get_batch_status(&self, batch_id: &str) -> Result<BatchStatusInfo, ProviderError> {
        let batch = self.get_json(&format!("{BASE_URL}/batches/{batch_id}")).await?;

        let provider_status = batch
            .get("status")
            .and_then(JsonValue::as_str)
            .unwrap_or("unknown")
            .to_string();
        let status = map_status(&provider_status);

        let total = batch
            .pointer("/request_counts/total")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0);
        let completed = batch
            .pointer("/request_counts/completed")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0);
        let progress = if total > 0 { Some(format!("{completed}/{total}")) } else { None };

        let error = if status == BatchStatus::Failed {
            Some(
                batch
                    .pointer("/errors/data/0/message")
                    .and_then(JsonValue::as_str)
                    .unwrap_or(&provider_status)
                    .to_string(),
            )
        } else {
            None
        };

        Ok(BatchStatusInfo {
            status,
            progress,
            error,
            provider_status,
            created_at: batch.get("created_at").and_then(JsonValue::as_u64).map(|t| t.to_string()),
            updated_at: batch
                .get("completed_at")
                .or_else(|| batch.get("in_progress_at"))
                .and_then(JsonValue::as_u64)
                .map(|t| t.to_string()),
        })
    }

    async fn download_batch_results(
        &self,
        batch_id: &str,
    ) -> Result<(Vec<BatchResult>, BatchMetadata), ProviderError> {
        let batch = self.get_json(&format!("{BASE_URL}/batches/{batch_id}")).await?;
        let status_info = self.get_batch_status(batch_id).await?;
        if !matches!(status_info.status, BatchStatus::Completed | BatchStatus::Failed) {
            return Err(ProviderError::Api(format!(
                "batch not completed, current status: {}",
                status_info.status
            )));
        }

        let output_file_id = batch
            .get("output_file_id")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| ProviderError::Api("no output file available for batch".into()))?;

        let response = self
            .client
            .get(format!("{BASE_URL}/files/{output_file_id}/content"))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
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
                    tracing::warn!("skipping undecodable OpenAI result line: {e}");
                }
            }
        }

        let metadata = BatchMetadata {
            total_input_tokens,
            total_output_tokens,
            started_at: status_info.created_at.clone(),
            completed_at: status_info.updated_at.clone(),
            provider: "openai".into(),
            model: self.model.clone(),
        };
        Ok((results, metadata))
    }

    async fn cancel_batch(&self, batch_id: &str) -> Result<bool, ProviderError> {
        let status_info = self.get_batch_status(batch_id).await?;
        if status_info.status.is_terminal() {
            return Ok(false);
        }
        self.post_json(&format!("{BASE_URL}/batches/{batch_id}/cancel"), &json!({}))
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
