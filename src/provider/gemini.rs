//! Gemini provider: Google's generative language API, batch and realtime.
//!
//! Requires `GOOGLE_API_KEY`.

use std::path::Path;

use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};

use crate::config::{ApiConfig, RetryConfig};
use crate::errors::ProviderError;

use super::{
    BatchMetadata, BatchResult, BatchStatus, BatchStatusInfo, Provider, RealtimeResult, registry,
    heuristic_status, require_api_key, with_backoff,
};

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const UPLOAD_URL: &str = "https://generativelanguage.googleapis.com/upload/v1beta/files";

/// Exact map from Gemini job states to the normalised enum; codes not
/// listed here fall through to the substring heuristic.
fn map_status(state: &str) -> BatchStatus {
    match state {
        "JOB_STATE_PENDING" | "JOB_STATE_QUEUED" => BatchStatus::Pending,
        "JOB_STATE_RUNNING" | "JOB_STATE_CANCELLING" => BatchStatus::Running,
        "JOB_STATE_SUCCEEDED" => BatchStatus::Completed,
        "JOB_STATE_FAILED" => BatchStatus::Failed,
        "JOB_STATE_CANCELLED" => BatchStatus::Cancelled,
        other => heuristic_status(other),
    }
}

pub struct GeminiProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    retry: RetryConfig,
    input_rate: f64,
    output_rate: f64,
    realtime_multiplier: f64,
}

impl GeminiProvider {
    pub fn new(api: &ApiConfig, model: String) -> Result<Self, ProviderError> {
        let api_key = require_api_key("GOOGLE_API_KEY")?;
        let (input_rate, output_rate, realtime_multiplier) = registry::rates_for("gemini", &model);
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
        let response = self
            .client
            .get(url)
            .header("x-goog-api-key", &self.api_key)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn post_json(&self, url: &str, body: &JsonValue) -> Result<JsonValue, ProviderError> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
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
            .map_err(|e| ProviderError::Api(format!("undecodable Gemini response: {e}")))
    }

    /// Parse one line of batch output into a unit result.
    fn parse_batch_line(&self, raw: &JsonValue) -> BatchResult {
        let unit_id = raw
            .get("key")
            .and_then(JsonValue::as_str)
            .unwrap_or("unknown")
            .to_string();
        let response = raw.get("response").cloned().unwrap_or(JsonValue::Null);

        let usage = response.get("usageMetadata");
        let input_tokens = usage
            .and_then(|u| u.get("promptTokenCount"))
            .and_then(JsonValue::as_u64)
            .unwrap_or(0);
        let output_tokens = usage
            .and_then(|u| u.get("candidatesTokenCount"))
            .and_then(JsonValue::as_u64)
            .unwrap_or(0);

        if let Some(error) = raw.get("error") {
            return BatchResult {
                unit_id,
                content: None,
                input_tokens,
                output_tokens,
                error: Some(error.to_string()),
            };
        }

        let candidates = response
            .get("candidates")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default();
        let (content, error) = if candidates.is_empty() {
            let block_reason = response
                .pointer("/promptFeedback/blockReason")
                .and_then(JsonValue::as_str);
            match block_reason {
                Some(reason) => (None, Some(format!("safety_filter: {reason}"))),
                None => (None, Some("no_response".to_string())),
            }
        } else {
            let candidate = &candidates[0];
            let finish_reason = candidate
                .get("finishReason")
                .and_then(JsonValue::as_str)
                .unwrap_or("");
            if !finish_reason.is_empty() && finish_reason != "STOP" && finish_reason != "MAX_TOKENS"
            {
                (None, Some(format!("finish_reason: {finish_reason}")))
            } else {
                let text = candidate
                    .pointer("/content/parts/0/text")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("");
                if text.is_empty() {
                    (None, Some("empty_response".to_string()))
                } else {
                    (Some(text.to_string()), None)
                }
            }
        };

        BatchResult {
            unit_id,
            content,
            input_tokens,
            output_tokens,
            error,
        }
    }
}

#[async_trait]
impl Provider for GeminiProvider {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn api_key_env_var(&self) -> &'static str {
        "GOOGLE_API_KEY"
    }

    async fn generate_realtime(
        &self,
        prompt: &str,
        schema: Option<&JsonValue>,
    ) -> Result<RealtimeResult, ProviderError> {
        let url = format!("{BASE_URL}/models/{}:generateContent", self.model);
        let mut body = json!({
            "contents": [{"parts": [{"text": prompt}]}]
        });
        if let Some(schema) = schema {
            body["generationConfig"] = json!({
                "responseMimeType": "application/json",
                "responseSchema": schema,
            });
        }

        let response = self.post_json(&url, &body).await?;

        let content = response
            .pointer("/candidates/0/content/parts/0/text")
            .and_then(JsonValue::as_str)
            .unwrap_or("")
            .to_string();
        let input_tokens = response
            .pointer("/usageMetadata/promptTokenCount")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0);
        let output_tokens = response
            .pointer("/usageMetadata/candidatesTokenCount")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0);
        let finish_reason = response
            .pointer("/candidates/0/finishReason")
            .and_then(JsonValue::as_str)
            .unwrap_or("STOP")
            .to_string();

        Ok(RealtimeResult {
            content,
            input_tokens,
            output_tokens,
            finish_reason,
        })
    }

    fn format_batch_request(
        &self,
        unit_id: &str,
        prompt: &str,
        schema: Option<&JsonValue>,
    ) -> JsonValue {
        let mut request = json!({
            "contents": [{"parts": [{"text": prompt}]}]
        });
        if let Some(schema) = schema {
            request["generationConfig"] = json!({
                "responseMimeType": "application/json",
                "responseSchema": schema,
            });
        }
        json!({"key": unit_id, "request": request})
    }

    async fn upload_batch_file(&self, path: &Path) -> Result<String, ProviderError> {
        let bytes = tokio::fs::read(path).await?;
        let response = self
            .client
            .post(UPLOAD_URL)
            .header("x-goog-api-key", &self.api_key)
            .header("X-Goog-Upload-Protocol", "raw")
            .header("Content-Type", "application/json")
            .body(bytes)
            .send()
            .await?;
        let parsed = Self::decode(response).await?;
        parsed
            .pointer("/file/name")
            .or_else(|| parsed.get("name"))
            .and_then(JsonValue::as_str)
            .map(String::from)
            .ok_or_else(|| ProviderError::Api("upload response missing file name".into()))
    }

    async fn create_batch(&self, file_id: &str) -> Result<String, ProviderError> {
        let url = format!("{BASE_URL}/models/{}:batchGenerateContent", self.model);
        let body = json!({
            "batch": {
                "displayName": format!("conveyor-{}", self.model),
                "inputConfig": {"fileName": file_id}
            }
        });
        let response =
            with_backoff(&self.retry, "gemini create_batch", || self.post_json(&url, &body)).await?;
        response
            .get("name")
            .and_then(JsonValue::as_str)
            .map(String::from)
            .ok_or_else(|| ProviderError::Api("batch create response missing name".into()))
    }

    async fn get_batch_status(&self, batch_id: &str) -> Result<BatchStatusInfo, ProviderError> {
        let url = format!("{BASE_URL}/{batch_id}");
        let batch = self.get_json(&url).await?;

        let provider_status = batch
            .pointer("/metadata/state")
            .or_else(|| batch.get("state"))
            .and_then(JsonValue::as_str)
            .unwrap_or("UNKNOWN")
            .to_string();
        let status = map_status(&provider_status);

        let total = batch
            .pointer("/metadata/batchStats/requestCount")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0);
        let completed = batch
            .pointer("/metadata/batchStats/completedRequestCount")
            .and_then(JsonValue::as_u64)
            .unwrap_or(0);
        let progress = if total > 0 { Some(format!("{completed}/{total}")) } else { None };

        let error = if status == BatchStatus::Failed {
            Some(
                batch
                    .pointer("/error/message")
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
            created_at: batch
                .pointer("/metadata/createTime")
                .and_then(JsonValue::as_str)
                .map(String::from),
            updated_at: batch
                .pointer("/metadata/updateTime")
                .and_then(JsonValue::as_str)
                .map(String::from),
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

        let batch = self.get_json(&format!("{BASE_URL}/{batch_id}")).await?;
        let output_file = batch
            .pointer("/response/responsesFile")
            .or_else(|| batch.pointer("/dest/fileName"))
            .and_then(JsonValue::as_str)
            .ok_or_else(|| ProviderError::Api("no output file available for batch".into()))?;

        let download_url = format!("{BASE_URL}/{output_file}:download?alt=media");
        let response = self
            .client
            .get(&download_url)
            .header("x-goog-api-key", &self.api_key)
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
                    tracing::warn!("skipping undecodable Gemini result line: {e}");
                }
            }
        }

        let metadata = BatchMetadata {
            total_input_tokens,
            total_output_tokens,
            started_at: status_info.created_at.clone(),
            completed_at: status_info.updated_at.clone(),
            provider: "gemini".into(),
            model: self.model.clone(),
        };
        Ok((results, metadata))
    }

    async fn cancel_batch(&self, batch_id: &str) -> Result<bool, ProviderError> {
        let status_info = self.get_batch_status(batch_id).await?;
        if status_info.status.is_terminal() {
            return Ok(false);
        }
        let url = format!("{BASE_URL}/{batch_id}:cancel");
        match self.post_json(&url, &json!({})).await {
            Ok(_) => Ok(true),
            Err(ProviderError::Api(message))
                if message.contains("CANCELLED") || message.contains("COMPLETED") =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
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

    fn provider() -> GeminiProvider {
        GeminiProvider {
            client: reqwest::Client::new(),
            api_key: "test-key".into(),
            model: "gemini-2.0-flash-001".into(),
            retry: RetryConfig::default(),
            input_rate: 0.075,
            output_rate: 0.30,
            realtime_multiplier: 2.0,
        }
    }

    #[test]
    fn status_map_covers_job_states() {
        assert_eq!(map_status("JOB_STATE_PENDING"), BatchStatus::Pending);
        assert_eq!(map_status("JOB_STATE_RUNNING"), BatchStatus::Running);
        assert_eq!(map_status("JOB_STATE_SUCCEEDED"), BatchStatus::Completed);
        assert_eq!(map_status("JOB_STATE_FAILED"), BatchStatus::Failed);
        assert_eq!(map_status("JOB_STATE_CANCELLED"), BatchStatus::Cancelled);
        // cancelling is still running, despite what the heuristic would say
        assert_eq!(map_status("JOB_STATE_CANCELLING"), BatchStatus::Running);
    }

    #[test]
    fn status_map_falls_back_to_heuristic() {
        assert_eq!(map_status("JOB_STATE_PAUSED_PENDING"), BatchStatus::Pending);
        assert_eq!(map_status("TOTALLY_NEW"), BatchStatus::Running);
    }

    #[test]
    fn format_batch_request_uses_key_and_contents() {
        let request = provider().format_batch_request("u1", "say hi", None);
        assert_eq!(request["key"], "u1");
        assert_eq!(request["request"]["contents"][0]["parts"][0]["text"], "say hi");
    }

    #[test]
    fn format_batch_request_attaches_schema() {
        let schema = json!({"type": "object"});
        let request = provider().format_batch_request("u1", "say hi", Some(&schema));
        assert_eq!(
            request["request"]["generationConfig"]["responseMimeType"],
            "application/json"
        );
    }

    #[test]
    fn parse_batch_line_extracts_content_and_tokens() {
        let raw = json!({
            "key": "u1",
            "response": {
                "candidates": [{
                    "finishReason": "STOP",
                    "content": {"parts": [{"text": "{\"ok\": 1}"}]}
                }],
                "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 5}
            }
        });
        let result = provider().parse_batch_line(&raw);
        assert_eq!(result.unit_id, "u1");
        assert_eq!(result.content.as_deref(), Some("{\"ok\": 1}"));
        assert_eq!(result.input_tokens, 10);
        assert_eq!(result.output_tokens, 5);
        assert!(result.error.is_none());
    }

    #[test]
    fn parse_batch_line_reports_safety_filter() {
        let raw = json!({
            "key": "u2",
            "response": {"promptFeedback": {"blockReason": "SAFETY"}}
        });
        let result = provider().parse_batch_line(&raw);
        assert!(result.content.is_none());
        assert_eq!(result.error.as_deref(), Some("safety_filter: SAFETY"));
    }

    #[test]
    fn parse_batch_line_reports_unit_error() {
        let raw = json!({"key": "u3", "error": {"code": 500, "message": "boom"}});
        let result = provider().parse_batch_line(&raw);
        assert!(result.error.is_some());
        assert!(result.content.is_none());
    }

    #[test]
    fn parse_batch_line_flags_bad_finish_reason() {
        let raw = json!({
            "key": "u4",
            "response": {"candidates": [{"finishReason": "SAFETY"}]}
        });
        let result = provider().parse_batch_line(&raw);
        assert_eq!(result.error.as_deref(), Some("finish_reason: SAFETY"));
    }

    #[test]
    fn estimate_cost_batch_vs_realtime() {
        let p = provider();
        let batch = p.estimate_cost(1_000_000, 1_000_000, true);
        let realtime = p.estimate_cost(1_000_000, 1_000_000, false);
        assert!((batch - 0.375).abs() < 1e-9);
        assert!((realtime - 0.75).abs() < 1e-9);
    }
}
