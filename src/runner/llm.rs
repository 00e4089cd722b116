//! Chunk-LLM runner: prompt rendering, batch submit/collect, and the
//! serial realtime path.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde_json::{Value as JsonValue, json};

use crate::config::PipelineConfig;
use crate::errors::{OrchestratorError, ProviderError};
use crate::journal::ChunkJournal;
use crate::prompt::render_prompt;
use crate::provider::Provider;
use crate::runlog::RunLog;
use crate::util::parse_json_response;
use crate::validator::{FailureRecord, FailureStage, validate_record};

use super::{
    PendingUnit, StepProgress, TokenTally, llm_metadata, participants, pending_units,
    step_progress, unit_seed, validated_record,
};

/// Outcome of a batch submit attempt for one chunk/step.
#[derive(Debug)]
pub enum SubmitOutcome {
    /// The step is already done for this chunk (coverage replay, or every
    /// unit already accounted for).
    AlreadyComplete(StepProgress),
    /// A batch was created; poll it on later ticks.
    Submitted { batch_id: String, unit_count: usize },
    /// No batch was created this tick (e.g. every pending unit produced
    /// an unbatchable prompt); check again next tick.
    Deferred(StepProgress),
}

pub struct LlmRunner<'a> {
    pub config: &'a PipelineConfig,
    pub run_dir: &'a Path,
    pub provider: Arc<dyn Provider>,
    pub log: &'a RunLog,
}

impl<'a> LlmRunner<'a> {
    fn template_source(&self, step: &str) -> Result<String, OrchestratorError> {
        let step_config = self
            .config
            .step(step)
            .ok_or_else(|| OrchestratorError::UnknownStep(step.to_string()))?;
        let file = self
            .config
            .template_for(step_config)
            .ok_or_else(|| OrchestratorError::Other(anyhow::anyhow!(
                "step '{step}' has no prompt template"
            )))?;
        let path = self.run_dir.join("config").join("templates").join(file);
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read template {}", path.display()))
            .map_err(OrchestratorError::Other)
    }

    fn schema(&self, step: &str) -> Result<Option<JsonValue>, OrchestratorError> {
        let Some(file) = self.config.schema_file_for(step) else {
            return Ok(None);
        };
        let path = self.run_dir.join("config").join("schemas").join(file);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read schema {}", path.display()))
            .map_err(OrchestratorError::Other)?;
        let schema = serde_json::from_str(&content)
            .with_context(|| format!("Schema {} is not valid JSON", path.display()))
            .map_err(OrchestratorError::Other)?;
        Ok(Some(schema))
    }

    /// Render (or reload) the full prompt set for a step. The rendered
    /// prompts are journalled once; a reset sentinel forces a re-render.
    fn materialise_prompts(
        &self,
        journal: &ChunkJournal,
        step: &str,
        units: &[JsonValue],
    ) -> Result<BTreeMap<String, String>, OrchestratorError> {
        let path = journal.prompts_path(step);
        if path.exists() && !journal.has_reset_sentinel(step) {
            let existing = crate::journal::read_jsonl_by_id(&path, "unit_id")
                .map_err(OrchestratorError::Other)?;
            if units.iter().all(|u| {
                u.get("unit_id")
                    .and_then(JsonValue::as_str)
                    .is_some_and(|id| existing.contains_key(id))
            }) {
                return Ok(existing
                    .into_iter()
                    .map(|(id, record)| {
                        let prompt = record
                            .get("prompt")
                            .and_then(JsonValue::as_str)
                            .unwrap_or("")
                            .to_string();
                        (id, prompt)
                    })
                    .collect());
            }
        }

        let template = self.template_source(step)?;
        let mut prompts = BTreeMap::new();
        let mut records = Vec::with_capacity(units.len());
        for unit in units {
            let Some(unit_id) = unit.get("unit_id").and_then(JsonValue::as_str) else {
                continue;
            };
            let prompt = match render_prompt(&template, unit) {
                Ok(prompt) => prompt,
                Err(e) => {
                    // an unrenderable unit flows through as an empty
                    // prompt and fails with a parse-stage record
                    self.log
                        .log("ERROR", &format!("render failed for {unit_id}: {e:#}"));
                    String::new()
                }
            };
            records.push(json!({"unit_id": unit_id, "prompt": prompt}));
            prompts.insert(unit_id.to_string(), prompt);
        }
        crate::journal::write_jsonl(&path, &records).map_err(OrchestratorError::Other)?;
        Ok(prompts)
    }

    fn empty_prompt_failure(
        &self,
        journal: &ChunkJournal,
        step: &str,
        pending: &PendingUnit,
    ) -> Result<(), OrchestratorError> {
        let record = FailureRecord {
            unit_id: pending.unit_id.clone(),
            failure_stage: FailureStage::Parse,
            errors: vec![crate::validator::StructuredError::new(
                "prompt",
                "rendered prompt is empty",
            )],
            retry_count: pending.attempt,
            raw_text: None,
            input: Some(String::new()),
        };
        journal
            .append_failure(step, &record.to_json())
            .map_err(OrchestratorError::Other)
    }

    /// Batch path, submit side: skip if the replay rule says the step is
    /// already covered, otherwise render prompts, write the provider
    /// batch input, upload, and create the batch.
    pub async fn submit_batch(
        &self,
        pipeline: &[String],
        chunk_name: &str,
        step: &str,
    ) -> Result<SubmitOutcome, OrchestratorError> {
        let journal = ChunkJournal::new(self.run_dir, chunk_name);
        let unit_ids = journal.unit_ids().map_err(OrchestratorError::Other)?;
        let threshold = self.config.processing.resume_coverage_threshold;
        let max_retries = self.config.api.max_retries;

        let units = participants(&journal, pipeline, step).map_err(OrchestratorError::Other)?;

        if journal
            .step_replay_complete(step, &unit_ids, threshold)
            .map_err(OrchestratorError::Other)?
        {
            self.log.log(
                "SUBMIT",
                &format!("{chunk_name}/{step} already covered on disk, skipping submit"),
            );
            let progress =
                step_progress(&journal, step, &units, max_retries).map_err(OrchestratorError::Other)?;
            return Ok(SubmitOutcome::AlreadyComplete(progress));
        }

        let (pending, _) =
            pending_units(&journal, step, &units, max_retries).map_err(OrchestratorError::Other)?;
        if pending.is_empty() {
            journal.clear_reset_sentinel(step).map_err(OrchestratorError::Other)?;
            let progress =
                step_progress(&journal, step, &units, max_retries).map_err(OrchestratorError::Other)?;
            return Ok(SubmitOutcome::AlreadyComplete(progress));
        }

        let prompts = self.materialise_prompts(&journal, step, &units)?;
        let schema = self.schema(step)?;

        let mut requests = Vec::with_capacity(pending.len());
        let mut batched = 0usize;
        for item in &pending {
            let prompt = prompts.get(&item.unit_id).map(String::as_str).unwrap_or("");
            if prompt.is_empty() {
                self.empty_prompt_failure(&journal, step, item)?;
                continue;
            }
            requests.push(
                self.provider
                    .format_batch_request(&item.unit_id, prompt, schema.as_ref()),
            );
            batched += 1;
        }

        if requests.is_empty() {
            let progress =
                step_progress(&journal, step, &units, max_retries).map_err(OrchestratorError::Other)?;
            if progress.complete {
                journal.clear_reset_sentinel(step).map_err(OrchestratorError::Other)?;
                return Ok(SubmitOutcome::AlreadyComplete(progress));
            }
            return Ok(SubmitOutcome::Deferred(progress));
        }

        let input_path = journal.input_path(step);
        crate::journal::write_jsonl(&input_path, &requests).map_err(OrchestratorError::Other)?;

        let started = Instant::now();
        let file_id = self.provider.upload_batch_file(&input_path).await?;
        let batch_id = self.provider.create_batch(&file_id).await?;
        self.log.trace(&format!(
            "[BATCH] {} {chunk_name} {step} submit {batched} unit(s) | {:.2}s | {batch_id}",
            self.provider.name(),
            started.elapsed().as_secs_f64(),
        ));

        Ok(SubmitOutcome::Submitted {
            batch_id,
            unit_count: batched,
        })
    }

    /// Batch path, collect side: download results, journal the raw
    /// responses, validate, and partition into validated/failures.
    /// Idempotent: units already validated on disk are skipped, so a
    /// crash between download and manifest save cannot double-append.
    pub async fn collect_batch(
        &self,
        pipeline: &[String],
        chunk_name: &str,
        step: &str,
        batch_id: &str,
    ) -> Result<(StepProgress, TokenTally), OrchestratorError> {
        let journal = ChunkJournal::new(self.run_dir, chunk_name);
        let max_retries = self.config.api.max_retries;
        let units = participants(&journal, pipeline, step).map_err(OrchestratorError::Other)?;
        let units_by_id: BTreeMap<&str, &JsonValue> = units
            .iter()
            .filter_map(|u| u.get("unit_id").and_then(JsonValue::as_str).map(|id| (id, u)))
            .collect();

        let (pending, _) =
            pending_units(&journal, step, &units, max_retries).map_err(OrchestratorError::Other)?;
        let attempts: BTreeMap<String, u32> = pending
            .iter()
            .map(|p| (p.unit_id.clone(), p.attempt))
            .collect();
        let already_validated = journal.validated_ids(step).map_err(OrchestratorError::Other)?;

        let started = Instant::now();
        let (results, batch_meta) = self.provider.download_batch_results(batch_id).await?;
        self.log.trace(&format!(
            "[BATCH] {} {chunk_name} {step} collect {} result(s) | {:.2}s | {batch_id}",
            self.provider.name(),
            results.len(),
            started.elapsed().as_secs_f64(),
        ));

        let mut tally = TokenTally::default();
        let checks = self.config.validation_for(step);

        for result in &results {
            if already_validated.contains(&result.unit_id) {
                continue;
            }
            let attempt = attempts.get(&result.unit_id).copied().unwrap_or(0);
            tally.add(attempt, result.input_tokens, result.output_tokens);

            journal
                .append_result(
                    step,
                    &json!({
                        "unit_id": result.unit_id,
                        "content": result.content,
                        "error": result.error,
                        "_metadata": {
                            "input_tokens": result.input_tokens,
                            "output_tokens": result.output_tokens,
                            "model": batch_meta.model,
                            "retry_count": attempt,
                        }
                    }),
                )
                .map_err(OrchestratorError::Other)?;

            let outcome = if let Some(error) = &result.error {
                Err(FailureRecord {
                    unit_id: result.unit_id.clone(),
                    failure_stage: FailureStage::Api,
                    errors: vec![crate::validator::StructuredError::new("provider", error)],
                    retry_count: attempt,
                    raw_text: result.content.clone(),
                    input: None,
                })
            } else {
                self.classify_response(
                    &result.unit_id,
                    result.content.as_deref().unwrap_or(""),
                    units_by_id.get(result.unit_id.as_str()).copied(),
                    &checks,
                    attempt,
                    result.input_tokens,
                    result.output_tokens,
                    &batch_meta.model,
                )
            };

            match outcome {
                Ok(record) => {
                    journal
                        .append_validated(step, &record)
                        .map_err(OrchestratorError::Other)?;
                }
                Err(failure) => {
                    journal
                        .append_failure(step, &failure.to_json())
                        .map_err(OrchestratorError::Other)?;
                }
            }
        }

        let progress =
            step_progress(&journal, step, &units, max_retries).map_err(OrchestratorError::Other)?;
        if progress.complete {
            journal.clear_reset_sentinel(step).map_err(OrchestratorError::Other)?;
        }
        Ok((progress, tally))
    }

    /// Realtime path: serial per-unit calls with an inter-call delay,
    /// looping until every unit is validated or exhausted. Rate limits
    /// back off inside the provider call loop; an authentication error
    /// aborts the run.
    pub async fn run_realtime(
        &self,
        pipeline: &[String],
        chunk_name: &str,
        step: &str,
    ) -> Result<(StepProgress, TokenTally), OrchestratorError> {
        let journal = ChunkJournal::new(self.run_dir, chunk_name);
        let unit_ids = journal.unit_ids().map_err(OrchestratorError::Other)?;
        let threshold = self.config.processing.resume_coverage_threshold;
        let max_retries = self.config.api.max_retries;
        let units = participants(&journal, pipeline, step).map_err(OrchestratorError::Other)?;
        let mut tally = TokenTally::default();

        if journal
            .step_replay_complete(step, &unit_ids, threshold)
            .map_err(OrchestratorError::Other)?
        {
            self.log.log(
                "VALIDATE",
                &format!("{chunk_name}/{step} already covered on disk, skipping"),
            );
            let progress =
                step_progress(&journal, step, &units, max_retries).map_err(OrchestratorError::Other)?;
            return Ok((progress, tally));
        }

        let prompts = self.materialise_prompts(&journal, step, &units)?;
        let schema = self.schema(step)?;
        let checks = self.config.validation_for(step);
        let delay = Duration::from_secs_f64(self.config.api.delay_between_calls.max(0.0));
        let mut first_call = true;

        loop {
            let (pending, _) = pending_units(&journal, step, &units, max_retries)
                .map_err(OrchestratorError::Other)?;
            if pending.is_empty() {
                break;
            }

            for item in &pending {
                let prompt = prompts.get(&item.unit_id).map(String::as_str).unwrap_or("");
                if prompt.is_empty() {
                    self.empty_prompt_failure(&journal, step, item)?;
                    continue;
                }

                if !first_call && !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                first_call = false;

                let started = Instant::now();
                let call = self.call_with_backoff(prompt, schema.as_ref()).await;
                let seconds = started.elapsed().as_secs_f64();

                match call {
                    Ok(result) => {
                        self.log
                            .trace_call(self.provider.name(), chunk_name, &item.unit_id, seconds, "200");
                        tally.add(item.attempt, result.input_tokens, result.output_tokens);

                        journal
                            .append_result(
                                step,
                                &json!({
                                    "unit_id": item.unit_id,
                                    "content": result.content,
                                    "error": JsonValue::Null,
                                    "_metadata": {
                                        "input_tokens": result.input_tokens,
                                        "output_tokens": result.output_tokens,
                                        "model": self.provider.model(),
                                        "finish_reason": result.finish_reason,
                                        "retry_count": item.attempt,
                                    }
                                }),
                            )
                            .map_err(OrchestratorError::Other)?;

                        let outcome = self.classify_response(
                            &item.unit_id,
                            &result.content,
                            Some(&item.unit),
                            &checks,
                            item.attempt,
                            result.input_tokens,
                            result.output_tokens,
                            self.provider.model(),
                        );
                        match outcome {
                            Ok(record) => {
                                journal
                                    .append_validated(step, &record)
                                    .map_err(OrchestratorError::Other)?;
                            }
                            Err(failure) => {
                                journal
                                    .append_failure(step, &failure.to_json())
                                    .map_err(OrchestratorError::Other)?;
                            }
                        }
                    }
                    Err(e) if e.is_fatal() => {
                        self.log.trace_call(
                            self.provider.name(),
                            chunk_name,
                            &item.unit_id,
                            seconds,
                            "AUTH",
                        );
                        return Err(OrchestratorError::Provider(e));
                    }
                    Err(e) => {
                        self.log.trace_call(
                            self.provider.name(),
                            chunk_name,
                            &item.unit_id,
                            seconds,
                            "ERROR",
                        );
                        let failure = FailureRecord {
                            unit_id: item.unit_id.clone(),
                            failure_stage: FailureStage::Api,
                            errors: vec![crate::validator::StructuredError::new(
                                "provider",
                                e.to_string(),
                            )],
                            retry_count: item.attempt,
                            raw_text: None,
                            input: Some(prompt.to_string()),
                        };
                        journal
                            .append_failure(step, &failure.to_json())
                            .map_err(OrchestratorError::Other)?;
                    }
                }
            }
        }

        journal.clear_reset_sentinel(step).map_err(OrchestratorError::Other)?;
        let progress =
            step_progress(&journal, step, &units, max_retries).map_err(OrchestratorError::Other)?;
        Ok((progress, tally))
    }

    async fn call_with_backoff(
        &self,
        prompt: &str,
        schema: Option<&JsonValue>,
    ) -> Result<crate::provider::RealtimeResult, ProviderError> {
        crate::provider::with_backoff(&self.config.api.retry, "realtime call", || {
            self.provider.generate_realtime(prompt, schema)
        })
        .await
    }

    /// Parse + validate one LLM response into a validated record or a
    /// categorised failure.
    #[allow(clippy::too_many_arguments)]
    fn classify_response(
        &self,
        unit_id: &str,
        content: &str,
        unit: Option<&JsonValue>,
        checks: &crate::config::StepValidation,
        attempt: u32,
        input_tokens: u64,
        output_tokens: u64,
        model: &str,
    ) -> Result<JsonValue, FailureRecord> {
        let parse_failure = |message: &str| FailureRecord {
            unit_id: unit_id.to_string(),
            failure_stage: FailureStage::Parse,
            errors: vec![crate::validator::StructuredError::new("response", message)],
            retry_count: attempt,
            raw_text: Some(content.to_string()),
            input: None,
        };

        if content.trim().is_empty() {
            return Err(parse_failure("empty response text"));
        }
        let Some(parsed) = parse_json_response(content) else {
            return Err(parse_failure("response is not decodable JSON"));
        };
        if !parsed.is_object() {
            return Err(parse_failure("response JSON is not an object"));
        }

        let fallback = json!({"unit_id": unit_id});
        let unit = unit.unwrap_or(&fallback);
        let seed = unit_seed(unit);

        // rules see the parsed output merged over the unit's fields
        let mut candidate = unit.as_object().cloned().unwrap_or_default();
        for (key, value) in parsed.as_object().into_iter().flatten() {
            candidate.insert(key.clone(), value.clone());
        }
        let candidate = JsonValue::Object(candidate);

        match validate_record(&candidate, checks, seed) {
            Ok(()) => Ok(validated_record(
                unit,
                &parsed,
                llm_metadata(input_tokens, output_tokens, model, "STOP", attempt),
            )),
            Err(failure) => Err(FailureRecord {
                unit_id: unit_id.to_string(),
                failure_stage: failure.stage,
                errors: failure.errors,
                retry_count: attempt,
                raw_text: Some(content.to_string()),
                input: None,
            }),
        }
    }
}
