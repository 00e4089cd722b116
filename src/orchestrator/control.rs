//! Maintenance entry points: revalidate, retry-failures, cancel.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::Value as JsonValue;

use crate::errors::OrchestratorError;
use crate::journal::{ChunkJournal, list_chunks, write_jsonl};
use crate::manifest::{ChunkState, RunStatus};
use crate::runner::llm_metadata;
use crate::util::parse_json_response;
use crate::validator::{FailureRecord, FailureStage, StructuredError, validate_record};

use super::Orchestrator;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RevalidateStats {
    pub revalidated: u64,
    pub passed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetStats {
    pub units_reset: u64,
    pub chunks_reset: u64,
}

impl Orchestrator {
    /// Re-run validation against the journalled `{step}_results.jsonl`
    /// without calling any provider. Deterministic over the same inputs
    /// and rules, so running it twice is a no-op the second time.
    pub fn revalidate(&mut self, step_filter: Option<&str>) -> Result<RevalidateStats, OrchestratorError> {
        let mut manifest = self.load_manifest()?;
        let pipeline = manifest.pipeline.clone();
        let steps: Vec<String> = match step_filter {
            Some(step) => {
                if !pipeline.iter().any(|s| s == step) {
                    return Err(OrchestratorError::UnknownStep(step.to_string()));
                }
                vec![step.to_string()]
            }
            None => pipeline.clone(),
        };

        let mut stats = RevalidateStats::default();
        for chunk_name in list_chunks(self.run_dir()).map_err(OrchestratorError::Other)? {
            let journal = ChunkJournal::new(self.run_dir(), &chunk_name);
            for step in &steps {
                let results = journal.read_results(step).map_err(OrchestratorError::Other)?;
                if results.is_empty() {
                    continue;
                }
                let checks = self.config().validation_for(step);
                let units: BTreeMap<String, JsonValue> = crate::journal::read_jsonl_by_id(
                    &journal.units_path(),
                    "unit_id",
                )
                .map_err(OrchestratorError::Other)?;
                let prior_retries = journal
                    .latest_failures(step)
                    .map_err(OrchestratorError::Other)?;

                // last result per unit wins; earlier attempts are history
                let mut latest: BTreeMap<String, JsonValue> = BTreeMap::new();
                for record in results {
                    if let Some(unit_id) = record.get("unit_id").and_then(JsonValue::as_str) {
                        latest.insert(unit_id.to_string(), record);
                    }
                }

                let mut validated = Vec::new();
                let mut failures = Vec::new();
                for (unit_id, record) in &latest {
                    stats.revalidated += 1;
                    let retry_count = prior_retries
                        .get(unit_id)
                        .map(|f| f.retry_count)
                        .unwrap_or(0);
                    let content = record.get("content").and_then(JsonValue::as_str).unwrap_or("");
                    let api_error = record.get("error").and_then(JsonValue::as_str);
                    let metadata = record.get("_metadata").cloned().unwrap_or_default();
                    let tokens = |key: &str| {
                        metadata.get(key).and_then(JsonValue::as_u64).unwrap_or(0)
                    };
                    let model = metadata
                        .get("model")
                        .and_then(JsonValue::as_str)
                        .unwrap_or("")
                        .to_string();

                    let failure = if let Some(error) = api_error {
                        Some((FailureStage::Api, vec![StructuredError::new("provider", error)]))
                    } else if content.trim().is_empty() {
                        Some((
                            FailureStage::Parse,
                            vec![StructuredError::new("response", "empty response text")],
                        ))
                    } else {
                        match parse_json_response(content) {
                            None => Some((
                                FailureStage::Parse,
                                vec![StructuredError::new("response", "response is not decodable JSON")],
                            )),
                            Some(parsed) if !parsed.is_object() => Some((
                                FailureStage::Parse,
                                vec![StructuredError::new("response", "response JSON is not an object")],
                            )),
                            Some(parsed) => {
                                let fallback = serde_json::json!({"unit_id": unit_id});
                                let unit = units.get(unit_id).unwrap_or(&fallback);
                                let seed = crate::runner::unit_seed(unit);
                                let mut candidate = unit.as_object().cloned().unwrap_or_default();
                                for (key, value) in parsed.as_object().into_iter().flatten() {
                                    candidate.insert(key.clone(), value.clone());
                                }
                                match validate_record(&JsonValue::Object(candidate), &checks, seed) {
                                    Ok(()) => {
                                        validated.push(crate::runner::validated_record(
                                            unit,
                                            &parsed,
                                            llm_metadata(
                                                tokens("input_tokens"),
                                                tokens("output_tokens"),
                                                &model,
                                                "STOP",
                                                retry_count,
                                            ),
                                        ));
                                        stats.passed += 1;
                                        None
                                    }
                                    Err(outcome) => Some((outcome.stage, outcome.errors)),
                                }
                            }
                        }
                    };

                    if let Some((stage, errors)) = failure {
                        stats.failed += 1;
                        failures.push(
                            FailureRecord {
                                unit_id: unit_id.clone(),
                                failure_stage: stage,
                                errors,
                                retry_count,
                                raw_text: Some(content.to_string()),
                                input: None,
                            }
                            .to_json(),
                        );
                    }
                }

                write_jsonl(&journal.validated_path(step), &validated)
                    .map_err(OrchestratorError::Other)?;
                write_jsonl(&journal.failures_path(step), &failures)
                    .map_err(OrchestratorError::Other)?;
                self.log().log(
                    "VALIDATE",
                    &format!(
                        "{chunk_name}/{step} revalidated: {} passed, {} failed",
                        validated.len(),
                        failures.len()
                    ),
                );

                // refresh counters where this step is the chunk's frontier
                let is_last = pipeline.last().map(String::as_str) == Some(step.as_str());
                if let Some(chunk) = manifest.chunks.get_mut(&chunk_name) {
                    let at_this_step = ChunkState::parse(&chunk.state)
                        .and_then(|s| s.step().map(String::from))
                        .as_deref()
                        == Some(step.as_str());
                    if is_last || at_this_step {
                        chunk.valid = validated.len() as u64;
                        chunk.failed = failures.len() as u64;
                    }
                }
            }
        }

        self.save_manifest(&mut manifest)?;
        Ok(stats)
    }

    /// Reset failed units so the orchestrator redoes them: remove their
    /// failure records (writing the `.bak` sentinel first so the
    /// coverage shortcut cannot skip the redo), lower the chunk state to
    /// the step's `_PENDING`, and flip a terminal run status back to
    /// `running`.
    pub fn retry_failures(
        &mut self,
        step_filter: Option<&str>,
        unit_ids: Option<&[String]>,
    ) -> Result<ResetStats, OrchestratorError> {
        let mut manifest = self.load_manifest()?;
        let pipeline = manifest.pipeline.clone();
        let mut stats = ResetStats::default();

        for chunk_name in list_chunks(self.run_dir()).map_err(OrchestratorError::Other)? {
            let journal = ChunkJournal::new(self.run_dir(), &chunk_name);
            let steps = match step_filter {
                Some(step) => vec![step.to_string()],
                None => journal.steps_with_failures().map_err(OrchestratorError::Other)?,
            };

            let mut reset_steps: Vec<String> = Vec::new();
            for step in steps {
                let failures = journal.read_failures(&step).map_err(OrchestratorError::Other)?;
                if failures.is_empty() {
                    continue;
                }

                let (kept, reset): (Vec<JsonValue>, Vec<JsonValue>) =
                    failures.into_iter().partition(|record| {
                        let unit_id = record.get("unit_id").and_then(JsonValue::as_str);
                        match (unit_ids, unit_id) {
                            (Some(filter), Some(id)) => !filter.iter().any(|f| f == id),
                            (Some(_), None) => true,
                            (None, _) => false,
                        }
                    });
                if reset.is_empty() {
                    continue;
                }

                journal
                    .create_reset_sentinel(&step)
                    .map_err(OrchestratorError::Other)?;
                if kept.is_empty() {
                    let path = journal.failures_path(&step);
                    if path.exists() {
                        std::fs::remove_file(&path)
                            .map_err(|e| OrchestratorError::Other(e.into()))?;
                    }
                } else {
                    write_jsonl(&journal.failures_path(&step), &kept)
                        .map_err(OrchestratorError::Other)?;
                }
                stats.units_reset += reset.len() as u64;
                reset_steps.push(step);
            }

            if reset_steps.is_empty() {
                continue;
            }
            stats.chunks_reset += 1;

            // lower the chunk to the earliest reset step
            let earliest = pipeline
                .iter()
                .find(|step| reset_steps.iter().any(|s| s == *step))
                .cloned()
                .unwrap_or_else(|| reset_steps[0].clone());
            let remaining_failures: u64 = {
                let mut count = 0u64;
                for step in journal.steps_with_failures().map_err(OrchestratorError::Other)? {
                    count += journal
                        .read_failures(&step)
                        .map_err(OrchestratorError::Other)?
                        .len() as u64;
                }
                count
            };
            if let Some(chunk) = manifest.chunks.get_mut(&chunk_name) {
                chunk.state = ChunkState::Pending(earliest.clone()).encode();
                chunk.retries = 0;
                chunk.failed = remaining_failures;
                chunk.batch_id = None;
                chunk.submitted_at = None;
            }
            self.log().log(
                "STATE",
                &format!("{chunk_name} reset to {earliest}_PENDING for retry"),
            );
        }

        if stats.units_reset > 0
            && matches!(manifest.status, RunStatus::Failed | RunStatus::Complete)
        {
            manifest.status = RunStatus::Running;
            manifest.error_message = None;
        }
        self.save_manifest(&mut manifest)?;
        Ok(stats)
    }

    /// Cancel in-flight batches (best-effort) and mark the run killed.
    pub async fn cancel(&mut self) -> Result<(), OrchestratorError> {
        let mut manifest = self.load_manifest()?;

        let submitted: Vec<(String, String, String)> = manifest
            .chunks
            .iter()
            .filter_map(|(name, chunk)| match chunk.decoded_state() {
                Some(ChunkState::Submitted(step)) => chunk
                    .batch_id
                    .clone()
                    .map(|batch_id| (name.clone(), step, batch_id)),
                _ => None,
            })
            .collect();

        for (chunk_name, step, batch_id) in submitted {
            match self.step_provider(&step) {
                Ok(provider) => match provider.cancel_batch(&batch_id).await {
                    Ok(true) => self
                        .log()
                        .log("STATE", &format!("{chunk_name}: cancelled batch {batch_id}")),
                    Ok(false) => self.log().log(
                        "STATE",
                        &format!("{chunk_name}: batch {batch_id} already terminal"),
                    ),
                    Err(e) => self.log().log(
                        "ERROR",
                        &format!("{chunk_name}: cancel of {batch_id} failed: {e}"),
                    ),
                },
                Err(e) => self
                    .log()
                    .log("ERROR", &format!("{chunk_name}: no provider to cancel: {e}")),
            }
        }

        if !manifest.status.is_terminal() {
            manifest.status = RunStatus::Killed;
            manifest.killed_at = Some(Utc::now());
            self.save_manifest(&mut manifest)?;
        }
        self.log().log("STATE", "run killed");
        Ok(())
    }
}
