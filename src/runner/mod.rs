//! Step runners: per-scope execution of one pipeline step on one chunk
//! (or, for run scope, the whole run).
//!
//! Shared here is the retry accounting every runner obeys:
//! - A unit is *done* for a step when it has a validated record.
//! - A failing unit is *retry-eligible* while its latest failure has a
//!   retryable stage (`schema_validation`/`validation`/`parse`) and a
//!   `retry_count` below `max_retries`.
//! - Otherwise the unit is *hard-failed* and no longer participates.
//! - A step is complete for a chunk when every participant is either
//!   validated or hard-failed.
//!
//! Retry counts are read back from the failures file, never from memory,
//! so kill-and-resume cannot lose or double-count attempts.

pub mod aggregate;
pub mod expression;
pub mod llm;

use std::collections::BTreeMap;

use anyhow::Result;
use serde_json::{Map, Value as JsonValue, json};

use crate::journal::ChunkJournal;
use crate::util::stable_hash;
use crate::validator::FailureStage;

/// Progress made on a step for one chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepProgress {
    pub validated: u64,
    pub hard_failed: u64,
    pub complete: bool,
}

/// One unit awaiting an attempt, with the retry count its next failure
/// record would carry.
#[derive(Debug, Clone)]
pub struct PendingUnit {
    pub unit: JsonValue,
    pub unit_id: String,
    /// 0 for a first attempt, previous retry_count + 1 afterwards.
    pub attempt: u32,
}

/// Units participating in `step`: every chunk unit for the first step,
/// otherwise those validated by the previous step — with all prior
/// steps' validated outputs merged in (later steps win, `_metadata`
/// dropped).
pub fn participants(
    journal: &ChunkJournal,
    pipeline: &[String],
    step: &str,
) -> Result<Vec<JsonValue>> {
    let units = journal.units()?;
    let step_index = pipeline.iter().position(|s| s == step).unwrap_or(0);

    let mut prior_outputs = Vec::with_capacity(step_index);
    for prior in &pipeline[..step_index] {
        prior_outputs.push(crate::journal::read_jsonl_by_id(
            &journal.validated_path(prior),
            "unit_id",
        )?);
    }

    let mut merged: Vec<JsonValue> = Vec::with_capacity(units.len());
    'unit: for unit in units {
        let Some(unit_id) = unit.get("unit_id").and_then(JsonValue::as_str) else {
            continue;
        };
        let mut fields = unit.as_object().cloned().unwrap_or_default();

        for validated in &prior_outputs {
            match validated.get(unit_id) {
                Some(record) => merge_fields(&mut fields, record),
                // dropped by an earlier step; not a participant here
                None => continue 'unit,
            }
        }
        merged.push(JsonValue::Object(fields));
    }
    Ok(merged)
}

fn merge_fields(fields: &mut Map<String, JsonValue>, record: &JsonValue) {
    if let Some(object) = record.as_object() {
        for (key, value) in object {
            if key == "_metadata" {
                continue;
            }
            fields.insert(key.clone(), value.clone());
        }
    }
}

/// Split participants into (pending attempts, hard-failed unit ids).
pub fn pending_units(
    journal: &ChunkJournal,
    step: &str,
    units: &[JsonValue],
    max_retries: u32,
) -> Result<(Vec<PendingUnit>, Vec<String>)> {
    let validated = journal.validated_ids(step)?;
    let failures = journal.latest_failures(step)?;

    let mut pending = Vec::new();
    let mut hard_failed = Vec::new();
    for unit in units {
        let Some(unit_id) = unit.get("unit_id").and_then(JsonValue::as_str) else {
            continue;
        };
        if validated.contains(unit_id) {
            continue;
        }
        match failures.get(unit_id) {
            None => pending.push(PendingUnit {
                unit: unit.clone(),
                unit_id: unit_id.to_string(),
                attempt: 0,
            }),
            Some(failure) => {
                let stage = FailureStage::parse(&failure.failure_stage);
                if stage.is_retry_eligible() && failure.retry_count < max_retries {
                    pending.push(PendingUnit {
                        unit: unit.clone(),
                        unit_id: unit_id.to_string(),
                        attempt: failure.retry_count + 1,
                    });
                } else {
                    hard_failed.push(unit_id.to_string());
                }
            }
        }
    }
    Ok((pending, hard_failed))
}

/// Counts for a step after the latest append: validated records plus
/// currently hard-failed units, and whether together they cover every
/// participant.
pub fn step_progress(
    journal: &ChunkJournal,
    step: &str,
    units: &[JsonValue],
    max_retries: u32,
) -> Result<StepProgress> {
    let (pending, hard_failed) = pending_units(journal, step, units, max_retries)?;
    let validated = journal.validated_ids(step)?;
    let validated_count = units
        .iter()
        .filter(|u| {
            u.get("unit_id")
                .and_then(JsonValue::as_str)
                .is_some_and(|id| validated.contains(id))
        })
        .count() as u64;
    Ok(StepProgress {
        validated: validated_count,
        hard_failed: hard_failed.len() as u64,
        complete: pending.is_empty(),
    })
}

/// RNG seed for one unit: the repetition seed folded with a stable hash
/// of the unit id, so draws are deterministic per (seed, unit) and
/// independent of chunk partitioning.
pub fn unit_seed(unit: &JsonValue) -> u64 {
    let repetition_seed = unit
        .get("_repetition_seed")
        .and_then(JsonValue::as_u64)
        .unwrap_or(0);
    let unit_id = unit.get("unit_id").and_then(JsonValue::as_str).unwrap_or("");
    repetition_seed ^ stable_hash(unit_id)
}

/// Build a validated record: the original unit's fields, the step's
/// parsed output merged over them, and a `_metadata` block.
pub fn validated_record(
    unit: &JsonValue,
    output: &JsonValue,
    metadata: JsonValue,
) -> JsonValue {
    let mut fields = unit.as_object().cloned().unwrap_or_default();
    merge_fields(&mut fields, output);
    fields.insert("_metadata".into(), metadata);
    JsonValue::Object(fields)
}

/// Aggregate per-attempt token counts into (initial, retry) buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TokenTally {
    pub initial_input: u64,
    pub initial_output: u64,
    pub retry_input: u64,
    pub retry_output: u64,
}

impl TokenTally {
    pub fn add(&mut self, attempt: u32, input_tokens: u64, output_tokens: u64) {
        if attempt == 0 {
            self.initial_input += input_tokens;
            self.initial_output += output_tokens;
        } else {
            self.retry_input += input_tokens;
            self.retry_output += output_tokens;
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == TokenTally::default()
    }
}

/// Standard `_metadata` block for an LLM-produced record.
pub fn llm_metadata(
    input_tokens: u64,
    output_tokens: u64,
    model: &str,
    finish_reason: &str,
    retry_count: u32,
) -> JsonValue {
    json!({
        "input_tokens": input_tokens,
        "output_tokens": output_tokens,
        "model": model,
        "finish_reason": finish_reason,
        "retry_count": retry_count,
    })
}

/// Latest retry counts per unit, for manifest bookkeeping.
pub fn max_retry_count(failures: &BTreeMap<String, crate::journal::FailureView>) -> u32 {
    failures.values().map(|f| f.retry_count).max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn journal(dir: &std::path::Path) -> ChunkJournal {
        let journal = ChunkJournal::new(dir, "chunk_000");
        std::fs::create_dir_all(journal.dir()).unwrap();
        journal
    }

    #[test]
    fn first_step_participants_are_all_units() {
        let dir = tempdir().unwrap();
        let journal = journal(dir.path());
        journal
            .write_units(&[json!({"unit_id": "u1"}), json!({"unit_id": "u2"})])
            .unwrap();

        let pipeline = vec!["generate".to_string(), "score".to_string()];
        let units = participants(&journal, &pipeline, "generate").unwrap();
        assert_eq!(units.len(), 2);
    }

    #[test]
    fn later_step_participants_carry_prior_outputs() {
        let dir = tempdir().unwrap();
        let journal = journal(dir.path());
        journal
            .write_units(&[json!({"unit_id": "u1", "topic": "A"}), json!({"unit_id": "u2", "topic": "B"})])
            .unwrap();
        journal
            .append_validated(
                "generate",
                &json!({"unit_id": "u1", "dialog": "hello", "_metadata": {"input_tokens": 5}}),
            )
            .unwrap();

        let pipeline = vec!["generate".to_string(), "score".to_string()];
        let units = participants(&journal, &pipeline, "score").unwrap();
        // u2 never validated generate, so it is not a participant
        assert_eq!(units.len(), 1);
        assert_eq!(units[0]["unit_id"], "u1");
        assert_eq!(units[0]["topic"], "A");
        assert_eq!(units[0]["dialog"], "hello");
        assert!(units[0].get("_metadata").is_none());
    }

    #[test]
    fn pending_excludes_validated_and_exhausted() {
        let dir = tempdir().unwrap();
        let journal = journal(dir.path());
        let units = vec![
            json!({"unit_id": "u1"}),
            json!({"unit_id": "u2"}),
            json!({"unit_id": "u3"}),
            json!({"unit_id": "u4"}),
        ];
        journal.append_validated("generate", &json!({"unit_id": "u1"})).unwrap();
        // u2: retry-eligible validation failure
        journal
            .append_failure("generate", &json!({"unit_id": "u2", "failure_stage": "validation", "retry_count": 0}))
            .unwrap();
        // u3: exhausted retries
        journal
            .append_failure("generate", &json!({"unit_id": "u3", "failure_stage": "validation", "retry_count": 3}))
            .unwrap();

        let (pending, hard) = pending_units(&journal, "generate", &units, 3).unwrap();
        let pending_ids: Vec<&str> = pending.iter().map(|p| p.unit_id.as_str()).collect();
        assert_eq!(pending_ids, vec!["u2", "u4"]);
        assert_eq!(pending[0].attempt, 1);
        assert_eq!(pending[1].attempt, 0);
        assert_eq!(hard, vec!["u3"]);
    }

    #[test]
    fn api_failures_are_hard() {
        let dir = tempdir().unwrap();
        let journal = journal(dir.path());
        let units = vec![json!({"unit_id": "u1"})];
        journal
            .append_failure("generate", &json!({"unit_id": "u1", "failure_stage": "api", "retry_count": 0}))
            .unwrap();
        let (pending, hard) = pending_units(&journal, "generate", &units, 3).unwrap();
        assert!(pending.is_empty());
        assert_eq!(hard, vec!["u1"]);
    }

    #[test]
    fn step_progress_completion() {
        let dir = tempdir().unwrap();
        let journal = journal(dir.path());
        let units = vec![json!({"unit_id": "u1"}), json!({"unit_id": "u2"})];
        journal.append_validated("generate", &json!({"unit_id": "u1"})).unwrap();

        let progress = step_progress(&journal, "generate", &units, 3).unwrap();
        assert_eq!(progress.validated, 1);
        assert!(!progress.complete);

        journal
            .append_failure("generate", &json!({"unit_id": "u2", "failure_stage": "api", "retry_count": 0}))
            .unwrap();
        let progress = step_progress(&journal, "generate", &units, 3).unwrap();
        assert_eq!(progress.validated, 1);
        assert_eq!(progress.hard_failed, 1);
        assert!(progress.complete);
    }

    #[test]
    fn unit_seed_is_stable_and_partition_independent() {
        let a = json!({"unit_id": "u1", "_repetition_seed": 7});
        let b = json!({"unit_id": "u1", "_repetition_seed": 7, "extra": "field"});
        let c = json!({"unit_id": "u2", "_repetition_seed": 7});
        assert_eq!(unit_seed(&a), unit_seed(&b));
        assert_ne!(unit_seed(&a), unit_seed(&c));
    }

    #[test]
    fn validated_record_merges_and_stamps_metadata() {
        let unit = json!({"unit_id": "u1", "topic": "A"});
        let output = json!({"dialog": "hi", "topic": "A-revised"});
        let record = validated_record(&unit, &output, llm_metadata(5, 3, "m", "STOP", 1));
        assert_eq!(record["unit_id"], "u1");
        assert_eq!(record["topic"], "A-revised");
        assert_eq!(record["dialog"], "hi");
        assert_eq!(record["_metadata"]["retry_count"], 1);
    }

    #[test]
    fn token_tally_buckets_by_attempt() {
        let mut tally = TokenTally::default();
        tally.add(0, 10, 5);
        tally.add(1, 7, 3);
        tally.add(2, 1, 1);
        assert_eq!(tally.initial_input, 10);
        assert_eq!(tally.initial_output, 5);
        assert_eq!(tally.retry_input, 8);
        assert_eq!(tally.retry_output, 4);
    }
}
