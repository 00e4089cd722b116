//! Read-only diagnostics over a run directory.
//!
//! Everything here works from disk journals (not the manifest) so it can
//! be trusted when the two disagree: per-step health counts, explicit
//! disk-vs-manifest discrepancy listings, the status auto-correction of
//! a run whose chunks are all terminal, and the post-run `report.json`.
//!
//! These scanners run from reader processes too (dashboards, `status`),
//! so they must tolerate concurrent appends by the writer.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::journal::{ChunkJournal, list_chunks};
use crate::manifest::{ChunkState, Manifest, ManifestStore, RunStatus};
use crate::provider::registry;
use crate::runlog::RunLog;
use crate::validator::FailureStage;

pub const REPORT_FILE: &str = "report.json";

/// Per-step counts read from disk.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StepHealth {
    pub step: String,
    /// Units this step should account for: the previous step's valid
    /// count, or the run's unit total for the first step.
    pub expected: u64,
    pub valid: u64,
    pub validation_failures: u64,
    pub hard_failures: u64,
    pub status: StepHealthStatus,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepHealthStatus {
    Ok,
    Warning,
    Mismatch,
}

/// Scan disk journals to build per-step health data.
pub fn scan_step_health(run_dir: &Path, pipeline: &[String]) -> Result<Vec<StepHealth>> {
    let chunks = list_chunks(run_dir)?;
    let mut health = Vec::with_capacity(pipeline.len());
    let mut prev_valid: Option<u64> = None;

    for step in pipeline {
        let mut valid = 0u64;
        let mut validation_failures = 0u64;
        let mut hard_failures = 0u64;
        let mut total_units = 0u64;

        for chunk_name in &chunks {
            let journal = ChunkJournal::new(run_dir, chunk_name);
            valid += journal.read_validated(step)?.len() as u64;
            total_units += journal.units()?.len() as u64;
            for failure in journal.read_failures(step)? {
                let stage = failure
                    .get("failure_stage")
                    .and_then(JsonValue::as_str)
                    .map(FailureStage::parse)
                    .unwrap_or(FailureStage::Validation);
                if stage.is_retry_eligible() {
                    validation_failures += 1;
                } else {
                    hard_failures += 1;
                }
            }
        }

        let expected = prev_valid.unwrap_or(total_units);
        let accounted = valid + validation_failures + hard_failures;
        let status = if validation_failures > 0 || hard_failures > 0 {
            StepHealthStatus::Warning
        } else if expected > 0 && accounted != expected {
            StepHealthStatus::Mismatch
        } else {
            StepHealthStatus::Ok
        };

        health.push(StepHealth {
            step: step.clone(),
            expected,
            valid,
            validation_failures,
            hard_failures,
            status,
        });
        prev_valid = Some(valid);
    }
    Ok(health)
}

/// Compare the manifest's per-chunk counters against the journals.
/// Returns one description per discrepancy (empty when consistent).
pub fn verify_disk_vs_manifest(
    run_dir: &Path,
    pipeline: &[String],
    manifest: &Manifest,
) -> Result<Vec<String>> {
    let Some(last_step) = pipeline.last() else {
        return Ok(Vec::new());
    };
    let mut discrepancies = Vec::new();

    for (chunk_name, chunk) in &manifest.chunks {
        let journal = ChunkJournal::new(run_dir, chunk_name);
        if !journal.dir().exists() {
            discrepancies.push(format!("{chunk_name}: directory missing from disk"));
            continue;
        }
        // only terminal chunks have settled counters worth comparing
        if !matches!(chunk.decoded_state(), Some(ChunkState::Validated)) {
            continue;
        }

        let disk_valid = journal.read_validated(last_step)?.len() as u64;
        let disk_failed = journal.read_failures(last_step)?.len() as u64;
        if chunk.valid != disk_valid {
            discrepancies.push(format!(
                "{chunk_name}/{last_step}: manifest valid={}, disk valid={disk_valid}",
                chunk.valid
            ));
        }
        if chunk.failed != disk_failed {
            discrepancies.push(format!(
                "{chunk_name}/{last_step}: manifest failed={}, disk failed={disk_failed}",
                chunk.failed
            ));
        }
    }
    Ok(discrepancies)
}

/// A run whose chunks are all terminal must read as `complete`. Readers
/// may correct the drift; the correction is logged with an `[AUTO-FIX]`
/// tag and alters no journal data.
pub fn check_manifest_consistency(run_dir: &Path, manifest: &mut Manifest) -> Result<bool> {
    if manifest.chunks.is_empty() || manifest.status == RunStatus::Complete {
        return Ok(false);
    }
    if !manifest.all_chunks_terminal() {
        return Ok(false);
    }

    manifest.status = RunStatus::Complete;
    manifest.completed_at = Some(Utc::now());
    let mut store = ManifestStore::new(run_dir);
    store.save(manifest)?;
    RunLog::new(run_dir).log(
        "AUTO-FIX",
        "Run status corrected to complete (all chunks terminal)",
    );
    Ok(true)
}

/// Compact post-run report: per-step counts, failure-stage histogram,
/// retry hotspots, tokens and cost. Best-effort, written by the
/// completion path.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub status: String,
    pub progress: u8,
    pub total_units: u64,
    pub valid_units: u64,
    pub failed_units: u64,
    pub total_tokens: u64,
    pub cost: f64,
    pub steps: Vec<StepHealth>,
    pub failure_stages: BTreeMap<String, u64>,
    /// Units with the most recorded attempts, worst first (top 10).
    pub retry_hotspots: Vec<(String, u64)>,
}

pub fn build_report(run_dir: &Path, manifest: &Manifest) -> Result<RunReport> {
    let steps = scan_step_health(run_dir, &manifest.pipeline)?;

    let mut failure_stages: BTreeMap<String, u64> = BTreeMap::new();
    let mut attempts_per_unit: BTreeMap<String, u64> = BTreeMap::new();
    for chunk_name in list_chunks(run_dir)? {
        let journal = ChunkJournal::new(run_dir, &chunk_name);
        for step in &manifest.pipeline {
            for failure in journal.read_failures(step)? {
                let stage = failure
                    .get("failure_stage")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("other")
                    .to_string();
                *failure_stages.entry(stage).or_insert(0) += 1;
                if let Some(unit_id) = failure.get("unit_id").and_then(JsonValue::as_str) {
                    *attempts_per_unit.entry(unit_id.to_string()).or_insert(0) += 1;
                }
            }
        }
    }

    let mut retry_hotspots: Vec<(String, u64)> = attempts_per_unit.into_iter().collect();
    retry_hotspots.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    retry_hotspots.truncate(10);

    let meta = &manifest.metadata;
    let cost = registry::compute_cost(
        &meta.provider,
        &meta.model,
        meta.mode,
        meta.initial_input_tokens + meta.retry_input_tokens,
        meta.initial_output_tokens + meta.retry_output_tokens,
    );

    Ok(RunReport {
        status: manifest.status.as_str().to_string(),
        progress: manifest.progress(),
        total_units: manifest.total_units(),
        valid_units: manifest.valid_units(),
        failed_units: manifest.failed_units(),
        total_tokens: manifest.total_tokens(),
        cost: (cost * 10_000.0).round() / 10_000.0,
        steps,
        failure_stages,
        retry_hotspots,
    })
}

pub fn write_report(run_dir: &Path, manifest: &Manifest) -> Result<()> {
    let report = build_report(run_dir, manifest)?;
    let path = run_dir.join(REPORT_FILE);
    std::fs::write(&path, serde_json::to_string_pretty(&report)?)?;
    Ok(())
}
