//! Per-chunk journal: the append-only record streams under
//! `chunks/chunk_NNN/`.
//!
//! File set per chunk (all JSONL, any of them may exist gzipped — readers
//! accept both transparently, writers always produce plain):
//!
//! - `units.jsonl`             — the chunk's input units, written at init
//! - `{step}_prompts.jsonl`    — rendered prompt + unit_id
//! - `{step}_input.jsonl`      — provider-formatted batch request lines
//! - `{step}_results.jsonl`    — raw parsed responses, pre-validation
//! - `{step}_validated.jsonl`  — post-validation passing records
//! - `{step}_failures.jsonl`   — failing records, one per attempt
//! - `{step}_failures.jsonl.bak` — sentinel: a retry was reset, so the
//!   coverage short-circuit must not skip the step
//!
//! During a step, validated/failures files are append-only; a restart
//! either resumes from the recorded coverage or recomputes the missing
//! unit ids and redoes only those.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use serde_json::Value as JsonValue;

pub const CHUNKS_DIR: &str = "chunks";

/// Minimal view of a failure record, for retry accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureView {
    pub unit_id: String,
    pub failure_stage: String,
    pub retry_count: u32,
}

/// Handle to one chunk's journal directory.
#[derive(Debug, Clone)]
pub struct ChunkJournal {
    dir: PathBuf,
}

impl ChunkJournal {
    pub fn new(run_dir: &Path, chunk_name: &str) -> Self {
        Self {
            dir: run_dir.join(CHUNKS_DIR).join(chunk_name),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn units_path(&self) -> PathBuf {
        self.dir.join("units.jsonl")
    }

    pub fn prompts_path(&self, step: &str) -> PathBuf {
        self.dir.join(format!("{step}_prompts.jsonl"))
    }

    pub fn input_path(&self, step: &str) -> PathBuf {
        self.dir.join(format!("{step}_input.jsonl"))
    }

    pub fn results_path(&self, step: &str) -> PathBuf {
        self.dir.join(format!("{step}_results.jsonl"))
    }

    pub fn validated_path(&self, step: &str) -> PathBuf {
        self.dir.join(format!("{step}_validated.jsonl"))
    }

    pub fn failures_path(&self, step: &str) -> PathBuf {
        self.dir.join(format!("{step}_failures.jsonl"))
    }

    pub fn reset_sentinel_path(&self, step: &str) -> PathBuf {
        self.dir.join(format!("{step}_failures.jsonl.bak"))
    }

    pub fn write_units(&self, units: &[JsonValue]) -> Result<()> {
        write_jsonl(&self.units_path(), units)
    }

    pub fn units(&self) -> Result<Vec<JsonValue>> {
        read_jsonl(&self.units_path())
    }

    pub fn unit_ids(&self) -> Result<Vec<String>> {
        Ok(self
            .units()?
            .iter()
            .filter_map(|u| u.get("unit_id").and_then(JsonValue::as_str).map(String::from))
            .collect())
    }

    pub fn read_validated(&self, step: &str) -> Result<Vec<JsonValue>> {
        read_jsonl(&self.validated_path(step))
    }

    pub fn read_failures(&self, step: &str) -> Result<Vec<JsonValue>> {
        read_jsonl(&self.failures_path(step))
    }

    pub fn read_results(&self, step: &str) -> Result<Vec<JsonValue>> {
        read_jsonl(&self.results_path(step))
    }

    pub fn append_validated(&self, step: &str, record: &JsonValue) -> Result<()> {
        append_jsonl(&self.validated_path(step), record)
    }

    pub fn append_failure(&self, step: &str, record: &JsonValue) -> Result<()> {
        append_jsonl(&self.failures_path(step), record)
    }

    pub fn append_result(&self, step: &str, record: &JsonValue) -> Result<()> {
        append_jsonl(&self.results_path(step), record)
    }

    /// Unit ids with a validated record for this step.
    pub fn validated_ids(&self, step: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .read_validated(step)?
            .iter()
            .filter_map(|r| r.get("unit_id").and_then(JsonValue::as_str).map(String::from))
            .collect())
    }

    /// Latest failure per unit for this step. Retry records for a unit
    /// appear in strict retry-count order, so the last one wins.
    pub fn latest_failures(&self, step: &str) -> Result<BTreeMap<String, FailureView>> {
        let mut latest = BTreeMap::new();
        for record in self.read_failures(step)? {
            let Some(unit_id) = record.get("unit_id").and_then(JsonValue::as_str) else {
                continue;
            };
            let view = FailureView {
                unit_id: unit_id.to_string(),
                failure_stage: record
                    .get("failure_stage")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("other")
                    .to_string(),
                retry_count: record
                    .get("retry_count")
                    .and_then(JsonValue::as_u64)
                    .unwrap_or(0) as u32,
            };
            latest.insert(view.unit_id.clone(), view);
        }
        Ok(latest)
    }

    /// Fraction of the chunk's units with a validated record for `step`.
    pub fn coverage(&self, step: &str, unit_ids: &[String]) -> Result<f64> {
        if unit_ids.is_empty() {
            return Ok(1.0);
        }
        let validated = self.validated_ids(step)?;
        let covered = unit_ids.iter().filter(|id| validated.contains(*id)).count();
        Ok(covered as f64 / unit_ids.len() as f64)
    }

    /// The replay rule: a step counts as already done for this chunk when
    /// validated coverage meets the threshold and no reset sentinel is
    /// present.
    pub fn step_replay_complete(
        &self,
        step: &str,
        unit_ids: &[String],
        threshold: f64,
    ) -> Result<bool> {
        if self.has_reset_sentinel(step) {
            return Ok(false);
        }
        Ok(self.coverage(step, unit_ids)? >= threshold)
    }

    pub fn has_reset_sentinel(&self, step: &str) -> bool {
        self.reset_sentinel_path(step).exists()
    }

    /// Drop the sentinel once the reset step has actually been redone.
    pub fn clear_reset_sentinel(&self, step: &str) -> Result<()> {
        let path = self.reset_sentinel_path(step);
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove reset sentinel {}", path.display()))?;
        }
        Ok(())
    }

    /// Create the sentinel by preserving the current failures file, so a
    /// subsequent resume cannot short-circuit the redo.
    pub fn create_reset_sentinel(&self, step: &str) -> Result<()> {
        let failures = self.failures_path(step);
        let sentinel = self.reset_sentinel_path(step);
        if sentinel.exists() {
            return Ok(());
        }
        if failures.exists() {
            fs::copy(&failures, &sentinel)
                .with_context(|| format!("Failed to write reset sentinel {}", sentinel.display()))?;
        } else {
            fs::write(&sentinel, b"")
                .with_context(|| format!("Failed to write reset sentinel {}", sentinel.display()))?;
        }
        Ok(())
    }

    /// List step names that have a failures file in this chunk directory.
    pub fn steps_with_failures(&self) -> Result<Vec<String>> {
        let mut steps = Vec::new();
        if !self.dir.exists() {
            return Ok(steps);
        }
        for entry in fs::read_dir(&self.dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            let trimmed = name.strip_suffix(".gz").unwrap_or(&name);
            if let Some(step) = trimmed.strip_suffix("_failures.jsonl") {
                if !steps.iter().any(|s| s == step) {
                    steps.push(step.to_string());
                }
            }
        }
        steps.sort();
        Ok(steps)
    }
}

/// List a run's chunk names in order.
pub fn list_chunks(run_dir: &Path) -> Result<Vec<String>> {
    let chunks_dir = run_dir.join(CHUNKS_DIR);
    if !chunks_dir.exists() {
        return Ok(Vec::new());
    }
    let mut names: Vec<String> = fs::read_dir(&chunks_dir)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("chunk_"))
        .collect();
    names.sort();
    Ok(names)
}

/// Load all records from a JSONL file, transparently accepting a `.gz`
/// sibling when the plain file is absent. Undecodable lines are skipped.
pub fn read_jsonl(path: &Path) -> Result<Vec<JsonValue>> {
    let mut records = Vec::new();

    let reader: Box<dyn BufRead> = if path.exists() {
        Box::new(BufReader::new(fs::File::open(path)?))
    } else {
        let gz_path = PathBuf::from(format!("{}.gz", path.display()));
        if !gz_path.exists() {
            return Ok(records);
        }
        Box::new(BufReader::new(GzDecoder::new(fs::File::open(&gz_path)?)))
    };

    for line in reader.lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(record) = serde_json::from_str::<JsonValue>(line) {
            records.push(record);
        }
    }
    Ok(records)
}

/// Load a JSONL file indexed by a field (last record per key wins).
pub fn read_jsonl_by_id(path: &Path, id_field: &str) -> Result<BTreeMap<String, JsonValue>> {
    let mut records = BTreeMap::new();
    for record in read_jsonl(path)? {
        if let Some(key) = record.get(id_field).and_then(JsonValue::as_str) {
            records.insert(key.to_string(), record);
        }
    }
    Ok(records)
}

/// Append a single record to a JSONL file.
pub fn append_jsonl(path: &Path, record: &JsonValue) -> Result<()> {
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let line = serde_json::to_string(record)?;
    writeln!(file, "{line}").with_context(|| format!("Failed to append to {}", path.display()))?;
    Ok(())
}

/// Write records to a JSONL file, replacing any existing content.
/// Creates parent directories as needed.
pub fn write_jsonl(path: &Path, records: &[JsonValue]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut file = fs::File::create(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for record in records {
        let line = serde_json::to_string(record)?;
        writeln!(file, "{line}")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn journal(run_dir: &Path) -> ChunkJournal {
        let journal = ChunkJournal::new(run_dir, "chunk_000");
        fs::create_dir_all(journal.dir()).unwrap();
        journal
    }

    #[test]
    fn units_round_trip() {
        let dir = tempdir().unwrap();
        let journal = journal(dir.path());
        let units = vec![
            json!({"unit_id": "u1", "topic": "A"}),
            json!({"unit_id": "u2", "topic": "B"}),
        ];
        journal.write_units(&units).unwrap();
        assert_eq!(journal.units().unwrap(), units);
        assert_eq!(journal.unit_ids().unwrap(), vec!["u1", "u2"]);
    }

    #[test]
    fn read_jsonl_accepts_gzip() {
        let dir = tempdir().unwrap();
        let gz_path = dir.path().join("records.jsonl.gz");
        let file = fs::File::create(&gz_path).unwrap();
        let mut encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        writeln!(encoder, "{}", json!({"unit_id": "u1"})).unwrap();
        encoder.finish().unwrap();

        let records = read_jsonl(&dir.path().join("records.jsonl")).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["unit_id"], "u1");
    }

    #[test]
    fn read_jsonl_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        assert!(read_jsonl(&dir.path().join("nope.jsonl")).unwrap().is_empty());
    }

    #[test]
    fn read_jsonl_skips_garbage_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        fs::write(&path, "{\"ok\": 1}\nnot json\n{\"ok\": 2}\n").unwrap();
        let records = read_jsonl(&path).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn latest_failure_wins_per_unit() {
        let dir = tempdir().unwrap();
        let journal = journal(dir.path());
        journal
            .append_failure("generate", &json!({"unit_id": "u1", "failure_stage": "validation", "retry_count": 0}))
            .unwrap();
        journal
            .append_failure("generate", &json!({"unit_id": "u1", "failure_stage": "validation", "retry_count": 1}))
            .unwrap();
        journal
            .append_failure("generate", &json!({"unit_id": "u2", "failure_stage": "api", "retry_count": 0}))
            .unwrap();

        let latest = journal.latest_failures("generate").unwrap();
        assert_eq!(latest["u1"].retry_count, 1);
        assert_eq!(latest["u2"].failure_stage, "api");
    }

    #[test]
    fn coverage_and_replay_rule() {
        let dir = tempdir().unwrap();
        let journal = journal(dir.path());
        let ids: Vec<String> = (0..10).map(|i| format!("u{i}")).collect();
        for id in &ids[..9] {
            journal
                .append_validated("generate", &json!({"unit_id": id}))
                .unwrap();
        }

        assert!((journal.coverage("generate", &ids).unwrap() - 0.9).abs() < 1e-9);
        assert!(journal.step_replay_complete("generate", &ids, 0.9).unwrap());
        assert!(!journal.step_replay_complete("generate", &ids, 0.95).unwrap());
    }

    #[test]
    fn reset_sentinel_disables_replay_shortcut() {
        let dir = tempdir().unwrap();
        let journal = journal(dir.path());
        let ids = vec!["u1".to_string()];
        journal
            .append_validated("generate", &json!({"unit_id": "u1"}))
            .unwrap();
        assert!(journal.step_replay_complete("generate", &ids, 0.9).unwrap());

        journal.create_reset_sentinel("generate").unwrap();
        assert!(!journal.step_replay_complete("generate", &ids, 0.9).unwrap());

        journal.clear_reset_sentinel("generate").unwrap();
        assert!(journal.step_replay_complete("generate", &ids, 0.9).unwrap());
    }

    #[test]
    fn empty_chunk_has_full_coverage() {
        let dir = tempdir().unwrap();
        let journal = journal(dir.path());
        assert_eq!(journal.coverage("generate", &[]).unwrap(), 1.0);
    }

    #[test]
    fn steps_with_failures_lists_unique_steps() {
        let dir = tempdir().unwrap();
        let journal = journal(dir.path());
        journal
            .append_failure("generate", &json!({"unit_id": "u1"}))
            .unwrap();
        journal
            .append_failure("score", &json!({"unit_id": "u1"}))
            .unwrap();
        assert_eq!(journal.steps_with_failures().unwrap(), vec!["generate", "score"]);
    }

    #[test]
    fn list_chunks_sorted() {
        let dir = tempdir().unwrap();
        for name in ["chunk_002", "chunk_000", "chunk_001"] {
            fs::create_dir_all(dir.path().join(CHUNKS_DIR).join(name)).unwrap();
        }
        assert_eq!(
            list_chunks(dir.path()).unwrap(),
            vec!["chunk_000", "chunk_001", "chunk_002"]
        );
    }
}
