//! Manifest store: durable, single-writer run-level state.
//!
//! `MANIFEST.json` is the authoritative record of a run. All writes go
//! through [`ManifestStore::save`], which stamps a monotonic `updated`
//! timestamp, writes a sibling temp file, and renames it over the target
//! so readers never observe a torn manifest. Every save also refreshes
//! `.manifest_summary.json`, a ~300-byte subset that lets dashboards list
//! hundreds of runs without parsing full manifests; summary failures
//! never fail the primary save.

pub mod summary;

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RunMode;
use crate::errors::OrchestratorError;

pub const MANIFEST_FILE: &str = "MANIFEST.json";
pub const SUMMARY_FILE: &str = ".manifest_summary.json";

/// Second-precision ISO-8601 (de)serialization for manifest timestamps.
pub mod iso_seconds {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse(&text).map_err(serde::de::Error::custom)
    }

    pub fn parse(text: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        NaiveDateTime::parse_from_str(text, FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
            .map(|naive| naive.and_utc())
            .or_else(|_| DateTime::parse_from_rfc3339(text).map(|dt| dt.with_timezone(&Utc)))
    }
}

/// Same as [`iso_seconds`] but for optional timestamps.
pub mod iso_seconds_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(dt) => super::iso_seconds::serialize(dt, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let text: Option<String> = Option::deserialize(deserializer)?;
        match text {
            Some(text) => super::iso_seconds::parse(&text)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Complete,
    Failed,
    Killed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Complete | RunStatus::Failed | RunStatus::Killed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Complete => "complete",
            RunStatus::Failed => "failed",
            RunStatus::Killed => "killed",
        }
    }
}

pub const STATE_VALIDATED: &str = "VALIDATED";
pub const STATE_FAILED: &str = "FAILED";

/// Decoded chunk state. The wire form is a string: `{step}_PENDING`,
/// `{step}_SUBMITTED`, or the terminal `VALIDATED` / `FAILED`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkState {
    Pending(String),
    Submitted(String),
    Validated,
    Failed,
}

impl ChunkState {
    pub fn parse(state: &str) -> Option<ChunkState> {
        match state {
            STATE_VALIDATED => Some(ChunkState::Validated),
            STATE_FAILED => Some(ChunkState::Failed),
            _ => {
                let (step, suffix) = state.rsplit_once('_')?;
                match suffix {
                    "PENDING" => Some(ChunkState::Pending(step.to_string())),
                    "SUBMITTED" => Some(ChunkState::Submitted(step.to_string())),
                    _ => None,
                }
            }
        }
    }

    pub fn encode(&self) -> String {
        match self {
            ChunkState::Pending(step) => format!("{step}_PENDING"),
            ChunkState::Submitted(step) => format!("{step}_SUBMITTED"),
            ChunkState::Validated => STATE_VALIDATED.to_string(),
            ChunkState::Failed => STATE_FAILED.to_string(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChunkState::Validated | ChunkState::Failed)
    }

    pub fn step(&self) -> Option<&str> {
        match self {
            ChunkState::Pending(step) | ChunkState::Submitted(step) => Some(step),
            _ => None,
        }
    }
}

/// Per-chunk bookkeeping in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub state: String,
    pub items: u64,
    #[serde(default)]
    pub valid: u64,
    #[serde(default)]
    pub failed: u64,
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, with = "iso_seconds_opt", skip_serializing_if = "Option::is_none")]
    pub submitted_at: Option<DateTime<Utc>>,
}

impl ChunkInfo {
    pub fn new(items: u64, first_step: &str) -> Self {
        Self {
            state: ChunkState::Pending(first_step.to_string()).encode(),
            items,
            valid: 0,
            failed: 0,
            retries: 0,
            batch_id: None,
            submitted_at: None,
        }
    }

    pub fn decoded_state(&self) -> Option<ChunkState> {
        ChunkState::parse(&self.state)
    }
}

/// Run-level metadata carried in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub mode: RunMode,
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub pipeline_name: String,
    #[serde(default)]
    pub initial_input_tokens: u64,
    #[serde(default)]
    pub initial_output_tokens: u64,
    #[serde(default)]
    pub retry_input_tokens: u64,
    #[serde(default)]
    pub retry_output_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_units: Option<u64>,
    #[serde(default)]
    pub poll_interval: u64,
    /// SHA-256 of the snapshotted config, for provenance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
}

/// The authoritative per-run state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(with = "iso_seconds")]
    pub created: DateTime<Utc>,
    #[serde(with = "iso_seconds")]
    pub updated: DateTime<Utc>,
    pub status: RunStatus,
    /// Chunk-scope step names, in pipeline order.
    pub pipeline: Vec<String>,
    pub chunks: BTreeMap<String, ChunkInfo>,
    pub metadata: RunMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, with = "iso_seconds_opt", skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<DateTime<Utc>>,
    #[serde(default, with = "iso_seconds_opt", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, with = "iso_seconds_opt", skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, with = "iso_seconds_opt", skip_serializing_if = "Option::is_none")]
    pub killed_at: Option<DateTime<Utc>>,
}

impl Manifest {
    pub fn new(pipeline: Vec<String>, metadata: RunMetadata) -> Self {
        let now = Utc::now().trunc_subsecs(0);
        Self {
            created: now,
            updated: now,
            status: RunStatus::Pending,
            pipeline,
            chunks: BTreeMap::new(),
            metadata,
            error_message: None,
            paused_at: None,
            completed_at: None,
            failed_at: None,
            killed_at: None,
        }
    }

    /// Step-granular progress percent. With T chunks and S steps, total
    /// work is T*S; a VALIDATED chunk contributes S, a chunk at
    /// `{step_k}_*` contributes k. Complete runs report 100 regardless of
    /// counter drift.
    pub fn progress(&self) -> u8 {
        if self.status == RunStatus::Complete {
            return 100;
        }
        if self.chunks.is_empty() || self.pipeline.is_empty() {
            return 0;
        }
        let total_steps = self.pipeline.len();
        let mut completed: usize = 0;
        for chunk in self.chunks.values() {
            match chunk.decoded_state() {
                Some(ChunkState::Validated) => completed += total_steps,
                Some(ChunkState::Pending(step)) | Some(ChunkState::Submitted(step)) => {
                    if let Some(index) = self.pipeline.iter().position(|s| *s == step) {
                        completed += index;
                    }
                }
                _ => {}
            }
        }
        let total_work = self.chunks.len() * total_steps;
        ((completed * 100) / total_work).min(100) as u8
    }

    pub fn all_chunks_terminal(&self) -> bool {
        !self.chunks.is_empty()
            && self
                .chunks
                .values()
                .all(|c| c.decoded_state().is_some_and(|s| s.is_terminal()))
    }

    pub fn total_units(&self) -> u64 {
        self.chunks.values().map(|c| c.items).sum()
    }

    pub fn valid_units(&self) -> u64 {
        self.chunks.values().map(|c| c.valid).sum()
    }

    pub fn failed_units(&self) -> u64 {
        if self.status.is_terminal() {
            self.total_units().saturating_sub(self.valid_units())
        } else {
            self.chunks.values().map(|c| c.failed).sum()
        }
    }

    pub fn total_tokens(&self) -> u64 {
        let m = &self.metadata;
        m.initial_input_tokens + m.initial_output_tokens + m.retry_input_tokens + m.retry_output_tokens
    }

    /// The name of the most advanced non-terminal step any chunk is at.
    pub fn current_step(&self) -> Option<&str> {
        if self.pipeline.is_empty() {
            return None;
        }
        let mut best: Option<usize> = None;
        for chunk in self.chunks.values() {
            match chunk.decoded_state() {
                Some(ChunkState::Validated) => {
                    best = Some(best.map_or(self.pipeline.len() - 1, |b| b.max(self.pipeline.len() - 1)));
                }
                Some(ChunkState::Pending(step)) | Some(ChunkState::Submitted(step)) => {
                    if let Some(index) = self.pipeline.iter().position(|s| *s == step) {
                        best = Some(best.map_or(index, |b| b.max(index)));
                    }
                }
                _ => {}
            }
        }
        best.and_then(|index| self.pipeline.get(index)).map(String::as_str)
    }

    /// Count of in-flight (`_SUBMITTED`) chunks, for backpressure.
    pub fn inflight_count(&self) -> usize {
        self.chunks
            .values()
            .filter(|c| matches!(c.decoded_state(), Some(ChunkState::Submitted(_))))
            .count()
    }

    /// Next state after `step` completes for a chunk: the following
    /// step's `_PENDING`, or `VALIDATED` after the last step.
    pub fn state_after(&self, step: &str) -> ChunkState {
        match self.pipeline.iter().position(|s| s == step) {
            Some(index) if index + 1 < self.pipeline.len() => {
                ChunkState::Pending(self.pipeline[index + 1].clone())
            }
            _ => ChunkState::Validated,
        }
    }
}

/// Handle for loading and atomically saving a run's manifest.
///
/// Owns the monotonicity of `updated`: within one process, every save
/// strictly exceeds the previous one even at second precision.
pub struct ManifestStore {
    run_dir: PathBuf,
    last_updated: Option<DateTime<Utc>>,
}

impl ManifestStore {
    pub fn new(run_dir: &Path) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
            last_updated: None,
        }
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.run_dir.join(MANIFEST_FILE)
    }

    pub fn load(&self) -> Result<Manifest, OrchestratorError> {
        load_manifest(&self.run_dir)
    }

    /// Save atomically: stamp `updated`, write a sibling temp file, rename
    /// over the target, then refresh the summary (best-effort). A failed
    /// write is retried once before surfacing.
    pub fn save(&mut self, manifest: &mut Manifest) -> Result<(), OrchestratorError> {
        let mut now = Utc::now().trunc_subsecs(0);
        if let Some(last) = self.last_updated {
            if now <= last {
                now = last + chrono::Duration::seconds(1);
            }
        }
        manifest.updated = now;

        let mut result = self.write_atomic(manifest);
        if result.is_err() {
            result = self.write_atomic(manifest);
        }
        result.map_err(|source| OrchestratorError::ManifestWriteFailed {
            path: self.manifest_path(),
            source,
        })?;
        self.last_updated = Some(now);

        // Lightweight summary for dashboards; never fails the save.
        let _ = summary::write_summary(&self.run_dir, manifest);
        Ok(())
    }

    fn write_atomic(&self, manifest: &Manifest) -> std::io::Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.run_dir)?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), manifest)
            .map_err(std::io::Error::other)?;
        tmp.as_file_mut().write_all(b"\n")?;
        tmp.as_file_mut().flush()?;
        tmp.persist(self.manifest_path())
            .map_err(|e| e.error)?;
        Ok(())
    }
}

/// Read and parse a run's manifest. Missing file is an I/O error,
/// malformed content is fatal.
pub fn load_manifest(run_dir: &Path) -> Result<Manifest, OrchestratorError> {
    let path = run_dir.join(MANIFEST_FILE);
    let content = std::fs::read_to_string(&path).map_err(|source| {
        OrchestratorError::ManifestReadFailed {
            path: path.clone(),
            source,
        }
    })?;
    serde_json::from_str(&content)
        .map_err(|source| OrchestratorError::ManifestMalformed { path, source })
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    pub(crate) fn sample_metadata() -> RunMetadata {
        RunMetadata {
            mode: RunMode::Batch,
            provider: "gemini".into(),
            model: "gemini-2.0-flash-001".into(),
            pipeline_name: "npc-dialog".into(),
            initial_input_tokens: 0,
            initial_output_tokens: 0,
            retry_input_tokens: 0,
            retry_output_tokens: 0,
            max_units: None,
            poll_interval: 30,
            config_hash: None,
        }
    }

    pub(crate) fn two_step_manifest() -> Manifest {
        let mut manifest = Manifest::new(vec!["generate".into(), "score".into()], sample_metadata());
        manifest
            .chunks
            .insert("chunk_000".into(), ChunkInfo::new(2, "generate"));
        manifest
            .chunks
            .insert("chunk_001".into(), ChunkInfo::new(2, "generate"));
        manifest
    }
}
