//! Lightweight manifest summary.
//!
//! `.manifest_summary.json` carries just the fields a dashboard row needs
//! (~300 bytes against a potentially multi-megabyte manifest). It is a
//! best-effort side file: it may lag the manifest by at most one save and
//! its absence or staleness must never affect the engine.

use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::provider::registry;

use super::Manifest;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestSummary {
    pub status: String,
    pub progress: u8,
    pub total_units: u64,
    pub valid_units: u64,
    pub failed_units: u64,
    pub cost: f64,
    pub total_tokens: u64,
    pub mode: String,
    pub pipeline_name: String,
    pub started: String,
    pub updated: String,
    #[serde(default)]
    pub current_step: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub pipeline: Vec<String>,
    pub provider: String,
    pub model: String,
}

impl ManifestSummary {
    pub fn from_manifest(manifest: &Manifest) -> Self {
        let meta = &manifest.metadata;
        let total_input = meta.initial_input_tokens + meta.retry_input_tokens;
        let total_output = meta.initial_output_tokens + meta.retry_output_tokens;
        let cost = registry::compute_cost(
            &meta.provider,
            &meta.model,
            meta.mode,
            total_input,
            total_output,
        );

        Self {
            status: manifest.status.as_str().to_string(),
            progress: manifest.progress(),
            total_units: manifest.total_units(),
            valid_units: manifest.valid_units(),
            failed_units: manifest.failed_units(),
            cost: (cost * 10_000.0).round() / 10_000.0,
            total_tokens: manifest.total_tokens(),
            mode: meta.mode.to_string(),
            pipeline_name: meta.pipeline_name.clone(),
            started: manifest.created.format(super::iso_seconds::FORMAT).to_string(),
            updated: manifest.updated.format(super::iso_seconds::FORMAT).to_string(),
            current_step: manifest.current_step().unwrap_or_default().to_string(),
            error_message: manifest.error_message.clone(),
            pipeline: manifest.pipeline.clone(),
            provider: meta.provider.clone(),
            model: meta.model.clone(),
        }
    }
}

/// Write the summary next to the manifest, atomically. Best-effort at the
/// call site: the caller ignores the result.
pub fn write_summary(run_dir: &Path, manifest: &Manifest) -> std::io::Result<()> {
    let summary = ManifestSummary::from_manifest(manifest);
    let mut tmp = tempfile::NamedTempFile::new_in(run_dir)?;
    serde_json::to_writer(tmp.as_file_mut(), &summary).map_err(std::io::Error::other)?;
    tmp.as_file_mut().flush()?;
    tmp.persist(run_dir.join(super::SUMMARY_FILE))
        .map_err(|e| e.error)?;
    Ok(())
}

/// Read a run's summary if one exists.
pub fn read_summary(run_dir: &Path) -> Option<ManifestSummary> {
    let content = std::fs::read_to_string(run_dir.join(super::SUMMARY_FILE)).ok()?;
    serde_json::from_str(&content).ok()
}

#[cfg(test)]
mod tests {
    use super::super::tests_support::two_step_manifest;
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn summary_reflects_manifest_counts() {
        let mut manifest = two_step_manifest();
        manifest.chunks.get_mut("chunk_000").unwrap().valid = 2;
        manifest.chunks.get_mut("chunk_000").unwrap().state = "score_PENDING".into();

        let summary = ManifestSummary::from_manifest(&manifest);
        assert_eq!(summary.status, "pending");
        assert_eq!(summary.total_units, 4);
        assert_eq!(summary.valid_units, 2);
        assert_eq!(summary.progress, 25);
        assert_eq!(summary.pipeline, vec!["generate", "score"]);
    }

    #[test]
    fn summary_round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let manifest = two_step_manifest();
        write_summary(dir.path(), &manifest).unwrap();
        let summary = read_summary(dir.path()).unwrap();
        assert_eq!(summary.mode, "batch");
        assert_eq!(summary.provider, "gemini");
    }

    #[test]
    fn summary_stays_small() {
        let dir = tempdir().unwrap();
        let manifest = two_step_manifest();
        write_summary(dir.path(), &manifest).unwrap();
        let size = std::fs::metadata(dir.path().join(super::super::SUMMARY_FILE))
            .unwrap()
            .len();
        assert!(size < 1024, "summary unexpectedly large: {size} bytes");
    }
}
