//! Run-local log files.
//!
//! `RUN_LOG.txt` carries one level-tagged line per state change (`POLL`,
//! `SUBMIT`, `COLLECT`, `VALIDATE`, `TICK`, `EXPRESSION`, `PROGRESS`,
//! `STATE`, `ERROR`). `TRACE_LOG.txt` records one line per outgoing
//! provider call with duration and an HTTP-ish status. Both are product
//! artefacts read by external dashboards, written best-effort: a logging
//! failure never fails the engine. Operator-level diagnostics go through
//! `tracing` instead.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;

pub const RUN_LOG_FILE: &str = "RUN_LOG.txt";
pub const TRACE_LOG_FILE: &str = "TRACE_LOG.txt";

#[derive(Debug, Clone)]
pub struct RunLog {
    log_path: PathBuf,
    trace_path: PathBuf,
}

impl RunLog {
    pub fn new(run_dir: &Path) -> Self {
        Self {
            log_path: run_dir.join(RUN_LOG_FILE),
            trace_path: run_dir.join(TRACE_LOG_FILE),
        }
    }

    /// Append a level-tagged line, e.g. `[2026-08-01T10:00:00Z] [SUBMIT] ...`.
    pub fn log(&self, level: &str, message: &str) {
        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        let line = format!("[{timestamp}] [{level}] {message}\n");
        if let Err(e) = append(&self.log_path, &line) {
            tracing::warn!("failed to write run log: {e}");
        }
        tracing::info!("[{level}] {message}");
    }

    /// Append one request-level telemetry line, millisecond-stamped,
    /// e.g. `[API] gemini chunk_003 unit_042 | 1.33s | 200`.
    pub fn trace(&self, message: &str) {
        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3f");
        let line = format!("{timestamp} {message}\n");
        if let Err(e) = append(&self.trace_path, &line) {
            tracing::debug!("failed to write trace log: {e}");
        }
    }

    pub fn trace_call(&self, provider: &str, chunk: &str, unit_id: &str, seconds: f64, status: &str) {
        self.trace(&format!(
            "[API] {provider} {chunk} {unit_id} | {seconds:.2}s | {status}"
        ));
    }
}

fn append(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(line.as_bytes())?;
    file.flush()
}
