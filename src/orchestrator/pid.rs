//! PID-file single-writer lock.
//!
//! `orchestrator.pid` is the run's only concurrency control: a new
//! orchestrator refuses to start while the recorded PID is alive *and*
//! its command line references this run directory. The file is left
//! behind on exit on purpose — a stale PID with a dead process is how
//! external dashboards detect a detached run.

use std::path::Path;

use anyhow::{Context, Result};

use crate::errors::OrchestratorError;

pub const PID_FILE: &str = "orchestrator.pid";

/// Record this process as the run's writer.
pub fn write_pid_file(run_dir: &Path) -> Result<()> {
    let path = run_dir.join(PID_FILE);
    std::fs::write(&path, std::process::id().to_string())
        .with_context(|| format!("Failed to write PID file {}", path.display()))
}

pub fn read_pid(run_dir: &Path) -> Option<u32> {
    std::fs::read_to_string(run_dir.join(PID_FILE))
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Refuse to act as writer while another live orchestrator owns the run.
pub fn check_single_writer(run_dir: &Path) -> Result<(), OrchestratorError> {
    let Some(pid) = read_pid(run_dir) else {
        return Ok(());
    };
    if pid == std::process::id() {
        return Ok(());
    }
    if process_alive(pid) && cmdline_references(pid, run_dir) {
        return Err(OrchestratorError::WriterLocked {
            path: run_dir.to_path_buf(),
            pid,
        });
    }
    Ok(())
}

/// Best-effort view of the recorded writer, for status displays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriterState {
    /// No PID file: the run has never had a writer (or predates one).
    Unknown,
    /// Recorded PID is alive and its command line references the run.
    Alive(u32),
    /// Recorded PID is dead or belongs to some other process now.
    Detached(u32),
}

pub fn writer_state(run_dir: &Path) -> WriterState {
    match read_pid(run_dir) {
        None => WriterState::Unknown,
        Some(pid) if process_alive(pid) && cmdline_references(pid, run_dir) => {
            WriterState::Alive(pid)
        }
        Some(pid) => WriterState::Detached(pid),
    }
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 only performs the permission/existence
    // check, it never delivers a signal.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    false
}

/// Whether the process's command line mentions this run directory. A PID
/// can be recycled by an unrelated process; liveness alone is not
/// ownership.
fn cmdline_references(pid: u32, run_dir: &Path) -> bool {
    match read_cmdline(pid) {
        Some(cmdline) => {
            let needle = run_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            cmdline.contains(&run_dir.to_string_lossy().into_owned())
                || (!needle.is_empty() && cmdline.contains(&needle))
        }
        // no cmdline source on this platform: trust liveness
        None => true,
    }
}

#[cfg(target_os = "linux")]
fn read_cmdline(pid: u32) -> Option<String> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    Some(String::from_utf8_lossy(&raw).replace('\0', " "))
}

#[cfg(not(target_os = "linux"))]
fn read_cmdline(_pid: u32) -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn pid_file_round_trip() {
        let dir = tempdir().unwrap();
        write_pid_file(dir.path()).unwrap();
        assert_eq!(read_pid(dir.path()), Some(std::process::id()));
    }

    #[test]
    fn own_pid_does_not_lock() {
        let dir = tempdir().unwrap();
        write_pid_file(dir.path()).unwrap();
        assert!(check_single_writer(dir.path()).is_ok());
    }

    #[test]
    fn missing_pid_file_does_not_lock() {
        let dir = tempdir().unwrap();
        assert!(check_single_writer(dir.path()).is_ok());
        assert_eq!(writer_state(dir.path()), WriterState::Unknown);
    }

    #[test]
    fn dead_pid_is_detached() {
        let dir = tempdir().unwrap();
        // pids wrap below ~4 million on Linux; this one cannot be alive
        std::fs::write(dir.path().join(PID_FILE), "999999999").unwrap();
        assert!(check_single_writer(dir.path()).is_ok());
        assert_eq!(writer_state(dir.path()), WriterState::Detached(999_999_999));
    }

    #[cfg(unix)]
    #[test]
    fn own_process_is_alive() {
        assert!(process_alive(std::process::id()));
    }
}
