//! The orchestrator loop: top-level control of a run.
//!
//! Entry points map one-to-one onto the CLI: `init` creates the run
//! directory and materialises units, `tick` advances the batch state
//! machine one step, `watch` loops ticks with signal handling, `realtime`
//! drives chunks synchronously, `revalidate` re-runs validation from
//! journalled results, `retry_failures` resets failed units, and
//! `cancel` kills in-flight batches.
//!
//! ## Persistence Ownership
//!
//! Several layers write durable state, each owning a distinct concern:
//!
//! | Layer              | What it persists                                |
//! |--------------------|-------------------------------------------------|
//! | `manifest/`        | Run-level state: chunk states, counters, status |
//! | `journal.rs`       | Per-chunk record streams, append-only per step  |
//! | `runlog.rs`        | Operational log lines and request telemetry     |
//! | `orchestrator/pid` | The single-writer lock                          |
//!
//! The journal is the canonical record: on restart the engine recomputes
//! what is missing from disk, and the manifest is corrected to match.
//! For one chunk, step *k*'s validated records are durable before the
//! manifest ever shows the chunk at step *k+1*.

pub mod control;
pub mod init;
pub mod pid;
pub mod tick;
pub mod watch;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;

use crate::config::PipelineConfig;
use crate::errors::OrchestratorError;
use crate::journal::ChunkJournal;
use crate::manifest::{ChunkState, Manifest, ManifestStore, RunStatus};
use crate::provider::{Provider, get_step_provider};
use crate::runlog::RunLog;
use crate::runner::aggregate::{AggregateRunner, OUTPUTS_DIR};
use crate::runner::{StepProgress, max_retry_count};

/// Grace period for saving the manifest as `paused` on SIGINT/SIGTERM.
pub const SIGINT_SAVE_TIMEOUT: Duration = Duration::from_secs(5);

pub const CONFIG_DIR: &str = "config";
pub const CONFIG_FILE: &str = "config.yaml";

pub struct Orchestrator {
    run_dir: PathBuf,
    config: PipelineConfig,
    store: ManifestStore,
    log: RunLog,
    providers: BTreeMap<String, Arc<dyn Provider>>,
    provider_override: Option<Arc<dyn Provider>>,
}

impl Orchestrator {
    /// Open an existing run directory (its config snapshot is the source
    /// of truth; the original config tree is never consulted again).
    pub fn open(run_dir: &Path) -> anyhow::Result<Self> {
        let config_path = run_dir.join(CONFIG_DIR).join(CONFIG_FILE);
        let config = PipelineConfig::load(&config_path)
            .with_context(|| format!("Run directory {} has no config snapshot", run_dir.display()))?;
        Ok(Self {
            run_dir: run_dir.to_path_buf(),
            config,
            store: ManifestStore::new(run_dir),
            log: RunLog::new(run_dir),
            providers: BTreeMap::new(),
            provider_override: None,
        })
    }

    /// Use one provider instance for every step, bypassing the factory.
    /// Embedders and tests plug scripted providers in through this.
    pub fn override_provider(&mut self, provider: Arc<dyn Provider>) {
        self.provider_override = Some(provider);
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    pub fn load_manifest(&self) -> Result<Manifest, OrchestratorError> {
        self.store.load()
    }

    pub fn save_manifest(&mut self, manifest: &mut Manifest) -> Result<(), OrchestratorError> {
        self.store.save(manifest)
    }

    /// Claim the writer role for this run, or refuse if another live
    /// orchestrator owns it.
    pub fn acquire_writer(&self) -> Result<(), OrchestratorError> {
        pid::check_single_writer(&self.run_dir)?;
        pid::write_pid_file(&self.run_dir).map_err(OrchestratorError::Other)?;
        Ok(())
    }

    /// Provider for a step, honouring per-step overrides. Cached per
    /// (provider, model) pair so repeated ticks reuse HTTP clients.
    pub(crate) fn step_provider(
        &mut self,
        step_name: &str,
    ) -> Result<Arc<dyn Provider>, OrchestratorError> {
        if let Some(provider) = &self.provider_override {
            return Ok(Arc::clone(provider));
        }
        let step = self
            .config
            .step(step_name)
            .ok_or_else(|| OrchestratorError::UnknownStep(step_name.to_string()))?;
        let key = format!(
            "{}/{}",
            step.provider.as_deref().unwrap_or(self.config.api.provider.as_str()),
            step.model
                .as_deref()
                .or(self.config.api.model.as_deref())
                .unwrap_or("default"),
        );
        if let Some(provider) = self.providers.get(&key) {
            return Ok(Arc::clone(provider));
        }
        let provider = get_step_provider(&self.config.api, step)?;
        self.providers.insert(key, Arc::clone(&provider));
        Ok(provider)
    }

    /// Record a step's completion for a chunk: advance to the next
    /// step's `_PENDING` (or `VALIDATED`), refresh counters from the
    /// journal, and clear the batch bookkeeping.
    pub(crate) fn apply_step_completion(
        &self,
        manifest: &mut Manifest,
        chunk_name: &str,
        step: &str,
        progress: &StepProgress,
    ) -> Result<(), OrchestratorError> {
        let journal = ChunkJournal::new(&self.run_dir, chunk_name);
        let retries = max_retry_count(
            &journal
                .latest_failures(step)
                .map_err(OrchestratorError::Other)?,
        );
        let next = manifest.state_after(step);
        let Some(chunk) = manifest.chunks.get_mut(chunk_name) else {
            return Ok(());
        };
        chunk.state = next.encode();
        chunk.valid = progress.validated;
        chunk.failed = progress.hard_failed;
        chunk.retries = retries;
        chunk.batch_id = None;
        chunk.submitted_at = None;
        let new_state = chunk.state.clone();
        self.log.log(
            "STATE",
            &format!(
                "{chunk_name}: {step} complete ({} valid, {} failed) -> {new_state}",
                progress.validated, progress.hard_failed
            ),
        );
        Ok(())
    }

    pub(crate) fn mark_chunk_failed(&self, manifest: &mut Manifest, chunk_name: &str, reason: &str) {
        if let Some(chunk) = manifest.chunks.get_mut(chunk_name) {
            chunk.state = ChunkState::Failed.encode();
            chunk.batch_id = None;
        }
        self.log
            .log("ERROR", &format!("{chunk_name} marked FAILED: {reason}"));
    }

    pub(crate) fn mark_run_failed(
        &mut self,
        manifest: &mut Manifest,
        message: &str,
    ) -> Result<(), OrchestratorError> {
        manifest.status = RunStatus::Failed;
        manifest.error_message = Some(message.to_string());
        manifest.failed_at = Some(Utc::now());
        self.log.log("ERROR", &format!("run failed: {message}"));
        self.store.save(manifest)
    }

    /// When every chunk is terminal: run any run-scope steps once, then
    /// settle the final status. All-failed chunks are a structural
    /// failure; otherwise the run completes (with per-unit failures
    /// recorded in the journals).
    pub(crate) async fn finish_if_terminal(
        &mut self,
        manifest: &mut Manifest,
    ) -> Result<bool, OrchestratorError> {
        if manifest.status.is_terminal() {
            return Ok(true);
        }
        if !manifest.all_chunks_terminal() {
            return Ok(false);
        }

        let any_validated = manifest
            .chunks
            .values()
            .any(|c| matches!(c.decoded_state(), Some(ChunkState::Validated)));
        if !any_validated {
            self.mark_run_failed(manifest, "all chunks failed")?;
            return Ok(true);
        }

        let run_steps: Vec<_> = self.config.run_scope_steps().into_iter().cloned().collect();
        for step in run_steps {
            let output_path = self
                .run_dir
                .join(OUTPUTS_DIR)
                .join(format!("{}.json", step.name));
            if output_path.exists() {
                continue;
            }
            let provider = if self.config.template_for(&step).is_some() {
                Some(self.step_provider(&step.name)?)
            } else {
                None
            };
            let runner = AggregateRunner {
                config: &self.config,
                run_dir: &self.run_dir,
                log: &self.log,
            };
            if let Err(e) = runner.run_step(&step, provider).await {
                self.mark_run_failed(manifest, &format!("run-scope step '{}': {e}", step.name))?;
                return Ok(true);
            }
        }

        manifest.status = RunStatus::Complete;
        if manifest.completed_at.is_none() {
            manifest.completed_at = Some(Utc::now());
        }
        self.store.save(manifest)?;
        self.log.log("PROGRESS", "run complete (100%)");
        Ok(true)
    }

    /// Mark the run paused (signal handling and cost/time caps).
    pub(crate) fn pause(&mut self, reason: &str) -> Result<(), OrchestratorError> {
        let mut manifest = self.store.load()?;
        if manifest.status.is_terminal() {
            return Ok(());
        }
        manifest.status = RunStatus::Paused;
        manifest.paused_at = Some(Utc::now());
        self.store.save(&mut manifest)?;
        self.log.log("STATE", &format!("run paused: {reason}"));
        Ok(())
    }
}
