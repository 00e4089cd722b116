//! The watch loop (repeated ticks with signal handling and budget caps)
//! and the realtime driver.

use std::time::{Duration, Instant};

use crate::config::StepScope;
use crate::errors::OrchestratorError;
use crate::manifest::{ChunkState, RunStatus};
use crate::provider::registry;
use crate::runner::expression::ExpressionRunner;
use crate::runner::llm::LlmRunner;
use crate::runner::{StepProgress, TokenTally};

use super::tick::apply_tokens;
use super::{Orchestrator, SIGINT_SAVE_TIMEOUT};

/// Caps and cadence for `watch`.
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Seconds between ticks; defaults to the run's `poll_interval`.
    pub interval: Option<u64>,
    /// Pause the run once estimated cost exceeds this many USD.
    pub max_cost: Option<f64>,
    /// Pause the run after this much wall-clock time.
    pub timeout: Option<Duration>,
}

impl Orchestrator {
    /// Tick until the run is terminal, sleeping `interval` between
    /// ticks. SIGINT/SIGTERM saves the manifest as `paused` within
    /// [`SIGINT_SAVE_TIMEOUT`] and exits 130.
    pub async fn watch(&mut self, options: &WatchOptions) -> Result<(), OrchestratorError> {
        self.acquire_writer()?;
        let manifest = self.load_manifest()?;
        let interval = Duration::from_secs(
            options
                .interval
                .unwrap_or(manifest.metadata.poll_interval)
                .max(1),
        );
        let started = Instant::now();
        let reporter = crate::ui::ProgressReporter::new("watch");

        loop {
            let wake = tokio::select! {
                outcome = self.tick() => Wake::Finished(outcome),
                () = shutdown_signal() => Wake::Interrupted,
            };
            let outcome = match wake {
                Wake::Finished(outcome) => match outcome {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        reporter.abandon("failed");
                        return Err(e);
                    }
                },
                Wake::Interrupted => self.pause_and_exit(),
            };
            {
                let manifest = self.load_manifest()?;
                reporter.update(
                    manifest.progress(),
                    &format!("{} in flight", manifest.inflight_count()),
                );
            }
            if outcome.terminal {
                reporter.finish("terminal");
                break;
            }

            if let Some(limit) = options.max_cost {
                let cost = self.estimated_cost()?;
                if cost > limit {
                    self.log().log(
                        "STATE",
                        &format!("cost ${cost:.4} exceeds cap ${limit:.4}"),
                    );
                    self.pause("cost cap reached")?;
                    break;
                }
            }
            if let Some(timeout) = options.timeout {
                if started.elapsed() >= timeout {
                    self.pause("watch timeout reached")?;
                    break;
                }
            }

            let interrupted = tokio::select! {
                _ = tokio::time::sleep(interval) => false,
                () = shutdown_signal() => true,
            };
            if interrupted {
                self.pause_and_exit();
            }
        }
        Ok(())
    }

    /// Drive the run end-to-end synchronously: one unit at a time,
    /// chunk by chunk, expression steps interleaving naturally.
    pub async fn run_realtime(&mut self) -> Result<(), OrchestratorError> {
        self.acquire_writer()?;
        let mut manifest = self.load_manifest()?;
        if manifest.status.is_terminal() {
            return Ok(());
        }
        manifest.status = RunStatus::Running;
        manifest.paused_at = None;
        self.save_manifest(&mut manifest)?;

        let pipeline = manifest.pipeline.clone();
        let chunk_names: Vec<String> = manifest.chunks.keys().cloned().collect();

        for chunk_name in &chunk_names {
            loop {
                let state_text = match manifest.chunks.get(chunk_name) {
                    Some(chunk) => chunk.state.clone(),
                    None => break,
                };
                let Some(state) = ChunkState::parse(&state_text) else {
                    let corrupt = OrchestratorError::CorruptChunkState {
                        chunk: chunk_name.clone(),
                        state: state_text,
                    };
                    self.mark_chunk_failed(&mut manifest, chunk_name, &corrupt.to_string());
                    self.save_manifest(&mut manifest)?;
                    break;
                };
                // a chunk left SUBMITTED by an earlier batch run is
                // redone synchronously from its journal coverage
                let step = match state {
                    ChunkState::Validated | ChunkState::Failed => break,
                    ChunkState::Pending(step) | ChunkState::Submitted(step) => step,
                };

                let step_config = self
                    .config()
                    .step(&step)
                    .ok_or_else(|| OrchestratorError::UnknownStep(step.clone()))?
                    .clone();

                let wake = tokio::select! {
                    result = self.run_realtime_step(&pipeline, chunk_name, &step_config) => StepWake::Finished(result),
                    () = shutdown_signal() => StepWake::Interrupted,
                };
                let result = match wake {
                    StepWake::Finished(result) => result,
                    StepWake::Interrupted => self.pause_and_exit(),
                };
                match result {
                    Ok((progress, tally)) => {
                        apply_tokens(&mut manifest, &tally);
                        self.apply_step_completion(&mut manifest, chunk_name, &step, &progress)?;
                        self.save_manifest(&mut manifest)?;
                    }
                    Err(OrchestratorError::Provider(e)) if e.is_fatal() => {
                        self.mark_run_failed(&mut manifest, &e.to_string())?;
                        return Err(OrchestratorError::Provider(e));
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        self.finish_if_terminal(&mut manifest).await?;
        Ok(())
    }

    /// Run one step for one chunk synchronously. The token tally is
    /// returned for the caller to fold into its manifest: saving it here
    /// against a fresh load would race the caller's own copy.
    async fn run_realtime_step(
        &mut self,
        pipeline: &[String],
        chunk_name: &str,
        step_config: &crate::config::StepConfig,
    ) -> Result<(StepProgress, TokenTally), OrchestratorError> {
        if step_config.scope == StepScope::Expression {
            let runner = ExpressionRunner {
                run_dir: self.run_dir(),
                log: self.log(),
                lenient: false,
            };
            self.log().log(
                "EXPRESSION",
                &format!("{chunk_name}/{} evaluating", step_config.name),
            );
            let progress = runner.run_chunk(pipeline, chunk_name, step_config)?;
            return Ok((progress, TokenTally::default()));
        }

        let provider = self.step_provider(&step_config.name)?;
        let runner = LlmRunner {
            config: self.config(),
            run_dir: self.run_dir(),
            provider,
            log: self.log(),
        };
        runner
            .run_realtime(pipeline, chunk_name, &step_config.name)
            .await
    }

    /// Estimated cost of the run so far, from the manifest's token
    /// counters and the model registry.
    pub fn estimated_cost(&self) -> Result<f64, OrchestratorError> {
        let manifest = self.load_manifest()?;
        let meta = &manifest.metadata;
        Ok(registry::compute_cost(
            &meta.provider,
            &meta.model,
            meta.mode,
            meta.initial_input_tokens + meta.retry_input_tokens,
            meta.initial_output_tokens + meta.retry_output_tokens,
        ))
    }

    /// Signal path: save as `paused` within the deadline, then exit 130
    /// no matter what.
    fn pause_and_exit(&mut self) -> ! {
        let deadline = Instant::now() + SIGINT_SAVE_TIMEOUT;
        if let Ok(mut manifest) = self.load_manifest() {
            if !manifest.status.is_terminal() && Instant::now() < deadline {
                manifest.status = RunStatus::Paused;
                manifest.paused_at = Some(chrono::Utc::now());
                if let Err(e) = self.save_manifest(&mut manifest) {
                    tracing::error!("failed to save paused manifest on signal: {e}");
                }
                self.log().log("STATE", "run paused by signal");
            }
        }
        std::process::exit(130);
    }
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(stream) => stream,
            Err(_) => {
                std::future::pending::<()>().await;
                return;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(_) => {
                interrupt.recv().await;
                return;
            }
        };
        tokio::select! {
            _ = interrupt.recv() => {},
            _ = terminate.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Select outcome carriers: the handlers must not touch `self` while a
/// self-borrowing branch future is still alive, so the select arms only
/// wrap their results and the action happens afterwards.
enum Wake {
    Finished(Result<super::tick::TickOutcome, OrchestratorError>),
    Interrupted,
}

enum StepWake {
    Finished(Result<(StepProgress, TokenTally), OrchestratorError>),
    Interrupted,
}
