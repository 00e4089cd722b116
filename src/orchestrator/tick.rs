//! One step of the batch state machine.
//!
//! For every non-terminal chunk: a `{step}_PENDING` chunk is submitted
//! (expression steps execute inline), a `{step}_SUBMITTED` chunk is
//! polled and, when its batch completes, collected and validated. No
//! more than `max_inflight_batches` chunks are `_SUBMITTED` at once;
//! submissions past the cap wait for a later tick.

use crate::config::StepScope;
use crate::errors::OrchestratorError;
use crate::manifest::{ChunkState, Manifest, RunStatus};
use crate::provider::BatchStatus;
use crate::runner::TokenTally;
use crate::runner::expression::ExpressionRunner;
use crate::runner::llm::{LlmRunner, SubmitOutcome};

use super::Orchestrator;

/// What one tick accomplished.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickOutcome {
    /// Any chunk changed state or produced new records.
    pub progressed: bool,
    /// The run is in a terminal status after this tick.
    pub terminal: bool,
}

impl Orchestrator {
    /// Advance the run by one tick. Fatal provider errors (authentication)
    /// mark the run failed and surface as `Err`.
    pub async fn tick(&mut self) -> Result<TickOutcome, OrchestratorError> {
        let mut manifest = self.load_manifest()?;
        if manifest.status.is_terminal() {
            return Ok(TickOutcome {
                progressed: false,
                terminal: true,
            });
        }
        if manifest.status != RunStatus::Running {
            manifest.status = RunStatus::Running;
            manifest.paused_at = None;
            self.save_manifest(&mut manifest)?;
        }

        self.log().log("TICK", &format!("tick ({}%)", manifest.progress()));
        let chunk_names: Vec<String> = manifest.chunks.keys().cloned().collect();
        let mut progressed = false;

        for chunk_name in &chunk_names {
            let state_text = match manifest.chunks.get(chunk_name) {
                Some(chunk) => chunk.state.clone(),
                None => continue,
            };
            let Some(state) = ChunkState::parse(&state_text) else {
                // corrupt state fails the chunk, never the run
                let corrupt = OrchestratorError::CorruptChunkState {
                    chunk: chunk_name.clone(),
                    state: state_text,
                };
                self.mark_chunk_failed(&mut manifest, chunk_name, &corrupt.to_string());
                self.save_manifest(&mut manifest)?;
                progressed = true;
                continue;
            };

            let changed = match state {
                ChunkState::Validated | ChunkState::Failed => false,
                ChunkState::Pending(step) => {
                    self.dispatch_pending(&mut manifest, chunk_name, &step).await?
                }
                ChunkState::Submitted(step) => {
                    self.poll_submitted(&mut manifest, chunk_name, &step).await?
                }
            };
            progressed |= changed;
        }

        let terminal = self.finish_if_terminal(&mut manifest).await?;
        if progressed && !terminal {
            self.save_manifest(&mut manifest)?;
            self.log().log(
                "PROGRESS",
                &format!("{}% ({} in flight)", manifest.progress(), manifest.inflight_count()),
            );
        }
        Ok(TickOutcome { progressed, terminal })
    }

    /// Handle a `{step}_PENDING` chunk: run expression steps inline,
    /// submit a provider batch for LLM steps.
    async fn dispatch_pending(
        &mut self,
        manifest: &mut Manifest,
        chunk_name: &str,
        step: &str,
    ) -> Result<bool, OrchestratorError> {
        let pipeline = manifest.pipeline.clone();
        let step_config = self
            .config()
            .step(step)
            .ok_or_else(|| OrchestratorError::UnknownStep(step.to_string()))?
            .clone();

        if step_config.scope == StepScope::Expression {
            let runner = ExpressionRunner {
                run_dir: self.run_dir(),
                log: self.log(),
                lenient: false,
            };
            self.log()
                .log("EXPRESSION", &format!("{chunk_name}/{step} evaluating"));
            let progress = runner.run_chunk(&pipeline, chunk_name, &step_config)?;
            self.apply_step_completion(manifest, chunk_name, step, &progress)?;
            self.save_manifest(manifest)?;
            return Ok(true);
        }

        if manifest.inflight_count() >= self.config().api.max_inflight_batches {
            self.log().log(
                "TICK",
                &format!("{chunk_name}/{step} deferred (inflight cap reached)"),
            );
            return Ok(false);
        }

        let provider = match self.step_provider(step) {
            Ok(provider) => provider,
            Err(OrchestratorError::Provider(e)) if e.is_fatal() => {
                self.mark_run_failed(manifest, &e.to_string())?;
                return Err(OrchestratorError::Provider(e));
            }
            Err(e) => return Err(e),
        };
        let outcome = {
            let runner = LlmRunner {
                config: self.config(),
                run_dir: self.run_dir(),
                provider,
                log: self.log(),
            };
            runner.submit_batch(&pipeline, chunk_name, step).await
        };

        match outcome {
            Ok(SubmitOutcome::AlreadyComplete(progress)) => {
                self.apply_step_completion(manifest, chunk_name, step, &progress)?;
                self.save_manifest(manifest)?;
                Ok(true)
            }
            Ok(SubmitOutcome::Submitted { batch_id, unit_count }) => {
                self.log().log(
                    "SUBMIT",
                    &format!("{chunk_name}/{step}: {unit_count} unit(s) as batch {batch_id}"),
                );
                if let Some(chunk) = manifest.chunks.get_mut(chunk_name) {
                    chunk.state = ChunkState::Submitted(step.to_string()).encode();
                    chunk.batch_id = Some(batch_id);
                    chunk.submitted_at = Some(chrono::Utc::now());
                }
                self.save_manifest(manifest)?;
                Ok(true)
            }
            Ok(SubmitOutcome::Deferred(_)) => Ok(false),
            Err(OrchestratorError::Provider(e)) if e.is_fatal() => {
                self.mark_run_failed(manifest, &e.to_string())?;
                Err(OrchestratorError::Provider(e))
            }
            Err(OrchestratorError::Provider(e)) => {
                self.mark_chunk_failed(manifest, chunk_name, &e.to_string());
                self.save_manifest(manifest)?;
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Handle a `{step}_SUBMITTED` chunk: poll its batch and collect on
    /// completion.
    async fn poll_submitted(
        &mut self,
        manifest: &mut Manifest,
        chunk_name: &str,
        step: &str,
    ) -> Result<bool, OrchestratorError> {
        let pipeline = manifest.pipeline.clone();
        let Some(batch_id) = manifest
            .chunks
            .get(chunk_name)
            .and_then(|c| c.batch_id.clone())
        else {
            // submitted with no batch id is unrecoverable bookkeeping loss;
            // fall back to resubmission
            if let Some(chunk) = manifest.chunks.get_mut(chunk_name) {
                chunk.state = ChunkState::Pending(step.to_string()).encode();
            }
            self.log().log(
                "ERROR",
                &format!("{chunk_name}/{step} was SUBMITTED without a batch_id; resubmitting"),
            );
            self.save_manifest(manifest)?;
            return Ok(true);
        };

        let provider = self.step_provider(step)?;
        let status_info = match provider.get_batch_status(&batch_id).await {
            Ok(info) => info,
            Err(e) if e.is_fatal() => {
                self.mark_run_failed(manifest, &e.to_string())?;
                return Err(OrchestratorError::Provider(e));
            }
            Err(e) => {
                // transient poll failures just wait for the next tick
                self.log()
                    .log("POLL", &format!("{chunk_name}/{step} poll failed: {e}"));
                return Ok(false);
            }
        };
        self.log().log(
            "POLL",
            &format!(
                "{chunk_name}/{step} batch {batch_id}: {}{}",
                status_info.status,
                status_info
                    .progress
                    .as_deref()
                    .map(|p| format!(" ({p})"))
                    .unwrap_or_default()
            ),
        );

        match status_info.status {
            BatchStatus::Pending | BatchStatus::Running => Ok(false),
            BatchStatus::Failed | BatchStatus::Cancelled => {
                let reason = status_info
                    .error
                    .unwrap_or_else(|| format!("batch {}", status_info.status));
                self.mark_chunk_failed(manifest, chunk_name, &reason);
                self.save_manifest(manifest)?;
                Ok(true)
            }
            BatchStatus::Completed => {
                let collected = {
                    let runner = LlmRunner {
                        config: self.config(),
                        run_dir: self.run_dir(),
                        provider: std::sync::Arc::clone(&provider),
                        log: self.log(),
                    };
                    runner.collect_batch(&pipeline, chunk_name, step, &batch_id).await
                };
                match collected {
                    Ok((progress, tally)) => {
                        self.log().log(
                            "COLLECT",
                            &format!(
                                "{chunk_name}/{step}: {} valid, {} hard-failed",
                                progress.validated, progress.hard_failed
                            ),
                        );
                        apply_tokens(manifest, &tally);
                        if progress.complete {
                            self.apply_step_completion(manifest, chunk_name, step, &progress)?;
                        } else {
                            // validation retries remain; resubmit next tick
                            self.log().log(
                                "VALIDATE",
                                &format!("{chunk_name}/{step} has retryable failures, resubmitting"),
                            );
                            if let Some(chunk) = manifest.chunks.get_mut(chunk_name) {
                                chunk.state = ChunkState::Pending(step.to_string()).encode();
                                chunk.valid = progress.validated;
                                chunk.failed = progress.hard_failed;
                                chunk.batch_id = None;
                                chunk.submitted_at = None;
                                chunk.retries += 1;
                            }
                        }
                        self.save_manifest(manifest)?;
                        Ok(true)
                    }
                    Err(OrchestratorError::Provider(e)) if e.is_fatal() => {
                        self.mark_run_failed(manifest, &e.to_string())?;
                        Err(OrchestratorError::Provider(e))
                    }
                    Err(OrchestratorError::Provider(e)) => {
                        self.log().log(
                            "ERROR",
                            &format!("{chunk_name}/{step} collect failed: {e}; will retry"),
                        );
                        Ok(false)
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }
}

pub(crate) fn apply_tokens(manifest: &mut Manifest, tally: &TokenTally) {
    if tally.is_empty() {
        return;
    }
    let meta = &mut manifest.metadata;
    meta.initial_input_tokens += tally.initial_input;
    meta.initial_output_tokens += tally.initial_output;
    meta.retry_input_tokens += tally.retry_input;
    meta.retry_output_tokens += tally.retry_output;
}
