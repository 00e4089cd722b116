//! Run-scope runner: steps that execute once over the aggregated outputs
//! after every chunk has validated. Artefacts land in the run's
//! `outputs/` directory rather than per chunk; a run-scope failure marks
//! the whole run failed.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde_json::{Map, Value as JsonValue, json};

use crate::config::{PipelineConfig, StepConfig};
use crate::errors::OrchestratorError;
use crate::expr::{self, Evaluator, Namespace, Value};
use crate::journal::{ChunkJournal, list_chunks};
use crate::prompt::render_prompt;
use crate::provider::Provider;
use crate::runlog::RunLog;
use crate::util::parse_json_response;

pub const OUTPUTS_DIR: &str = "outputs";

pub struct AggregateRunner<'a> {
    pub config: &'a PipelineConfig,
    pub run_dir: &'a Path,
    pub log: &'a RunLog,
}

impl<'a> AggregateRunner<'a> {
    /// Collect every unit's final record: the last chunk-scope step's
    /// validated output, across all chunks.
    pub fn final_records(&self) -> Result<Vec<JsonValue>, OrchestratorError> {
        let pipeline = self.config.chunk_scope_step_names();
        let Some(last_step) = pipeline.last() else {
            return Ok(Vec::new());
        };
        let mut records = Vec::new();
        for chunk_name in list_chunks(self.run_dir).map_err(OrchestratorError::Other)? {
            let journal = ChunkJournal::new(self.run_dir, &chunk_name);
            records.extend(
                journal
                    .read_validated(last_step)
                    .map_err(OrchestratorError::Other)?,
            );
        }
        Ok(records)
    }

    /// Execute one run-scope step and write `outputs/{step}.json`.
    pub async fn run_step(
        &self,
        step: &StepConfig,
        provider: Option<Arc<dyn Provider>>,
    ) -> Result<(), OrchestratorError> {
        let records = self.final_records()?;
        let output = if !step.expressions.is_empty() {
            self.run_expressions(step, &records)?
        } else if self.config.template_for(step).is_some() {
            self.run_prompt(step, &records, provider).await?
        } else {
            return Err(OrchestratorError::Other(anyhow::anyhow!(
                "run-scope step '{}' has neither expressions nor a prompt template",
                step.name
            )));
        };

        let outputs_dir = self.run_dir.join(OUTPUTS_DIR);
        std::fs::create_dir_all(&outputs_dir)
            .with_context(|| format!("Failed to create {}", outputs_dir.display()))
            .map_err(OrchestratorError::Other)?;
        let path = outputs_dir.join(format!("{}.json", step.name));
        let pretty = serde_json::to_string_pretty(&output)
            .context("Failed to serialize run-scope output")
            .map_err(OrchestratorError::Other)?;
        std::fs::write(&path, pretty)
            .with_context(|| format!("Failed to write {}", path.display()))
            .map_err(OrchestratorError::Other)?;

        self.log.log(
            "STATE",
            &format!("run-scope step '{}' wrote {}", step.name, path.display()),
        );
        Ok(())
    }

    /// Expression form: the namespace sees `units` (the list of final
    /// records) and `count`, evaluated with the run's base seed.
    fn run_expressions(
        &self,
        step: &StepConfig,
        records: &[JsonValue],
    ) -> Result<JsonValue, OrchestratorError> {
        let mut ns = Namespace::new();
        ns.insert(
            "units".into(),
            Value::from_json(&JsonValue::Array(records.to_vec())),
        );
        ns.insert("count".into(), Value::Int(records.len() as i64));
        let mut evaluator = Evaluator::new(self.config.processing.seed);

        let blocks = [&step.init, &step.expressions];
        for block in blocks {
            let pairs = expr::ordered_pairs(block)
                .map_err(|e| OrchestratorError::Other(anyhow::anyhow!("{e}")))?;
            for (name, text) in pairs {
                let parsed = expr::parse(&text).map_err(|e| {
                    OrchestratorError::Other(anyhow::anyhow!("'{name}' = '{text}': {e}"))
                })?;
                let value = evaluator.eval(&parsed, &ns).map_err(|e| {
                    OrchestratorError::Other(anyhow::anyhow!("'{name}' = '{text}': {e}"))
                })?;
                ns.insert(name, value);
            }
        }

        let mut fields = Map::new();
        for (name, value) in &ns {
            if name.starts_with('_') || name == "units" {
                continue;
            }
            fields.insert(name.clone(), value.to_json());
        }
        Ok(JsonValue::Object(fields))
    }

    /// Prompt form: one realtime call over the aggregate context.
    async fn run_prompt(
        &self,
        step: &StepConfig,
        records: &[JsonValue],
        provider: Option<Arc<dyn Provider>>,
    ) -> Result<JsonValue, OrchestratorError> {
        let provider = provider.ok_or_else(|| {
            OrchestratorError::Other(anyhow::anyhow!(
                "run-scope step '{}' needs a provider",
                step.name
            ))
        })?;
        let file = self.config.template_for(step).ok_or_else(|| {
            OrchestratorError::Other(anyhow::anyhow!(
                "run-scope step '{}' lost its prompt template",
                step.name
            ))
        })?;
        let path = self.run_dir.join("config").join("templates").join(file);
        let template = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read template {}", path.display()))
            .map_err(OrchestratorError::Other)?;

        let context = json!({"units": records, "count": records.len()});
        let prompt = render_prompt(&template, &context).map_err(OrchestratorError::Other)?;
        let result = provider.generate_realtime(&prompt, None).await?;
        self.log.trace_call(
            provider.name(),
            "run",
            &step.name,
            0.0,
            &result.finish_reason,
        );

        Ok(match parse_json_response(&result.content) {
            Some(parsed) => parsed,
            None => json!({"text": result.content}),
        })
    }
}
