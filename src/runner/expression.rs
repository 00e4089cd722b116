//! Chunk-expression runner: per-unit evaluation of an expression step's
//! init/body/loop_until program. No provider involved.

use std::path::Path;

use serde_json::{Map, Value as JsonValue, json};

use crate::config::StepConfig;
use crate::errors::OrchestratorError;
use crate::expr::{self, Evaluator, Namespace, Value};
use crate::journal::ChunkJournal;
use crate::runlog::RunLog;
use crate::validator::{FailureRecord, FailureStage, StructuredError};

use super::{StepProgress, participants, unit_seed};

pub struct ExpressionRunner<'a> {
    pub run_dir: &'a Path,
    pub log: &'a RunLog,
    /// Lenient mode (revalidate / pre-flight): an expression error binds
    /// `0` for the failing name and evaluation continues, limiting
    /// downstream cascading. In production an error fails the unit.
    pub lenient: bool,
}

/// The outcome of one unit's program: final namespace and iteration count.
struct ProgramResult {
    namespace: Namespace,
    iterations: u32,
}

impl<'a> ExpressionRunner<'a> {
    /// Run the step for every unit of the chunk not yet accounted for.
    /// Expression failures are terminal for the unit: re-evaluating a
    /// deterministic program cannot change the outcome.
    pub fn run_chunk(
        &self,
        pipeline: &[String],
        chunk_name: &str,
        step: &StepConfig,
    ) -> Result<StepProgress, OrchestratorError> {
        let journal = ChunkJournal::new(self.run_dir, chunk_name);
        let units =
            participants(&journal, pipeline, &step.name).map_err(OrchestratorError::Other)?;
        let validated = journal
            .validated_ids(&step.name)
            .map_err(OrchestratorError::Other)?;
        let failures = journal
            .latest_failures(&step.name)
            .map_err(OrchestratorError::Other)?;

        let mut progress = StepProgress {
            validated: 0,
            hard_failed: 0,
            complete: true,
        };

        for unit in &units {
            let Some(unit_id) = unit.get("unit_id").and_then(JsonValue::as_str) else {
                continue;
            };
            if validated.contains(unit_id) {
                progress.validated += 1;
                continue;
            }
            if failures.contains_key(unit_id) {
                progress.hard_failed += 1;
                continue;
            }

            match self.run_unit(unit, step) {
                Ok(result) => {
                    let record = output_record(unit_id, &result);
                    journal
                        .append_validated(&step.name, &record)
                        .map_err(OrchestratorError::Other)?;
                    progress.validated += 1;
                }
                Err(message) => {
                    self.log.log(
                        "EXPRESSION",
                        &format!("{chunk_name}/{} failed for {unit_id}: {message}", step.name),
                    );
                    let failure = FailureRecord {
                        unit_id: unit_id.to_string(),
                        failure_stage: FailureStage::Validation,
                        errors: vec![StructuredError::new(&step.name, message)],
                        retry_count: 0,
                        raw_text: None,
                        input: None,
                    };
                    journal
                        .append_failure(&step.name, &failure.to_json())
                        .map_err(OrchestratorError::Other)?;
                    progress.hard_failed += 1;
                }
            }
        }

        journal
            .clear_reset_sentinel(&step.name)
            .map_err(OrchestratorError::Other)?;
        Ok(progress)
    }

    /// Evaluate the init block, then the body per iteration until
    /// `loop_until` is truthy or `max_iterations` is hit.
    fn run_unit(&self, unit: &JsonValue, step: &StepConfig) -> Result<ProgramResult, String> {
        let mut ns = unit_namespace(unit);
        let mut evaluator = Evaluator::new(unit_seed(unit));

        let init = expr::ordered_pairs(&step.init).map_err(|e| e.to_string())?;
        let body = expr::ordered_pairs(&step.expressions).map_err(|e| e.to_string())?;

        for (name, text) in &init {
            let value = self.eval_binding(&mut evaluator, name, text, &ns)?;
            ns.insert(name.clone(), value);
        }

        let mut iterations = 0u32;
        let max_iterations = step.max_iterations.max(1);
        loop {
            for (name, text) in &body {
                let value = self.eval_binding(&mut evaluator, name, text, &ns)?;
                ns.insert(name.clone(), value);
            }
            iterations += 1;

            let Some(condition) = &step.loop_until else {
                break;
            };
            let done = expr::parse(condition)
                .and_then(|parsed| evaluator.eval(&parsed, &ns))
                .map_err(|e| format!("loop_until '{condition}': {e}"))?;
            if done.is_truthy() || iterations >= max_iterations {
                break;
            }
        }

        Ok(ProgramResult { namespace: ns, iterations })
    }

    fn eval_binding(
        &self,
        evaluator: &mut Evaluator,
        name: &str,
        text: &str,
        ns: &Namespace,
    ) -> Result<Value, String> {
        match expr::parse(text).and_then(|parsed| evaluator.eval(&parsed, ns)) {
            Ok(value) => Ok(value),
            Err(e) if self.lenient => {
                self.log.log(
                    "EXPRESSION",
                    &format!("'{name}' = '{text}' errored ({e}); binding 0"),
                );
                Ok(Value::Int(0))
            }
            Err(e) => Err(format!("'{name}' = '{text}': {e}")),
        }
    }
}

/// Seed the namespace with the unit's fields. `unit_id`,
/// `_repetition_seed` and `_repetition_id` ride along as ordinary names.
fn unit_namespace(unit: &JsonValue) -> Namespace {
    let mut ns = Namespace::new();
    if let Some(object) = unit.as_object() {
        for (key, value) in object {
            if key == "_metadata" {
                continue;
            }
            ns.insert(key.clone(), Value::from_json(value));
        }
    }
    ns.entry("_repetition_id".into()).or_insert(Value::Int(0));
    ns.entry("_repetition_seed".into()).or_insert(Value::Int(0));
    ns
}

/// The validated record: the final namespace minus private `_`-prefixed
/// names, plus `_metadata.iterations`.
fn output_record(unit_id: &str, result: &ProgramResult) -> JsonValue {
    let mut fields = Map::new();
    for (name, value) in &result.namespace {
        if name.starts_with('_') {
            continue;
        }
        fields.insert(name.clone(), value.to_json());
    }
    fields.insert("unit_id".into(), json!(unit_id));
    fields.insert("_metadata".into(), json!({"iterations": result.iterations}));
    JsonValue::Object(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StepScope;
    use tempfile::tempdir;

    fn expression_step(
        init: &str,
        body: &str,
        loop_until: Option<&str>,
        max_iterations: u32,
    ) -> StepConfig {
        let mapping = |src: &str| -> serde_yaml::Mapping {
            if src.is_empty() {
                serde_yaml::Mapping::new()
            } else {
                serde_yaml::from_str(src).unwrap()
            }
        };
        StepConfig {
            name: "sim".into(),
            scope: StepScope::Expression,
            prompt_template: None,
            provider: None,
            model: None,
            init: mapping(init),
            expressions: mapping(body),
            loop_until: loop_until.map(String::from),
            max_iterations,
        }
    }

    fn runner_fixture(dir: &Path) -> RunLog {
        RunLog::new(dir)
    }

    fn setup_units(run_dir: &Path, units: &[JsonValue]) -> ChunkJournal {
        let journal = ChunkJournal::new(run_dir, "chunk_000");
        std::fs::create_dir_all(journal.dir()).unwrap();
        journal.write_units(units).unwrap();
        journal
    }

    #[test]
    fn loop_runs_until_condition() {
        let dir = tempdir().unwrap();
        let log = runner_fixture(dir.path());
        let journal = setup_units(dir.path(), &[json!({"unit_id": "u1"})]);
        let step = expression_step("x: '0'", "x: 'x + 1'", Some("x >= 3"), 10);

        let runner = ExpressionRunner {
            run_dir: dir.path(),
            log: &log,
            lenient: false,
        };
        let progress = runner
            .run_chunk(&["sim".to_string()], "chunk_000", &step)
            .unwrap();

        assert_eq!(progress.validated, 1);
        assert!(progress.complete);
        let records = journal.read_validated("sim").unwrap();
        assert_eq!(records[0]["x"], 3);
        assert_eq!(records[0]["_metadata"]["iterations"], 3);
    }

    #[test]
    fn max_iterations_caps_the_loop() {
        let dir = tempdir().unwrap();
        let log = runner_fixture(dir.path());
        let journal = setup_units(dir.path(), &[json!({"unit_id": "u1"})]);
        let step = expression_step("x: '0'", "x: 'x + 1'", Some("x >= 100"), 5);

        let runner = ExpressionRunner {
            run_dir: dir.path(),
            log: &log,
            lenient: false,
        };
        runner.run_chunk(&["sim".to_string()], "chunk_000", &step).unwrap();

        let records = journal.read_validated("sim").unwrap();
        assert_eq!(records[0]["x"], 5);
        assert_eq!(records[0]["_metadata"]["iterations"], 5);
    }

    #[test]
    fn sequential_namespace_binds_in_order() {
        let dir = tempdir().unwrap();
        let log = runner_fixture(dir.path());
        let journal = setup_units(dir.path(), &[json!({"unit_id": "u1", "base": 10})]);
        let step = expression_step(
            "offset: '5'",
            "doubled: 'base * 2'\ntotal: 'doubled + offset'",
            None,
            1,
        );

        let runner = ExpressionRunner {
            run_dir: dir.path(),
            log: &log,
            lenient: false,
        };
        runner.run_chunk(&["sim".to_string()], "chunk_000", &step).unwrap();

        let records = journal.read_validated("sim").unwrap();
        assert_eq!(records[0]["doubled"], 20);
        assert_eq!(records[0]["total"], 25);
        assert_eq!(records[0]["base"], 10);
    }

    #[test]
    fn private_names_are_stripped_from_output() {
        let dir = tempdir().unwrap();
        let log = runner_fixture(dir.path());
        let journal = setup_units(
            dir.path(),
            &[json!({"unit_id": "u1", "_repetition_id": 2, "_repetition_seed": 9})],
        );
        let step = expression_step("", "seeded: '_repetition_seed + 1'", None, 1);

        let runner = ExpressionRunner {
            run_dir: dir.path(),
            log: &log,
            lenient: false,
        };
        runner.run_chunk(&["sim".to_string()], "chunk_000", &step).unwrap();

        let records = journal.read_validated("sim").unwrap();
        assert_eq!(records[0]["seeded"], 10);
        assert!(records[0].get("_repetition_id").is_none());
        assert!(records[0].get("_repetition_seed").is_none());
    }

    #[test]
    fn production_error_fails_the_unit() {
        let dir = tempdir().unwrap();
        let log = runner_fixture(dir.path());
        let journal = setup_units(dir.path(), &[json!({"unit_id": "u1"})]);
        let step = expression_step("", "y: 'missing_name + 1'", None, 1);

        let runner = ExpressionRunner {
            run_dir: dir.path(),
            log: &log,
            lenient: false,
        };
        let progress = runner
            .run_chunk(&["sim".to_string()], "chunk_000", &step)
            .unwrap();

        assert_eq!(progress.hard_failed, 1);
        assert!(progress.complete);
        let failures = journal.read_failures("sim").unwrap();
        assert_eq!(failures[0]["failure_stage"], "validation");
    }

    #[test]
    fn lenient_mode_binds_zero_and_continues() {
        let dir = tempdir().unwrap();
        let log = runner_fixture(dir.path());
        let journal = setup_units(dir.path(), &[json!({"unit_id": "u1"})]);
        let step = expression_step("", "y: 'missing_name + 1'\nz: 'y + 1'", None, 1);

        let runner = ExpressionRunner {
            run_dir: dir.path(),
            log: &log,
            lenient: true,
        };
        let progress = runner
            .run_chunk(&["sim".to_string()], "chunk_000", &step)
            .unwrap();

        assert_eq!(progress.validated, 1);
        let records = journal.read_validated("sim").unwrap();
        assert_eq!(records[0]["y"], 0);
        assert_eq!(records[0]["z"], 1);
    }

    #[test]
    fn deterministic_per_seed_across_reruns() {
        let dir = tempdir().unwrap();
        let log = runner_fixture(dir.path());
        let unit = json!({"unit_id": "u1", "_repetition_seed": 42});
        let journal = setup_units(dir.path(), &[unit]);
        let step = expression_step("", "roll: 'random.randint(1, 1000)'", None, 1);

        let runner = ExpressionRunner {
            run_dir: dir.path(),
            log: &log,
            lenient: false,
        };
        runner.run_chunk(&["sim".to_string()], "chunk_000", &step).unwrap();
        let first = journal.read_validated("sim").unwrap()[0]["roll"].clone();

        // wipe and re-run: same seed, same draw
        std::fs::remove_file(journal.validated_path("sim")).unwrap();
        runner.run_chunk(&["sim".to_string()], "chunk_000", &step).unwrap();
        let second = journal.read_validated("sim").unwrap()[0]["roll"].clone();
        assert_eq!(first, second);
    }

    #[test]
    fn already_validated_units_are_skipped() {
        let dir = tempdir().unwrap();
        let log = runner_fixture(dir.path());
        let journal = setup_units(dir.path(), &[json!({"unit_id": "u1"})]);
        journal
            .append_validated("sim", &json!({"unit_id": "u1", "x": 99}))
            .unwrap();
        let step = expression_step("x: '0'", "x: 'x + 1'", None, 1);

        let runner = ExpressionRunner {
            run_dir: dir.path(),
            log: &log,
            lenient: false,
        };
        let progress = runner
            .run_chunk(&["sim".to_string()], "chunk_000", &step)
            .unwrap();

        assert_eq!(progress.validated, 1);
        // the original record is untouched
        let records = journal.read_validated("sim").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["x"], 99);
    }
}
