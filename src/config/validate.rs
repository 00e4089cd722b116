//! Config pre-flight: structural checks plus expression syntax checks.
//!
//! Runs before any run directory is created. Collects every problem into
//! one list rather than failing at the first, so an operator can fix a
//! config in a single pass.

use std::collections::BTreeMap;

use crate::expr::{self, Namespace, Value};

use super::{PipelineConfig, StepConfig, StepScope, StepValidation, Strategy};

const VALID_PROVIDERS: &[&str] = &["gemini", "openai", "anthropic"];

/// Validate a parsed config. Returns all error messages (empty if valid).
pub fn validate_config(config: &PipelineConfig) -> Vec<String> {
    let mut errors = Vec::new();

    if config.pipeline.steps.is_empty() {
        errors.push("'pipeline.steps' is empty".to_string());
    }

    for (i, step) in config.pipeline.steps.iter().enumerate() {
        if step.name.is_empty() {
            errors.push(format!("Pipeline step {i} missing 'name'"));
            continue;
        }
        let name = &step.name;

        if step.scope == StepScope::Expression && step.expressions.is_empty() {
            errors.push(format!("Expression step '{name}' has an empty expressions block"));
        }
        if step.scope == StepScope::Chunk && config.template_for(step).is_none() {
            errors.push(format!(
                "Chunk step '{name}' has no prompt template ('prompt_template' or 'prompts.{name}')"
            ));
        }
        if let Some(provider) = &step.provider {
            if !VALID_PROVIDERS.contains(&provider.to_lowercase().as_str()) {
                errors.push(format!(
                    "Pipeline step '{name}' has invalid provider '{provider}'. Valid: {VALID_PROVIDERS:?}"
                ));
            }
        }

        validate_step_expressions(step, &mut errors);
    }

    let duplicates = duplicate_names(&config.pipeline.steps);
    for dup in duplicates {
        errors.push(format!("Duplicate pipeline step name '{dup}'"));
    }

    if config.processing.chunk_size == 0 {
        errors.push("'processing.chunk_size' must be at least 1".to_string());
    }
    match config.processing.strategy {
        Strategy::Permutation | Strategy::CrossProduct => {
            if config.processing.positions.is_empty() {
                errors.push(format!(
                    "Missing 'processing.positions' (required for {:?} strategy)",
                    config.processing.strategy
                ));
            }
        }
        Strategy::Direct => {}
    }
    if config.processing.strategy == Strategy::CrossProduct {
        for position in &config.processing.positions {
            if position.source_key().is_none() {
                errors.push(format!(
                    "Position '{}' needs a 'source_key' under the cross_product strategy",
                    position.name()
                ));
            }
        }
    }
    if config.processing.items.source.is_none() && config.processing.items.key.is_none() {
        errors.push("Missing 'processing.items.source' or 'processing.items.key'".to_string());
    }
    if let Some(repeat) = config.processing.repeat {
        if repeat < 1 {
            errors.push("'processing.repeat' must be at least 1".to_string());
        }
    }
    let threshold = config.processing.resume_coverage_threshold;
    if !(0.0..=1.0).contains(&threshold) {
        errors.push(format!(
            "'processing.resume_coverage_threshold' must be within [0, 1], got {threshold}"
        ));
    }

    if config.has_llm_steps() {
        if !VALID_PROVIDERS.contains(&config.api.provider.to_lowercase().as_str()) {
            errors.push(format!(
                "Invalid 'api.provider' '{}'. Valid: {VALID_PROVIDERS:?}",
                config.api.provider
            ));
        }
        if config.api.model.is_none() {
            errors.push("Missing 'api.model' (required when pipeline has LLM steps)".to_string());
        }
    }

    for (step_name, validation) in &config.validation {
        if config.step(step_name).is_none() {
            errors.push(format!(
                "Validation section references unknown step '{step_name}'"
            ));
        }
        validate_rules(step_name, validation, &mut errors);
    }

    errors
}

fn duplicate_names(steps: &[StepConfig]) -> Vec<String> {
    let mut seen = BTreeMap::new();
    let mut duplicates = Vec::new();
    for step in steps {
        let count = seen.entry(step.name.clone()).or_insert(0u32);
        *count += 1;
        if *count == 2 {
            duplicates.push(step.name.clone());
        }
    }
    duplicates
}

fn validate_step_expressions(step: &StepConfig, errors: &mut Vec<String>) {
    let blocks = [("init", &step.init), ("expressions", &step.expressions)];
    let mut mock = mock_expression_namespace();

    for (block_name, mapping) in blocks {
        let pairs = match expr::ordered_pairs(mapping) {
            Ok(pairs) => pairs,
            Err(e) => {
                errors.push(format!("Step '{}' {block_name} block: {e}", step.name));
                continue;
            }
        };
        for (name, text) in pairs {
            match check_expression(&text, &mock) {
                Ok(value) => {
                    mock.insert(name, value);
                }
                Err(message) => {
                    errors.push(format!(
                        "Step '{}' expression '{name}' is invalid: {message}",
                        step.name
                    ));
                    mock.insert(name, Value::Int(0));
                }
            }
        }
    }

    if let Some(loop_until) = &step.loop_until {
        if let Err(message) = check_expression(loop_until, &mock) {
            errors.push(format!(
                "Step '{}' loop_until is invalid: {message}",
                step.name
            ));
        }
    }
}

fn validate_rules(step_name: &str, validation: &StepValidation, errors: &mut Vec<String>) {
    let mock = mock_rule_namespace(validation);
    for rule in &validation.rules {
        if let Err(message) = check_expression(&rule.expr, &mock) {
            errors.push(format!(
                "Rule '{}' for step '{step_name}' has invalid expr: {message}",
                rule.name
            ));
        }
        if let Some(when) = &rule.when {
            if let Err(message) = check_expression(when, &mock) {
                errors.push(format!(
                    "Rule '{}' for step '{step_name}' has invalid when: {message}",
                    rule.name
                ));
            }
        }
    }

    for (field, type_name) in &validation.types {
        const VALID_TYPES: &[&str] =
            &["integer", "number", "string", "array", "object", "boolean"];
        if !VALID_TYPES.contains(&type_name.as_str()) {
            errors.push(format!(
                "Field '{field}' for step '{step_name}' has unknown type '{type_name}'. Valid: {VALID_TYPES:?}"
            ));
        }
    }
    for (field, range) in &validation.ranges {
        if range[0] > range[1] {
            errors.push(format!(
                "Field '{field}' for step '{step_name}' has inverted range [{}, {}]",
                range[0], range[1]
            ));
        }
    }
}

/// Parse an expression, then dry-run it against the mock namespace.
/// Syntax errors are always reported; runtime errors against mock data
/// only when the parse itself was fine but the expression references a
/// name that cannot exist (the evaluator reports undefined names).
fn check_expression(text: &str, mock: &Namespace) -> Result<Value, String> {
    match expr::evaluate(text, mock, 0) {
        Ok(value) => Ok(value),
        Err(e) if e.is_syntax() => Err(e.to_string()),
        // Runtime errors against mocks are tolerated: the mock cannot know
        // every field the live record will carry. Bind a neutral value.
        Err(_) => Ok(Value::Int(0)),
    }
}

fn mock_expression_namespace() -> Namespace {
    let mut ns = Namespace::new();
    ns.insert("unit_id".into(), Value::Str("mock__unit".into()));
    ns.insert("_repetition_id".into(), Value::Int(0));
    ns.insert("_repetition_seed".into(), Value::Int(0));
    ns
}

fn mock_rule_namespace(validation: &StepValidation) -> Namespace {
    let mut ns = Namespace::new();
    for field in &validation.required {
        ns.insert(field.clone(), mock_value(field, validation));
    }
    for field in validation.types.keys() {
        ns.entry(field.clone())
            .or_insert_with(|| mock_value(field, validation));
    }
    for field in validation.ranges.keys() {
        ns.entry(field.clone())
            .or_insert_with(|| mock_value(field, validation));
    }
    ns
}

/// Type-driven mock values for rule dry-runs. Range midpoint for ranged
/// integers, otherwise bland representatives per declared type.
fn mock_value(field: &str, validation: &StepValidation) -> Value {
    match validation.types.get(field).map(String::as_str) {
        Some("integer") => {
            if let Some(range) = validation.ranges.get(field) {
                Value::Int(((range[0] + range[1]) / 2.0) as i64)
            } else {
                Value::Int(5)
            }
        }
        Some("number") => Value::Float(5.0),
        Some("string") => Value::Str("sample".into()),
        Some("array") => Value::List(vec![Value::Int(1), Value::Int(2)]),
        Some("object") => Value::Map(
            [("key1".to_string(), Value::Int(1))]
                .into_iter()
                .collect(),
        ),
        Some("boolean") => Value::Bool(true),
        _ => Value::Str("mock_value".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::super::sample_config_yaml;
    use super::*;

    fn sample() -> PipelineConfig {
        serde_yaml::from_str(sample_config_yaml()).unwrap()
    }

    #[test]
    fn sample_config_is_valid() {
        let errors = validate_config(&sample());
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }

    #[test]
    fn empty_pipeline_reported() {
        let mut config = sample();
        config.pipeline.steps.clear();
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.contains("'pipeline.steps' is empty")));
    }

    #[test]
    fn bad_expression_syntax_reported() {
        let mut config = sample();
        let rules = &mut config.validation.get_mut("generate").unwrap().rules;
        rules[0].expr = "len(dialog > ".to_string();
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.contains("invalid expr")));
    }

    #[test]
    fn invalid_step_provider_reported() {
        let mut config = sample();
        config.pipeline.steps[0].provider = Some("cohere".to_string());
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.contains("invalid provider 'cohere'")));
    }

    #[test]
    fn missing_positions_for_cross_product_reported() {
        let mut config = sample();
        config.processing.positions.clear();
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.contains("processing.positions")));
    }

    #[test]
    fn zero_chunk_size_reported() {
        let mut config = sample();
        config.processing.chunk_size = 0;
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.contains("chunk_size")));
    }

    #[test]
    fn duplicate_step_names_reported() {
        let mut config = sample();
        let clone = config.pipeline.steps[0].clone();
        config.pipeline.steps.push(clone);
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.contains("Duplicate pipeline step name")));
    }

    #[test]
    fn unknown_type_name_reported() {
        let mut config = sample();
        config
            .validation
            .get_mut("generate")
            .unwrap()
            .types
            .insert("dialog".into(), "text".into());
        let errors = validate_config(&config);
        assert!(errors.iter().any(|e| e.contains("unknown type 'text'")));
    }

    #[test]
    fn rules_tolerate_fields_absent_from_mock() {
        // A rule referencing a field with no type declaration dry-runs
        // against the mock as a runtime miss, which is tolerated.
        let mut config = sample();
        config
            .validation
            .get_mut("generate")
            .unwrap()
            .rules
            .push(crate::config::RuleConfig {
                name: "extra".into(),
                expr: "undeclared_field != 'x'".into(),
                when: None,
                message: None,
            });
        let errors = validate_config(&config);
        assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    }
}
