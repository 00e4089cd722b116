//! Response validation: schema checks, rule evaluation, and failure
//! categorisation.
//!
//! A parsed record passes through two gates. The schema gate checks
//! required fields, declared types, and numeric ranges; any miss is a
//! `schema_validation` failure. The rule gate evaluates each
//! `when`-enabled rule expression in a namespace built from the record's
//! fields; a falsy or erroring rule is a `validation` failure. The
//! resulting stage tag drives retry policy: schema/validation/parse
//! failures are retry-eligible, api/other failures are hard.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::config::StepValidation;
use crate::expr::{self, Evaluator, Namespace, Value};

/// Failure category, recorded on every failure record as `failure_stage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    SchemaValidation,
    Validation,
    Api,
    Parse,
    Other,
}

impl FailureStage {
    /// Stages eligible for validation retry (vs. hard failure).
    pub fn is_retry_eligible(self) -> bool {
        matches!(
            self,
            FailureStage::SchemaValidation | FailureStage::Validation | FailureStage::Parse
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureStage::SchemaValidation => "schema_validation",
            FailureStage::Validation => "validation",
            FailureStage::Api => "api",
            FailureStage::Parse => "parse",
            FailureStage::Other => "other",
        }
    }

    pub fn parse(text: &str) -> FailureStage {
        match text {
            "schema_validation" => FailureStage::SchemaValidation,
            "validation" => FailureStage::Validation,
            "api" => FailureStage::Api,
            "parse" => FailureStage::Parse,
            _ => FailureStage::Other,
        }
    }
}

/// One structured problem inside a failure record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredError {
    pub path: String,
    pub message: String,
}

impl StructuredError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// The outcome of validating one record against one step's checks.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationFailure {
    pub stage: FailureStage,
    pub errors: Vec<StructuredError>,
}

/// A failure record as written to `{step}_failures.jsonl`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub unit_id: String,
    pub failure_stage: FailureStage,
    pub errors: Vec<StructuredError>,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
}

impl FailureRecord {
    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or(JsonValue::Null)
    }
}

/// Validate a parsed record against a step's schema and rules.
///
/// The `seed` feeds the rule evaluator's RNG; rules rarely draw
/// randomness, but when they do the draw must be deterministic per unit.
pub fn validate_record(
    record: &JsonValue,
    checks: &StepValidation,
    seed: u64,
) -> Result<(), ValidationFailure> {
    if let Some(errors) = schema_errors(record, checks) {
        return Err(ValidationFailure {
            stage: FailureStage::SchemaValidation,
            errors,
        });
    }
    if let Some(errors) = rule_errors(record, checks, seed) {
        return Err(ValidationFailure {
            stage: FailureStage::Validation,
            errors,
        });
    }
    Ok(())
}

fn schema_errors(record: &JsonValue, checks: &StepValidation) -> Option<Vec<StructuredError>> {
    let mut errors = Vec::new();
    let object = record.as_object();

    for field in &checks.required {
        let present = object.is_some_and(|o| o.contains_key(field));
        if !present {
            errors.push(StructuredError::new(field, "required field is missing"));
        }
    }

    for (field, type_name) in &checks.types {
        let Some(value) = object.and_then(|o| o.get(field)) else {
            continue;
        };
        if !matches_type(value, type_name) {
            errors.push(StructuredError::new(
                field,
                format!("expected {type_name}, got {}", json_type_name(value)),
            ));
        }
    }

    for (field, range) in &checks.ranges {
        let Some(value) = object.and_then(|o| o.get(field)) else {
            continue;
        };
        let Some(number) = value.as_f64() else {
            errors.push(StructuredError::new(field, "ranged field is not numeric"));
            continue;
        };
        if number < range[0] || number > range[1] {
            errors.push(StructuredError::new(
                field,
                format!("{number} outside range [{}, {}]", range[0], range[1]),
            ));
        }
    }

    if errors.is_empty() { None } else { Some(errors) }
}

fn rule_errors(
    record: &JsonValue,
    checks: &StepValidation,
    seed: u64,
) -> Option<Vec<StructuredError>> {
    if checks.rules.is_empty() {
        return None;
    }

    let ns = record_namespace(record);
    let mut evaluator = Evaluator::new(seed);
    let mut errors = Vec::new();

    for rule in &checks.rules {
        if let Some(when) = &rule.when {
            match evaluate_in(&mut evaluator, when, &ns) {
                Ok(gate) if !gate.is_truthy() => continue,
                Ok(_) => {}
                Err(message) => {
                    errors.push(StructuredError::new(
                        &rule.name,
                        format!("when-gate error: {message}"),
                    ));
                    continue;
                }
            }
        }

        match evaluate_in(&mut evaluator, &rule.expr, &ns) {
            Ok(value) if value.is_truthy() => {}
            Ok(_) => {
                let message = rule
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("rule failed: {}", rule.expr));
                errors.push(StructuredError::new(&rule.name, message));
            }
            Err(message) => {
                errors.push(StructuredError::new(
                    &rule.name,
                    format!("rule error in '{}': {message}", rule.expr),
                ));
            }
        }
    }

    if errors.is_empty() { None } else { Some(errors) }
}

fn evaluate_in(evaluator: &mut Evaluator, src: &str, ns: &Namespace) -> Result<Value, String> {
    let expr = expr::parse(src).map_err(|e| e.to_string())?;
    evaluator.eval(&expr, ns).map_err(|e| e.to_string())
}

/// Build the rule namespace from the record's top-level fields.
pub fn record_namespace(record: &JsonValue) -> Namespace {
    let mut ns = Namespace::new();
    if let Some(object) = record.as_object() {
        for (key, value) in object {
            ns.insert(key.clone(), Value::from_json(value));
        }
    }
    ns
}

fn matches_type(value: &JsonValue, type_name: &str) -> bool {
    match type_name {
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "string" => value.is_string(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "boolean" => value.is_boolean(),
        _ => true,
    }
}

fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(n) if n.is_i64() || n.is_u64() => "integer",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleConfig;
    use serde_json::json;

    fn checks() -> StepValidation {
        StepValidation {
            required: vec!["dialog".into(), "score".into()],
            types: [
                ("dialog".to_string(), "string".to_string()),
                ("score".to_string(), "integer".to_string()),
            ]
            .into_iter()
            .collect(),
            ranges: [("score".to_string(), [1.0, 10.0])].into_iter().collect(),
            rules: vec![RuleConfig {
                name: "nonempty".into(),
                expr: "len(dialog) > 0".into(),
                when: None,
                message: None,
            }],
        }
    }

    #[test]
    fn valid_record_passes() {
        let record = json!({"unit_id": "u1", "dialog": "hello", "score": 5});
        assert!(validate_record(&record, &checks(), 0).is_ok());
    }

    #[test]
    fn missing_required_field_is_schema_failure() {
        let record = json!({"unit_id": "u1", "dialog": "hello"});
        let failure = validate_record(&record, &checks(), 0).unwrap_err();
        assert_eq!(failure.stage, FailureStage::SchemaValidation);
        assert_eq!(failure.errors[0].path, "score");
    }

    #[test]
    fn wrong_type_is_schema_failure() {
        let record = json!({"dialog": "hi", "score": "five"});
        let failure = validate_record(&record, &checks(), 0).unwrap_err();
        assert_eq!(failure.stage, FailureStage::SchemaValidation);
        assert!(failure.errors.iter().any(|e| e.path == "score"));
    }

    #[test]
    fn out_of_range_is_schema_failure() {
        let record = json!({"dialog": "hi", "score": 42});
        let failure = validate_record(&record, &checks(), 0).unwrap_err();
        assert_eq!(failure.stage, FailureStage::SchemaValidation);
        assert!(failure.errors[0].message.contains("outside range"));
    }

    #[test]
    fn failing_rule_is_validation_failure() {
        let record = json!({"dialog": "", "score": 5});
        let failure = validate_record(&record, &checks(), 0).unwrap_err();
        assert_eq!(failure.stage, FailureStage::Validation);
        assert_eq!(failure.errors[0].path, "nonempty");
    }

    #[test]
    fn erroring_rule_is_validation_failure() {
        let mut checks = checks();
        checks.rules.push(RuleConfig {
            name: "broken".into(),
            expr: "undefined_name > 0".into(),
            when: None,
            message: None,
        });
        let record = json!({"dialog": "hi", "score": 5});
        let failure = validate_record(&record, &checks, 0).unwrap_err();
        assert_eq!(failure.stage, FailureStage::Validation);
        assert!(failure.errors[0].message.contains("undefined_name"));
    }

    #[test]
    fn when_gate_disables_rule() {
        let mut checks = checks();
        checks.rules[0].when = Some("score > 9".into());
        // rule would fail (empty dialog) but the gate is falsy at score 5
        let record = json!({"dialog": "", "score": 5});
        assert!(validate_record(&record, &checks, 0).is_ok());
    }

    #[test]
    fn schema_failures_short_circuit_rules() {
        // missing dialog: rules referencing it would error, but the
        // schema gate reports first
        let record = json!({"score": 5});
        let failure = validate_record(&record, &checks(), 0).unwrap_err();
        assert_eq!(failure.stage, FailureStage::SchemaValidation);
    }

    #[test]
    fn stage_retry_eligibility() {
        assert!(FailureStage::SchemaValidation.is_retry_eligible());
        assert!(FailureStage::Validation.is_retry_eligible());
        assert!(FailureStage::Parse.is_retry_eligible());
        assert!(!FailureStage::Api.is_retry_eligible());
        assert!(!FailureStage::Other.is_retry_eligible());
    }

    #[test]
    fn failure_record_serialization_uses_snake_case_stage() {
        let record = FailureRecord {
            unit_id: "u1".into(),
            failure_stage: FailureStage::SchemaValidation,
            errors: vec![StructuredError::new("score", "missing")],
            retry_count: 1,
            raw_text: Some("{}".into()),
            input: None,
        };
        let json = record.to_json();
        assert_eq!(json["failure_stage"], "schema_validation");
        assert_eq!(json["retry_count"], 1);
    }

    #[test]
    fn custom_rule_message_is_used() {
        let mut checks = checks();
        checks.rules[0].message = Some("dialog must not be empty".into());
        let record = json!({"dialog": "", "score": 5});
        let failure = validate_record(&record, &checks, 0).unwrap_err();
        assert_eq!(failure.errors[0].message, "dialog must not be empty");
    }
}
