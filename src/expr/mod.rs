//! Safe expression evaluation for validation rules and expression steps.
//!
//! A small Python-flavoured expression language: literals, identifiers,
//! arithmetic, comparisons (chained), boolean connectives, conditional
//! expressions, list literals, a fixed set of safe functions, and a
//! deterministic `random` namespace. No attribute access, no imports, no
//! I/O. Syntax errors are caught at config pre-flight; runtime errors are
//! reported at step execution with the offending expression text.

mod eval;
mod lexer;
mod parser;
mod value;

pub use eval::{Evaluator, Namespace};
pub use parser::{Expr, parse};
pub use value::Value;

use thiserror::Error;

/// Expression failures, split so callers can report syntax problems at
/// config-validation time and runtime problems per unit.
#[derive(Debug, Error)]
pub enum ExprError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },

    #[error("{message}")]
    Runtime { message: String },
}

impl ExprError {
    pub fn syntax(offset: usize, message: impl Into<String>) -> Self {
        Self::Syntax {
            offset,
            message: message.into(),
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
        }
    }

    pub fn is_syntax(&self) -> bool {
        matches!(self, Self::Syntax { .. })
    }
}

/// Parse and evaluate a single expression in one shot.
pub fn evaluate(src: &str, ns: &Namespace, seed: u64) -> Result<Value, ExprError> {
    let expr = parse(src)?;
    Evaluator::new(seed).eval(&expr, ns)
}

/// Flatten a YAML mapping of `name: expression` into ordered pairs,
/// preserving declaration order (the sequential-namespace contract).
pub fn ordered_pairs(mapping: &serde_yaml::Mapping) -> Result<Vec<(String, String)>, ExprError> {
    let mut pairs = Vec::with_capacity(mapping.len());
    for (key, value) in mapping {
        let name = key
            .as_str()
            .ok_or_else(|| ExprError::runtime(format!("expression name must be a string, got {key:?}")))?;
        let text = value
            .as_str()
            .ok_or_else(|| ExprError::runtime(format!("expression '{name}' must be a string")))?;
        pairs.push((name.to_string(), text.to_string()));
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluate_one_shot() {
        let mut ns = Namespace::new();
        ns.insert("x".into(), Value::Int(3));
        assert_eq!(evaluate("x * 2", &ns, 0).unwrap(), Value::Int(6));
    }

    #[test]
    fn syntax_errors_are_distinguishable() {
        let err = evaluate("1 +", &Namespace::new(), 0).unwrap_err();
        assert!(err.is_syntax());
        let err = evaluate("missing", &Namespace::new(), 0).unwrap_err();
        assert!(!err.is_syntax());
    }

    #[test]
    fn ordered_pairs_preserve_declaration_order() {
        let mapping: serde_yaml::Mapping =
            serde_yaml::from_str("zeta: '1'\nalpha: 'zeta + 1'\nmid: 'alpha * 2'").unwrap();
        let pairs = ordered_pairs(&mapping).unwrap();
        let names: Vec<&str> = pairs.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }
}
