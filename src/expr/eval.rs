//! Expression evaluation over a namespace, with deterministic randomness.

use std::collections::BTreeMap;

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use super::parser::{BinaryOp, CmpOp, Expr, UnaryOp};
use super::value::Value;
use super::ExprError;

/// Namespace mapping names to values. BTreeMap keeps iteration
/// deterministic, which matters for reproducible failure reporting.
pub type Namespace = BTreeMap<String, Value>;

/// Evaluator carrying the seeded RNG stream.
///
/// The stream is advanced per `random.*` call in evaluation order, so a
/// given seed always produces the same sequence of draws for the same
/// expression program.
pub struct Evaluator {
    rng: ChaCha8Rng,
}

impl Evaluator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Evaluate a parsed expression against the namespace.
    pub fn eval(&mut self, expr: &Expr, ns: &Namespace) -> Result<Value, ExprError> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ident(name) => ns
                .get(name)
                .cloned()
                .ok_or_else(|| ExprError::runtime(format!("undefined name '{name}'"))),
            Expr::List(items) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item, ns)?);
                }
                Ok(Value::List(values))
            }
            Expr::Unary(op, inner) => {
                let value = self.eval(inner, ns)?;
                self.apply_unary(op, value)
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(left, ns)?;
                let right = self.eval(right, ns)?;
                apply_binary(*op, left, right)
            }
            Expr::BoolChain { all, operands } => {
                // short-circuit: return the deciding operand, Python-style
                let mut last = Value::Bool(*all);
                for operand in operands {
                    last = self.eval(operand, ns)?;
                    if last.is_truthy() != *all {
                        return Ok(last);
                    }
                }
                Ok(last)
            }
            Expr::Compare { first, rest } => {
                let mut left = self.eval(first, ns)?;
                for (op, right_expr) in rest {
                    let right = self.eval(right_expr, ns)?;
                    if !compare(*op, &left, &right)? {
                        return Ok(Value::Bool(false));
                    }
                    left = right;
                }
                Ok(Value::Bool(true))
            }
            Expr::Conditional { body, cond, orelse } => {
                if self.eval(cond, ns)?.is_truthy() {
                    self.eval(body, ns)
                } else {
                    self.eval(orelse, ns)
                }
            }
            Expr::Call { func, args } => {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg, ns)?);
                }
                self.call(func, values)
            }
        }
    }

    fn apply_unary(&mut self, op: &UnaryOp, value: Value) -> Result<Value, ExprError> {
        match op {
            UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
            UnaryOp::Pos => match value {
                Value::Int(_) | Value::Float(_) => Ok(value),
                other => Err(ExprError::runtime(format!(
                    "unary '+' needs a number, got {}",
                    other.type_name()
                ))),
            },
            UnaryOp::Neg => match value {
                Value::Int(i) => Ok(Value::Int(-i)),
                Value::Float(f) => Ok(Value::Float(-f)),
                other => Err(ExprError::runtime(format!(
                    "unary '-' needs a number, got {}",
                    other.type_name()
                ))),
            },
        }
    }

    fn call(&mut self, func: &str, args: Vec<Value>) -> Result<Value, ExprError> {
        match func {
            "len" => {
                let [arg] = take_args::<1>(func, args)?;
                match arg {
                    Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                    Value::List(items) => Ok(Value::Int(items.len() as i64)),
                    Value::Map(entries) => Ok(Value::Int(entries.len() as i64)),
                    other => Err(ExprError::runtime(format!(
                        "len() needs a string, list, or map, got {}",
                        other.type_name()
                    ))),
                }
            }
            "sum" => {
                let [arg] = take_args::<1>(func, args)?;
                let items = as_list(func, arg)?;
                let mut acc = Value::Int(0);
                for item in items {
                    acc = apply_binary(BinaryOp::Add, acc, item)?;
                }
                Ok(acc)
            }
            "min" | "max" => {
                let items = if args.len() == 1 {
                    as_list(func, args.into_iter().next().unwrap())?
                } else {
                    args
                };
                if items.is_empty() {
                    return Err(ExprError::runtime(format!("{func}() of empty sequence")));
                }
                let mut best = items[0].clone();
                for item in &items[1..] {
                    let replace = if func == "min" {
                        compare(CmpOp::Lt, item, &best)?
                    } else {
                        compare(CmpOp::Gt, item, &best)?
                    };
                    if replace {
                        best = item.clone();
                    }
                }
                Ok(best)
            }
            "abs" => {
                let [arg] = take_args::<1>(func, args)?;
                match arg {
                    Value::Int(i) => Ok(Value::Int(i.abs())),
                    Value::Float(f) => Ok(Value::Float(f.abs())),
                    other => Err(ExprError::runtime(format!(
                        "abs() needs a number, got {}",
                        other.type_name()
                    ))),
                }
            }
            "round" => {
                if args.len() == 2 {
                    let digits = match &args[1] {
                        Value::Int(i) => *i,
                        other => {
                            return Err(ExprError::runtime(format!(
                                "round() digits must be int, got {}",
                                other.type_name()
                            )));
                        }
                    };
                    let x = as_float(func, &args[0])?;
                    let scale = 10f64.powi(digits as i32);
                    Ok(Value::Float((x * scale).round() / scale))
                } else {
                    let [arg] = take_args::<1>(func, args)?;
                    match arg {
                        Value::Int(i) => Ok(Value::Int(i)),
                        Value::Float(f) => Ok(Value::Int(f.round() as i64)),
                        other => Err(ExprError::runtime(format!(
                            "round() needs a number, got {}",
                            other.type_name()
                        ))),
                    }
                }
            }
            "all" | "any" => {
                let [arg] = take_args::<1>(func, args)?;
                let items = as_list(func, arg)?;
                let result = if func == "all" {
                    items.iter().all(Value::is_truthy)
                } else {
                    items.iter().any(Value::is_truthy)
                };
                Ok(Value::Bool(result))
            }
            "sorted" => {
                let [arg] = take_args::<1>(func, args)?;
                let mut items = as_list(func, arg)?;
                let mut sort_err = None;
                items.sort_by(|a, b| {
                    match compare(CmpOp::Lt, a, b) {
                        Ok(true) => std::cmp::Ordering::Less,
                        Ok(false) => match compare(CmpOp::Gt, a, b) {
                            Ok(true) => std::cmp::Ordering::Greater,
                            Ok(false) => std::cmp::Ordering::Equal,
                            Err(e) => {
                                sort_err.get_or_insert(e);
                                std::cmp::Ordering::Equal
                            }
                        },
                        Err(e) => {
                            sort_err.get_or_insert(e);
                            std::cmp::Ordering::Equal
                        }
                    }
                });
                match sort_err {
                    Some(e) => Err(e),
                    None => Ok(Value::List(items)),
                }
            }
            "sqrt" => self.math1(func, args, f64::sqrt),
            "log" => self.math1(func, args, f64::ln),
            "log10" => self.math1(func, args, f64::log10),
            "exp" => self.math1(func, args, f64::exp),
            "random.random" => {
                take_args::<0>(func, args)?;
                Ok(Value::Float(self.rng.random::<f64>()))
            }
            "random.randint" => {
                let [lo, hi] = take_args::<2>(func, args)?;
                let (lo, hi) = match (lo, hi) {
                    (Value::Int(a), Value::Int(b)) => (a, b),
                    (a, b) => {
                        return Err(ExprError::runtime(format!(
                            "random.randint() needs two ints, got {} and {}",
                            a.type_name(),
                            b.type_name()
                        )));
                    }
                };
                if lo > hi {
                    return Err(ExprError::runtime(format!(
                        "random.randint() empty range [{lo}, {hi}]"
                    )));
                }
                Ok(Value::Int(self.rng.random_range(lo..=hi)))
            }
            "random.choice" => {
                let [arg] = take_args::<1>(func, args)?;
                let items = as_list(func, arg)?;
                if items.is_empty() {
                    return Err(ExprError::runtime("random.choice() of empty sequence".to_string()));
                }
                let index = self.rng.random_range(0..items.len());
                Ok(items[index].clone())
            }
            "random.uniform" => {
                let [lo, hi] = take_args::<2>(func, args)?;
                let lo = as_float(func, &lo)?;
                let hi = as_float(func, &hi)?;
                Ok(Value::Float(lo + (hi - lo) * self.rng.random::<f64>()))
            }
            "random.gauss" => {
                let [mu, sigma] = take_args::<2>(func, args)?;
                let mu = as_float(func, &mu)?;
                let sigma = as_float(func, &sigma)?;
                let normal = Normal::new(mu, sigma)
                    .map_err(|e| ExprError::runtime(format!("random.gauss(): {e}")))?;
                Ok(Value::Float(normal.sample(&mut self.rng)))
            }
            _ => Err(ExprError::runtime(format!("unknown function '{func}'"))),
        }
    }

    fn math1(
        &mut self,
        func: &str,
        args: Vec<Value>,
        op: fn(f64) -> f64,
    ) -> Result<Value, ExprError> {
        let [arg] = take_args::<1>(func, args)?;
        let x = as_float(func, &arg)?;
        let result = op(x);
        if result.is_nan() || result.is_infinite() {
            return Err(ExprError::runtime(format!("{func}({x}) is not a finite number")));
        }
        Ok(Value::Float(result))
    }
}

fn take_args<const N: usize>(func: &str, args: Vec<Value>) -> Result<[Value; N], ExprError> {
    let count = args.len();
    args.try_into()
        .map_err(|_| ExprError::runtime(format!("{func}() takes {N} argument(s), got {count}")))
}

fn as_list(func: &str, value: Value) -> Result<Vec<Value>, ExprError> {
    match value {
        Value::List(items) => Ok(items),
        other => Err(ExprError::runtime(format!(
            "{func}() needs a list, got {}",
            other.type_name()
        ))),
    }
}

fn as_float(func: &str, value: &Value) -> Result<f64, ExprError> {
    value.as_number().ok_or_else(|| {
        ExprError::runtime(format!("{func}() needs a number, got {}", value.type_name()))
    })
}

fn apply_binary(op: BinaryOp, left: Value, right: Value) -> Result<Value, ExprError> {
    use BinaryOp::*;
    use Value::*;

    // string concatenation and list concatenation
    if op == Add {
        if let (Str(a), Str(b)) = (&left, &right) {
            return Ok(Str(format!("{a}{b}")));
        }
        if let (List(a), List(b)) = (&left, &right) {
            let mut merged = a.clone();
            merged.extend(b.iter().cloned());
            return Ok(List(merged));
        }
    }

    match (&left, &right) {
        (Int(a), Int(b)) => {
            let (a, b) = (*a, *b);
            match op {
                Add => Ok(Int(a.wrapping_add(b))),
                Sub => Ok(Int(a.wrapping_sub(b))),
                Mul => Ok(Int(a.wrapping_mul(b))),
                Div => {
                    if b == 0 {
                        Err(ExprError::runtime("division by zero".to_string()))
                    } else {
                        Ok(Float(a as f64 / b as f64))
                    }
                }
                FloorDiv => {
                    if b == 0 {
                        Err(ExprError::runtime("division by zero".to_string()))
                    } else {
                        Ok(Int(a.div_euclid(b)))
                    }
                }
                Mod => {
                    if b == 0 {
                        Err(ExprError::runtime("modulo by zero".to_string()))
                    } else {
                        Ok(Int(a.rem_euclid(b)))
                    }
                }
                Pow => {
                    if b >= 0 {
                        Ok(Int(a.pow(b.min(u32::MAX as i64) as u32)))
                    } else {
                        Ok(Float((a as f64).powf(b as f64)))
                    }
                }
            }
        }
        _ => {
            let a = left.as_number().ok_or_else(|| {
                ExprError::runtime(format!(
                    "cannot apply arithmetic to {}",
                    left.type_name()
                ))
            })?;
            let b = right.as_number().ok_or_else(|| {
                ExprError::runtime(format!(
                    "cannot apply arithmetic to {}",
                    right.type_name()
                ))
            })?;
            let result = match op {
                Add => a + b,
                Sub => a - b,
                Mul => a * b,
                Div => {
                    if b == 0.0 {
                        return Err(ExprError::runtime("division by zero".to_string()));
                    }
                    a / b
                }
                FloorDiv => {
                    if b == 0.0 {
                        return Err(ExprError::runtime("division by zero".to_string()));
                    }
                    (a / b).floor()
                }
                Mod => {
                    if b == 0.0 {
                        return Err(ExprError::runtime("modulo by zero".to_string()));
                    }
                    a.rem_euclid(b)
                }
                Pow => a.powf(b),
            };
            Ok(Float(result))
        }
    }
}

fn compare(op: CmpOp, left: &Value, right: &Value) -> Result<bool, ExprError> {
    use CmpOp::*;

    // equality works across any pair of values
    if matches!(op, Eq | NotEq) {
        let equal = match (left, right) {
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => {
                (*a as f64) == *b
            }
            (a, b) => a == b,
        };
        return Ok(if op == Eq { equal } else { !equal });
    }

    // ordering requires comparable types
    let ordering = match (left, right) {
        (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
        (a, b) => match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
    };
    let ordering = ordering.ok_or_else(|| {
        ExprError::runtime(format!(
            "cannot order {} and {}",
            left.type_name(),
            right.type_name()
        ))
    })?;

    Ok(match op {
        Lt => ordering.is_lt(),
        LtEq => ordering.is_le(),
        Gt => ordering.is_gt(),
        GtEq => ordering.is_ge(),
        Eq | NotEq => unreachable!(),
    })
}
