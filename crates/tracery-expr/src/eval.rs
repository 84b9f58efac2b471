//! Evaluation of parsed expressions against a row.

use serde_json::Value;
use thiserror::Error;

use tracery_types::RowData;

use crate::ast::{CompareOp, Expr, FieldKey, FieldPath};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("field {0} is missing")]
    MissingField(String),

    #[error("{0}")]
    TypeMismatch(String),
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

pub(crate) fn evaluate(expr: &Expr, row: &RowData) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::List(items) => Ok(Value::Array(items.clone())),
        Expr::Field(path) => lookup(path, row).cloned(),
        Expr::Get { key, default } => Ok(row
            .get(key)
            .cloned()
            .or_else(|| default.clone())
            .unwrap_or(Value::Null)),
        Expr::Not(inner) => Ok(Value::Bool(!as_bool(&evaluate(inner, row)?, "not")?)),
        Expr::And(clauses) => {
            for clause in clauses {
                if !as_bool(&evaluate(clause, row)?, "and")? {
                    return Ok(Value::Bool(false));
                }
            }
            Ok(Value::Bool(true))
        }
        Expr::Or(clauses) => {
            for clause in clauses {
                if as_bool(&evaluate(clause, row)?, "or")? {
                    return Ok(Value::Bool(true));
                }
            }
            Ok(Value::Bool(false))
        }
        Expr::Compare { left, op, right } => {
            let l = evaluate(left, row)?;
            let r = evaluate(right, row)?;
            compare(&l, *op, &r).map(Value::Bool)
        }
    }
}

/// Boolean connectives only accept booleans; there is no truthiness.
fn as_bool(value: &Value, context: &str) -> Result<bool, EvalError> {
    value.as_bool().ok_or_else(|| {
        EvalError::TypeMismatch(format!(
            "'{context}' requires boolean operands, got {}",
            type_name(value)
        ))
    })
}

fn lookup<'r>(path: &FieldPath, row: &'r RowData) -> Result<&'r Value, EvalError> {
    let mut keys = path.keys.iter().enumerate();
    let current = match keys.next() {
        Some((_, FieldKey::Name(name))) => row
            .get(name)
            .ok_or_else(|| EvalError::MissingField(path.prefix_display(1)))?,
        Some((_, FieldKey::Index(_))) => {
            return Err(EvalError::TypeMismatch(
                "row fields are addressed by name, not by index".into(),
            ))
        }
        None => return Err(EvalError::MissingField(path.to_string())),
    };

    let mut current = current;
    for (i, key) in keys {
        current = match (current, key) {
            (Value::Object(map), FieldKey::Name(name)) => map
                .get(name)
                .ok_or_else(|| EvalError::MissingField(path.prefix_display(i + 1)))?,
            (Value::Array(items), FieldKey::Index(idx)) => {
                let len = items.len() as i64;
                let resolved = if *idx < 0 { len + idx } else { *idx };
                if resolved < 0 || resolved >= len {
                    return Err(EvalError::MissingField(path.prefix_display(i + 1)));
                }
                &items[resolved as usize]
            }
            (other, _) => {
                return Err(EvalError::TypeMismatch(format!(
                    "cannot subscript {} at {}",
                    type_name(other),
                    path.prefix_display(i)
                )))
            }
        };
    }
    Ok(current)
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        _ => left == right,
    }
}

fn ordering(left: &Value, right: &Value, op: CompareOp) -> Result<std::cmp::Ordering, EvalError> {
    let ord = match (left, right) {
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(x), Some(y)) => x.partial_cmp(&y),
            _ => None,
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };
    ord.ok_or_else(|| {
        EvalError::TypeMismatch(format!(
            "'{}' cannot compare {} with {}",
            op.symbol(),
            type_name(left),
            type_name(right)
        ))
    })
}

fn contains(needle: &Value, haystack: &Value) -> Result<bool, EvalError> {
    match haystack {
        Value::Array(items) => Ok(items.iter().any(|item| values_equal(needle, item))),
        Value::String(s) => match needle {
            Value::String(sub) => Ok(s.contains(sub.as_str())),
            other => Err(EvalError::TypeMismatch(format!(
                "'in <string>' requires a string on the left, got {}",
                type_name(other)
            ))),
        },
        Value::Object(map) => match needle {
            Value::String(key) => Ok(map.contains_key(key)),
            _ => Ok(false),
        },
        other => Err(EvalError::TypeMismatch(format!(
            "'in' requires a list, string or object on the right, got {}",
            type_name(other)
        ))),
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> Result<bool, EvalError> {
    use std::cmp::Ordering::*;
    match op {
        CompareOp::Eq => Ok(values_equal(left, right)),
        CompareOp::NotEq => Ok(!values_equal(left, right)),
        CompareOp::Lt => Ok(ordering(left, right, op)? == Less),
        CompareOp::LtEq => Ok(ordering(left, right, op)? != Greater),
        CompareOp::Gt => Ok(ordering(left, right, op)? == Greater),
        CompareOp::GtEq => Ok(ordering(left, right, op)? != Less),
        CompareOp::In => contains(left, right),
        CompareOp::NotIn => contains(left, right).map(|found| !found),
    }
}
