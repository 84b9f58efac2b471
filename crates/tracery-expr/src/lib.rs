//! Restricted condition language for gates and aggregation triggers.
//!
//! Expressions are parsed once, at configuration time, by an allowlist
//! parser: anything the grammar does not name is rejected with the offset of
//! the offending token. Evaluation never executes host code.
//!
//! # Example
//! ```
//! use serde_json::json;
//! let expr = tracery_expr::Expression::parse("row['confidence'] >= 0.85").unwrap();
//! let row = json!({"confidence": 0.9}).as_object().unwrap().clone();
//! assert!(expr.evaluate_bool("quality_gate", &row).unwrap());
//! ```

pub mod ast;
mod eval;
mod lexer;
mod parser;

pub use ast::{CompareOp, Expr, FieldKey, FieldPath};
pub use eval::EvalError;
pub use parser::MAX_DEPTH;

use serde_json::Value;
use tracery_types::{Result, RowData, TraceryError};

/// A parsed, validated condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    /// Parse and validate `source`. Rejections carry the offset of the
    /// first disallowed token.
    pub fn parse(source: &str) -> Result<Self> {
        let ast = parser::parse(source)?;
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    /// Evaluate against `row`. `node` names the caller in errors.
    pub fn evaluate(&self, node: &str, row: &RowData) -> Result<Value> {
        eval::evaluate(&self.ast, row).map_err(|err| match err {
            EvalError::MissingField(field) => TraceryError::MissingField {
                node: node.to_string(),
                field,
            },
            EvalError::TypeMismatch(message) => TraceryError::ExpressionEvaluation {
                node: node.to_string(),
                message: format!("{message} (in `{}`)", self.source),
            },
        })
    }

    /// Evaluate and require a boolean result.
    pub fn evaluate_bool(&self, node: &str, row: &RowData) -> Result<bool> {
        match self.evaluate(node, row)? {
            Value::Bool(b) => Ok(b),
            other => Err(TraceryError::ExpressionEvaluation {
                node: node.to_string(),
                message: format!(
                    "expected a boolean result from `{}`, got {other}",
                    self.source
                ),
            }),
        }
    }
}

impl std::fmt::Display for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

impl std::str::FromStr for Expression {
    type Err = TraceryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
