use std::fmt;

use serde_json::Value;

/// A parsed condition expression. Every variant is something the grammar
/// explicitly allows; there is no catch-all node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// A list of literals, only meaningful on the right of `in` / `not in`.
    List(Vec<Value>),
    /// `row['a']['b']`: fails on a missing key.
    Field(FieldPath),
    /// `row.get('a', default)`: yields `default` (or null) on a missing key.
    Get { key: String, default: Option<Value> },
    Not(Box<Expr>),
    /// A run of `and` clauses, kept flat so long chains do not nest.
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Compare {
        left: Box<Expr>,
        op: CompareOp,
        right: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKey {
    Name(String),
    Index(i64),
}

/// Subscript chain rooted at `row`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldPath {
    pub keys: Vec<FieldKey>,
}

impl FieldPath {
    /// Rendering of the first `len` keys, used in error messages.
    pub fn prefix_display(&self, len: usize) -> String {
        let mut out = String::from("row");
        for key in self.keys.iter().take(len) {
            match key {
                FieldKey::Name(name) => out.push_str(&format!("['{name}']")),
                FieldKey::Index(i) => out.push_str(&format!("[{i}]")),
            }
        }
        out
    }

    /// The top-level field name, if the path starts with one.
    pub fn root_name(&self) -> Option<&str> {
        match self.keys.first() {
            Some(FieldKey::Name(name)) => Some(name),
            _ => None,
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.prefix_display(self.keys.len()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    In,
    NotIn,
}

impl CompareOp {
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "==",
            CompareOp::NotEq => "!=",
            CompareOp::Lt => "<",
            CompareOp::LtEq => "<=",
            CompareOp::Gt => ">",
            CompareOp::GtEq => ">=",
            CompareOp::In => "in",
            CompareOp::NotIn => "not in",
        }
    }
}
