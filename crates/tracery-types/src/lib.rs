//! Shared types, errors, lineage model, and stable hashing for the Tracery engine.
//!
//! This crate provides the foundational types used across all other Tracery crates:
//! - `TraceryError`: unified error taxonomy
//! - identifiers for every audited entity (`RunId`, `TokenId`, ...)
//! - `Token` and `RowData`: the unit of lineage and its payload
//! - `NodeState`: the open/completed/failed attempt record
//! - `RowOutcome`: what happened to a token when it left the work queue
//! - `stable_hash`: canonical content hashing
//! - `Clock`: the injectable time source

pub mod clock;
pub mod hashing;
pub mod ids;
pub mod model;
pub mod node_state;
pub mod outcome;
pub mod token;

pub use clock::{Clock, ManualClock, SystemClock};
pub use hashing::{hash_bytes, stable_hash, stable_hash_bytes};
pub use ids::{
    ArtifactId, BatchId, EdgeId, GroupId, NodeId, RoutingEventId, RowId, RunId, StateId, TokenId,
};
pub use model::{BatchStatus, Determinism, NodeType, RoutingMode, RunStatus, TriggerType};
pub use node_state::{
    CompletedNodeState, FailedNodeState, FailureDetail, NodeState, NodeStateCompletion,
    OpenNodeState,
};
pub use outcome::{RowOutcome, RowResult};
pub use token::{RowData, Token};

/// Unified error type for all Tracery subsystems.
#[derive(Debug, thiserror::Error)]
pub enum TraceryError {
    // === Audit Ledger ===
    #[error("Ledger write failed: {0}")]
    LedgerWrite(String),

    #[error("Invariant violated: {0}")]
    InvariantViolation(String),

    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    // === Condition Language ===
    #[error("Invalid expression at offset {offset}: {message} (in `{expression}`)")]
    ExpressionSyntax {
        expression: String,
        offset: usize,
        message: String,
    },

    #[error("Expression evaluation failed on node '{node}': {message}")]
    ExpressionEvaluation { node: String, message: String },

    #[error("Field '{field}' missing from row at node '{node}'")]
    MissingField { node: String, field: String },

    // === Plugins ===
    #[error("Plugin '{plugin}' failed on node '{node}': {message}")]
    PluginError {
        plugin: String,
        node: String,
        message: String,
    },

    #[error("Plugin '{plugin}' reported a transient failure: {message}")]
    PluginTransient { plugin: String, message: String },

    // === Scheduling ===
    #[error("Work queue exceeded {limit} iterations while processing row '{row}'")]
    WorkQueueExhausted { row: String, limit: usize },

    // === Configuration ===
    #[error("Pipeline validation failed: {0}")]
    ValidationError(String),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl TraceryError {
    /// Returns `true` if the error is transient and the attempt may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TraceryError::PluginTransient { .. })
    }

    /// Returns `true` if the error means the audit trail can no longer be trusted
    /// and the run must abort without any attempt at recovery.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TraceryError::LedgerWrite(_)
                | TraceryError::InvariantViolation(_)
                | TraceryError::WorkQueueExhausted { .. }
        )
    }
}

/// A convenience alias for `Result<T, TraceryError>`.
pub type Result<T> = std::result::Result<T, TraceryError>;

/// Shorthand for a [`TraceryError::NotFound`] on a lookup by id.
pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> TraceryError {
    TraceryError::NotFound {
        entity,
        id: id.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_ledger_write() {
        let err = TraceryError::LedgerWrite("lock poisoned".into());
        assert_eq!(err.to_string(), "Ledger write failed: lock poisoned");
    }

    #[test]
    fn error_display_expression_syntax() {
        let err = TraceryError::ExpressionSyntax {
            expression: "row.x".into(),
            offset: 3,
            message: "attribute access is not allowed".into(),
        };
        assert_eq!(
            err.to_string(),
            "Invalid expression at offset 3: attribute access is not allowed (in `row.x`)"
        );
    }

    #[test]
    fn error_display_missing_field() {
        let err = TraceryError::MissingField {
            node: "quality_gate".into(),
            field: "confidence".into(),
        };
        assert_eq!(
            err.to_string(),
            "Field 'confidence' missing from row at node 'quality_gate'"
        );
    }

    #[test]
    fn error_display_work_queue_exhausted() {
        let err = TraceryError::WorkQueueExhausted {
            row: "row-1".into(),
            limit: 10,
        };
        assert_eq!(
            err.to_string(),
            "Work queue exceeded 10 iterations while processing row 'row-1'"
        );
    }

    #[test]
    fn error_display_not_found() {
        let err = not_found("token", "tok-9");
        assert_eq!(err.to_string(), "token 'tok-9' not found");
    }

    #[test]
    fn only_transient_plugin_errors_are_retryable() {
        let transient = TraceryError::PluginTransient {
            plugin: "enrich".into(),
            message: "timeout".into(),
        };
        assert!(transient.is_retryable());

        let plugin = TraceryError::PluginError {
            plugin: "enrich".into(),
            node: "transform:enrich".into(),
            message: "bug".into(),
        };
        assert!(!plugin.is_retryable());
        assert!(!TraceryError::LedgerWrite("x".into()).is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(TraceryError::LedgerWrite("x".into()).is_fatal());
        assert!(TraceryError::InvariantViolation("x".into()).is_fatal());
        assert!(TraceryError::WorkQueueExhausted {
            row: "r".into(),
            limit: 1
        }
        .is_fatal());
        assert!(!TraceryError::ValidationError("x".into()).is_fatal());
        assert!(!TraceryError::MissingField {
            node: "n".into(),
            field: "f".into()
        }
        .is_fatal());
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TraceryError = io_err.into();
        assert!(matches!(err, TraceryError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let err: TraceryError = json_err.into();
        assert!(matches!(err, TraceryError::Json(_)));
    }

    #[test]
    fn result_alias_err() {
        fn example() -> Result<()> {
            Err(TraceryError::Other("fail".into()))
        }
        assert!(example().is_err());
    }
}
