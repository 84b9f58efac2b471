//! Node-state attempts as an exhaustively matched sum type.
//!
//! A [`NodeState`] is one attempt of one node processing one token. The only way
//! to obtain a [`CompletedNodeState`] or [`FailedNodeState`] is to resolve an
//! [`OpenNodeState`], which consumes it and requires every field the terminal
//! shape needs. Retries are new `OpenNodeState`s with a higher `attempt`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{NodeId, StateId, TokenId};

/// An attempt that has started and not yet resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenNodeState {
    pub state_id: StateId,
    pub token_id: TokenId,
    pub node_id: NodeId,
    pub step_index: usize,
    pub attempt: u32,
    pub input_hash: String,
    pub started_at: DateTime<Utc>,
}

/// An attempt that produced output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedNodeState {
    pub state_id: StateId,
    pub token_id: TokenId,
    pub node_id: NodeId,
    pub step_index: usize,
    pub attempt: u32,
    pub input_hash: String,
    pub started_at: DateTime<Utc>,
    pub output_hash: String,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success_metadata: Option<serde_json::Value>,
}

/// An attempt that ended in error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedNodeState {
    pub state_id: StateId,
    pub token_id: TokenId,
    pub node_id: NodeId,
    pub step_index: usize,
    pub attempt: u32,
    pub input_hash: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub error: FailureDetail,
}

/// Structured description of why an attempt failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    /// Short machine-readable category (`declared_error`, `missing_field`, `late_arrival`, ...).
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub detail: serde_json::Value,
}

impl FailureDetail {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            detail: serde_json::Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// How an open attempt is resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeStateCompletion {
    Completed {
        output_hash: String,
        metadata: Option<serde_json::Value>,
    },
    Failed {
        error: FailureDetail,
    },
}

impl NodeStateCompletion {
    pub fn completed(output_hash: impl Into<String>) -> Self {
        NodeStateCompletion::Completed {
            output_hash: output_hash.into(),
            metadata: None,
        }
    }

    pub fn completed_with(output_hash: impl Into<String>, metadata: serde_json::Value) -> Self {
        NodeStateCompletion::Completed {
            output_hash: output_hash.into(),
            metadata: Some(metadata),
        }
    }

    pub fn failed(error: FailureDetail) -> Self {
        NodeStateCompletion::Failed { error }
    }
}

fn elapsed_ms(started_at: DateTime<Utc>, completed_at: DateTime<Utc>) -> u64 {
    (completed_at - started_at).num_milliseconds().max(0) as u64
}

/// Timestamps are supplied by the caller so durations follow whatever clock
/// the ledger was given.
impl OpenNodeState {
    pub fn begin(
        token_id: TokenId,
        node_id: NodeId,
        step_index: usize,
        attempt: u32,
        input_hash: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            state_id: StateId::generate(),
            token_id,
            node_id,
            step_index,
            attempt,
            input_hash: input_hash.into(),
            started_at,
        }
    }

    pub fn complete(
        self,
        output_hash: impl Into<String>,
        success_metadata: Option<serde_json::Value>,
        completed_at: DateTime<Utc>,
    ) -> CompletedNodeState {
        CompletedNodeState {
            duration_ms: elapsed_ms(self.started_at, completed_at),
            state_id: self.state_id,
            token_id: self.token_id,
            node_id: self.node_id,
            step_index: self.step_index,
            attempt: self.attempt,
            input_hash: self.input_hash,
            started_at: self.started_at,
            output_hash: output_hash.into(),
            completed_at,
            success_metadata,
        }
    }

    pub fn fail(self, error: FailureDetail, completed_at: DateTime<Utc>) -> FailedNodeState {
        FailedNodeState {
            duration_ms: elapsed_ms(self.started_at, completed_at),
            state_id: self.state_id,
            token_id: self.token_id,
            node_id: self.node_id,
            step_index: self.step_index,
            attempt: self.attempt,
            input_hash: self.input_hash,
            started_at: self.started_at,
            completed_at,
            error,
        }
    }

    pub fn resolve(self, completion: NodeStateCompletion, completed_at: DateTime<Utc>) -> NodeState {
        match completion {
            NodeStateCompletion::Completed {
                output_hash,
                metadata,
            } => NodeState::Completed(self.complete(output_hash, metadata, completed_at)),
            NodeStateCompletion::Failed { error } => {
                NodeState::Failed(self.fail(error, completed_at))
            }
        }
    }
}

/// One attempt of one node processing one token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum NodeState {
    Open(OpenNodeState),
    Completed(CompletedNodeState),
    Failed(FailedNodeState),
}

impl NodeState {
    pub fn state_id(&self) -> &StateId {
        match self {
            NodeState::Open(s) => &s.state_id,
            NodeState::Completed(s) => &s.state_id,
            NodeState::Failed(s) => &s.state_id,
        }
    }

    pub fn token_id(&self) -> &TokenId {
        match self {
            NodeState::Open(s) => &s.token_id,
            NodeState::Completed(s) => &s.token_id,
            NodeState::Failed(s) => &s.token_id,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        match self {
            NodeState::Open(s) => &s.node_id,
            NodeState::Completed(s) => &s.node_id,
            NodeState::Failed(s) => &s.node_id,
        }
    }

    pub fn step_index(&self) -> usize {
        match self {
            NodeState::Open(s) => s.step_index,
            NodeState::Completed(s) => s.step_index,
            NodeState::Failed(s) => s.step_index,
        }
    }

    pub fn attempt(&self) -> u32 {
        match self {
            NodeState::Open(s) => s.attempt,
            NodeState::Completed(s) => s.attempt,
            NodeState::Failed(s) => s.attempt,
        }
    }

    /// The `node_states.status` column value.
    pub fn status(&self) -> &'static str {
        match self {
            NodeState::Open(_) => "open",
            NodeState::Completed(_) => "completed",
            NodeState::Failed(_) => "failed",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, NodeState::Open(_))
    }
}
