//! What happened to a token when it left the work queue.

use serde::{Deserialize, Serialize};

use crate::ids::{BatchId, TokenId};
use crate::token::Token;

/// Final disposition of a token as reported by the row processor.
///
/// `Coalesced` and `ConsumedInBatch` describe tokens whose story continues in
/// another token; they carry the link to follow. A forked parent is never
/// reported at all, its children are. The ledger never stores any of these as
/// a status column, it derives them from the same links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RowOutcome {
    /// Reached the end of the pipeline, bound for the default sink.
    Completed { sink: String },
    /// Sent to a named sink by a gate or an error disposition.
    Routed { sink: String },
    Coalesced { merged_into: TokenId },
    ConsumedInBatch { batch_id: BatchId },
    /// Declared plugin error with a discard disposition.
    Quarantined { reason: serde_json::Value },
    Failed { reason: serde_json::Value },
}

impl RowOutcome {
    /// Short label for counters and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RowOutcome::Completed { .. } => "completed",
            RowOutcome::Routed { .. } => "routed",
            RowOutcome::Coalesced { .. } => "coalesced",
            RowOutcome::ConsumedInBatch { .. } => "consumed_in_batch",
            RowOutcome::Quarantined { .. } => "quarantined",
            RowOutcome::Failed { .. } => "failed",
        }
    }

    /// The sink this token is bound for, if any.
    pub fn sink(&self) -> Option<&str> {
        match self {
            RowOutcome::Completed { sink } | RowOutcome::Routed { sink } => Some(sink),
            _ => None,
        }
    }
}

/// A token paired with its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowResult {
    pub token: Token,
    pub outcome: RowOutcome,
}

impl RowResult {
    pub fn new(token: Token, outcome: RowOutcome) -> Self {
        Self { token, outcome }
    }
}
