//! Rows of the audit schema.
//!
//! One struct per conceptual table: `runs, nodes, edges, rows, tokens,
//! token_parents, node_states, batches, batch_members, artifacts,
//! routing_events`. Node states reuse [`tracery_types::NodeState`] directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tracery_types::{
    ArtifactId, BatchId, BatchStatus, Determinism, EdgeId, GroupId, NodeId, NodeType,
    RoutingEventId, RoutingMode, RowData, RowId, RunId, RunStatus, StateId, Token, TokenId,
    TriggerType,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Stable hash of the run settings.
    pub config_hash: String,
    pub settings: serde_json::Value,
    pub status: RunStatus,
}

/// What the caller supplies to register a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub node_id: NodeId,
    pub plugin_name: String,
    pub node_type: NodeType,
    pub plugin_version: String,
    pub determinism: Determinism,
    pub config_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
    pub run_id: RunId,
    pub plugin_name: String,
    pub node_type: NodeType,
    pub plugin_version: String,
    pub determinism: Determinism,
    pub config_hash: String,
    /// Registration order within the run.
    pub sequence: usize,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub edge_id: EdgeId,
    pub run_id: RunId,
    pub from_node_id: NodeId,
    pub to_node_id: NodeId,
    pub label: String,
    pub mode: RoutingMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowRecord {
    pub row_id: RowId,
    pub run_id: RunId,
    pub source_node_id: NodeId,
    pub row_index: usize,
    pub source_data_hash: String,
    pub data: RowData,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub token_id: TokenId,
    pub row_id: RowId,
    pub fork_group_id: Option<GroupId>,
    pub join_group_id: Option<GroupId>,
    pub branch_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TokenRecord {
    /// The live token for this record carrying `row_data`.
    pub fn with_data(&self, row_data: RowData) -> Token {
        Token {
            token_id: self.token_id.clone(),
            row_id: self.row_id.clone(),
            branch_name: self.branch_name.clone(),
            fork_group_id: self.fork_group_id.clone(),
            join_group_id: self.join_group_id.clone(),
            row_data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenParentRecord {
    pub token_id: TokenId,
    pub parent_token_id: TokenId,
    pub ordinal: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRecord {
    pub batch_id: BatchId,
    pub run_id: RunId,
    pub aggregation_node_id: NodeId,
    pub status: BatchStatus,
    pub trigger_type: Option<TriggerType>,
    pub trigger_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMemberRecord {
    pub batch_id: BatchId,
    pub token_id: TokenId,
    pub ordinal: usize,
}

/// What a sink write produced, before the ledger assigns an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewArtifact {
    pub produced_by_state_id: StateId,
    pub sink_node_id: NodeId,
    pub artifact_type: String,
    pub path_or_uri: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    pub artifact_id: ArtifactId,
    pub run_id: RunId,
    pub produced_by_state_id: StateId,
    pub sink_node_id: NodeId,
    pub artifact_type: String,
    pub path_or_uri: String,
    pub content_hash: String,
    pub size_bytes: u64,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A gate decision (or error-sink diversion) before the ledger assigns an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRoutingEvent {
    pub state_id: StateId,
    pub edge_id: Option<EdgeId>,
    /// Shared by the events of one decision (one per fork branch).
    pub routing_group_id: GroupId,
    pub ordinal: usize,
    pub mode: RoutingMode,
    /// Source text of the evaluated condition, absent for plugin gates.
    pub condition: Option<String>,
    pub label: String,
    /// `continue`, a branch name, or a sink name.
    pub destination: String,
    pub reason: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingEventRecord {
    pub event_id: RoutingEventId,
    pub state_id: StateId,
    pub edge_id: Option<EdgeId>,
    pub routing_group_id: GroupId,
    pub ordinal: usize,
    pub mode: RoutingMode,
    pub condition: Option<String>,
    pub label: String,
    pub destination: String,
    pub reason: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
