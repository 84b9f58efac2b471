//! Small closed vocabularies shared by the ledger and the engine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Kind of graph vertex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Source,
    Transform,
    Gate,
    Aggregation,
    Coalesce,
    Sink,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Source => "source",
            NodeType::Transform => "transform",
            NodeType::Gate => "gate",
            NodeType::Aggregation => "aggregation",
            NodeType::Coalesce => "coalesce",
            NodeType::Sink => "sink",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Declared reproducibility of a plugin's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Determinism {
    #[default]
    Deterministic,
    Seeded,
    IoRead,
    ExternalCall,
    NonDeterministic,
}

/// How a row travels along an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// The row leaves its origin.
    Move,
    /// The row is duplicated to the destination (fork fan-out).
    Copy,
}

/// Which trigger caused an aggregation batch to flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Count,
    Timeout,
    Condition,
    EndOfSource,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerType::Count => "count",
            TriggerType::Timeout => "timeout",
            TriggerType::Condition => "condition",
            TriggerType::EndOfSource => "end_of_source",
        };
        f.write_str(s)
    }
}

/// Lifecycle of one aggregation window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Draft,
    Executing,
    Completed,
    Failed,
}

impl BatchStatus {
    /// Whether moving from `self` to `next` is a legal lifecycle step.
    pub fn can_transition_to(self, next: BatchStatus) -> bool {
        matches!(
            (self, next),
            (BatchStatus::Draft, BatchStatus::Executing)
                | (BatchStatus::Executing, BatchStatus::Completed)
                | (BatchStatus::Executing, BatchStatus::Failed)
        )
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn is_closed(self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_lifecycle_transitions() {
        assert!(BatchStatus::Draft.can_transition_to(BatchStatus::Executing));
        assert!(BatchStatus::Executing.can_transition_to(BatchStatus::Completed));
        assert!(BatchStatus::Executing.can_transition_to(BatchStatus::Failed));
        assert!(!BatchStatus::Draft.can_transition_to(BatchStatus::Completed));
        assert!(!BatchStatus::Completed.can_transition_to(BatchStatus::Executing));
        assert!(!BatchStatus::Failed.can_transition_to(BatchStatus::Draft));
    }

    #[test]
    fn vocabularies_serialize_to_snake_case() {
        assert_eq!(
            serde_json::to_string(&Determinism::ExternalCall).unwrap(),
            "\"external_call\""
        );
        assert_eq!(
            serde_json::to_string(&TriggerType::EndOfSource).unwrap(),
            "\"end_of_source\""
        );
        assert_eq!(serde_json::to_string(&RoutingMode::Copy).unwrap(), "\"copy\"");
        assert_eq!(serde_json::to_string(&NodeType::Coalesce).unwrap(), "\"coalesce\"");
    }

    #[test]
    fn trigger_type_display_matches_serialized_form() {
        assert_eq!(TriggerType::EndOfSource.to_string(), "end_of_source");
        assert_eq!(TriggerType::Count.to_string(), "count");
    }

    #[test]
    fn only_running_is_open() {
        assert!(!RunStatus::Running.is_closed());
        assert!(RunStatus::Completed.is_closed());
        assert!(RunStatus::Interrupted.is_closed());
        assert!(RunStatus::Failed.is_closed());
    }
}
