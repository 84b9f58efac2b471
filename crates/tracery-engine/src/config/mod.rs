//! Declarative settings for pipeline steps.
//!
//! All settings are plain serde structs so a pipeline description can be
//! loaded from JSON and fingerprinted into the run record. Loading files is
//! left to the caller.

pub mod duration_serde;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracery_expr::Expression;
use tracery_types::Result;

use crate::retry::RetrySettings;

pub const DEFAULT_MAX_QUEUE_ITERATIONS: usize = 10_000;

/// Run-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    /// Sink receiving tokens that reach the end of the pipeline.
    pub default_sink: String,
    /// Work-queue ceiling per source row.
    #[serde(default = "default_max_queue_iterations")]
    pub max_queue_iterations: usize,
}

fn default_max_queue_iterations() -> usize {
    DEFAULT_MAX_QUEUE_ITERATIONS
}

impl RunSettings {
    pub fn new(default_sink: impl Into<String>) -> Self {
        Self {
            default_sink: default_sink.into(),
            max_queue_iterations: DEFAULT_MAX_QUEUE_ITERATIONS,
        }
    }

    pub fn with_max_queue_iterations(mut self, limit: usize) -> Self {
        self.max_queue_iterations = limit;
        self
    }
}

// ---------------------------------------------------------------------------
// Transforms
// ---------------------------------------------------------------------------

/// Where a transform's declared error sends the row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ErrorDisposition {
    /// Discard into quarantine, recorded as a failed state.
    #[default]
    Quarantine,
    /// Divert to the named error sink.
    Sink { sink: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformSettings {
    pub name: String,
    #[serde(default)]
    pub on_error: ErrorDisposition,
    #[serde(default)]
    pub retry: RetrySettings,
    /// Only tokens on these fork branches are processed; others pass through
    /// untouched. `None` processes every token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub only_branches: Option<Vec<String>>,
}

impl TransformSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            on_error: ErrorDisposition::default(),
            retry: RetrySettings::default(),
            only_branches: None,
        }
    }

    pub fn on_error(mut self, disposition: ErrorDisposition) -> Self {
        self.on_error = disposition;
        self
    }

    pub fn retry(mut self, retry: RetrySettings) -> Self {
        self.retry = retry;
        self
    }

    pub fn only_branches<I, S>(mut self, branches: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.only_branches = Some(branches.into_iter().map(Into::into).collect());
        self
    }

    /// Whether a token on `branch` should run through this transform.
    pub fn applies_to(&self, branch: Option<&str>) -> bool {
        match (&self.only_branches, branch) {
            (None, _) => true,
            (Some(allowed), Some(b)) => allowed.iter().any(|a| a == b),
            (Some(_), None) => false,
        }
    }
}

// ---------------------------------------------------------------------------
// Gates
// ---------------------------------------------------------------------------

/// What a gate label resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RouteTarget {
    Continue,
    Fork { branches: Vec<String> },
    Sink { sink: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSettings {
    pub name: String,
    /// Condition producing the route label. Boolean results map to the
    /// labels `"true"` and `"false"`. Absent for plugin gates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub routes: BTreeMap<String, RouteTarget>,
}

impl GateSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            condition: None,
            routes: BTreeMap::new(),
        }
    }

    pub fn condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn route(mut self, label: impl Into<String>, target: RouteTarget) -> Self {
        self.routes.insert(label.into(), target);
        self
    }

    /// Every branch any route of this gate can fork into.
    pub fn fork_branches(&self) -> impl Iterator<Item = &str> {
        self.routes.values().flat_map(|target| match target {
            RouteTarget::Fork { branches } => branches.iter().map(String::as_str).collect(),
            _ => Vec::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Aggregations
// ---------------------------------------------------------------------------

/// Conditions that flush a batch. Any satisfied sub-trigger fires; they are
/// checked in the order count, timeout, condition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(
        default,
        with = "duration_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
    /// Evaluated against `row['batch_count']` and `row['batch_age']` (seconds).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl TriggerConfig {
    pub fn count(count: usize) -> Self {
        Self {
            count: Some(count),
            ..Self::default()
        }
    }

    pub fn timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn with_condition(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.count.is_none() && self.timeout.is_none() && self.condition.is_none()
    }

    pub fn parse_condition(&self) -> Result<Option<Expression>> {
        self.condition.as_deref().map(Expression::parse).transpose()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// The flush yields exactly one row, a new token descended from every member.
    #[default]
    Single,
    /// Members continue unchanged once the batch flushes.
    Passthrough,
    /// Every flushed row becomes a new token descended from every member.
    Transform,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationSettings {
    pub name: String,
    #[serde(default)]
    pub trigger: TriggerConfig,
    #[serde(default)]
    pub output_mode: OutputMode,
}

impl AggregationSettings {
    pub fn new(name: impl Into<String>, trigger: TriggerConfig) -> Self {
        Self {
            name: name.into(),
            trigger,
            output_mode: OutputMode::default(),
        }
    }

    pub fn output_mode(mut self, mode: OutputMode) -> Self {
        self.output_mode = mode;
        self
    }
}

// ---------------------------------------------------------------------------
// Coalesce
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoalescePolicy {
    /// Wait for every declared branch.
    RequireAll,
    /// Release once `count` branches have arrived.
    Quorum { count: usize },
    /// Merge whatever arrived once the timeout elapses or the source ends.
    BestEffort,
    /// Release on the first arrival.
    First,
}

impl CoalescePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoalescePolicy::RequireAll => "require_all",
            CoalescePolicy::Quorum { .. } => "quorum",
            CoalescePolicy::BestEffort => "best_effort",
            CoalescePolicy::First => "first",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Field union; later-declared branches win conflicts.
    Union,
    /// Each branch's row under its branch name.
    Nested,
    /// One branch's row verbatim.
    Select { branch: String },
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::Union => "union",
            MergeStrategy::Nested => "nested",
            MergeStrategy::Select { .. } => "select",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoalesceSettings {
    pub name: String,
    /// Expected branches in declaration order.
    pub branches: Vec<String>,
    pub policy: CoalescePolicy,
    pub merge: MergeStrategy,
    #[serde(
        default,
        with = "duration_serde::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout: Option<Duration>,
}

impl CoalesceSettings {
    pub fn new<I, S>(name: impl Into<String>, branches: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            branches: branches.into_iter().map(Into::into).collect(),
            policy: CoalescePolicy::RequireAll,
            merge: MergeStrategy::Union,
            timeout: None,
        }
    }

    pub fn policy(mut self, policy: CoalescePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn merge(mut self, merge: MergeStrategy) -> Self {
        self.merge = merge;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn gate_settings_from_json() {
        let gate: GateSettings = serde_json::from_value(json!({
            "name": "quality",
            "condition": "row['confidence'] >= 0.85",
            "routes": {
                "true": {"action": "continue"},
                "false": {"action": "sink", "sink": "review"},
            }
        }))
        .unwrap();
        assert_eq!(gate.routes["true"], RouteTarget::Continue);
        assert_eq!(
            gate.routes["false"],
            RouteTarget::Sink {
                sink: "review".into()
            }
        );
    }

    #[test]
    fn fork_branches_collects_every_fork_route() {
        let gate = GateSettings::new("split")
            .route(
                "all",
                RouteTarget::Fork {
                    branches: vec!["a".into(), "b".into()],
                },
            )
            .route("skip", RouteTarget::Continue);
        assert_eq!(gate.fork_branches().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn coalesce_settings_from_json() {
        let coalesce: CoalesceSettings = serde_json::from_value(json!({
            "name": "join",
            "branches": ["a", "b", "c"],
            "policy": {"kind": "quorum", "count": 2},
            "merge": {"kind": "select", "branch": "a"},
            "timeout": "100ms"
        }))
        .unwrap();
        assert_eq!(coalesce.policy, CoalescePolicy::Quorum { count: 2 });
        assert_eq!(
            coalesce.merge,
            MergeStrategy::Select { branch: "a".into() }
        );
        assert_eq!(coalesce.timeout, Some(Duration::from_millis(100)));
    }

    #[test]
    fn trigger_config_defaults_to_no_triggers() {
        let trigger: TriggerConfig = serde_json::from_value(json!({})).unwrap();
        assert!(trigger.is_empty());
        let trigger: TriggerConfig =
            serde_json::from_value(json!({"count": 3, "timeout": "5s"})).unwrap();
        assert_eq!(trigger.count, Some(3));
        assert_eq!(trigger.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn trigger_condition_is_parsed_eagerly() {
        let bad = TriggerConfig::count(3).with_condition("len(row) > 2");
        assert!(bad.parse_condition().is_err());
        let good = TriggerConfig::count(3).with_condition("row['batch_count'] >= 2");
        assert!(good.parse_condition().unwrap().is_some());
    }

    #[test]
    fn branch_filter() {
        let all = TransformSettings::new("t");
        assert!(all.applies_to(None));
        assert!(all.applies_to(Some("a")));

        let only_a = TransformSettings::new("t").only_branches(["a"]);
        assert!(only_a.applies_to(Some("a")));
        assert!(!only_a.applies_to(Some("b")));
        assert!(!only_a.applies_to(None));
    }

    #[test]
    fn run_settings_default_ceiling() {
        let run: RunSettings = serde_json::from_value(json!({"default_sink": "out"})).unwrap();
        assert_eq!(run.max_queue_iterations, DEFAULT_MAX_QUEUE_ITERATIONS);
    }
}
