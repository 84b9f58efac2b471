//! Pipeline validation: lint rules and diagnostics.
//!
//! Rules check the structure of a [`Pipeline`] before any row is read. Call
//! [`validate`] for advisory diagnostics or [`validate_or_raise`] to fail on
//! any `Error`-severity issue.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use tracery_types::{Result, TraceryError};

use crate::config::{CoalescePolicy, ErrorDisposition, MergeStrategy, RouteTarget};
use crate::graph::{Pipeline, StepKind};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub node: Option<String>,
    pub fix: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl Diagnostic {
    fn new(rule: &dyn LintRule, severity: Severity, message: String) -> Self {
        Self {
            rule: rule.name().into(),
            severity,
            message,
            node: None,
            fix: None,
        }
    }

    fn at(mut self, node: &str) -> Self {
        self.node = Some(node.to_string());
        self
    }

    fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fix = Some(fix.into());
        self
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic>;
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_\-]*$").expect("name pattern compiles"));

/// Branches forked by gates before step `index`.
fn branches_before(pipeline: &Pipeline, index: usize) -> HashSet<&str> {
    pipeline.steps()[..index]
        .iter()
        .filter_map(|step| match &step.kind {
            StepKind::Gate(gate) => Some(gate.settings.fork_branches().collect::<Vec<_>>()),
            _ => None,
        })
        .flatten()
        .collect()
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct NameFormatRule;
impl LintRule for NameFormatRule {
    fn name(&self) -> &str { "name_format" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let step_names = pipeline.steps().iter().map(|s| s.name());
        step_names
            .chain(pipeline.sink_names())
            .filter(|name| !NAME_PATTERN.is_match(name))
            .map(|name| {
                Diagnostic::new(
                    self,
                    Severity::Error,
                    format!("Node name '{name}' must start with a letter or '_' and contain only letters, digits, '_' or '-'"),
                )
                .at(name)
            })
            .collect()
    }
}

struct UniqueNamesRule;
impl LintRule for UniqueNamesRule {
    fn name(&self) -> &str { "unique_names" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let mut seen = HashSet::new();
        pipeline
            .steps()
            .iter()
            .filter(|step| !seen.insert(step.node_id.clone()))
            .map(|step| {
                Diagnostic::new(
                    self,
                    Severity::Error,
                    format!("{} '{}' is declared more than once", step.node_type(), step.name()),
                )
                .at(step.name())
                .fix("Give every step of the same type a distinct name")
            })
            .collect()
    }
}

struct DefaultSinkRule;
impl LintRule for DefaultSinkRule {
    fn name(&self) -> &str { "default_sink" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let default = &pipeline.settings().default_sink;
        if pipeline.has_sink(default) {
            return vec![];
        }
        vec![Diagnostic::new(
            self,
            Severity::Error,
            format!("Default sink '{default}' is not declared"),
        )
        .fix(format!("Add a sink named '{default}'"))]
    }
}

struct RouteTargetsRule;
impl LintRule for RouteTargetsRule {
    fn name(&self) -> &str { "route_targets" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for step in pipeline.steps() {
            match &step.kind {
                StepKind::Gate(gate) => {
                    if gate.settings.routes.is_empty() {
                        diags.push(
                            Diagnostic::new(self, Severity::Error, format!("Gate '{}' has no routes", gate.name()))
                                .at(gate.name()),
                        );
                    }
                    for (label, target) in &gate.settings.routes {
                        match target {
                            RouteTarget::Sink { sink } if !pipeline.has_sink(sink) => diags.push(
                                Diagnostic::new(
                                    self,
                                    Severity::Error,
                                    format!("Gate '{}' routes '{label}' to undeclared sink '{sink}'", gate.name()),
                                )
                                .at(gate.name()),
                            ),
                            RouteTarget::Fork { branches } => {
                                let unique: HashSet<_> = branches.iter().collect();
                                if branches.is_empty() || unique.len() != branches.len() {
                                    diags.push(
                                        Diagnostic::new(
                                            self,
                                            Severity::Error,
                                            format!(
                                                "Gate '{}' route '{label}' must fork into distinct, non-empty branches",
                                                gate.name()
                                            ),
                                        )
                                        .at(gate.name()),
                                    );
                                }
                            }
                            _ => {}
                        }
                    }
                }
                StepKind::Transform { settings, .. } => {
                    if let ErrorDisposition::Sink { sink } = &settings.on_error {
                        if !pipeline.has_sink(sink) {
                            diags.push(
                                Diagnostic::new(
                                    self,
                                    Severity::Error,
                                    format!("Transform '{}' sends errors to undeclared sink '{sink}'", settings.name),
                                )
                                .at(&settings.name),
                            );
                        }
                    }
                }
                _ => {}
            }
        }
        diags
    }
}

struct CoalesceBranchesRule;
impl LintRule for CoalesceBranchesRule {
    fn name(&self) -> &str { "coalesce_branches" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for (index, step) in pipeline.steps().iter().enumerate() {
            let StepKind::Coalesce(settings) = &step.kind else {
                continue;
            };
            let unique: HashSet<_> = settings.branches.iter().collect();
            if settings.branches.is_empty() || unique.len() != settings.branches.len() {
                diags.push(
                    Diagnostic::new(
                        self,
                        Severity::Error,
                        format!("Coalesce '{}' must name distinct, non-empty branches", settings.name),
                    )
                    .at(&settings.name),
                );
            }
            let forked = branches_before(pipeline, index);
            let missing: Vec<&str> = settings
                .branches
                .iter()
                .map(String::as_str)
                .filter(|b| !forked.contains(b))
                .collect();
            if !missing.is_empty() {
                diags.push(
                    Diagnostic::new(
                        self,
                        Severity::Error,
                        format!(
                            "Coalesce '{}' waits for branches no earlier gate forks: {}",
                            settings.name,
                            missing.join(", ")
                        ),
                    )
                    .at(&settings.name)
                    .fix("Add a fork route producing these branches before the coalesce"),
                );
            }
        }
        diags
    }
}

struct CoalescePolicyRule;
impl LintRule for CoalescePolicyRule {
    fn name(&self) -> &str { "coalesce_policy" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for step in pipeline.steps() {
            let StepKind::Coalesce(settings) = &step.kind else {
                continue;
            };
            let expected = settings.branches.len();
            if let CoalescePolicy::Quorum { count } = settings.policy {
                if count == 0 || count > expected {
                    diags.push(
                        Diagnostic::new(
                            self,
                            Severity::Error,
                            format!(
                                "Coalesce '{}' quorum count {count} is outside 1..={expected}",
                                settings.name
                            ),
                        )
                        .at(&settings.name),
                    );
                }
            }
            if let MergeStrategy::Select { branch } = &settings.merge {
                if !settings.branches.contains(branch) {
                    diags.push(
                        Diagnostic::new(
                            self,
                            Severity::Error,
                            format!("Coalesce '{}' selects undeclared branch '{branch}'", settings.name),
                        )
                        .at(&settings.name),
                    );
                }
            }
            if settings.policy == CoalescePolicy::BestEffort && settings.timeout.is_none() {
                diags.push(
                    Diagnostic::new(
                        self,
                        Severity::Error,
                        format!(
                            "Coalesce '{}' is best_effort without a timeout",
                            settings.name
                        ),
                    )
                    .at(&settings.name)
                    .fix("Set a timeout"),
                );
            }
            if settings.timeout.is_some_and(|t| t.is_zero()) {
                diags.push(
                    Diagnostic::new(
                        self,
                        Severity::Warning,
                        format!("Coalesce '{}' has a zero timeout", settings.name),
                    )
                    .at(&settings.name),
                );
            }
        }
        diags
    }
}

struct AggregationTriggerRule;
impl LintRule for AggregationTriggerRule {
    fn name(&self) -> &str { "aggregation_trigger" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for step in pipeline.steps() {
            let StepKind::Aggregation { settings, .. } = &step.kind else {
                continue;
            };
            if settings.trigger.count == Some(0) {
                diags.push(
                    Diagnostic::new(
                        self,
                        Severity::Error,
                        format!("Aggregation '{}' has a count trigger of 0", settings.name),
                    )
                    .at(&settings.name),
                );
            }
            if settings.trigger.is_empty() {
                diags.push(
                    Diagnostic::new(
                        self,
                        Severity::Info,
                        format!("Aggregation '{}' has no trigger and flushes once, at the end of the source", settings.name),
                    )
                    .at(&settings.name),
                );
            }
        }
        diags
    }
}

struct BranchFilterRule;
impl LintRule for BranchFilterRule {
    fn name(&self) -> &str { "branch_filter" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let mut diags = Vec::new();
        for (index, step) in pipeline.steps().iter().enumerate() {
            let StepKind::Transform { settings, .. } = &step.kind else {
                continue;
            };
            let Some(only) = &settings.only_branches else {
                continue;
            };
            let forked = branches_before(pipeline, index);
            for branch in only.iter().filter(|b| !forked.contains(b.as_str())) {
                diags.push(
                    Diagnostic::new(
                        self,
                        Severity::Warning,
                        format!(
                            "Transform '{}' is limited to branch '{branch}', which no earlier gate forks",
                            settings.name
                        ),
                    )
                    .at(&settings.name),
                );
            }
        }
        diags
    }
}

struct RetryAttemptsRule;
impl LintRule for RetryAttemptsRule {
    fn name(&self) -> &str { "retry_attempts" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        pipeline
            .steps()
            .iter()
            .filter_map(|step| match &step.kind {
                StepKind::Transform { settings, .. } if settings.retry.max_attempts == 0 => Some(
                    Diagnostic::new(
                        self,
                        Severity::Error,
                        format!("Transform '{}' allows 0 attempts", settings.name),
                    )
                    .at(&settings.name)
                    .fix("Use max_attempts = 1 to disable retries"),
                ),
                _ => None,
            })
            .collect()
    }
}

struct UncoalescedForkRule;
impl LintRule for UncoalescedForkRule {
    fn name(&self) -> &str { "uncoalesced_fork" }
    fn apply(&self, pipeline: &Pipeline) -> Vec<Diagnostic> {
        let steps = pipeline.steps();
        steps
            .iter()
            .enumerate()
            .filter_map(|(index, step)| match &step.kind {
                StepKind::Gate(gate) if gate.settings.fork_branches().next().is_some() => {
                    let joined = steps[index + 1..]
                        .iter()
                        .any(|s| matches!(s.kind, StepKind::Coalesce(_)));
                    (!joined).then(|| {
                        Diagnostic::new(
                            self,
                            Severity::Info,
                            format!("Gate '{}' forks without a later coalesce; each branch reaches the sink separately", gate.name()),
                        )
                        .at(gate.name())
                    })
                }
                _ => None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(pipeline: &Pipeline) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(NameFormatRule),
        Box::new(UniqueNamesRule),
        Box::new(DefaultSinkRule),
        Box::new(RouteTargetsRule),
        Box::new(CoalesceBranchesRule),
        Box::new(CoalescePolicyRule),
        Box::new(AggregationTriggerRule),
        Box::new(BranchFilterRule),
        Box::new(RetryAttemptsRule),
        Box::new(UncoalescedForkRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(pipeline));
    }
    diagnostics
}

/// Run all lint rules. Any `Error`-severity diagnostic fails the call with
/// every error message joined by `"; "`; otherwise the remaining
/// diagnostics are returned.
pub fn validate_or_raise(pipeline: &Pipeline) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(pipeline);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.message.clone())
        .collect();
    if !errors.is_empty() {
        return Err(TraceryError::ValidationError(errors.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
