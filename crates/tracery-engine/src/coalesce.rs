//! Coalesce barriers.
//!
//! The [`CoalesceExecutor`] holds fork children per `(coalesce, row)` until
//! the configured policy is satisfied, then hands back a [`CoalesceRelease`]
//! carrying the merged payload. It owns no ledger handle: the processor
//! records what the executor decides.
//!
//! | policy        | releases on accept            | on timeout            | at end of source |
//! |---------------|-------------------------------|-----------------------|------------------|
//! | `require_all` | every branch arrived          | failure               | failure          |
//! | `quorum(n)`   | `n` branches arrived          | failure               | failure          |
//! | `best_effort` | never                         | merge what arrived    | merge            |
//! | `first`       | first arrival                 | n/a                   | n/a              |

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use serde_json::{json, Value};
use tracery_types::{not_found, FailureDetail, Result, RowData, RowId, StateId, Token};

use crate::config::{CoalescePolicy, CoalesceSettings, MergeStrategy};

/// A token held at a barrier.
#[derive(Debug, Clone, PartialEq)]
pub struct Arrival {
    pub token: Token,
    /// Open node state recorded for the token at the coalesce node.
    pub state_id: StateId,
    pub arrived_at: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoalesceRelease {
    pub coalesce: String,
    pub step: usize,
    pub row_id: RowId,
    pub merged: RowData,
    /// Consumed tokens in declared branch order.
    pub consumed: Vec<Arrival>,
    /// Audit metadata for every consumed token's state.
    pub metadata: Value,
}

impl CoalesceRelease {
    pub fn branches(&self) -> Vec<String> {
        self.consumed
            .iter()
            .filter_map(|a| a.token.branch_name.clone())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoalesceFailure {
    pub coalesce: String,
    pub step: usize,
    pub row_id: RowId,
    pub held: Vec<Arrival>,
    pub error: FailureDetail,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CoalesceOutcome {
    Held,
    Released(CoalesceRelease),
    Failed(CoalesceFailure),
    /// The arriving token cannot join: late, duplicate, or not an expected branch.
    Rejected {
        arrival: Arrival,
        error: FailureDetail,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReleaseCause {
    Accept,
    Timeout,
    EndOfSource,
}

impl ReleaseCause {
    fn as_str(self) -> &'static str {
        match self {
            ReleaseCause::Accept => "accept",
            ReleaseCause::Timeout => "timeout",
            ReleaseCause::EndOfSource => "end_of_source",
        }
    }
}

#[derive(Debug)]
struct Point {
    step: usize,
    settings: CoalesceSettings,
}

#[derive(Debug)]
struct PendingMerge {
    first_arrival: Duration,
    arrivals: HashMap<String, Arrival>,
}

type MergeKey = (String, RowId);

/// Expected branches of one `(coalesce, row)` that are accounted for, by
/// arriving or by ending upstream. Dropped once every branch is settled and
/// nothing is pending.
#[derive(Debug, Default)]
struct Tally {
    resolved: bool,
    settled: HashSet<String>,
}

#[derive(Debug, Default)]
pub struct CoalesceExecutor {
    points: HashMap<String, Point>,
    pending: BTreeMap<MergeKey, PendingMerge>,
    tallies: HashMap<MergeKey, Tally>,
}

impl CoalesceExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a barrier at pipeline position `step`.
    pub fn register(&mut self, step: usize, settings: CoalesceSettings) {
        self.points
            .insert(settings.name.clone(), Point { step, settings });
    }

    /// Number of `(coalesce, row)` merges still waiting.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of `(coalesce, row)` pairs that may still see a branch.
    pub fn tracked_count(&self) -> usize {
        self.tallies.len()
    }

    /// Account for a branch token that ended at pipeline position `step`
    /// without going any further. Every later barrier expecting its branch
    /// stops waiting for it to arrive late.
    pub fn branch_ended(&mut self, token: &Token, step: usize) {
        let Some(branch) = token.branch() else {
            return;
        };
        let names: Vec<String> = self
            .points
            .iter()
            .filter(|(_, p)| p.step > step && p.settings.branches.iter().any(|b| b == branch))
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            let key = (name, token.row_id.clone());
            self.tallies
                .entry(key.clone())
                .or_default()
                .settled
                .insert(branch.to_string());
            self.prune(&key);
        }
    }

    fn prune(&mut self, key: &MergeKey) {
        let Some(expected) = self.points.get(&key.0).map(|p| p.settings.branches.len()) else {
            return;
        };
        let settled = self
            .tallies
            .get(key)
            .is_some_and(|t| t.settled.len() >= expected);
        if settled && !self.pending.contains_key(key) {
            self.tallies.remove(key);
        }
    }

    pub fn accept(
        &mut self,
        coalesce: &str,
        token: Token,
        state_id: StateId,
        now: Duration,
    ) -> Result<CoalesceOutcome> {
        let point = self
            .points
            .get(coalesce)
            .ok_or_else(|| not_found("coalesce", coalesce))?;
        let key = (coalesce.to_string(), token.row_id.clone());
        let arrival = Arrival {
            token,
            state_id,
            arrived_at: now,
        };

        let branch = match arrival.token.branch() {
            Some(b) if point.settings.branches.iter().any(|e| e == b) => b.to_string(),
            other => {
                let error = FailureDetail::new(
                    "unexpected_branch",
                    format!(
                        "coalesce '{coalesce}' does not expect branch {}",
                        other.unwrap_or("<none>")
                    ),
                )
                .with_detail(json!({"expected": point.settings.branches}));
                return Ok(CoalesceOutcome::Rejected { arrival, error });
            }
        };

        let tally = self.tallies.entry(key.clone()).or_default();
        if tally.resolved {
            tally.settled.insert(branch.clone());
            let error = FailureDetail::new(
                "late_arrival",
                format!("coalesce '{coalesce}' already resolved this row"),
            )
            .with_detail(json!({"branch": branch}));
            self.prune(&key);
            return Ok(CoalesceOutcome::Rejected { arrival, error });
        }
        if !tally.settled.insert(branch.clone()) {
            let error = FailureDetail::new(
                "duplicate_branch",
                format!("branch '{branch}' already arrived at coalesce '{coalesce}'"),
            );
            return Ok(CoalesceOutcome::Rejected { arrival, error });
        }

        let pending = self.pending.entry(key.clone()).or_insert_with(|| PendingMerge {
            first_arrival: now,
            arrivals: HashMap::new(),
        });
        pending.arrivals.insert(branch, arrival);

        let arrived = pending.arrivals.len();
        let ready = match &point.settings.policy {
            CoalescePolicy::RequireAll => arrived == point.settings.branches.len(),
            CoalescePolicy::Quorum { count } => arrived >= *count,
            CoalescePolicy::BestEffort => false,
            CoalescePolicy::First => true,
        };
        if !ready {
            return Ok(CoalesceOutcome::Held);
        }
        Ok(self.resolve(key, now, ReleaseCause::Accept))
    }

    /// Resolve every pending merge whose timeout has elapsed.
    pub fn check_timeouts(&mut self, now: Duration) -> Vec<CoalesceOutcome> {
        let expired: Vec<MergeKey> = self
            .pending
            .iter()
            .filter(|((name, _), pending)| {
                self.points
                    .get(name)
                    .and_then(|p| p.settings.timeout)
                    .is_some_and(|t| now.saturating_sub(pending.first_arrival) >= t)
            })
            .map(|(key, _)| key.clone())
            .collect();
        expired
            .into_iter()
            .map(|key| self.resolve(key, now, ReleaseCause::Timeout))
            .collect()
    }

    /// End of source: resolve every merge still pending at pipeline position
    /// `step`. Called once per barrier, in pipeline order, so merges released
    /// upstream reach downstream barriers before those are flushed.
    pub fn flush_pending(&mut self, step: usize, now: Duration) -> Vec<CoalesceOutcome> {
        let keys: Vec<MergeKey> = self
            .pending
            .keys()
            .filter(|(name, _)| self.points.get(name).is_some_and(|p| p.step == step))
            .cloned()
            .collect();
        keys.into_iter()
            .map(|key| self.resolve(key, now, ReleaseCause::EndOfSource))
            .collect()
    }

    fn resolve(&mut self, key: MergeKey, now: Duration, cause: ReleaseCause) -> CoalesceOutcome {
        let Some(mut pending) = self.pending.remove(&key) else {
            return CoalesceOutcome::Held;
        };
        self.tallies.entry(key.clone()).or_default().resolved = true;
        self.prune(&key);
        let (coalesce, row_id) = key;
        let Some(point) = self.points.get(&coalesce) else {
            return CoalesceOutcome::Held;
        };
        let settings = &point.settings;

        let held: Vec<Arrival> = settings
            .branches
            .iter()
            .filter_map(|b| pending.arrivals.remove(b))
            .collect();
        let arrived: Vec<&str> = held.iter().filter_map(|a| a.token.branch()).collect();
        let wait = now.saturating_sub(pending.first_arrival);

        let merges = match (&settings.policy, cause) {
            (_, ReleaseCause::Accept) => true,
            (CoalescePolicy::BestEffort | CoalescePolicy::First, _) => true,
            (CoalescePolicy::RequireAll | CoalescePolicy::Quorum { .. }, _) => false,
        };
        let merged = if merges {
            merge_rows(settings, &held)
        } else {
            let kind = match cause {
                ReleaseCause::Timeout => "coalesce_timeout",
                _ => "coalesce_incomplete",
            };
            Err(FailureDetail::new(
                kind,
                format!(
                    "coalesce '{coalesce}' ({}) resolved by {} with {} of {} branches",
                    settings.policy.as_str(),
                    cause.as_str(),
                    held.len(),
                    settings.branches.len()
                ),
            ))
        };

        match merged {
            Ok(merged) => {
                let offsets: serde_json::Map<String, Value> = held
                    .iter()
                    .filter_map(|a| {
                        let offset = a.arrived_at.saturating_sub(pending.first_arrival);
                        a.token
                            .branch_name
                            .clone()
                            .map(|b| (b, json!(offset.as_millis() as u64)))
                    })
                    .collect();
                let metadata = json!({
                    "coalesce": coalesce,
                    "policy": settings.policy.as_str(),
                    "merge_strategy": settings.merge.as_str(),
                    "expected_branches": settings.branches,
                    "branches_arrived": arrived,
                    "arrival_offsets_ms": offsets,
                    "wait_duration_ms": wait.as_millis() as u64,
                    "released_by": cause.as_str(),
                });
                CoalesceOutcome::Released(CoalesceRelease {
                    coalesce,
                    step: point.step,
                    row_id,
                    merged,
                    consumed: held,
                    metadata,
                })
            }
            Err(error) => {
                let error = error.with_detail(json!({
                    "policy": settings.policy.as_str(),
                    "expected_branches": settings.branches,
                    "branches_arrived": arrived,
                    "wait_duration_ms": wait.as_millis() as u64,
                }));
                CoalesceOutcome::Failed(CoalesceFailure {
                    coalesce,
                    step: point.step,
                    row_id,
                    held,
                    error,
                })
            }
        }
    }
}

/// Combine arrived payloads. `held` is in declared branch order.
fn merge_rows(
    settings: &CoalesceSettings,
    held: &[Arrival],
) -> std::result::Result<RowData, FailureDetail> {
    match &settings.merge {
        MergeStrategy::Union => {
            let mut merged = RowData::new();
            for arrival in held {
                merged.extend(arrival.token.row_data.clone());
            }
            Ok(merged)
        }
        MergeStrategy::Nested => Ok(held
            .iter()
            .filter_map(|a| {
                a.token
                    .branch_name
                    .clone()
                    .map(|b| (b, Value::Object(a.token.row_data.clone())))
            })
            .collect()),
        MergeStrategy::Select { branch } => held
            .iter()
            .find(|a| a.token.branch() == Some(branch.as_str()))
            .map(|a| a.token.row_data.clone())
            .ok_or_else(|| {
                FailureDetail::new(
                    "select_branch_missing",
                    format!(
                        "coalesce '{}' selects branch '{branch}', which did not arrive",
                        settings.name
                    ),
                )
            }),
    }
}
