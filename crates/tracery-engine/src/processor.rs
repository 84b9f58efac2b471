//! The row processor: an explicit, bounded work queue.
//!
//! Each source row becomes a token queued at step 0. A dequeued token is
//! advanced through exactly one step; the step either hands back the token
//! for the next step, fans it out (fork), holds it (coalesce, passthrough
//! batch), or ends it with a [`RowOutcome`]. Tokens released from barriers by
//! timeouts or batch triggers join whichever queue is draining at the time.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracery_audit::{Ledger, NewRoutingEvent, QUARANTINED};
use tracery_types::{
    stable_hash, BatchId, BatchStatus, Clock, EdgeId, FailureDetail, GroupId, NodeId,
    NodeStateCompletion, NodeType, Result, RoutingMode, RowData, RowOutcome, RowResult, RunId,
    StateId, Token, TraceryError, TriggerType,
};

use crate::coalesce::{CoalesceExecutor, CoalesceOutcome};
use crate::config::{ErrorDisposition, OutputMode, RouteTarget, RunSettings};
use crate::events::{EventEmitter, RunEvent};
use crate::gate::GateDecision;
use crate::graph::{fork_edge_label, Step, StepKind, CONTINUE, ON_ERROR};
use crate::plugin::TransformResult;
use crate::tokens::TokenManager;
use crate::triggers::TriggerEvaluator;

/// A token waiting to run step `step` (0-based; `steps.len()` means done).
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub token: Token,
    pub step: usize,
}

enum Next {
    Push(WorkItem),
    Done(RowResult),
}

/// Engine-side state of one aggregation node.
struct OpenBatch {
    trigger: TriggerEvaluator,
    batch_id: Option<BatchId>,
    members: Vec<Token>,
}

pub struct RowProcessor {
    ledger: Arc<Ledger>,
    run_id: RunId,
    tokens: TokenManager,
    source_node: NodeId,
    steps: Vec<Step>,
    default_sink: String,
    max_iterations: usize,
    clock: Arc<dyn Clock>,
    emitter: EventEmitter,
    coalesce: CoalesceExecutor,
    batches: HashMap<NodeId, OpenBatch>,
}

fn dispatch(next: Vec<Next>, queue: &mut VecDeque<WorkItem>, results: &mut Vec<RowResult>) {
    for n in next {
        match n {
            Next::Push(item) => queue.push_back(item),
            Next::Done(result) => results.push(result),
        }
    }
}

fn failure_reason(error: &FailureDetail) -> Value {
    json!({"kind": error.kind, "message": error.message, "detail": error.detail})
}

fn error_kind(error: &TraceryError) -> &'static str {
    match error {
        TraceryError::MissingField { .. } => "missing_field",
        TraceryError::ExpressionEvaluation { .. } => "evaluation_error",
        _ => "plugin_error",
    }
}

/// The trigger named by an evaluator that just reported it should fire.
fn fired_trigger(node: &NodeId, trigger: &TriggerEvaluator) -> Result<TriggerType> {
    trigger.which_triggered().ok_or_else(|| {
        TraceryError::InvariantViolation(format!(
            "aggregation '{node}' fired without naming a trigger"
        ))
    })
}

fn step_mismatch(step: &Step, expected: NodeType) -> TraceryError {
    TraceryError::InvariantViolation(format!(
        "step '{}' is a {}, expected a {expected}",
        step.node_id,
        step.node_type()
    ))
}

impl RowProcessor {
    pub fn new(
        ledger: Arc<Ledger>,
        run_id: RunId,
        source_node: NodeId,
        steps: Vec<Step>,
        settings: &RunSettings,
        clock: Arc<dyn Clock>,
        emitter: EventEmitter,
    ) -> Result<Self> {
        let mut coalesce = CoalesceExecutor::new();
        let mut batches = HashMap::new();
        for (index, step) in steps.iter().enumerate() {
            match &step.kind {
                StepKind::Coalesce(settings) => coalesce.register(index, settings.clone()),
                StepKind::Aggregation { settings, .. } => {
                    batches.insert(
                        step.node_id.clone(),
                        OpenBatch {
                            trigger: TriggerEvaluator::new(&settings.name, &settings.trigger)?,
                            batch_id: None,
                            members: Vec::new(),
                        },
                    );
                }
                _ => {}
            }
        }
        Ok(Self {
            tokens: TokenManager::new(ledger.clone(), run_id.clone()),
            ledger,
            run_id,
            source_node,
            steps,
            default_sink: settings.default_sink.clone(),
            max_iterations: settings.max_queue_iterations,
            clock,
            emitter,
            coalesce,
            batches,
        })
    }

    /// Ingest one source row and drive it, and anything it releases, until
    /// the queue is empty. Returns every terminal outcome produced.
    pub async fn process_row(&mut self, row_index: usize, data: RowData) -> Result<Vec<RowResult>> {
        let token = self
            .tokens
            .create_initial_token(&self.source_node, row_index, data)?;
        let label = token.row_id.to_string();
        tracing::debug!(row_index, row_id = %label, "Row ingested");
        let queue = VecDeque::from([WorkItem { token, step: 0 }]);
        self.drain(&label, queue, Vec::new()).await
    }

    /// End of source: flush every aggregation and resolve every pending
    /// coalesce, in step order so upstream output reaches downstream
    /// barriers before they are resolved.
    pub async fn finish(&mut self) -> Result<Vec<RowResult>> {
        // Expired barriers and batches resolve as timeouts, not as end of source.
        let mut queue = VecDeque::new();
        let mut released = Vec::new();
        dispatch(self.check_timeouts()?, &mut queue, &mut released);
        let mut results = self.drain("end-of-source", queue, released).await?;

        for index in 0..self.steps.len() {
            let now = self.clock.now();
            let mut queue = VecDeque::new();
            let mut released = Vec::new();
            match self.steps[index].node_type() {
                NodeType::Aggregation => {
                    let next = self.flush_batch(index, TriggerType::EndOfSource, now)?;
                    dispatch(next, &mut queue, &mut released);
                }
                NodeType::Coalesce => {
                    for outcome in self.coalesce.flush_pending(index, now) {
                        let next = self.resolve_coalesce(outcome)?;
                        dispatch(next, &mut queue, &mut released);
                    }
                }
                _ => continue,
            }
            results.extend(self.drain("end-of-source", queue, released).await?);
        }
        Ok(results)
    }

    /// Merges still waiting at a coalesce.
    pub fn pending_merges(&self) -> usize {
        self.coalesce.pending_count()
    }

    async fn drain(
        &mut self,
        label: &str,
        mut queue: VecDeque<WorkItem>,
        mut results: Vec<RowResult>,
    ) -> Result<Vec<RowResult>> {
        let mut iterations = 0usize;
        while let Some(item) = queue.pop_front() {
            iterations += 1;
            if iterations > self.max_iterations {
                tracing::error!(row = %label, limit = self.max_iterations, "Work queue ceiling reached");
                return Err(TraceryError::WorkQueueExhausted {
                    row: label.to_string(),
                    limit: self.max_iterations,
                });
            }
            let step = item.step;
            let next = self.advance(item).await?;
            for n in &next {
                if let Next::Done(result) = n {
                    self.coalesce.branch_ended(&result.token, step);
                }
            }
            dispatch(next, &mut queue, &mut results);
            let released = self.check_timeouts()?;
            dispatch(released, &mut queue, &mut results);
        }
        Ok(results)
    }

    async fn advance(&mut self, item: WorkItem) -> Result<Vec<Next>> {
        let Some(step) = self.steps.get(item.step) else {
            return Ok(vec![Next::Done(RowResult::new(
                item.token,
                RowOutcome::Completed {
                    sink: self.default_sink.clone(),
                },
            ))]);
        };
        match step.node_type() {
            NodeType::Transform => self.run_transform(item).await,
            NodeType::Gate => self.run_gate(item),
            NodeType::Aggregation => self.run_aggregation(item),
            NodeType::Coalesce => self.run_coalesce(item),
            other => Err(TraceryError::InvariantViolation(format!(
                "a {other} cannot be a pipeline step"
            ))),
        }
    }

    // -- transforms ---------------------------------------------------------

    async fn run_transform(&self, item: WorkItem) -> Result<Vec<Next>> {
        let step = &self.steps[item.step];
        let StepKind::Transform { settings, plugin } = &step.kind else {
            return Err(step_mismatch(step, NodeType::Transform));
        };
        let token = item.token;
        let next_step = item.step + 1;
        if !settings.applies_to(token.branch()) {
            return Ok(vec![Next::Push(WorkItem {
                token,
                step: next_step,
            })]);
        }

        let input_hash = stable_hash(&token.row_data)?;
        let mut attempt = 1;
        loop {
            let state = self.ledger.begin_node_state(
                &token.token_id,
                &step.node_id,
                next_step,
                attempt,
                &input_hash,
            )?;
            match plugin.process(token.row_data.clone()).await {
                Ok(TransformResult::Success { row, metadata }) => {
                    let output_hash = stable_hash(&row)?;
                    let completion = match metadata {
                        Some(meta) => NodeStateCompletion::completed_with(output_hash, meta),
                        None => NodeStateCompletion::completed(output_hash),
                    };
                    self.ledger.complete_node_state(&state.state_id, completion)?;
                    tracing::debug!(node = %step.node_id, token = %token.token_id, attempt, "Transform completed");
                    return Ok(vec![Next::Push(WorkItem {
                        token: token.with_data(row),
                        step: next_step,
                    })]);
                }
                Ok(TransformResult::Error { reason }) => {
                    return self.divert(step, &settings.on_error, token, &state.state_id, reason);
                }
                Err(error) => {
                    if let Some(delay) = settings.retry.next_delay(attempt, &error) {
                        let detail = FailureDetail::new("transient", error.to_string()).with_detail(json!({
                            "attempt": attempt,
                            "max_attempts": settings.retry.max_attempts,
                            "backoff": settings.retry.backoff,
                            "delay_ms": delay.as_millis() as u64,
                        }));
                        self.ledger
                            .complete_node_state(&state.state_id, NodeStateCompletion::failed(detail))?;
                        tracing::warn!(
                            node = %step.node_id,
                            token = %token.token_id,
                            attempt,
                            delay_ms = %delay.as_millis(),
                            "Transient transform failure, retrying"
                        );
                        self.emitter.emit(RunEvent::TokenRetrying {
                            node: step.name().to_string(),
                            token_id: token.token_id.clone(),
                            attempt: attempt + 1,
                            delay_ms: delay.as_millis() as u64,
                        });
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    if error.is_retryable() {
                        let detail = FailureDetail::new("retries_exhausted", error.to_string())
                            .with_detail(json!({
                                "attempts": attempt,
                                "backoff": settings.retry.backoff,
                            }));
                        let reason = failure_reason(&detail);
                        self.ledger
                            .complete_node_state(&state.state_id, NodeStateCompletion::failed(detail))?;
                        tracing::warn!(node = %step.node_id, token = %token.token_id, attempts = attempt, "Retries exhausted");
                        return Ok(vec![Next::Done(RowResult::new(
                            token,
                            RowOutcome::Failed { reason },
                        ))]);
                    }
                    let detail = FailureDetail::new(error_kind(&error), error.to_string());
                    self.ledger
                        .complete_node_state(&state.state_id, NodeStateCompletion::failed(detail))?;
                    tracing::error!(node = %step.node_id, token = %token.token_id, error = %error, "Transform raised an undeclared error");
                    return Err(error);
                }
            }
        }
    }

    /// Apply a transform's error disposition to a declared error.
    fn divert(
        &self,
        step: &Step,
        disposition: &ErrorDisposition,
        token: Token,
        state_id: &StateId,
        reason: Value,
    ) -> Result<Vec<Next>> {
        match disposition {
            ErrorDisposition::Quarantine => {
                let detail = FailureDetail::new(
                    QUARANTINED,
                    format!("transform '{}' declared an error", step.name()),
                )
                .with_detail(reason.clone());
                self.ledger
                    .complete_node_state(state_id, NodeStateCompletion::failed(detail))?;
                tracing::warn!(node = %step.node_id, token = %token.token_id, "Row quarantined");
                Ok(vec![Next::Done(RowResult::new(
                    token,
                    RowOutcome::Quarantined { reason },
                ))])
            }
            ErrorDisposition::Sink { sink } => {
                let detail = FailureDetail::new(
                    "declared_error",
                    format!("transform '{}' declared an error", step.name()),
                )
                .with_detail(reason.clone());
                self.ledger
                    .complete_node_state(state_id, NodeStateCompletion::failed(detail))?;
                let edge = self.ledger.edge_for(&self.run_id, &step.node_id, ON_ERROR)?;
                self.ledger.record_routing_events(vec![NewRoutingEvent {
                    state_id: state_id.clone(),
                    edge_id: edge.map(|e| e.edge_id),
                    routing_group_id: GroupId::generate(),
                    ordinal: 0,
                    mode: RoutingMode::Move,
                    condition: None,
                    label: ON_ERROR.to_string(),
                    destination: sink.clone(),
                    reason,
                }])?;
                tracing::info!(node = %step.node_id, token = %token.token_id, sink = %sink, "Row diverted to error sink");
                Ok(vec![Next::Done(RowResult::new(
                    token,
                    RowOutcome::Routed { sink: sink.clone() },
                ))])
            }
        }
    }

    // -- gates --------------------------------------------------------------

    fn run_gate(&self, item: WorkItem) -> Result<Vec<Next>> {
        let step = &self.steps[item.step];
        let StepKind::Gate(gate) = &step.kind else {
            return Err(step_mismatch(step, NodeType::Gate));
        };
        let token = item.token;
        let next_step = item.step + 1;
        let input_hash = stable_hash(&token.row_data)?;
        let state =
            self.ledger
                .begin_node_state(&token.token_id, &step.node_id, next_step, 1, &input_hash)?;

        let decision = match gate.decide(&token.row_data) {
            Ok(decision) => decision,
            Err(error) => {
                let detail = FailureDetail::new(error_kind(&error), error.to_string());
                self.ledger
                    .complete_node_state(&state.state_id, NodeStateCompletion::failed(detail))?;
                tracing::error!(node = %step.node_id, token = %token.token_id, error = %error, "Gate evaluation failed");
                return Err(error);
            }
        };
        self.ledger.complete_node_state(
            &state.state_id,
            NodeStateCompletion::completed_with(&input_hash, json!({"label": decision.label})),
        )?;

        let route = |edge_label: &str, ordinal: usize, mode: RoutingMode, destination: &str, group: &GroupId| -> Result<NewRoutingEvent> {
            let edge = self.ledger.edge_for(&self.run_id, &step.node_id, edge_label)?;
            Ok(gate_event(&state.state_id, edge.map(|e| e.edge_id), group, ordinal, mode, &decision, destination))
        };
        let group = GroupId::generate();

        match &decision.target {
            RouteTarget::Continue => {
                self.ledger.record_routing_events(vec![route(
                    &decision.label,
                    0,
                    RoutingMode::Move,
                    CONTINUE,
                    &group,
                )?])?;
                Ok(vec![Next::Push(WorkItem {
                    token,
                    step: next_step,
                })])
            }
            RouteTarget::Sink { sink } => {
                self.ledger.record_routing_events(vec![route(
                    &decision.label,
                    0,
                    RoutingMode::Move,
                    sink,
                    &group,
                )?])?;
                tracing::debug!(node = %step.node_id, token = %token.token_id, sink = %sink, "Row routed to sink");
                Ok(vec![Next::Done(RowResult::new(
                    token,
                    RowOutcome::Routed { sink: sink.clone() },
                ))])
            }
            RouteTarget::Fork { branches } => {
                let (_, children) = self.tokens.fork(&token, branches)?;
                let events = branches
                    .iter()
                    .enumerate()
                    .map(|(ordinal, branch)| {
                        route(
                            &fork_edge_label(&decision.label, branch),
                            ordinal,
                            RoutingMode::Copy,
                            branch,
                            &group,
                        )
                    })
                    .collect::<Result<Vec<_>>>()?;
                self.ledger.record_routing_events(events)?;
                tracing::debug!(node = %step.node_id, token = %token.token_id, branches = children.len(), "Token forked");
                Ok(children
                    .into_iter()
                    .map(|child| {
                        Next::Push(WorkItem {
                            token: child,
                            step: next_step,
                        })
                    })
                    .collect())
            }
        }
    }

    // -- aggregations -------------------------------------------------------

    fn run_aggregation(&mut self, item: WorkItem) -> Result<Vec<Next>> {
        let now = self.clock.now();
        let index = item.step;
        let step = &mut self.steps[index];
        let node_id = step.node_id.clone();
        let StepKind::Aggregation { settings, plugin } = &mut step.kind else {
            return Err(step_mismatch(step, NodeType::Aggregation));
        };
        let passthrough = settings.output_mode == OutputMode::Passthrough;
        let token = item.token;
        let input_hash = stable_hash(&token.row_data)?;
        let state = self
            .ledger
            .begin_node_state(&token.token_id, &node_id, index + 1, 1, &input_hash)?;

        let accepted = match plugin.accept(&token.row_data) {
            Ok(accepted) => accepted,
            Err(error) => {
                let detail = FailureDetail::new(error_kind(&error), error.to_string());
                self.ledger
                    .complete_node_state(&state.state_id, NodeStateCompletion::failed(detail))?;
                return Err(error);
            }
        };
        if !accepted {
            self.ledger.complete_node_state(
                &state.state_id,
                NodeStateCompletion::completed_with(&input_hash, json!({"accepted": false})),
            )?;
            return Ok(vec![Next::Push(WorkItem {
                token,
                step: index + 1,
            })]);
        }

        let open = self.batches.get_mut(&node_id).ok_or_else(|| {
            TraceryError::InvariantViolation(format!("no batch state for aggregation '{node_id}'"))
        })?;
        let batch_id = match &open.batch_id {
            Some(id) => id.clone(),
            None => {
                let batch = self.ledger.create_batch(&self.run_id, &node_id)?;
                open.batch_id = Some(batch.batch_id.clone());
                batch.batch_id
            }
        };
        let member = self.ledger.add_batch_member(&batch_id, &token.token_id)?;
        self.ledger.complete_node_state(
            &state.state_id,
            NodeStateCompletion::completed_with(
                &input_hash,
                json!({"accepted": true, "batch_id": batch_id, "ordinal": member.ordinal}),
            ),
        )?;
        open.trigger.record_accept(now);
        open.members.push(token.clone());

        let mut next = Vec::new();
        if !passthrough {
            next.push(Next::Done(RowResult::new(
                token,
                RowOutcome::ConsumedInBatch { batch_id },
            )));
        }
        if open.trigger.should_trigger(now)? {
            let trigger = fired_trigger(&node_id, &open.trigger)?;
            next.extend(self.flush_batch(index, trigger, now)?);
        }
        Ok(next)
    }

    /// Flush the open batch of the aggregation at `index`, if there is one.
    fn flush_batch(
        &mut self,
        index: usize,
        trigger: TriggerType,
        now: Duration,
    ) -> Result<Vec<Next>> {
        let step = &mut self.steps[index];
        let node_name = step.name().to_string();
        let Some(open) = self.batches.get_mut(&step.node_id) else {
            return Ok(Vec::new());
        };
        let Some(batch_id) = open.batch_id.take() else {
            return Ok(Vec::new());
        };
        let members = std::mem::take(&mut open.members);
        let reason = open.trigger.describe(trigger, now);
        open.trigger.reset();

        let StepKind::Aggregation { settings, plugin } = &mut step.kind else {
            return Err(step_mismatch(step, NodeType::Aggregation));
        };
        self.ledger.start_batch_flush(&batch_id, trigger, reason)?;
        let rows = match plugin.flush() {
            Ok(rows) => rows,
            Err(error) => {
                self.ledger.close_batch(&batch_id, BatchStatus::Failed)?;
                tracing::error!(node = %node_name, batch_id = %batch_id, error = %error, "Batch flush failed");
                return Err(error);
            }
        };
        let anchor = members.last().map(|t| t.row_id.clone()).ok_or_else(|| {
            TraceryError::InvariantViolation(format!("batch '{batch_id}' flushed with no members"))
        })?;

        let next_step = index + 1;
        let mut next = Vec::new();
        match settings.output_mode {
            OutputMode::Single => {
                if rows.len() != 1 {
                    self.ledger.close_batch(&batch_id, BatchStatus::Failed)?;
                    return Err(TraceryError::PluginError {
                        plugin: plugin.name().to_string(),
                        node: node_name,
                        message: format!(
                            "single output mode expects exactly one flushed row, got {}",
                            rows.len()
                        ),
                    });
                }
                for row in rows {
                    let token = self.tokens.aggregate(&members, &anchor, row)?;
                    next.push(Next::Push(WorkItem {
                        token,
                        step: next_step,
                    }));
                }
            }
            OutputMode::Transform => {
                for row in rows {
                    let token = self.tokens.aggregate(&members, &anchor, row)?;
                    next.push(Next::Push(WorkItem {
                        token,
                        step: next_step,
                    }));
                }
            }
            OutputMode::Passthrough => {
                next.extend(members.iter().cloned().map(|token| {
                    Next::Push(WorkItem {
                        token,
                        step: next_step,
                    })
                }));
            }
        }
        self.ledger.close_batch(&batch_id, BatchStatus::Completed)?;

        tracing::info!(node = %node_name, batch_id = %batch_id, trigger = %trigger, members = members.len(), "Batch flushed");
        self.emitter.emit(RunEvent::BatchFlushed {
            node: node_name,
            batch_id,
            trigger,
            members: members.len(),
        });
        Ok(next)
    }

    // -- coalesce -----------------------------------------------------------

    fn run_coalesce(&mut self, item: WorkItem) -> Result<Vec<Next>> {
        let step = &self.steps[item.step];
        let StepKind::Coalesce(settings) = &step.kind else {
            return Err(step_mismatch(step, NodeType::Coalesce));
        };
        if item.token.branch().is_none() {
            // Never forked (or already merged): nothing to wait for.
            return Ok(vec![Next::Push(WorkItem {
                token: item.token,
                step: item.step + 1,
            })]);
        }
        let name = settings.name.clone();
        let input_hash = stable_hash(&item.token.row_data)?;
        let state = self.ledger.begin_node_state(
            &item.token.token_id,
            &step.node_id,
            item.step + 1,
            1,
            input_hash,
        )?;
        let outcome = self
            .coalesce
            .accept(&name, item.token, state.state_id, self.clock.now())?;
        self.resolve_coalesce(outcome)
    }

    /// Record a barrier decision in the ledger.
    fn resolve_coalesce(&self, outcome: CoalesceOutcome) -> Result<Vec<Next>> {
        let mut next = Vec::new();
        match outcome {
            CoalesceOutcome::Held => {}
            CoalesceOutcome::Released(release) => {
                let parents: Vec<&Token> = release.consumed.iter().map(|a| &a.token).collect();
                let merged = self.tokens.coalesce(&parents, release.merged.clone())?;
                let output_hash = stable_hash(&merged.row_data)?;
                let mut metadata = release.metadata.clone();
                metadata["merged_into"] = json!(merged.token_id);
                for arrival in &release.consumed {
                    self.ledger.complete_node_state(
                        &arrival.state_id,
                        NodeStateCompletion::completed_with(&output_hash, metadata.clone()),
                    )?;
                    next.push(Next::Done(RowResult::new(
                        arrival.token.clone(),
                        RowOutcome::Coalesced {
                            merged_into: merged.token_id.clone(),
                        },
                    )));
                }
                tracing::info!(
                    coalesce = %release.coalesce,
                    row_id = %release.row_id,
                    merged_into = %merged.token_id,
                    branches = ?release.branches(),
                    "Coalesce released"
                );
                self.emitter.emit(RunEvent::CoalesceReleased {
                    coalesce: release.coalesce.clone(),
                    row_id: release.row_id.clone(),
                    merged_into: merged.token_id.clone(),
                    branches: release.branches(),
                });
                next.push(Next::Push(WorkItem {
                    token: merged,
                    step: release.step + 1,
                }));
            }
            CoalesceOutcome::Failed(failure) => {
                let reason = failure_reason(&failure.error);
                for arrival in failure.held {
                    self.ledger.complete_node_state(
                        &arrival.state_id,
                        NodeStateCompletion::failed(failure.error.clone()),
                    )?;
                    next.push(Next::Done(RowResult::new(
                        arrival.token,
                        RowOutcome::Failed {
                            reason: reason.clone(),
                        },
                    )));
                }
                tracing::warn!(
                    coalesce = %failure.coalesce,
                    row_id = %failure.row_id,
                    kind = %failure.error.kind,
                    "Coalesce failed"
                );
                self.emitter.emit(RunEvent::CoalesceFailed {
                    coalesce: failure.coalesce,
                    row_id: failure.row_id,
                    reason: failure.error.message,
                });
            }
            CoalesceOutcome::Rejected { arrival, error } => {
                let reason = failure_reason(&error);
                tracing::warn!(token = %arrival.token.token_id, kind = %error.kind, "Coalesce rejected token");
                self.ledger
                    .complete_node_state(&arrival.state_id, NodeStateCompletion::failed(error))?;
                next.push(Next::Done(RowResult::new(
                    arrival.token,
                    RowOutcome::Failed { reason },
                )));
            }
        }
        Ok(next)
    }

    // -- timeouts -----------------------------------------------------------

    /// Release coalesce merges and flush batches whose time has come.
    fn check_timeouts(&mut self) -> Result<Vec<Next>> {
        let now = self.clock.now();
        let mut next = Vec::new();
        for outcome in self.coalesce.check_timeouts(now) {
            next.extend(self.resolve_coalesce(outcome)?);
        }

        let mut due = Vec::new();
        for (index, step) in self.steps.iter().enumerate() {
            let Some(open) = self.batches.get_mut(&step.node_id) else {
                continue;
            };
            if open.batch_id.is_some() && open.trigger.should_trigger(now)? {
                due.push((index, fired_trigger(&step.node_id, &open.trigger)?));
            }
        }
        for (index, trigger) in due {
            next.extend(self.flush_batch(index, trigger, now)?);
        }
        Ok(next)
    }
}

fn gate_event(
    state_id: &StateId,
    edge_id: Option<EdgeId>,
    group: &GroupId,
    ordinal: usize,
    mode: RoutingMode,
    decision: &GateDecision,
    destination: &str,
) -> NewRoutingEvent {
    NewRoutingEvent {
        state_id: state_id.clone(),
        edge_id,
        routing_group_id: group.clone(),
        ordinal,
        mode,
        condition: decision.condition.clone(),
        label: decision.label.clone(),
        destination: destination.to_string(),
        reason: json!({"label": decision.label}),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::{CollectAggregation, FnTransform, MemorySink, VecSource};
    use tracery_types::ManualClock;
    use crate::config::{
        AggregationSettings, CoalescePolicy, CoalesceSettings, GateSettings, MergeStrategy,
        TransformSettings, TriggerConfig,
    };
    use crate::graph::{Pipeline, PipelineBuilder};
    use crate::plugin::{Aggregation, Plugin};
    use serde_json::json;
    use tracery_audit::TokenFate;

    fn row(value: Value) -> RowData {
        value.as_object().cloned().unwrap_or_default()
    }

    fn builder(settings: RunSettings) -> PipelineBuilder {
        Pipeline::builder(settings, VecSource::new("rows", []))
    }

    fn start(pipeline: Pipeline, clock: Arc<ManualClock>) -> (RowProcessor, Arc<Ledger>, RunId) {
        let ledger = Arc::new(Ledger::with_clock(clock.clone()));
        let run = ledger.begin_run(json!({})).unwrap();
        pipeline.register(&ledger, &run.run_id).unwrap();
        let processor = RowProcessor::new(
            ledger.clone(),
            run.run_id.clone(),
            pipeline.source_node.clone(),
            pipeline.steps,
            &pipeline.settings,
            clock,
            EventEmitter::default(),
        )
        .unwrap();
        (processor, ledger, run.run_id)
    }

    fn fork_gate(branches: &[&str]) -> GateSettings {
        GateSettings::new("split").condition("true").route(
            "true",
            RouteTarget::Fork {
                branches: branches.iter().map(|b| b.to_string()).collect(),
            },
        )
    }

    struct Sum {
        total: i64,
    }

    impl Plugin for Sum {
        fn name(&self) -> &str {
            "sum"
        }
    }

    impl Aggregation for Sum {
        fn accept(&mut self, row: &RowData) -> Result<bool> {
            self.total += row["v"].as_i64().unwrap_or_default();
            Ok(true)
        }

        fn flush(&mut self) -> Result<Vec<RowData>> {
            let total = std::mem::take(&mut self.total);
            Ok(vec![row(json!({"total": total}))])
        }
    }

    #[tokio::test]
    async fn linear_row_completes_at_default_sink() {
        let pipeline = builder(RunSettings::new("out"))
            .transform(
                TransformSettings::new("double"),
                FnTransform::new("double", |mut r: RowData| {
                    let v = r["v"].as_i64().unwrap_or_default();
                    r.insert("v".into(), json!(v * 2));
                    Ok(TransformResult::success(r))
                }),
            )
            .sink("out", MemorySink::new("out"))
            .build()
            .unwrap();
        let (mut processor, ledger, run_id) = start(pipeline, Arc::new(ManualClock::new()));

        let results = processor.process_row(0, row(json!({"v": 4}))).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].token.row_data["v"], json!(8));
        assert_eq!(results[0].outcome.sink(), Some("out"));

        let states = ledger.node_states_for_token(&results[0].token.token_id).unwrap();
        let steps: Vec<_> = states.iter().map(|s| s.step_index()).collect();
        assert_eq!(steps, vec![0, 1]);
        assert!(ledger.open_node_states(&run_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn fork_and_coalesce_emit_children_then_merge() {
        let pipeline = builder(RunSettings::new("out"))
            .gate(fork_gate(&["a", "b"]))
            .coalesce(
                CoalesceSettings::new("join", ["a", "b"]).merge(MergeStrategy::Nested),
            )
            .sink("out", MemorySink::new("out"))
            .build()
            .unwrap();
        let (mut processor, ledger, _) = start(pipeline, Arc::new(ManualClock::new()));

        let results = processor.process_row(0, row(json!({"v": 1}))).await.unwrap();
        let kinds: Vec<_> = results.iter().map(|r| r.outcome.kind()).collect();
        assert_eq!(kinds, vec!["coalesced", "coalesced", "completed"]);

        let merged = &results[2].token;
        assert_eq!(merged.row_data["a"], json!({"v": 1}));
        assert_eq!(merged.row_data["b"], json!({"v": 1}));
        assert_eq!(ledger.parents(&merged.token_id).unwrap().len(), 2);
        for child in &results[..2] {
            assert_eq!(
                child.outcome,
                RowOutcome::Coalesced {
                    merged_into: merged.token_id.clone()
                }
            );
        }
        assert_eq!(processor.pending_merges(), 0);
    }

    #[tokio::test]
    async fn count_trigger_consumes_members_and_emits_aggregate() {
        let pipeline = builder(RunSettings::new("out"))
            .aggregation(
                AggregationSettings::new("totals", TriggerConfig::count(2)),
                Sum { total: 0 },
            )
            .sink("out", MemorySink::new("out"))
            .build()
            .unwrap();
        let (mut processor, ledger, run_id) = start(pipeline, Arc::new(ManualClock::new()));

        let first = processor.process_row(0, row(json!({"v": 10}))).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].outcome.kind(), "consumed_in_batch");

        let second = processor.process_row(1, row(json!({"v": 20}))).await.unwrap();
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].outcome.kind(), "consumed_in_batch");
        assert_eq!(second[1].token.row_data["total"], json!(30));
        assert_eq!(second[1].outcome.sink(), Some("out"));

        let batches = ledger.batches(&run_id).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].status, BatchStatus::Completed);
        assert_eq!(batches[0].trigger_type, Some(TriggerType::Count));
    }

    #[tokio::test]
    async fn end_of_source_flushes_partial_batch() {
        let pipeline = builder(RunSettings::new("out"))
            .aggregation(
                AggregationSettings::new("all", TriggerConfig::count(10))
                    .output_mode(OutputMode::Passthrough),
                CollectAggregation::new("collect"),
            )
            .sink("out", MemorySink::new("out"))
            .build()
            .unwrap();
        let (mut processor, ledger, run_id) = start(pipeline, Arc::new(ManualClock::new()));

        assert!(processor.process_row(0, row(json!({"v": 1}))).await.unwrap().is_empty());
        assert!(processor.process_row(1, row(json!({"v": 2}))).await.unwrap().is_empty());
        let flushed = processor.finish().await.unwrap();
        let values: Vec<_> = flushed.iter().map(|r| r.token.row_data["v"].clone()).collect();
        assert_eq!(values, vec![json!(1), json!(2)]);

        let batches = ledger.batches(&run_id).unwrap();
        assert_eq!(batches[0].trigger_type, Some(TriggerType::EndOfSource));
    }

    #[tokio::test]
    async fn declared_error_is_quarantined() {
        let pipeline = builder(RunSettings::new("out"))
            .transform(
                TransformSettings::new("check"),
                FnTransform::new("check", |_| Ok(TransformResult::error(json!({"why": "bad"})))),
            )
            .sink("out", MemorySink::new("out"))
            .build()
            .unwrap();
        let (mut processor, ledger, _) = start(pipeline, Arc::new(ManualClock::new()));

        let results = processor.process_row(0, row(json!({"v": 1}))).await.unwrap();
        assert_eq!(
            results[0].outcome,
            RowOutcome::Quarantined {
                reason: json!({"why": "bad"})
            }
        );
        assert!(matches!(
            ledger.token_fate(&results[0].token.token_id).unwrap(),
            TokenFate::Quarantined { .. }
        ));
    }

    #[tokio::test]
    async fn queue_ceiling_aborts_row() {
        let pipeline = builder(RunSettings::new("out").with_max_queue_iterations(3))
            .gate(fork_gate(&["a", "b", "c", "d", "e"]))
            .sink("out", MemorySink::new("out"))
            .build()
            .unwrap();
        let (mut processor, _, _) = start(pipeline, Arc::new(ManualClock::new()));

        let err = processor.process_row(0, row(json!({}))).await.unwrap_err();
        assert!(matches!(err, TraceryError::WorkQueueExhausted { limit: 3, .. }));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn coalesce_timeout_fires_on_later_row() {
        let clock = Arc::new(ManualClock::new());
        let pipeline = builder(RunSettings::new("out"))
            .gate(fork_gate(&["a", "b"]))
            .transform(
                TransformSettings::new("drop_b").only_branches(["b"]),
                FnTransform::new("drop_b", |_| Ok(TransformResult::error(json!("skip")))),
            )
            .coalesce(
                CoalesceSettings::new("join", ["a", "b"])
                    .policy(CoalescePolicy::BestEffort)
                    .timeout(Duration::from_millis(100)),
            )
            .sink("out", MemorySink::new("out"))
            .build()
            .unwrap();
        let (mut processor, _, _) = start(pipeline, clock.clone());

        let first = processor.process_row(0, row(json!({"v": 1}))).await.unwrap();
        let kinds: Vec<_> = first.iter().map(|r| r.outcome.kind()).collect();
        assert_eq!(kinds, vec!["quarantined"]);
        assert_eq!(processor.pending_merges(), 1);

        clock.advance(Duration::from_millis(150));
        let second = processor.process_row(1, row(json!({"v": 2}))).await.unwrap();
        assert_eq!(processor.pending_merges(), 1);
        let released: Vec<_> = second
            .iter()
            .filter(|r| r.outcome.kind() == "completed")
            .collect();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].token.row_data["v"], json!(1));
        // row 0 is fully settled; only row 1's merge is still tracked
        assert_eq!(processor.coalesce.tracked_count(), 1);
    }

    #[tokio::test]
    async fn expired_quorum_at_end_of_source_is_a_timeout() {
        let clock = Arc::new(ManualClock::new());
        let pipeline = builder(RunSettings::new("out"))
            .gate(fork_gate(&["a", "b", "c"]))
            .transform(
                TransformSettings::new("drop").only_branches(["b", "c"]),
                FnTransform::new("drop", |_| Ok(TransformResult::error(json!("skip")))),
            )
            .coalesce(
                CoalesceSettings::new("join", ["a", "b", "c"])
                    .policy(CoalescePolicy::Quorum { count: 2 })
                    .timeout(Duration::from_millis(100)),
            )
            .sink("out", MemorySink::new("out"))
            .build()
            .unwrap();
        let (mut processor, ledger, run_id) = start(pipeline, clock.clone());

        processor.process_row(0, row(json!({"v": 1}))).await.unwrap();
        assert_eq!(processor.pending_merges(), 1);

        clock.advance(Duration::from_millis(150));
        let flushed = processor.finish().await.unwrap();
        assert_eq!(flushed.len(), 1);
        match &flushed[0].outcome {
            RowOutcome::Failed { reason } => assert_eq!(reason["kind"], json!("coalesce_timeout")),
            other => panic!("expected a timeout failure, got {other:?}"),
        }
        assert_eq!(processor.pending_merges(), 0);
        assert_eq!(processor.coalesce.tracked_count(), 0);
        assert!(ledger.open_node_states(&run_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn unforked_tokens_pass_through_coalesce() {
        let pipeline = builder(RunSettings::new("out"))
            .gate(
                GateSettings::new("maybe_split")
                    .condition("row['split']")
                    .route(
                        "true",
                        RouteTarget::Fork {
                            branches: vec!["a".into(), "b".into()],
                        },
                    )
                    .route("false", RouteTarget::Continue),
            )
            .coalesce(CoalesceSettings::new("join", ["a", "b"]))
            .sink("out", MemorySink::new("out"))
            .build()
            .unwrap();
        let (mut processor, ledger, _) = start(pipeline, Arc::new(ManualClock::new()));

        let results = processor
            .process_row(0, row(json!({"split": false, "v": 1})))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome.sink(), Some("out"));
        assert_eq!(results[0].token.row_data["v"], json!(1));
        let steps: Vec<_> = ledger
            .node_states_for_token(&results[0].token.token_id)
            .unwrap()
            .iter()
            .map(|s| s.step_index())
            .collect();
        assert_eq!(steps, vec![0, 1]);

        let forked = processor
            .process_row(1, row(json!({"split": true, "v": 2})))
            .await
            .unwrap();
        let kinds: Vec<_> = forked.iter().map(|r| r.outcome.kind()).collect();
        assert_eq!(kinds, vec!["coalesced", "coalesced", "completed"]);
        assert_eq!(processor.coalesce.tracked_count(), 0);
    }

    #[test]
    fn firing_without_a_named_trigger_is_an_invariant_violation() {
        let evaluator = TriggerEvaluator::new("totals", &TriggerConfig::count(1)).unwrap();
        let err = fired_trigger(&NodeId::from("aggregation:totals"), &evaluator).unwrap_err();
        assert!(matches!(err, TraceryError::InvariantViolation(_)));
    }

    #[tokio::test]
    async fn missing_field_in_gate_propagates_and_closes_state() {
        let pipeline = builder(RunSettings::new("out"))
            .gate(
                GateSettings::new("check")
                    .condition("row['score'] > 1")
                    .route("true", RouteTarget::Continue)
                    .route("false", RouteTarget::Continue),
            )
            .sink("out", MemorySink::new("out"))
            .build()
            .unwrap();
        let (mut processor, ledger, run_id) = start(pipeline, Arc::new(ManualClock::new()));

        let err = processor.process_row(0, row(json!({}))).await.unwrap_err();
        assert!(matches!(err, TraceryError::MissingField { .. }));
        assert!(ledger.open_node_states(&run_id).unwrap().is_empty());
    }
}
