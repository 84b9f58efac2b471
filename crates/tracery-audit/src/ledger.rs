//! The append-only audit ledger.
//!
//! Every write validates its preconditions before touching any table, so a
//! rejected write leaves no partial record behind. Token creation and its
//! lineage links are always written together under one lock acquisition.
//! Writes are serialized; reads may proceed concurrently.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, TimeDelta, Utc};

use tracery_types::{
    not_found, stable_hash, ArtifactId, BatchId, BatchStatus, Clock, GroupId, NodeId, NodeState,
    NodeStateCompletion, NodeType, OpenNodeState, Result, RoutingEventId, RowData, RowId, RunId,
    RunStatus, StateId, SystemClock, TokenId, TraceryError, TriggerType,
};

use crate::records::{
    ArtifactRecord, BatchMemberRecord, BatchRecord, EdgeRecord, NewArtifact, NewRoutingEvent,
    NodeRecord, NodeRegistration, RoutingEventRecord, RowRecord, RunRecord, TokenParentRecord,
    TokenRecord,
};

/// Backing tables plus the lookup indexes derived from them.
#[derive(Debug, Default)]
pub(crate) struct Tables {
    pub runs: Vec<RunRecord>,
    pub nodes: Vec<NodeRecord>,
    pub edges: Vec<EdgeRecord>,
    pub rows: Vec<RowRecord>,
    pub tokens: Vec<TokenRecord>,
    pub token_parents: Vec<TokenParentRecord>,
    pub node_states: Vec<NodeState>,
    pub batches: Vec<BatchRecord>,
    pub batch_members: Vec<BatchMemberRecord>,
    pub artifacts: Vec<ArtifactRecord>,
    pub routing_events: Vec<RoutingEventRecord>,

    run_idx: HashMap<RunId, usize>,
    node_idx: HashMap<(RunId, NodeId), usize>,
    row_idx: HashMap<RowId, usize>,
    token_idx: HashMap<TokenId, usize>,
    state_idx: HashMap<StateId, usize>,
    batch_idx: HashMap<BatchId, usize>,
}

impl Tables {
    pub(crate) fn push_run(&mut self, record: RunRecord) {
        self.run_idx.insert(record.run_id.clone(), self.runs.len());
        self.runs.push(record);
    }

    pub(crate) fn push_node(&mut self, record: NodeRecord) {
        self.node_idx.insert(
            (record.run_id.clone(), record.node_id.clone()),
            self.nodes.len(),
        );
        self.nodes.push(record);
    }

    pub(crate) fn push_row(&mut self, record: RowRecord) {
        self.row_idx.insert(record.row_id.clone(), self.rows.len());
        self.rows.push(record);
    }

    pub(crate) fn push_token(&mut self, record: TokenRecord) {
        self.token_idx.insert(record.token_id.clone(), self.tokens.len());
        self.tokens.push(record);
    }

    pub(crate) fn push_state(&mut self, state: NodeState) {
        self.state_idx
            .insert(state.state_id().clone(), self.node_states.len());
        self.node_states.push(state);
    }

    pub(crate) fn push_batch(&mut self, record: BatchRecord) {
        self.batch_idx.insert(record.batch_id.clone(), self.batches.len());
        self.batches.push(record);
    }

    pub(crate) fn run(&self, run_id: &RunId) -> Result<&RunRecord> {
        self.run_idx
            .get(run_id)
            .map(|&i| &self.runs[i])
            .ok_or_else(|| not_found("run", run_id))
    }

    fn ensure_open(&self, run_id: &RunId) -> Result<()> {
        let run = self.run(run_id)?;
        if run.status.is_closed() {
            return Err(TraceryError::InvariantViolation(format!(
                "run '{run_id}' is already closed"
            )));
        }
        Ok(())
    }

    pub(crate) fn node(&self, run_id: &RunId, node_id: &NodeId) -> Result<&NodeRecord> {
        self.node_idx
            .get(&(run_id.clone(), node_id.clone()))
            .map(|&i| &self.nodes[i])
            .ok_or_else(|| not_found("node", node_id))
    }

    pub(crate) fn row(&self, row_id: &RowId) -> Result<&RowRecord> {
        self.row_idx
            .get(row_id)
            .map(|&i| &self.rows[i])
            .ok_or_else(|| not_found("row", row_id))
    }

    pub(crate) fn token(&self, token_id: &TokenId) -> Result<&TokenRecord> {
        self.token_idx
            .get(token_id)
            .map(|&i| &self.tokens[i])
            .ok_or_else(|| not_found("token", token_id))
    }

    pub(crate) fn token_run(&self, token_id: &TokenId) -> Result<&RunId> {
        let token = self.token(token_id)?;
        Ok(&self.row(&token.row_id)?.run_id)
    }

    pub(crate) fn state(&self, state_id: &StateId) -> Result<&NodeState> {
        self.state_idx
            .get(state_id)
            .map(|&i| &self.node_states[i])
            .ok_or_else(|| not_found("node state", state_id))
    }

    pub(crate) fn batch(&self, batch_id: &BatchId) -> Result<&BatchRecord> {
        self.batch_idx
            .get(batch_id)
            .map(|&i| &self.batches[i])
            .ok_or_else(|| not_found("batch", batch_id))
    }

    pub(crate) fn parents_of(&self, token_id: &TokenId) -> Vec<TokenId> {
        let mut links: Vec<&TokenParentRecord> = self
            .token_parents
            .iter()
            .filter(|l| &l.token_id == token_id)
            .collect();
        links.sort_by_key(|l| l.ordinal);
        links.into_iter().map(|l| l.parent_token_id.clone()).collect()
    }

    pub(crate) fn children_of(&self, token_id: &TokenId) -> Vec<&TokenRecord> {
        self.token_parents
            .iter()
            .filter(|l| &l.parent_token_id == token_id)
            .filter_map(|l| self.token(&l.token_id).ok())
            .collect()
    }

    pub(crate) fn states_for_token(&self, token_id: &TokenId) -> Vec<&NodeState> {
        self.node_states
            .iter()
            .filter(|s| s.token_id() == token_id)
            .collect()
    }

    pub(crate) fn memberships_of(&self, token_id: &TokenId) -> Vec<&BatchMemberRecord> {
        self.batch_members
            .iter()
            .filter(|m| &m.token_id == token_id)
            .collect()
    }

    fn new_token(
        &mut self,
        created_at: DateTime<Utc>,
        row_id: RowId,
        parents: &[TokenId],
        fork_group_id: Option<GroupId>,
        join_group_id: Option<GroupId>,
        branch_name: Option<String>,
    ) -> TokenRecord {
        let record = TokenRecord {
            token_id: TokenId::generate(),
            row_id,
            fork_group_id,
            join_group_id,
            branch_name,
            created_at,
        };
        for (ordinal, parent) in parents.iter().enumerate() {
            self.token_parents.push(TokenParentRecord {
                token_id: record.token_id.clone(),
                parent_token_id: parent.clone(),
                ordinal,
            });
        }
        self.push_token(record.clone());
        record
    }

    fn check_distinct_parents(&self, parents: &[TokenId]) -> Result<()> {
        if parents.is_empty() {
            return Err(TraceryError::InvariantViolation(
                "a merged token needs at least one parent".into(),
            ));
        }
        let mut seen = HashSet::new();
        for parent in parents {
            self.token(parent)?;
            if !seen.insert(parent) {
                return Err(TraceryError::InvariantViolation(format!(
                    "token '{parent}' listed twice as a parent"
                )));
            }
        }
        Ok(())
    }
}

/// Append-only audit store shared by every component of a run.
///
/// A single `Ledger` may serve several independent runs; every record is
/// scoped to its run. Timestamps are the wall time the ledger was opened plus
/// the reading of its [`Clock`].
#[derive(Debug)]
pub struct Ledger {
    tables: RwLock<Tables>,
    clock: Arc<dyn Clock>,
    origin: DateTime<Utc>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// A ledger whose timestamps and durations follow `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            clock,
            origin: Utc::now(),
        }
    }

    pub(crate) fn from_tables(tables: Tables) -> Self {
        Self {
            tables: RwLock::new(tables),
            ..Self::new()
        }
    }

    fn timestamp(&self) -> DateTime<Utc> {
        TimeDelta::from_std(self.clock.now())
            .ok()
            .and_then(|offset| self.origin.checked_add_signed(offset))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| TraceryError::LedgerWrite("ledger lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| TraceryError::LedgerWrite("ledger lock poisoned".into()))
    }

    // -- runs ---------------------------------------------------------------

    /// Open a run whose configuration fingerprint is the stable hash of `settings`.
    pub fn begin_run(&self, settings: serde_json::Value) -> Result<RunRecord> {
        let record = RunRecord {
            run_id: RunId::generate(),
            started_at: self.timestamp(),
            completed_at: None,
            config_hash: stable_hash(&settings)?,
            settings,
            status: RunStatus::Running,
        };
        self.write()?.push_run(record.clone());
        tracing::info!(run_id = %record.run_id, config_hash = %record.config_hash, "Run opened");
        Ok(record)
    }

    /// Close a run with a terminal status. A run is closed exactly once.
    pub fn finish_run(&self, run_id: &RunId, status: RunStatus) -> Result<RunRecord> {
        if !status.is_closed() {
            return Err(TraceryError::InvariantViolation(
                "a run cannot be finished as running".into(),
            ));
        }
        let mut tables = self.write()?;
        tables.ensure_open(run_id)?;
        let idx = tables.run_idx[run_id];
        let run = &mut tables.runs[idx];
        run.status = status;
        run.completed_at = Some(self.timestamp());
        tracing::info!(run_id = %run_id, status = ?status, "Run closed");
        Ok(run.clone())
    }

    pub fn run(&self, run_id: &RunId) -> Result<RunRecord> {
        Ok(self.read()?.run(run_id)?.clone())
    }

    pub fn runs(&self) -> Result<Vec<RunRecord>> {
        Ok(self.read()?.runs.clone())
    }

    // -- graph --------------------------------------------------------------

    pub fn register_node(&self, run_id: &RunId, node: NodeRegistration) -> Result<NodeRecord> {
        let mut tables = self.write()?;
        tables.ensure_open(run_id)?;
        if tables.node(run_id, &node.node_id).is_ok() {
            return Err(TraceryError::InvariantViolation(format!(
                "node '{}' registered twice in run '{run_id}'",
                node.node_id
            )));
        }
        let sequence = tables.nodes.iter().filter(|n| &n.run_id == run_id).count();
        let record = NodeRecord {
            node_id: node.node_id,
            run_id: run_id.clone(),
            plugin_name: node.plugin_name,
            node_type: node.node_type,
            plugin_version: node.plugin_version,
            determinism: node.determinism,
            config_hash: node.config_hash,
            sequence,
            registered_at: self.timestamp(),
        };
        tables.push_node(record.clone());
        Ok(record)
    }

    /// Register a labeled edge. `(from, label)` is unique within a run.
    pub fn register_edge(
        &self,
        run_id: &RunId,
        from: &NodeId,
        to: &NodeId,
        label: &str,
        mode: tracery_types::RoutingMode,
    ) -> Result<EdgeRecord> {
        let mut tables = self.write()?;
        tables.ensure_open(run_id)?;
        tables.node(run_id, from)?;
        tables.node(run_id, to)?;
        if tables
            .edges
            .iter()
            .any(|e| &e.run_id == run_id && &e.from_node_id == from && e.label == label)
        {
            return Err(TraceryError::InvariantViolation(format!(
                "edge '{label}' out of '{from}' registered twice"
            )));
        }
        let record = EdgeRecord {
            edge_id: tracery_types::EdgeId::generate(),
            run_id: run_id.clone(),
            from_node_id: from.clone(),
            to_node_id: to.clone(),
            label: label.to_string(),
            mode,
        };
        tables.edges.push(record.clone());
        Ok(record)
    }

    pub fn node(&self, run_id: &RunId, node_id: &NodeId) -> Result<NodeRecord> {
        Ok(self.read()?.node(run_id, node_id)?.clone())
    }

    /// Nodes of a run in registration order.
    pub fn nodes(&self, run_id: &RunId) -> Result<Vec<NodeRecord>> {
        let tables = self.read()?;
        tables.run(run_id)?;
        let mut nodes: Vec<NodeRecord> = tables
            .nodes
            .iter()
            .filter(|n| &n.run_id == run_id)
            .cloned()
            .collect();
        nodes.sort_by_key(|n| n.sequence);
        Ok(nodes)
    }

    pub fn edges(&self, run_id: &RunId) -> Result<Vec<EdgeRecord>> {
        let tables = self.read()?;
        tables.run(run_id)?;
        Ok(tables
            .edges
            .iter()
            .filter(|e| &e.run_id == run_id)
            .cloned()
            .collect())
    }

    pub fn edge_for(&self, run_id: &RunId, from: &NodeId, label: &str) -> Result<Option<EdgeRecord>> {
        Ok(self
            .read()?
            .edges
            .iter()
            .find(|e| &e.run_id == run_id && &e.from_node_id == from && e.label == label)
            .cloned())
    }

    // -- rows and tokens ----------------------------------------------------

    /// Record an ingested row together with its initial token.
    pub fn create_row_token(
        &self,
        run_id: &RunId,
        source_node_id: &NodeId,
        row_index: usize,
        data: RowData,
    ) -> Result<(RowRecord, TokenRecord)> {
        let source_data_hash = stable_hash(&data)?;
        let mut tables = self.write()?;
        tables.ensure_open(run_id)?;
        let source = tables.node(run_id, source_node_id)?;
        if source.node_type != NodeType::Source {
            return Err(TraceryError::InvariantViolation(format!(
                "rows can only be ingested from a source node, '{source_node_id}' is a {}",
                source.node_type
            )));
        }
        let row = RowRecord {
            row_id: RowId::generate(),
            run_id: run_id.clone(),
            source_node_id: source_node_id.clone(),
            row_index,
            source_data_hash,
            data,
            created_at: self.timestamp(),
        };
        tables.push_row(row.clone());
        let token = tables.new_token(self.timestamp(), row.row_id.clone(), &[], None, None, None);
        Ok((row, token))
    }

    /// Split `parent` into one child per branch label, all under one fork group.
    pub fn fork_token(
        &self,
        parent: &TokenId,
        branches: &[String],
    ) -> Result<(GroupId, Vec<TokenRecord>)> {
        let mut tables = self.write()?;
        let row_id = tables.token(parent)?.row_id.clone();
        if branches.is_empty() {
            return Err(TraceryError::InvariantViolation(format!(
                "fork of '{parent}' names no branches"
            )));
        }
        let unique: HashSet<&String> = branches.iter().collect();
        if unique.len() != branches.len() {
            return Err(TraceryError::InvariantViolation(format!(
                "fork of '{parent}' repeats a branch label"
            )));
        }
        let group = GroupId::generate();
        let now = self.timestamp();
        let children = branches
            .iter()
            .map(|branch| {
                tables.new_token(
                    now,
                    row_id.clone(),
                    std::slice::from_ref(parent),
                    Some(group.clone()),
                    None,
                    Some(branch.clone()),
                )
            })
            .collect();
        Ok((group, children))
    }

    /// Merge fork siblings into one successor under a new join group.
    pub fn coalesce_tokens(&self, parents: &[TokenId]) -> Result<(GroupId, TokenRecord)> {
        let mut tables = self.write()?;
        tables.check_distinct_parents(parents)?;
        let row_id = tables.token(&parents[0])?.row_id.clone();
        for parent in &parents[1..] {
            if tables.token(parent)?.row_id != row_id {
                return Err(TraceryError::InvariantViolation(format!(
                    "coalesce parents span rows '{row_id}' and '{}'",
                    tables.token(parent)?.row_id
                )));
            }
        }
        let group = GroupId::generate();
        let token = tables.new_token(
            self.timestamp(),
            row_id,
            parents,
            None,
            Some(group.clone()),
            None,
        );
        Ok((group, token))
    }

    /// Create a token produced by an aggregation flush from the batch members.
    /// The successor belongs to `row_id`, the row whose processing flushed it.
    pub fn aggregate_tokens(&self, parents: &[TokenId], row_id: &RowId) -> Result<TokenRecord> {
        let mut tables = self.write()?;
        tables.check_distinct_parents(parents)?;
        tables.row(row_id)?;
        Ok(tables.new_token(self.timestamp(), row_id.clone(), parents, None, None, None))
    }

    pub fn row(&self, row_id: &RowId) -> Result<RowRecord> {
        Ok(self.read()?.row(row_id)?.clone())
    }

    pub fn rows(&self, run_id: &RunId) -> Result<Vec<RowRecord>> {
        let tables = self.read()?;
        tables.run(run_id)?;
        Ok(tables
            .rows
            .iter()
            .filter(|r| &r.run_id == run_id)
            .cloned()
            .collect())
    }

    pub fn token(&self, token_id: &TokenId) -> Result<TokenRecord> {
        Ok(self.read()?.token(token_id)?.clone())
    }

    pub fn tokens_for_row(&self, row_id: &RowId) -> Result<Vec<TokenRecord>> {
        Ok(self
            .read()?
            .tokens
            .iter()
            .filter(|t| &t.row_id == row_id)
            .cloned()
            .collect())
    }

    /// Direct parents in ordinal order.
    pub fn parents(&self, token_id: &TokenId) -> Result<Vec<TokenId>> {
        let tables = self.read()?;
        tables.token(token_id)?;
        Ok(tables.parents_of(token_id))
    }

    pub fn children(&self, token_id: &TokenId) -> Result<Vec<TokenRecord>> {
        let tables = self.read()?;
        tables.token(token_id)?;
        Ok(tables.children_of(token_id).into_iter().cloned().collect())
    }

    // -- node states --------------------------------------------------------

    /// Open a new attempt of `node_id` on `token_id`.
    ///
    /// Attempt numbers start at 1; a retry may only open once every earlier
    /// attempt at the same step has resolved.
    pub fn begin_node_state(
        &self,
        token_id: &TokenId,
        node_id: &NodeId,
        step_index: usize,
        attempt: u32,
        input_hash: impl Into<String>,
    ) -> Result<OpenNodeState> {
        let mut tables = self.write()?;
        let run_id = tables.token_run(token_id)?.clone();
        tables.ensure_open(&run_id)?;
        tables.node(&run_id, node_id)?;
        if attempt == 0 {
            return Err(TraceryError::InvariantViolation(
                "attempt numbers start at 1".into(),
            ));
        }
        for state in tables.states_for_token(token_id) {
            if state.node_id() != node_id || state.step_index() != step_index {
                continue;
            }
            if state.is_open() {
                return Err(TraceryError::InvariantViolation(format!(
                    "token '{token_id}' already has an open attempt at '{node_id}'"
                )));
            }
            if state.attempt() >= attempt {
                return Err(TraceryError::InvariantViolation(format!(
                    "attempt {attempt} of '{node_id}' on '{token_id}' would not follow attempt {}",
                    state.attempt()
                )));
            }
        }
        let open = OpenNodeState::begin(
            token_id.clone(),
            node_id.clone(),
            step_index,
            attempt,
            input_hash,
            self.timestamp(),
        );
        tables.push_state(NodeState::Open(open.clone()));
        Ok(open)
    }

    /// Resolve an open attempt. Resolving anything but an open attempt is an
    /// invariant violation.
    pub fn complete_node_state(
        &self,
        state_id: &StateId,
        completion: NodeStateCompletion,
    ) -> Result<NodeState> {
        let mut tables = self.write()?;
        let idx = *tables
            .state_idx
            .get(state_id)
            .ok_or_else(|| not_found("node state", state_id))?;
        let open = match &tables.node_states[idx] {
            NodeState::Open(open) => open.clone(),
            other => {
                return Err(TraceryError::InvariantViolation(format!(
                    "node state '{state_id}' is already {}",
                    other.status()
                )))
            }
        };
        let resolved = open.resolve(completion, self.timestamp());
        tables.node_states[idx] = resolved.clone();
        Ok(resolved)
    }

    pub fn node_state(&self, state_id: &StateId) -> Result<NodeState> {
        Ok(self.read()?.state(state_id)?.clone())
    }

    /// Every attempt recorded for a token, oldest first.
    pub fn node_states_for_token(&self, token_id: &TokenId) -> Result<Vec<NodeState>> {
        let tables = self.read()?;
        tables.token(token_id)?;
        Ok(tables
            .states_for_token(token_id)
            .into_iter()
            .cloned()
            .collect())
    }

    /// Attempts of a run that have not resolved yet.
    pub fn open_node_states(&self, run_id: &RunId) -> Result<Vec<OpenNodeState>> {
        let tables = self.read()?;
        tables.run(run_id)?;
        Ok(tables
            .node_states
            .iter()
            .filter_map(|s| match s {
                NodeState::Open(open) => Some(open),
                _ => None,
            })
            .filter(|open| {
                tables
                    .token_run(&open.token_id)
                    .map(|r| r == run_id)
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    // -- batches ------------------------------------------------------------

    /// Open a draft batch. An aggregation node has at most one draft at a time.
    pub fn create_batch(&self, run_id: &RunId, aggregation_node_id: &NodeId) -> Result<BatchRecord> {
        let mut tables = self.write()?;
        tables.ensure_open(run_id)?;
        let node = tables.node(run_id, aggregation_node_id)?;
        if node.node_type != NodeType::Aggregation {
            return Err(TraceryError::InvariantViolation(format!(
                "batches belong to aggregation nodes, '{aggregation_node_id}' is a {}",
                node.node_type
            )));
        }
        if tables.batches.iter().any(|b| {
            &b.run_id == run_id
                && &b.aggregation_node_id == aggregation_node_id
                && b.status == BatchStatus::Draft
        }) {
            return Err(TraceryError::InvariantViolation(format!(
                "aggregation '{aggregation_node_id}' already has a draft batch"
            )));
        }
        let record = BatchRecord {
            batch_id: BatchId::generate(),
            run_id: run_id.clone(),
            aggregation_node_id: aggregation_node_id.clone(),
            status: BatchStatus::Draft,
            trigger_type: None,
            trigger_reason: None,
            created_at: self.timestamp(),
            completed_at: None,
        };
        tables.push_batch(record.clone());
        tracing::debug!(batch = %record.batch_id, node = %aggregation_node_id, "Batch opened");
        Ok(record)
    }

    /// Append `token_id` to a draft batch at the next ordinal.
    pub fn add_batch_member(&self, batch_id: &BatchId, token_id: &TokenId) -> Result<BatchMemberRecord> {
        let mut tables = self.write()?;
        let batch = tables.batch(batch_id)?;
        if batch.status != BatchStatus::Draft {
            return Err(TraceryError::InvariantViolation(format!(
                "batch '{batch_id}' no longer accepts members"
            )));
        }
        tables.token(token_id)?;
        let members = tables
            .batch_members
            .iter()
            .filter(|m| &m.batch_id == batch_id);
        let mut ordinal = 0;
        for member in members {
            if &member.token_id == token_id {
                return Err(TraceryError::InvariantViolation(format!(
                    "token '{token_id}' is already in batch '{batch_id}'"
                )));
            }
            ordinal += 1;
        }
        let record = BatchMemberRecord {
            batch_id: batch_id.clone(),
            token_id: token_id.clone(),
            ordinal,
        };
        tables.batch_members.push(record.clone());
        Ok(record)
    }

    /// Move a draft batch to `executing`, recording the trigger that fired.
    pub fn start_batch_flush(
        &self,
        batch_id: &BatchId,
        trigger: TriggerType,
        reason: impl Into<String>,
    ) -> Result<BatchRecord> {
        let reason = reason.into();
        self.transition_batch(batch_id, BatchStatus::Executing, |batch| {
            batch.trigger_type = Some(trigger);
            batch.trigger_reason = Some(reason);
        })
    }

    /// Move an executing batch to `completed` or `failed`.
    pub fn close_batch(&self, batch_id: &BatchId, status: BatchStatus) -> Result<BatchRecord> {
        self.transition_batch(batch_id, status, |batch| {
            batch.completed_at = Some(self.timestamp());
        })
    }

    fn transition_batch(
        &self,
        batch_id: &BatchId,
        next: BatchStatus,
        update: impl FnOnce(&mut BatchRecord),
    ) -> Result<BatchRecord> {
        let mut tables = self.write()?;
        let idx = *tables
            .batch_idx
            .get(batch_id)
            .ok_or_else(|| not_found("batch", batch_id))?;
        let batch = &mut tables.batches[idx];
        if !batch.status.can_transition_to(next) {
            return Err(TraceryError::InvariantViolation(format!(
                "batch '{batch_id}' cannot move from {:?} to {next:?}",
                batch.status
            )));
        }
        batch.status = next;
        update(batch);
        tracing::debug!(batch = %batch_id, status = ?next, "Batch transitioned");
        Ok(batch.clone())
    }

    pub fn batch(&self, batch_id: &BatchId) -> Result<BatchRecord> {
        Ok(self.read()?.batch(batch_id)?.clone())
    }

    pub fn batches(&self, run_id: &RunId) -> Result<Vec<BatchRecord>> {
        let tables = self.read()?;
        tables.run(run_id)?;
        Ok(tables
            .batches
            .iter()
            .filter(|b| &b.run_id == run_id)
            .cloned()
            .collect())
    }

    /// Members of a batch in ordinal order.
    pub fn batch_members(&self, batch_id: &BatchId) -> Result<Vec<BatchMemberRecord>> {
        let tables = self.read()?;
        tables.batch(batch_id)?;
        let mut members: Vec<BatchMemberRecord> = tables
            .batch_members
            .iter()
            .filter(|m| &m.batch_id == batch_id)
            .cloned()
            .collect();
        members.sort_by_key(|m| m.ordinal);
        Ok(members)
    }

    // -- artifacts ----------------------------------------------------------

    /// Record a sink output. A repeated idempotency key within the run returns
    /// the artifact already on record.
    pub fn record_artifact(&self, run_id: &RunId, artifact: NewArtifact) -> Result<ArtifactRecord> {
        let mut tables = self.write()?;
        tables.ensure_open(run_id)?;
        if let Some(key) = &artifact.idempotency_key {
            if let Some(existing) = tables
                .artifacts
                .iter()
                .find(|a| &a.run_id == run_id && a.idempotency_key.as_ref() == Some(key))
            {
                tracing::debug!(run_id = %run_id, key = %key, "Artifact already recorded for idempotency key");
                return Ok(existing.clone());
            }
        }
        let sink = tables.node(run_id, &artifact.sink_node_id)?;
        if sink.node_type != NodeType::Sink {
            return Err(TraceryError::InvariantViolation(format!(
                "artifacts are produced by sinks, '{}' is a {}",
                artifact.sink_node_id, sink.node_type
            )));
        }
        let state = tables.state(&artifact.produced_by_state_id)?;
        if state.node_id() != &artifact.sink_node_id {
            return Err(TraceryError::InvariantViolation(format!(
                "state '{}' does not belong to sink '{}'",
                artifact.produced_by_state_id, artifact.sink_node_id
            )));
        }
        let record = ArtifactRecord {
            artifact_id: ArtifactId::generate(),
            run_id: run_id.clone(),
            produced_by_state_id: artifact.produced_by_state_id,
            sink_node_id: artifact.sink_node_id,
            artifact_type: artifact.artifact_type,
            path_or_uri: artifact.path_or_uri,
            content_hash: artifact.content_hash,
            size_bytes: artifact.size_bytes,
            idempotency_key: artifact.idempotency_key,
            created_at: self.timestamp(),
        };
        tables.artifacts.push(record.clone());
        Ok(record)
    }

    pub fn artifacts(&self, run_id: &RunId) -> Result<Vec<ArtifactRecord>> {
        let tables = self.read()?;
        tables.run(run_id)?;
        Ok(tables
            .artifacts
            .iter()
            .filter(|a| &a.run_id == run_id)
            .cloned()
            .collect())
    }

    // -- routing events -----------------------------------------------------

    /// Record the events of one routing decision together.
    pub fn record_routing_events(
        &self,
        events: Vec<NewRoutingEvent>,
    ) -> Result<Vec<RoutingEventRecord>> {
        let mut tables = self.write()?;
        for event in &events {
            tables.state(&event.state_id)?;
            if let Some(edge_id) = &event.edge_id {
                if !tables.edges.iter().any(|e| &e.edge_id == edge_id) {
                    return Err(not_found("edge", edge_id));
                }
            }
        }
        let now = self.timestamp();
        let records: Vec<RoutingEventRecord> = events
            .into_iter()
            .map(|e| RoutingEventRecord {
                event_id: RoutingEventId::generate(),
                state_id: e.state_id,
                edge_id: e.edge_id,
                routing_group_id: e.routing_group_id,
                ordinal: e.ordinal,
                mode: e.mode,
                condition: e.condition,
                label: e.label,
                destination: e.destination,
                reason: e.reason,
                created_at: now,
            })
            .collect();
        tables.routing_events.extend(records.iter().cloned());
        Ok(records)
    }

    /// Routing events attached to any attempt of `token_id`.
    pub fn routing_events_for_token(&self, token_id: &TokenId) -> Result<Vec<RoutingEventRecord>> {
        let tables = self.read()?;
        let states: HashSet<&StateId> = tables
            .states_for_token(token_id)
            .into_iter()
            .map(|s| s.state_id())
            .collect();
        Ok(tables
            .routing_events
            .iter()
            .filter(|e| states.contains(&e.state_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracery_types::{Determinism, FailureDetail, RoutingMode};

    fn registration(kind: NodeType, name: &str) -> NodeRegistration {
        NodeRegistration {
            node_id: NodeId::for_node(kind.as_str(), name),
            plugin_name: name.to_string(),
            node_type: kind,
            plugin_version: "1.0.0".into(),
            determinism: Determinism::Deterministic,
            config_hash: "cfg".into(),
        }
    }

    fn data(value: serde_json::Value) -> RowData {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn node_state_durations_follow_the_ledger_clock() {
        let clock = Arc::new(tracery_types::ManualClock::new());
        let ledger = Ledger::with_clock(clock.clone());
        let run = ledger.begin_run(json!({})).unwrap();
        let source = ledger
            .register_node(&run.run_id, registration(NodeType::Source, "csv"))
            .unwrap()
            .node_id;
        let (_, token) = ledger
            .create_row_token(&run.run_id, &source, 0, data(json!({"v": 1})))
            .unwrap();

        let open = ledger
            .begin_node_state(&token.token_id, &source, 0, 1, "h")
            .unwrap();
        clock.advance(std::time::Duration::from_millis(250));
        match ledger
            .complete_node_state(&open.state_id, NodeStateCompletion::completed("h"))
            .unwrap()
        {
            NodeState::Completed(done) => {
                assert_eq!(done.duration_ms, 250);
                assert_eq!((done.completed_at - done.started_at).num_milliseconds(), 250);
            }
            other => panic!("expected a completed state, got {other:?}"),
        }
    }

    fn setup() -> (Ledger, RunId, NodeId) {
        let ledger = Ledger::new();
        let run = ledger.begin_run(json!({"pipeline": "test"})).unwrap();
        let source = ledger
            .register_node(&run.run_id, registration(NodeType::Source, "csv"))
            .unwrap();
        (ledger, run.run_id, source.node_id)
    }

    #[test]
    fn run_lifecycle() {
        let (ledger, run_id, _) = setup();
        let run = ledger.run(&run_id).unwrap();
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.config_hash, stable_hash(&json!({"pipeline": "test"})).unwrap());

        let closed = ledger.finish_run(&run_id, RunStatus::Completed).unwrap();
        assert!(closed.completed_at.is_some());

        let err = ledger.finish_run(&run_id, RunStatus::Failed).unwrap_err();
        assert!(matches!(err, TraceryError::InvariantViolation(_)));
    }

    #[test]
    fn closed_run_rejects_writes() {
        let (ledger, run_id, source) = setup();
        ledger.finish_run(&run_id, RunStatus::Completed).unwrap();
        let err = ledger
            .create_row_token(&run_id, &source, 0, data(json!({"v": 1})))
            .unwrap_err();
        assert!(matches!(err, TraceryError::InvariantViolation(_)));
    }

    #[test]
    fn duplicate_node_is_rejected() {
        let (ledger, run_id, _) = setup();
        let err = ledger
            .register_node(&run_id, registration(NodeType::Source, "csv"))
            .unwrap_err();
        assert!(matches!(err, TraceryError::InvariantViolation(_)));
    }

    #[test]
    fn row_and_token_are_created_together() {
        let (ledger, run_id, source) = setup();
        let (row, token) = ledger
            .create_row_token(&run_id, &source, 0, data(json!({"v": 1})))
            .unwrap();
        assert_eq!(token.row_id, row.row_id);
        assert_eq!(row.source_data_hash, stable_hash(&json!({"v": 1})).unwrap());
        assert!(ledger.parents(&token.token_id).unwrap().is_empty());
    }

    #[test]
    fn fork_records_siblings_and_parent_links() {
        let (ledger, run_id, source) = setup();
        let (_, parent) = ledger
            .create_row_token(&run_id, &source, 0, data(json!({"v": 1})))
            .unwrap();
        let (group, children) = ledger
            .fork_token(&parent.token_id, &["a".into(), "b".into()])
            .unwrap();

        assert_eq!(children.len(), 2);
        for child in &children {
            assert_eq!(child.row_id, parent.row_id);
            assert_eq!(child.fork_group_id.as_ref(), Some(&group));
            assert_eq!(ledger.parents(&child.token_id).unwrap(), vec![parent.token_id.clone()]);
        }
        assert_eq!(children[0].branch_name.as_deref(), Some("a"));
        assert_eq!(ledger.children(&parent.token_id).unwrap().len(), 2);
    }

    #[test]
    fn fork_with_repeated_branch_writes_nothing() {
        let (ledger, run_id, source) = setup();
        let (row, parent) = ledger
            .create_row_token(&run_id, &source, 0, data(json!({})))
            .unwrap();
        let err = ledger
            .fork_token(&parent.token_id, &["a".into(), "a".into()])
            .unwrap_err();
        assert!(matches!(err, TraceryError::InvariantViolation(_)));
        assert_eq!(ledger.tokens_for_row(&row.row_id).unwrap().len(), 1);
    }

    #[test]
    fn coalesce_links_every_parent_in_order() {
        let (ledger, run_id, source) = setup();
        let (_, parent) = ledger
            .create_row_token(&run_id, &source, 0, data(json!({})))
            .unwrap();
        let (_, children) = ledger
            .fork_token(&parent.token_id, &["a".into(), "b".into(), "c".into()])
            .unwrap();
        let ids: Vec<TokenId> = children.iter().map(|c| c.token_id.clone()).collect();
        let (group, merged) = ledger.coalesce_tokens(&ids).unwrap();

        assert_eq!(merged.join_group_id, Some(group));
        assert_eq!(merged.row_id, parent.row_id);
        assert_eq!(ledger.parents(&merged.token_id).unwrap(), ids);
    }

    #[test]
    fn coalesce_across_rows_is_rejected() {
        let (ledger, run_id, source) = setup();
        let (_, a) = ledger
            .create_row_token(&run_id, &source, 0, data(json!({})))
            .unwrap();
        let (_, b) = ledger
            .create_row_token(&run_id, &source, 1, data(json!({})))
            .unwrap();
        let err = ledger
            .coalesce_tokens(&[a.token_id, b.token_id])
            .unwrap_err();
        assert!(matches!(err, TraceryError::InvariantViolation(_)));
    }

    #[test]
    fn node_state_lifecycle() {
        let (ledger, run_id, source) = setup();
        let transform = ledger
            .register_node(&run_id, registration(NodeType::Transform, "enrich"))
            .unwrap();
        let (_, token) = ledger
            .create_row_token(&run_id, &source, 0, data(json!({})))
            .unwrap();

        let first = ledger
            .begin_node_state(&token.token_id, &transform.node_id, 1, 1, "h")
            .unwrap();
        let err = ledger
            .begin_node_state(&token.token_id, &transform.node_id, 1, 2, "h")
            .unwrap_err();
        assert!(matches!(err, TraceryError::InvariantViolation(_)));

        ledger
            .complete_node_state(
                &first.state_id,
                NodeStateCompletion::failed(FailureDetail::new("transient", "timeout")),
            )
            .unwrap();
        let second = ledger
            .begin_node_state(&token.token_id, &transform.node_id, 1, 2, "h")
            .unwrap();
        ledger
            .complete_node_state(&second.state_id, NodeStateCompletion::completed("out"))
            .unwrap();

        let err = ledger
            .complete_node_state(&second.state_id, NodeStateCompletion::completed("again"))
            .unwrap_err();
        assert!(matches!(err, TraceryError::InvariantViolation(_)));

        let states = ledger.node_states_for_token(&token.token_id).unwrap();
        let attempts: Vec<u32> = states.iter().map(|s| s.attempt()).collect();
        assert_eq!(attempts, vec![1, 2]);
        assert_eq!(states[0].status(), "failed");
        assert_eq!(states[1].status(), "completed");
    }

    #[test]
    fn retry_cannot_reuse_an_attempt_number() {
        let (ledger, run_id, source) = setup();
        let transform = ledger
            .register_node(&run_id, registration(NodeType::Transform, "t"))
            .unwrap();
        let (_, token) = ledger
            .create_row_token(&run_id, &source, 0, data(json!({})))
            .unwrap();
        let state = ledger
            .begin_node_state(&token.token_id, &transform.node_id, 1, 1, "h")
            .unwrap();
        ledger
            .complete_node_state(&state.state_id, NodeStateCompletion::completed("o"))
            .unwrap();
        assert!(ledger
            .begin_node_state(&token.token_id, &transform.node_id, 1, 1, "h")
            .is_err());
    }

    #[test]
    fn batch_members_get_contiguous_ordinals() {
        let (ledger, run_id, source) = setup();
        let agg = ledger
            .register_node(&run_id, registration(NodeType::Aggregation, "sum"))
            .unwrap();
        let batch = ledger.create_batch(&run_id, &agg.node_id).unwrap();
        for i in 0..3 {
            let (_, token) = ledger
                .create_row_token(&run_id, &source, i, data(json!({"v": i})))
                .unwrap();
            ledger.add_batch_member(&batch.batch_id, &token.token_id).unwrap();
        }
        let ordinals: Vec<usize> = ledger
            .batch_members(&batch.batch_id)
            .unwrap()
            .iter()
            .map(|m| m.ordinal)
            .collect();
        assert_eq!(ordinals, vec![0, 1, 2]);

        assert!(ledger.create_batch(&run_id, &agg.node_id).is_err());
    }

    #[test]
    fn batch_lifecycle_is_enforced() {
        let (ledger, run_id, source) = setup();
        let agg = ledger
            .register_node(&run_id, registration(NodeType::Aggregation, "sum"))
            .unwrap();
        let batch = ledger.create_batch(&run_id, &agg.node_id).unwrap();

        assert!(ledger
            .close_batch(&batch.batch_id, BatchStatus::Completed)
            .is_err());

        let flushing = ledger
            .start_batch_flush(&batch.batch_id, TriggerType::Count, "count reached 3")
            .unwrap();
        assert_eq!(flushing.trigger_type, Some(TriggerType::Count));

        let (_, token) = ledger
            .create_row_token(&run_id, &source, 0, data(json!({})))
            .unwrap();
        assert!(ledger
            .add_batch_member(&batch.batch_id, &token.token_id)
            .is_err());

        let done = ledger
            .close_batch(&batch.batch_id, BatchStatus::Completed)
            .unwrap();
        assert!(done.completed_at.is_some());

        // A new draft may open once the previous one has left draft.
        assert!(ledger.create_batch(&run_id, &agg.node_id).is_ok());
    }

    #[test]
    fn artifacts_dedupe_on_idempotency_key() {
        let (ledger, run_id, source) = setup();
        let sink = ledger
            .register_node(&run_id, registration(NodeType::Sink, "out"))
            .unwrap();
        let (_, token) = ledger
            .create_row_token(&run_id, &source, 0, data(json!({})))
            .unwrap();
        let state = ledger
            .begin_node_state(&token.token_id, &sink.node_id, 2, 1, "h")
            .unwrap();

        let artifact = NewArtifact {
            produced_by_state_id: state.state_id.clone(),
            sink_node_id: sink.node_id.clone(),
            artifact_type: "memory".into(),
            path_or_uri: "memory://out/0".into(),
            content_hash: "abc".into(),
            size_bytes: 10,
            idempotency_key: Some("write-1".into()),
        };
        let first = ledger.record_artifact(&run_id, artifact.clone()).unwrap();
        let again = ledger.record_artifact(&run_id, artifact.clone()).unwrap();
        assert_eq!(first.artifact_id, again.artifact_id);
        assert_eq!(ledger.artifacts(&run_id).unwrap().len(), 1);

        let unkeyed = NewArtifact {
            idempotency_key: None,
            ..artifact
        };
        ledger.record_artifact(&run_id, unkeyed.clone()).unwrap();
        ledger.record_artifact(&run_id, unkeyed).unwrap();
        assert_eq!(ledger.artifacts(&run_id).unwrap().len(), 3);
    }

    #[test]
    fn routing_events_attach_to_token_states() {
        let (ledger, run_id, source) = setup();
        let gate = ledger
            .register_node(&run_id, registration(NodeType::Gate, "quality"))
            .unwrap();
        let sink = ledger
            .register_node(&run_id, registration(NodeType::Sink, "review"))
            .unwrap();
        let edge = ledger
            .register_edge(&run_id, &gate.node_id, &sink.node_id, "false", RoutingMode::Move)
            .unwrap();
        assert!(ledger
            .register_edge(&run_id, &gate.node_id, &sink.node_id, "false", RoutingMode::Move)
            .is_err());

        let (_, token) = ledger
            .create_row_token(&run_id, &source, 0, data(json!({"confidence": 0.5})))
            .unwrap();
        let state = ledger
            .begin_node_state(&token.token_id, &gate.node_id, 1, 1, "h")
            .unwrap();
        ledger
            .record_routing_events(vec![NewRoutingEvent {
                state_id: state.state_id.clone(),
                edge_id: Some(edge.edge_id.clone()),
                routing_group_id: GroupId::generate(),
                ordinal: 0,
                mode: RoutingMode::Move,
                condition: Some("row['confidence'] >= 0.85".into()),
                label: "false".into(),
                destination: "review".into(),
                reason: json!(null),
            }])
            .unwrap();

        let events = ledger.routing_events_for_token(&token.token_id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].destination, "review");
        assert_eq!(
            ledger
                .edge_for(&run_id, &gate.node_id, "false")
                .unwrap()
                .map(|e| e.edge_id),
            Some(edge.edge_id)
        );
    }

    #[test]
    fn open_states_are_listed_per_run() {
        let (ledger, run_id, source) = setup();
        let (_, token) = ledger
            .create_row_token(&run_id, &source, 0, data(json!({})))
            .unwrap();
        ledger
            .begin_node_state(&token.token_id, &source, 0, 1, "h")
            .unwrap();

        let other = ledger.begin_run(json!({})).unwrap();
        assert!(ledger.open_node_states(&other.run_id).unwrap().is_empty());
        assert_eq!(ledger.open_node_states(&run_id).unwrap().len(), 1);
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let ledger = Ledger::new();
        let err = ledger.token(&TokenId::from("tok-missing")).unwrap_err();
        assert!(matches!(err, TraceryError::NotFound { entity: "token", .. }));
    }
}
