//! Whole-run ledger export.
//!
//! [`Ledger::export_run`] snapshots every record of one run into a
//! [`RunExport`], which can be written to disk as pretty JSON and loaded back
//! into a fresh [`Ledger`] for offline lineage queries.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use tracery_types::{NodeState, Result, RunId, StateId, TokenId};

use crate::ledger::{Ledger, Tables};
use crate::records::{
    ArtifactRecord, BatchMemberRecord, BatchRecord, EdgeRecord, NodeRecord, RoutingEventRecord,
    RowRecord, RunRecord, TokenParentRecord, TokenRecord,
};

/// Every record belonging to one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunExport {
    pub run: RunRecord,
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
    /// RFC 3339 timestamp of when the export was taken.
    pub exported_at: String,
}

impl Ledger {
    pub fn export_run(&self, run_id: &RunId) -> Result<RunExport> {
        let tables = self.read()?;
        let run = tables.run(run_id)?.clone();

        let rows: Vec<RowRecord> = tables
            .rows
            .iter()
            .filter(|r| &r.run_id == run_id)
            .cloned()
            .collect();
        let row_ids: HashSet<_> = rows.iter().map(|r| r.row_id.clone()).collect();
        let tokens: Vec<TokenRecord> = tables
            .tokens
            .iter()
            .filter(|t| row_ids.contains(&t.row_id))
            .cloned()
            .collect();
        let token_ids: HashSet<TokenId> = tokens.iter().map(|t| t.token_id.clone()).collect();
        let node_states: Vec<NodeState> = tables
            .node_states
            .iter()
            .filter(|s| token_ids.contains(s.token_id()))
            .cloned()
            .collect();
        let state_ids: HashSet<StateId> =
            node_states.iter().map(|s| s.state_id().clone()).collect();
        let batches: Vec<BatchRecord> = tables
            .batches
            .iter()
            .filter(|b| &b.run_id == run_id)
            .cloned()
            .collect();
        let batch_ids: HashSet<_> = batches.iter().map(|b| b.batch_id.clone()).collect();

        Ok(RunExport {
            nodes: tables
                .nodes
                .iter()
                .filter(|n| &n.run_id == run_id)
                .cloned()
                .collect(),
            edges: tables
                .edges
                .iter()
                .filter(|e| &e.run_id == run_id)
                .cloned()
                .collect(),
            token_parents: tables
                .token_parents
                .iter()
                .filter(|l| token_ids.contains(&l.token_id))
                .cloned()
                .collect(),
            batch_members: tables
                .batch_members
                .iter()
                .filter(|m| batch_ids.contains(&m.batch_id))
                .cloned()
                .collect(),
            artifacts: tables
                .artifacts
                .iter()
                .filter(|a| &a.run_id == run_id)
                .cloned()
                .collect(),
            routing_events: tables
                .routing_events
                .iter()
                .filter(|e| state_ids.contains(&e.state_id))
                .cloned()
                .collect(),
            run,
            rows,
            tokens,
            node_states,
            batches,
            exported_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Rebuild a ledger holding exactly the records of `export`.
    pub fn from_export(export: RunExport) -> Self {
        let mut tables = Tables::default();
        tables.push_run(export.run);
        export.nodes.into_iter().for_each(|n| tables.push_node(n));
        tables.edges = export.edges;
        export.rows.into_iter().for_each(|r| tables.push_row(r));
        export.tokens.into_iter().for_each(|t| tables.push_token(t));
        tables.token_parents = export.token_parents;
        export
            .node_states
            .into_iter()
            .for_each(|s| tables.push_state(s));
        export.batches.into_iter().for_each(|b| tables.push_batch(b));
        tables.batch_members = export.batch_members;
        tables.artifacts = export.artifacts;
        tables.routing_events = export.routing_events;
        Ledger::from_tables(tables)
    }
}

fn export_path(dir: &Path, run_id: &RunId) -> PathBuf {
    dir.join(format!("{run_id}.ledger.json"))
}

/// Write an export to `<dir>/<run_id>.ledger.json`, creating `dir` if needed.
pub async fn save_export(export: &RunExport, dir: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let path = export_path(dir, &export.run.run_id);
    let json = serde_json::to_string_pretty(export)?;
    tokio::fs::write(&path, json).await?;
    tracing::debug!(path = %path.display(), "Ledger export saved");
    Ok(path)
}

/// Load the export of `run_id` from `dir`. Returns `Ok(None)` when no export
/// exists for that run.
pub async fn load_export(dir: &Path, run_id: &RunId) -> Result<Option<RunExport>> {
    let path = export_path(dir, run_id);
    if !tokio::fs::try_exists(&path).await? {
        return Ok(None);
    }
    let json = tokio::fs::read_to_string(&path).await?;
    Ok(Some(serde_json::from_str(&json)?))
}
