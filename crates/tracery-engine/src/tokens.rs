//! Token creation and lineage.
//!
//! Every token the engine creates goes through [`TokenManager`], which pairs
//! the ledger record with the in-flight [`Token`] carrying the current row.

use std::sync::Arc;

use tracery_audit::Ledger;
use tracery_types::{
    stable_hash, GroupId, NodeId, NodeStateCompletion, Result, RowData, RowId, RunId, Token,
};

pub struct TokenManager {
    ledger: Arc<Ledger>,
    run_id: RunId,
}

impl TokenManager {
    pub fn new(ledger: Arc<Ledger>, run_id: RunId) -> Self {
        Self { ledger, run_id }
    }

    /// Record an ingested row, its first token, and the completed source
    /// state at step 0.
    pub fn create_initial_token(
        &self,
        source: &NodeId,
        row_index: usize,
        data: RowData,
    ) -> Result<Token> {
        let hash = stable_hash(&data)?;
        let (_, record) = self
            .ledger
            .create_row_token(&self.run_id, source, row_index, data.clone())?;
        let state = self
            .ledger
            .begin_node_state(&record.token_id, source, 0, 1, &hash)?;
        self.ledger
            .complete_node_state(&state.state_id, NodeStateCompletion::completed(hash))?;
        Ok(record.with_data(data))
    }

    /// One child per branch, each carrying the parent's current row.
    pub fn fork(&self, parent: &Token, branches: &[String]) -> Result<(GroupId, Vec<Token>)> {
        let (group, records) = self.ledger.fork_token(&parent.token_id, branches)?;
        let children = records
            .into_iter()
            .map(|r| r.with_data(parent.row_data.clone()))
            .collect();
        Ok((group, children))
    }

    /// One successor for `parents`, all of the same row.
    pub fn coalesce(&self, parents: &[&Token], merged: RowData) -> Result<Token> {
        let ids: Vec<_> = parents.iter().map(|t| t.token_id.clone()).collect();
        let (_, record) = self.ledger.coalesce_tokens(&ids)?;
        Ok(record.with_data(merged))
    }

    /// One output of an aggregation flush, descended from every member.
    pub fn aggregate(&self, members: &[Token], row_id: &RowId, data: RowData) -> Result<Token> {
        let ids: Vec<_> = members.iter().map(|t| t.token_id.clone()).collect();
        let record = self.ledger.aggregate_tokens(&ids, row_id)?;
        Ok(record.with_data(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tracery_audit::NodeRegistration;
    use tracery_types::{Determinism, NodeType};

    fn setup() -> (TokenManager, Arc<Ledger>, NodeId) {
        let ledger = Arc::new(Ledger::new());
        let run = ledger.begin_run(json!({})).unwrap();
        let source = ledger
            .register_node(
                &run.run_id,
                NodeRegistration {
                    node_id: NodeId::for_node("source", "csv"),
                    plugin_name: "csv".into(),
                    node_type: NodeType::Source,
                    plugin_version: "1".into(),
                    determinism: Determinism::IoRead,
                    config_hash: "c".into(),
                },
            )
            .unwrap()
            .node_id;
        (TokenManager::new(ledger.clone(), run.run_id), ledger, source)
    }

    fn data(value: serde_json::Value) -> RowData {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn initial_token_records_row_and_source_state() {
        let (tokens, ledger, source) = setup();
        let token = tokens
            .create_initial_token(&source, 0, data(json!({"v": 1})))
            .unwrap();

        assert_eq!(token.row_data, data(json!({"v": 1})));
        assert!(token.branch_name.is_none());
        let row = ledger.row(&token.row_id).unwrap();
        assert_eq!(row.row_index, 0);
        let states = ledger.node_states_for_token(&token.token_id).unwrap();
        assert_eq!(states.len(), 1);
        assert_eq!(states[0].status(), "completed");
        assert_eq!(states[0].step_index(), 0);
    }

    #[test]
    fn fork_children_share_row_and_payload() {
        let (tokens, ledger, source) = setup();
        let parent = tokens
            .create_initial_token(&source, 0, data(json!({"v": 1})))
            .unwrap();
        let (group, children) = tokens
            .fork(&parent, &["a".to_string(), "b".to_string()])
            .unwrap();

        assert_eq!(children.len(), 2);
        for child in &children {
            assert_eq!(child.row_id, parent.row_id);
            assert_eq!(child.fork_group_id.as_ref(), Some(&group));
            assert_eq!(child.row_data, parent.row_data);
            assert_eq!(
                ledger.parents(&child.token_id).unwrap(),
                vec![parent.token_id.clone()]
            );
        }
        assert_eq!(children[0].branch(), Some("a"));
        assert_eq!(children[1].branch(), Some("b"));
    }

    #[test]
    fn coalesce_records_every_parent() {
        let (tokens, ledger, source) = setup();
        let parent = tokens
            .create_initial_token(&source, 0, data(json!({"v": 1})))
            .unwrap();
        let (_, children) = tokens
            .fork(&parent, &["a".to_string(), "b".to_string()])
            .unwrap();
        let merged = tokens
            .coalesce(&[&children[0], &children[1]], data(json!({"merged": true})))
            .unwrap();

        assert!(merged.join_group_id.is_some());
        assert_eq!(merged.row_id, parent.row_id);
        let mut parents = ledger.parents(&merged.token_id).unwrap();
        parents.sort();
        let mut expected = vec![children[0].token_id.clone(), children[1].token_id.clone()];
        expected.sort();
        assert_eq!(parents, expected);
    }

    #[test]
    fn aggregate_spans_rows() {
        let (tokens, ledger, source) = setup();
        let a = tokens
            .create_initial_token(&source, 0, data(json!({"v": 1})))
            .unwrap();
        let b = tokens
            .create_initial_token(&source, 1, data(json!({"v": 2})))
            .unwrap();
        let out = tokens
            .aggregate(&[a.clone(), b.clone()], &b.row_id, data(json!({"sum": 3})))
            .unwrap();
        assert_eq!(out.row_id, b.row_id);
        assert_eq!(ledger.parents(&out.token_id).unwrap().len(), 2);
    }
}
