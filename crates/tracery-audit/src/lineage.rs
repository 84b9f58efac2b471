//! Read-side lineage queries.
//!
//! A token's fate is never stored. It is derived from batch membership, parent
//! links and the token's own node-state history, in that order.

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use tracery_types::{BatchId, FailureDetail, NodeId, NodeState, NodeType, Result, TokenId};

use crate::ledger::{Ledger, Tables};
use crate::records::{BatchMemberRecord, RoutingEventRecord, RowRecord, TokenRecord};

/// `FailureDetail::kind` for a declared plugin error with a discard disposition.
pub const QUARANTINED: &str = "quarantined";

/// Where a token's story ended, or that it has not ended yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fate", rename_all = "snake_case")]
pub enum TokenFate {
    Forked { children: Vec<TokenId> },
    Coalesced { merged_into: TokenId },
    ConsumedInBatch { batch_id: BatchId },
    /// Written by the sink it reached along the main path.
    Completed { sink: NodeId },
    /// Written by a sink it was diverted to by a routing decision.
    Routed { sink: NodeId },
    Quarantined { error: FailureDetail },
    Failed { error: FailureDetail },
    InFlight,
}

impl TokenFate {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TokenFate::InFlight)
    }
}

/// Everything the ledger knows about one token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenExplanation {
    pub token: TokenRecord,
    pub row: RowRecord,
    pub parents: Vec<TokenId>,
    /// Transitive ancestors, nearest first.
    pub ancestry: Vec<TokenId>,
    pub node_states: Vec<NodeState>,
    pub routing_events: Vec<RoutingEventRecord>,
    pub batch_memberships: Vec<BatchMemberRecord>,
    pub fate: TokenFate,
}

impl Tables {
    fn fate_of(&self, token_id: &TokenId) -> Result<TokenFate> {
        self.token(token_id)?;
        let states = self.states_for_token(token_id);
        let last = states.last().copied();

        if let Some(member) = self.memberships_of(token_id).last() {
            let batch = self.batch(&member.batch_id)?;
            if last.map(|s| s.node_id()) == Some(&batch.aggregation_node_id) {
                return Ok(TokenFate::ConsumedInBatch {
                    batch_id: member.batch_id.clone(),
                });
            }
        }

        let children = self.children_of(token_id);
        if let Some(merged) = children.iter().find(|c| c.join_group_id.is_some()) {
            return Ok(TokenFate::Coalesced {
                merged_into: merged.token_id.clone(),
            });
        }
        if children.iter().any(|c| c.fork_group_id.is_some()) {
            return Ok(TokenFate::Forked {
                children: children.iter().map(|c| c.token_id.clone()).collect(),
            });
        }

        match last {
            None | Some(NodeState::Open(_)) => Ok(TokenFate::InFlight),
            Some(NodeState::Failed(failed)) if failed.error.kind == QUARANTINED => {
                Ok(TokenFate::Quarantined {
                    error: failed.error.clone(),
                })
            }
            Some(NodeState::Failed(failed)) => Ok(TokenFate::Failed {
                error: failed.error.clone(),
            }),
            Some(NodeState::Completed(done)) => {
                let run_id = self.token_run(token_id)?;
                let node = self.node(run_id, &done.node_id)?;
                if node.node_type != NodeType::Sink {
                    return Ok(TokenFate::InFlight);
                }
                let sink = done.node_id.clone();
                if self.was_routed_to(&states, &sink) {
                    Ok(TokenFate::Routed { sink })
                } else {
                    Ok(TokenFate::Completed { sink })
                }
            }
        }
    }

    /// Whether a routing decision on one of `states` diverted the token to `sink`.
    fn was_routed_to(&self, states: &[&NodeState], sink: &NodeId) -> bool {
        let state_ids: HashSet<_> = states.iter().map(|s| s.state_id()).collect();
        self.routing_events
            .iter()
            .filter(|e| state_ids.contains(&e.state_id) && e.destination != "continue")
            .filter_map(|e| e.edge_id.as_ref())
            .any(|edge_id| {
                self.edges
                    .iter()
                    .any(|edge| &edge.edge_id == edge_id && &edge.to_node_id == sink)
            })
    }

    fn ancestry_of(&self, token_id: &TokenId) -> Vec<TokenId> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        let mut queue: VecDeque<TokenId> = self.parents_of(token_id).into();
        while let Some(next) = queue.pop_front() {
            if !seen.insert(next.clone()) {
                continue;
            }
            queue.extend(self.parents_of(&next));
            out.push(next);
        }
        out
    }
}

impl Ledger {
    /// Derive the fate of a token from the links and states on record.
    pub fn token_fate(&self, token_id: &TokenId) -> Result<TokenFate> {
        self.read()?.fate_of(token_id)
    }

    /// Plugin names the token passed through, in step order. Retries of the
    /// same node appear once.
    pub fn trace_plugins(&self, token_id: &TokenId) -> Result<Vec<String>> {
        let tables = self.read()?;
        let run_id = tables.token_run(token_id)?.clone();
        let mut states = tables.states_for_token(token_id);
        states.sort_by_key(|s| (s.step_index(), s.attempt()));

        let mut plugins: Vec<String> = Vec::new();
        let mut last_node: Option<&NodeId> = None;
        for state in states {
            if last_node == Some(state.node_id()) {
                continue;
            }
            last_node = Some(state.node_id());
            plugins.push(tables.node(&run_id, state.node_id())?.plugin_name.clone());
        }
        Ok(plugins)
    }

    /// Every transitive ancestor of a token, nearest first.
    pub fn ancestry(&self, token_id: &TokenId) -> Result<Vec<TokenId>> {
        let tables = self.read()?;
        tables.token(token_id)?;
        Ok(tables.ancestry_of(token_id))
    }

    pub fn explain(&self, token_id: &TokenId) -> Result<TokenExplanation> {
        let tables = self.read()?;
        let token = tables.token(token_id)?.clone();
        let row = tables.row(&token.row_id)?.clone();
        let states = tables.states_for_token(token_id);
        let state_ids: HashSet<_> = states.iter().map(|s| s.state_id().clone()).collect();
        Ok(TokenExplanation {
            parents: tables.parents_of(token_id),
            ancestry: tables.ancestry_of(token_id),
            node_states: states.into_iter().cloned().collect(),
            routing_events: tables
                .routing_events
                .iter()
                .filter(|e| state_ids.contains(&e.state_id))
                .cloned()
                .collect(),
            batch_memberships: tables
                .memberships_of(token_id)
                .into_iter()
                .cloned()
                .collect(),
            fate: tables.fate_of(token_id)?,
            token,
            row,
        })
    }
}
