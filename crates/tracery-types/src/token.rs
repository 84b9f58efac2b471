//! The unit of lineage and its payload.

use serde::{Deserialize, Serialize};

use crate::ids::{GroupId, RowId, TokenId};

/// Row payload: a JSON object keyed by field name.
pub type RowData = serde_json::Map<String, serde_json::Value>;

/// One logical record travelling through the graph.
///
/// All tokens descended from the same source row share `row_id`. A token's
/// payload may change as transforms run; its identity never does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub token_id: TokenId,
    pub row_id: RowId,
    /// Set only on fork children.
    pub branch_name: Option<String>,
    /// Shared by all siblings produced by one fork.
    pub fork_group_id: Option<GroupId>,
    /// Set on the successor token produced by a coalesce.
    pub join_group_id: Option<GroupId>,
    pub row_data: RowData,
}

impl Token {
    /// Same identity, new payload.
    pub fn with_data(&self, row_data: RowData) -> Token {
        Token {
            row_data,
            ..self.clone()
        }
    }

    pub fn branch(&self) -> Option<&str> {
        self.branch_name.as_deref()
    }
}
