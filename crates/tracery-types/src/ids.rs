//! Identifiers for every audited entity.
//!
//! Each id is an opaque string newtype. Generated ids carry a short prefix so a
//! ledger dump stays readable (`tok-3f2a...`, `batch-91c0...`).

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Generate a fresh, globally unique id.
            pub fn generate() -> Self {
                Self(format!("{}-{}", $prefix, uuid::Uuid::new_v4().simple()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

define_id!(
    /// One execution instance of a pipeline.
    RunId,
    "run"
);
define_id!(
    /// A registered graph vertex. Node ids are derived from the node's type and
    /// configured name, so they are stable across runs of the same pipeline.
    NodeId,
    "node"
);
define_id!(EdgeId, "edge");
define_id!(
    /// Identity of a source row, shared by every token descended from it.
    RowId,
    "row"
);
define_id!(TokenId, "tok");
define_id!(
    /// One node-state attempt.
    StateId,
    "state"
);
define_id!(BatchId, "batch");
define_id!(ArtifactId, "art");
define_id!(RoutingEventId, "evt");
define_id!(
    /// Links the siblings of one fork, or the parents of one coalesce.
    GroupId,
    "grp"
);

impl NodeId {
    /// Build the id for a node of the given kind and configured name.
    pub fn for_node(kind: &str, name: &str) -> Self {
        Self(format!("{kind}:{name}"))
    }
}
