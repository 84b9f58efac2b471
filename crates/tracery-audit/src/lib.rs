//! Append-only audit ledger for the Tracery execution engine.
//!
//! The [`Ledger`] holds the conceptual tables `runs, nodes, edges, rows,
//! tokens, token_parents, node_states, batches, batch_members, artifacts,
//! routing_events`. Every component of a run writes through it, and lineage
//! questions (which plugins touched a token, what became of it) are answered
//! from it alone.

pub mod export;
pub mod ledger;
pub mod lineage;
pub mod records;

pub use export::{load_export, save_export, RunExport};
pub use ledger::Ledger;
pub use lineage::{TokenExplanation, TokenFate, QUARANTINED};
pub use records::{
    ArtifactRecord, BatchMemberRecord, BatchRecord, EdgeRecord, NewArtifact, NewRoutingEvent,
    NodeRecord, NodeRegistration, RoutingEventRecord, RowRecord, RunRecord, TokenParentRecord,
    TokenRecord,
};
