//! Pipeline execution engine: row processing, triggers, coalescing, and validation.
//!
//! This crate drives rows from a source through transforms, gates,
//! aggregations and coalesce barriers to sinks, recording every step in a
//! [`tracery_audit::Ledger`]. Scheduling uses an explicit, bounded work
//! queue per row; barriers and batches hold tokens across rows until their
//! policy or trigger releases them.

pub mod builtin;
pub mod coalesce;
pub mod config;
pub mod events;
pub mod gate;
pub mod graph;
pub mod orchestrator;
pub mod plugin;
pub mod processor;
pub mod retry;
pub mod tokens;
pub mod triggers;
pub mod validation;

pub use builtin::{CollectAggregation, FnGate, FnTransform, MemorySink, MemorySinkHandle, VecSource};
pub use coalesce::{Arrival, CoalesceExecutor, CoalesceFailure, CoalesceOutcome, CoalesceRelease};
pub use config::{
    AggregationSettings, CoalescePolicy, CoalesceSettings, ErrorDisposition, GateSettings,
    MergeStrategy, OutputMode, RouteTarget, RunSettings, TransformSettings, TriggerConfig,
};
pub use events::{EventEmitter, RunEvent};
pub use gate::{Gate, GateDecision};
pub use graph::{Pipeline, PipelineBuilder, Step, StepKind};
pub use orchestrator::{Orchestrator, RunResult, ShutdownSignal};
pub use plugin::{
    Aggregation, ArtifactDescriptor, GatePlugin, Plugin, Sink, Source, Transform, TransformResult,
};
pub use processor::{RowProcessor, WorkItem};
pub use retry::{BackoffPolicy, RetrySettings};
pub use tokens::TokenManager;
pub use triggers::TriggerEvaluator;
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};

pub use tracery_types::{Clock, ManualClock, SystemClock};
