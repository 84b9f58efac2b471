//! Contracts between the engine and the plugins it drives.
//!
//! Plugins never see tokens, the ledger, or coordination state; they receive
//! row payloads and return row payloads. Returning `Err` from a plugin method
//! means the plugin itself is broken and aborts the run, except for
//! [`TraceryError::PluginTransient`](tracery_types::TraceryError::PluginTransient)
//! which a transform's retry settings may absorb. Data problems a transform
//! anticipates are reported as [`TransformResult::Error`] instead.

use async_trait::async_trait;
use serde_json::Value;
use tracery_types::{Determinism, Result, RowData};

/// Identity recorded for every node a plugin backs.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn plugin_version(&self) -> &str {
        "0.1.0"
    }

    fn determinism(&self) -> Determinism {
        Determinism::Deterministic
    }
}

/// A finite, lazily pulled sequence of rows.
pub trait Source: Plugin {
    /// The next row, or `None` once the source is exhausted.
    fn next_row(&mut self) -> Result<Option<RowData>>;
}

/// Result of one transform call.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformResult {
    Success {
        row: RowData,
        metadata: Option<Value>,
    },
    /// A declared, anticipated failure for this row.
    Error { reason: Value },
}

impl TransformResult {
    pub fn success(row: RowData) -> Self {
        TransformResult::Success {
            row,
            metadata: None,
        }
    }

    pub fn success_with(row: RowData, metadata: Value) -> Self {
        TransformResult::Success {
            row,
            metadata: Some(metadata),
        }
    }

    pub fn error(reason: impl Into<Value>) -> Self {
        TransformResult::Error {
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait Transform: Plugin {
    async fn process(&self, row: RowData) -> Result<TransformResult>;
}

/// Routing decision made by plugin code instead of a condition.
pub trait GatePlugin: Plugin {
    /// The route label for `row`.
    fn route(&self, row: &RowData) -> Result<String>;
}

/// Batch-aware plugin. The engine decides when to flush; the plugin only
/// buffers and combines.
pub trait Aggregation: Plugin {
    /// Offer a row. `false` lets the row continue without joining the batch.
    fn accept(&mut self, row: &RowData) -> Result<bool>;

    /// Emit the combined rows for everything accepted since the last flush.
    fn flush(&mut self) -> Result<Vec<RowData>>;
}

/// What a sink wrote, as recorded in the artifact table.
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactDescriptor {
    pub artifact_type: String,
    pub path_or_uri: String,
    pub content_hash: String,
    pub size_bytes: u64,
    /// Writes sharing a key are recorded once.
    pub idempotency_key: Option<String>,
}

#[async_trait]
pub trait Sink: Plugin {
    async fn write(&mut self, rows: &[RowData]) -> Result<ArtifactDescriptor>;
}
