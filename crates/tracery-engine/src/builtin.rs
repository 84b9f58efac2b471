//! In-memory plugins for embedding and tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracery_types::{stable_hash, stable_hash_bytes, Determinism, Result, RowData, TraceryError};

use crate::plugin::{
    Aggregation, ArtifactDescriptor, GatePlugin, Plugin, Sink, Source, Transform, TransformResult,
};

/// Yields a fixed list of rows in order.
#[derive(Debug, Clone)]
pub struct VecSource {
    name: String,
    rows: VecDeque<RowData>,
}

impl VecSource {
    pub fn new(name: impl Into<String>, rows: impl IntoIterator<Item = RowData>) -> Self {
        Self {
            name: name.into(),
            rows: rows.into_iter().collect(),
        }
    }
}

impl Plugin for VecSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn determinism(&self) -> Determinism {
        Determinism::IoRead
    }
}

impl Source for VecSource {
    fn next_row(&mut self) -> Result<Option<RowData>> {
        Ok(self.rows.pop_front())
    }
}

// ---------------------------------------------------------------------------

type TransformFn = dyn Fn(RowData) -> Result<TransformResult> + Send + Sync;

/// Wraps a closure as a transform.
pub struct FnTransform {
    name: String,
    f: Box<TransformFn>,
}

impl FnTransform {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(RowData) -> Result<TransformResult> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

impl Plugin for FnTransform {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Transform for FnTransform {
    async fn process(&self, row: RowData) -> Result<TransformResult> {
        (self.f)(row)
    }
}

type RouteFn = dyn Fn(&RowData) -> Result<String> + Send + Sync;

/// Wraps a closure as a routing plugin.
pub struct FnGate {
    name: String,
    f: Box<RouteFn>,
}

impl FnGate {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&RowData) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

impl Plugin for FnGate {
    fn name(&self) -> &str {
        &self.name
    }
}

impl GatePlugin for FnGate {
    fn route(&self, row: &RowData) -> Result<String> {
        (self.f)(row)
    }
}

// ---------------------------------------------------------------------------

/// Accepts every row and flushes them back unchanged.
#[derive(Debug, Default)]
pub struct CollectAggregation {
    name: String,
    buffer: Vec<RowData>,
}

impl CollectAggregation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buffer: Vec::new(),
        }
    }
}

impl Plugin for CollectAggregation {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Aggregation for CollectAggregation {
    fn accept(&mut self, row: &RowData) -> Result<bool> {
        self.buffer.push(row.clone());
        Ok(true)
    }

    fn flush(&mut self) -> Result<Vec<RowData>> {
        Ok(std::mem::take(&mut self.buffer))
    }
}

// ---------------------------------------------------------------------------

/// Shared view of everything a [`MemorySink`] has written.
#[derive(Debug, Clone, Default)]
pub struct MemorySinkHandle {
    writes: Arc<Mutex<Vec<Vec<RowData>>>>,
}

impl MemorySinkHandle {
    /// Each write call's rows, in call order.
    pub fn writes(&self) -> Vec<Vec<RowData>> {
        self.writes.lock().map(|w| w.clone()).unwrap_or_default()
    }

    /// Every row written, flattened.
    pub fn rows(&self) -> Vec<RowData> {
        self.writes().into_iter().flatten().collect()
    }
}

/// Sink that keeps written rows in memory.
#[derive(Debug)]
pub struct MemorySink {
    name: String,
    handle: MemorySinkHandle,
    idempotent: bool,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handle: MemorySinkHandle::default(),
            idempotent: false,
        }
    }

    /// Key every artifact by its content hash so identical writes are
    /// recorded once.
    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }

    pub fn handle(&self) -> MemorySinkHandle {
        self.handle.clone()
    }
}

impl Plugin for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn write(&mut self, rows: &[RowData]) -> Result<ArtifactDescriptor> {
        let content_hash = stable_hash(rows)?;
        let size_bytes = stable_hash_bytes(rows)?.len() as u64;
        let index = {
            let mut writes = self
                .handle
                .writes
                .lock()
                .map_err(|_| TraceryError::Other(format!("sink '{}' buffer poisoned", self.name)))?;
            writes.push(rows.to_vec());
            writes.len() - 1
        };
        Ok(ArtifactDescriptor {
            artifact_type: "memory".into(),
            path_or_uri: format!("memory://{}/{index}", self.name),
            idempotency_key: self
                .idempotent
                .then(|| format!("{}:{content_hash}", self.name)),
            content_hash,
            size_bytes,
        })
    }
}
