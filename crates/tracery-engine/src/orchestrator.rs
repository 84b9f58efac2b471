//! Run orchestration.
//!
//! The [`Orchestrator`] opens a run in the ledger, registers the pipeline
//! graph, pulls rows from the source through a [`RowProcessor`], writes
//! sink-bound tokens, and closes the run with its final status.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracery_audit::{Ledger, NewArtifact};
use tracery_types::{
    not_found, stable_hash, ArtifactId, Clock, FailureDetail, NodeStateCompletion, Result, RowData,
    RowResult, RunId, RunStatus, SystemClock, TraceryError,
};

use crate::events::{EventEmitter, RunEvent};
use crate::graph::{sink_node_id, Pipeline};
use crate::plugin::Sink;
use crate::processor::RowProcessor;

/// Cooperative stop flag. Checked between source rows; pending batches and
/// barriers are still flushed before the run closes as `interrupted`.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub run_id: RunId,
    pub status: RunStatus,
    pub rows_processed: usize,
    /// Count of terminal outcomes by kind.
    pub outcomes: BTreeMap<String, usize>,
    pub artifacts: Vec<ArtifactId>,
    pub results: Vec<RowResult>,
}

impl RunResult {
    pub fn count(&self, kind: &str) -> usize {
        self.outcomes.get(kind).copied().unwrap_or_default()
    }
}

pub struct Orchestrator {
    ledger: Arc<Ledger>,
    clock: Arc<dyn Clock>,
    emitter: EventEmitter,
    shutdown: ShutdownSignal,
}

impl Orchestrator {
    pub fn new(ledger: Arc<Ledger>) -> Self {
        Self {
            ledger,
            clock: Arc::new(SystemClock::new()),
            emitter: EventEmitter::default(),
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Time source for batch ages and coalesce timeouts. Give the ledger the
    /// same clock (see [`Ledger::with_clock`]) to make its timestamps agree.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_emitter(mut self, emitter: EventEmitter) -> Self {
        self.emitter = emitter;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn events(&self) -> &EventEmitter {
        &self.emitter
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Execute `pipeline` to completion. A fatal error marks the run
    /// `failed` in the ledger before it is returned.
    pub async fn run(&self, pipeline: Pipeline) -> Result<RunResult> {
        let started = Instant::now();
        let run = self.ledger.begin_run(pipeline.describe()?)?;
        let run_id = run.run_id;
        tracing::info!(run_id = %run_id, nodes = pipeline.node_count(), "Run started");
        self.emitter.emit(RunEvent::RunStarted {
            run_id: run_id.clone(),
            node_count: pipeline.node_count(),
        });

        match self.execute(&run_id, pipeline).await {
            Ok(result) => {
                self.ledger.finish_run(&run_id, result.status)?;
                tracing::info!(
                    run_id = %run_id,
                    status = ?result.status,
                    rows = result.rows_processed,
                    "Run finished"
                );
                self.emitter.emit(RunEvent::RunFinished {
                    run_id,
                    status: result.status,
                    rows_processed: result.rows_processed,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                Ok(result)
            }
            Err(error) => {
                tracing::error!(run_id = %run_id, error = %error, "Run failed");
                if let Err(close) = self.ledger.finish_run(&run_id, RunStatus::Failed) {
                    tracing::error!(run_id = %run_id, error = %close, "Could not close failed run");
                }
                self.emitter.emit(RunEvent::RunFailed {
                    run_id,
                    error: error.to_string(),
                });
                Err(error)
            }
        }
    }

    async fn execute(&self, run_id: &RunId, pipeline: Pipeline) -> Result<RunResult> {
        pipeline.register(&self.ledger, run_id)?;
        let sink_step = pipeline.sink_step_index();
        let Pipeline {
            mut source,
            source_node,
            steps,
            mut sinks,
            settings,
        } = pipeline;

        let mut processor = RowProcessor::new(
            self.ledger.clone(),
            run_id.clone(),
            source_node,
            steps,
            &settings,
            self.clock.clone(),
            self.emitter.clone(),
        )?;
        let mut writer = SinkWriter {
            ledger: &self.ledger,
            run_id,
            step: sink_step,
            emitter: &self.emitter,
            sinks: &mut sinks,
            artifacts: Vec::new(),
        };

        let mut results = Vec::new();
        let mut rows_processed = 0;
        let mut status = RunStatus::Completed;
        loop {
            if self.shutdown.is_triggered() {
                tracing::warn!(run_id = %run_id, rows = rows_processed, "Shutdown requested, stopping");
                status = RunStatus::Interrupted;
                break;
            }
            let Some(row) = source.next_row()? else {
                break;
            };
            let row_index = rows_processed;
            let row_results = processor.process_row(row_index, row).await?;
            rows_processed += 1;
            if let Some(first) = row_results.first() {
                self.emitter.emit(RunEvent::RowProcessed {
                    row_index,
                    row_id: first.token.row_id.clone(),
                    outcomes: row_results.len(),
                });
            }
            writer.write(&row_results).await?;
            results.extend(row_results);
        }

        // A stop flushes held state the same way source exhaustion does.
        let flushed = processor.finish().await?;
        writer.write(&flushed).await?;
        results.extend(flushed);

        let open = self.ledger.open_node_states(run_id)?;
        if !open.is_empty() {
            return Err(TraceryError::InvariantViolation(format!(
                "{} node states still open at end of run",
                open.len()
            )));
        }

        let mut outcomes = BTreeMap::new();
        for result in &results {
            *outcomes.entry(result.outcome.kind().to_string()).or_insert(0) += 1;
        }
        Ok(RunResult {
            run_id: run_id.clone(),
            status,
            rows_processed,
            outcomes,
            artifacts: writer.artifacts,
            results,
        })
    }
}

// ---------------------------------------------------------------------------

/// Writes sink-bound tokens and records the states and artifacts.
struct SinkWriter<'a> {
    ledger: &'a Ledger,
    run_id: &'a RunId,
    step: usize,
    emitter: &'a EventEmitter,
    sinks: &'a mut BTreeMap<String, Box<dyn Sink>>,
    artifacts: Vec<ArtifactId>,
}

impl SinkWriter<'_> {
    /// One write call per sink, in sink-name order.
    async fn write(&mut self, results: &[RowResult]) -> Result<()> {
        let mut by_sink: BTreeMap<&str, Vec<&RowResult>> = BTreeMap::new();
        for result in results {
            if let Some(sink) = result.outcome.sink() {
                by_sink.entry(sink).or_default().push(result);
            }
        }
        for (name, batch) in by_sink {
            self.write_batch(name, &batch).await?;
        }
        Ok(())
    }

    async fn write_batch(&mut self, name: &str, batch: &[&RowResult]) -> Result<()> {
        let node_id = sink_node_id(name);
        let sink = self
            .sinks
            .get_mut(name)
            .ok_or_else(|| not_found("sink", name))?;

        let mut states = Vec::with_capacity(batch.len());
        for result in batch {
            let hash = stable_hash(&result.token.row_data)?;
            let state = self.ledger.begin_node_state(
                &result.token.token_id,
                &node_id,
                self.step,
                1,
                hash,
            )?;
            states.push(state.state_id);
        }

        let rows: Vec<RowData> = batch.iter().map(|r| r.token.row_data.clone()).collect();
        let descriptor = match sink.write(&rows).await {
            Ok(descriptor) => descriptor,
            Err(error) => {
                for state in &states {
                    let detail = FailureDetail::new("sink_error", error.to_string());
                    self.ledger
                        .complete_node_state(state, NodeStateCompletion::failed(detail))?;
                }
                tracing::error!(sink = %name, error = %error, "Sink write failed");
                return Err(error);
            }
        };

        let artifact = self.ledger.record_artifact(
            self.run_id,
            NewArtifact {
                produced_by_state_id: states[0].clone(),
                sink_node_id: node_id,
                artifact_type: descriptor.artifact_type,
                path_or_uri: descriptor.path_or_uri,
                content_hash: descriptor.content_hash.clone(),
                size_bytes: descriptor.size_bytes,
                idempotency_key: descriptor.idempotency_key,
            },
        )?;
        for state in &states {
            self.ledger.complete_node_state(
                state,
                NodeStateCompletion::completed_with(
                    &descriptor.content_hash,
                    json!({"artifact_id": artifact.artifact_id}),
                ),
            )?;
        }
        tracing::debug!(sink = %name, rows = rows.len(), artifact_id = %artifact.artifact_id, "Sink batch written");
        self.emitter.emit(RunEvent::ArtifactWritten {
            sink: name.to_string(),
            artifact_id: artifact.artifact_id.clone(),
            rows: rows.len(),
        });
        if !self.artifacts.contains(&artifact.artifact_id) {
            self.artifacts.push(artifact.artifact_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::{CollectAggregation, FnTransform, MemorySink, VecSource};
    use crate::config::{
        AggregationSettings, OutputMode, RunSettings, TransformSettings, TriggerConfig,
    };
    use crate::plugin::TransformResult;

    fn rows(n: i64) -> Vec<RowData> {
        (0..n)
            .map(|v| json!({"v": v}).as_object().cloned().unwrap_or_default())
            .collect()
    }

    #[tokio::test]
    async fn run_writes_rows_and_closes_completed() {
        let sink = MemorySink::new("out");
        let handle = sink.handle();
        let pipeline = Pipeline::builder(RunSettings::new("out"), VecSource::new("rows", rows(3)))
            .sink("out", sink)
            .build()
            .unwrap();
        let ledger = Arc::new(Ledger::new());
        let result = Orchestrator::new(ledger.clone()).run(pipeline).await.unwrap();

        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(result.rows_processed, 3);
        assert_eq!(result.count("completed"), 3);
        assert_eq!(handle.writes().len(), 3);
        assert_eq!(result.artifacts.len(), 3);
        assert_eq!(ledger.run(&result.run_id).unwrap().status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn triggered_shutdown_interrupts_before_first_row() {
        let pipeline = Pipeline::builder(RunSettings::new("out"), VecSource::new("rows", rows(3)))
            .sink("out", MemorySink::new("out"))
            .build()
            .unwrap();
        let ledger = Arc::new(Ledger::new());
        let orchestrator = Orchestrator::new(ledger.clone());
        orchestrator.shutdown_signal().trigger();
        let result = orchestrator.run(pipeline).await.unwrap();

        assert_eq!(result.status, RunStatus::Interrupted);
        assert_eq!(result.rows_processed, 0);
        assert_eq!(ledger.run(&result.run_id).unwrap().status, RunStatus::Interrupted);
    }

    #[tokio::test]
    async fn shutdown_mid_run_still_flushes_open_batches() {
        let orchestrator = Orchestrator::new(Arc::new(Ledger::new()));
        let stop = orchestrator.shutdown_signal();
        let sink = MemorySink::new("out");
        let handle = sink.handle();
        let pipeline = Pipeline::builder(RunSettings::new("out"), VecSource::new("rows", rows(4)))
            .transform(
                TransformSettings::new("stop_after_first"),
                FnTransform::new("stop_after_first", move |row| {
                    stop.trigger();
                    Ok(TransformResult::success(row))
                }),
            )
            .aggregation(
                AggregationSettings::new("all", TriggerConfig::count(10))
                    .output_mode(OutputMode::Passthrough),
                CollectAggregation::new("collect"),
            )
            .sink("out", sink)
            .build()
            .unwrap();
        let result = orchestrator.run(pipeline).await.unwrap();

        assert_eq!(result.status, RunStatus::Interrupted);
        assert_eq!(result.rows_processed, 1);
        assert_eq!(handle.rows(), rows(1));
        assert!(orchestrator
            .ledger()
            .open_node_states(&result.run_id)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn plugin_bug_fails_the_run() {
        let pipeline = Pipeline::builder(RunSettings::new("out"), VecSource::new("rows", rows(2)))
            .transform(
                TransformSettings::new("broken"),
                FnTransform::new("broken", |_| {
                    Err(TraceryError::Other("index out of range".into()))
                }),
            )
            .sink("out", MemorySink::new("out"))
            .build()
            .unwrap();
        let ledger = Arc::new(Ledger::new());
        let orchestrator = Orchestrator::new(ledger.clone());
        let mut events = orchestrator.events().subscribe();
        let err = orchestrator.run(pipeline).await.unwrap_err();
        assert!(err.to_string().contains("index out of range"));

        let runs = ledger.runs().unwrap();
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(matches!(events.recv().await.unwrap(), RunEvent::RunStarted { .. }));
        assert!(matches!(events.recv().await.unwrap(), RunEvent::RunFailed { .. }));
    }
}
