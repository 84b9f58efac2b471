//! Run event system for observability.
//!
//! Emits [`RunEvent`]s via a [`tokio::sync::broadcast`] channel so observers
//! can follow a run without touching the ledger while it is being written.

use serde::{Deserialize, Serialize};
use tracery_types::{ArtifactId, BatchId, RowId, RunId, RunStatus, TokenId, TriggerType};

/// Events emitted during a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        node_count: usize,
    },
    RunFinished {
        run_id: RunId,
        status: RunStatus,
        rows_processed: usize,
        duration_ms: u64,
    },
    RunFailed {
        run_id: RunId,
        error: String,
    },
    RowProcessed {
        row_index: usize,
        row_id: RowId,
        outcomes: usize,
    },
    TokenRetrying {
        node: String,
        token_id: TokenId,
        attempt: u32,
        delay_ms: u64,
    },
    BatchFlushed {
        node: String,
        batch_id: BatchId,
        trigger: TriggerType,
        members: usize,
    },
    CoalesceReleased {
        coalesce: String,
        row_id: RowId,
        merged_into: TokenId,
        branches: Vec<String>,
    },
    CoalesceFailed {
        coalesce: String,
        row_id: RowId,
        reason: String,
    },
    ArtifactWritten {
        sink: String,
        artifact_id: ArtifactId,
        rows: usize,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers. Dropped when nobody listens.
    pub fn emit(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emitter_sends_and_receives() {
        let emitter = EventEmitter::new(16);
        let mut rx = emitter.subscribe();

        emitter.emit(RunEvent::RunStarted {
            run_id: RunId::from("run-1"),
            node_count: 3,
        });

        match rx.recv().await.unwrap() {
            RunEvent::RunStarted { run_id, node_count } => {
                assert_eq!(run_id.as_str(), "run-1");
                assert_eq!(node_count, 3);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let emitter = EventEmitter::new(16);
        let mut rx1 = emitter.subscribe();
        let mut rx2 = emitter.subscribe();

        emitter.emit(RunEvent::BatchFlushed {
            node: "sum".into(),
            batch_id: BatchId::from("batch-1"),
            trigger: TriggerType::Count,
            members: 3,
        });

        let json1 = serde_json::to_string(&rx1.recv().await.unwrap()).unwrap();
        let json2 = serde_json::to_string(&rx2.recv().await.unwrap()).unwrap();
        assert_eq!(json1, json2);
    }

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let emitter = EventEmitter::new(16);
        emitter.emit(RunEvent::RunFailed {
            run_id: RunId::from("run-1"),
            error: "something went wrong".into(),
        });
    }
}
