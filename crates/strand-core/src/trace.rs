use serde::Serialize;

use crate::event::InvocationStatus;
use crate::types::{EventId, RunId};

/// Structured span-equivalent record emitted by the scheduler, one per
/// durable event and node invocation.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEvent {
    RunStarted {
        run_id: RunId,
    },
    EventRecorded {
        run_id: RunId,
        event_id: EventId,
        topic: String,
        producer: String,
    },
    NodeDispatched {
        run_id: RunId,
        node_id: String,
        attempt: u32,
    },
    NodeFinished {
        run_id: RunId,
        node_id: String,
        attempt: u32,
        status: InvocationStatus,
        input_events: Vec<EventId>,
        output_events: Vec<EventId>,
        duration_ms: u64,
    },
    NodeRetryScheduled {
        run_id: RunId,
        node_id: String,
        attempt: u32,
        backoff_ms: u64,
    },
    RunFinished {
        run_id: RunId,
        status: String,
    },
}

/// Trace bus using tokio broadcast channel.
/// All subscribers receive all trace events.
pub struct TraceBus {
    tx: tokio::sync::broadcast::Sender<TraceEvent>,
}

impl TraceBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: TraceEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TraceEvent> {
        self.tx.subscribe()
    }
}

impl Default for TraceBus {
    fn default() -> Self {
        Self::new(256)
    }
}
