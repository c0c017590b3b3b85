use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::{ExecutionError, Result};
use crate::event::{Emission, Event, EventDraft, InvocationRecord};
use crate::types::{EventId, RunId};

/// Per-invocation context handed to a node's execution contract.
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub run_id: RunId,
    pub node_id: String,
    /// 1-based attempt number for this invocation.
    pub attempt: u32,
    /// Cooperative cancellation signal. External collaborators are expected
    /// to check it at suspension points.
    pub cancel: CancellationToken,
}

/// The events consumed by one node invocation, in causal order (ascending
/// event id).
///
/// A bundle satisfies the node's input policy exactly once; a node is never
/// invoked with a partially satisfied bundle.
#[derive(Debug, Clone)]
pub struct InputBundle {
    pub node_id: String,
    pub events: Vec<Event>,
}

impl InputBundle {
    pub fn event_ids(&self) -> Vec<EventId> {
        self.events.iter().map(|e| e.id).collect()
    }

    /// Payloads in causal order, for contracts that only care about data.
    pub fn payloads(&self) -> Vec<&serde_json::Value> {
        self.events.iter().map(|e| &e.payload).collect()
    }

    /// Events delivered on one specific input topic.
    pub fn on_topic<'a>(&'a self, topic: &str) -> Vec<&'a Event> {
        self.events.iter().filter(|e| e.topic == topic).collect()
    }
}

/// Node execution contract: the unit of work behind each graph node.
///
/// Implemented by agent/tool adapters (LLM call wrappers, retrieval
/// adapters) outside this core. Side effects happen entirely inside this
/// boundary; retry is a scheduler-level decision, never the contract's.
pub trait NodeExecutor: Send + Sync + 'static {
    fn execute(
        &self,
        bundle: InputBundle,
        ctx: NodeContext,
    ) -> BoxFuture<'_, std::result::Result<Vec<Emission>, ExecutionError>>;
}

/// Append-only execution trace store: the durable source of truth for live
/// execution and after-the-fact inspection/replay.
pub trait ExecutionStore: Send + Sync + 'static {
    /// Record an event, assigning its id and timestamp. Returns the stored
    /// event once it is durably recorded.
    fn append_event(&self, draft: EventDraft) -> Result<Event>;

    /// Record one node invocation attempt.
    fn append_invocation(&self, record: InvocationRecord) -> Result<()>;

    /// Events with an id greater than `cursor`, in id order.
    fn events_since(&self, cursor: EventId) -> Result<Vec<Event>>;

    /// All events in id order.
    fn events(&self) -> Result<Vec<Event>> {
        self.events_since(EventId(0))
    }

    /// Invocation records for one node, in append order.
    fn invocations_for(&self, node_id: &str) -> Result<Vec<InvocationRecord>>;

    /// All invocation records, in append order.
    fn invocations(&self) -> Result<Vec<InvocationRecord>>;
}
