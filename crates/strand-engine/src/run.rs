use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use strand_core::config::RunPolicy;
use strand_core::error::{Result, StrandError};
use strand_core::event::{Event, EventDraft};
use strand_core::traits::ExecutionStore;
use strand_core::types::RunId;
use strand_graph::{NodeStatus, WorkflowGraph};

pub use strand_core::event::EXTERNAL_PRODUCER;

/// Terminal (or in-flight) status of a workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// The scheduler loop is still driving the run.
    Running,
    /// Every node succeeded, or a sink with completion signal succeeded.
    Completed,
    /// No node is runnable and no dispatch is outstanding, but some node
    /// never succeeded. Not an error; the caller interprets it.
    Quiescent,
    /// Step or wall-time budget exhausted.
    TerminatedByPolicy,
    /// Cancelled through the run control surface.
    Cancelled,
    /// Aborted, e.g. by a contract violation.
    Failed { cause: String },
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Quiescent => write!(f, "quiescent"),
            Self::TerminatedByPolicy => write!(f, "terminated_by_policy"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Failed { cause } => write!(f, "failed: {}", cause),
        }
    }
}

/// Final report returned by the scheduler: the terminal reason plus
/// per-node statuses. No node-local failure escapes as an error; it is all
/// in here.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: RunId,
    pub status: RunStatus,
    /// (node id, final status) in declaration order.
    pub node_statuses: Vec<(String, NodeStatus)>,
    /// Node invocations dispatched over the whole run.
    pub dispatched: usize,
    pub elapsed_ms: u64,
}

impl RunReport {
    pub fn node_status(&self, id: &str) -> Option<NodeStatus> {
        self.node_statuses
            .iter()
            .find(|(n, _)| n == id)
            .map(|(_, s)| *s)
    }
}

type InjectedEvent = (String, serde_json::Value);

/// Handle for feeding events into a live run.
///
/// The payload is appended to the store and delivered by the scheduler
/// loop; subscribe to the trace bus for the recorded event id.
#[derive(Clone)]
pub struct Injector {
    graph: Arc<WorkflowGraph>,
    tx: mpsc::UnboundedSender<InjectedEvent>,
}

impl Injector {
    pub fn inject(&self, topic: &str, payload: serde_json::Value) -> Result<()> {
        if !self.graph.registry().contains(topic) {
            return Err(StrandError::UnknownTopic(topic.to_string()));
        }
        self.tx
            .send((topic.to_string(), payload))
            .map_err(|_| StrandError::Cancelled)
    }
}

/// Per-run context: the graph, this run's store, termination policy, and
/// cancellation.
///
/// Runs are independently instantiable; nothing here is process-global.
pub struct WorkflowRun {
    pub run_id: RunId,
    graph: Arc<WorkflowGraph>,
    store: Arc<dyn ExecutionStore>,
    policy: RunPolicy,
    cancel: CancellationToken,
    inject_tx: mpsc::UnboundedSender<InjectedEvent>,
    inject_rx: Mutex<Option<mpsc::UnboundedReceiver<InjectedEvent>>>,
}

impl WorkflowRun {
    pub fn new(
        graph: Arc<WorkflowGraph>,
        store: Arc<dyn ExecutionStore>,
        policy: RunPolicy,
    ) -> Self {
        let (inject_tx, inject_rx) = mpsc::unbounded_channel();
        Self {
            run_id: RunId::new(),
            graph,
            store,
            policy,
            cancel: CancellationToken::new(),
            inject_tx,
            inject_rx: Mutex::new(Some(inject_rx)),
        }
    }

    pub fn graph(&self) -> &Arc<WorkflowGraph> {
        &self.graph
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn policy(&self) -> &RunPolicy {
        &self.policy
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the run: new dispatch halts immediately and in-flight executes
    /// see the signal at their next cooperative checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Inject an external trigger event, durably recorded before this
    /// returns. The scheduler picks it up when the run starts (or resumes).
    pub fn submit(&self, topic: &str, payload: serde_json::Value) -> Result<Event> {
        if !self.graph.registry().contains(topic) {
            return Err(StrandError::UnknownTopic(topic.to_string()));
        }
        self.store
            .append_event(EventDraft::new(topic, payload, EXTERNAL_PRODUCER))
    }

    /// Handle for feeding events into the run while it is live.
    pub fn injector(&self) -> Injector {
        Injector {
            graph: self.graph.clone(),
            tx: self.inject_tx.clone(),
        }
    }

    pub(crate) fn take_inject_rx(&self) -> Option<mpsc::UnboundedReceiver<InjectedEvent>> {
        self.inject_rx.lock().ok().and_then(|mut guard| guard.take())
    }
}
