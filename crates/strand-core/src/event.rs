use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{EventId, RunId};

/// Producer name recorded on externally injected events. Reserved: no node
/// may use it as its id, so provenance always distinguishes external input
/// from node output.
pub const EXTERNAL_PRODUCER: &str = "workflow";

/// An immutable record of a value produced on a topic.
///
/// Events are owned by the execution store for their lifetime; every other
/// component holds references or clones of the stored record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub topic: String,
    /// Opaque to the core; nodes agree on the shape per topic.
    pub payload: serde_json::Value,
    /// Node id that produced this event, or an external producer name for
    /// injected input.
    pub producer: String,
    /// Causal provenance: ids of the events consumed to produce this one.
    pub parents: Vec<EventId>,
    pub timestamp: DateTime<Utc>,
}

/// An event that has not been recorded yet.
///
/// The store assigns the id and timestamp at append time; drafts never leave
/// the scheduler's ingestion path.
#[derive(Debug, Clone)]
pub struct EventDraft {
    pub topic: String,
    pub payload: serde_json::Value,
    pub producer: String,
    pub parents: Vec<EventId>,
}

impl EventDraft {
    pub fn new(
        topic: impl Into<String>,
        payload: serde_json::Value,
        producer: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload,
            producer: producer.into(),
            parents: vec![],
        }
    }

    pub fn with_parents(mut self, parents: Vec<EventId>) -> Self {
        self.parents = parents;
        self
    }
}

/// A (topic, payload) pair returned by a node execution.
///
/// The scheduler validates the topic against the node's declared outputs and
/// materializes the stored event, attaching provenance from the consumed
/// bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Emission {
    pub topic: String,
    pub payload: serde_json::Value,
}

impl Emission {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }
}

/// Outcome of a single node execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStatus {
    Succeeded,
    /// Failed with a transient error; another attempt may follow.
    FailedTransient,
    /// Failed with a permanent error; the node will not retry.
    FailedPermanent,
    /// The node broke its output contract; fatal to the run.
    ContractViolation,
    /// The attempt was cancelled before completing.
    Cancelled,
}

impl std::fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Succeeded => "succeeded",
            Self::FailedTransient => "failed_transient",
            Self::FailedPermanent => "failed_permanent",
            Self::ContractViolation => "contract_violation",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Durable log entry for one node execution attempt.
///
/// Append-only: a retry appends a fresh record with an incremented attempt
/// number; prior attempts remain for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub run_id: RunId,
    pub node_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Ids of the events consumed by this attempt, in causal order.
    pub input_events: Vec<EventId>,
    /// Ids of the events produced by this attempt (empty on failure).
    pub output_events: Vec<EventId>,
    pub status: InvocationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}
