use thiserror::Error;

use crate::types::EventId;

/// Error raised inside a node's execution contract.
///
/// The scheduler converts these into invocation records; they never unwind
/// the run loop.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionError {
    /// Eligible for retry under the run's retry policy.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Node-local terminal failure; the node is marked failed without retry.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

#[derive(Debug, Error)]
pub enum StrandError {
    // Graph errors
    #[error("graph error: {0}")]
    Graph(String),

    #[error("duplicate node id: {0}")]
    DuplicateNode(String),

    #[error("unknown topic: {0}")]
    UnknownTopic(String),

    // Contract errors
    #[error("contract violation by node '{node}': {detail}")]
    ContractViolation { node: String, detail: String },

    // Store errors
    #[error("store error: {0}")]
    Store(String),

    #[error("event parent {parent} not found in store")]
    MissingParent { parent: EventId },

    // Run errors
    #[error("run cancelled")]
    Cancelled,

    #[error("run not found: {0}")]
    RunNotFound(String),

    // Config errors
    #[error("config error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StrandError>;
