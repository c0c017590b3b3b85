//! Workflow topology: nodes, topics, and the validated graph.
//!
//! A workflow is a directed graph of [`NodeSpec`]s connected by named
//! topics. Nodes declare the topics they consume and produce; the
//! [`GraphBuilder`] validates the wiring and yields an immutable
//! [`WorkflowGraph`] for the engine to execute against. Declaration order
//! is significant: it is the deterministic tie-break used when several
//! nodes become runnable from the same event.

pub mod graph;
pub mod node;
pub mod topic;

pub use graph::{GraphBuilder, WorkflowGraph};
pub use node::{ConcurrencyClass, InputPolicy, NodeSpec, NodeStatus, OutputSpec, TriggerMode};
pub use topic::{Topic, TopicRegistry};
