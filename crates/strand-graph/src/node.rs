use std::sync::Arc;

use serde::{Deserialize, Serialize};

use strand_core::traits::NodeExecutor;

/// How a node's declared input topics gate readiness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputPolicy {
    /// Runnable only when every declared input topic has a pending event.
    #[default]
    AllRequired,
    /// Runnable as soon as any one input topic has a pending event; the
    /// bundle carries only the triggering events, not a join.
    AnyOf,
}

/// Whether a node's execution may overlap other nodes in the same run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyClass {
    /// May run concurrently with any other pending node.
    #[default]
    ParallelSafe,
    /// Serialized relative to all other exclusive nodes in the run.
    Exclusive,
}

/// How often a node may fire within one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Fires every time its input policy is satisfied by fresh events.
    #[default]
    Recurring,
    /// Fires at most once per run.
    OneShot,
}

/// Runtime status of a node within one run.
///
/// Topology is immutable after build; this is the only mutable facet, and
/// it lives in the run context rather than on the node itself.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    #[default]
    Idle,
    Runnable,
    Running,
    Retrying,
    Succeeded,
    Failed,
}

/// A declared output topic.
///
/// Required outputs must appear among every successful invocation's
/// emissions; optional outputs model conditional branches the node may
/// skip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSpec {
    pub topic: String,
    pub required: bool,
}

/// A unit of work wired into the workflow graph: declared input topics,
/// output topics, an execution contract, and its scheduling class.
#[derive(Clone)]
pub struct NodeSpec {
    pub id: String,
    pub inputs: Vec<String>,
    pub input_policy: InputPolicy,
    pub outputs: Vec<OutputSpec>,
    pub concurrency: ConcurrencyClass,
    pub trigger: TriggerMode,
    /// Sink with completion signal: the run completes when this node
    /// succeeds.
    pub sink: bool,
    executor: Arc<dyn NodeExecutor>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, executor: Arc<dyn NodeExecutor>) -> Self {
        Self {
            id: id.into(),
            inputs: vec![],
            input_policy: InputPolicy::default(),
            outputs: vec![],
            concurrency: ConcurrencyClass::default(),
            trigger: TriggerMode::default(),
            sink: false,
            executor,
        }
    }

    /// Subscribe to an input topic.
    pub fn with_input(mut self, topic: impl Into<String>) -> Self {
        self.inputs.push(topic.into());
        self
    }

    /// Declare a required output topic.
    pub fn with_output(mut self, topic: impl Into<String>) -> Self {
        self.outputs.push(OutputSpec {
            topic: topic.into(),
            required: true,
        });
        self
    }

    /// Declare an output topic the node may skip (conditional branch).
    pub fn with_optional_output(mut self, topic: impl Into<String>) -> Self {
        self.outputs.push(OutputSpec {
            topic: topic.into(),
            required: false,
        });
        self
    }

    /// Set the input policy.
    pub fn with_input_policy(mut self, policy: InputPolicy) -> Self {
        self.input_policy = policy;
        self
    }

    /// Set the concurrency class.
    pub fn with_concurrency(mut self, class: ConcurrencyClass) -> Self {
        self.concurrency = class;
        self
    }

    /// Set the trigger mode.
    pub fn with_trigger(mut self, trigger: TriggerMode) -> Self {
        self.trigger = trigger;
        self
    }

    /// Mark as a sink with completion signal.
    pub fn with_completion_signal(mut self) -> Self {
        self.sink = true;
        self
    }

    /// Replace the execution contract. Replay uses this to substitute
    /// recorded stubs for the real adapters.
    pub fn with_executor(mut self, executor: Arc<dyn NodeExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn executor(&self) -> Arc<dyn NodeExecutor> {
        self.executor.clone()
    }

    pub fn declares_output(&self, topic: &str) -> bool {
        self.outputs.iter().any(|o| o.topic == topic)
    }

    pub fn required_outputs(&self) -> impl Iterator<Item = &str> {
        self.outputs
            .iter()
            .filter(|o| o.required)
            .map(|o| o.topic.as_str())
    }
}

impl std::fmt::Debug for NodeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSpec")
            .field("id", &self.id)
            .field("inputs", &self.inputs)
            .field("input_policy", &self.input_policy)
            .field("outputs", &self.outputs)
            .field("concurrency", &self.concurrency)
            .field("trigger", &self.trigger)
            .field("sink", &self.sink)
            .finish()
    }
}
