use std::collections::{HashMap, HashSet};

use strand_core::error::{Result, StrandError};
use strand_core::event::EXTERNAL_PRODUCER;

use crate::node::NodeSpec;
use crate::topic::TopicRegistry;

/// Immutable workflow topology: nodes in declaration order plus the topic
/// registry wiring them together.
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    nodes: Vec<NodeSpec>,
    index: HashMap<String, usize>,
    registry: TopicRegistry,
}

impl WorkflowGraph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&NodeSpec> {
        self.index.get(id).map(|i| &self.nodes[*i])
    }

    /// Declaration index of a node, the deterministic dispatch tie-break.
    pub fn node_index(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn registry(&self) -> &TopicRegistry {
        &self.registry
    }

    /// Indexes of nodes subscribed to a topic, ascending declaration order.
    pub fn consumers_of(&self, topic: &str) -> Vec<usize> {
        self.registry
            .consumers_of(topic)
            .iter()
            .filter_map(|id| self.node_index(id))
            .collect()
    }

    /// Topics consumed by some node but produced by none: the injection
    /// points external triggers publish to.
    pub fn entry_topics(&self) -> Vec<&str> {
        let mut entries: Vec<&str> = self
            .registry
            .iter()
            .filter(|t| t.producers.is_empty() && !t.consumers.is_empty())
            .map(|t| t.name.as_str())
            .collect();
        entries.sort_unstable();
        entries
    }

    pub fn has_sink(&self) -> bool {
        self.nodes.iter().any(|n| n.sink)
    }
}

/// Builds and validates a [`WorkflowGraph`].
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<NodeSpec>,
    fan_in: Vec<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node. Declaration order is significant: it is the tie-break
    /// used when several nodes become runnable from the same event.
    pub fn node(mut self, spec: NodeSpec) -> Self {
        self.nodes.push(spec);
        self
    }

    /// Allow multiple producers on a topic (explicit aggregator input).
    pub fn fan_in_topic(mut self, name: impl Into<String>) -> Self {
        self.fan_in.push(name.into());
        self
    }

    /// Validate the wiring and freeze the topology.
    pub fn build(self) -> Result<WorkflowGraph> {
        let mut index = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            if node.id == EXTERNAL_PRODUCER {
                return Err(StrandError::Graph(format!(
                    "node id '{}' is reserved for externally injected events",
                    EXTERNAL_PRODUCER
                )));
            }
            if index.insert(node.id.clone(), i).is_some() {
                return Err(StrandError::DuplicateNode(node.id.clone()));
            }
            if node.inputs.is_empty() {
                return Err(StrandError::Graph(format!(
                    "node '{}' declares no input topics and can never run",
                    node.id
                )));
            }
            let mut seen = HashSet::new();
            for topic in &node.inputs {
                if !seen.insert(topic.as_str()) {
                    return Err(StrandError::Graph(format!(
                        "node '{}' subscribes to topic '{}' twice",
                        node.id, topic
                    )));
                }
            }
            let mut seen = HashSet::new();
            for out in &node.outputs {
                if !seen.insert(out.topic.as_str()) {
                    return Err(StrandError::Graph(format!(
                        "node '{}' declares output topic '{}' twice",
                        node.id, out.topic
                    )));
                }
            }
        }

        let mut registry = TopicRegistry::default();
        for node in &self.nodes {
            for topic in &node.inputs {
                registry.declare(topic).consumers.push(node.id.clone());
            }
            for out in &node.outputs {
                registry.declare(&out.topic).producers.push(node.id.clone());
            }
        }
        for name in &self.fan_in {
            registry.declare(name).fan_in = true;
        }

        for topic in registry.iter() {
            if topic.producers.len() > 1 && !topic.fan_in {
                return Err(StrandError::Graph(format!(
                    "topic '{}' has multiple producers ({}); declare it fan-in to aggregate",
                    topic.name,
                    topic.producers.join(", ")
                )));
            }
        }

        let graph = WorkflowGraph {
            nodes: self.nodes,
            index,
            registry,
        };

        if graph.entry_topics().is_empty() {
            return Err(StrandError::Graph(
                "workflow has no entry topic: every consumed topic already has a producer".into(),
            ));
        }

        Ok(graph)
    }
}
