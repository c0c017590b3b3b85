use std::collections::{HashMap, HashSet, VecDeque};

use strand_core::event::{Event, InvocationRecord};
use strand_core::traits::InputBundle;
use strand_core::types::EventId;
use strand_graph::{InputPolicy, NodeSpec, NodeStatus, TriggerMode, WorkflowGraph};

/// Per-node satisfaction record: events delivered on each input topic but
/// not yet consumed by this node.
#[derive(Debug, Default)]
struct Satisfaction {
    pending: HashMap<String, VecDeque<Event>>,
    /// Bundle restored for a retry; served before pending events.
    rearmed: Option<InputBundle>,
    /// Already handed to the ready queue and not yet taken.
    enqueued: bool,
}

/// Decides which nodes are runnable as events arrive.
///
/// Readiness is a pure function of the satisfaction records, never of graph
/// traversal, which makes feedback cycles between nodes safe: an event
/// arriving on a cyclic topic simply lands in a pending queue like any
/// other.
pub struct DependencyResolver {
    records: Vec<Satisfaction>,
}

impl DependencyResolver {
    pub fn new(graph: &WorkflowGraph) -> Self {
        let records = graph
            .nodes()
            .iter()
            .map(|node| Satisfaction {
                pending: node
                    .inputs
                    .iter()
                    .map(|t| (t.clone(), VecDeque::new()))
                    .collect(),
                rearmed: None,
                enqueued: false,
            })
            .collect();
        Self { records }
    }

    /// Rebuild satisfaction state from a stored trace: every event on a
    /// node's input topics is pending unless some recorded invocation of
    /// that node already consumed it.
    pub fn restore(
        graph: &WorkflowGraph,
        events: &[Event],
        invocations: &[InvocationRecord],
    ) -> Self {
        let mut resolver = Self::new(graph);

        let mut consumed: HashMap<&str, HashSet<EventId>> = HashMap::new();
        for record in invocations {
            consumed
                .entry(record.node_id.as_str())
                .or_default()
                .extend(record.input_events.iter().copied());
        }

        for event in events {
            for idx in graph.consumers_of(&event.topic) {
                let node = &graph.nodes()[idx];
                if consumed
                    .get(node.id.as_str())
                    .is_some_and(|ids| ids.contains(&event.id))
                {
                    continue;
                }
                if let Some(queue) = resolver.records[idx].pending.get_mut(&event.topic) {
                    queue.push_back(event.clone());
                }
            }
        }

        resolver
    }

    fn satisfied(node: &NodeSpec, record: &Satisfaction) -> bool {
        match node.input_policy {
            InputPolicy::AllRequired => node
                .inputs
                .iter()
                .all(|t| record.pending.get(t).is_some_and(|q| !q.is_empty())),
            InputPolicy::AnyOf => record.pending.values().any(|q| !q.is_empty()),
        }
    }

    fn eligible(node: &NodeSpec, status: NodeStatus) -> bool {
        if status == NodeStatus::Failed {
            return false;
        }
        if node.trigger == TriggerMode::OneShot && status == NodeStatus::Succeeded {
            return false;
        }
        !matches!(status, NodeStatus::Running | NodeStatus::Retrying)
    }

    /// Deliver one event. Returns the indexes of nodes that just became
    /// runnable, in ascending declaration order, which is the deterministic
    /// tie-break for equally-ready nodes.
    pub fn on_event(
        &mut self,
        graph: &WorkflowGraph,
        event: &Event,
        statuses: &[NodeStatus],
    ) -> Vec<usize> {
        let mut ready = Vec::new();
        for idx in graph.consumers_of(&event.topic) {
            let node = &graph.nodes()[idx];
            if node.trigger == TriggerMode::OneShot
                && matches!(statuses[idx], NodeStatus::Succeeded | NodeStatus::Failed)
            {
                continue;
            }
            if statuses[idx] == NodeStatus::Failed {
                continue;
            }
            let record = &mut self.records[idx];
            if let Some(queue) = record.pending.get_mut(&event.topic) {
                queue.push_back(event.clone());
            }
            if !record.enqueued && Self::eligible(node, statuses[idx]) && Self::satisfied(node, record)
            {
                record.enqueued = true;
                ready.push(idx);
            }
        }
        ready
    }

    /// Re-evaluate one node after an invocation finished; recurring nodes
    /// may have accumulated fresh input while running. Returns true when
    /// the node should be enqueued again.
    pub fn recheck(&mut self, graph: &WorkflowGraph, idx: usize, statuses: &[NodeStatus]) -> bool {
        let node = &graph.nodes()[idx];
        let record = &mut self.records[idx];
        if record.enqueued || !Self::eligible(node, statuses[idx]) {
            return false;
        }
        if record.rearmed.is_some() || Self::satisfied(node, record) {
            record.enqueued = true;
            true
        } else {
            false
        }
    }

    /// Materialize the input bundle for a ready node: a re-armed retry
    /// bundle if one is pending, otherwise the pending events per the
    /// node's input policy, in causal (event id) order. AllRequired joins
    /// one queue drain per topic; AnyOf takes only the triggering topic's
    /// events (the one whose oldest pending event arrived first), never a
    /// join across siblings.
    ///
    /// Returns None when the node is no longer satisfied (a stale queue
    /// entry).
    pub fn take_bundle(&mut self, graph: &WorkflowGraph, idx: usize) -> Option<InputBundle> {
        let node = &graph.nodes()[idx];
        let record = &mut self.records[idx];
        record.enqueued = false;

        if let Some(bundle) = record.rearmed.take() {
            return Some(bundle);
        }
        if !Self::satisfied(node, record) {
            return None;
        }

        let mut events: Vec<Event> = Vec::new();
        match node.input_policy {
            InputPolicy::AllRequired => {
                for topic in &node.inputs {
                    if let Some(queue) = record.pending.get_mut(topic) {
                        events.extend(queue.drain(..));
                    }
                }
            }
            InputPolicy::AnyOf => {
                let trigger = node
                    .inputs
                    .iter()
                    .filter_map(|t| {
                        record
                            .pending
                            .get(t)
                            .and_then(|q| q.front())
                            .map(|e| (e.id, t.clone()))
                    })
                    .min()
                    .map(|(_, t)| t);
                if let Some(topic) = trigger {
                    if let Some(queue) = record.pending.get_mut(&topic) {
                        events.extend(queue.drain(..));
                    }
                }
            }
        }
        events.sort_by_key(|e| e.id);
        Some(InputBundle {
            node_id: node.id.clone(),
            events,
        })
    }

    /// Restore the same bundle for a retry, without requiring new events.
    pub fn re_arm(&mut self, idx: usize, bundle: InputBundle) {
        let record = &mut self.records[idx];
        record.rearmed = Some(bundle);
        record.enqueued = true;
    }

    /// Drop a node's satisfaction state after retry exhaustion or a
    /// permanent failure.
    pub fn clear(&mut self, idx: usize) {
        let record = &mut self.records[idx];
        record.rearmed = None;
        record.enqueued = false;
        for queue in record.pending.values_mut() {
            queue.clear();
        }
    }
}
