use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tracing::debug;

use strand_core::config::RunPolicy;
use strand_core::error::{ExecutionError, Result, StrandError};
use strand_core::event::{Emission, InvocationStatus};
use strand_core::traits::{ExecutionStore, InputBundle, NodeContext, NodeExecutor};
use strand_graph::WorkflowGraph;
use strand_store::MemoryStore;

use crate::run::{RunReport, WorkflowRun};
use crate::scheduler::Scheduler;

/// Topic name guaranteed to be undeclared, used to reproduce a recorded
/// contract violation during replay.
const VIOLATION_TOPIC: &str = "__replay.contract_violation";

enum ScriptedOutcome {
    Emit(Vec<Emission>),
    Fail(ExecutionError),
}

/// Stub execution contract that replays a node's recorded behavior: each
/// invocation pops the next scripted outcome.
pub struct RecordedExecutor {
    script: Mutex<VecDeque<ScriptedOutcome>>,
}

impl RecordedExecutor {
    fn new(script: VecDeque<ScriptedOutcome>) -> Self {
        Self {
            script: Mutex::new(script),
        }
    }
}

impl NodeExecutor for RecordedExecutor {
    fn execute(
        &self,
        _bundle: InputBundle,
        _ctx: NodeContext,
    ) -> BoxFuture<'_, std::result::Result<Vec<Emission>, ExecutionError>> {
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());
        let result = match next {
            Some(ScriptedOutcome::Emit(emissions)) => Ok(emissions),
            Some(ScriptedOutcome::Fail(err)) => Err(err),
            None => Err(ExecutionError::Permanent(
                "no recorded outcome for this invocation".into(),
            )),
        };
        Box::pin(async move { result })
    }
}

/// Re-run a recorded trace through the resolver and scheduler with nodes
/// replaced by stubs returning the recorded outputs.
///
/// Dispatch is serialized (`max_parallel = 1`), so the stubbed re-execution
/// is fully deterministic: replaying the same source trace twice yields
/// identical invocation sequences. Returns the replay report and the fresh
/// store holding the replayed trace; compare with [`traces_match`].
pub async fn replay_run(
    graph: &WorkflowGraph,
    source: &dyn ExecutionStore,
    policy: RunPolicy,
) -> Result<(RunReport, Arc<MemoryStore>)> {
    let events = source.events()?;
    let invocations = source.invocations()?;
    let events_by_id: HashMap<_, _> = events.iter().map(|e| (e.id, e)).collect();

    // Per-node scripts in recorded invocation order.
    let mut scripts: HashMap<String, VecDeque<ScriptedOutcome>> = HashMap::new();
    for record in &invocations {
        let outcome = match record.status {
            InvocationStatus::Succeeded => {
                let mut emissions = Vec::new();
                for id in &record.output_events {
                    let event = events_by_id
                        .get(id)
                        .ok_or(StrandError::MissingParent { parent: *id })?;
                    emissions.push(Emission::new(event.topic.clone(), event.payload.clone()));
                }
                ScriptedOutcome::Emit(emissions)
            }
            InvocationStatus::FailedTransient => ScriptedOutcome::Fail(ExecutionError::Transient(
                record.error.clone().unwrap_or_default(),
            )),
            InvocationStatus::FailedPermanent | InvocationStatus::Cancelled => {
                ScriptedOutcome::Fail(ExecutionError::Permanent(
                    record.error.clone().unwrap_or_default(),
                ))
            }
            InvocationStatus::ContractViolation => ScriptedOutcome::Emit(vec![Emission::new(
                VIOLATION_TOPIC,
                serde_json::Value::Null,
            )]),
        };
        scripts
            .entry(record.node_id.clone())
            .or_default()
            .push_back(outcome);
    }

    // Same topology, stub executors.
    let mut builder = WorkflowGraph::builder();
    for node in graph.nodes() {
        let script = scripts.remove(&node.id).unwrap_or_default();
        builder = builder.node(
            node.clone()
                .with_executor(Arc::new(RecordedExecutor::new(script))),
        );
    }
    for topic in graph.registry().iter() {
        if topic.fan_in {
            builder = builder.fan_in_topic(topic.name.clone());
        }
    }
    let stub_graph = Arc::new(builder.build()?);

    // Fresh store seeded with the externally injected events, in id order.
    let store = Arc::new(MemoryStore::new());
    let run = WorkflowRun::new(stub_graph, store.clone(), policy.serial());
    let mut seeded = 0usize;
    for event in &events {
        if graph.get(&event.producer).is_none() {
            run.submit(&event.topic, event.payload.clone())?;
            seeded += 1;
        }
    }
    debug!(run_id = %run.run_id, seeded, "replaying recorded trace");

    let scheduler = Scheduler::new();
    let report = scheduler.run(&run).await?;
    Ok((report, store))
}

/// Compare two traces for replay determinism: the same event sequence and
/// the same invocation sequence (order and content).
pub fn traces_match(a: &dyn ExecutionStore, b: &dyn ExecutionStore) -> Result<bool> {
    let (a_events, b_events) = (a.events()?, b.events()?);
    if a_events.len() != b_events.len() {
        return Ok(false);
    }
    for (x, y) in a_events.iter().zip(&b_events) {
        if x.id != y.id
            || x.topic != y.topic
            || x.producer != y.producer
            || x.parents != y.parents
            || x.payload != y.payload
        {
            return Ok(false);
        }
    }

    let (a_inv, b_inv) = (a.invocations()?, b.invocations()?);
    if a_inv.len() != b_inv.len() {
        return Ok(false);
    }
    for (x, y) in a_inv.iter().zip(&b_inv) {
        if x.node_id != y.node_id
            || x.attempt != y.attempt
            || x.status != y.status
            || x.input_events != y.input_events
            || x.output_events != y.output_events
        {
            return Ok(false);
        }
    }
    Ok(true)
}
