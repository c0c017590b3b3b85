use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use strand_core::config::RunPolicy;
use strand_core::error::{ExecutionError, Result};
use strand_core::event::{Emission, Event, EventDraft, InvocationRecord, InvocationStatus};
use strand_core::trace::{TraceBus, TraceEvent};
use strand_core::traits::{ExecutionStore, InputBundle, NodeContext};
use strand_core::types::{EventId, RunId};
use strand_graph::{ConcurrencyClass, NodeSpec, NodeStatus, WorkflowGraph};
use tokio_util::sync::CancellationToken;

use crate::resolver::DependencyResolver;
use crate::run::{RunReport, RunStatus, WorkflowRun, EXTERNAL_PRODUCER};

/// Outcome returned by a worker task.
enum DispatchOutcome {
    Executed {
        node_idx: usize,
        attempt: u32,
        bundle: InputBundle,
        result: std::result::Result<Vec<Emission>, ExecutionError>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    /// A retry backoff timer elapsed; the node may be enqueued again.
    RetryDue { node_idx: usize },
}

/// The control loop driving a workflow run.
///
/// Accepts newly produced events, asks the resolver for runnable nodes,
/// dispatches their execution on a worker pool, folds outputs back in as
/// new events, and repeats until quiescence or a termination condition.
/// Bookkeeping (event ingestion, readiness, queue management) stays on the
/// loop itself; only node `execute` calls run on workers.
pub struct Scheduler {
    trace: Arc<TraceBus>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            trace: Arc::new(TraceBus::default()),
        }
    }

    /// Share a trace bus with observability subscribers.
    pub fn with_trace(trace: Arc<TraceBus>) -> Self {
        Self { trace }
    }

    pub fn trace_bus(&self) -> Arc<TraceBus> {
        self.trace.clone()
    }

    /// Drive the run to quiescence or termination.
    ///
    /// Node-local failures never unwind out of here; they become invocation
    /// records and feed the report. The only errors returned are
    /// infrastructure failures (store I/O).
    pub async fn run(&self, run: &WorkflowRun) -> Result<RunReport> {
        let started = Instant::now();
        let mut state = RunLoop::restore(run, self.trace.clone())?;
        let mut workers: JoinSet<DispatchOutcome> = JoinSet::new();
        let mut inject_rx = run.take_inject_rx();
        let cancel = state.cancel.clone();
        let deadline = state
            .policy
            .wall_time()
            .map(|budget| tokio::time::Instant::now() + budget);

        self.trace.publish(TraceEvent::RunStarted {
            run_id: state.run_id.clone(),
        });
        info!(run_id = %state.run_id, nodes = state.graph.len(), "workflow run started");

        loop {
            state.settle_cancel();

            // Ingest externally injected events before deciding anything.
            if let Some(rx) = inject_rx.as_mut() {
                loop {
                    match rx.try_recv() {
                        Ok((topic, payload)) => state.deliver_external(topic, payload)?,
                        Err(mpsc::error::TryRecvError::Empty) => break,
                        Err(mpsc::error::TryRecvError::Disconnected) => {
                            inject_rx = None;
                            break;
                        }
                    }
                }
            }

            state.dispatch_ready(&mut workers);

            if state.outstanding == 0 {
                if state.verdict.is_some() || state.ready.is_empty() {
                    break;
                }
                continue;
            }

            let has_verdict = state.verdict.is_some();
            tokio::select! {
                joined = workers.join_next() => {
                    if let Some(joined) = joined {
                        state.outstanding -= 1;
                        match joined {
                            Ok(outcome) => state.on_outcome(&mut workers, outcome)?,
                            Err(e) => {
                                error!(run_id = %state.run_id, error = %e, "worker task failed to join");
                            }
                        }
                    }
                }
                injected = recv_injected(&mut inject_rx) => {
                    match injected {
                        Some((topic, payload)) => state.deliver_external(topic, payload)?,
                        None => inject_rx = None,
                    }
                }
                _ = cancel.cancelled(), if !has_verdict => {}
                _ = sleep_until_deadline(deadline), if !has_verdict && deadline.is_some() => {
                    warn!(run_id = %state.run_id, "wall-time budget exceeded, stopping run");
                    state.verdict = Some(RunStatus::TerminatedByPolicy);
                    cancel.cancel();
                }
            }
        }

        Ok(state.finish(started.elapsed().as_millis() as u64))
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn recv_injected(
    rx: &mut Option<mpsc::UnboundedReceiver<(String, serde_json::Value)>>,
) -> Option<(String, serde_json::Value)> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn contract_violation(node: &NodeSpec, emissions: &[Emission]) -> Option<String> {
    for emission in emissions {
        if !node.declares_output(&emission.topic) {
            return Some(format!(
                "emitted on undeclared topic '{}'",
                emission.topic
            ));
        }
    }
    for required in node.required_outputs() {
        if !emissions.iter().any(|e| e.topic == required) {
            return Some(format!("omitted required output topic '{}'", required));
        }
    }
    None
}

/// Mutable state of one run of the scheduler loop.
struct RunLoop {
    run_id: RunId,
    graph: Arc<WorkflowGraph>,
    store: Arc<dyn ExecutionStore>,
    trace: Arc<TraceBus>,
    policy: RunPolicy,
    cancel: CancellationToken,
    resolver: DependencyResolver,
    statuses: Vec<NodeStatus>,
    /// Attempts consumed for the node's current bundle; reset on success
    /// and on exhaustion.
    attempts: Vec<u32>,
    ever_succeeded: Vec<bool>,
    ready: VecDeque<usize>,
    verdict: Option<RunStatus>,
    dispatched: usize,
    in_flight_exec: usize,
    /// Everything spawned and not yet joined, retry timers included.
    outstanding: usize,
    exclusive_running: bool,
}

impl RunLoop {
    /// Build loop state from the run's stored trace. A fresh run simply
    /// sees its pre-submitted input events; an interrupted run picks up
    /// where the trace ends, re-arming a retry that was in flight.
    fn restore(run: &WorkflowRun, trace: Arc<TraceBus>) -> Result<Self> {
        let graph = run.graph().clone();
        let store = run.store().clone();
        let policy = run.policy().clone();

        let stored_events = store.events()?;
        let stored_invocations = store.invocations()?;
        let mut resolver = DependencyResolver::restore(&graph, &stored_events, &stored_invocations);

        let mut statuses = vec![NodeStatus::Idle; graph.len()];
        let mut attempts = vec![0u32; graph.len()];
        let mut ever_succeeded = vec![false; graph.len()];
        let mut ready = VecDeque::new();

        let events_by_id: HashMap<EventId, &Event> =
            stored_events.iter().map(|e| (e.id, e)).collect();

        for (idx, node) in graph.nodes().iter().enumerate() {
            let history: Vec<&InvocationRecord> = stored_invocations
                .iter()
                .filter(|r| r.node_id == node.id)
                .collect();
            if history
                .iter()
                .any(|r| r.status == InvocationStatus::Succeeded)
            {
                ever_succeeded[idx] = true;
                statuses[idx] = NodeStatus::Succeeded;
            }
            let Some(last) = history.last().copied() else {
                continue;
            };
            match last.status {
                InvocationStatus::FailedTransient => {
                    if last.attempt >= policy.retry.max_attempts {
                        statuses[idx] = NodeStatus::Failed;
                        resolver.clear(idx);
                    } else {
                        let mut events: Vec<Event> = last
                            .input_events
                            .iter()
                            .filter_map(|id| events_by_id.get(id).map(|e| (*e).clone()))
                            .collect();
                        events.sort_by_key(|e| e.id);
                        attempts[idx] = last.attempt;
                        resolver.re_arm(
                            idx,
                            InputBundle {
                                node_id: node.id.clone(),
                                events,
                            },
                        );
                        statuses[idx] = NodeStatus::Retrying;
                        ready.push_back(idx);
                        debug!(run_id = %run.run_id, node_id = %node.id, attempt = last.attempt, "re-armed interrupted retry");
                    }
                }
                InvocationStatus::FailedPermanent | InvocationStatus::ContractViolation => {
                    statuses[idx] = NodeStatus::Failed;
                    resolver.clear(idx);
                }
                InvocationStatus::Succeeded | InvocationStatus::Cancelled => {}
            }
        }

        // Nodes already satisfied by restored-but-unconsumed events.
        for idx in 0..graph.len() {
            if resolver.recheck(&graph, idx, &statuses) {
                statuses[idx] = NodeStatus::Runnable;
                ready.push_back(idx);
            }
        }

        Ok(Self {
            run_id: run.run_id.clone(),
            graph,
            store,
            trace,
            policy,
            cancel: run.cancel_token(),
            resolver,
            statuses,
            attempts,
            ever_succeeded,
            ready,
            verdict: None,
            dispatched: 0,
            in_flight_exec: 0,
            outstanding: 0,
            exclusive_running: false,
        })
    }

    fn settle_cancel(&mut self) {
        if self.verdict.is_none() && self.cancel.is_cancelled() {
            info!(run_id = %self.run_id, "run cancelled");
            self.verdict = Some(RunStatus::Cancelled);
        }
    }

    /// Record an externally injected event and feed it to the resolver.
    fn deliver_external(&mut self, topic: String, payload: serde_json::Value) -> Result<()> {
        let event = self
            .store
            .append_event(EventDraft::new(topic, payload, EXTERNAL_PRODUCER))?;
        self.trace.publish(TraceEvent::EventRecorded {
            run_id: self.run_id.clone(),
            event_id: event.id,
            topic: event.topic.clone(),
            producer: event.producer.clone(),
        });
        debug!(run_id = %self.run_id, event_id = %event.id, topic = %event.topic, "external event recorded");

        let graph = Arc::clone(&self.graph);
        let ready_now = self.resolver.on_event(&graph, &event, &self.statuses);
        for idx in ready_now {
            self.statuses[idx] = NodeStatus::Runnable;
            self.ready.push_back(idx);
        }
        Ok(())
    }

    /// Dispatch as many ready nodes as the concurrency constraints allow,
    /// preserving queue order for the rest.
    fn dispatch_ready(&mut self, workers: &mut JoinSet<DispatchOutcome>) {
        if self.verdict.is_some() || self.cancel.is_cancelled() {
            return;
        }
        let graph = Arc::clone(&self.graph);
        let max_parallel = self.policy.max_parallel.max(1);
        let mut deferred = VecDeque::new();

        while let Some(idx) = self.ready.pop_front() {
            if self.dispatched >= self.policy.max_steps {
                if self.verdict.is_none() {
                    warn!(
                        run_id = %self.run_id,
                        max_steps = self.policy.max_steps,
                        "step budget exhausted, stopping dispatch"
                    );
                    self.verdict = Some(RunStatus::TerminatedByPolicy);
                }
                deferred.push_back(idx);
                continue;
            }

            let node = &graph.nodes()[idx];
            let exclusive = node.concurrency == ConcurrencyClass::Exclusive;
            if self.in_flight_exec >= max_parallel || (exclusive && self.exclusive_running) {
                deferred.push_back(idx);
                continue;
            }

            let Some(bundle) = self.resolver.take_bundle(&graph, idx) else {
                // stale queue entry; the node is no longer satisfied
                if self.statuses[idx] == NodeStatus::Runnable {
                    self.statuses[idx] = NodeStatus::Idle;
                }
                continue;
            };

            let attempt = self.attempts[idx] + 1;
            self.statuses[idx] = NodeStatus::Running;
            self.dispatched += 1;
            self.in_flight_exec += 1;
            self.outstanding += 1;
            if exclusive {
                self.exclusive_running = true;
            }

            self.trace.publish(TraceEvent::NodeDispatched {
                run_id: self.run_id.clone(),
                node_id: node.id.clone(),
                attempt,
            });
            debug!(run_id = %self.run_id, node_id = %node.id, attempt, inputs = bundle.events.len(), "dispatching node");

            let executor = node.executor();
            let ctx = NodeContext {
                run_id: self.run_id.clone(),
                node_id: node.id.clone(),
                attempt,
                cancel: self.cancel.clone(),
            };
            workers.spawn(async move {
                let started_at = Utc::now();
                let result = AssertUnwindSafe(executor.execute(bundle.clone(), ctx))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| {
                        Err(ExecutionError::Permanent("node execution panicked".into()))
                    });
                let finished_at = Utc::now();
                DispatchOutcome::Executed {
                    node_idx: idx,
                    attempt,
                    bundle,
                    result,
                    started_at,
                    finished_at,
                }
            });
        }

        self.ready = deferred;
    }

    /// Fold one worker outcome back into the run state.
    fn on_outcome(
        &mut self,
        workers: &mut JoinSet<DispatchOutcome>,
        outcome: DispatchOutcome,
    ) -> Result<()> {
        match outcome {
            DispatchOutcome::RetryDue { node_idx } => {
                if self.verdict.is_none() && !self.cancel.is_cancelled() {
                    self.statuses[node_idx] = NodeStatus::Runnable;
                    self.ready.push_back(node_idx);
                }
                Ok(())
            }
            DispatchOutcome::Executed {
                node_idx,
                attempt,
                bundle,
                result,
                started_at,
                finished_at,
            } => {
                self.in_flight_exec -= 1;
                let graph = Arc::clone(&self.graph);
                let node = &graph.nodes()[node_idx];
                if node.concurrency == ConcurrencyClass::Exclusive {
                    self.exclusive_running = false;
                }
                let input_ids = bundle.event_ids();

                match result {
                    Ok(emissions) => self.on_success(
                        &graph,
                        node_idx,
                        attempt,
                        input_ids,
                        emissions,
                        started_at,
                        finished_at,
                    ),
                    Err(err) => self.on_failure(
                        workers,
                        node_idx,
                        attempt,
                        bundle,
                        err,
                        started_at,
                        finished_at,
                    ),
                }
            }
        }
    }

    fn on_success(
        &mut self,
        graph: &WorkflowGraph,
        node_idx: usize,
        attempt: u32,
        input_ids: Vec<EventId>,
        emissions: Vec<Emission>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        let node = &graph.nodes()[node_idx];

        if let Some(violation) = contract_violation(node, &emissions) {
            error!(run_id = %self.run_id, node_id = %node.id, %violation, "contract violation, aborting run");
            self.record_invocation(
                &node.id,
                attempt,
                input_ids,
                vec![],
                InvocationStatus::ContractViolation,
                Some(violation.clone()),
                started_at,
                finished_at,
            )?;
            self.statuses[node_idx] = NodeStatus::Failed;
            if self.verdict.is_none() {
                self.verdict = Some(RunStatus::Failed { cause: violation });
            }
            self.cancel.cancel();
            return Ok(());
        }

        let mut output_ids = Vec::new();
        let mut new_events = Vec::new();
        for emission in emissions {
            let draft = EventDraft::new(emission.topic, emission.payload, node.id.clone())
                .with_parents(input_ids.clone());
            let event = self.store.append_event(draft)?;
            self.trace.publish(TraceEvent::EventRecorded {
                run_id: self.run_id.clone(),
                event_id: event.id,
                topic: event.topic.clone(),
                producer: event.producer.clone(),
            });
            output_ids.push(event.id);
            new_events.push(event);
        }

        self.record_invocation(
            &node.id,
            attempt,
            input_ids,
            output_ids.clone(),
            InvocationStatus::Succeeded,
            None,
            started_at,
            finished_at,
        )?;
        self.statuses[node_idx] = NodeStatus::Succeeded;
        self.ever_succeeded[node_idx] = true;
        self.attempts[node_idx] = 0;
        debug!(run_id = %self.run_id, node_id = %node.id, attempt, outputs = output_ids.len(), "node succeeded");

        if node.sink && self.verdict.is_none() {
            info!(run_id = %self.run_id, node_id = %node.id, "completion signal received");
            self.verdict = Some(RunStatus::Completed);
            return Ok(());
        }

        for event in &new_events {
            let ready_now = self.resolver.on_event(graph, event, &self.statuses);
            for idx in ready_now {
                self.statuses[idx] = NodeStatus::Runnable;
                self.ready.push_back(idx);
            }
        }
        // the node itself may have accumulated input while it was running
        if self.resolver.recheck(graph, node_idx, &self.statuses) {
            self.statuses[node_idx] = NodeStatus::Runnable;
            self.ready.push_back(node_idx);
        }
        Ok(())
    }

    fn on_failure(
        &mut self,
        workers: &mut JoinSet<DispatchOutcome>,
        node_idx: usize,
        attempt: u32,
        bundle: InputBundle,
        err: ExecutionError,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        let graph = Arc::clone(&self.graph);
        let node = &graph.nodes()[node_idx];
        let input_ids = bundle.event_ids();

        if self.cancel.is_cancelled() {
            self.record_invocation(
                &node.id,
                attempt,
                input_ids,
                vec![],
                InvocationStatus::Cancelled,
                Some(err.to_string()),
                started_at,
                finished_at,
            )?;
            self.statuses[node_idx] = NodeStatus::Idle;
            return Ok(());
        }

        match err {
            ExecutionError::Transient(msg) => {
                self.record_invocation(
                    &node.id,
                    attempt,
                    input_ids,
                    vec![],
                    InvocationStatus::FailedTransient,
                    Some(msg.clone()),
                    started_at,
                    finished_at,
                )?;
                self.attempts[node_idx] = attempt;

                if attempt < self.policy.retry.max_attempts {
                    let backoff = self.policy.retry.backoff(attempt - 1);
                    warn!(
                        run_id = %self.run_id,
                        node_id = %node.id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %msg,
                        "transient node failure, retry scheduled"
                    );
                    self.resolver.re_arm(node_idx, bundle);
                    self.statuses[node_idx] = NodeStatus::Retrying;
                    self.trace.publish(TraceEvent::NodeRetryScheduled {
                        run_id: self.run_id.clone(),
                        node_id: node.id.clone(),
                        attempt: attempt + 1,
                        backoff_ms: backoff.as_millis() as u64,
                    });
                    self.outstanding += 1;
                    workers.spawn(async move {
                        tokio::time::sleep(backoff).await;
                        DispatchOutcome::RetryDue { node_idx }
                    });
                } else {
                    error!(
                        run_id = %self.run_id,
                        node_id = %node.id,
                        attempt,
                        error = %msg,
                        "retry budget exhausted, node failed"
                    );
                    self.statuses[node_idx] = NodeStatus::Failed;
                    self.attempts[node_idx] = 0;
                    self.resolver.clear(node_idx);
                }
            }
            ExecutionError::Permanent(msg) => {
                error!(run_id = %self.run_id, node_id = %node.id, attempt, error = %msg, "node failed permanently");
                self.record_invocation(
                    &node.id,
                    attempt,
                    input_ids,
                    vec![],
                    InvocationStatus::FailedPermanent,
                    Some(msg),
                    started_at,
                    finished_at,
                )?;
                self.statuses[node_idx] = NodeStatus::Failed;
                self.attempts[node_idx] = 0;
                self.resolver.clear(node_idx);
            }
        }
        Ok(())
    }

    fn record_invocation(
        &self,
        node_id: &str,
        attempt: u32,
        input_events: Vec<EventId>,
        output_events: Vec<EventId>,
        status: InvocationStatus,
        error: Option<String>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        self.store.append_invocation(InvocationRecord {
            run_id: self.run_id.clone(),
            node_id: node_id.to_string(),
            attempt,
            input_events: input_events.clone(),
            output_events: output_events.clone(),
            status,
            error,
            started_at,
            finished_at,
        })?;
        self.trace.publish(TraceEvent::NodeFinished {
            run_id: self.run_id.clone(),
            node_id: node_id.to_string(),
            attempt,
            status,
            input_events,
            output_events,
            duration_ms,
        });
        Ok(())
    }

    fn finish(self, elapsed_ms: u64) -> RunReport {
        let status = match self.verdict {
            Some(v) => v,
            None => {
                let complete = self.ever_succeeded.iter().all(|s| *s)
                    && !self.statuses.iter().any(|s| *s == NodeStatus::Failed);
                if complete {
                    RunStatus::Completed
                } else {
                    RunStatus::Quiescent
                }
            }
        };
        self.trace.publish(TraceEvent::RunFinished {
            run_id: self.run_id.clone(),
            status: status.to_string(),
        });
        info!(run_id = %self.run_id, status = %status, dispatched = self.dispatched, elapsed_ms, "workflow run finished");

        let node_statuses = self
            .graph
            .nodes()
            .iter()
            .zip(&self.statuses)
            .map(|(node, status)| (node.id.clone(), *status))
            .collect();

        RunReport {
            run_id: self.run_id,
            status,
            node_statuses,
            dispatched: self.dispatched,
            elapsed_ms,
        }
    }
}
