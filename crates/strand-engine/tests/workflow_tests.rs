use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use strand_core::config::{RetryPolicy, RunPolicy};
use strand_core::event::{Emission, InvocationStatus};
use strand_core::trace::TraceEvent;
use strand_core::traits::ExecutionStore;
use strand_engine::{replay_run, traces_match, RunManager, RunReport, RunStatus, Scheduler, WorkflowRun};
use strand_graph::{
    ConcurrencyClass, InputPolicy, NodeSpec, NodeStatus, TriggerMode, WorkflowGraph,
};
use strand_store::{MemoryStore, SqliteStore};
use strand_test_utils::{
    ConcurrencyProbe, FlakyExecutor, FnExecutor, PermanentFailure, ProbedExecutor, RelayExecutor,
    SilentExecutor, SlowExecutor, StaticExecutor,
};

fn fast_policy() -> RunPolicy {
    RunPolicy {
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
        },
        ..RunPolicy::default()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn drive(
    graph: WorkflowGraph,
    policy: RunPolicy,
    inputs: &[(&str, serde_json::Value)],
) -> (RunReport, Arc<MemoryStore>) {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let run = WorkflowRun::new(Arc::new(graph), store.clone(), policy);
    for (topic, payload) in inputs {
        run.submit(topic, payload.clone()).unwrap();
    }
    let report = Scheduler::new().run(&run).await.unwrap();
    (report, store)
}

fn linear_chain() -> WorkflowGraph {
    WorkflowGraph::builder()
        .node(
            NodeSpec::new("ingest", Arc::new(RelayExecutor::new("analyze.in")))
                .with_input("ingest.in")
                .with_output("analyze.in"),
        )
        .node(
            NodeSpec::new("analyze", Arc::new(RelayExecutor::new("respond.in")))
                .with_input("analyze.in")
                .with_output("respond.in"),
        )
        .node(NodeSpec::new("respond", Arc::new(SilentExecutor)).with_input("respond.in"))
        .build()
        .unwrap()
}

#[tokio::test]
async fn linear_chain_completes_in_order() {
    let (report, store) = drive(
        linear_chain(),
        fast_policy(),
        &[("ingest.in", json!({"q": "hello"}))],
    )
    .await;

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.dispatched, 3);

    let invocations = store.invocations().unwrap();
    assert_eq!(invocations.len(), 3);
    let order: Vec<&str> = invocations.iter().map(|r| r.node_id.as_str()).collect();
    assert_eq!(order, ["ingest", "analyze", "respond"]);
    assert!(invocations
        .iter()
        .all(|r| r.status == InvocationStatus::Succeeded));

    // causal provenance flows through the chain
    let events = store.events().unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[1].parents, vec![events[0].id]);
    assert_eq!(events[2].parents, vec![events[1].id]);
}

#[tokio::test]
async fn all_required_join_waits_for_both_topics() {
    let build = || {
        WorkflowGraph::builder()
            .node(
                NodeSpec::new("join", Arc::new(SilentExecutor))
                    .with_input("a")
                    .with_input("b"),
            )
            .build()
            .unwrap()
    };

    let (report, store) = drive(build(), fast_policy(), &[("a", json!(1))]).await;
    assert_eq!(report.status, RunStatus::Quiescent);
    assert!(store.invocations().unwrap().is_empty());
    assert_eq!(report.node_status("join"), Some(NodeStatus::Idle));

    let (report, store) = drive(build(), fast_policy(), &[("a", json!(1)), ("b", json!(2))]).await;
    assert_eq!(report.status, RunStatus::Completed);
    let invocations = store.invocations().unwrap();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].input_events.len(), 2);
}

#[tokio::test]
async fn any_of_fires_on_single_topic() {
    let graph = WorkflowGraph::builder()
        .node(
            NodeSpec::new("either", Arc::new(SilentExecutor))
                .with_input("a")
                .with_input("b")
                .with_input_policy(InputPolicy::AnyOf),
        )
        .build()
        .unwrap();

    let (report, store) = drive(graph, fast_policy(), &[("b", json!("only"))]).await;
    assert_eq!(report.status, RunStatus::Completed);
    let invocations = store.invocations().unwrap();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].input_events.len(), 1);
}

#[tokio::test]
async fn exclusive_nodes_never_overlap() {
    let probe = ConcurrencyProbe::new();
    let graph = WorkflowGraph::builder()
        .node(
            NodeSpec::new("ex1", Arc::new(ProbedExecutor::new(probe.clone(), 50, vec![])))
                .with_input("go")
                .with_concurrency(ConcurrencyClass::Exclusive),
        )
        .node(
            NodeSpec::new("ex2", Arc::new(ProbedExecutor::new(probe.clone(), 50, vec![])))
                .with_input("go")
                .with_concurrency(ConcurrencyClass::Exclusive),
        )
        .build()
        .unwrap();

    let (report, store) = drive(graph, fast_policy(), &[("go", json!(null))]).await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(probe.peak(), 1);

    // invocation windows are disjoint within the run
    let invocations = store.invocations().unwrap();
    assert_eq!(invocations.len(), 2);
    let (a, b) = (&invocations[0], &invocations[1]);
    assert!(a.finished_at <= b.started_at || b.finished_at <= a.started_at);
}

#[tokio::test]
async fn parallel_safe_nodes_do_overlap() {
    let probe = ConcurrencyProbe::new();
    let graph = WorkflowGraph::builder()
        .node(
            NodeSpec::new("p1", Arc::new(ProbedExecutor::new(probe.clone(), 100, vec![])))
                .with_input("go"),
        )
        .node(
            NodeSpec::new("p2", Arc::new(ProbedExecutor::new(probe.clone(), 100, vec![])))
                .with_input("go"),
        )
        .build()
        .unwrap();

    let (report, _) = drive(graph, fast_policy(), &[("go", json!(null))]).await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(probe.peak(), 2);
}

#[tokio::test]
async fn retry_exhaustion_produces_exactly_max_attempts() {
    let flaky = Arc::new(FlakyExecutor::always_transient());
    let graph = WorkflowGraph::builder()
        .node(NodeSpec::new("flaky", flaky.clone()).with_input("go"))
        .build()
        .unwrap();

    let (report, store) = drive(graph, fast_policy(), &[("go", json!(null))]).await;

    assert_eq!(report.status, RunStatus::Quiescent);
    assert_eq!(report.node_status("flaky"), Some(NodeStatus::Failed));
    assert_eq!(flaky.calls(), 3);

    let invocations = store.invocations().unwrap();
    assert_eq!(invocations.len(), 3);
    assert_eq!(
        invocations.iter().map(|r| r.attempt).collect::<Vec<_>>(),
        [1, 2, 3]
    );
    assert!(invocations
        .iter()
        .all(|r| r.status == InvocationStatus::FailedTransient));
    // the same bundle is re-armed on every attempt
    assert!(invocations
        .iter()
        .all(|r| r.input_events == invocations[0].input_events));
}

#[tokio::test]
async fn permanent_failure_never_retries_and_starves_downstream() {
    let graph = WorkflowGraph::builder()
        .node(
            NodeSpec::new("broken", Arc::new(PermanentFailure))
                .with_input("go")
                .with_optional_output("out"),
        )
        .node(NodeSpec::new("down", Arc::new(SilentExecutor)).with_input("out"))
        .build()
        .unwrap();

    let (report, store) = drive(graph, fast_policy(), &[("go", json!(null))]).await;

    // node-local, not fatal to the run: quiescent, not failed
    assert_eq!(report.status, RunStatus::Quiescent);
    assert_eq!(report.node_status("broken"), Some(NodeStatus::Failed));
    assert_eq!(report.node_status("down"), Some(NodeStatus::Idle));

    let invocations = store.invocations().unwrap();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].status, InvocationStatus::FailedPermanent);
    assert!(store.invocations_for("down").unwrap().is_empty());
}

#[tokio::test]
async fn transient_failures_recover_within_budget() {
    let graph = WorkflowGraph::builder()
        .node(
            NodeSpec::new(
                "shaky",
                Arc::new(FlakyExecutor::new(
                    2,
                    vec![Emission::new("out", json!("ok"))],
                )),
            )
            .with_input("go")
            .with_output("out"),
        )
        .node(NodeSpec::new("down", Arc::new(SilentExecutor)).with_input("out"))
        .build()
        .unwrap();

    let (report, store) = drive(graph, fast_policy(), &[("go", json!(null))]).await;
    assert_eq!(report.status, RunStatus::Completed);

    let shaky = store.invocations_for("shaky").unwrap();
    assert_eq!(shaky.len(), 3);
    assert_eq!(shaky[2].status, InvocationStatus::Succeeded);
    assert_eq!(store.invocations_for("down").unwrap().len(), 1);
}

#[tokio::test]
async fn undeclared_emission_aborts_run() {
    let graph = WorkflowGraph::builder()
        .node(
            NodeSpec::new(
                "rogue",
                Arc::new(StaticExecutor::single("undeclared.topic", json!(1))),
            )
            .with_input("go")
            .with_optional_output("ok.out"),
        )
        .node(NodeSpec::new("down", Arc::new(SilentExecutor)).with_input("ok.out"))
        .build()
        .unwrap();

    let (report, store) = drive(graph, fast_policy(), &[("go", json!(null))]).await;
    assert!(matches!(report.status, RunStatus::Failed { .. }));

    let invocations = store.invocations().unwrap();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].status, InvocationStatus::ContractViolation);
    // nothing recorded from the violating emission, no downstream dispatch
    assert_eq!(store.events().unwrap().len(), 1);
    assert!(store.invocations_for("down").unwrap().is_empty());
}

#[tokio::test]
async fn omitted_required_output_aborts_run() {
    let graph = WorkflowGraph::builder()
        .node(
            NodeSpec::new("quiet", Arc::new(SilentExecutor))
                .with_input("go")
                .with_output("must.out"),
        )
        .node(NodeSpec::new("down", Arc::new(SilentExecutor)).with_input("must.out"))
        .build()
        .unwrap();

    let (report, store) = drive(graph, fast_policy(), &[("go", json!(null))]).await;
    assert!(matches!(report.status, RunStatus::Failed { .. }));
    let invocations = store.invocations().unwrap();
    assert_eq!(invocations[0].status, InvocationStatus::ContractViolation);
    assert!(invocations[0]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("must.out")));
}

#[tokio::test]
async fn optional_output_may_be_skipped() {
    let graph = WorkflowGraph::builder()
        .node(
            NodeSpec::new("branch", Arc::new(SilentExecutor))
                .with_input("go")
                .with_optional_output("maybe.out"),
        )
        .node(NodeSpec::new("downstream", Arc::new(SilentExecutor)).with_input("maybe.out"))
        .build()
        .unwrap();

    let (report, store) = drive(graph, fast_policy(), &[("go", json!(null))]).await;

    // quiescent-but-incomplete: the branch never fed its consumer
    assert_eq!(report.status, RunStatus::Quiescent);
    assert_eq!(report.node_status("branch"), Some(NodeStatus::Succeeded));
    assert_eq!(report.node_status("downstream"), Some(NodeStatus::Idle));
    assert_eq!(store.invocations().unwrap().len(), 1);
}

#[tokio::test]
async fn conditional_branch_follows_payload() {
    let build = || {
        WorkflowGraph::builder()
            .node(
                NodeSpec::new(
                    "triage",
                    Arc::new(FnExecutor::new(|bundle| {
                        let urgent = bundle
                            .payloads()
                            .iter()
                            .any(|p| p["urgent"].as_bool().unwrap_or(false));
                        Ok(if urgent {
                            vec![Emission::new("escalate.in", json!("page the operator"))]
                        } else {
                            vec![]
                        })
                    })),
                )
                .with_input("ticket.in")
                .with_optional_output("escalate.in"),
            )
            .node(NodeSpec::new("escalate", Arc::new(SilentExecutor)).with_input("escalate.in"))
            .build()
            .unwrap()
    };

    let (report, store) = drive(
        build(),
        fast_policy(),
        &[("ticket.in", json!({"urgent": false}))],
    )
    .await;
    assert_eq!(report.status, RunStatus::Quiescent);
    assert!(store.invocations_for("escalate").unwrap().is_empty());

    let (report, store) = drive(
        build(),
        fast_policy(),
        &[("ticket.in", json!({"urgent": true}))],
    )
    .await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(store.invocations_for("escalate").unwrap().len(), 1);
}

#[tokio::test]
async fn replay_reproduces_linear_chain() {
    let graph = linear_chain();
    let store = Arc::new(MemoryStore::new());
    let run = WorkflowRun::new(Arc::new(graph.clone()), store.clone(), fast_policy());
    run.submit("ingest.in", json!("seed")).unwrap();
    let live = Scheduler::new().run(&run).await.unwrap();
    assert_eq!(live.status, RunStatus::Completed);

    let (first_report, first) = replay_run(&graph, store.as_ref(), fast_policy())
        .await
        .unwrap();
    assert_eq!(first_report.status, RunStatus::Completed);
    assert!(traces_match(store.as_ref(), first.as_ref()).unwrap());

    let (_, second) = replay_run(&graph, store.as_ref(), fast_policy())
        .await
        .unwrap();
    assert!(traces_match(first.as_ref(), second.as_ref()).unwrap());
}

#[tokio::test]
async fn replay_reproduces_recorded_retries() {
    let graph = WorkflowGraph::builder()
        .node(
            NodeSpec::new(
                "shaky",
                Arc::new(FlakyExecutor::new(
                    2,
                    vec![Emission::new("out", json!("ok"))],
                )),
            )
            .with_input("go")
            .with_output("out"),
        )
        .node(NodeSpec::new("down", Arc::new(SilentExecutor)).with_input("out"))
        .build()
        .unwrap();

    let store = Arc::new(MemoryStore::new());
    let run = WorkflowRun::new(Arc::new(graph.clone()), store.clone(), fast_policy());
    run.submit("go", json!(null)).unwrap();
    let live = Scheduler::new().run(&run).await.unwrap();
    assert_eq!(live.status, RunStatus::Completed);
    assert_eq!(store.invocations().unwrap().len(), 4);

    let (r1, s1) = replay_run(&graph, store.as_ref(), fast_policy())
        .await
        .unwrap();
    let (r2, s2) = replay_run(&graph, store.as_ref(), fast_policy())
        .await
        .unwrap();
    assert_eq!(r1.status, RunStatus::Completed);
    assert_eq!(r2.status, RunStatus::Completed);
    assert!(traces_match(s1.as_ref(), s2.as_ref()).unwrap());
    assert!(traces_match(store.as_ref(), s1.as_ref()).unwrap());
}

#[tokio::test]
async fn step_budget_terminates_feedback_loop() {
    let graph = WorkflowGraph::builder()
        .node(
            NodeSpec::new("ping", Arc::new(StaticExecutor::single("tick", json!(1))))
                .with_input("start")
                .with_input("tock")
                .with_input_policy(InputPolicy::AnyOf)
                .with_output("tick"),
        )
        .node(
            NodeSpec::new("pong", Arc::new(StaticExecutor::single("tock", json!(2))))
                .with_input("tick")
                .with_output("tock"),
        )
        .build()
        .unwrap();

    let policy = RunPolicy {
        max_steps: 7,
        ..fast_policy()
    };
    let (report, store) = drive(graph, policy, &[("start", json!(null))]).await;

    assert_eq!(report.status, RunStatus::TerminatedByPolicy);
    assert_eq!(report.dispatched, 7);
    assert_eq!(store.invocations().unwrap().len(), 7);
}

#[tokio::test]
async fn one_shot_node_fires_once_in_a_recurring_loop() {
    let graph = WorkflowGraph::builder()
        .node(
            NodeSpec::new("ping", Arc::new(StaticExecutor::single("tick", json!(1))))
                .with_input("start")
                .with_input("tock")
                .with_input_policy(InputPolicy::AnyOf)
                .with_output("tick"),
        )
        .node(
            NodeSpec::new("pong", Arc::new(StaticExecutor::single("tock", json!(2))))
                .with_input("tick")
                .with_output("tock"),
        )
        .node(
            NodeSpec::new("audit", Arc::new(SilentExecutor))
                .with_input("tick")
                .with_trigger(TriggerMode::OneShot),
        )
        .node(NodeSpec::new("watch", Arc::new(SilentExecutor)).with_input("tick"))
        .build()
        .unwrap();

    let policy = RunPolicy {
        max_steps: 12,
        ..fast_policy()
    };
    let (report, store) = drive(graph, policy, &[("start", json!(null))]).await;

    assert_eq!(report.status, RunStatus::TerminatedByPolicy);
    assert_eq!(store.invocations_for("audit").unwrap().len(), 1);
    assert!(store.invocations_for("watch").unwrap().len() > 1);
}

#[tokio::test]
async fn fan_in_topic_aggregates_two_producers() {
    let graph = WorkflowGraph::builder()
        .node(
            NodeSpec::new("left", Arc::new(StaticExecutor::single("merge.in", json!("L"))))
                .with_input("l.in")
                .with_output("merge.in"),
        )
        .node(
            NodeSpec::new("right", Arc::new(StaticExecutor::single("merge.in", json!("R"))))
                .with_input("r.in")
                .with_output("merge.in"),
        )
        .node(NodeSpec::new("merge", Arc::new(SilentExecutor)).with_input("merge.in"))
        .fan_in_topic("merge.in")
        .build()
        .unwrap();

    let policy = fast_policy().serial();
    let (report, store) = drive(graph, policy, &[("l.in", json!(null)), ("r.in", json!(null))]).await;

    assert_eq!(report.status, RunStatus::Completed);
    let merges = store.invocations_for("merge").unwrap();
    assert_eq!(merges.len(), 1);
    assert_eq!(merges[0].input_events.len(), 2);
}

#[tokio::test]
async fn sink_completion_signal_ends_run() {
    let graph = WorkflowGraph::builder()
        .node(
            NodeSpec::new(
                "emit",
                Arc::new(StaticExecutor::new(vec![
                    Emission::new("sink.in", json!(1)),
                    Emission::new("side.in", json!(2)),
                ])),
            )
            .with_input("go")
            .with_output("sink.in")
            .with_output("side.in"),
        )
        .node(
            NodeSpec::new("final", Arc::new(SilentExecutor))
                .with_input("sink.in")
                .with_completion_signal(),
        )
        .node(
            NodeSpec::new("side", Arc::new(SlowExecutor::new(200, vec![]))).with_input("side.in"),
        )
        .build()
        .unwrap();

    let (report, store) = drive(graph, fast_policy(), &[("go", json!(null))]).await;
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(store.invocations_for("final").unwrap().len(), 1);
}

#[tokio::test]
async fn cancellation_stops_dispatch_and_keeps_recorded_events() {
    let graph = WorkflowGraph::builder()
        .node(NodeSpec::new("slow", Arc::new(SlowExecutor::new(10_000, vec![]))).with_input("go"))
        .build()
        .unwrap();

    let store = Arc::new(MemoryStore::new());
    let run = WorkflowRun::new(Arc::new(graph), store.clone(), fast_policy());
    run.submit("go", json!(null)).unwrap();

    let cancel = run.cancel_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let report = Scheduler::new().run(&run).await.unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    // already-durably-recorded events remain in the store
    assert_eq!(store.events().unwrap().len(), 1);
    let invocations = store.invocations().unwrap();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].status, InvocationStatus::Cancelled);
}

#[tokio::test]
async fn wall_time_budget_terminates_run() {
    let graph = WorkflowGraph::builder()
        .node(NodeSpec::new("slow", Arc::new(SlowExecutor::new(10_000, vec![]))).with_input("go"))
        .build()
        .unwrap();

    let policy = RunPolicy {
        max_wall_time_secs: 1,
        ..fast_policy()
    };
    let (report, store) = drive(graph, policy, &[("go", json!(null))]).await;

    assert_eq!(report.status, RunStatus::TerminatedByPolicy);
    let invocations = store.invocations().unwrap();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].status, InvocationStatus::Cancelled);
}

#[tokio::test]
async fn interrupted_run_resumes_from_stored_trace() {
    let build = || {
        WorkflowGraph::builder()
            .node(
                NodeSpec::new("ingest", Arc::new(RelayExecutor::new("analyze.in")))
                    .with_input("ingest.in")
                    .with_output("analyze.in"),
            )
            .node(NodeSpec::new("analyze", Arc::new(SilentExecutor)).with_input("analyze.in"))
            .build()
            .unwrap()
    };

    let store = Arc::new(MemoryStore::new());

    // first run is cut short by a one-step budget
    let policy = RunPolicy {
        max_steps: 1,
        ..fast_policy()
    };
    let run = WorkflowRun::new(Arc::new(build()), store.clone(), policy);
    run.submit("ingest.in", json!("x")).unwrap();
    let report = Scheduler::new().run(&run).await.unwrap();
    assert_eq!(report.status, RunStatus::TerminatedByPolicy);
    assert_eq!(store.invocations().unwrap().len(), 1);

    // a fresh run over the same store picks up where the trace ends
    let resumed = WorkflowRun::new(Arc::new(build()), store.clone(), fast_policy());
    let report = Scheduler::new().run(&resumed).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);

    let invocations = store.invocations().unwrap();
    assert_eq!(invocations.len(), 2);
    assert_eq!(invocations[0].node_id, "ingest");
    assert_eq!(invocations[1].node_id, "analyze");
}

#[tokio::test]
async fn run_manager_control_surface() {
    let graph = WorkflowGraph::builder()
        .node(
            NodeSpec::new("echo", Arc::new(RelayExecutor::new("out")))
                .with_input("in")
                .with_output("out"),
        )
        .build()
        .unwrap();

    let manager = RunManager::default();
    let store = Arc::new(MemoryStore::new());
    let run = WorkflowRun::new(Arc::new(graph), store, fast_policy());

    // events can be fed through the injector before (and while) running
    let injector = run.injector();
    injector.inject("in", json!("via-injector")).unwrap();
    assert!(injector.inject("missing", json!(null)).is_err());

    let run_id = manager.start(run).unwrap();
    let report = manager.wait(&run_id).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(manager.status(&run_id).unwrap(), RunStatus::Completed);

    let (events, invocations) = manager.trace(&run_id).unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(invocations.len(), 1);
    assert_eq!(events[0].producer, strand_engine::EXTERNAL_PRODUCER);
    assert_eq!(events[1].producer, "echo");
}

#[tokio::test]
async fn run_manager_cancels_live_run() {
    let graph = WorkflowGraph::builder()
        .node(NodeSpec::new("slow", Arc::new(SlowExecutor::new(10_000, vec![]))).with_input("go"))
        .build()
        .unwrap();

    let manager = RunManager::default();
    let run = WorkflowRun::new(Arc::new(graph), Arc::new(MemoryStore::new()), fast_policy());
    run.submit("go", json!(null)).unwrap();

    let run_id = manager.start(run).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(manager.status(&run_id).unwrap(), RunStatus::Running);

    manager.cancel(&run_id).unwrap();
    let report = manager.wait(&run_id).await.unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
}

#[tokio::test]
async fn scheduler_publishes_span_records_on_trace_bus() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let run = WorkflowRun::new(Arc::new(linear_chain()), store, fast_policy());
    run.submit("ingest.in", json!("observed")).unwrap();

    let scheduler = Scheduler::new();
    let mut rx = scheduler.trace_bus().subscribe();
    let report = scheduler.run(&run).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    assert!(matches!(seen.first(), Some(TraceEvent::RunStarted { .. })));
    assert!(matches!(seen.last(), Some(TraceEvent::RunFinished { .. })));

    let finished: Vec<_> = seen
        .iter()
        .filter_map(|e| match e {
            TraceEvent::NodeFinished {
                node_id,
                status,
                input_events,
                output_events,
                ..
            } => Some((node_id.as_str(), *status, input_events, output_events)),
            _ => None,
        })
        .collect();
    assert_eq!(finished.len(), 3);
    assert_eq!(finished[0].0, "ingest");
    assert!(finished
        .iter()
        .all(|(_, status, _, _)| *status == InvocationStatus::Succeeded));
    // span records carry the consumed and produced event ids
    assert_eq!(finished[0].2.len(), 1);
    assert_eq!(finished[0].3.len(), 1);
}

#[tokio::test]
async fn run_over_sqlite_store_persists_trace() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trace.db");

    {
        let store = Arc::new(SqliteStore::open(&path).unwrap());
        let run = WorkflowRun::new(Arc::new(linear_chain()), store, fast_policy());
        run.submit("ingest.in", json!("persisted")).unwrap();
        let report = Scheduler::new().run(&run).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
    }

    // the trace survives the store handle
    let reopened = SqliteStore::open(&path).unwrap();
    let events = reopened.events().unwrap();
    let invocations = reopened.invocations().unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(invocations.len(), 3);
    assert_eq!(events[2].parents, vec![events[1].id]);
    assert_eq!(invocations[2].node_id, "respond");
}
