//! Shared stub executors and fixtures for Strand crates' tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;

use strand_core::error::ExecutionError;
use strand_core::event::Emission;
use strand_core::traits::{InputBundle, NodeContext, NodeExecutor};

type ExecResult = Result<Vec<Emission>, ExecutionError>;

/// Emits a fixed set of emissions on every invocation.
pub struct StaticExecutor {
    emissions: Vec<Emission>,
}

impl StaticExecutor {
    pub fn new(emissions: Vec<Emission>) -> Self {
        Self { emissions }
    }

    /// Emit one payload on one topic.
    pub fn single(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self::new(vec![Emission::new(topic, payload)])
    }
}

impl NodeExecutor for StaticExecutor {
    fn execute(&self, _bundle: InputBundle, _ctx: NodeContext) -> BoxFuture<'_, ExecResult> {
        let out = self.emissions.clone();
        Box::pin(async move { Ok(out) })
    }
}

/// Forwards every consumed payload onto one output topic.
pub struct RelayExecutor {
    to: String,
}

impl RelayExecutor {
    pub fn new(to: impl Into<String>) -> Self {
        Self { to: to.into() }
    }
}

impl NodeExecutor for RelayExecutor {
    fn execute(&self, bundle: InputBundle, _ctx: NodeContext) -> BoxFuture<'_, ExecResult> {
        let out: Vec<Emission> = bundle
            .events
            .iter()
            .map(|e| Emission::new(self.to.clone(), e.payload.clone()))
            .collect();
        Box::pin(async move { Ok(out) })
    }
}

/// Succeeds without emitting anything.
pub struct SilentExecutor;

impl NodeExecutor for SilentExecutor {
    fn execute(&self, _bundle: InputBundle, _ctx: NodeContext) -> BoxFuture<'_, ExecResult> {
        Box::pin(async { Ok(vec![]) })
    }
}

/// Runs an arbitrary closure over the bundle.
pub struct FnExecutor {
    f: Box<dyn Fn(&InputBundle) -> ExecResult + Send + Sync>,
}

impl FnExecutor {
    pub fn new(f: impl Fn(&InputBundle) -> ExecResult + Send + Sync + 'static) -> Self {
        Self { f: Box::new(f) }
    }
}

impl NodeExecutor for FnExecutor {
    fn execute(&self, bundle: InputBundle, _ctx: NodeContext) -> BoxFuture<'_, ExecResult> {
        let result = (self.f)(&bundle);
        Box::pin(async move { result })
    }
}

/// Fails with a transient error the first `failures` times, then succeeds
/// with the given emissions.
pub struct FlakyExecutor {
    failures: u32,
    seen: AtomicU32,
    emissions: Vec<Emission>,
}

impl FlakyExecutor {
    pub fn new(failures: u32, emissions: Vec<Emission>) -> Self {
        Self {
            failures,
            seen: AtomicU32::new(0),
            emissions,
        }
    }

    /// Never stops failing transiently.
    pub fn always_transient() -> Self {
        Self::new(u32::MAX, vec![])
    }

    /// How many times execute has been entered.
    pub fn calls(&self) -> u32 {
        self.seen.load(Ordering::SeqCst)
    }
}

impl NodeExecutor for FlakyExecutor {
    fn execute(&self, _bundle: InputBundle, _ctx: NodeContext) -> BoxFuture<'_, ExecResult> {
        let n = self.seen.fetch_add(1, Ordering::SeqCst);
        let result = if n < self.failures {
            Err(ExecutionError::Transient(format!(
                "induced failure {}",
                n + 1
            )))
        } else {
            Ok(self.emissions.clone())
        };
        Box::pin(async move { result })
    }
}

/// Always fails permanently.
pub struct PermanentFailure;

impl NodeExecutor for PermanentFailure {
    fn execute(&self, _bundle: InputBundle, _ctx: NodeContext) -> BoxFuture<'_, ExecResult> {
        Box::pin(async { Err(ExecutionError::Permanent("induced permanent failure".into())) })
    }
}

/// Sleeps before emitting, honouring the cancellation signal. Used for
/// exercising concurrency, budgets, and cancellation.
pub struct SlowExecutor {
    delay: Duration,
    emissions: Vec<Emission>,
}

impl SlowExecutor {
    pub fn new(delay_ms: u64, emissions: Vec<Emission>) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            emissions,
        }
    }
}

impl NodeExecutor for SlowExecutor {
    fn execute(&self, _bundle: InputBundle, ctx: NodeContext) -> BoxFuture<'_, ExecResult> {
        let delay = self.delay;
        let out = self.emissions.clone();
        Box::pin(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => Ok(out),
                _ = ctx.cancel.cancelled() => {
                    Err(ExecutionError::Permanent("stopped at cancellation checkpoint".into()))
                }
            }
        })
    }
}

/// Tracks how many invocations are inside `execute` at once.
#[derive(Default)]
pub struct ConcurrencyProbe {
    current: AtomicU32,
    peak: AtomicU32,
}

impl ConcurrencyProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Highest number of simultaneous invocations observed.
    pub fn peak(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Holds a [`ConcurrencyProbe`] entered for the duration of each execute
/// call, with an artificial delay to force overlap where it is allowed.
pub struct ProbedExecutor {
    probe: Arc<ConcurrencyProbe>,
    delay: Duration,
    emissions: Vec<Emission>,
}

impl ProbedExecutor {
    pub fn new(probe: Arc<ConcurrencyProbe>, delay_ms: u64, emissions: Vec<Emission>) -> Self {
        Self {
            probe,
            delay: Duration::from_millis(delay_ms),
            emissions,
        }
    }
}

impl NodeExecutor for ProbedExecutor {
    fn execute(&self, _bundle: InputBundle, _ctx: NodeContext) -> BoxFuture<'_, ExecResult> {
        let probe = self.probe.clone();
        let delay = self.delay;
        let out = self.emissions.clone();
        Box::pin(async move {
            let now = probe.current.fetch_add(1, Ordering::SeqCst) + 1;
            probe.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            probe.current.fetch_sub(1, Ordering::SeqCst);
            Ok(out)
        })
    }
}
