use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::error;

use strand_core::error::{Result, StrandError};
use strand_core::event::{Event, InvocationRecord};
use strand_core::trace::TraceBus;
use strand_core::traits::ExecutionStore;
use strand_core::types::RunId;

use crate::run::{Injector, RunReport, RunStatus, WorkflowRun};
use crate::scheduler::Scheduler;

struct ManagedRun {
    cancel: CancellationToken,
    store: Arc<dyn ExecutionStore>,
    injector: Injector,
    status_rx: watch::Receiver<RunStatus>,
    report: Arc<Mutex<Option<RunReport>>>,
}

/// Run control surface: start, cancel, status, trace.
///
/// Tracks every spawned run; multiple concurrent runs are independent,
/// each with its own store and cancellation token, sharing only the
/// scheduler's trace bus.
pub struct RunManager {
    scheduler: Arc<Scheduler>,
    runs: Mutex<HashMap<RunId, ManagedRun>>,
}

impl RunManager {
    pub fn new(scheduler: Scheduler) -> Self {
        Self {
            scheduler: Arc::new(scheduler),
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn trace_bus(&self) -> Arc<TraceBus> {
        self.scheduler.trace_bus()
    }

    /// Spawn the scheduler loop for a run and return its id immediately.
    pub fn start(&self, run: WorkflowRun) -> Result<RunId> {
        let run_id = run.run_id.clone();
        let cancel = run.cancel_token();
        let store = run.store().clone();
        let injector = run.injector();
        let (status_tx, status_rx) = watch::channel(RunStatus::Running);
        let report_slot = Arc::new(Mutex::new(None));

        let scheduler = self.scheduler.clone();
        let slot = report_slot.clone();
        let rid = run_id.clone();
        tokio::spawn(async move {
            let report = match scheduler.run(&run).await {
                Ok(report) => report,
                Err(e) => {
                    error!(run_id = %rid, error = %e, "workflow run aborted by internal error");
                    RunReport {
                        run_id: rid.clone(),
                        status: RunStatus::Failed {
                            cause: e.to_string(),
                        },
                        node_statuses: vec![],
                        dispatched: 0,
                        elapsed_ms: 0,
                    }
                }
            };
            let status = report.status.clone();
            if let Ok(mut guard) = slot.lock() {
                *guard = Some(report);
            }
            let _ = status_tx.send(status);
        });

        self.runs
            .lock()
            .map_err(|e| StrandError::Store(e.to_string()))?
            .insert(
                run_id.clone(),
                ManagedRun {
                    cancel,
                    store,
                    injector,
                    status_rx,
                    report: report_slot,
                },
            );
        Ok(run_id)
    }

    pub fn cancel(&self, run_id: &RunId) -> Result<()> {
        let runs = self
            .runs
            .lock()
            .map_err(|e| StrandError::Store(e.to_string()))?;
        let managed = runs
            .get(run_id)
            .ok_or_else(|| StrandError::RunNotFound(run_id.to_string()))?;
        managed.cancel.cancel();
        Ok(())
    }

    pub fn status(&self, run_id: &RunId) -> Result<RunStatus> {
        let runs = self
            .runs
            .lock()
            .map_err(|e| StrandError::Store(e.to_string()))?;
        let managed = runs
            .get(run_id)
            .ok_or_else(|| StrandError::RunNotFound(run_id.to_string()))?;
        let status = managed.status_rx.borrow().clone();
        Ok(status)
    }

    /// Handle for feeding events into a live run.
    pub fn injector(&self, run_id: &RunId) -> Result<Injector> {
        let runs = self
            .runs
            .lock()
            .map_err(|e| StrandError::Store(e.to_string()))?;
        let managed = runs
            .get(run_id)
            .ok_or_else(|| StrandError::RunNotFound(run_id.to_string()))?;
        Ok(managed.injector.clone())
    }

    /// The durable trace recorded so far: (events, invocations).
    pub fn trace(&self, run_id: &RunId) -> Result<(Vec<Event>, Vec<InvocationRecord>)> {
        let store = {
            let runs = self
                .runs
                .lock()
                .map_err(|e| StrandError::Store(e.to_string()))?;
            runs.get(run_id)
                .ok_or_else(|| StrandError::RunNotFound(run_id.to_string()))?
                .store
                .clone()
        };
        Ok((store.events()?, store.invocations()?))
    }

    /// Block until the run reaches a terminal status and return its report.
    pub async fn wait(&self, run_id: &RunId) -> Result<RunReport> {
        let (mut status_rx, report) = {
            let runs = self
                .runs
                .lock()
                .map_err(|e| StrandError::Store(e.to_string()))?;
            let managed = runs
                .get(run_id)
                .ok_or_else(|| StrandError::RunNotFound(run_id.to_string()))?;
            (managed.status_rx.clone(), managed.report.clone())
        };

        status_rx
            .wait_for(|status| status.is_terminal())
            .await
            .map_err(|_| StrandError::RunNotFound(run_id.to_string()))?;

        let report = report
            .lock()
            .map_err(|e| StrandError::Store(e.to_string()))?
            .clone();
        report.ok_or_else(|| StrandError::RunNotFound(run_id.to_string()))
    }
}

impl Default for RunManager {
    fn default() -> Self {
        Self::new(Scheduler::new())
    }
}
