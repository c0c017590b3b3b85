use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use strand_core::trace::{TraceBus, TraceEvent};
use strand_core::types::RunId;

/// JSONL trace logger.
///
/// Subscribes to the TraceBus and writes structured trace entries as JSONL
/// (one JSON object per line). This format is append-only and
/// crash-resilient: even if the process dies mid-run, all previously
/// written lines are intact.
pub struct TraceLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log line: the trace event plus a write timestamp.
#[derive(Serialize)]
struct LogLine<'a> {
    timestamp: String,
    #[serde(flatten)]
    event: &'a TraceEvent,
}

impl TraceLogger {
    /// Create a new TraceLogger.
    ///
    /// `log_dir` is the base directory; the trace is written to
    /// `{log_dir}/{run_id}.jsonl`.
    /// `level` controls verbosity: 1=run summary, 2=+invocations, 3=+events.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Run the logger as a background task.
    ///
    /// Subscribes to the TraceBus and writes JSONL until cancellation or
    /// the run's RunFinished event.
    pub async fn run(self, bus: Arc<TraceBus>, run_id: RunId, cancel: CancellationToken) {
        if let Err(e) = tokio::fs::create_dir_all(&self.log_dir).await {
            error!(error = %e, "failed to create trace log directory");
            return;
        }

        let log_path = self.log_dir.join(format!("{}.jsonl", run_id));
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "failed to open trace log file");
                return;
            }
        };

        info!(path = %log_path.display(), "trace logger started");

        let mut writer = tokio::io::BufWriter::new(file);
        let mut rx = bus.subscribe();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("trace logger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event_run_id(&event) != &run_id || !self.accepts(&event) {
                                continue;
                            }

                            let line = LogLine {
                                timestamp: Utc::now().to_rfc3339(),
                                event: &event,
                            };
                            if let Ok(json) = serde_json::to_string(&line) {
                                if let Err(e) = writer.write_all(format!("{}\n", json).as_bytes()).await {
                                    error!(error = %e, "failed to write trace entry");
                                    break;
                                }
                                // Flush after each entry for crash resilience
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "failed to flush trace log");
                                }
                            }

                            if matches!(event, TraceEvent::RunFinished { .. }) {
                                break;
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "trace logger lagged, skipped entries");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("trace bus closed, logger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "trace logger finished");
    }

    /// Level filter: 1=run summary, 2=+invocations and retries, 3=+events.
    fn accepts(&self, event: &TraceEvent) -> bool {
        match event {
            TraceEvent::RunStarted { .. } | TraceEvent::RunFinished { .. } => true,
            TraceEvent::NodeDispatched { .. }
            | TraceEvent::NodeFinished { .. }
            | TraceEvent::NodeRetryScheduled { .. } => self.level >= 2,
            TraceEvent::EventRecorded { .. } => self.level >= 3,
        }
    }
}

fn event_run_id(event: &TraceEvent) -> &RunId {
    match event {
        TraceEvent::RunStarted { run_id }
        | TraceEvent::EventRecorded { run_id, .. }
        | TraceEvent::NodeDispatched { run_id, .. }
        | TraceEvent::NodeFinished { run_id, .. }
        | TraceEvent::NodeRetryScheduled { run_id, .. }
        | TraceEvent::RunFinished { run_id, .. } => run_id,
    }
}
