use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use tracing::debug;

use strand_core::error::{Result, StrandError};
use strand_core::event::{Event, EventDraft, InvocationRecord, InvocationStatus};
use strand_core::traits::ExecutionStore;
use strand_core::types::{EventId, RunId};

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY,
    topic TEXT NOT NULL,
    payload TEXT NOT NULL,
    producer TEXT NOT NULL,
    parents TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS invocations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    input_events TEXT NOT NULL,
    output_events TEXT NOT NULL,
    status TEXT NOT NULL,
    error TEXT,
    started_at TEXT NOT NULL,
    finished_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_invocations_node
    ON invocations(node_id, seq);";

/// SQLite-backed execution store for traces that must survive the process.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a trace database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StrandError::Store(format!("failed to create db directory: {}", e)))?;
        }

        let conn = Connection::open(path).map_err(|e| StrandError::Store(e.to_string()))?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| StrandError::Store(e.to_string()))?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| StrandError::Store(e.to_string()))?;

        debug!(path = %path.display(), "SQLite execution store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| StrandError::Store(e.to_string()))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StrandError::Store(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn status_to_str(status: InvocationStatus) -> &'static str {
    match status {
        InvocationStatus::Succeeded => "succeeded",
        InvocationStatus::FailedTransient => "failed_transient",
        InvocationStatus::FailedPermanent => "failed_permanent",
        InvocationStatus::ContractViolation => "contract_violation",
        InvocationStatus::Cancelled => "cancelled",
    }
}

fn status_from_str(raw: &str) -> Result<InvocationStatus> {
    match raw {
        "succeeded" => Ok(InvocationStatus::Succeeded),
        "failed_transient" => Ok(InvocationStatus::FailedTransient),
        "failed_permanent" => Ok(InvocationStatus::FailedPermanent),
        "contract_violation" => Ok(InvocationStatus::ContractViolation),
        "cancelled" => Ok(InvocationStatus::Cancelled),
        other => Err(StrandError::Store(format!(
            "unknown invocation status '{}'",
            other
        ))),
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StrandError::Store(format!("bad timestamp '{}': {}", raw, e)))
}

impl ExecutionStore for SqliteStore {
    fn append_event(&self, draft: EventDraft) -> Result<Event> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StrandError::Store(e.to_string()))?;

        let next_id: i64 = conn
            .query_row("SELECT COALESCE(MAX(id), 0) + 1 FROM events", [], |row| {
                row.get(0)
            })
            .map_err(|e| StrandError::Store(e.to_string()))?;

        for parent in &draft.parents {
            if parent.0 == 0 || parent.0 >= next_id as u64 {
                return Err(StrandError::MissingParent { parent: *parent });
            }
        }

        let event = Event {
            id: EventId(next_id as u64),
            topic: draft.topic,
            payload: draft.payload,
            producer: draft.producer,
            parents: draft.parents,
            timestamp: Utc::now(),
        };

        conn.execute(
            "INSERT INTO events (id, topic, payload, producer, parents, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                next_id,
                event.topic,
                event.payload.to_string(),
                event.producer,
                serde_json::to_string(&event.parents)?,
                event.timestamp.to_rfc3339(),
            ],
        )
        .map_err(|e| StrandError::Store(e.to_string()))?;

        Ok(event)
    }

    fn append_invocation(&self, record: InvocationRecord) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StrandError::Store(e.to_string()))?;

        conn.execute(
            "INSERT INTO invocations
                 (run_id, node_id, attempt, input_events, output_events, status, error, started_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.run_id.0,
                record.node_id,
                record.attempt as i64,
                serde_json::to_string(&record.input_events)?,
                serde_json::to_string(&record.output_events)?,
                status_to_str(record.status),
                record.error,
                record.started_at.to_rfc3339(),
                record.finished_at.to_rfc3339(),
            ],
        )
        .map_err(|e| StrandError::Store(e.to_string()))?;

        Ok(())
    }

    fn events_since(&self, cursor: EventId) -> Result<Vec<Event>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StrandError::Store(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT id, topic, payload, producer, parents, timestamp
                 FROM events WHERE id > ?1 ORDER BY id",
            )
            .map_err(|e| StrandError::Store(e.to_string()))?;

        let rows = stmt
            .query_map(params![cursor.0 as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(|e| StrandError::Store(e.to_string()))?;

        let mut events = Vec::new();
        for row in rows {
            let (id, topic, payload, producer, parents, timestamp) =
                row.map_err(|e| StrandError::Store(e.to_string()))?;
            events.push(Event {
                id: EventId(id as u64),
                topic,
                payload: serde_json::from_str(&payload)?,
                producer,
                parents: serde_json::from_str(&parents)?,
                timestamp: parse_timestamp(&timestamp)?,
            });
        }
        Ok(events)
    }

    fn invocations_for(&self, node_id: &str) -> Result<Vec<InvocationRecord>> {
        self.query_invocations(
            "SELECT run_id, node_id, attempt, input_events, output_events, status, error, started_at, finished_at
             FROM invocations WHERE node_id = ?1 ORDER BY seq",
            Some(node_id),
        )
    }

    fn invocations(&self) -> Result<Vec<InvocationRecord>> {
        self.query_invocations(
            "SELECT run_id, node_id, attempt, input_events, output_events, status, error, started_at, finished_at
             FROM invocations ORDER BY seq",
            None,
        )
    }
}

impl SqliteStore {
    fn query_invocations(&self, sql: &str, node_id: Option<&str>) -> Result<Vec<InvocationRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StrandError::Store(e.to_string()))?;

        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| StrandError::Store(e.to_string()))?;

        let map_row = |row: &rusqlite::Row<'_>| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
            ))
        };

        let rows = match node_id {
            Some(id) => stmt.query_map(params![id], map_row),
            None => stmt.query_map([], map_row),
        }
        .map_err(|e| StrandError::Store(e.to_string()))?;

        let mut records = Vec::new();
        for row in rows {
            let (run_id, node_id, attempt, inputs, outputs, status, error, started, finished) =
                row.map_err(|e| StrandError::Store(e.to_string()))?;
            records.push(InvocationRecord {
                run_id: RunId(run_id),
                node_id,
                attempt: attempt as u32,
                input_events: serde_json::from_str(&inputs)?,
                output_events: serde_json::from_str(&outputs)?,
                status: status_from_str(&status)?,
                error,
                started_at: parse_timestamp(&started)?,
                finished_at: parse_timestamp(&finished)?,
            });
        }
        Ok(records)
    }
}
