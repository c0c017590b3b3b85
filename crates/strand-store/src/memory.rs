use std::sync::Mutex;

use chrono::Utc;

use strand_core::error::{Result, StrandError};
use strand_core::event::{Event, EventDraft, InvocationRecord};
use strand_core::traits::ExecutionStore;
use strand_core::types::EventId;

/// In-memory execution store.
///
/// The default backend for tests and runs whose trace does not need to
/// outlive the process. The single mutex doubles as the per-run append
/// lock: concurrent node completions never interleave partial records.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    events: Vec<Event>,
    invocations: Vec<InvocationRecord>,
    next_id: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 1,
                ..Default::default()
            }),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionStore for MemoryStore {
    fn append_event(&self, draft: EventDraft) -> Result<Event> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| StrandError::Store(e.to_string()))?;

        for parent in &draft.parents {
            if parent.0 == 0 || parent.0 >= inner.next_id {
                return Err(StrandError::MissingParent { parent: *parent });
            }
        }

        let event = Event {
            id: EventId(inner.next_id),
            topic: draft.topic,
            payload: draft.payload,
            producer: draft.producer,
            parents: draft.parents,
            timestamp: Utc::now(),
        };
        inner.next_id += 1;
        inner.events.push(event.clone());
        Ok(event)
    }

    fn append_invocation(&self, record: InvocationRecord) -> Result<()> {
        self.inner
            .lock()
            .map_err(|e| StrandError::Store(e.to_string()))?
            .invocations
            .push(record);
        Ok(())
    }

    fn events_since(&self, cursor: EventId) -> Result<Vec<Event>> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| StrandError::Store(e.to_string()))?;
        Ok(inner
            .events
            .iter()
            .filter(|e| e.id > cursor)
            .cloned()
            .collect())
    }

    fn invocations_for(&self, node_id: &str) -> Result<Vec<InvocationRecord>> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| StrandError::Store(e.to_string()))?;
        Ok(inner
            .invocations
            .iter()
            .filter(|r| r.node_id == node_id)
            .cloned()
            .collect())
    }

    fn invocations(&self) -> Result<Vec<InvocationRecord>> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| StrandError::Store(e.to_string()))?;
        Ok(inner.invocations.clone())
    }
}
