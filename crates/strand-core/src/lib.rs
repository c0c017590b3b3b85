pub mod config;
pub mod error;
pub mod event;
pub mod trace;
pub mod traits;
pub mod types;

pub use config::{RetryPolicy, RunPolicy};
pub use error::{ExecutionError, Result, StrandError};
pub use event::{Emission, Event, EventDraft, InvocationRecord, InvocationStatus, EXTERNAL_PRODUCER};
pub use trace::{TraceBus, TraceEvent};
pub use traits::{ExecutionStore, InputBundle, NodeContext, NodeExecutor};
pub use types::{EventId, RunId};
