//! Execution store backends: the durable, append-only source of truth for
//! live execution and after-the-fact trace inspection/replay.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
