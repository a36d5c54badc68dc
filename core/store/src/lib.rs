//! On-device persistence for Tideline.
//!
//! This module provides the two durable structures a replica keeps locally:
//! - the Local Store, a document cache that is the source of truth offline
//! - the Change Log, an ordered queue of local mutations awaiting upload
//!
//! Both run over a pluggable backend: an in-memory one for tests and a
//! SQLite one that survives process restart.

pub mod backend;
pub mod changelog;
pub mod local;
pub mod memory;
pub mod sqlite;

pub use backend::{ChangeLogBackend, DocumentBackend, DocumentWrite};
pub use changelog::{ChangeEntry, ChangeLog, FailedChange, NewChange, PendingChange};
pub use local::{ChangeOrigin, DocumentSnapshot, LocalStore, StoreEvent};
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Default maximum number of pending change log entries.
pub const DEFAULT_CHANGE_LOG_CAPACITY: usize = 100_000;
