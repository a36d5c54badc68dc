//! Tideline Sync Engine
//!
//! This module keeps a replica's local store and a remote document store
//! convergent, including:
//! - A mutation API that writes locally and logs every change
//! - Draining the change log with conditional, coalesced pushes
//! - Listening to remote change streams with resumable cursors
//! - Field-level conflict resolution with additive counters
//! - Retry and reconnect with exponential backoff

pub mod conflict;
pub mod engine;
pub mod locks;
pub mod retry;
pub mod scheduler;
pub mod state;

// Re-export main types
pub use conflict::{ConflictEvent, ConflictKind, ConflictResolver, MergePolicy, Requeue, Resolution};
pub use engine::{SyncConfig, SyncEngine, SyncEvent, SyncHandle};
pub use locks::KeyLocks;
pub use retry::{RetryConfig, RetryExecutor};
pub use scheduler::{SyncMode, SyncReport, SyncRequest, SyncScheduler, SyncSchedulerHandle};
pub use state::{EngineStatus, SyncPhase};
