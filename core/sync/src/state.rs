//! Sync engine phases and status tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use tideline_common::CollectionPath;

/// What the engine's drain side is doing.
///
/// Listening runs concurrently with every phase and is tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// Nothing to push.
    Idle,
    /// Pushing pending changes.
    Draining,
    /// Resolving a push conflict.
    Reconciling,
    /// Remote unreachable; waiting to reconnect.
    Offline,
}

impl SyncPhase {
    /// Whether the engine may move from `self` to `next`.
    pub fn can_transition_to(self, next: SyncPhase) -> bool {
        use SyncPhase::*;
        matches!(
            (self, next),
            (Idle, Draining)
                | (Draining, Idle)
                | (Draining, Reconciling)
                | (Reconciling, Draining)
                | (Idle | Draining | Reconciling, Offline)
                | (Offline, Idle | Draining)
        ) || self == next
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Draining => "draining",
            SyncPhase::Reconciling => "reconciling",
            SyncPhase::Offline => "offline",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable engine bookkeeping, guarded by the engine.
#[derive(Debug, Clone)]
pub(crate) struct EngineState {
    pub phase: SyncPhase,
    pub listening: BTreeSet<CollectionPath>,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub conflicts_resolved: u64,
}

impl EngineState {
    pub fn new() -> Self {
        Self {
            phase: SyncPhase::Idle,
            listening: BTreeSet::new(),
            last_sync: None,
            last_error: None,
            conflicts_resolved: 0,
        }
    }
}

/// Point-in-time view of the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStatus {
    pub phase: SyncPhase,
    /// Collections with an open listen stream.
    pub listening: Vec<CollectionPath>,
    /// Entries waiting in the change log.
    pub pending: usize,
    /// Entries the server permanently rejected.
    pub failed: usize,
    /// Completion time of the last successful drain.
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub conflicts_resolved: u64,
}

impl EngineStatus {
    pub fn is_listening(&self) -> bool {
        !self.listening.is_empty()
    }
}
