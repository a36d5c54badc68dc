//! Append-only log of local mutations awaiting server acknowledgement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

use tideline_common::{ChangeType, DocumentKey, Error, FieldDelta, Result, ServerRevision};

use crate::backend::ChangeLogBackend;
use crate::memory::MemoryBackend;
use crate::DEFAULT_CHANGE_LOG_CAPACITY;

/// A recorded local mutation. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEntry {
    /// Position in the log; later entries have larger ids.
    pub id: u64,
    /// Document the mutation applies to.
    pub key: DocumentKey,
    /// Kind of mutation.
    pub change_type: ChangeType,
    /// Field-level delta (empty for deletes).
    pub delta: FieldDelta,
    /// Local revision of the document after this mutation.
    pub local_revision: u64,
    /// Server revision the document had when the mutation was made.
    pub expected_revision: Option<ServerRevision>,
    /// When the mutation was made.
    pub created_at: DateTime<Utc>,
    /// Fields whose last local change predates `created_at`, with the time
    /// of that change. Set on entries rebuilt after a conflict.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub field_mutated_at: BTreeMap<String, DateTime<Utc>>,
}

impl ChangeEntry {
    /// When `field` was last changed locally by this entry.
    pub fn field_time(&self, field: &str) -> DateTime<Utc> {
        self.field_mutated_at
            .get(field)
            .copied()
            .unwrap_or(self.created_at)
    }
}

/// Input to [`ChangeLog::append`]; the log assigns the id.
#[derive(Debug, Clone)]
pub struct NewChange {
    pub key: DocumentKey,
    pub change_type: ChangeType,
    pub delta: FieldDelta,
    pub local_revision: u64,
    pub expected_revision: Option<ServerRevision>,
    pub created_at: DateTime<Utc>,
    pub field_mutated_at: BTreeMap<String, DateTime<Utc>>,
}

impl NewChange {
    /// Create a change stamped with the current time.
    pub fn new(
        key: DocumentKey,
        change_type: ChangeType,
        delta: FieldDelta,
        local_revision: u64,
        expected_revision: Option<ServerRevision>,
    ) -> Self {
        Self {
            key,
            change_type,
            delta,
            local_revision,
            expected_revision,
            created_at: Utc::now(),
            field_mutated_at: BTreeMap::new(),
        }
    }

    /// Keep the original per-field mutation times of a rebuilt change.
    ///
    /// The entry is stamped with the newest of them.
    pub fn with_field_times(mut self, times: BTreeMap<String, DateTime<Utc>>) -> Self {
        if let Some(newest) = times.values().max() {
            self.created_at = *newest;
        }
        self.field_mutated_at = times;
        self
    }

    fn into_entry(self, id: u64) -> ChangeEntry {
        ChangeEntry {
            id,
            key: self.key,
            change_type: self.change_type,
            delta: self.delta,
            local_revision: self.local_revision,
            expected_revision: self.expected_revision,
            created_at: self.created_at,
            field_mutated_at: self.field_mutated_at,
        }
    }
}

/// An entry the server refused for good.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedChange {
    pub entry: ChangeEntry,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

/// Net pending change of one document, coalesced from its entries.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub key: DocumentKey,
    pub change_type: ChangeType,
    /// Latest change per field.
    pub delta: FieldDelta,
    /// Entries folded into this change, in creation order.
    pub entry_ids: Vec<u64>,
    /// Expected server revision of the oldest entry.
    pub expected_revision: Option<ServerRevision>,
    /// Local revision after the newest entry.
    pub local_revision: u64,
    /// Creation time of the newest entry.
    pub mutated_at: DateTime<Utc>,
    /// Time of the last local change of each field in `delta`.
    pub field_mutated_at: BTreeMap<String, DateTime<Utc>>,
}

impl PendingChange {
    /// Fold entries of one document, oldest first.
    ///
    /// Returns `None` for an empty slice.
    pub fn coalesce<'a>(entries: impl IntoIterator<Item = &'a ChangeEntry>) -> Option<Self> {
        let mut iter = entries.into_iter();
        let first = iter.next()?;
        let mut pending = PendingChange {
            key: first.key.clone(),
            change_type: first.change_type,
            delta: first.delta.clone(),
            entry_ids: vec![first.id],
            expected_revision: first.expected_revision,
            local_revision: first.local_revision,
            mutated_at: first.created_at,
            field_mutated_at: BTreeMap::new(),
        };
        pending.stamp_fields(first);

        for entry in iter {
            match entry.change_type {
                ChangeType::Delete => {
                    pending.delta = FieldDelta::new();
                    pending.field_mutated_at.clear();
                }
                ChangeType::Create => {
                    pending.delta = entry.delta.clone();
                    pending.field_mutated_at.clear();
                }
                ChangeType::Update => pending.delta.merge(&entry.delta),
            }
            pending.stamp_fields(entry);
            pending.change_type = pending.change_type.then(entry.change_type);
            pending.entry_ids.push(entry.id);
            pending.local_revision = entry.local_revision;
            pending.mutated_at = entry.created_at;
        }

        Some(pending)
    }

    fn stamp_fields(&mut self, entry: &ChangeEntry) {
        for (name, _) in entry.delta.iter() {
            self.field_mutated_at
                .insert(name.clone(), entry.field_time(name));
        }
    }

    /// When `field` was last changed locally.
    pub fn field_time(&self, field: &str) -> DateTime<Utc> {
        self.field_mutated_at
            .get(field)
            .copied()
            .unwrap_or(self.mutated_at)
    }

    /// Whether nothing needs to reach the server: the document was created
    /// and deleted locally without the server ever seeing it.
    pub fn is_local_only_delete(&self) -> bool {
        self.change_type == ChangeType::Delete && self.expected_revision.is_none()
    }
}

struct LogState {
    pending: BTreeMap<u64, ChangeEntry>,
    next_id: u64,
}

/// Ordered queue of pending mutations.
///
/// `append`, `peek_batch`, `confirm` and the other mutating calls are
/// linearizable: each runs under one lock and writes through to the backend
/// before touching the in-memory mirror.
pub struct ChangeLog {
    backend: Arc<dyn ChangeLogBackend>,
    state: Mutex<LogState>,
    capacity: usize,
}

impl ChangeLog {
    /// Open a change log over a backend, loading pending entries.
    pub fn open(backend: Arc<dyn ChangeLogBackend>, capacity: usize) -> Result<Self> {
        let entries = backend.load_pending()?;
        let next_id = backend.max_id()? + 1;
        let pending: BTreeMap<u64, ChangeEntry> =
            entries.into_iter().map(|e| (e.id, e)).collect();

        if !pending.is_empty() {
            debug!("Change log reopened with {} pending entries", pending.len());
        }

        Ok(Self {
            backend,
            state: Mutex::new(LogState { pending, next_id }),
            capacity,
        })
    }

    /// Create a volatile change log.
    pub fn in_memory() -> Self {
        let backend: Arc<dyn ChangeLogBackend> = Arc::new(MemoryBackend::new());
        Self {
            backend,
            state: Mutex::new(LogState {
                pending: BTreeMap::new(),
                next_id: 1,
            }),
            capacity: DEFAULT_CHANGE_LOG_CAPACITY,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, LogState>> {
        self.state
            .lock()
            .map_err(|_| Error::Storage("Change log lock poisoned".to_string()))
    }

    /// Append an entry.
    ///
    /// # Errors
    /// - `CapacityExceeded` when the log already holds `capacity` entries
    /// - backend write failures
    pub fn append(&self, change: NewChange) -> Result<ChangeEntry> {
        let mut state = self.lock()?;
        if state.pending.len() >= self.capacity {
            warn!("Change log full, refusing entry for {}", change.key);
            return Err(Error::CapacityExceeded(self.capacity));
        }

        let entry = change.into_entry(state.next_id);
        self.backend.insert(&entry)?;
        state.next_id += 1;
        state.pending.insert(entry.id, entry.clone());

        debug!(
            "Appended change {} ({}) for {}",
            entry.id,
            entry.change_type.as_str(),
            entry.key
        );
        Ok(entry)
    }

    /// Oldest pending changes, coalesced per document.
    ///
    /// Documents are taken in order of their oldest pending entry until
    /// `max_documents` are collected; every pending entry of a selected
    /// document is folded into its change.
    pub fn peek_batch(&self, max_documents: usize) -> Result<Vec<PendingChange>> {
        let state = self.lock()?;
        let mut order: Vec<&DocumentKey> = Vec::new();
        let mut grouped: HashMap<&DocumentKey, Vec<&ChangeEntry>> = HashMap::new();

        for entry in state.pending.values() {
            if let Some(group) = grouped.get_mut(&entry.key) {
                group.push(entry);
            } else if order.len() < max_documents {
                order.push(&entry.key);
                grouped.insert(&entry.key, vec![entry]);
            }
        }

        Ok(order
            .into_iter()
            .filter_map(|key| grouped.get(key))
            .filter_map(|entries| PendingChange::coalesce(entries.iter().copied()))
            .collect())
    }

    /// Coalesced pending change of one document.
    pub fn pending_for(&self, key: &DocumentKey) -> Result<Option<PendingChange>> {
        let state = self.lock()?;
        Ok(PendingChange::coalesce(
            state.pending.values().filter(|e| &e.key == key),
        ))
    }

    /// Remove acknowledged entries. Unknown ids are ignored, so confirming
    /// twice has no further effect.
    ///
    /// Returns the number of entries removed.
    pub fn confirm(&self, ids: &[u64]) -> Result<usize> {
        let mut state = self.lock()?;
        let present: Vec<u64> = ids
            .iter()
            .copied()
            .filter(|id| state.pending.contains_key(id))
            .collect();
        if present.is_empty() {
            return Ok(0);
        }

        self.backend.replace(&present, None)?;
        for id in &present {
            state.pending.remove(id);
        }
        Ok(present.len())
    }

    /// Atomically discard `ids` and append `replacement` in their place.
    pub fn replace(&self, ids: &[u64], replacement: NewChange) -> Result<ChangeEntry> {
        let mut state = self.lock()?;
        let present: Vec<u64> = ids
            .iter()
            .copied()
            .filter(|id| state.pending.contains_key(id))
            .collect();

        let entry = replacement.into_entry(state.next_id);
        self.backend.replace(&present, Some(&entry))?;
        state.next_id += 1;
        for id in &present {
            state.pending.remove(id);
        }
        state.pending.insert(entry.id, entry.clone());
        Ok(entry)
    }

    /// Move entries to the failed set; they will not be retried.
    pub fn mark_failed(&self, ids: &[u64], reason: &str) -> Result<Vec<FailedChange>> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let failed: Vec<FailedChange> = ids
            .iter()
            .filter_map(|id| state.pending.get(id))
            .map(|entry| FailedChange {
                entry: entry.clone(),
                reason: reason.to_string(),
                failed_at: now,
            })
            .collect();
        if failed.is_empty() {
            return Ok(failed);
        }

        self.backend.record_failed(&failed)?;
        for change in &failed {
            state.pending.remove(&change.entry.id);
        }
        warn!("Marked {} change(s) as failed: {}", failed.len(), reason);
        Ok(failed)
    }

    /// Entries the server permanently rejected.
    pub fn failed(&self) -> Result<Vec<FailedChange>> {
        self.backend.load_failed()
    }

    /// All pending entries in creation order.
    pub fn entries(&self) -> Result<Vec<ChangeEntry>> {
        Ok(self.lock()?.pending.values().cloned().collect())
    }

    /// Number of pending entries.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.pending.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
