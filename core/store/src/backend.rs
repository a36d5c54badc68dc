//! Backend traits for the local store and the change log.

use tideline_common::{CollectionPath, Document, DocumentKey, Result, SyncCursor};

use crate::changelog::{ChangeEntry, FailedChange};

/// A single document write.
#[derive(Debug, Clone, Copy)]
pub enum DocumentWrite<'a> {
    /// Insert or replace the document.
    Upsert(&'a Document),
    /// Physically remove the document.
    Purge(&'a DocumentKey),
}

/// Durable document storage.
///
/// A call that returns `Ok` has reached durable storage. Implementations must
/// apply each `write` (document plus optional cursor) atomically.
pub trait DocumentBackend: Send + Sync {
    /// Get the backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Load one document, tombstones included.
    ///
    /// # Errors
    /// - `StorageCorruption` if the stored row cannot be decoded
    fn load(&self, key: &DocumentKey) -> Result<Option<Document>>;

    /// Apply a document write and, optionally, advance a sync cursor.
    fn write(&self, write: DocumentWrite<'_>, cursor: Option<&SyncCursor>) -> Result<()>;

    /// Load every document of a collection.
    ///
    /// Each row decodes independently so corruption stays isolated to the
    /// affected document.
    fn scan(&self, collection: &CollectionPath) -> Result<Vec<Result<Document>>>;

    /// Load the sync cursor of a collection.
    fn load_cursor(&self, collection: &CollectionPath) -> Result<Option<SyncCursor>>;

    /// Persist a sync cursor on its own.
    fn save_cursor(&self, cursor: &SyncCursor) -> Result<()>;
}

/// Durable change log storage.
pub trait ChangeLogBackend: Send + Sync {
    /// Load all pending entries in id order.
    fn load_pending(&self) -> Result<Vec<ChangeEntry>>;

    /// Load the entries marked permanently failed.
    fn load_failed(&self) -> Result<Vec<FailedChange>>;

    /// Highest id ever handed out that is still stored (pending or failed).
    fn max_id(&self) -> Result<u64>;

    /// Insert one entry.
    fn insert(&self, entry: &ChangeEntry) -> Result<()>;

    /// Remove `ids` and insert `replacement`, atomically.
    fn replace(&self, ids: &[u64], replacement: Option<&ChangeEntry>) -> Result<()>;

    /// Move `entries` from the pending queue to the failed set, atomically.
    fn record_failed(&self, failed: &[FailedChange]) -> Result<()>;
}
