//! Local document store: the replica's source of truth while offline.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use tideline_common::{
    CollectionPath, Document, DocumentKey, Error, Result, ServerRevision, SyncCursor,
};

use crate::backend::{DocumentBackend, DocumentWrite};
use crate::memory::MemoryBackend;

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Who caused a store write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// A mutation made on this device.
    Local,
    /// A server update applied by the sync engine.
    Remote,
}

/// Change notification emitted after a durable write.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub key: DocumentKey,
    /// New visible state; `None` once the document is deleted.
    pub document: Option<Document>,
    pub origin: ChangeOrigin,
}

/// Documents of one collection captured at a point in time.
///
/// Iteration is lazy, finite, and restartable: every call to
/// [`DocumentSnapshot::iter`] walks the same captured state again.
pub struct DocumentSnapshot<F> {
    collection: CollectionPath,
    documents: Arc<[Document]>,
    corrupted: Vec<String>,
    predicate: F,
    taken_at: DateTime<Utc>,
}

impl<F> DocumentSnapshot<F>
where
    F: Fn(&Document) -> bool,
{
    /// Iterate over the documents matching the predicate.
    pub fn iter(&self) -> impl Iterator<Item = &Document> + '_ {
        self.documents.iter().filter(move |doc| (self.predicate)(*doc))
    }

    /// Clone the matching documents out of the snapshot.
    pub fn to_vec(&self) -> Vec<Document> {
        self.iter().cloned().collect()
    }

    pub fn collection(&self) -> &CollectionPath {
        &self.collection
    }

    /// Keys whose stored state could not be decoded.
    pub fn corrupted(&self) -> &[String] {
        &self.corrupted
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }
}

/// Durable on-device document cache.
///
/// Every write reaches the backend before observers are notified. Tombstoned
/// documents read as absent through [`LocalStore::get`] and
/// [`LocalStore::list`].
pub struct LocalStore {
    backend: Arc<dyn DocumentBackend>,
    events: broadcast::Sender<StoreEvent>,
}

impl LocalStore {
    /// Create a store over a backend.
    pub fn new(backend: Arc<dyn DocumentBackend>) -> Self {
        Self::with_event_capacity(backend, DEFAULT_EVENT_CAPACITY)
    }

    /// Create a store whose notification channel buffers `capacity` events
    /// per slow subscriber.
    pub fn with_event_capacity(backend: Arc<dyn DocumentBackend>, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self { backend, events }
    }

    /// Create a volatile store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Register an observer for change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Get a live document; tombstones read as absent.
    pub fn get(&self, key: &DocumentKey) -> Result<Option<Document>> {
        Ok(self.backend.load(key)?.filter(|doc| !doc.is_tombstone()))
    }

    /// Get a document including tombstones.
    pub fn get_raw(&self, key: &DocumentKey) -> Result<Option<Document>> {
        self.backend.load(key)
    }

    /// Atomically replace a document with a local state.
    ///
    /// # Errors
    /// - `InvalidInput` if the document's local revision is older than the
    ///   stored one
    /// - backend failures, surfaced as-is
    pub fn put(&self, document: Document) -> Result<()> {
        if let Some(existing) = self.backend.load(&document.key)? {
            if document.local_revision < existing.local_revision {
                return Err(Error::InvalidInput(format!(
                    "Stale write for {}: revision {} < {}",
                    document.key, document.local_revision, existing.local_revision
                )));
            }
        }

        self.backend.write(DocumentWrite::Upsert(&document), None)?;
        debug!(
            "Stored {} at local revision {}",
            document.key, document.local_revision
        );
        self.notify(&document, ChangeOrigin::Local);
        Ok(())
    }

    /// Tombstone a document. The tombstone is kept until the remote deletion
    /// is acknowledged and [`LocalStore::purge`] is called.
    ///
    /// Returns the tombstone, or `None` if there was no live document.
    pub fn delete(&self, key: &DocumentKey) -> Result<Option<Document>> {
        let Some(mut document) = self.backend.load(key)? else {
            return Ok(None);
        };
        if document.is_tombstone() {
            return Ok(None);
        }

        document.deleted = true;
        document.fields.clear();
        document.local_revision += 1;
        document.updated_at = Utc::now();

        self.backend.write(DocumentWrite::Upsert(&document), None)?;
        self.notify(&document, ChangeOrigin::Local);
        Ok(Some(document))
    }

    /// Record the server revision that acknowledged the local state.
    ///
    /// The visible state does not change, so no event is emitted.
    pub fn acknowledge(&self, key: &DocumentKey, revision: ServerRevision) -> Result<()> {
        let Some(mut document) = self.backend.load(key)? else {
            return Ok(());
        };
        document.server_revision = Some(revision);
        self.backend.write(DocumentWrite::Upsert(&document), None)?;
        debug!("{} acknowledged at server version {}", key, revision.version);
        Ok(())
    }

    /// Physically remove a document.
    pub fn purge(&self, key: &DocumentKey) -> Result<()> {
        self.backend.write(DocumentWrite::Purge(key), None)?;
        debug!("Purged {}", key);
        Ok(())
    }

    /// Write server state for a document and advance the collection cursor
    /// in the same atomic step.
    ///
    /// `document = None` removes the document.
    pub fn apply_remote(
        &self,
        key: &DocumentKey,
        document: Option<&Document>,
        cursor: Option<&SyncCursor>,
    ) -> Result<()> {
        let write = match document {
            Some(doc) => DocumentWrite::Upsert(doc),
            None => DocumentWrite::Purge(key),
        };
        self.backend.write(write, cursor)?;

        let visible = document.filter(|doc| !doc.is_tombstone()).cloned();
        let _ = self.events.send(StoreEvent {
            key: key.clone(),
            document: visible,
            origin: ChangeOrigin::Remote,
        });
        Ok(())
    }

    /// Snapshot the live documents of a collection.
    ///
    /// The snapshot is taken at call time; `predicate` is applied lazily
    /// while iterating. Undecodable documents are skipped and reported
    /// through [`DocumentSnapshot::corrupted`].
    pub fn list<F>(&self, collection: &CollectionPath, predicate: F) -> Result<DocumentSnapshot<F>>
    where
        F: Fn(&Document) -> bool,
    {
        let mut documents = Vec::new();
        let mut corrupted = Vec::new();

        for row in self.backend.scan(collection)? {
            match row {
                Ok(doc) if doc.is_tombstone() => {}
                Ok(doc) => documents.push(doc),
                Err(Error::StorageCorruption { key, reason }) => {
                    warn!("Skipping corrupted document {}: {}", key, reason);
                    corrupted.push(key);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(DocumentSnapshot {
            collection: collection.clone(),
            documents: documents.into(),
            corrupted,
            predicate,
            taken_at: Utc::now(),
        })
    }

    /// Last applied server position of a collection.
    pub fn cursor(&self, collection: &CollectionPath) -> Result<Option<SyncCursor>> {
        self.backend.load_cursor(collection)
    }

    pub fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        self.backend.save_cursor(cursor)
    }

    fn notify(&self, document: &Document, origin: ChangeOrigin) {
        let visible = (!document.is_tombstone()).then(|| document.clone());
        // No receivers is fine.
        let _ = self.events.send(StoreEvent {
            key: document.key.clone(),
            document: visible,
            origin,
        });
    }
}
