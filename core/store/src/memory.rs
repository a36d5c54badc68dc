//! In-memory backend for testing.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tideline_common::{CollectionPath, Document, DocumentKey, Error, Result, SyncCursor};

use crate::backend::{ChangeLogBackend, DocumentBackend, DocumentWrite};
use crate::changelog::{ChangeEntry, FailedChange};

#[derive(Default)]
struct Tables {
    documents: BTreeMap<DocumentKey, Document>,
    cursors: HashMap<CollectionPath, SyncCursor>,
    pending: BTreeMap<u64, ChangeEntry>,
    failed: Vec<FailedChange>,
}

/// In-memory backend.
///
/// Useful for testing and development. All data is stored in memory
/// and lost on drop.
#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<Tables>,
}

impl MemoryBackend {
    /// Create a new empty memory backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| Error::Storage("Memory backend lock poisoned".to_string()))
    }

    fn write_tables(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| Error::Storage("Memory backend lock poisoned".to_string()))
    }
}

impl DocumentBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn load(&self, key: &DocumentKey) -> Result<Option<Document>> {
        Ok(self.read()?.documents.get(key).cloned())
    }

    fn write(&self, write: DocumentWrite<'_>, cursor: Option<&SyncCursor>) -> Result<()> {
        let mut tables = self.write_tables()?;
        match write {
            DocumentWrite::Upsert(doc) => {
                tables.documents.insert(doc.key.clone(), doc.clone());
            }
            DocumentWrite::Purge(key) => {
                tables.documents.remove(key);
            }
        }
        if let Some(cursor) = cursor {
            tables
                .cursors
                .insert(cursor.collection.clone(), cursor.clone());
        }
        Ok(())
    }

    fn scan(&self, collection: &CollectionPath) -> Result<Vec<Result<Document>>> {
        Ok(self
            .read()?
            .documents
            .values()
            .filter(|doc| doc.collection() == collection)
            .cloned()
            .map(Ok)
            .collect())
    }

    fn load_cursor(&self, collection: &CollectionPath) -> Result<Option<SyncCursor>> {
        Ok(self.read()?.cursors.get(collection).cloned())
    }

    fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        self.write_tables()?
            .cursors
            .insert(cursor.collection.clone(), cursor.clone());
        Ok(())
    }
}

impl ChangeLogBackend for MemoryBackend {
    fn load_pending(&self) -> Result<Vec<ChangeEntry>> {
        Ok(self.read()?.pending.values().cloned().collect())
    }

    fn load_failed(&self) -> Result<Vec<FailedChange>> {
        Ok(self.read()?.failed.clone())
    }

    fn max_id(&self) -> Result<u64> {
        let tables = self.read()?;
        let pending = tables.pending.keys().next_back().copied().unwrap_or(0);
        let failed = tables.failed.iter().map(|f| f.entry.id).max().unwrap_or(0);
        Ok(pending.max(failed))
    }

    fn insert(&self, entry: &ChangeEntry) -> Result<()> {
        self.write_tables()?.pending.insert(entry.id, entry.clone());
        Ok(())
    }

    fn replace(&self, ids: &[u64], replacement: Option<&ChangeEntry>) -> Result<()> {
        let mut tables = self.write_tables()?;
        for id in ids {
            tables.pending.remove(id);
        }
        if let Some(entry) = replacement {
            tables.pending.insert(entry.id, entry.clone());
        }
        Ok(())
    }

    fn record_failed(&self, failed: &[FailedChange]) -> Result<()> {
        let mut tables = self.write_tables()?;
        for change in failed {
            tables.pending.remove(&change.entry.id);
            tables.failed.push(change.clone());
        }
        Ok(())
    }
}
