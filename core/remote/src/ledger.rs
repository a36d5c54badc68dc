//! Server-side document model shared by the bundled remotes.
//!
//! A [`Ledger`] holds the authoritative state of every collection: the
//! current document per key, its server version, and a per-collection change
//! sequence. Every accepted write bumps the document's version by one and
//! stamps the next sequence number on it, so the change feed of a
//! collection is simply its documents ordered by sequence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use tideline_common::{
    ChangeType, CollectionPath, DocumentKey, Error, Fields, Result, ServerRevision, SyncCursor,
};

use crate::client::{PushOutcome, PushRequest, RemoteChange, RemoteDocument};

/// Field names reserved for server bookkeeping.
const RESERVED_PREFIX: &str = "__";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerEntry {
    document: RemoteDocument,
    /// Collection sequence of the last write to this document.
    sequence: u64,
}

/// Authoritative state of one collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionLedger {
    collection: CollectionPath,
    sequence: u64,
    documents: BTreeMap<String, LedgerEntry>,
}

impl CollectionLedger {
    pub fn new(collection: CollectionPath) -> Self {
        Self {
            collection,
            sequence: 0,
            documents: BTreeMap::new(),
        }
    }

    pub fn collection(&self) -> &CollectionPath {
        &self.collection
    }

    /// Sequence number of the latest accepted write.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Current server state of a document, tombstones included.
    pub fn get(&self, id: &str) -> Option<&RemoteDocument> {
        self.documents.get(id).map(|entry| &entry.document)
    }

    /// Apply a conditional write.
    ///
    /// # Errors
    /// - `InvalidInput` if the key belongs to another collection
    /// - `PermanentRejection` if the delta touches an empty or reserved
    ///   field name
    pub fn push(&mut self, request: &PushRequest, now: DateTime<Utc>) -> Result<PushOutcome> {
        if request.key.collection() != &self.collection {
            return Err(Error::InvalidInput(format!(
                "{} does not belong to collection {}",
                request.key, self.collection
            )));
        }
        for (field, _) in request.delta.iter() {
            if field.is_empty() || field.starts_with(RESERVED_PREFIX) {
                return Err(Error::PermanentRejection(format!(
                    "Invalid field name '{}' in {}",
                    field, request.key
                )));
            }
        }

        let current = self.get(request.key.id()).cloned();
        let current_version = current.as_ref().map_or(0, |doc| doc.revision.version);
        let expected_version = request.expected_revision.map_or(0, |rev| rev.version);
        let live = current.as_ref().filter(|doc| !doc.deleted);
        let matches = expected_version == current_version;

        let fields = match request.change_type {
            ChangeType::Create if live.is_none() || matches => {
                let mut fields = Fields::new();
                request.delta.apply_to(&mut fields);
                Some(fields)
            }
            ChangeType::Update if matches => live.map(|doc| {
                let mut fields = doc.fields.clone();
                request.delta.apply_to(&mut fields);
                fields
            }),
            ChangeType::Delete if live.is_none() => {
                // Already gone; deleting again is a no-op.
                let revision = current
                    .map(|doc| doc.revision)
                    .unwrap_or_else(|| RemoteDocument::absent(request.key.clone()).revision);
                return Ok(PushOutcome::Accepted(revision));
            }
            ChangeType::Delete if matches => None,
            _ => {
                let server = current.unwrap_or_else(|| RemoteDocument::absent(request.key.clone()));
                return Ok(PushOutcome::Conflict(server));
            }
        };

        // An update against a server-side tombstone cannot be applied.
        if request.change_type == ChangeType::Update && fields.is_none() {
            let server = current.unwrap_or_else(|| RemoteDocument::absent(request.key.clone()));
            return Ok(PushOutcome::Conflict(server));
        }

        let revision = ServerRevision::new(current_version + 1, now);
        let document = RemoteDocument {
            key: request.key.clone(),
            deleted: fields.is_none(),
            fields: fields.unwrap_or_default(),
            revision,
        };
        self.record(document);
        Ok(PushOutcome::Accepted(revision))
    }

    /// Changes after `since`, oldest first. Only the latest state of each
    /// document is kept, so a document written twice appears once.
    pub fn changes_after(&self, since: u64) -> Vec<RemoteChange> {
        let mut entries: Vec<&LedgerEntry> = self
            .documents
            .values()
            .filter(|entry| entry.sequence > since)
            .collect();
        entries.sort_by_key(|entry| entry.sequence);

        entries
            .into_iter()
            .map(|entry| RemoteChange {
                key: entry.document.key.clone(),
                document: entry.document.clone(),
                cursor: SyncCursor::new(self.collection.clone(), entry.sequence),
            })
            .collect()
    }

    fn record(&mut self, document: RemoteDocument) {
        self.sequence += 1;
        let id = document.key.id().to_string();
        self.documents.insert(
            id,
            LedgerEntry {
                document,
                sequence: self.sequence,
            },
        );
    }
}

/// Authoritative state of every collection.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    collections: BTreeMap<CollectionPath, CollectionLedger>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a conditional write to the document's collection.
    pub fn push(&mut self, request: &PushRequest, now: DateTime<Utc>) -> Result<PushOutcome> {
        self.collection_mut(request.key.collection())
            .push(request, now)
    }

    /// Apply a write as another client would, expecting whatever revision
    /// the server currently holds.
    pub fn write_unconditionally(
        &mut self,
        mut request: PushRequest,
        now: DateTime<Utc>,
    ) -> Result<ServerRevision> {
        request.expected_revision = self.get(&request.key).map(|doc| doc.revision);
        match self.push(&request, now)? {
            PushOutcome::Accepted(revision) => Ok(revision),
            PushOutcome::Conflict(server) => Err(Error::Conflict(format!(
                "{} cannot be written at version {}",
                request.key, server.revision.version
            ))),
        }
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&RemoteDocument> {
        self.collections
            .get(key.collection())
            .and_then(|ledger| ledger.get(key.id()))
    }

    pub fn changes_after(&self, collection: &CollectionPath, since: u64) -> Vec<RemoteChange> {
        self.collections
            .get(collection)
            .map(|ledger| ledger.changes_after(since))
            .unwrap_or_default()
    }

    pub fn collection(&self, collection: &CollectionPath) -> Option<&CollectionLedger> {
        self.collections.get(collection)
    }

    pub fn collection_mut(&mut self, collection: &CollectionPath) -> &mut CollectionLedger {
        self.collections
            .entry(collection.clone())
            .or_insert_with(|| CollectionLedger::new(collection.clone()))
    }

    /// Replace a collection wholesale (used when loading from disk).
    pub fn insert_collection(&mut self, ledger: CollectionLedger) {
        self.collections.insert(ledger.collection.clone(), ledger);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tideline_common::FieldDelta;

    fn key(s: &str) -> DocumentKey {
        DocumentKey::parse(s).unwrap()
    }

    fn request(
        key: &DocumentKey,
        change_type: ChangeType,
        delta: FieldDelta,
        expected: Option<ServerRevision>,
    ) -> PushRequest {
        PushRequest {
            key: key.clone(),
            change_type,
            delta,
            expected_revision: expected,
        }
    }

    fn accepted(outcome: PushOutcome) -> ServerRevision {
        match outcome {
            PushOutcome::Accepted(rev) => rev,
            other => panic!("expected acceptance, got {:?}", other),
        }
    }

    #[test]
    fn test_create_update_delete() {
        let mut ledger = Ledger::new();
        let k = key("plant/1");
        let now = Utc::now();

        let v1 = accepted(
            ledger
                .push(&request(&k, ChangeType::Create, FieldDelta::new().set("water_count", 2), None), now)
                .unwrap(),
        );
        assert_eq!(v1.version, 1);

        let v2 = accepted(
            ledger
                .push(
                    &request(&k, ChangeType::Update, FieldDelta::new().increment("water_count", 3), Some(v1)),
                    now,
                )
                .unwrap(),
        );
        assert_eq!(v2.version, 2);
        assert_eq!(ledger.get(&k).unwrap().fields.get("water_count"), Some(&json!(5)));

        let v3 = accepted(
            ledger
                .push(&request(&k, ChangeType::Delete, FieldDelta::new(), Some(v2)), now)
                .unwrap(),
        );
        assert_eq!(v3.version, 3);
        assert!(ledger.get(&k).unwrap().deleted);

        // Deleting again is a no-op.
        let again = accepted(
            ledger
                .push(&request(&k, ChangeType::Delete, FieldDelta::new(), Some(v2)), now)
                .unwrap(),
        );
        assert_eq!(again.version, 3);
    }

    #[test]
    fn test_stale_expectation_conflicts() {
        let mut ledger = Ledger::new();
        let k = key("plant/1");
        let now = Utc::now();
        let v1 = accepted(
            ledger
                .push(&request(&k, ChangeType::Create, FieldDelta::new().set("a", 1), None), now)
                .unwrap(),
        );
        ledger
            .write_unconditionally(request(&k, ChangeType::Update, FieldDelta::new().set("a", 2), None), now)
            .unwrap();

        let outcome = ledger
            .push(&request(&k, ChangeType::Update, FieldDelta::new().set("a", 3), Some(v1)), now)
            .unwrap();
        match outcome {
            PushOutcome::Conflict(server) => {
                assert_eq!(server.revision.version, 2);
                assert_eq!(server.fields.get("a"), Some(&json!(2)));
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        // A create against a live document conflicts too.
        let outcome = ledger
            .push(&request(&k, ChangeType::Create, FieldDelta::new().set("a", 9), None), now)
            .unwrap();
        assert!(matches!(outcome, PushOutcome::Conflict(_)));
    }

    #[test]
    fn test_update_of_missing_document_conflicts_with_absent() {
        let mut ledger = Ledger::new();
        let k = key("plant/9");
        let outcome = ledger
            .push(&request(&k, ChangeType::Update, FieldDelta::new().set("a", 1), None), Utc::now())
            .unwrap();
        match outcome {
            PushOutcome::Conflict(server) => {
                assert!(server.deleted);
                assert_eq!(server.revision.version, 0);
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_reserved_fields_rejected() {
        let mut ledger = Ledger::new();
        let k = key("plant/1");
        let err = ledger
            .push(&request(&k, ChangeType::Create, FieldDelta::new().set("__owner", 1), None), Utc::now())
            .unwrap_err();
        assert!(matches!(err, Error::PermanentRejection(_)));
    }

    #[test]
    fn test_change_feed_keeps_latest_state() {
        let mut ledger = Ledger::new();
        let plants = CollectionPath::parse("plant").unwrap();
        let now = Utc::now();
        for id in ["1", "2"] {
            ledger
                .write_unconditionally(
                    request(&key(&format!("plant/{}", id)), ChangeType::Create, FieldDelta::new().set("n", 0), None),
                    now,
                )
                .unwrap();
        }
        ledger
            .write_unconditionally(request(&key("plant/1"), ChangeType::Update, FieldDelta::new().increment("n", 1), None), now)
            .unwrap();

        let changes = ledger.changes_after(&plants, 0);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].key.id(), "2");
        assert_eq!(changes[1].key.id(), "1");
        assert_eq!(changes[1].cursor.sequence, 3);

        assert!(ledger.changes_after(&plants, 3).is_empty());
    }
}
