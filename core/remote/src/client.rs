//! Remote client trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

use tideline_common::{
    ChangeType, CollectionPath, Document, DocumentKey, FieldDelta, Fields, Result,
    ServerRevision, SyncCursor,
};

use crate::credentials::Credential;

/// A document as the server holds it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDocument {
    pub key: DocumentKey,
    pub fields: Fields,
    pub revision: ServerRevision,
    /// Deleted on the server (or never created).
    pub deleted: bool,
}

impl RemoteDocument {
    /// Placeholder for a key the server has never seen.
    pub fn absent(key: DocumentKey) -> Self {
        Self {
            key,
            fields: Fields::new(),
            revision: ServerRevision::new(0, DateTime::<Utc>::UNIX_EPOCH),
            deleted: true,
        }
    }

    /// Convert into a local document reflecting this server state.
    pub fn to_document(&self) -> Document {
        let mut doc = Document::from_server(self.key.clone(), self.fields.clone(), self.revision);
        doc.deleted = self.deleted;
        doc
    }
}

/// A conditional write.
#[derive(Debug, Clone, PartialEq)]
pub struct PushRequest {
    pub key: DocumentKey,
    pub change_type: ChangeType,
    pub delta: FieldDelta,
    /// The write only applies if the server is still at this revision
    /// (`None`: the document must not exist yet).
    pub expected_revision: Option<ServerRevision>,
}

/// Result of a push that reached the server.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// Applied; the document is now at this revision.
    Accepted(ServerRevision),
    /// Not applied; the server holds a different revision.
    Conflict(RemoteDocument),
}

/// One entry of a collection's server change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    pub key: DocumentKey,
    pub document: RemoteDocument,
    /// Cursor to resume from after applying this change.
    pub cursor: SyncCursor,
}

/// Unbounded stream of server changes.
pub type ChangeStream = Pin<Box<dyn Stream<Item = Result<RemoteChange>> + Send>>;

/// Remote document store used by the sync engine.
///
/// Transient failures are reported as `Error::TransientNetwork` or
/// `Error::Timeout`, permanent refusals as `Error::PermanentRejection`, and
/// rejected credentials as `Error::Unauthenticated`.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Get the remote name (e.g., "memory", "directory").
    fn name(&self) -> &str;

    /// Conditionally apply a change to one document.
    ///
    /// # Postconditions
    /// - `Accepted`: the change is durable on the server
    /// - `Conflict`: nothing was written; the current server state is returned
    async fn push(&self, request: PushRequest, credential: &Credential) -> Result<PushOutcome>;

    /// Read the current server state of a document.
    async fn fetch(
        &self,
        key: &DocumentKey,
        credential: &Credential,
    ) -> Result<Option<RemoteDocument>>;

    /// Stream changes of a collection after `since` (from the beginning when
    /// `None`).
    ///
    /// The stream never ends on its own while connected. It ends once
    /// `cancel` fires, and yields an error before ending when connectivity
    /// is lost.
    async fn listen(
        &self,
        collection: &CollectionPath,
        since: Option<SyncCursor>,
        cancel: CancellationToken,
        credential: &Credential,
    ) -> Result<ChangeStream>;

    /// One-shot catch-up: every change of a collection after `since`,
    /// oldest first.
    async fn pull(
        &self,
        collection: &CollectionPath,
        since: Option<SyncCursor>,
        credential: &Credential,
    ) -> Result<Vec<RemoteChange>>;

    /// Cheap connectivity probe used while reconnecting.
    async fn ping(&self) -> Result<()>;
}
