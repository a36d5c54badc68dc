//! Directory-backed remote.
//!
//! Each collection is a JSON ledger at `<root>/<collection path>/ledger.json`.
//! Several replicas on one machine can sync through the same root; listen
//! streams poll the ledger file.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tideline_common::{CollectionPath, DocumentKey, Error, Result, SyncCursor};

use crate::client::{ChangeStream, PushOutcome, PushRequest, RemoteChange, RemoteClient, RemoteDocument};
use crate::credentials::Credential;
use crate::ledger::CollectionLedger;

const LEDGER_FILE: &str = "ledger.json";

/// Default interval between ledger polls of a listen stream.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Remote document store kept in a local directory.
#[derive(Clone)]
pub struct DirectoryRemote {
    root: PathBuf,
    poll_interval: Duration,
    /// Serializes read-modify-write cycles within this process.
    write_lock: Arc<Mutex<()>>,
}

impl DirectoryRemote {
    /// Open a remote rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    /// - Permission denied or other I/O failure creating the root
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }
        Ok(Self {
            root,
            poll_interval: DEFAULT_POLL_INTERVAL,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ledger_path(&self, collection: &CollectionPath) -> PathBuf {
        let mut path = self.root.clone();
        for component in collection.components() {
            path.push(component);
        }
        path.push(LEDGER_FILE);
        path
    }

    fn ensure_reachable(&self) -> Result<()> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(Error::TransientNetwork(format!(
                "remote directory {} is unavailable",
                self.root.display()
            )))
        }
    }

    async fn load(&self, collection: &CollectionPath) -> Result<CollectionLedger> {
        self.ensure_reachable()?;
        let path = self.ledger_path(collection);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::Serialization(format!("ledger {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(CollectionLedger::new(collection.clone())),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, ledger: &CollectionLedger) -> Result<()> {
        let path = self.ledger_path(ledger.collection());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(ledger)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

struct PollState {
    remote: DirectoryRemote,
    collection: CollectionPath,
    since: u64,
    buffer: VecDeque<RemoteChange>,
    cancel: CancellationToken,
    done: bool,
}

impl PollState {
    async fn next(mut self) -> Option<(Result<RemoteChange>, Self)> {
        loop {
            if self.done || self.cancel.is_cancelled() {
                return None;
            }
            if let Some(change) = self.buffer.pop_front() {
                self.since = change.cursor.sequence;
                return Some((Ok(change), self));
            }

            match self.remote.load(&self.collection).await {
                Ok(ledger) => self.buffer.extend(ledger.changes_after(self.since)),
                Err(e) => {
                    warn!("Polling {} failed: {}", self.collection, e);
                    self.done = true;
                    return Some((Err(e), self));
                }
            }
            if !self.buffer.is_empty() {
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.remote.poll_interval) => {}
            }
        }
    }
}

#[async_trait]
impl RemoteClient for DirectoryRemote {
    fn name(&self) -> &str {
        "directory"
    }

    async fn push(&self, request: PushRequest, _credential: &Credential) -> Result<PushOutcome> {
        let _guard = self.write_lock.lock().await;
        let mut ledger = self.load(request.key.collection()).await?;
        let outcome = ledger.push(&request, Utc::now())?;
        if let PushOutcome::Accepted(revision) = &outcome {
            self.save(&ledger).await?;
            debug!("Accepted {} at version {}", request.key, revision.version);
        }
        Ok(outcome)
    }

    async fn fetch(
        &self,
        key: &DocumentKey,
        _credential: &Credential,
    ) -> Result<Option<RemoteDocument>> {
        let ledger = self.load(key.collection()).await?;
        Ok(ledger.get(key.id()).cloned())
    }

    async fn listen(
        &self,
        collection: &CollectionPath,
        since: Option<SyncCursor>,
        cancel: CancellationToken,
        _credential: &Credential,
    ) -> Result<ChangeStream> {
        self.ensure_reachable()?;
        let state = PollState {
            remote: self.clone(),
            collection: collection.clone(),
            since: since.map_or(0, |cursor| cursor.sequence),
            buffer: VecDeque::new(),
            cancel,
            done: false,
        };
        Ok(Box::pin(stream::unfold(state, PollState::next)))
    }

    async fn pull(
        &self,
        collection: &CollectionPath,
        since: Option<SyncCursor>,
        _credential: &Credential,
    ) -> Result<Vec<RemoteChange>> {
        let ledger = self.load(collection).await?;
        Ok(ledger.changes_after(since.map_or(0, |cursor| cursor.sequence)))
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_reachable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;
    use tempfile::TempDir;
    use tideline_common::{ChangeType, FieldDelta};

    fn create(key: &str, water: i64) -> PushRequest {
        PushRequest {
            key: DocumentKey::parse(key).unwrap(),
            change_type: ChangeType::Create,
            delta: FieldDelta::new().set("water_count", water),
            expected_revision: None,
        }
    }

    #[tokio::test]
    async fn test_push_persists_ledger() {
        let temp = TempDir::new().unwrap();
        let credential = Credential::anonymous();
        let remote = DirectoryRemote::new(temp.path()).unwrap();

        let outcome = remote.push(create("parents/p1/children/c7", 2), &credential).await.unwrap();
        assert!(matches!(outcome, PushOutcome::Accepted(_)));
        assert!(temp.path().join("parents/p1/children").join(LEDGER_FILE).exists());

        // A second instance over the same root sees the write.
        let other = DirectoryRemote::new(temp.path()).unwrap();
        let key = DocumentKey::parse("parents/p1/children/c7").unwrap();
        let doc = other.fetch(&key, &credential).await.unwrap().unwrap();
        assert_eq!(doc.fields.get("water_count"), Some(&json!(2)));
        assert_eq!(doc.revision.version, 1);
    }

    #[tokio::test]
    async fn test_conflict_leaves_ledger_untouched() {
        let temp = TempDir::new().unwrap();
        let credential = Credential::anonymous();
        let remote = DirectoryRemote::new(temp.path()).unwrap();

        remote.push(create("plant/1", 2), &credential).await.unwrap();
        let outcome = remote.push(create("plant/1", 7), &credential).await.unwrap();
        match outcome {
            PushOutcome::Conflict(server) => assert_eq!(server.fields.get("water_count"), Some(&json!(2))),
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_polled_listen() {
        let temp = TempDir::new().unwrap();
        let credential = Credential::anonymous();
        let remote = DirectoryRemote::new(temp.path())
            .unwrap()
            .with_poll_interval(Duration::from_millis(10));
        let plants = CollectionPath::parse("plant").unwrap();

        let cancel = CancellationToken::new();
        let mut stream = remote
            .listen(&plants, None, cancel.clone(), &credential)
            .await
            .unwrap();

        remote.push(create("plant/1", 1), &credential).await.unwrap();
        let change = stream.next().await.unwrap().unwrap();
        assert_eq!(change.key.id(), "1");
        assert_eq!(change.cursor.sequence, 1);

        cancel.cancel();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_missing_root_is_transient() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("hub");
        let remote = DirectoryRemote::new(&root).unwrap();
        std::fs::remove_dir_all(&root).unwrap();

        let err = remote.ping().await.unwrap_err();
        assert!(err.is_transient());
    }
}
