//! In-memory remote for testing.

use async_trait::async_trait;
use chrono::Utc;
use futures::stream;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use tideline_common::{
    ChangeType, CollectionPath, DocumentKey, Error, FieldDelta, Result, ServerRevision, SyncCursor,
};

use crate::client::{ChangeStream, PushOutcome, PushRequest, RemoteChange, RemoteClient, RemoteDocument};
use crate::credentials::Credential;
use crate::ledger::Ledger;

#[derive(Debug, Default)]
struct Faults {
    offline: bool,
    transient_failures: u32,
    rejected: HashSet<DocumentKey>,
    valid_token: Option<String>,
    push_delay: Option<Duration>,
    pushes: u64,
}

struct Shared {
    ledger: RwLock<Ledger>,
    faults: Mutex<Faults>,
    /// Bumped on every server write or connectivity change.
    generation: watch::Sender<u64>,
}

impl Shared {
    fn faults(&self) -> Result<std::sync::MutexGuard<'_, Faults>> {
        self.faults
            .lock()
            .map_err(|_| Error::Storage("remote fault state poisoned".to_string()))
    }

    fn ledger(&self) -> Result<std::sync::RwLockReadGuard<'_, Ledger>> {
        self.ledger
            .read()
            .map_err(|_| Error::Storage("remote ledger poisoned".to_string()))
    }

    fn ledger_mut(&self) -> Result<std::sync::RwLockWriteGuard<'_, Ledger>> {
        self.ledger
            .write()
            .map_err(|_| Error::Storage("remote ledger poisoned".to_string()))
    }

    fn bump(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    fn is_online(&self) -> bool {
        self.faults().map(|f| !f.offline).unwrap_or(false)
    }

    /// Connectivity and credential check shared by every call.
    fn admit(&self, credential: Option<&Credential>) -> Result<()> {
        let faults = self.faults()?;
        if faults.offline {
            return Err(Error::TransientNetwork("remote unreachable".to_string()));
        }
        if let (Some(valid), Some(credential)) = (&faults.valid_token, credential) {
            if credential.token() != valid {
                return Err(Error::Unauthenticated("token expired".to_string()));
            }
        }
        Ok(())
    }
}

/// In-memory remote document store.
///
/// Clones share the same server state, so several replicas can sync
/// against one instance while a test drives its fault controls.
#[derive(Clone)]
pub struct MemoryRemote {
    shared: Arc<Shared>,
}

impl MemoryRemote {
    /// Create an empty, online remote that accepts any credential.
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                ledger: RwLock::new(Ledger::new()),
                faults: Mutex::new(Faults::default()),
                generation,
            }),
        }
    }

    /// Switch connectivity. Open listen streams fail once offline.
    pub fn set_online(&self, online: bool) -> Result<()> {
        self.shared.faults()?.offline = !online;
        self.shared.bump();
        Ok(())
    }

    /// Fail the next `count` pushes with a transient network error.
    pub fn fail_next_pushes(&self, count: u32) -> Result<()> {
        self.shared.faults()?.transient_failures = count;
        Ok(())
    }

    /// Permanently reject every push to `key`.
    pub fn reject(&self, key: DocumentKey) -> Result<()> {
        self.shared.faults()?.rejected.insert(key);
        Ok(())
    }

    /// Only accept this bearer token (`None` accepts any).
    pub fn set_valid_token(&self, token: Option<&str>) -> Result<()> {
        self.shared.faults()?.valid_token = token.map(String::from);
        Ok(())
    }

    /// Delay every push before it reaches the ledger.
    pub fn set_push_delay(&self, delay: Option<Duration>) -> Result<()> {
        self.shared.faults()?.push_delay = delay;
        Ok(())
    }

    /// Number of pushes that reached the ledger.
    pub fn push_count(&self) -> u64 {
        self.shared.faults().map(|f| f.pushes).unwrap_or(0)
    }

    /// Write as another client would, bypassing faults and version checks.
    pub fn apply_external(
        &self,
        key: &DocumentKey,
        change_type: ChangeType,
        delta: FieldDelta,
    ) -> Result<ServerRevision> {
        let request = PushRequest {
            key: key.clone(),
            change_type,
            delta,
            expected_revision: None,
        };
        let revision = self.shared.ledger_mut()?.write_unconditionally(request, Utc::now())?;
        self.shared.bump();
        Ok(revision)
    }

    /// Current server state of a document.
    pub fn document(&self, key: &DocumentKey) -> Option<RemoteDocument> {
        self.shared
            .ledger()
            .ok()
            .and_then(|ledger| ledger.get(key).cloned())
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

struct ListenState {
    shared: Arc<Shared>,
    collection: CollectionPath,
    since: u64,
    buffer: VecDeque<RemoteChange>,
    generation: watch::Receiver<u64>,
    cancel: CancellationToken,
    done: bool,
}

impl ListenState {
    async fn next(mut self) -> Option<(Result<RemoteChange>, Self)> {
        loop {
            if self.done || self.cancel.is_cancelled() {
                return None;
            }
            if !self.shared.is_online() {
                self.done = true;
                let err = Error::TransientNetwork("listen stream disconnected".to_string());
                return Some((Err(err), self));
            }
            if let Some(change) = self.buffer.pop_front() {
                self.since = change.cursor.sequence;
                return Some((Ok(change), self));
            }

            self.generation.borrow_and_update();
            let changes = self
                .shared
                .ledger()
                .map(|ledger| ledger.changes_after(&self.collection, self.since));
            let changes = match changes {
                Ok(changes) => changes,
                Err(e) => {
                    self.done = true;
                    return Some((Err(e), self));
                }
            };
            if !changes.is_empty() {
                self.buffer.extend(changes);
                continue;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                changed = self.generation.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn push(&self, request: PushRequest, credential: &Credential) -> Result<PushOutcome> {
        self.shared.admit(Some(credential))?;

        let delay = self.shared.faults()?.push_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut faults = self.shared.faults()?;
            if faults.offline {
                return Err(Error::TransientNetwork("remote unreachable".to_string()));
            }
            if faults.transient_failures > 0 {
                faults.transient_failures -= 1;
                return Err(Error::TransientNetwork("injected failure".to_string()));
            }
            if faults.rejected.contains(&request.key) {
                return Err(Error::PermanentRejection(format!(
                    "writes to {} are not permitted",
                    request.key
                )));
            }
            faults.pushes += 1;
        }

        let outcome = self.shared.ledger_mut()?.push(&request, Utc::now())?;
        if let PushOutcome::Accepted(revision) = &outcome {
            debug!("Accepted {} at version {}", request.key, revision.version);
            self.shared.bump();
        }
        Ok(outcome)
    }

    async fn fetch(
        &self,
        key: &DocumentKey,
        credential: &Credential,
    ) -> Result<Option<RemoteDocument>> {
        self.shared.admit(Some(credential))?;
        Ok(self.shared.ledger()?.get(key).cloned())
    }

    async fn listen(
        &self,
        collection: &CollectionPath,
        since: Option<SyncCursor>,
        cancel: CancellationToken,
        credential: &Credential,
    ) -> Result<ChangeStream> {
        self.shared.admit(Some(credential))?;

        let state = ListenState {
            shared: Arc::clone(&self.shared),
            collection: collection.clone(),
            since: since.map_or(0, |cursor| cursor.sequence),
            buffer: VecDeque::new(),
            generation: self.shared.generation.subscribe(),
            cancel,
            done: false,
        };
        Ok(Box::pin(stream::unfold(state, ListenState::next)))
    }

    async fn pull(
        &self,
        collection: &CollectionPath,
        since: Option<SyncCursor>,
        credential: &Credential,
    ) -> Result<Vec<RemoteChange>> {
        self.shared.admit(Some(credential))?;
        let since = since.map_or(0, |cursor| cursor.sequence);
        Ok(self.shared.ledger()?.changes_after(collection, since))
    }

    async fn ping(&self) -> Result<()> {
        self.shared.admit(None)
    }
}
