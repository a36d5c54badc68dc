//! Core sync engine that orchestrates local mutations, uploads, remote
//! listening and reconciliation.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tideline_common::{
    ChangeType, CollectionPath, Document, DocumentKey, Error, FieldDelta, Fields, Result,
    ServerRevision, SyncCursor,
};
use tideline_remote::{
    Credential, CredentialProvider, PushOutcome, PushRequest, RemoteChange, RemoteClient,
    RemoteDocument,
};
use tideline_store::{
    ChangeEntry, ChangeLog, DocumentSnapshot, LocalStore, MemoryBackend, NewChange,
    PendingChange, SqliteBackend, DEFAULT_CHANGE_LOG_CAPACITY,
};

use crate::conflict::{ConflictEvent, ConflictResolver, MergePolicy};
use crate::locks::KeyLocks;
use crate::retry::{RetryConfig, RetryExecutor};
use crate::scheduler::{SyncMode, SyncReport, SyncRequest, SyncScheduler};
use crate::state::{EngineState, EngineStatus, SyncPhase};

/// Configuration for the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Maximum number of documents pushed per drain pass.
    pub batch_size: usize,
    /// Deadline of a single push. A push that timed out may still have
    /// reached the server; it is retried, so delivery is at-least-once.
    pub push_timeout: Duration,
    /// Backoff between drain attempts that failed transiently.
    pub retry: RetryConfig,
    /// Backoff between reconnect probes and listen restarts.
    pub reconnect: RetryConfig,
    /// When the engine drains on its own.
    pub sync_mode: SyncMode,
    /// Collections to listen on.
    pub collections: Vec<CollectionPath>,
    /// Additive fields per collection.
    pub merge_policy: MergePolicy,
    /// Maximum number of pending change log entries.
    pub change_log_capacity: usize,
    /// Buffered events per slow subscriber.
    pub event_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            push_timeout: Duration::from_secs(10),
            retry: RetryConfig::unbounded()
                .with_initial_delay(Duration::from_millis(500))
                .with_max_delay(Duration::from_secs(30)),
            reconnect: RetryConfig::unbounded()
                .with_initial_delay(Duration::from_secs(1))
                .with_max_delay(Duration::from_secs(60)),
            sync_mode: SyncMode::OnDemand,
            collections: Vec::new(),
            merge_policy: MergePolicy::default(),
            change_log_capacity: DEFAULT_CHANGE_LOG_CAPACITY,
            event_capacity: 256,
        }
    }
}

impl SyncConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_push_timeout(mut self, timeout: Duration) -> Self {
        self.push_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_reconnect(mut self, reconnect: RetryConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = mode;
        self
    }

    /// Listen on `collection` once started.
    pub fn with_collection(mut self, collection: CollectionPath) -> Self {
        if !self.collections.contains(&collection) {
            self.collections.push(collection);
        }
        self
    }

    pub fn with_merge_policy(mut self, policy: MergePolicy) -> Self {
        self.merge_policy = policy;
        self
    }

    /// Mark one field additive.
    pub fn with_additive(mut self, collection: impl Into<String>, field: impl Into<String>) -> Self {
        self.merge_policy = self.merge_policy.with_additive(collection, field);
        self
    }

    pub fn with_change_log_capacity(mut self, capacity: usize) -> Self {
        self.change_log_capacity = capacity;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

/// Notifications for UI and report collaborators.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Local changes were discarded while reconciling.
    Conflict(ConflictEvent),
    /// The server refused changes for good; they moved to the failed set.
    Rejected {
        key: DocumentKey,
        entry_ids: Vec<u64>,
        reason: String,
    },
    /// A stored document could not be decoded.
    Corrupted { key: String, reason: String },
    PhaseChanged(SyncPhase),
}

/// Main sync engine for one replica.
pub struct SyncEngine {
    store: Arc<LocalStore>,
    changelog: Arc<ChangeLog>,
    remote: Arc<dyn RemoteClient>,
    credentials: Arc<dyn CredentialProvider>,
    resolver: ConflictResolver,
    locks: KeyLocks,
    state: RwLock<EngineState>,
    /// Serializes drain passes.
    drain_lock: Mutex<()>,
    events: broadcast::Sender<SyncEvent>,
    wake: Arc<Notify>,
    config: SyncConfig,
}

impl SyncEngine {
    /// Create an engine over an existing store and change log.
    pub fn new(
        store: Arc<LocalStore>,
        changelog: Arc<ChangeLog>,
        remote: Arc<dyn RemoteClient>,
        credentials: Arc<dyn CredentialProvider>,
        config: SyncConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            store,
            changelog,
            remote,
            credentials,
            resolver: ConflictResolver::new(config.merge_policy.clone()),
            locks: KeyLocks::new(),
            state: RwLock::new(EngineState::new()),
            drain_lock: Mutex::new(()),
            events,
            wake: Arc::new(Notify::new()),
            config,
        }
    }

    /// Create an engine persisting to a SQLite database.
    ///
    /// Pending entries from a previous run are replayed once started.
    pub fn open(
        db_path: impl AsRef<Path>,
        remote: Arc<dyn RemoteClient>,
        credentials: Arc<dyn CredentialProvider>,
        config: SyncConfig,
    ) -> Result<Self> {
        let backend = Arc::new(SqliteBackend::open(db_path)?);
        let store = LocalStore::with_event_capacity(backend.clone(), config.event_capacity);
        let changelog = ChangeLog::open(backend, config.change_log_capacity)?;
        Ok(Self::new(
            Arc::new(store),
            Arc::new(changelog),
            remote,
            credentials,
            config,
        ))
    }

    /// Create an engine with volatile local state.
    pub fn in_memory(
        remote: Arc<dyn RemoteClient>,
        credentials: Arc<dyn CredentialProvider>,
        config: SyncConfig,
    ) -> Result<Self> {
        let backend = Arc::new(MemoryBackend::new());
        let store = LocalStore::with_event_capacity(backend.clone(), config.event_capacity);
        let changelog = ChangeLog::open(backend, config.change_log_capacity)?;
        Ok(Self::new(
            Arc::new(store),
            Arc::new(changelog),
            remote,
            credentials,
            config,
        ))
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn changelog(&self) -> &Arc<ChangeLog> {
        &self.changelog
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Register an observer for engine events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub async fn status(&self) -> EngineStatus {
        let state = self.state.read().await;
        EngineStatus {
            phase: state.phase,
            listening: state.listening.iter().cloned().collect(),
            pending: self.changelog.len().unwrap_or_else(|e| {
                warn!("Failed to count pending changes: {}", e);
                0
            }),
            failed: self.changelog.failed().map(|f| f.len()).unwrap_or(0),
            last_sync: state.last_sync,
            last_error: state.last_error.clone(),
            conflicts_resolved: state.conflicts_resolved,
        }
    }

    // ------------------------------------------------------------------
    // Mutation API
    // ------------------------------------------------------------------

    /// Write a whole document, replacing any existing one.
    pub async fn create(&self, key: &DocumentKey, fields: Fields) -> Result<Document> {
        self.write_local(key, ChangeType::Create, FieldDelta::from_fields(&fields))
            .await
    }

    /// Merge field changes into a document, creating it if missing.
    pub async fn update(&self, key: &DocumentKey, delta: FieldDelta) -> Result<Document> {
        self.write_local(key, ChangeType::Update, delta).await
    }

    pub async fn set_field(
        &self,
        key: &DocumentKey,
        field: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<Document> {
        self.update(key, FieldDelta::new().set(field, value)).await
    }

    /// Add `by` to a numeric field; a missing field counts as zero.
    pub async fn increment(
        &self,
        key: &DocumentKey,
        field: impl Into<String>,
        by: impl Into<Number>,
    ) -> Result<Document> {
        self.update(key, FieldDelta::new().increment(field, by)).await
    }

    /// Delete a document. Returns `false` if there was nothing to delete.
    pub async fn delete(&self, key: &DocumentKey) -> Result<bool> {
        let _guard = self.locks.lock(key).await;
        let Some(existing) = self.store.get_raw(key)?.filter(|doc| !doc.is_tombstone()) else {
            return Ok(false);
        };

        let entry = self.changelog.append(NewChange::new(
            key.clone(),
            ChangeType::Delete,
            FieldDelta::new(),
            existing.local_revision + 1,
            existing.server_revision,
        ))?;
        if let Err(e) = self.store.delete(key) {
            return Err(self.roll_back(&entry, e));
        }

        self.wake.notify_one();
        Ok(true)
    }

    pub fn get(&self, key: &DocumentKey) -> Result<Option<Document>> {
        self.store.get(key)
    }

    pub fn list<F>(&self, collection: &CollectionPath, predicate: F) -> Result<DocumentSnapshot<F>>
    where
        F: Fn(&Document) -> bool,
    {
        self.store.list(collection, predicate)
    }

    async fn write_local(
        &self,
        key: &DocumentKey,
        change_type: ChangeType,
        delta: FieldDelta,
    ) -> Result<Document> {
        let _guard = self.locks.lock(key).await;
        let existing = self.store.get_raw(key)?;
        let live = existing.as_ref().filter(|doc| !doc.is_tombstone());

        let (change_type, delta) = match (change_type, live) {
            (ChangeType::Update, Some(doc)) => {
                if delta.is_empty() {
                    return Ok(doc.clone());
                }
                let delta =
                    self.resolver
                        .normalize_local_delta(key.collection(), Some(&doc.fields), delta);
                (ChangeType::Update, delta)
            }
            _ => (ChangeType::Create, delta),
        };

        let mut document = existing.unwrap_or_else(|| Document::new(key.clone()));
        if change_type == ChangeType::Create {
            document.fields.clear();
        }
        delta.apply_to(&mut document.fields);
        document.deleted = false;
        document.local_revision += 1;

        let entry = self.changelog.append(NewChange::new(
            key.clone(),
            change_type,
            delta,
            document.local_revision,
            document.server_revision,
        ))?;
        document.updated_at = entry.created_at;

        if let Err(e) = self.store.put(document.clone()) {
            return Err(self.roll_back(&entry, e));
        }

        self.wake.notify_one();
        Ok(document)
    }

    /// Withdraw an entry whose store write failed. The log must not carry a
    /// change the store never saw.
    fn roll_back(&self, entry: &ChangeEntry, cause: Error) -> Error {
        match self.changelog.confirm(&[entry.id]) {
            Ok(_) => cause,
            Err(rollback) => {
                error!(
                    "Change {} for {} is orphaned: store write failed ({}), rollback failed ({})",
                    entry.id, entry.key, cause, rollback
                );
                Error::Storage(format!(
                    "{}; change {} for {} is still pending and could not be rolled back: {}",
                    cause, entry.id, entry.key, rollback
                ))
            }
        }
    }

    // ------------------------------------------------------------------
    // Upload
    // ------------------------------------------------------------------

    /// Push pending changes until the change log is empty.
    ///
    /// Transient failures abort the pass; entries stay pending.
    pub async fn drain(&self) -> Result<SyncReport> {
        let _drain = self.drain_lock.lock().await;
        let started = Instant::now();
        let mut report = SyncReport::default();

        if self.changelog.is_empty()? {
            return Ok(report);
        }

        self.set_phase(SyncPhase::Draining).await;
        loop {
            let pass = match self.drain_once().await {
                Ok(pass) => pass,
                Err(e) => {
                    self.drain_failed(&e).await;
                    return Err(e);
                }
            };
            report.absorb(&pass);

            let progressed = pass.pushed + pass.conflicts + pass.rejected > 0;
            let drained = match self.changelog.is_empty() {
                Ok(drained) => drained,
                Err(e) => {
                    self.drain_failed(&e).await;
                    return Err(e);
                }
            };
            if drained || !progressed {
                break;
            }
        }

        report.duration = started.elapsed();
        {
            let mut state = self.state.write().await;
            state.last_sync = Some(chrono::Utc::now());
            state.last_error = None;
        }
        self.set_phase(SyncPhase::Idle).await;

        info!(
            "Drain completed: {} pushed, {} conflicts, {} rejected in {:?}",
            report.pushed, report.conflicts, report.rejected, report.duration
        );
        Ok(report)
    }

    /// Push one batch of coalesced changes.
    pub async fn drain_once(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        let batch = self.changelog.peek_batch(self.config.batch_size.max(1))?;
        for peeked in batch {
            self.push_document(&peeked.key, &mut report).await?;
        }
        Ok(report)
    }

    async fn push_document(&self, key: &DocumentKey, report: &mut SyncReport) -> Result<()> {
        let _guard = self.locks.lock(key).await;

        // Entries may have been added since the batch was peeked.
        let Some(pending) = self.changelog.pending_for(key)? else {
            return Ok(());
        };

        // A server copy may have been applied under a pending create.
        let known = self.known_revision(key)?;
        if pending.is_local_only_delete() && known.is_none() {
            self.changelog.confirm(&pending.entry_ids)?;
            self.store.purge(key)?;
            debug!("{} never reached the server, dropped locally", key);
            report.pushed += 1;
            return Ok(());
        }

        let expected_revision = match pending.change_type {
            ChangeType::Delete => pending.expected_revision.or(known),
            _ => pending.expected_revision,
        };
        let request = PushRequest {
            key: key.clone(),
            change_type: pending.change_type,
            delta: pending.delta.clone(),
            expected_revision,
        };

        match self.push(request).await {
            Ok(PushOutcome::Accepted(revision)) => {
                self.changelog.confirm(&pending.entry_ids)?;
                if pending.change_type == ChangeType::Delete {
                    self.store.purge(key)?;
                } else {
                    let acknowledged = self.store.acknowledge(key, revision);
                    self.isolate_corruption(acknowledged)?;
                }
                debug!(
                    "Pushed {} ({} entries) at version {}",
                    key,
                    pending.entry_ids.len(),
                    revision.version
                );
                report.pushed += 1;
            }
            Ok(PushOutcome::Conflict(server)) => {
                self.set_phase(SyncPhase::Reconciling).await;
                self.reconcile(&pending, &server).await?;
                self.set_phase(SyncPhase::Draining).await;
                report.conflicts += 1;
            }
            Err(Error::PermanentRejection(reason)) => {
                self.changelog.mark_failed(&pending.entry_ids, &reason)?;
                self.emit(SyncEvent::Rejected {
                    key: key.clone(),
                    entry_ids: pending.entry_ids.clone(),
                    reason,
                });
                report.rejected += 1;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn known_revision(&self, key: &DocumentKey) -> Result<Option<ServerRevision>> {
        match self.store.get_raw(key) {
            Ok(local) => Ok(local.and_then(|doc| doc.server_revision)),
            Err(Error::StorageCorruption { key, reason }) => {
                self.report_corruption(key, reason);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn reconcile(&self, pending: &PendingChange, server: &RemoteDocument) -> Result<()> {
        let key = &pending.key;
        let local = match self.store.get_raw(key) {
            Ok(local) => local,
            Err(Error::StorageCorruption { key, reason }) => {
                self.report_corruption(key, reason);
                None
            }
            Err(e) => return Err(e),
        };

        let resolution = self.resolver.resolve(local.as_ref(), pending, server);

        // Store first: if the log update fails, the next drain conflicts
        // again and reaches the same resolution.
        self.store
            .apply_remote(key, resolution.merged.as_ref(), None)?;

        match resolution.requeue {
            Some(requeue) => {
                let local_revision = resolution
                    .merged
                    .as_ref()
                    .map_or(pending.local_revision, |doc| doc.local_revision);
                self.changelog.replace(
                    &pending.entry_ids,
                    NewChange::new(
                        key.clone(),
                        requeue.change_type,
                        requeue.delta,
                        local_revision,
                        Some(server.revision),
                    )
                    .with_field_times(requeue.field_mutated_at),
                )?;
                debug!("Requeued merged change for {}", key);
            }
            None => {
                self.changelog.confirm(&pending.entry_ids)?;
            }
        }

        self.state.write().await.conflicts_resolved += 1;
        if let Some(event) = resolution.event {
            warn!(
                "Conflict on {} ({:?}): server version {} kept",
                key, event.kind, server.revision.version
            );
            self.emit(SyncEvent::Conflict(event));
        }
        Ok(())
    }

    async fn push(&self, request: PushRequest) -> Result<PushOutcome> {
        let timeout = self.config.push_timeout;
        self.authorized(|credential| {
            let remote = Arc::clone(&self.remote);
            let request = request.clone();
            async move {
                let key = request.key.clone();
                match tokio::time::timeout(timeout, remote.push(request, &credential)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout(format!(
                        "push of {} exceeded {:?}",
                        key, timeout
                    ))),
                }
            }
        })
        .await
    }

    /// Run a remote call, refreshing the credential once if it is rejected.
    async fn authorized<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn(Credential) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let credential = self.credentials.credential().await?;
        match op(credential).await {
            Err(Error::Unauthenticated(reason)) => {
                info!("Credential rejected ({}), refreshing", reason);
                let fresh = self.credentials.refresh().await?;
                op(fresh).await
            }
            other => other,
        }
    }

    async fn drain_failed(&self, err: &Error) {
        self.record_error(err).await;
        if err.is_transient() && self.remote.ping().await.is_err() {
            self.set_phase(SyncPhase::Offline).await;
            return;
        }
        if self.phase().await == SyncPhase::Reconciling {
            // An abandoned reconciliation hands back to the drain first.
            self.set_phase(SyncPhase::Draining).await;
        }
        self.set_phase(SyncPhase::Idle).await;
    }

    /// Drain, riding out transient failures with backoff and reconnecting
    /// when the remote becomes unreachable. Only cancellation or a
    /// non-transient error ends it early.
    pub async fn drain_with_recovery(&self, cancel: &CancellationToken) -> Result<SyncReport> {
        let mut attempt = 0u32;
        loop {
            let err = match self.drain().await {
                Ok(report) => return Ok(report),
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };

            if self.phase().await == SyncPhase::Offline {
                self.reconnect(cancel).await?;
                attempt = 0;
                continue;
            }

            attempt += 1;
            if !self.config.retry.allows(attempt) {
                return Err(err);
            }
            let delay = self.config.retry.delay_for_attempt(attempt - 1);
            warn!("Drain failed: {}. Retrying in {:?}", err, delay);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn reconnect(&self, cancel: &CancellationToken) -> Result<()> {
        info!("Remote unreachable, waiting to reconnect");
        let executor = RetryExecutor::new(self.config.reconnect.clone());
        let probe = executor.execute(|| {
            let remote = Arc::clone(&self.remote);
            async move { remote.ping().await }
        });

        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = probe => {
                result?;
                info!("Remote reachable again");
                self.set_phase(SyncPhase::Idle).await;
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Download
    // ------------------------------------------------------------------

    /// Apply one server change under the document's lock.
    ///
    /// Returns `false` when the change was already reflected locally (for
    /// example the echo of this replica's own push); the cursor still
    /// advances.
    pub async fn apply_remote_change(&self, change: RemoteChange) -> Result<bool> {
        self.apply_server_document(&change.document, Some(&change.cursor))
            .await
    }

    /// Refresh one document from the server, returning its local state.
    pub async fn fetch(&self, key: &DocumentKey) -> Result<Option<Document>> {
        let server = self
            .authorized(|credential| {
                let remote = Arc::clone(&self.remote);
                let key = key.clone();
                async move { remote.fetch(&key, &credential).await }
            })
            .await?;

        if let Some(server) = server {
            self.apply_server_document(&server, None).await?;
        }
        self.store.get(key)
    }

    async fn apply_server_document(
        &self,
        server: &RemoteDocument,
        cursor: Option<&SyncCursor>,
    ) -> Result<bool> {
        let key = &server.key;
        let _guard = self.locks.lock(key).await;

        let local = match self.store.get_raw(key) {
            Ok(local) => local,
            Err(Error::StorageCorruption { key, reason }) => {
                // Replaced by the server copy below.
                self.report_corruption(key, reason);
                None
            }
            Err(e) => return Err(e),
        };

        let incoming = server.revision;
        let known = local.as_ref().and_then(|doc| doc.server_version());
        if known.is_some_and(|version| version >= incoming.version) {
            if let Some(cursor) = cursor {
                self.store.save_cursor(cursor)?;
            }
            return Ok(false);
        }

        let pending = self.changelog.pending_for(key)?;
        let next = Self::overlay(key, local, pending.as_ref(), server, incoming);
        self.store.apply_remote(key, next.as_ref(), cursor)?;
        debug!("Applied remote {} at version {}", key, incoming.version);
        Ok(true)
    }

    /// Local state after a server change, keeping pending local changes
    /// visible until they are pushed.
    fn overlay(
        key: &DocumentKey,
        local: Option<Document>,
        pending: Option<&PendingChange>,
        server: &RemoteDocument,
        incoming: ServerRevision,
    ) -> Option<Document> {
        let local_revision = local.as_ref().map_or(0, |doc| doc.local_revision);
        match pending {
            None if server.deleted => None,
            None => {
                let mut document = server.to_document();
                document.local_revision = local_revision;
                Some(document)
            }
            Some(pending) if pending.change_type == ChangeType::Delete => {
                // The tombstone stays until the delete is pushed.
                local.map(|mut document| {
                    document.server_revision = Some(incoming);
                    document
                })
            }
            Some(pending) => {
                let mut document = local.unwrap_or_else(|| Document::new(key.clone()));
                if !server.deleted {
                    let mut fields = match pending.change_type {
                        ChangeType::Create => Fields::new(),
                        _ => server.fields.clone(),
                    };
                    pending.delta.apply_to(&mut fields);
                    document.fields = fields;
                }
                document.server_revision = Some(incoming);
                Some(document)
            }
        }
    }

    /// Catch up on one collection from its stored cursor.
    pub async fn pull(&self, collection: &CollectionPath) -> Result<usize> {
        let since = self.store.cursor(collection)?;
        let changes = self
            .authorized(|credential| {
                let remote = Arc::clone(&self.remote);
                let collection = collection.clone();
                let since = since.clone();
                async move { remote.pull(&collection, since, &credential).await }
            })
            .await?;

        let mut applied = 0;
        for change in changes {
            if self.apply_remote_change(change).await? {
                applied += 1;
            }
        }
        if applied > 0 {
            info!("Pulled {} change(s) for {}", applied, collection);
        }
        Ok(applied)
    }

    /// Drain, then catch up on every configured collection.
    pub async fn sync(&self) -> Result<SyncReport> {
        let mut report = self.drain().await?;
        for collection in &self.config.collections {
            report.pulled += self.pull(collection).await?;
        }
        Ok(report)
    }

    /// Follow a collection's change feed until `cancel` fires, reconnecting
    /// with backoff whenever the stream fails.
    pub async fn listen(&self, collection: &CollectionPath, cancel: CancellationToken) {
        let mut attempt = 0u32;
        while !cancel.is_cancelled() {
            match self.listen_once(collection, &cancel).await {
                Ok(()) => attempt = 0,
                Err(e) => {
                    warn!("Listening on {} interrupted: {}", collection, e);
                    self.record_error(&e).await;
                }
            }
            if cancel.is_cancelled() {
                break;
            }

            let delay = self.config.reconnect.delay_for_attempt(attempt);
            attempt = attempt.saturating_add(1);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("Stopped listening on {}", collection);
    }

    async fn listen_once(&self, collection: &CollectionPath, cancel: &CancellationToken) -> Result<()> {
        let since = self.store.cursor(collection)?;
        let stream_cancel = cancel.child_token();
        let mut stream = self
            .authorized(|credential| {
                let remote = Arc::clone(&self.remote);
                let collection = collection.clone();
                let since = since.clone();
                let token = stream_cancel.clone();
                async move { remote.listen(&collection, since, token, &credential).await }
            })
            .await?;

        self.set_listening(collection, true).await;
        debug!("Listening on {}", collection);

        let result = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(change)) => {
                    if let Err(e) = self.apply_remote_change(change).await {
                        break Err(e);
                    }
                }
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            }
        };

        stream_cancel.cancel();
        self.set_listening(collection, false).await;
        result
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Spawn the scheduler and one listener per configured collection.
    ///
    /// Pending entries left from a previous run are drained right away.
    pub fn start(self: &Arc<Self>) -> SyncHandle {
        let cancel = CancellationToken::new();
        let (scheduler, runner) = SyncScheduler::new(
            self.config.sync_mode.clone(),
            Arc::clone(&self.wake),
            cancel.child_token(),
        );

        let mut tasks = Vec::new();

        let engine = Arc::clone(self);
        let token = cancel.clone();
        tasks.push(tokio::spawn(runner.run(move |request| {
            let engine = Arc::clone(&engine);
            let token = token.clone();
            async move { engine.run_request(request, &token).await }
        })));

        for collection in self.config.collections.clone() {
            let engine = Arc::clone(self);
            let token = cancel.child_token();
            tasks.push(tokio::spawn(async move {
                engine.listen(&collection, token).await;
            }));
        }

        // A drain also surfaces a log that cannot be read.
        if !matches!(self.changelog.is_empty(), Ok(true)) {
            self.wake.notify_one();
        }

        info!(
            "Sync engine started ({} collection(s), remote '{}')",
            self.config.collections.len(),
            self.remote.name()
        );
        SyncHandle {
            scheduler,
            cancel,
            tasks,
        }
    }

    async fn run_request(&self, request: SyncRequest, cancel: &CancellationToken) -> Result<SyncReport> {
        let mut report = self.drain_with_recovery(cancel).await?;
        if request == SyncRequest::Full {
            for collection in &self.config.collections {
                report.pulled += self.pull(collection).await?;
            }
        }
        Ok(report)
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    async fn phase(&self) -> SyncPhase {
        self.state.read().await.phase
    }

    async fn set_phase(&self, phase: SyncPhase) {
        let mut state = self.state.write().await;
        if state.phase == phase {
            return;
        }
        if !state.phase.can_transition_to(phase) {
            warn!("Unexpected phase change {} -> {}", state.phase, phase);
        }
        debug!("Phase {} -> {}", state.phase, phase);
        state.phase = phase;
        drop(state);
        self.emit(SyncEvent::PhaseChanged(phase));
    }

    async fn set_listening(&self, collection: &CollectionPath, listening: bool) {
        let mut state = self.state.write().await;
        if listening {
            state.listening.insert(collection.clone());
        } else {
            state.listening.remove(collection);
        }
    }

    async fn record_error(&self, err: &Error) {
        self.state.write().await.last_error = Some(err.to_string());
    }

    fn isolate_corruption(&self, result: Result<()>) -> Result<()> {
        match result {
            Err(Error::StorageCorruption { key, reason }) => {
                self.report_corruption(key, reason);
                Ok(())
            }
            other => other,
        }
    }

    fn report_corruption(&self, key: String, reason: String) {
        error!("Corrupted local document {}: {}", key, reason);
        self.emit(SyncEvent::Corrupted { key, reason });
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Handle to a started engine.
pub struct SyncHandle {
    scheduler: SyncScheduler,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncHandle {
    /// Drain and catch up now, waiting for the result.
    pub async fn request_sync(&self) -> Result<SyncReport> {
        self.scheduler.request(SyncRequest::Full).await
    }

    /// Drain now, waiting for the result.
    pub async fn request_drain(&self) -> Result<SyncReport> {
        self.scheduler.request(SyncRequest::Drain).await
    }

    /// Token cancelled on shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop listening and scheduling, waiting for every task to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!("Sync task failed: {}", e);
            }
        }
        info!("Sync engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tideline_common::FieldChange;
    use tideline_remote::{MemoryRemote, StaticCredentials};
    use tideline_store::{ChangeLogBackend, DocumentBackend, DocumentWrite, FailedChange};

    fn engine(remote: &MemoryRemote, config: SyncConfig) -> SyncEngine {
        SyncEngine::in_memory(
            Arc::new(remote.clone()),
            Arc::new(StaticCredentials::anonymous()),
            config,
        )
        .unwrap()
    }

    fn key(s: &str) -> DocumentKey {
        DocumentKey::parse(s).unwrap()
    }

    /// Memory backend whose document or log writes can be switched to fail.
    struct FlakyBackend {
        inner: MemoryBackend,
        fail_documents: AtomicBool,
        fail_log: AtomicBool,
    }

    impl FlakyBackend {
        fn new() -> Self {
            Self {
                inner: MemoryBackend::new(),
                fail_documents: AtomicBool::new(false),
                fail_log: AtomicBool::new(false),
            }
        }

        fn check(flag: &AtomicBool) -> Result<()> {
            if flag.load(Ordering::SeqCst) {
                return Err(Error::Storage("disk full".to_string()));
            }
            Ok(())
        }
    }

    impl DocumentBackend for FlakyBackend {
        fn name(&self) -> &str {
            "flaky"
        }

        fn load(&self, key: &DocumentKey) -> Result<Option<Document>> {
            self.inner.load(key)
        }

        fn write(&self, write: DocumentWrite<'_>, cursor: Option<&SyncCursor>) -> Result<()> {
            Self::check(&self.fail_documents)?;
            self.inner.write(write, cursor)
        }

        fn scan(&self, collection: &CollectionPath) -> Result<Vec<Result<Document>>> {
            self.inner.scan(collection)
        }

        fn load_cursor(&self, collection: &CollectionPath) -> Result<Option<SyncCursor>> {
            self.inner.load_cursor(collection)
        }

        fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
            Self::check(&self.fail_documents)?;
            self.inner.save_cursor(cursor)
        }
    }

    impl ChangeLogBackend for FlakyBackend {
        fn load_pending(&self) -> Result<Vec<ChangeEntry>> {
            self.inner.load_pending()
        }

        fn load_failed(&self) -> Result<Vec<FailedChange>> {
            self.inner.load_failed()
        }

        fn max_id(&self) -> Result<u64> {
            self.inner.max_id()
        }

        fn insert(&self, entry: &ChangeEntry) -> Result<()> {
            self.inner.insert(entry)
        }

        fn replace(&self, ids: &[u64], replacement: Option<&ChangeEntry>) -> Result<()> {
            Self::check(&self.fail_log)?;
            self.inner.replace(ids, replacement)
        }

        fn record_failed(&self, failed: &[FailedChange]) -> Result<()> {
            self.inner.record_failed(failed)
        }
    }

    fn flaky_engine(remote: &MemoryRemote, backend: &Arc<FlakyBackend>) -> SyncEngine {
        let store = LocalStore::new(backend.clone());
        let changelog = ChangeLog::open(backend.clone(), DEFAULT_CHANGE_LOG_CAPACITY).unwrap();
        SyncEngine::new(
            Arc::new(store),
            Arc::new(changelog),
            Arc::new(remote.clone()),
            Arc::new(StaticCredentials::anonymous()),
            SyncConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_mutations_append_to_change_log() {
        let remote = MemoryRemote::new();
        let engine = engine(&remote, SyncConfig::default());
        let k = key("plant/1");

        let doc = engine.set_field(&k, "name", "fern").await.unwrap();
        assert_eq!(doc.local_revision, 1);
        let doc = engine.increment(&k, "water_count", 2).await.unwrap();
        assert_eq!(doc.local_revision, 2);
        assert_eq!(doc.field("water_count"), Some(&json!(2)));

        let entries = engine.changelog().entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].change_type, ChangeType::Create);
        assert_eq!(entries[1].change_type, ChangeType::Update);
        assert_eq!(engine.get(&k).unwrap(), Some(doc));
    }

    #[tokio::test]
    async fn test_additive_set_is_logged_as_increment() {
        let remote = MemoryRemote::new();
        let engine = engine(&remote, SyncConfig::default().with_additive("plant", "water_count"));
        let k = key("plant/1");

        engine.set_field(&k, "water_count", 2).await.unwrap();
        engine.set_field(&k, "water_count", 3).await.unwrap();

        let entries = engine.changelog().entries().unwrap();
        assert_eq!(
            entries[1].delta.get("water_count"),
            Some(&FieldChange::Increment(Number::from(1)))
        );
        assert_eq!(
            engine.get(&k).unwrap().unwrap().field("water_count"),
            Some(&json!(3))
        );
    }

    #[tokio::test]
    async fn test_capacity_exceeded_leaves_store_untouched() {
        let remote = MemoryRemote::new();
        let engine = engine(&remote, SyncConfig::default().with_change_log_capacity(1));

        engine.set_field(&key("plant/1"), "n", 1).await.unwrap();
        let err = engine.set_field(&key("plant/2"), "n", 1).await.unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded(1)));
        assert!(engine.get(&key("plant/2")).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drain_pushes_and_acknowledges() {
        let remote = MemoryRemote::new();
        let engine = engine(&remote, SyncConfig::default());
        let k = key("plant/1");

        engine.set_field(&k, "name", "fern").await.unwrap();
        let report = engine.drain().await.unwrap();

        assert_eq!(report.pushed, 1);
        assert!(engine.changelog().is_empty().unwrap());
        let local = engine.get(&k).unwrap().unwrap();
        assert_eq!(local.server_version(), Some(1));
        assert_eq!(remote.document(&k).unwrap().fields.get("name"), Some(&json!("fern")));
        assert_eq!(engine.status().await.phase, SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_local_only_delete_never_reaches_server() {
        let remote = MemoryRemote::new();
        let engine = engine(&remote, SyncConfig::default());
        let k = key("plant/1");

        engine.set_field(&k, "name", "fern").await.unwrap();
        assert!(engine.delete(&k).await.unwrap());
        assert!(!engine.delete(&k).await.unwrap());

        engine.drain().await.unwrap();
        assert_eq!(remote.push_count(), 0);
        assert!(engine.store().get_raw(&k).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_after_sync_purges_on_acknowledgement() {
        let remote = MemoryRemote::new();
        let engine = engine(&remote, SyncConfig::default());
        let k = key("plant/1");

        engine.set_field(&k, "name", "fern").await.unwrap();
        engine.drain().await.unwrap();
        engine.delete(&k).await.unwrap();
        assert!(engine.store().get_raw(&k).unwrap().unwrap().deleted);

        engine.drain().await.unwrap();
        assert!(engine.store().get_raw(&k).unwrap().is_none());
        assert!(remote.document(&k).unwrap().deleted);
    }

    #[tokio::test]
    async fn test_offline_drain_keeps_entries() {
        let remote = MemoryRemote::new();
        let engine = engine(&remote, SyncConfig::default());
        engine.set_field(&key("plant/1"), "name", "fern").await.unwrap();

        remote.set_online(false).unwrap();
        let err = engine.drain().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(engine.changelog().len().unwrap(), 1);

        let status = engine.status().await;
        assert_eq!(status.phase, SyncPhase::Offline);
        assert!(status.last_error.is_some());
    }

    #[tokio::test]
    async fn test_push_timeout_is_transient() {
        let remote = MemoryRemote::new();
        let engine = engine(
            &remote,
            SyncConfig::default().with_push_timeout(Duration::from_millis(20)),
        );
        engine.set_field(&key("plant/1"), "name", "fern").await.unwrap();

        remote.set_push_delay(Some(Duration::from_millis(500))).unwrap();
        let err = engine.drain().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(engine.changelog().len().unwrap(), 1);
        // The remote is reachable, so this is not an outage.
        assert_eq!(engine.status().await.phase, SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_fetch_refreshes_one_document() {
        let remote = MemoryRemote::new();
        let engine = engine(&remote, SyncConfig::default());
        let k = key("plant/1");

        assert!(engine.fetch(&k).await.unwrap().is_none());

        remote
            .apply_external(&k, ChangeType::Create, FieldDelta::new().set("name", "fern"))
            .unwrap();
        let doc = engine.fetch(&k).await.unwrap().unwrap();
        assert_eq!(doc.field("name"), Some(&json!("fern")));
        assert_eq!(doc.server_version(), Some(1));
        // No cursor was involved.
        assert!(engine
            .store()
            .cursor(&CollectionPath::parse("plant").unwrap())
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_failed_store_write_withdraws_entry() {
        let remote = MemoryRemote::new();
        let backend = Arc::new(FlakyBackend::new());
        let engine = flaky_engine(&remote, &backend);
        backend.fail_documents.store(true, Ordering::SeqCst);

        let err = engine.set_field(&key("plant/1"), "name", "fern").await.unwrap_err();
        assert!(matches!(err, Error::Storage(ref reason) if reason == "disk full"));
        assert!(engine.changelog().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_failed_rollback_reports_orphaned_entry() {
        let remote = MemoryRemote::new();
        let backend = Arc::new(FlakyBackend::new());
        let engine = flaky_engine(&remote, &backend);
        backend.fail_documents.store(true, Ordering::SeqCst);
        backend.fail_log.store(true, Ordering::SeqCst);

        let err = engine.set_field(&key("plant/1"), "name", "fern").await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
        assert!(err.to_string().contains("could not be rolled back"));
        assert_eq!(engine.changelog().len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_aborted_reconcile_returns_through_draining() {
        let remote = MemoryRemote::new();
        let backend = Arc::new(FlakyBackend::new());
        let engine = flaky_engine(&remote, &backend);
        let k = key("plant/1");

        engine.set_field(&k, "name", "fern").await.unwrap();
        engine.drain().await.unwrap();
        remote
            .apply_external(&k, ChangeType::Update, FieldDelta::new().set("room", "hall"))
            .unwrap();
        engine.set_field(&k, "name", "ivy").await.unwrap();

        let mut events = engine.subscribe();
        backend.fail_documents.store(true, Ordering::SeqCst);
        assert!(engine.drain().await.is_err());

        let phases: Vec<SyncPhase> = std::iter::from_fn(|| events.try_recv().ok())
            .filter_map(|event| match event {
                SyncEvent::PhaseChanged(phase) => Some(phase),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![
                SyncPhase::Draining,
                SyncPhase::Reconciling,
                SyncPhase::Draining,
                SyncPhase::Idle
            ]
        );
        for pair in phases.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]));
        }
        assert_eq!(engine.changelog().len().unwrap(), 1);
    }

    #[test]
    fn test_config_roundtrip() {
        let config = SyncConfig::default()
            .with_collection(CollectionPath::parse("plant").unwrap())
            .with_additive("plant", "water_count")
            .with_sync_mode(SyncMode::Hybrid {
                interval: Duration::from_secs(30),
            });
        let json = serde_json::to_string(&config).unwrap();
        let back: SyncConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);

        let partial: SyncConfig = serde_json::from_str(r#"{ "batch_size": 5 }"#).unwrap();
        assert_eq!(partial.batch_size, 5);
        assert_eq!(partial.push_timeout, SyncConfig::default().push_timeout);
    }
}
