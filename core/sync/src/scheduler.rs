//! Drain scheduling: local-write wakeups, periodic ticks and explicit
//! requests.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use tideline_common::{Error, Result};

/// When the engine drains the change log on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Only on explicit request.
    Manual,
    /// Right after every local write.
    OnDemand,
    /// At regular intervals.
    Periodic { interval: Duration },
    /// After local writes and at regular intervals.
    Hybrid { interval: Duration },
}

impl SyncMode {
    fn reacts_to_writes(&self) -> bool {
        matches!(self, SyncMode::OnDemand | SyncMode::Hybrid { .. })
    }

    fn period(&self) -> Option<Duration> {
        match self {
            SyncMode::Periodic { interval } | SyncMode::Hybrid { interval } => Some(*interval),
            _ => None,
        }
    }
}

/// Sync request types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequest {
    /// Push pending changes.
    Drain,
    /// Push pending changes, then catch up on every listened collection.
    Full,
}

/// Counters of one sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Documents whose pending changes the server accepted.
    pub pushed: usize,
    /// Push conflicts resolved.
    pub conflicts: usize,
    /// Documents whose changes were permanently rejected.
    pub rejected: usize,
    /// Remote changes applied locally.
    pub pulled: usize,
    pub duration: Duration,
}

impl SyncReport {
    pub fn absorb(&mut self, other: &SyncReport) {
        self.pushed += other.pushed;
        self.conflicts += other.conflicts;
        self.rejected += other.rejected;
        self.pulled += other.pulled;
    }
}

type Pending = (SyncRequest, oneshot::Sender<Result<SyncReport>>);

/// Requester side of the scheduler.
#[derive(Clone)]
pub struct SyncScheduler {
    request_tx: mpsc::Sender<Pending>,
    mode: SyncMode,
}

impl SyncScheduler {
    /// Create a scheduler and the runner that drives it.
    ///
    /// `wake` is notified on every local write; `cancel` stops the runner.
    pub fn new(
        mode: SyncMode,
        wake: Arc<Notify>,
        cancel: CancellationToken,
    ) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let scheduler = Self {
            request_tx,
            mode: mode.clone(),
        };
        let handle = SyncSchedulerHandle {
            mode,
            request_rx,
            wake,
            cancel,
        };
        (scheduler, handle)
    }

    /// Run a sync pass and wait for its report.
    pub async fn request(&self, request: SyncRequest) -> Result<SyncReport> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send((request, response_tx))
            .await
            .map_err(|_| Error::Cancelled)?;
        response_rx.await.map_err(|_| Error::Cancelled)?
    }

    pub fn mode(&self) -> &SyncMode {
        &self.mode
    }
}

/// Runner side of the scheduler, to be spawned on a task.
pub struct SyncSchedulerHandle {
    mode: SyncMode,
    request_rx: mpsc::Receiver<Pending>,
    wake: Arc<Notify>,
    cancel: CancellationToken,
}

impl SyncSchedulerHandle {
    /// Run until cancelled, calling `sync_fn` whenever a pass is due.
    pub async fn run<F, Fut>(mut self, sync_fn: F)
    where
        F: Fn(SyncRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<SyncReport>> + Send,
    {
        let mut periodic = self.mode.period().map(interval);
        let on_writes = self.mode.reacts_to_writes();

        info!("Sync scheduler started ({:?})", self.mode);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!("Sync scheduler shutting down");
                    break;
                }

                Some((request, response_tx)) = self.request_rx.recv() => {
                    debug!("Processing sync request: {:?}", request);
                    let result = sync_fn(request).await;
                    let _ = response_tx.send(result);
                }

                _ = self.wake.notified(), if on_writes => {
                    debug!("Local write, draining");
                    if let Err(e) = sync_fn(SyncRequest::Drain).await {
                        error!("Drain after local write failed: {}", e);
                    }
                }

                _ = Self::wait_for_periodic(&mut periodic) => {
                    debug!("Triggering periodic sync");
                    match sync_fn(SyncRequest::Full).await {
                        Ok(report) => info!(
                            "Periodic sync completed: {} pushed, {} pulled, {} conflicts, {} rejected",
                            report.pushed, report.pulled, report.conflicts, report.rejected
                        ),
                        Err(e) => error!("Periodic sync failed: {}", e),
                    }
                }
            }
        }
    }

    async fn wait_for_periodic(interval: &mut Option<tokio::time::Interval>) {
        match interval {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting(count: Arc<AtomicU32>) -> impl Fn(SyncRequest) -> futures::future::Ready<Result<SyncReport>> {
        move |_request| {
            count.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(Ok(SyncReport {
                pushed: 1,
                ..SyncReport::default()
            }))
        }
    }

    #[tokio::test]
    async fn test_sync_request() {
        let cancel = CancellationToken::new();
        let (scheduler, handle) =
            SyncScheduler::new(SyncMode::Manual, Arc::new(Notify::new()), cancel.clone());

        let count = Arc::new(AtomicU32::new(0));
        let task = tokio::spawn(handle.run(counting(count.clone())));

        let report = scheduler.request(SyncRequest::Drain).await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        cancel.cancel();
        task.await.unwrap();
        assert!(matches!(
            scheduler.request(SyncRequest::Drain).await,
            Err(Error::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_on_demand_reacts_to_writes() {
        let cancel = CancellationToken::new();
        let wake = Arc::new(Notify::new());
        let (_scheduler, handle) = SyncScheduler::new(SyncMode::OnDemand, wake.clone(), cancel.clone());

        let count = Arc::new(AtomicU32::new(0));
        let task = tokio::spawn(handle.run(counting(count.clone())));

        wake.notify_one();
        tokio::time::timeout(Duration::from_secs(1), async {
            while count.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_ignores_writes() {
        let cancel = CancellationToken::new();
        let wake = Arc::new(Notify::new());
        let (_scheduler, handle) = SyncScheduler::new(SyncMode::Manual, wake.clone(), cancel.clone());

        let count = Arc::new(AtomicU32::new(0));
        let task = tokio::spawn(handle.run(counting(count.clone())));

        wake.notify_one();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_periodic_ticks() {
        let cancel = CancellationToken::new();
        let (_scheduler, handle) = SyncScheduler::new(
            SyncMode::Periodic {
                interval: Duration::from_millis(10),
            },
            Arc::new(Notify::new()),
            cancel.clone(),
        );

        let count = Arc::new(AtomicU32::new(0));
        let task = tokio::spawn(handle.run(counting(count.clone())));

        tokio::time::timeout(Duration::from_secs(2), async {
            while count.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        task.await.unwrap();
    }

    #[test]
    fn test_mode_serialization() {
        let mode = SyncMode::Hybrid {
            interval: Duration::from_secs(30),
        };
        let json = serde_json::to_string(&mode).unwrap();
        let back: SyncMode = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mode);
    }
}
