//! Sync scheduling: debounced requests, periodic cycles and reachability.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep_until, Instant, Interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tapedeck_common::{Error, Result};

use crate::config::SyncConfig;
use crate::engine::{SyncEngine, SyncReport};
use crate::queue::DrainReport;

/// Something that can run sync cycles on behalf of the scheduler.
#[async_trait]
pub trait SyncRunner: Send + Sync {
    /// Run a full cycle. `explicit` marks a user-initiated request.
    async fn run_sync(&self, explicit: bool) -> Result<SyncReport>;

    /// Replay queued operations outside a full cycle.
    async fn drain_pending(&self) -> Result<DrainReport>;
}

#[async_trait]
impl SyncRunner for SyncEngine {
    async fn run_sync(&self, explicit: bool) -> Result<SyncReport> {
        self.run_cycle(explicit).await
    }

    async fn drain_pending(&self) -> Result<DrainReport> {
        SyncEngine::drain_pending(self).await
    }
}

/// Sync request types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequest {
    /// A local trigger. Explicit requests clear a quota halt.
    Sync { explicit: bool },
    /// The remote store announced a change.
    RemoteChange,
}

/// Front end used to request syncs.
#[derive(Clone)]
pub struct SyncScheduler {
    request_tx: mpsc::Sender<SyncRequest>,
    shutdown: CancellationToken,
}

impl SyncScheduler {
    /// Create a scheduler and the handle that runs its background loop.
    pub fn new(debounce: Duration, periodic: Option<Duration>) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(100);
        let shutdown = CancellationToken::new();

        let scheduler = Self {
            request_tx,
            shutdown: shutdown.clone(),
        };
        let handle = SyncSchedulerHandle {
            request_rx,
            debounce,
            periodic,
            reachability: None,
            shutdown,
        };
        (scheduler, handle)
    }

    /// Create a scheduler using the configured debounce and periodic interval.
    pub fn from_config(config: &SyncConfig) -> (Self, SyncSchedulerHandle) {
        Self::new(config.debounce, config.periodic_interval)
    }

    /// Request a sync. Requests within the debounce window coalesce.
    pub async fn request_sync(&self, explicit: bool) -> Result<()> {
        self.send(SyncRequest::Sync { explicit }).await
    }

    /// Forward a remote change notification.
    pub async fn notify_remote_change(&self) -> Result<()> {
        self.send(SyncRequest::RemoteChange).await
    }

    async fn send(&self, request: SyncRequest) -> Result<()> {
        self.request_tx
            .send(request)
            .await
            .map_err(|_| Error::Storage("Scheduler not running".to_string()))
    }

    /// Stop the background loop. A cycle already running completes first.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Handle for the scheduler background task.
pub struct SyncSchedulerHandle {
    request_rx: mpsc::Receiver<SyncRequest>,
    debounce: Duration,
    periodic: Option<Duration>,
    reachability: Option<watch::Receiver<bool>>,
    shutdown: CancellationToken,
}

/// A debounced request waiting for its quiet period to end.
#[derive(Debug, Clone, Copy)]
struct Pending {
    deadline: Instant,
    explicit: bool,
}

impl SyncSchedulerHandle {
    /// Drain the offline queue whenever reachability flips back to true.
    pub fn with_reachability(mut self, reachability: watch::Receiver<bool>) -> Self {
        self.reachability = Some(reachability);
        self
    }

    /// Run the scheduler loop until shutdown.
    ///
    /// Cycles run one at a time on this task; requests arriving during a
    /// cycle are debounced into the next one.
    pub async fn run(mut self, runner: Arc<dyn SyncRunner>) {
        let mut periodic = self.periodic.map(|every| interval_at(Instant::now() + every, every));
        let mut pending: Option<Pending> = None;
        let mut online = self.reachability.as_ref().map(|rx| *rx.borrow()).unwrap_or(true);

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Sync scheduler shutting down");
                    break;
                }

                request = self.request_rx.recv() => {
                    let Some(request) = request else {
                        debug!("All scheduler senders dropped");
                        break;
                    };
                    let explicit = matches!(request, SyncRequest::Sync { explicit: true });
                    let explicit = explicit || pending.map(|p| p.explicit).unwrap_or(false);
                    debug!("Sync requested ({:?}), debouncing", request);
                    pending = Some(Pending {
                        deadline: Instant::now() + self.debounce,
                        explicit,
                    });
                }

                _ = wait_for_deadline(pending) => {
                    if let Some(due) = pending.take() {
                        run_once(runner.as_ref(), due.explicit).await;
                    }
                }

                _ = wait_for_periodic(&mut periodic) => {
                    debug!("Triggering periodic sync");
                    run_once(runner.as_ref(), false).await;
                }

                changed = wait_for_reachability(&mut self.reachability) => {
                    let Some(reachable) = changed else {
                        self.reachability = None;
                        continue;
                    };
                    if reachable && !online {
                        info!("Network reachable again, draining offline queue");
                        let runner = runner.clone();
                        tokio::spawn(async move {
                            if let Err(e) = runner.drain_pending().await {
                                warn!("Queue drain after reconnect failed: {}", e);
                            }
                        });
                    }
                    online = reachable;
                }
            }
        }
    }
}

async fn run_once(runner: &dyn SyncRunner, explicit: bool) {
    match runner.run_sync(explicit).await {
        Ok(report) => debug!(
            "Scheduled sync completed: {} uploaded, {} applied",
            report.uploaded, report.applied
        ),
        Err(e) => error!("Scheduled sync failed: {}", e),
    }
}

async fn wait_for_deadline(pending: Option<Pending>) {
    match pending {
        Some(p) => sleep_until(p.deadline).await,
        None => std::future::pending().await,
    }
}

async fn wait_for_periodic(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Resolve with the new value on change, or `None` once the sender is gone.
async fn wait_for_reachability(rx: &mut Option<watch::Receiver<bool>>) -> Option<bool> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}
