//! Core sync engine that orchestrates all sync operations.

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use tapedeck_common::{AssetRef, EntityId, Error, Result};
use tapedeck_storage::{AssetStore, RemoteStore};

use crate::apply::ChangeApplier;
use crate::cache::AssetCache;
use crate::config::SyncConfig;
use crate::conflict::ConflictResolver;
use crate::entity::{EntityType, SyncEntity};
use crate::fetch::{ChangeFetcher, FetchOutcome};
use crate::queue::{DrainReport, OfflineQueue, OperationType, PendingOperation};
use crate::repository::{EntityBatch, EntityRepository};
use crate::retry::RetryExecutor;
use crate::state::{SetupFlag, SyncStateStore};
use crate::status::{StatusPublisher, SyncStatus, UploadProgress};
use crate::tombstone::{self, Tombstone, TombstoneLedger};
use crate::tracker::ChangeTracker;
use crate::upload::UploadPipeline;

/// Collaborators the engine is built from.
#[derive(Clone)]
pub struct SyncServices {
    pub remote: Arc<dyn RemoteStore>,
    pub repository: Arc<dyn EntityRepository>,
    pub assets: Arc<dyn AssetStore>,
    pub state: Arc<dyn SyncStateStore>,
}

/// Summary of one sync cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub queued: usize,
    pub conflicts_resolved: usize,
    pub drained: usize,
    pub dropped: usize,
    pub applied: usize,
    pub deleted: usize,
    pub evicted: usize,
    pub tombstones_pruned: usize,
    pub namespace_reset: bool,
    pub duration: Duration,
}

/// How a local deletion reached the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Tombstone and primary delete were written.
    Propagated,
    /// The remote write failed; the delete waits in the offline queue.
    Queued,
}

/// Bidirectional sync engine for one device.
///
/// Owns every piece of sync-only state. Callers observe progress through
/// [`status`](Self::status) and never mutate engine state directly.
pub struct SyncEngine {
    config: SyncConfig,
    services: SyncServices,
    retry: RetryExecutor,
    uploader: UploadPipeline,
    fetcher: ChangeFetcher,
    applier: ChangeApplier,
    status: Arc<StatusPublisher>,
    tracker: Mutex<ChangeTracker>,
    ledger: Mutex<TombstoneLedger>,
    queue: Mutex<OfflineQueue>,
    cache: Option<Mutex<AssetCache>>,
    reachability: Option<watch::Receiver<bool>>,
    /// Held for the duration of a cycle.
    cycle: Mutex<()>,
    /// Set after a quota error; cleared by the next explicit sync.
    halted: AtomicBool,
}

impl SyncEngine {
    /// Create an engine, loading persisted state.
    pub async fn open(config: SyncConfig, services: SyncServices) -> Result<Self> {
        let state = services.state.as_ref();
        let tracker = ChangeTracker::load(state).await?;
        let ledger = TombstoneLedger::load(config.device_id.clone(), state).await?;
        let queue = OfflineQueue::load(config.queue_max_attempts, config.queue_ttl(), state).await?;

        let cache = match &config.cache {
            Some(cache_config) => Some(Mutex::new(AssetCache::open(cache_config).await?)),
            None => None,
        };

        let initial = if config.enabled {
            SyncStatus::Initializing
        } else {
            SyncStatus::Disabled
        };
        let status = Arc::new(StatusPublisher::new(initial));
        let retry = RetryExecutor::new(config.retry.clone());

        let uploader = UploadPipeline::new(
            services.remote.clone(),
            services.assets.clone(),
            retry.clone(),
            ConflictResolver::new(config.conflict_retries),
            status.clone(),
            config.zone.clone(),
        );
        let fetcher = ChangeFetcher::new(
            services.remote.clone(),
            services.state.clone(),
            retry.clone(),
            config.zone.clone(),
            config.fetch_page_size,
        );
        let applier = ChangeApplier::new(
            services.repository.clone(),
            services.assets.clone(),
            services.remote.clone(),
            retry.clone(),
            config.max_inbound_asset_bytes,
        );

        info!(
            "Sync engine opened for device {} ({} queued, {} tombstones)",
            config.device_id.as_str(),
            queue.len(),
            ledger.len()
        );

        Ok(Self {
            config,
            services,
            retry,
            uploader,
            fetcher,
            applier,
            status,
            tracker: Mutex::new(tracker),
            ledger: Mutex::new(ledger),
            queue: Mutex::new(queue),
            cache,
            reachability: None,
            cycle: Mutex::new(()),
            halted: AtomicBool::new(false),
        })
    }

    /// Observe network reachability; cycles fail fast while it reads false.
    pub fn with_reachability(mut self, reachability: watch::Receiver<bool>) -> Self {
        self.reachability = Some(reachability);
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn current_status(&self) -> SyncStatus {
        self.status.current()
    }

    pub fn upload_progress(&self) -> watch::Receiver<Vec<UploadProgress>> {
        self.status.subscribe_uploads()
    }

    /// Whether automatic syncs are suspended after a quota error.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub async fn pending_operations(&self) -> Vec<PendingOperation> {
        self.queue.lock().await.operations().to_vec()
    }

    pub async fn tombstones(&self) -> Vec<Tombstone> {
        self.ledger.lock().await.to_vec()
    }

    /// Run an explicitly requested full cycle.
    pub async fn sync_now(&self) -> Result<SyncReport> {
        self.run_cycle(true).await
    }

    /// Run one full cycle: drain queue, upload, fetch and apply, prune, evict.
    ///
    /// Automatic cycles (`explicit == false`) are skipped while halted.
    pub async fn run_cycle(&self, explicit: bool) -> Result<SyncReport> {
        let _cycle = self.cycle.lock().await;
        let started = Instant::now();
        let mut report = SyncReport::default();

        if !self.config.enabled {
            self.status.set(SyncStatus::Disabled);
            return Ok(report);
        }
        if explicit {
            if self.halted.swap(false, Ordering::SeqCst) {
                info!("Explicit sync requested, clearing quota halt");
            }
        } else if self.is_halted() {
            debug!("Skipping automatic sync while halted");
            return Ok(report);
        }

        info!("Starting sync cycle");
        let result = self.cycle_steps(&mut report).await;
        self.status.clear_uploads();
        report.duration = started.elapsed();

        match result {
            Ok(()) => {
                self.status.set(SyncStatus::Synced { at: Utc::now() });
                info!(
                    "Sync cycle finished in {:?}: {} uploaded, {} skipped, {} failed, {} applied, {} deleted",
                    report.duration,
                    report.uploaded,
                    report.skipped,
                    report.failed,
                    report.applied,
                    report.deleted
                );
                Ok(report)
            }
            Err(e) => {
                if matches!(e, Error::QuotaExceeded(_)) {
                    self.halted.store(true, Ordering::SeqCst);
                }
                error!("Sync cycle aborted: {}", e);
                self.status.fail(&e);
                Err(e)
            }
        }
    }

    async fn cycle_steps(&self, report: &mut SyncReport) -> Result<()> {
        self.status.syncing(0.0, "Checking account");
        self.ensure_online()?;
        self.check_account().await?;
        self.provision().await?;

        self.status.syncing(0.1, "Replaying queued operations");
        let drained = self.drain_queue().await?;
        report.drained = drained.succeeded;
        report.dropped = drained.dropped;

        self.upload_changes(report).await?;

        self.status.syncing(0.6, "Fetching remote changes");
        if !self.fetch_changes(report).await? {
            return Ok(());
        }

        self.status.syncing(0.9, "Cleaning up");
        report.tombstones_pruned = self.prune_tombstones().await?;
        report.evicted = self.evict_cache().await;
        Ok(())
    }

    fn ensure_online(&self) -> Result<()> {
        match &self.reachability {
            Some(rx) if !*rx.borrow() => Err(Error::NetworkUnavailable(
                "network is unreachable".to_string(),
            )),
            _ => Ok(()),
        }
    }

    async fn check_account(&self) -> Result<()> {
        let remote = self.services.remote.as_ref();
        let account = self.retry.execute(|| remote.account_status()).await?;
        if !account.is_available() {
            return Err(Error::AccountUnavailable(format!("{:?}", account)));
        }
        Ok(())
    }

    /// Create the zone and subscription unless already done.
    async fn provision(&self) -> Result<()> {
        let remote = self.services.remote.as_ref();
        let state = self.services.state.as_ref();
        let zone = &self.config.zone;

        if !state.flag(SetupFlag::ZoneCreated).await? {
            self.retry.execute(|| remote.create_zone(zone)).await?;
            state.set_flag(SetupFlag::ZoneCreated, true).await?;
            info!("Created zone {}", zone);
        }
        if !state.flag(SetupFlag::SubscriptionCreated).await? {
            let subscription = self.config.subscription_id.as_str();
            self.retry
                .execute(|| remote.save_subscription(zone, subscription))
                .await?;
            state.set_flag(SetupFlag::SubscriptionCreated, true).await?;
            info!("Registered subscription {}", subscription);
        }
        Ok(())
    }

    async fn drain_queue(&self) -> Result<DrainReport> {
        let mut queue = self.queue.lock().await;
        let expired = queue.sweep_expired(Utc::now());
        if queue.is_empty() {
            if expired > 0 {
                queue.persist(self.services.state.as_ref()).await?;
            }
            return Ok(DrainReport::default());
        }

        let result = queue.drain(|op| self.replay(op)).await;
        queue.persist(self.services.state.as_ref()).await?;
        let report = result?;
        if report != DrainReport::default() {
            info!(
                "Offline queue: {} replayed, {} requeued, {} dropped",
                report.succeeded, report.requeued, report.dropped
            );
        }
        Ok(report)
    }

    /// Replay one queued operation.
    async fn replay(&self, op: PendingOperation) -> Result<()> {
        match op.op_type {
            OperationType::Save => {
                if self.ledger.lock().await.contains(&op.entity_id) {
                    return Ok(());
                }
                let Some(entity) = self
                    .services
                    .repository
                    .get(op.entity_type, &op.entity_id)
                    .await?
                else {
                    debug!("Queued save of {} has no local entity", op.entity_id);
                    return Ok(());
                };
                self.uploader.save_entity(&entity).await?;
                self.tracker.lock().await.mark_synced(&entity);
                Ok(())
            }
            OperationType::Delete => {
                let tombstone =
                    self.ledger
                        .lock()
                        .await
                        .record(op.entity_id.clone(), op.entity_type, op.created_at);
                self.uploader.delete_entity(&tombstone).await
            }
        }
    }

    async fn upload_changes(&self, report: &mut SyncReport) -> Result<()> {
        let state = self.services.state.as_ref();
        let mut queue_dirty = false;
        let phases = EntityType::UPLOAD_ORDER.len() as f64;

        let mut outcome = Ok(());
        'types: for (index, entity_type) in EntityType::UPLOAD_ORDER.into_iter().enumerate() {
            self.status.syncing(
                0.15 + 0.45 * (index as f64 / phases),
                format!("Uploading {}", entity_type),
            );
            let entities = self.services.repository.list(entity_type).await?;

            for entity in entities {
                if self.ledger.lock().await.contains(entity.id()) {
                    report.skipped += 1;
                    continue;
                }
                if !self.tracker.lock().await.needs_upload(&entity) {
                    report.skipped += 1;
                    continue;
                }

                match self.uploader.save_entity(&entity).await {
                    Ok(saved) => {
                        self.tracker.lock().await.mark_synced(&entity);
                        if saved.superseded {
                            report.skipped += 1;
                        } else {
                            report.uploaded += 1;
                        }
                        report.conflicts_resolved += saved.conflicts_resolved;
                    }
                    Err(e) => {
                        report.failed += 1;
                        if self.enqueue(OperationType::Save, &entity).await {
                            report.queued += 1;
                            queue_dirty = true;
                        }
                        if e.is_cycle_fatal() {
                            outcome = Err(e);
                            break 'types;
                        }
                        warn!("Upload of {} {} failed: {}", entity_type, entity.id(), e);
                    }
                }
            }
        }

        self.tracker.lock().await.persist(state).await?;
        if queue_dirty {
            self.queue.lock().await.persist(state).await?;
        }
        outcome
    }

    async fn enqueue(&self, op_type: OperationType, entity: &SyncEntity) -> bool {
        self.queue.lock().await.enqueue(
            op_type,
            entity.entity_type(),
            entity.id().clone(),
            Utc::now(),
        )
    }

    /// Fetch and apply remote changes. Returns false when the zone was reset
    /// and the rest of the cycle must be skipped.
    async fn fetch_changes(&self, report: &mut SyncReport) -> Result<bool> {
        let state = self.services.state.as_ref();
        let mut ledger = self.ledger.lock().await;
        let outcome = self.fetcher.fetch_and_apply(&self.applier, &mut ledger).await?;

        match outcome {
            FetchOutcome::Applied(applied) => {
                ledger.persist(state).await?;
                drop(ledger);

                let mut tracker = self.tracker.lock().await;
                for entity in &applied.applied {
                    tracker.mark_synced(entity);
                }
                for (entity_type, id) in &applied.deleted {
                    tracker.forget(*entity_type, id);
                }
                tracker.persist(state).await?;

                report.applied = applied.applied.len();
                report.deleted = applied.deleted.len();
                report.skipped += applied.skipped;
                report.failed += applied.failed;
                Ok(true)
            }
            FetchOutcome::NamespaceDeleted => {
                drop(ledger);
                self.reset_namespace().await?;
                report.namespace_reset = true;
                Ok(false)
            }
        }
    }

    /// Forget everything tied to the vanished zone and provision it again.
    ///
    /// The next cycle re-uploads every local entity.
    async fn reset_namespace(&self) -> Result<()> {
        warn!("Zone {} was deleted, reprovisioning", self.config.zone);
        let state = self.services.state.as_ref();

        state.set_flag(SetupFlag::ZoneCreated, false).await?;
        state.set_flag(SetupFlag::SubscriptionCreated, false).await?;
        state.set_change_token(&self.config.zone, None).await?;

        let mut tracker = self.tracker.lock().await;
        tracker.reset();
        tracker.persist(state).await?;
        drop(tracker);

        self.provision().await
    }

    /// Prune tombstones past the retention horizon, locally and remotely.
    async fn prune_tombstones(&self) -> Result<usize> {
        let horizon = Utc::now() - self.config.tombstone_retention();

        let pruned = {
            let mut ledger = self.ledger.lock().await;
            let pruned = ledger.prune_older_than(horizon);
            if !pruned.is_empty() {
                ledger.persist(self.services.state.as_ref()).await?;
            }
            pruned.len()
        };

        match tombstone::prune_remote(
            self.services.remote.as_ref(),
            &self.retry,
            &self.config.zone,
            horizon,
        )
        .await
        {
            Ok(_) => {}
            Err(e) if e.is_cycle_fatal() => return Err(e),
            Err(e) => warn!("Remote tombstone pruning failed: {}", e),
        }
        Ok(pruned)
    }

    async fn evict_cache(&self) -> usize {
        let Some(cache) = &self.cache else {
            return 0;
        };
        match cache.lock().await.evict_if_needed(Utc::now()).await {
            Ok(report) => report.removed(),
            Err(e) => {
                warn!("Cache eviction failed: {}", e);
                0
            }
        }
    }

    /// Replay the offline queue outside of a full cycle.
    ///
    /// Does nothing while a cycle is running or the engine is halted.
    pub async fn drain_pending(&self) -> Result<DrainReport> {
        if !self.config.enabled || self.is_halted() {
            return Ok(DrainReport::default());
        }
        let Ok(_cycle) = self.cycle.try_lock() else {
            debug!("Cycle in progress, skipping queue drain");
            return Ok(DrainReport::default());
        };
        self.ensure_online()?;
        self.drain_queue().await
    }

    /// Delete an entity locally and propagate the deletion.
    ///
    /// A tombstone is issued once per id. When the remote write fails the
    /// delete is queued and retried by later cycles.
    pub async fn delete_entity(&self, entity_type: EntityType, id: &EntityId) -> Result<DeleteOutcome> {
        let state = self.services.state.as_ref();
        let local = self.services.repository.get(entity_type, id).await?;

        let tombstone = {
            let mut ledger = self.ledger.lock().await;
            let tombstone = ledger.record(id.clone(), entity_type, Utc::now());
            ledger.persist(state).await?;
            tombstone
        };

        self.services
            .repository
            .apply_batch(EntityBatch {
                upserts: Vec::new(),
                deletions: vec![(entity_type, id.clone())],
            })
            .await?;
        if let Some(name) = local.as_ref().and_then(|e| e.asset_name()) {
            if let Err(e) = self.services.assets.remove(name).await {
                warn!("Failed to remove asset {}: {}", name, e);
            }
        }

        {
            let mut tracker = self.tracker.lock().await;
            tracker.forget(entity_type, id);
            tracker.persist(state).await?;
        }

        let result = if self.config.enabled {
            self.uploader.delete_entity(&tombstone).await
        } else {
            Err(Error::AccountUnavailable("sync is disabled".to_string()))
        };

        match result {
            Ok(()) => {
                info!("Deleted {} {}", entity_type, id);
                Ok(DeleteOutcome::Propagated)
            }
            Err(e) => {
                warn!("Queueing delete of {} {}: {}", entity_type, id, e);
                let mut queue = self.queue.lock().await;
                queue.enqueue(OperationType::Delete, entity_type, id.clone(), tombstone.deleted_at);
                queue.persist(state).await?;
                Ok(DeleteOutcome::Queued)
            }
        }
    }

    /// Fetch a shared asset through the local cache.
    ///
    /// # Errors
    /// - `InvalidInput` when no cache is configured
    /// - `AssetTooLarge` when the payload exceeds the inbound ceiling
    pub async fn cached_asset(&self, asset: &AssetRef) -> Result<Vec<u8>> {
        let Some(cache) = &self.cache else {
            return Err(Error::InvalidInput("asset cache is not configured".to_string()));
        };
        cache
            .lock()
            .await
            .get_or_download(
                self.services.remote.as_ref(),
                &self.retry,
                asset,
                self.config.max_inbound_asset_bytes,
                Utc::now(),
            )
            .await
    }
}
