//! Applies fetched remote changes to the local entity store.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use tapedeck_common::{AssetRef, EntityId, Error, RecordId, RemoteRecord, Result};
use tapedeck_storage::{AssetStore, RemoteStore};

use crate::entity::{EntityType, Recording, SyncEntity};
use crate::repository::{EntityBatch, EntityRepository};
use crate::retry::RetryExecutor;
use crate::tombstone::{Tombstone, TombstoneLedger, TOMBSTONE_RECORD_TYPE};
use crate::translate::{self, fields};

/// Remote changes collected from the delta feed, oldest first.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub changed: Vec<RemoteRecord>,
    pub deleted: Vec<RecordId>,
}

impl ChangeSet {
    pub fn len(&self) -> usize {
        self.changed.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What one apply pass changed locally.
#[derive(Debug, Clone, Default)]
pub struct ApplyReport {
    /// Entities inserted or replaced.
    pub applied: Vec<SyncEntity>,
    /// Entities deleted.
    pub deleted: Vec<(EntityType, EntityId)>,
    /// Records ignored: malformed, stale, echoes or tombstoned.
    pub skipped: usize,
    /// Entities whose update was abandoned because the asset could not be copied.
    pub failed: usize,
}

/// Asset work done for one entity before the batch commits.
enum AssetChange {
    None,
    Installed(String),
    /// Staged over `name`; a previous payload under another name goes after commit.
    Swapped { name: String, stale: Option<String> },
    /// The recording lost its audio; the payload goes after commit.
    Released(String),
}

/// Asset files written ahead of the batch, undone if it does not commit.
#[derive(Default)]
struct StagedAssets {
    installed: Vec<String>,
    swapped: Vec<String>,
}

impl StagedAssets {
    fn contains(&self, name: &str) -> bool {
        self.installed.iter().chain(&self.swapped).any(|n| n == name)
    }
}

/// Turns remote records into one local batch write.
pub struct ChangeApplier {
    repository: Arc<dyn EntityRepository>,
    assets: Arc<dyn AssetStore>,
    remote: Arc<dyn RemoteStore>,
    retry: RetryExecutor,
    max_asset_bytes: u64,
}

impl ChangeApplier {
    pub fn new(
        repository: Arc<dyn EntityRepository>,
        assets: Arc<dyn AssetStore>,
        remote: Arc<dyn RemoteStore>,
        retry: RetryExecutor,
        max_asset_bytes: u64,
    ) -> Self {
        Self {
            repository,
            assets,
            remote,
            retry,
            max_asset_bytes,
        }
    }

    /// Apply a change set.
    ///
    /// Deletions come from foreign tombstones and from records removed on the
    /// server. Tombstones issued by this device are echoes and ignored. All
    /// entity writes go to the repository in a single batch.
    ///
    /// # Errors
    /// - The repository write failed; nothing was committed
    /// - A cycle-fatal error while downloading an asset
    pub async fn apply(&self, changes: ChangeSet, ledger: &mut TombstoneLedger) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();
        let mut targets: BTreeSet<(EntityType, EntityId)> = BTreeSet::new();
        let mut upserts: Vec<RemoteRecord> = Vec::new();

        for record in changes.changed {
            if record.record_type() != TOMBSTONE_RECORD_TYPE {
                upserts.push(record);
                continue;
            }
            match Tombstone::from_record(&record) {
                Ok(tombstone) if ledger.is_self_originated(&tombstone) => {
                    debug!("Ignoring echo of own tombstone for {}", tombstone.id);
                    report.skipped += 1;
                }
                Ok(tombstone) => {
                    targets.insert((tombstone.entity_type, tombstone.id.clone()));
                    ledger.observe(tombstone);
                }
                Err(e) => {
                    warn!("Skipping malformed tombstone: {}", e);
                    report.skipped += 1;
                }
            }
        }

        for id in changes.deleted {
            if let Some(entity_type) = EntityType::from_record_type(&id.record_type) {
                match EntityId::new(id.name.as_str()) {
                    Ok(entity_id) => {
                        targets.insert((entity_type, entity_id));
                    }
                    Err(_) => report.skipped += 1,
                }
            }
        }

        let mut batch = EntityBatch::default();
        let mut staged = StagedAssets::default();
        let mut stale_assets: Vec<String> = Vec::new();

        for record in upserts {
            let incoming = match translate::from_record(&record) {
                Ok(entity) => entity,
                Err(e) => {
                    warn!("Skipping record {}: {}", record.id, e);
                    report.skipped += 1;
                    continue;
                }
            };
            let key = (incoming.entity_type(), incoming.id().clone());
            if targets.contains(&key) || ledger.contains(incoming.id()) {
                debug!("Skipping tombstoned {} {}", key.0, key.1);
                report.skipped += 1;
                continue;
            }

            let local = match self.repository.get(key.0, &key.1).await {
                Ok(local) => local,
                Err(e) => {
                    self.roll_back(&staged).await;
                    return Err(e);
                }
            };
            if let Some(local) = &local {
                if incoming.modified_at() <= local.modified_at() {
                    report.skipped += 1;
                    continue;
                }
            }

            let prepared = self
                .prepare_assets(incoming, local.as_ref(), &record, &staged)
                .await;
            let (entity, change) = match prepared {
                Ok(prepared) => prepared,
                Err(e) if e.is_cycle_fatal() => {
                    self.roll_back(&staged).await;
                    return Err(e);
                }
                Err(e) => {
                    warn!("Abandoning update of {} {}: {}", key.0, key.1, e);
                    report.failed += 1;
                    continue;
                }
            };
            match change {
                AssetChange::None => {}
                AssetChange::Installed(name) => staged.installed.push(name),
                AssetChange::Swapped { name, stale } => {
                    staged.swapped.push(name);
                    stale_assets.extend(stale);
                }
                AssetChange::Released(name) => stale_assets.push(name),
            }
            batch.upserts.push(entity);
        }

        let mut doomed_assets: Vec<String> = Vec::new();
        for (entity_type, id) in targets {
            let local = match self.repository.get(entity_type, &id).await {
                Ok(local) => local,
                Err(e) => {
                    self.roll_back(&staged).await;
                    return Err(e);
                }
            };
            if let Some(local) = local {
                if let Some(name) = local.asset_name() {
                    doomed_assets.push(name.to_string());
                }
                batch.deletions.push((entity_type, id));
            }
        }

        if batch.is_empty() {
            return Ok(report);
        }

        report.applied = batch.upserts.clone();
        report.deleted = batch.deletions.clone();
        if let Err(e) = self.repository.apply_batch(batch).await {
            self.roll_back(&staged).await;
            return Err(e);
        }
        for name in &staged.swapped {
            if let Err(e) = self.assets.commit_swap(name).await {
                warn!("Failed to drop previous payload of {}: {}", name, e);
            }
        }

        let kept: HashSet<&str> = report.applied.iter().filter_map(|e| e.asset_name()).collect();
        for name in doomed_assets.iter().chain(stale_assets.iter()) {
            if kept.contains(name.as_str()) {
                continue;
            }
            if let Err(e) = self.assets.remove(name).await {
                warn!("Failed to remove asset {}: {}", name, e);
            }
        }

        info!(
            "Applied {} remote changes, {} deletions",
            report.applied.len(),
            report.deleted.len()
        );
        Ok(report)
    }

    /// Copy the binary payload an incoming entity needs before its metadata
    /// may be written.
    async fn prepare_assets(
        &self,
        incoming: SyncEntity,
        local: Option<&SyncEntity>,
        record: &RemoteRecord,
        staged: &StagedAssets,
    ) -> Result<(SyncEntity, AssetChange)> {
        let mut recording = match incoming {
            SyncEntity::Recording(recording) => recording,
            other => return Ok((other, AssetChange::None)),
        };
        let local = match local {
            Some(SyncEntity::Recording(r)) => Some(r),
            _ => None,
        };

        let Some(name) = recording.audio_file.clone() else {
            let change = match local.and_then(|current| current.audio_file.clone()) {
                Some(previous) => AssetChange::Released(previous),
                None => AssetChange::None,
            };
            return Ok((SyncEntity::Recording(recording), change));
        };

        let Some(asset) = record.asset(fields::AUDIO) else {
            match local {
                // Keep whatever audio the local copy already has.
                Some(current) => {
                    recording.audio_file = current.audio_file.clone();
                    recording.audio_digest = current.audio_digest.clone();
                }
                None => {
                    recording.audio_file = None;
                    recording.audio_digest = None;
                }
            }
            return Ok((SyncEntity::Recording(recording), AssetChange::None));
        };

        let previous = local.and_then(|current| current.audio_file.as_deref());
        if previous != Some(name.as_str()) {
            self.ensure_unclaimed(&name, &recording.id, staged).await?;
        }

        match local {
            None => {
                let data = self.download(asset).await?;
                self.assets.install(&name, &data).await?;
                Ok((SyncEntity::Recording(recording), AssetChange::Installed(name)))
            }
            Some(current) => {
                if !self.needs_swap(current, &recording, &name).await? {
                    return Ok((SyncEntity::Recording(recording), AssetChange::None));
                }
                let data = self.download(asset).await?;
                self.assets.stage_swap(&name, &data).await?;
                let stale = current
                    .audio_file
                    .clone()
                    .filter(|previous| previous != &name);
                Ok((
                    SyncEntity::Recording(recording),
                    AssetChange::Swapped { name, stale },
                ))
            }
        }
    }

    /// Refuse an asset name another recording already uses.
    async fn ensure_unclaimed(&self, name: &str, id: &EntityId, staged: &StagedAssets) -> Result<()> {
        let claimed = staged.contains(name)
            || self
                .repository
                .list(EntityType::Recording)
                .await?
                .iter()
                .any(|other| other.id() != id && other.asset_name() == Some(name));
        if claimed {
            return Err(Error::AssetCopyFailed(format!(
                "asset {} already belongs to another recording",
                name
            )));
        }
        Ok(())
    }

    async fn needs_swap(&self, current: &Recording, incoming: &Recording, name: &str) -> Result<bool> {
        if current.audio_digest != incoming.audio_digest {
            return Ok(true);
        }
        Ok(!self.assets.exists(name).await?)
    }

    async fn download(&self, asset: &AssetRef) -> Result<Vec<u8>> {
        if let Some(size) = asset.size {
            if size > self.max_asset_bytes {
                return Err(Error::AssetTooLarge {
                    size,
                    limit: self.max_asset_bytes,
                });
            }
        }
        let remote = self.remote.as_ref();
        let data = self.retry.execute(|| remote.download_asset(asset)).await?;
        if data.len() as u64 > self.max_asset_bytes {
            return Err(Error::AssetTooLarge {
                size: data.len() as u64,
                limit: self.max_asset_bytes,
            });
        }
        Ok(data)
    }

    /// Undo asset files written for a batch that will not be committed.
    async fn roll_back(&self, staged: &StagedAssets) {
        for name in &staged.installed {
            if let Err(e) = self.assets.remove(name).await {
                warn!("Failed to discard asset {}: {}", name, e);
            }
        }
        for name in &staged.swapped {
            if let Err(e) = self.assets.rollback_swap(name).await {
                warn!("Failed to restore asset {}: {}", name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Tag;
    use crate::repository::MemoryRepository;
    use crate::tracker::content_digest;
    use chrono::{Duration, Utc};
    use tapedeck_common::{DeviceId, FieldValue, ZoneId};
    use tapedeck_storage::{LocalAssetStore, MemoryRecordStore, Operation};
    use tempfile::TempDir;

    struct Fixture {
        repo: Arc<MemoryRepository>,
        assets: Arc<LocalAssetStore>,
        remote: Arc<MemoryRecordStore>,
        applier: ChangeApplier,
        ledger: TombstoneLedger,
        _temp: TempDir,
    }

    fn fixture_with_limit(limit: u64) -> Fixture {
        let temp = TempDir::new().unwrap();
        let repo = Arc::new(MemoryRepository::new());
        let assets = Arc::new(LocalAssetStore::new(temp.path()).unwrap());
        let remote = Arc::new(MemoryRecordStore::new());
        let applier = ChangeApplier::new(
            repo.clone(),
            assets.clone(),
            remote.clone(),
            RetryExecutor::default(),
            limit,
        );
        Fixture {
            repo,
            assets,
            remote,
            applier,
            ledger: TombstoneLedger::new(DeviceId::new("local").unwrap()),
            _temp: temp,
        }
    }

    fn fixture() -> Fixture {
        fixture_with_limit(1024)
    }

    fn zone() -> ZoneId {
        ZoneId::new("Recordings")
    }

    fn recording(title: &str, audio: &[u8], age_secs: i64) -> Recording {
        let at = Utc::now() - Duration::seconds(age_secs);
        Recording {
            id: EntityId::new("r1").unwrap(),
            title: title.into(),
            created_at: at,
            modified_at: at,
            duration_secs: 2.0,
            notes: String::new(),
            tag_ids: vec![],
            album_id: None,
            is_favorite: false,
            audio_file: Some("r1.m4a".into()),
            audio_digest: Some(content_digest(audio)),
        }
    }

    async fn record_with_audio(f: &Fixture, recording: &Recording, audio: &[u8]) -> RemoteRecord {
        let mut record = translate::to_record(&SyncEntity::Recording(recording.clone()), &zone());
        let asset = f.remote.upload_asset(audio.to_vec()).await.unwrap();
        record.set(fields::AUDIO, FieldValue::Asset(asset));
        record
    }

    fn changes(changed: Vec<RemoteRecord>) -> ChangeSet {
        ChangeSet {
            changed,
            deleted: vec![],
        }
    }

    #[tokio::test]
    async fn test_insert_installs_asset_first() {
        let mut f = fixture();
        let incoming = recording("Take", b"audio", 10);
        let record = record_with_audio(&f, &incoming, b"audio").await;

        let report = f.applier.apply(changes(vec![record]), &mut f.ledger).await.unwrap();
        assert_eq!(report.applied.len(), 1);
        assert_eq!(f.assets.read("r1.m4a").await.unwrap(), b"audio");
        assert_eq!(f.repo.batch_writes(), 1);
    }

    #[tokio::test]
    async fn test_insert_abandoned_when_asset_too_large() {
        let mut f = fixture_with_limit(4);
        let incoming = recording("Take", b"too-long", 10);
        let record = record_with_audio(&f, &incoming, b"too-long").await;

        let report = f.applier.apply(changes(vec![record]), &mut f.ledger).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(f.repo.count(EntityType::Recording).await, 0);
        assert!(!f.assets.exists("r1.m4a").await.unwrap());
    }

    #[tokio::test]
    async fn test_metadata_only_update_leaves_asset_untouched() {
        let mut f = fixture();
        let local = recording("Old", b"audio", 60);
        f.repo.put(SyncEntity::Recording(local.clone())).await;
        f.assets.install("r1.m4a", b"audio").await.unwrap();

        let mut newer = recording("New", b"audio", 0);
        newer.created_at = local.created_at;
        let record = record_with_audio(&f, &newer, b"audio").await;

        f.applier.apply(changes(vec![record]), &mut f.ledger).await.unwrap();
        let stored = f.repo.get(EntityType::Recording, &local.id).await.unwrap().unwrap();
        assert!(matches!(stored, SyncEntity::Recording(r) if r.title == "New"));
        assert_eq!(f.remote.call_count(Operation::DownloadAsset).await, 0);
    }

    #[tokio::test]
    async fn test_update_with_new_audio_swaps_asset() {
        let mut f = fixture();
        f.repo.put(SyncEntity::Recording(recording("Old", b"v1", 60))).await;
        f.assets.install("r1.m4a", b"v1").await.unwrap();

        let newer = recording("Old", b"v2", 0);
        let record = record_with_audio(&f, &newer, b"v2").await;
        f.applier.apply(changes(vec![record]), &mut f.ledger).await.unwrap();

        assert_eq!(f.assets.read("r1.m4a").await.unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_older_remote_version_is_ignored() {
        let mut f = fixture();
        f.repo.put(SyncEntity::Recording(recording("Local", b"a", 0))).await;
        let stale = recording("Remote", b"a", 60);
        let record = record_with_audio(&f, &stale, b"a").await;

        let report = f.applier.apply(changes(vec![record]), &mut f.ledger).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(f.repo.batch_writes(), 0);
    }

    #[tokio::test]
    async fn test_malformed_record_does_not_abort_batch() {
        let mut f = fixture();
        let mut broken = RemoteRecord::new(RecordId::new(zone(), "Tag", "bad"));
        broken.set(fields::NAME, FieldValue::Int(3));
        let good = translate::to_record(
            &SyncEntity::Tag(Tag {
                id: EntityId::new("t1").unwrap(),
                name: "Vox".into(),
                color: "#fff".into(),
                modified_at: Utc::now(),
            }),
            &zone(),
        );

        let report = f
            .applier
            .apply(changes(vec![broken, good]), &mut f.ledger)
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.applied.len(), 1);
    }

    #[tokio::test]
    async fn test_foreign_tombstone_deletes_entity_and_asset() {
        let mut f = fixture();
        f.repo.put(SyncEntity::Recording(recording("Take", b"a", 10))).await;
        f.assets.install("r1.m4a", b"a").await.unwrap();

        let tombstone = Tombstone {
            id: EntityId::new("r1").unwrap(),
            entity_type: EntityType::Recording,
            deleted_at: Utc::now(),
            origin_device_id: DeviceId::new("peer").unwrap(),
        };
        let report = f
            .applier
            .apply(changes(vec![tombstone.to_record(&zone())]), &mut f.ledger)
            .await
            .unwrap();

        assert_eq!(report.deleted.len(), 1);
        assert_eq!(f.repo.count(EntityType::Recording).await, 0);
        assert!(!f.assets.exists("r1.m4a").await.unwrap());
        assert!(f.ledger.contains(&tombstone.id));
    }

    #[tokio::test]
    async fn test_own_tombstone_is_ignored() {
        let mut f = fixture();
        f.repo.put(SyncEntity::Recording(recording("Take", b"a", 10))).await;
        let tombstone = f.ledger.record(EntityId::new("r1").unwrap(), EntityType::Recording, Utc::now());

        let report = f
            .applier
            .apply(changes(vec![tombstone.to_record(&zone())]), &mut f.ledger)
            .await
            .unwrap();
        assert!(report.deleted.is_empty());
        assert_eq!(f.repo.batch_writes(), 0);
    }

    #[tokio::test]
    async fn test_repository_failure_discards_installed_assets() {
        let mut f = fixture();
        let incoming = recording("Take", b"audio", 10);
        let record = record_with_audio(&f, &incoming, b"audio").await;
        f.repo.fail_next_write();

        assert!(f.applier.apply(changes(vec![record]), &mut f.ledger).await.is_err());
        assert!(!f.assets.exists("r1.m4a").await.unwrap());
    }

    #[tokio::test]
    async fn test_repository_failure_restores_swapped_asset() {
        let mut f = fixture();
        let local = recording("Take", b"v1", 60);
        f.repo.put(SyncEntity::Recording(local.clone())).await;
        f.assets.install("r1.m4a", b"v1").await.unwrap();

        let newer = recording("Take", b"v2", 0);
        let record = record_with_audio(&f, &newer, b"v2").await;
        f.repo.fail_next_write();

        assert!(f.applier.apply(changes(vec![record]), &mut f.ledger).await.is_err());
        assert_eq!(f.assets.read("r1.m4a").await.unwrap(), b"v1");
        let stored = f.repo.get(EntityType::Recording, &local.id).await.unwrap();
        assert_eq!(stored, Some(SyncEntity::Recording(local)));
    }

    #[tokio::test]
    async fn test_insert_refuses_asset_of_another_recording() {
        let mut f = fixture();
        let mut owner = recording("Theirs", b"theirs", 60);
        owner.id = EntityId::new("r2").unwrap();
        f.repo.put(SyncEntity::Recording(owner)).await;
        f.assets.install("r1.m4a", b"theirs").await.unwrap();

        let incoming = recording("Mine", b"mine", 10);
        let record = record_with_audio(&f, &incoming, b"mine").await;
        let report = f.applier.apply(changes(vec![record]), &mut f.ledger).await.unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(f.assets.read("r1.m4a").await.unwrap(), b"theirs");
        assert!(f.repo.get(EntityType::Recording, &incoming.id).await.unwrap().is_none());
        assert_eq!(f.remote.call_count(Operation::DownloadAsset).await, 0);
    }

    #[tokio::test]
    async fn test_insert_replaces_unowned_leftover_file() {
        let mut f = fixture();
        f.assets.install("r1.m4a", b"leftover").await.unwrap();

        let incoming = recording("Take", b"audio", 10);
        let record = record_with_audio(&f, &incoming, b"audio").await;
        let report = f.applier.apply(changes(vec![record]), &mut f.ledger).await.unwrap();

        assert_eq!(report.applied.len(), 1);
        assert_eq!(f.assets.read("r1.m4a").await.unwrap(), b"audio");
    }

    #[tokio::test]
    async fn test_update_without_audio_removes_local_asset() {
        let mut f = fixture();
        f.repo.put(SyncEntity::Recording(recording("Take", b"a", 60))).await;
        f.assets.install("r1.m4a", b"a").await.unwrap();

        let mut newer = recording("Take", b"a", 0);
        newer.audio_file = None;
        newer.audio_digest = None;
        let record = translate::to_record(&SyncEntity::Recording(newer.clone()), &zone());

        let report = f.applier.apply(changes(vec![record]), &mut f.ledger).await.unwrap();
        assert_eq!(report.applied.len(), 1);
        assert!(!f.assets.exists("r1.m4a").await.unwrap());
        let stored = f.repo.get(EntityType::Recording, &newer.id).await.unwrap();
        assert_eq!(stored, Some(SyncEntity::Recording(newer)));
    }
}
