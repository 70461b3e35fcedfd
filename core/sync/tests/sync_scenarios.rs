//! Multi-device scenarios against one shared in-memory record store.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use tapedeck_common::{DeviceId, EntityId, ZoneId};
use tapedeck_storage::{AssetStore, LocalAssetStore, MemoryRecordStore, Operation};
use tapedeck_sync::{
    content_digest, translate, Album, DeleteOutcome, EntityRepository, EntityType,
    MemoryRepository, MemoryStateStore, OverdubGroup, Project, Recording, RetryConfig,
    SyncConfig, SyncEngine, SyncEntity, SyncServices, Tag,
};

struct Device {
    engine: SyncEngine,
    repo: Arc<MemoryRepository>,
    assets: Arc<LocalAssetStore>,
    state: Arc<MemoryStateStore>,
    _dir: TempDir,
}

impl Device {
    async fn open(remote: &Arc<MemoryRecordStore>, name: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let repo = Arc::new(MemoryRepository::new());
        let assets = Arc::new(LocalAssetStore::new(dir.path()).unwrap());
        let state = Arc::new(MemoryStateStore::new());
        let config = SyncConfig::new(DeviceId::new(name).unwrap()).with_retry(
            RetryConfig::new(2)
                .with_base_delay(Duration::from_millis(1))
                .with_jitter(false),
        );
        let services = SyncServices {
            remote: remote.clone(),
            repository: repo.clone(),
            assets: assets.clone(),
            state: state.clone(),
        };
        let engine = SyncEngine::open(config, services).await.unwrap();
        Self {
            engine,
            repo,
            assets,
            state,
            _dir: dir,
        }
    }

    async fn get(&self, entity_type: EntityType, id: &str) -> Option<SyncEntity> {
        self.repo
            .get(entity_type, &EntityId::new(id).unwrap())
            .await
            .unwrap()
    }
}

fn zone() -> ZoneId {
    ZoneId::new("Recordings")
}

fn id(raw: &str) -> EntityId {
    EntityId::new(raw).unwrap()
}

fn tag(raw: &str, name: &str) -> SyncEntity {
    SyncEntity::Tag(Tag {
        id: id(raw),
        name: name.into(),
        color: "#ff8800".into(),
        modified_at: Utc::now(),
    })
}

async fn recording_with_audio(device: &Device, raw: &str, audio: &[u8]) -> SyncEntity {
    let file = format!("{}.m4a", raw);
    device.assets.install(&file, audio).await.unwrap();
    let now = Utc::now();
    SyncEntity::Recording(Recording {
        id: id(raw),
        title: "Morning idea".into(),
        created_at: now,
        modified_at: now,
        duration_secs: 12.5,
        notes: "hummed in the kitchen".into(),
        tag_ids: vec![id("t1")],
        album_id: None,
        is_favorite: false,
        audio_file: Some(file),
        audio_digest: Some(content_digest(audio)),
    })
}

async fn pair() -> (Arc<MemoryRecordStore>, Device, Device) {
    let remote = Arc::new(MemoryRecordStore::new());
    let a = Device::open(&remote, "device-a").await;
    let b = Device::open(&remote, "device-b").await;
    (remote, a, b)
}

#[tokio::test]
async fn applying_the_same_tombstone_twice_is_idempotent() {
    let (_remote, a, b) = pair().await;
    a.repo.put(tag("t1", "Drums")).await;
    a.engine.sync_now().await.unwrap();
    b.engine.sync_now().await.unwrap();
    assert!(b.get(EntityType::Tag, "t1").await.is_some());

    let outcome = a.engine.delete_entity(EntityType::Tag, &id("t1")).await.unwrap();
    assert_eq!(outcome, DeleteOutcome::Propagated);

    let first = b.engine.sync_now().await.unwrap();
    assert_eq!(first.deleted, 1);
    let second = b.engine.sync_now().await.unwrap();
    assert_eq!(second.deleted, 0);
    assert_eq!(b.repo.count(EntityType::Tag).await, 0);
    assert!(b.engine.tombstones().await.iter().any(|t| t.id == id("t1")));
}

#[tokio::test]
async fn second_cycle_without_changes_writes_nothing() {
    let (remote, a, _b) = pair().await;
    a.repo.put(tag("t1", "Drums")).await;
    let rec = recording_with_audio(&a, "r1", b"riff").await;
    a.repo.put(rec).await;

    let first = a.engine.sync_now().await.unwrap();
    assert_eq!(first.uploaded, 2);

    let saves = remote.call_count(Operation::SaveRecord).await;
    let batches = remote.call_count(Operation::ModifyRecords).await;
    let uploads = remote.call_count(Operation::UploadAsset).await;

    let second = a.engine.sync_now().await.unwrap();
    assert_eq!(second.uploaded, 0);
    assert_eq!(second.skipped, 2);
    assert_eq!(remote.call_count(Operation::SaveRecord).await, saves);
    assert_eq!(remote.call_count(Operation::ModifyRecords).await, batches);
    assert_eq!(remote.call_count(Operation::UploadAsset).await, uploads);
}

#[tokio::test]
async fn concurrent_writes_converge_on_one_winner() {
    let (remote, a, b) = pair().await;
    a.repo.put(tag("t1", "Drums")).await;
    a.engine.sync_now().await.unwrap();
    b.engine.sync_now().await.unwrap();

    // A peer write lands between A's read and A's save.
    let peer = SyncEntity::Tag(Tag {
        id: id("t1"),
        name: "Percussion".into(),
        color: "#00ff00".into(),
        modified_at: Utc::now(),
    });
    remote
        .interleave_next_save(translate::to_record(&peer, &zone()))
        .await;

    let local = SyncEntity::Tag(Tag {
        id: id("t1"),
        name: "Beats".into(),
        color: "#0000ff".into(),
        modified_at: Utc::now() + ChronoDuration::seconds(1),
    });
    a.repo.put(local.clone()).await;
    let report = a.engine.sync_now().await.unwrap();
    assert_eq!(report.conflicts_resolved, 1);

    let stored = remote
        .record(&translate::record_id(&zone(), EntityType::Tag, &id("t1")))
        .await
        .unwrap();
    assert_eq!(translate::from_record(&stored).unwrap(), local);

    b.engine.sync_now().await.unwrap();
    assert_eq!(b.get(EntityType::Tag, "t1").await, Some(local.clone()));

    a.engine.sync_now().await.unwrap();
    assert_eq!(a.get(EntityType::Tag, "t1").await, Some(local));
}

#[tokio::test]
async fn older_local_edit_yields_to_newer_peer_edit() {
    let (remote, a, b) = pair().await;
    a.repo.put(tag("t1", "Drums")).await;
    a.engine.sync_now().await.unwrap();
    b.engine.sync_now().await.unwrap();

    let edit = |name: &str, secs: i64| {
        SyncEntity::Tag(Tag {
            id: id("t1"),
            name: name.into(),
            color: "#ff8800".into(),
            modified_at: Utc::now() + ChronoDuration::seconds(secs),
        })
    };
    let from_a = edit("FromA", 5);
    let from_b = edit("FromB", 10);
    a.repo.put(from_a).await;
    b.repo.put(from_b.clone()).await;

    b.engine.sync_now().await.unwrap();
    let report = a.engine.sync_now().await.unwrap();
    assert_eq!(report.uploaded, 0);

    let stored = remote
        .record(&translate::record_id(&zone(), EntityType::Tag, &id("t1")))
        .await
        .unwrap();
    assert_eq!(translate::from_record(&stored).unwrap(), from_b);
    assert_eq!(a.get(EntityType::Tag, "t1").await, Some(from_b.clone()));

    b.engine.sync_now().await.unwrap();
    assert_eq!(b.get(EntityType::Tag, "t1").await, Some(from_b));
}

#[tokio::test]
async fn peer_recording_cannot_take_over_a_local_asset_file() {
    let (_remote, a, b) = pair().await;
    let take = |device: &Device, raw: &str, audio: &'static [u8]| {
        let assets = device.assets.clone();
        let raw = raw.to_string();
        async move {
            assets.install("take.m4a", audio).await.unwrap();
            let now = Utc::now();
            SyncEntity::Recording(Recording {
                id: id(&raw),
                title: raw.clone(),
                created_at: now,
                modified_at: now,
                duration_secs: 3.0,
                notes: String::new(),
                tag_ids: vec![],
                album_id: None,
                is_favorite: false,
                audio_file: Some("take.m4a".into()),
                audio_digest: Some(content_digest(audio)),
            })
        }
    };
    a.repo.put(take(&a, "ra", b"from a").await).await;
    b.repo.put(take(&b, "rb", b"from b").await).await;

    a.engine.sync_now().await.unwrap();
    let report = b.engine.sync_now().await.unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(b.assets.read("take.m4a").await.unwrap(), b"from b");
    assert!(b.get(EntityType::Recording, "ra").await.is_none());
    assert!(b.get(EntityType::Recording, "rb").await.is_some());
}

#[tokio::test]
async fn every_entity_type_arrives_intact_on_a_peer() {
    let (_remote, a, b) = pair().await;
    let now = Utc::now();
    let recording = recording_with_audio(&a, "r1", b"take one").await;
    let entities = vec![
        recording,
        tag("t1", "Vocals"),
        SyncEntity::Album(Album {
            id: id("al1"),
            name: "Demos".into(),
            recording_ids: vec![id("r1")],
            modified_at: now,
        }),
        SyncEntity::Project(Project {
            id: id("p1"),
            title: "Summer EP".into(),
            notes: String::new(),
            recording_ids: vec![id("r1")],
            tempo_bpm: Some(92.0),
            created_at: now,
            modified_at: now,
        }),
        SyncEntity::OverdubGroup(OverdubGroup {
            id: id("o1"),
            base_recording_id: id("r1"),
            layer_recording_ids: vec![],
            modified_at: now,
        }),
    ];
    for entity in &entities {
        a.repo.put(entity.clone()).await;
    }

    a.engine.sync_now().await.unwrap();
    let report = b.engine.sync_now().await.unwrap();
    assert_eq!(report.applied, entities.len());

    for entity in &entities {
        let arrived = b.get(entity.entity_type(), entity.id().as_str()).await;
        assert_eq!(arrived.as_ref(), Some(entity));
    }
    assert_eq!(b.assets.read("r1.m4a").await.unwrap(), b"take one".to_vec());
}

#[tokio::test]
async fn paged_feed_is_applied_whole_with_one_token_write() {
    let (remote, a, b) = pair().await;
    remote.set_page_size(2).await;
    for i in 0..5 {
        a.repo.put(tag(&format!("t{}", i), "Batch")).await;
    }
    a.engine.sync_now().await.unwrap();

    let report = b.engine.sync_now().await.unwrap();
    assert_eq!(report.applied, 5);
    assert_eq!(b.repo.count(EntityType::Tag).await, 5);
    assert_eq!(b.state.token_writes(), 1);
    assert_eq!(b.repo.batch_writes(), 1);
}

#[tokio::test]
async fn queued_operation_is_dropped_after_five_failures() {
    let (remote, a, _b) = pair().await;
    a.repo.put(tag("t1", "Drums")).await;
    a.engine.sync_now().await.unwrap();

    remote
        .fail_next(
            Operation::FetchRecord,
            (0..10).map(|_| tapedeck_common::Error::Storage("write rejected".into())),
        )
        .await;
    let outcome = a.engine.delete_entity(EntityType::Tag, &id("t1")).await.unwrap();
    assert_eq!(outcome, DeleteOutcome::Queued);
    let attempts_before = remote.call_count(Operation::FetchRecord).await;

    let mut dropped = 0;
    for _ in 0..5 {
        dropped += a.engine.sync_now().await.unwrap().dropped;
    }
    assert_eq!(dropped, 1);
    assert!(a.engine.pending_operations().await.is_empty());
    assert_eq!(
        remote.call_count(Operation::FetchRecord).await,
        attempts_before + 5
    );

    a.engine.sync_now().await.unwrap();
    assert_eq!(
        remote.call_count(Operation::FetchRecord).await,
        attempts_before + 5
    );
}

#[tokio::test]
async fn remote_title_edit_reaches_peer_without_touching_audio() {
    let (remote, a, b) = pair().await;
    let rec = recording_with_audio(&a, "r1", b"original audio").await;
    a.repo.put(rec).await;
    a.engine.sync_now().await.unwrap();
    b.engine.sync_now().await.unwrap();

    let Some(SyncEntity::Recording(mut edited)) = b.get(EntityType::Recording, "r1").await else {
        panic!("recording missing on peer");
    };
    edited.title = "Chorus idea".into();
    edited.modified_at = Utc::now() + ChronoDuration::seconds(1);
    b.repo.put(SyncEntity::Recording(edited)).await;
    let uploads = remote.call_count(Operation::UploadAsset).await;
    b.engine.sync_now().await.unwrap();
    assert_eq!(remote.call_count(Operation::UploadAsset).await, uploads);

    let downloads = remote.call_count(Operation::DownloadAsset).await;
    let report = a.engine.sync_now().await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(remote.call_count(Operation::DownloadAsset).await, downloads);

    let Some(SyncEntity::Recording(local)) = a.get(EntityType::Recording, "r1").await else {
        panic!("recording missing locally");
    };
    assert_eq!(local.title, "Chorus idea");
    assert_eq!(a.assets.read("r1.m4a").await.unwrap(), b"original audio".to_vec());
}

#[tokio::test]
async fn own_tombstone_echo_is_ignored_and_peer_deletes() {
    let (_remote, a, b) = pair().await;
    let rec = recording_with_audio(&a, "r1", b"doomed").await;
    a.repo.put(rec).await;
    a.engine.sync_now().await.unwrap();
    b.engine.sync_now().await.unwrap();
    assert!(b.assets.exists("r1.m4a").await.unwrap());

    a.engine
        .delete_entity(EntityType::Recording, &id("r1"))
        .await
        .unwrap();

    let echo = a.engine.sync_now().await.unwrap();
    assert_eq!(echo.applied, 0);
    assert_eq!(echo.deleted, 0);
    assert_eq!(a.repo.count(EntityType::Recording).await, 0);

    let peer = b.engine.sync_now().await.unwrap();
    assert_eq!(peer.deleted, 1);
    assert!(b.get(EntityType::Recording, "r1").await.is_none());
    assert!(!b.assets.exists("r1.m4a").await.unwrap());
}

#[tokio::test]
async fn deleted_zone_is_reprovisioned_and_repopulated() {
    let (remote, a, _b) = pair().await;
    a.repo.put(tag("t1", "Drums")).await;
    a.engine.sync_now().await.unwrap();

    remote.delete_zone(&zone()).await;
    let reset = a.engine.sync_now().await.unwrap();
    assert!(reset.namespace_reset);
    assert!(remote.has_subscription(&zone(), "recordings-changes").await);

    let refill = a.engine.sync_now().await.unwrap();
    assert_eq!(refill.uploaded, 1);
    assert_eq!(remote.record_count(&zone(), "Tag").await, 1);
}
