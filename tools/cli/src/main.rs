//! Tapedeck sync CLI - inspect and maintain a device's sync state.
//!
//! Operates on the persisted state document and the asset cache of a device,
//! and can run an in-memory two-device simulation of the sync engine.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use tapedeck_common::{DeviceId, EntityId};
use tapedeck_storage::{AssetStore, LocalAssetStore, MemoryRecordStore};
use tapedeck_sync::{
    content_digest, AssetCache, CacheConfig, EntityType, JsonStateStore, MemoryRepository,
    MemoryStateStore, Recording, SetupFlag, SyncConfig, SyncEngine, SyncEntity, SyncReport,
    SyncServices, SyncStateStore, Tag, TombstoneLedger,
};

#[derive(Parser)]
#[command(name = "tapedeck-sync")]
#[command(about = "Tapedeck - Recording library sync maintenance")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Sync configuration file (JSON).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the persisted sync state.
    Status {
        /// State document (default: platform data dir).
        #[arg(short, long)]
        state: Option<PathBuf>,
    },

    /// List operations waiting in the offline queue.
    Queue {
        /// State document (default: platform data dir).
        #[arg(short, long)]
        state: Option<PathBuf>,
    },

    /// Drop local tombstones older than the retention period.
    Prune {
        /// State document (default: platform data dir).
        #[arg(short, long)]
        state: Option<PathBuf>,

        /// Retention in days (default: from configuration).
        #[arg(short, long)]
        days: Option<i64>,
    },

    /// Run asset cache eviction and orphan cleanup.
    Evict {
        /// Cache directory.
        #[arg(long)]
        cache: PathBuf,

        /// Byte budget in megabytes.
        #[arg(long, default_value = "500")]
        budget_mb: u64,

        /// Entries idle for this many days are always removed.
        #[arg(long, default_value = "30")]
        stale_days: i64,
    },

    /// Simulate two devices syncing through an in-memory store.
    Simulate {
        /// Working directory for the simulated asset stores.
        #[arg(short, long)]
        workdir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Status { state } => cmd_status(&state_path(state)?).await,

        Commands::Queue { state } => cmd_queue(&state_path(state)?).await,

        Commands::Prune { state, days } => {
            let days = days.unwrap_or(config.tombstone_retention_days);
            cmd_prune(&config, &state_path(state)?, days).await
        }

        Commands::Evict {
            cache,
            budget_mb,
            stale_days,
        } => cmd_evict(&cache, budget_mb, stale_days).await,

        Commands::Simulate { workdir } => {
            let workdir = workdir.unwrap_or_else(|| std::env::temp_dir().join("tapedeck-simulate"));
            cmd_simulate(&workdir).await
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<SyncConfig> {
    match path {
        Some(path) => SyncConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(SyncConfig::default()),
    }
}

/// Resolve the state document, defaulting to the platform data directory.
fn state_path(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path);
    }
    let data = dirs::data_dir().context("Could not determine data directory")?;
    Ok(data.join("tapedeck").join("sync-state.json"))
}

async fn open_state(path: &Path) -> Result<JsonStateStore> {
    JsonStateStore::open(path)
        .await
        .with_context(|| format!("Failed to open sync state at {}", path.display()))
}

/// Show the persisted sync state.
async fn cmd_status(path: &Path) -> Result<()> {
    let store = open_state(path).await?;
    let state = store.snapshot().await?;

    println!("Sync State: {}", path.display());
    println!("  Zone created: {}", state.flag(SetupFlag::ZoneCreated));
    println!(
        "  Subscription created: {}",
        state.flag(SetupFlag::SubscriptionCreated)
    );
    for (zone, token) in &state.change_tokens {
        println!("  Change token [{}]: {}", zone, token.as_str());
    }
    println!("  Pending operations: {}", state.pending_operations.len());
    println!("  Tombstones: {}", state.tombstones.len());
    println!("  Tracked fingerprints: {}", state.fingerprints.len());
    println!("  Tracked sync dates: {}", state.last_synced.len());
    if let Some(latest) = state.last_synced.values().max() {
        println!("  Last upload: {}", latest);
    }

    Ok(())
}

/// List queued operations.
async fn cmd_queue(path: &Path) -> Result<()> {
    let store = open_state(path).await?;
    let ops = store.pending_operations().await?;

    if ops.is_empty() {
        println!("Offline queue is empty.");
        return Ok(());
    }

    println!("Offline queue ({} operations):", ops.len());
    for op in ops {
        println!(
            "  {:?} {} {} (queued {}, {} failed attempts)",
            op.op_type, op.entity_type, op.entity_id, op.created_at, op.retry_count
        );
    }

    Ok(())
}

/// Prune old tombstones from the local ledger.
async fn cmd_prune(config: &SyncConfig, path: &Path, days: i64) -> Result<()> {
    if days < 0 {
        anyhow::bail!("Retention must not be negative");
    }
    info!("Pruning tombstones older than {} days", days);

    let store = open_state(path).await?;
    let mut ledger = TombstoneLedger::load(config.device_id.clone(), &store).await?;
    let horizon = Utc::now() - ChronoDuration::days(days);
    let pruned = ledger.prune_older_than(horizon);
    ledger.persist(&store).await?;

    println!("Pruned {} tombstones, {} remain.", pruned.len(), ledger.len());
    Ok(())
}

/// Evict cached assets.
async fn cmd_evict(dir: &Path, budget_mb: u64, stale_days: i64) -> Result<()> {
    let config = CacheConfig::new(dir)
        .with_byte_budget(budget_mb * 1024 * 1024)
        .with_stale_after_days(stale_days);
    let mut cache = AssetCache::open(&config)
        .await
        .with_context(|| format!("Failed to open cache at {}", dir.display()))?;

    let report = cache.evict_if_needed(Utc::now()).await?;
    let orphans = cache.cleanup_orphaned().await?;

    println!("Cache eviction complete:");
    println!("  Stale entries removed: {}", report.stale_removed);
    println!("  LRU entries removed: {}", report.lru_removed);
    println!("  Bytes freed: {}", report.bytes_freed);
    println!("  Orphaned files removed: {}", orphans);
    println!("  Remaining: {} entries, {} bytes", cache.len(), cache.total_size());

    Ok(())
}

struct SimDevice {
    engine: SyncEngine,
    repo: Arc<MemoryRepository>,
    assets: Arc<LocalAssetStore>,
}

async fn sim_device(remote: &Arc<MemoryRecordStore>, workdir: &Path, name: &str) -> Result<SimDevice> {
    let repo = Arc::new(MemoryRepository::new());
    let assets = Arc::new(LocalAssetStore::new(workdir.join(name))?);
    let services = SyncServices {
        remote: remote.clone(),
        repository: repo.clone(),
        assets: assets.clone(),
        state: Arc::new(MemoryStateStore::new()),
    };
    let config = SyncConfig::new(DeviceId::new(name)?);
    let engine = SyncEngine::open(config, services).await?;
    Ok(SimDevice {
        engine,
        repo,
        assets,
    })
}

fn print_report(label: &str, report: &SyncReport) {
    println!(
        "{}: {} uploaded, {} skipped, {} applied, {} deleted, {} conflicts ({:?})",
        label,
        report.uploaded,
        report.skipped,
        report.applied,
        report.deleted,
        report.conflicts_resolved,
        report.duration
    );
}

/// Create, edit and delete entities on one device and watch the other follow.
async fn cmd_simulate(workdir: &Path) -> Result<()> {
    info!("Simulating two devices in {}", workdir.display());

    let remote = Arc::new(MemoryRecordStore::new());
    let alpha = sim_device(&remote, workdir, "alpha").await?;
    let beta = sim_device(&remote, workdir, "beta").await?;

    let audio = b"simulated audio payload".to_vec();
    alpha.assets.install("take-1.m4a", &audio).await?;
    let now = Utc::now();
    let recording_id = EntityId::new("take-1")?;
    alpha
        .repo
        .put(SyncEntity::Tag(Tag {
            id: EntityId::new("ideas")?,
            name: "Ideas".into(),
            color: "#f5a623".into(),
            modified_at: now,
        }))
        .await;
    alpha
        .repo
        .put(SyncEntity::Recording(Recording {
            id: recording_id.clone(),
            title: "First take".into(),
            created_at: now,
            modified_at: now,
            duration_secs: 3.0,
            notes: String::new(),
            tag_ids: vec![EntityId::new("ideas")?],
            album_id: None,
            is_favorite: false,
            audio_file: Some("take-1.m4a".into()),
            audio_digest: Some(content_digest(&audio)),
        }))
        .await;

    print_report("alpha push", &alpha.engine.sync_now().await?);
    print_report("beta pull", &beta.engine.sync_now().await?);
    println!(
        "beta has {} recordings, {} tags",
        beta.repo.count(EntityType::Recording).await,
        beta.repo.count(EntityType::Tag).await
    );

    let outcome = alpha
        .engine
        .delete_entity(EntityType::Recording, &recording_id)
        .await?;
    println!("alpha deleted take-1: {:?}", outcome);

    print_report("alpha echo", &alpha.engine.sync_now().await?);
    print_report("beta pull", &beta.engine.sync_now().await?);
    println!(
        "beta has {} recordings, audio present: {}",
        beta.repo.count(EntityType::Recording).await,
        beta.assets.exists("take-1.m4a").await?
    );

    Ok(())
}
