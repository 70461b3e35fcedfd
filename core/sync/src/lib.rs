//! Tapedeck Sync Engine
//!
//! Keeps a device's recording library in step with a shared remote record
//! store:
//! - Change tracking by content fingerprint
//! - Outbound upload with asset attachment and conflict resolution
//! - Incremental delta fetch applied atomically to the local repository
//! - Tombstones for cross-device deletion
//! - Offline queue with bounded replay
//! - Debounced, periodic and reachability-driven scheduling

pub mod apply;
pub mod cache;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod entity;
pub mod fetch;
pub mod network;
pub mod queue;
pub mod repository;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod status;
pub mod tombstone;
pub mod tracker;
pub mod translate;
pub mod upload;

// Re-export main types
pub use apply::{ApplyReport, ChangeApplier, ChangeSet};
pub use cache::{AssetCache, CacheEntry, EvictionReport};
pub use config::{CacheConfig, SyncConfig};
pub use conflict::{ConflictInfo, ConflictResolver, Resolution};
pub use engine::{DeleteOutcome, SyncEngine, SyncReport, SyncServices};
pub use entity::{Album, EntityType, OverdubGroup, Project, Recording, SyncEntity, Tag};
pub use fetch::{ChangeFetcher, FetchOutcome};
pub use network::ReachabilityMonitor;
pub use queue::{DrainReport, OfflineQueue, OperationType, PendingOperation};
pub use repository::{EntityBatch, EntityRepository, MemoryRepository};
pub use retry::{with_retry, RetryConfig, RetryExecutor};
pub use scheduler::{SyncRequest, SyncRunner, SyncScheduler, SyncSchedulerHandle};
pub use state::{JsonStateStore, MemoryStateStore, PersistedState, SetupFlag, SyncStateStore};
pub use status::{StatusPublisher, SyncStatus, UploadProgress};
pub use tombstone::{Tombstone, TombstoneLedger};
pub use tracker::{content_digest, fingerprint, ChangeTracker};
pub use upload::{AssetAttachment, UploadOutcome, UploadPipeline};
