//! Sync state tracking and persistence.
//!
//! Everything the engine must remember across launches goes through
//! [`SyncStateStore`]: change tokens, tombstones, the offline queue, the
//! change tracker maps, and the provisioning flags.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

use tapedeck_common::{ChangeToken, Error, Result, ZoneId};

use crate::queue::PendingOperation;
use crate::tombstone::Tombstone;

/// One-time remote setup steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetupFlag {
    ZoneCreated,
    SubscriptionCreated,
}

/// The full persisted engine state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    /// Change token per zone name.
    pub change_tokens: BTreeMap<String, ChangeToken>,
    pub tombstones: Vec<Tombstone>,
    pub pending_operations: Vec<PendingOperation>,
    /// Content fingerprints of lightweight entities, by tracker key.
    pub fingerprints: BTreeMap<String, String>,
    /// Last pushed modification time of heavyweight entities, by tracker key.
    pub last_synced: BTreeMap<String, DateTime<Utc>>,
    pub zone_created: bool,
    pub subscription_created: bool,
}

impl PersistedState {
    pub fn flag(&self, flag: SetupFlag) -> bool {
        match flag {
            SetupFlag::ZoneCreated => self.zone_created,
            SetupFlag::SubscriptionCreated => self.subscription_created,
        }
    }

    pub fn set_flag(&mut self, flag: SetupFlag, value: bool) {
        match flag {
            SetupFlag::ZoneCreated => self.zone_created = value,
            SetupFlag::SubscriptionCreated => self.subscription_created = value,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Durable storage for engine-owned state.
#[async_trait]
pub trait SyncStateStore: Send + Sync {
    /// Copy of everything currently stored.
    async fn snapshot(&self) -> Result<PersistedState>;

    async fn change_token(&self, zone: &ZoneId) -> Result<Option<ChangeToken>>;

    /// Store or clear the change token for a zone.
    async fn set_change_token(&self, zone: &ZoneId, token: Option<ChangeToken>) -> Result<()>;

    async fn tombstones(&self) -> Result<Vec<Tombstone>>;

    async fn set_tombstones(&self, tombstones: Vec<Tombstone>) -> Result<()>;

    async fn pending_operations(&self) -> Result<Vec<PendingOperation>>;

    async fn set_pending_operations(&self, ops: Vec<PendingOperation>) -> Result<()>;

    async fn fingerprints(&self) -> Result<BTreeMap<String, String>>;

    async fn last_synced(&self) -> Result<BTreeMap<String, DateTime<Utc>>>;

    /// Store both change tracker maps together.
    async fn set_tracker_maps(
        &self,
        fingerprints: BTreeMap<String, String>,
        last_synced: BTreeMap<String, DateTime<Utc>>,
    ) -> Result<()>;

    async fn flag(&self, flag: SetupFlag) -> Result<bool>;

    async fn set_flag(&self, flag: SetupFlag, value: bool) -> Result<()>;
}

/// In-memory state store.
#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<PersistedState>,
    token_writes: AtomicUsize,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: PersistedState) -> Self {
        Self {
            state: Mutex::new(state),
            token_writes: AtomicUsize::new(0),
        }
    }

    /// Number of `set_change_token` calls so far.
    pub fn token_writes(&self) -> usize {
        self.token_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SyncStateStore for MemoryStateStore {
    async fn snapshot(&self) -> Result<PersistedState> {
        Ok(self.state.lock().await.clone())
    }

    async fn change_token(&self, zone: &ZoneId) -> Result<Option<ChangeToken>> {
        Ok(self.state.lock().await.change_tokens.get(zone.as_str()).cloned())
    }

    async fn set_change_token(&self, zone: &ZoneId, token: Option<ChangeToken>) -> Result<()> {
        let mut state = self.state.lock().await;
        match token {
            Some(token) => {
                state.change_tokens.insert(zone.as_str().to_string(), token);
            }
            None => {
                state.change_tokens.remove(zone.as_str());
            }
        }
        self.token_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn tombstones(&self) -> Result<Vec<Tombstone>> {
        Ok(self.state.lock().await.tombstones.clone())
    }

    async fn set_tombstones(&self, tombstones: Vec<Tombstone>) -> Result<()> {
        self.state.lock().await.tombstones = tombstones;
        Ok(())
    }

    async fn pending_operations(&self) -> Result<Vec<PendingOperation>> {
        Ok(self.state.lock().await.pending_operations.clone())
    }

    async fn set_pending_operations(&self, ops: Vec<PendingOperation>) -> Result<()> {
        self.state.lock().await.pending_operations = ops;
        Ok(())
    }

    async fn fingerprints(&self) -> Result<BTreeMap<String, String>> {
        Ok(self.state.lock().await.fingerprints.clone())
    }

    async fn last_synced(&self) -> Result<BTreeMap<String, DateTime<Utc>>> {
        Ok(self.state.lock().await.last_synced.clone())
    }

    async fn set_tracker_maps(
        &self,
        fingerprints: BTreeMap<String, String>,
        last_synced: BTreeMap<String, DateTime<Utc>>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.fingerprints = fingerprints;
        state.last_synced = last_synced;
        Ok(())
    }

    async fn flag(&self, flag: SetupFlag) -> Result<bool> {
        Ok(self.state.lock().await.flag(flag))
    }

    async fn set_flag(&self, flag: SetupFlag, value: bool) -> Result<()> {
        self.state.lock().await.set_flag(flag, value);
        Ok(())
    }
}

/// State store backed by a single JSON document.
///
/// Every mutation rewrites the document through a temporary file and a
/// rename, so a crash leaves either the old or the new document.
pub struct JsonStateStore {
    path: PathBuf,
    inner: MemoryStateStore,
    write_lock: Mutex<()>,
}

impl JsonStateStore {
    /// Open the document at `path`, starting empty if it does not exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(json) => PersistedState::from_json(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PersistedState::default(),
            Err(e) => return Err(Error::Io(e)),
        };

        Ok(Self {
            path,
            inner: MemoryStateStore::with_state(state),
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn flush(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let json = self.inner.snapshot().await?.to_json()?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json.as_bytes()).await?;
        tokio::fs::rename(&tmp, &self.path).await?;

        debug!("Persisted sync state to {:?}", self.path);
        Ok(())
    }
}

#[async_trait]
impl SyncStateStore for JsonStateStore {
    async fn snapshot(&self) -> Result<PersistedState> {
        self.inner.snapshot().await
    }

    async fn change_token(&self, zone: &ZoneId) -> Result<Option<ChangeToken>> {
        self.inner.change_token(zone).await
    }

    async fn set_change_token(&self, zone: &ZoneId, token: Option<ChangeToken>) -> Result<()> {
        self.inner.set_change_token(zone, token).await?;
        self.flush().await
    }

    async fn tombstones(&self) -> Result<Vec<Tombstone>> {
        self.inner.tombstones().await
    }

    async fn set_tombstones(&self, tombstones: Vec<Tombstone>) -> Result<()> {
        self.inner.set_tombstones(tombstones).await?;
        self.flush().await
    }

    async fn pending_operations(&self) -> Result<Vec<PendingOperation>> {
        self.inner.pending_operations().await
    }

    async fn set_pending_operations(&self, ops: Vec<PendingOperation>) -> Result<()> {
        self.inner.set_pending_operations(ops).await?;
        self.flush().await
    }

    async fn fingerprints(&self) -> Result<BTreeMap<String, String>> {
        self.inner.fingerprints().await
    }

    async fn last_synced(&self) -> Result<BTreeMap<String, DateTime<Utc>>> {
        self.inner.last_synced().await
    }

    async fn set_tracker_maps(
        &self,
        fingerprints: BTreeMap<String, String>,
        last_synced: BTreeMap<String, DateTime<Utc>>,
    ) -> Result<()> {
        self.inner.set_tracker_maps(fingerprints, last_synced).await?;
        self.flush().await
    }

    async fn flag(&self, flag: SetupFlag) -> Result<bool> {
        self.inner.flag(flag).await
    }

    async fn set_flag(&self, flag: SetupFlag, value: bool) -> Result<()> {
        self.inner.set_flag(flag, value).await?;
        self.flush().await
    }
}
