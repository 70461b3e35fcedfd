//! Change tracking: decides which local entities need an upload.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use tapedeck_common::{EntityId, Result};

use crate::entity::{EntityType, SyncEntity};
use crate::state::SyncStateStore;

/// Digest of a binary payload, as stored in `Recording::audio_digest`.
pub fn content_digest(data: &[u8]) -> String {
    let mut hasher = Blake2b::<U16>::new();
    hasher.update(data);
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Content fingerprint of an entity, ignoring its modification time.
pub fn fingerprint(entity: &SyncEntity) -> String {
    let mut hasher = Blake2b::<U16>::new();
    let mut field = |bytes: &[u8]| {
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(bytes);
    };

    field(entity.entity_type().record_type().as_bytes());
    match entity {
        SyncEntity::Tag(t) => {
            field(t.name.as_bytes());
            field(t.color.as_bytes());
        }
        SyncEntity::Album(a) => {
            field(a.name.as_bytes());
            for id in &a.recording_ids {
                field(id.as_str().as_bytes());
            }
        }
        SyncEntity::OverdubGroup(g) => {
            field(g.base_recording_id.as_str().as_bytes());
            for id in &g.layer_recording_ids {
                field(id.as_str().as_bytes());
            }
        }
        SyncEntity::Recording(r) => {
            field(r.title.as_bytes());
            field(r.notes.as_bytes());
            field(r.duration_secs.to_le_bytes().as_slice());
            field(r.audio_digest.as_deref().unwrap_or_default().as_bytes());
        }
        SyncEntity::Project(p) => {
            field(p.title.as_bytes());
            field(p.notes.as_bytes());
            for id in &p.recording_ids {
                field(id.as_str().as_bytes());
            }
        }
    }

    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

fn key(entity_type: EntityType, id: &EntityId) -> String {
    format!("{}:{}", entity_type.record_type(), id)
}

/// Per-entity upload gate.
///
/// Lightweight entities compare content fingerprints, heavyweight entities
/// compare their modification time against the last pushed one.
#[derive(Debug, Clone, Default)]
pub struct ChangeTracker {
    fingerprints: BTreeMap<String, String>,
    last_synced: BTreeMap<String, DateTime<Utc>>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn load(store: &dyn SyncStateStore) -> Result<Self> {
        Ok(Self {
            fingerprints: store.fingerprints().await?,
            last_synced: store.last_synced().await?,
        })
    }

    pub async fn persist(&self, store: &dyn SyncStateStore) -> Result<()> {
        store
            .set_tracker_maps(self.fingerprints.clone(), self.last_synced.clone())
            .await
    }

    pub fn needs_upload(&self, entity: &SyncEntity) -> bool {
        let key = key(entity.entity_type(), entity.id());
        if entity.entity_type().is_lightweight() {
            self.fingerprints.get(&key) != Some(&fingerprint(entity))
        } else {
            match self.last_synced.get(&key) {
                Some(synced) => entity.modified_at() > *synced,
                None => true,
            }
        }
    }

    /// Record that `entity` is now identical on the remote store.
    pub fn mark_synced(&mut self, entity: &SyncEntity) {
        let key = key(entity.entity_type(), entity.id());
        if entity.entity_type().is_lightweight() {
            self.fingerprints.insert(key, fingerprint(entity));
        } else {
            self.last_synced.insert(key, entity.modified_at());
        }
    }

    pub fn forget(&mut self, entity_type: EntityType, id: &EntityId) {
        let key = key(entity_type, id);
        self.fingerprints.remove(&key);
        self.last_synced.remove(&key);
    }

    /// Forget everything, forcing a full re-upload.
    pub fn reset(&mut self) {
        self.fingerprints.clear();
        self.last_synced.clear();
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len() + self.last_synced.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
