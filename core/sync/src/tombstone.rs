//! Deletion markers and the ledger that propagates them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use tapedeck_common::{DeviceId, EntityId, Error, FieldValue, RecordId, RemoteRecord, Result, ZoneId};
use tapedeck_storage::{RecordPredicate, RecordQuery, RemoteStore};

use crate::entity::EntityType;
use crate::retry::RetryExecutor;
use crate::state::SyncStateStore;

/// Record type of tombstones on the remote store.
pub const TOMBSTONE_RECORD_TYPE: &str = "Tombstone";

const ENTITY_TYPE: &str = "entityType";
const DELETED_AT: &str = "deletedAt";
const ORIGIN_DEVICE: &str = "originDeviceId";

/// Durable marker recording that an entity was deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    /// Id of the deleted entity.
    pub id: EntityId,
    pub entity_type: EntityType,
    pub deleted_at: DateTime<Utc>,
    pub origin_device_id: DeviceId,
}

impl Tombstone {
    pub fn record_id(zone: &ZoneId, id: &EntityId) -> RecordId {
        RecordId::new(zone.clone(), TOMBSTONE_RECORD_TYPE, id.as_str())
    }

    pub fn to_record(&self, zone: &ZoneId) -> RemoteRecord {
        let mut record = RemoteRecord::new(Self::record_id(zone, &self.id));
        record.set(
            ENTITY_TYPE,
            FieldValue::String(self.entity_type.record_type().to_string()),
        );
        record.set(DELETED_AT, FieldValue::Date(self.deleted_at));
        record.set(
            ORIGIN_DEVICE,
            FieldValue::String(self.origin_device_id.as_str().to_string()),
        );
        record
    }

    /// Decode a tombstone record.
    ///
    /// # Errors
    /// - `CorruptRecord` when a field is missing or unrecognized
    pub fn from_record(record: &RemoteRecord) -> Result<Self> {
        let corrupt = |what: &str| Error::CorruptRecord(format!("{}: {}", record.id, what));

        if record.record_type() != TOMBSTONE_RECORD_TYPE {
            return Err(corrupt("not a tombstone"));
        }
        let id = EntityId::new(record.name()).map_err(|_| corrupt("empty id"))?;
        let entity_type = record
            .string(ENTITY_TYPE)
            .and_then(EntityType::from_record_type)
            .ok_or_else(|| corrupt("bad entityType"))?;
        let deleted_at = record
            .date(DELETED_AT)
            .ok_or_else(|| corrupt("missing deletedAt"))?;
        let origin_device_id = record
            .string(ORIGIN_DEVICE)
            .and_then(|raw| DeviceId::new(raw).ok())
            .ok_or_else(|| corrupt("missing originDeviceId"))?;

        Ok(Self {
            id,
            entity_type,
            deleted_at,
            origin_device_id,
        })
    }
}

/// Log of known tombstones, both issued locally and observed from peers.
///
/// A tombstone is never re-issued for an id that already has one.
#[derive(Debug, Clone)]
pub struct TombstoneLedger {
    device_id: DeviceId,
    entries: BTreeMap<EntityId, Tombstone>,
}

impl TombstoneLedger {
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            entries: BTreeMap::new(),
        }
    }

    pub fn from_entries(device_id: DeviceId, tombstones: Vec<Tombstone>) -> Self {
        let mut ledger = Self::new(device_id);
        for tombstone in tombstones {
            ledger.entries.entry(tombstone.id.clone()).or_insert(tombstone);
        }
        ledger
    }

    pub async fn load(device_id: DeviceId, store: &dyn SyncStateStore) -> Result<Self> {
        Ok(Self::from_entries(device_id, store.tombstones().await?))
    }

    pub async fn persist(&self, store: &dyn SyncStateStore) -> Result<()> {
        store.set_tombstones(self.to_vec()).await
    }

    /// Issue a tombstone for a local deletion.
    ///
    /// Returns the existing tombstone when one was already issued for `id`.
    pub fn record(&mut self, id: EntityId, entity_type: EntityType, now: DateTime<Utc>) -> Tombstone {
        let device_id = self.device_id.clone();
        self.entries
            .entry(id.clone())
            .or_insert_with(|| {
                debug!("Issued tombstone for {} {}", entity_type, id);
                Tombstone {
                    id,
                    entity_type,
                    deleted_at: now,
                    origin_device_id: device_id,
                }
            })
            .clone()
    }

    /// Remember a tombstone seen on the remote store. Returns true if it was new.
    pub fn observe(&mut self, tombstone: Tombstone) -> bool {
        if self.entries.contains_key(&tombstone.id) {
            return false;
        }
        self.entries.insert(tombstone.id.clone(), tombstone);
        true
    }

    pub fn get(&self, id: &EntityId) -> Option<&Tombstone> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.entries.contains_key(id)
    }

    /// Whether this device issued the tombstone.
    pub fn is_self_originated(&self, tombstone: &Tombstone) -> bool {
        tombstone.origin_device_id == self.device_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Tombstone> {
        let mut tombstones: Vec<_> = self.entries.values().cloned().collect();
        tombstones.sort_by(|a, b| a.deleted_at.cmp(&b.deleted_at).then(a.id.cmp(&b.id)));
        tombstones
    }

    /// Drop tombstones deleted before `horizon`, returning them.
    pub fn prune_older_than(&mut self, horizon: DateTime<Utc>) -> Vec<Tombstone> {
        let expired: Vec<EntityId> = self
            .entries
            .values()
            .filter(|t| t.deleted_at < horizon)
            .map(|t| t.id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| self.entries.remove(id))
            .collect()
    }
}

/// Delete tombstone records older than `horizon` from the remote store.
///
/// Returns the number of records deleted.
pub async fn prune_remote(
    remote: &dyn RemoteStore,
    retry: &RetryExecutor,
    zone: &ZoneId,
    horizon: DateTime<Utc>,
) -> Result<usize> {
    let query = RecordQuery::new(
        TOMBSTONE_RECORD_TYPE,
        RecordPredicate::DateBefore {
            field: DELETED_AT.to_string(),
            before: horizon,
        },
    );
    let expired = retry.execute(|| remote.query(zone, &query)).await?;
    if expired.is_empty() {
        return Ok(0);
    }

    let ids: Vec<RecordId> = expired.into_iter().map(|r| r.id).collect();
    let count = ids.len();
    retry
        .execute(|| remote.modify_records(Vec::new(), ids.clone()))
        .await?;

    info!("Pruned {} remote tombstones older than {}", count, horizon);
    Ok(count)
}
