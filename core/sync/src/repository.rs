//! Local entity repository seam.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;

use tapedeck_common::{EntityId, Error, Result};

use crate::entity::{EntityType, SyncEntity};

/// A set of local changes committed together.
#[derive(Debug, Clone, Default)]
pub struct EntityBatch {
    pub upserts: Vec<SyncEntity>,
    pub deletions: Vec<(EntityType, EntityId)>,
}

impl EntityBatch {
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.upserts.len() + self.deletions.len()
    }
}

/// Persistent local storage for synchronizable entities.
#[async_trait]
pub trait EntityRepository: Send + Sync {
    /// All entities of one type, ordered by id.
    async fn list(&self, entity_type: EntityType) -> Result<Vec<SyncEntity>>;

    async fn get(&self, entity_type: EntityType, id: &EntityId) -> Result<Option<SyncEntity>>;

    /// Commit a batch atomically. Deleting a missing entity is not an error.
    async fn apply_batch(&self, batch: EntityBatch) -> Result<()>;
}

/// In-memory repository.
///
/// Counts committed batches and can be told to fail the next write, which is
/// what the engine tests need to observe batching and rollback behavior.
#[derive(Default)]
pub struct MemoryRepository {
    entities: RwLock<HashMap<EntityType, BTreeMap<EntityId, SyncEntity>>>,
    batch_writes: AtomicUsize,
    fail_next: AtomicBool,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entity outside of any batch.
    pub async fn put(&self, entity: SyncEntity) {
        let mut entities = self.entities.write().await;
        entities
            .entry(entity.entity_type())
            .or_default()
            .insert(entity.id().clone(), entity);
    }

    pub async fn remove(&self, entity_type: EntityType, id: &EntityId) -> Option<SyncEntity> {
        let mut entities = self.entities.write().await;
        entities.get_mut(&entity_type).and_then(|m| m.remove(id))
    }

    pub async fn count(&self, entity_type: EntityType) -> usize {
        let entities = self.entities.read().await;
        entities.get(&entity_type).map(|m| m.len()).unwrap_or(0)
    }

    /// Number of batches committed through `apply_batch`.
    pub fn batch_writes(&self) -> usize {
        self.batch_writes.load(Ordering::SeqCst)
    }

    /// Make the next `apply_batch` fail without changing anything.
    pub fn fail_next_write(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl EntityRepository for MemoryRepository {
    async fn list(&self, entity_type: EntityType) -> Result<Vec<SyncEntity>> {
        let entities = self.entities.read().await;
        Ok(entities
            .get(&entity_type)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get(&self, entity_type: EntityType, id: &EntityId) -> Result<Option<SyncEntity>> {
        let entities = self.entities.read().await;
        Ok(entities.get(&entity_type).and_then(|m| m.get(id)).cloned())
    }

    async fn apply_batch(&self, batch: EntityBatch) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::Storage("injected repository failure".to_string()));
        }

        let mut entities = self.entities.write().await;
        for entity in batch.upserts {
            entities
                .entry(entity.entity_type())
                .or_default()
                .insert(entity.id().clone(), entity);
        }
        for (entity_type, id) in batch.deletions {
            if let Some(m) = entities.get_mut(&entity_type) {
                m.remove(&id);
            }
        }
        self.batch_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
