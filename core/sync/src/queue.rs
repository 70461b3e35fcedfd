//! Durable retry queue for writes that failed outright.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::{debug, warn};
use uuid::Uuid;

use tapedeck_common::{EntityId, Result};

use crate::entity::EntityType;
use crate::state::SyncStateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Save,
    Delete,
}

/// A deferred write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: Uuid,
    pub op_type: OperationType,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub created_at: DateTime<Utc>,
    /// Failed replays so far.
    pub retry_count: u32,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub succeeded: usize,
    pub requeued: usize,
    pub dropped: usize,
}

/// Queue of pending operations.
///
/// Holds at most one operation per (entity id, operation type). Operations
/// are dropped after `max_attempts` failed replays or once older than `ttl`.
#[derive(Debug, Clone)]
pub struct OfflineQueue {
    ops: Vec<PendingOperation>,
    max_attempts: u32,
    ttl: chrono::Duration,
}

impl OfflineQueue {
    pub fn new(max_attempts: u32, ttl: chrono::Duration) -> Self {
        Self {
            ops: Vec::new(),
            max_attempts: max_attempts.max(1),
            ttl,
        }
    }

    pub fn with_operations(mut self, ops: Vec<PendingOperation>) -> Self {
        self.ops = ops;
        self
    }

    pub async fn load(
        max_attempts: u32,
        ttl: chrono::Duration,
        store: &dyn SyncStateStore,
    ) -> Result<Self> {
        Ok(Self::new(max_attempts, ttl).with_operations(store.pending_operations().await?))
    }

    pub async fn persist(&self, store: &dyn SyncStateStore) -> Result<()> {
        store.set_pending_operations(self.ops.clone()).await
    }

    /// Queue an operation. Returns false if an identical one is already queued.
    pub fn enqueue(
        &mut self,
        op_type: OperationType,
        entity_type: EntityType,
        entity_id: EntityId,
        now: DateTime<Utc>,
    ) -> bool {
        if self
            .ops
            .iter()
            .any(|op| op.entity_id == entity_id && op.op_type == op_type)
        {
            debug!("{:?} of {} already queued", op_type, entity_id);
            return false;
        }
        self.ops.push(PendingOperation {
            id: Uuid::new_v4(),
            op_type,
            entity_type,
            entity_id,
            created_at: now,
            retry_count: 0,
        });
        true
    }

    /// Drop operations older than the TTL. Returns how many were dropped.
    pub fn sweep_expired(&mut self, now: DateTime<Utc>) -> usize {
        let ttl = self.ttl;
        let before = self.ops.len();
        self.ops.retain(|op| {
            let keep = now - op.created_at <= ttl;
            if !keep {
                warn!(
                    "Dropping expired {:?} of {} {} queued at {}",
                    op.op_type, op.entity_type, op.entity_id, op.created_at
                );
            }
            keep
        });
        before - self.ops.len()
    }

    /// Replay every queued operation through `resolve`.
    ///
    /// A cycle-fatal error stops the pass: the failing operation and all those
    /// after it stay queued unchanged and the error is returned.
    pub async fn drain<F, Fut>(&mut self, mut resolve: F) -> Result<DrainReport>
    where
        F: FnMut(PendingOperation) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut report = DrainReport::default();
        let mut pending = std::mem::take(&mut self.ops).into_iter();
        let mut kept = Vec::new();

        while let Some(mut op) = pending.next() {
            match resolve(op.clone()).await {
                Ok(()) => report.succeeded += 1,
                Err(e) if e.is_cycle_fatal() => {
                    kept.push(op);
                    kept.extend(pending);
                    self.ops = kept;
                    return Err(e);
                }
                Err(e) => {
                    op.retry_count += 1;
                    if op.retry_count >= self.max_attempts {
                        warn!(
                            "Dropping {:?} of {} {} after {} attempts: {}",
                            op.op_type, op.entity_type, op.entity_id, op.retry_count, e
                        );
                        report.dropped += 1;
                    } else {
                        debug!(
                            "Requeued {:?} of {} (attempt {}): {}",
                            op.op_type, op.entity_id, op.retry_count, e
                        );
                        report.requeued += 1;
                        kept.push(op);
                    }
                }
            }
        }

        self.ops = kept;
        Ok(report)
    }

    pub fn operations(&self) -> &[PendingOperation] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
