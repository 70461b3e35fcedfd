//! Published sync status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use tapedeck_common::{EntityId, Error};

use crate::entity::EntityType;

/// Engine state as observed by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum SyncStatus {
    Disabled,
    Initializing,
    Syncing { progress: f64, description: String },
    Synced { at: DateTime<Utc> },
    Error { message: String },
    AccountUnavailable,
    NetworkUnavailable,
}

impl SyncStatus {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            SyncStatus::Error { .. } | SyncStatus::AccountUnavailable | SyncStatus::NetworkUnavailable
        )
    }
}

/// Progress of one in-flight upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadProgress {
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    /// Between 0.0 and 1.0.
    pub progress: f64,
}

/// Owner side of the status channels.
#[derive(Debug)]
pub struct StatusPublisher {
    status: watch::Sender<SyncStatus>,
    uploads: watch::Sender<Vec<UploadProgress>>,
}

impl StatusPublisher {
    pub fn new(initial: SyncStatus) -> Self {
        let (status, _) = watch::channel(initial);
        let (uploads, _) = watch::channel(Vec::new());
        Self { status, uploads }
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn subscribe_uploads(&self) -> watch::Receiver<Vec<UploadProgress>> {
        self.uploads.subscribe()
    }

    pub fn current(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn set(&self, status: SyncStatus) {
        self.status.send_replace(status);
    }

    pub fn syncing(&self, progress: f64, description: impl Into<String>) {
        self.set(SyncStatus::Syncing {
            progress: progress.clamp(0.0, 1.0),
            description: description.into(),
        });
    }

    /// Publish the status matching a cycle-aborting error.
    pub fn fail(&self, err: &Error) {
        let status = match err {
            Error::AccountUnavailable(_) => SyncStatus::AccountUnavailable,
            Error::NetworkUnavailable(_) => SyncStatus::NetworkUnavailable,
            other => SyncStatus::Error {
                message: other.to_string(),
            },
        };
        self.set(status);
    }

    /// Insert or update the progress entry for an entity.
    pub fn set_upload_progress(&self, entity_type: EntityType, entity_id: &EntityId, progress: f64) {
        let progress = progress.clamp(0.0, 1.0);
        self.uploads.send_modify(|entries| {
            match entries
                .iter_mut()
                .find(|e| e.entity_type == entity_type && &e.entity_id == entity_id)
            {
                Some(entry) => entry.progress = progress,
                None => entries.push(UploadProgress {
                    entity_type,
                    entity_id: entity_id.clone(),
                    progress,
                }),
            }
        });
    }

    pub fn clear_uploads(&self) {
        self.uploads.send_replace(Vec::new());
    }
}
