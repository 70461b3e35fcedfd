//! Conflict resolution for racing writes.
//!
//! Resolution is record-level last-writer-wins: every locally-owned field is
//! re-applied on top of the latest server version and the write is retried.
//! A concurrent edit to another field made between the conflict and the
//! retry is overwritten. A server version modified after the local entity
//! wins and is left untouched.

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use tapedeck_common::{Error, RecordId, RemoteRecord, Result};
use tapedeck_storage::RemoteStore;

use crate::entity::SyncEntity;
use crate::retry::RetryExecutor;
use crate::translate::{self, fields};
use crate::upload::AssetAttachment;

/// Information about a detected conflict.
#[derive(Debug, Clone)]
pub struct ConflictInfo {
    pub record: String,
    pub local_modified: DateTime<Utc>,
    /// Server change tag the retry is based on.
    pub server_change_tag: Option<String>,
    pub server_modified: Option<DateTime<Utc>>,
    pub detected_at: DateTime<Utc>,
}

impl ConflictInfo {
    pub fn new(entity: &SyncEntity, id: &RecordId, server: Option<&RemoteRecord>) -> Self {
        Self {
            record: id.to_string(),
            local_modified: entity.modified_at(),
            server_change_tag: server.and_then(|r| r.change_tag.clone()),
            server_modified: server.and_then(|r| r.date(fields::MODIFIED_AT)),
            detected_at: Utc::now(),
        }
    }

    /// Whether the server copy was modified after the local entity.
    pub fn server_is_newer(&self) -> bool {
        self.server_modified
            .is_some_and(|server| server > self.local_modified)
    }
}

/// Outcome of a successful resolution.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The record as saved on the server.
    pub record: RemoteRecord,
    /// Write attempts it took.
    pub attempts: u32,
    /// The server version was newer and was kept as-is.
    pub superseded: bool,
}

/// Re-applies local changes onto the latest server version.
#[derive(Debug, Clone)]
pub struct ConflictResolver {
    max_attempts: u32,
}

impl ConflictResolver {
    pub fn new(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Resolve a version conflict raised while saving `entity`.
    ///
    /// # Errors
    /// - The last `VersionConflict` once all attempts are used
    /// - Any non-conflict error from the store
    pub async fn resolve(
        &self,
        remote: &dyn RemoteStore,
        retry: &RetryExecutor,
        id: &RecordId,
        entity: &SyncEntity,
        attachment: &mut AssetAttachment<'_>,
        conflict: Error,
    ) -> Result<Resolution> {
        let mut conflict = conflict;

        for attempt in 1..=self.max_attempts {
            let server = match conflict {
                Error::VersionConflict {
                    server_record: Some(record),
                    ..
                } => Some(*record),
                Error::VersionConflict { .. } => {
                    retry.execute(|| remote.fetch_record(id)).await?
                }
                other => return Err(other),
            };

            let info = ConflictInfo::new(entity, id, server.as_ref());
            debug!("Resolving conflict (attempt {}): {:?}", attempt, info);

            let mut record = match server {
                Some(server) if info.server_is_newer() => {
                    debug!("Server version of {} is newer, keeping it", id);
                    return Ok(Resolution {
                        record: server,
                        attempts: attempt,
                        superseded: true,
                    });
                }
                Some(server) => server,
                None => RemoteRecord::new(id.clone()),
            };
            attachment.attach(remote, retry, &mut record).await?;
            translate::write_fields(entity, &mut record);

            let result = retry.execute(|| remote.save_record(record.clone())).await;
            match result {
                Ok(saved) => {
                    debug!("Conflict on {} resolved after {} attempts", id, attempt);
                    return Ok(Resolution {
                        record: saved,
                        attempts: attempt,
                        superseded: false,
                    });
                }
                Err(e @ Error::VersionConflict { .. }) => conflict = e,
                Err(e) => return Err(e),
            }
        }

        warn!(
            "Conflict on {} unresolved after {} attempts",
            id, self.max_attempts
        );
        Err(conflict)
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Tag;
    use crate::retry::RetryConfig;
    use chrono::Duration;
    use tapedeck_common::{EntityId, ZoneId};
    use tapedeck_storage::{LocalAssetStore, MemoryRecordStore, Operation};
    use tempfile::TempDir;

    struct Fixture {
        remote: MemoryRecordStore,
        assets: LocalAssetStore,
        retry: RetryExecutor,
        _temp: TempDir,
    }

    async fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let remote = MemoryRecordStore::new();
        remote.create_zone(&zone()).await.unwrap();
        Fixture {
            remote,
            assets: LocalAssetStore::new(temp.path()).unwrap(),
            retry: RetryExecutor::new(
                RetryConfig::new(1)
                    .with_base_delay(std::time::Duration::from_millis(1))
                    .with_jitter(false),
            ),
            _temp: temp,
        }
    }

    fn zone() -> ZoneId {
        ZoneId::new("Recordings")
    }

    fn tag(name: &str, offset_secs: i64) -> SyncEntity {
        SyncEntity::Tag(Tag {
            id: EntityId::new("t1").unwrap(),
            name: name.into(),
            color: "#123456".into(),
            modified_at: Utc::now() + Duration::seconds(offset_secs),
        })
    }

    fn record_id(entity: &SyncEntity) -> RecordId {
        translate::record_id(&zone(), entity.entity_type(), entity.id())
    }

    /// Store `server` and return the conflict a stale save of it raises.
    async fn stale_save(f: &Fixture, server: &SyncEntity) -> Error {
        f.remote
            .save_record(translate::to_record(server, &zone()))
            .await
            .unwrap();
        f.remote
            .save_record(translate::to_record(server, &zone()))
            .await
            .unwrap_err()
    }

    #[tokio::test]
    async fn test_attached_server_record_is_rebased() {
        let f = fixture().await;
        let conflict = stale_save(&f, &tag("Drums", -10)).await;
        assert!(matches!(
            conflict,
            Error::VersionConflict {
                server_record: Some(_),
                ..
            }
        ));

        let local = tag("Kit", 0);
        let mut attachment = AssetAttachment::for_entity(&f.assets, &local);
        let resolution = ConflictResolver::default()
            .resolve(&f.remote, &f.retry, &record_id(&local), &local, &mut attachment, conflict)
            .await
            .unwrap();

        assert_eq!(resolution.attempts, 1);
        assert!(!resolution.superseded);
        assert_eq!(f.remote.call_count(Operation::FetchRecord).await, 0);
        let stored = f.remote.record(&record_id(&local)).await.unwrap();
        assert_eq!(stored.string(fields::NAME), Some("Kit"));
    }

    #[tokio::test]
    async fn test_conflict_without_server_record_refetches() {
        let f = fixture().await;
        stale_save(&f, &tag("Drums", -10)).await;

        let local = tag("Kit", 0);
        let mut attachment = AssetAttachment::for_entity(&f.assets, &local);
        let resolution = ConflictResolver::default()
            .resolve(
                &f.remote,
                &f.retry,
                &record_id(&local),
                &local,
                &mut attachment,
                Error::conflict("Recordings/Tag/t1"),
            )
            .await
            .unwrap();

        assert_eq!(f.remote.call_count(Operation::FetchRecord).await, 1);
        assert_eq!(resolution.record.string(fields::NAME), Some("Kit"));
    }

    #[tokio::test]
    async fn test_newer_server_version_is_kept() {
        let f = fixture().await;
        let conflict = stale_save(&f, &tag("Percussion", 60)).await;
        let saves_before = f.remote.call_count(Operation::SaveRecord).await;

        let local = tag("Kit", 0);
        let mut attachment = AssetAttachment::for_entity(&f.assets, &local);
        let resolution = ConflictResolver::default()
            .resolve(&f.remote, &f.retry, &record_id(&local), &local, &mut attachment, conflict)
            .await
            .unwrap();

        assert!(resolution.superseded);
        assert_eq!(resolution.record.string(fields::NAME), Some("Percussion"));
        assert_eq!(f.remote.call_count(Operation::SaveRecord).await, saves_before);
        let stored = f.remote.record(&record_id(&local)).await.unwrap();
        assert_eq!(stored.string(fields::NAME), Some("Percussion"));
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_conflict() {
        let f = fixture().await;
        stale_save(&f, &tag("Drums", -10)).await;
        f.remote
            .fail_next(
                Operation::SaveRecord,
                (0..2).map(|_| Error::conflict("Recordings/Tag/t1")),
            )
            .await;

        let local = tag("Kit", 0);
        let mut attachment = AssetAttachment::for_entity(&f.assets, &local);
        let err = ConflictResolver::new(2)
            .resolve(
                &f.remote,
                &f.retry,
                &record_id(&local),
                &local,
                &mut attachment,
                Error::conflict("Recordings/Tag/t1"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::VersionConflict { .. }));
        assert_eq!(f.remote.call_count(Operation::FetchRecord).await, 2);
        let stored = f.remote.record(&record_id(&local)).await.unwrap();
        assert_eq!(stored.string(fields::NAME), Some("Drums"));
    }
}
