//! Upload pipeline: pushes local entities and deletions to the remote store.

use std::sync::Arc;
use tracing::{debug, info, warn};

use tapedeck_common::{AssetRef, Error, FieldValue, RemoteRecord, Result, ZoneId};
use tapedeck_storage::{AssetStore, RemoteStore};

use crate::conflict::ConflictResolver;
use crate::entity::SyncEntity;
use crate::retry::RetryExecutor;
use crate::status::StatusPublisher;
use crate::tombstone::Tombstone;
use crate::translate::{self, fields};

/// Binary payload of an entity being uploaded.
///
/// The payload is uploaded at most once per save, even when conflict
/// resolution rebuilds the record several times.
pub struct AssetAttachment<'a> {
    assets: &'a dyn AssetStore,
    name: Option<String>,
    digest: Option<String>,
    uploaded: Option<AssetRef>,
}

impl<'a> AssetAttachment<'a> {
    pub fn for_entity(assets: &'a dyn AssetStore, entity: &SyncEntity) -> Self {
        let digest = match entity {
            SyncEntity::Recording(r) => r.audio_digest.clone(),
            _ => None,
        };
        Self {
            assets,
            name: entity.asset_name().map(str::to_string),
            digest,
            uploaded: None,
        }
    }

    /// Attach the payload to `record` if the server copy lacks it or differs.
    ///
    /// Must run before the local fields are written onto `record`, since it
    /// compares against the server's digest.
    pub async fn attach(
        &mut self,
        remote: &dyn RemoteStore,
        retry: &RetryExecutor,
        record: &mut RemoteRecord,
    ) -> Result<()> {
        let Some(name) = self.name.as_deref() else {
            return Ok(());
        };

        let server_digest = record.string(fields::AUDIO_DIGEST);
        if record.get(fields::AUDIO).is_some() && server_digest == self.digest.as_deref() {
            debug!("Asset {} already current on {}", name, record.id);
            return Ok(());
        }

        if self.uploaded.is_none() {
            if !self.assets.exists(name).await? {
                warn!("Asset {} missing locally, uploading metadata only", name);
                return Ok(());
            }
            let data = self.assets.read(name).await?;
            info!("Uploading asset {} ({} bytes)", name, data.len());
            let asset = retry.execute(|| remote.upload_asset(data.clone())).await?;
            self.uploaded = Some(asset);
        }

        if let Some(asset) = &self.uploaded {
            record.set(fields::AUDIO, FieldValue::Asset(asset.clone()));
        }
        Ok(())
    }
}

/// Result of a successful save.
#[derive(Debug, Clone)]
pub struct UploadOutcome {
    pub record: RemoteRecord,
    pub conflicts_resolved: usize,
    /// The server already held a newer version; nothing was written.
    pub superseded: bool,
}

/// Pushes one entity at a time to the remote store.
pub struct UploadPipeline {
    remote: Arc<dyn RemoteStore>,
    assets: Arc<dyn AssetStore>,
    retry: RetryExecutor,
    resolver: ConflictResolver,
    status: Arc<StatusPublisher>,
    zone: ZoneId,
}

impl UploadPipeline {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        assets: Arc<dyn AssetStore>,
        retry: RetryExecutor,
        resolver: ConflictResolver,
        status: Arc<StatusPublisher>,
        zone: ZoneId,
    ) -> Self {
        Self {
            remote,
            assets,
            retry,
            resolver,
            status,
            zone,
        }
    }

    /// Save one entity, resolving version conflicts in-line.
    ///
    /// A server version modified after `entity` is left in place and
    /// reported as superseded; the next fetch brings it down.
    ///
    /// # Errors
    /// - `VersionConflict` when resolution attempts are exhausted
    /// - Any transport error after in-line retries
    pub async fn save_entity(&self, entity: &SyncEntity) -> Result<UploadOutcome> {
        let entity_type = entity.entity_type();
        let id = translate::record_id(&self.zone, entity_type, entity.id());
        let remote = self.remote.as_ref();
        self.status.set_upload_progress(entity_type, entity.id(), 0.0);

        let existing = self.retry.execute(|| remote.fetch_record(&id)).await?;
        let mut record = match existing {
            Some(server) if is_newer(&server, entity) => {
                debug!("Server version of {} is newer, skipping upload", id);
                self.status.set_upload_progress(entity_type, entity.id(), 1.0);
                return Ok(UploadOutcome {
                    record: server,
                    conflicts_resolved: 0,
                    superseded: true,
                });
            }
            Some(server) => server,
            None => RemoteRecord::new(id.clone()),
        };

        let mut attachment = AssetAttachment::for_entity(self.assets.as_ref(), entity);
        attachment.attach(remote, &self.retry, &mut record).await?;
        translate::write_fields(entity, &mut record);
        self.status.set_upload_progress(entity_type, entity.id(), 0.5);

        let result = self.retry.execute(|| remote.save_record(record.clone())).await;
        let outcome = match result {
            Ok(saved) => UploadOutcome {
                record: saved,
                conflicts_resolved: 0,
                superseded: false,
            },
            Err(conflict @ Error::VersionConflict { .. }) => {
                debug!("Stale version for {}, resolving", id);
                let resolution = self
                    .resolver
                    .resolve(remote, &self.retry, &id, entity, &mut attachment, conflict)
                    .await?;
                UploadOutcome {
                    record: resolution.record,
                    conflicts_resolved: 1,
                    superseded: resolution.superseded,
                }
            }
            Err(e) => return Err(e),
        };

        self.status.set_upload_progress(entity_type, entity.id(), 1.0);
        debug!("Saved {}", id);
        Ok(outcome)
    }

    /// Write a tombstone and delete the primary record in one batch.
    ///
    /// If the tombstone record already exists only the primary is deleted.
    pub async fn delete_entity(&self, tombstone: &Tombstone) -> Result<()> {
        let remote = self.remote.as_ref();
        let marker = Tombstone::record_id(&self.zone, &tombstone.id);
        let primary = translate::record_id(&self.zone, tombstone.entity_type, &tombstone.id);

        let existing = self.retry.execute(|| remote.fetch_record(&marker)).await?;
        let saves = match existing {
            Some(_) => Vec::new(),
            None => vec![tombstone.to_record(&self.zone)],
        };

        self.retry
            .execute(|| remote.modify_records(saves.clone(), vec![primary.clone()]))
            .await?;

        debug!("Deleted {} with tombstone", primary);
        Ok(())
    }

    pub fn zone(&self) -> &ZoneId {
        &self.zone
    }
}

fn is_newer(server: &RemoteRecord, entity: &SyncEntity) -> bool {
    server
        .date(fields::MODIFIED_AT)
        .is_some_and(|modified| modified > entity.modified_at())
}
