//! Remote record store trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tapedeck_common::{AssetRef, ChangeToken, FieldValue, RecordId, RemoteRecord, Result, ZoneId};

/// Account state reported by the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    /// Signed in and usable.
    Available,
    /// No account signed in on this device.
    NoAccount,
    /// Account exists but access is restricted (parental controls, MDM).
    Restricted,
    /// Account state could not be determined right now.
    TemporarilyUnavailable,
}

impl AccountStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, AccountStatus::Available)
    }
}

/// Filter applied by [`RemoteStore::query`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordPredicate {
    /// Every record of the queried type.
    All,
    /// Records whose field equals the given value.
    FieldEquals { field: String, value: FieldValue },
    /// Records whose date field is strictly before `before`.
    DateBefore { field: String, before: DateTime<Utc> },
}

impl RecordPredicate {
    /// Evaluate the predicate against a record.
    pub fn matches(&self, record: &RemoteRecord) -> bool {
        match self {
            RecordPredicate::All => true,
            RecordPredicate::FieldEquals { field, value } => record.get(field) == Some(value),
            RecordPredicate::DateBefore { field, before } => {
                record.date(field).is_some_and(|d| d < *before)
            }
        }
    }
}

/// A predicate-based query over one record type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordQuery {
    pub record_type: String,
    pub predicate: RecordPredicate,
}

impl RecordQuery {
    pub fn new(record_type: impl Into<String>, predicate: RecordPredicate) -> Self {
        Self {
            record_type: record_type.into(),
            predicate,
        }
    }
}

/// One page of the incremental delta feed.
#[derive(Debug, Clone)]
pub struct ChangePage {
    /// Records created or modified since the previous token.
    pub changed: Vec<RemoteRecord>,
    /// Records deleted since the previous token.
    pub deleted: Vec<RecordId>,
    /// Token positioned after this page.
    pub token: ChangeToken,
    /// Whether another page is available.
    pub more_coming: bool,
}

/// Remote multi-device record store.
///
/// All operations are async. Writes use optimistic concurrency: a saved record
/// must carry the `change_tag` the server last issued for it, otherwise the
/// save fails with a version conflict that carries the current server record.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Get the store name (e.g., "memory", "cloud").
    fn name(&self) -> &str;

    /// Report whether a usable account is signed in.
    async fn account_status(&self) -> Result<AccountStatus>;

    /// Create a namespace. Creating an existing zone succeeds.
    async fn create_zone(&self, zone: &ZoneId) -> Result<()>;

    /// Register a push subscription for changes in a zone.
    async fn save_subscription(&self, zone: &ZoneId, subscription_id: &str) -> Result<()>;

    /// Fetch a single record.
    ///
    /// # Returns
    /// `Ok(None)` when the record does not exist.
    async fn fetch_record(&self, id: &RecordId) -> Result<Option<RemoteRecord>>;

    /// Save a single record.
    ///
    /// # Postconditions
    /// - Returns the stored record with a fresh `change_tag`
    ///
    /// # Errors
    /// - `VersionConflict` when the server version moved on
    /// - `NamespaceDeleted` when the zone does not exist
    async fn save_record(&self, record: RemoteRecord) -> Result<RemoteRecord>;

    /// Delete a single record.
    ///
    /// # Errors
    /// - `NotFound` when the record does not exist
    async fn delete_record(&self, id: &RecordId) -> Result<()>;

    /// Save and delete several records atomically.
    ///
    /// Either every save and delete is applied or none is. Deleting a record
    /// that does not exist is not an error.
    async fn modify_records(
        &self,
        saves: Vec<RemoteRecord>,
        deletes: Vec<RecordId>,
    ) -> Result<Vec<RemoteRecord>>;

    /// Run a predicate query in a zone.
    async fn query(&self, zone: &ZoneId, query: &RecordQuery) -> Result<Vec<RemoteRecord>>;

    /// Fetch one page of changes after `token` (from the beginning if `None`).
    ///
    /// # Errors
    /// - `TokenExpired` when the server no longer accepts the token
    /// - `NamespaceDeleted` when the zone does not exist
    async fn fetch_changes(
        &self,
        zone: &ZoneId,
        token: Option<&ChangeToken>,
        limit: usize,
    ) -> Result<ChangePage>;

    /// Upload a binary payload and return a reference to attach to records.
    async fn upload_asset(&self, data: Vec<u8>) -> Result<AssetRef>;

    /// Download a binary payload by reference.
    async fn download_asset(&self, asset: &AssetRef) -> Result<Vec<u8>>;
}
