//! In-memory record store for testing and simulation.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::Mutex;
use uuid::Uuid;

use tapedeck_common::{AssetRef, ChangeToken, Error, RecordId, RemoteRecord, Result, ZoneId};

use crate::provider::{AccountStatus, ChangePage, RecordQuery, RemoteStore};

/// Store operations, used for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    AccountStatus,
    CreateZone,
    SaveSubscription,
    FetchRecord,
    SaveRecord,
    DeleteRecord,
    ModifyRecords,
    Query,
    FetchChanges,
    UploadAsset,
    DownloadAsset,
}

type RecordKey = (String, String);

fn key_of(id: &RecordId) -> RecordKey {
    (id.record_type.clone(), id.name.clone())
}

/// One entry of a zone's change log.
#[derive(Debug, Clone)]
struct LogEntry {
    seq: u64,
    id: RecordId,
}

#[derive(Debug, Default)]
struct ZoneState {
    records: HashMap<RecordKey, RemoteRecord>,
    log: Vec<LogEntry>,
}

struct Inner {
    zones: HashMap<ZoneId, ZoneState>,
    next_seq: u64,
    token_epoch: u64,
    page_size: usize,
    subscriptions: HashSet<(ZoneId, String)>,
    assets: HashMap<String, Vec<u8>>,
    account: AccountStatus,
    /// Scripted outcomes per operation; `None` lets the call through.
    failures: HashMap<Operation, VecDeque<Option<Error>>>,
    interleaved: HashMap<String, RemoteRecord>,
    calls: HashMap<Operation, usize>,
}

impl Inner {
    /// Count the call and pop an injected failure, if any.
    fn enter(&mut self, op: Operation) -> Result<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        match self.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(Some(err)) => Err(err),
            _ => Ok(()),
        }
    }

    fn zone_mut(&mut self, zone: &ZoneId) -> Result<&mut ZoneState> {
        self.zones
            .get_mut(zone)
            .ok_or_else(|| Error::NamespaceDeleted(zone.to_string()))
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Store a record unconditionally, issuing a new change tag.
    fn put(&mut self, mut record: RemoteRecord) -> Result<RemoteRecord> {
        let seq = self.bump_seq();
        record.change_tag = Some(Uuid::new_v4().to_string());
        record.server_modified_at = Some(Utc::now());

        let zone = self.zone_mut(&record.id.zone)?;
        zone.log.push(LogEntry {
            seq,
            id: record.id.clone(),
        });
        zone.records.insert(key_of(&record.id), record.clone());
        Ok(record)
    }

    fn remove(&mut self, id: &RecordId) -> Result<bool> {
        let seq = self.bump_seq();
        let zone = self.zone_mut(&id.zone)?;
        let existed = zone.records.remove(&key_of(id)).is_some();
        if existed {
            zone.log.push(LogEntry {
                seq,
                id: id.clone(),
            });
        }
        Ok(existed)
    }

    /// Apply a pending concurrent write queued for this record name.
    fn apply_interleaved(&mut self, name: &str) -> Result<()> {
        if let Some(mut other) = self.interleaved.remove(name) {
            let current_tag = self
                .zones
                .get(&other.id.zone)
                .and_then(|z| z.records.get(&key_of(&other.id)))
                .and_then(|r| r.change_tag.clone());
            other.change_tag = current_tag;
            self.put(other)?;
        }
        Ok(())
    }

    /// Reject the save if the server version moved past the record's tag.
    fn check_version(&self, record: &RemoteRecord) -> Result<()> {
        let zone = self
            .zones
            .get(&record.id.zone)
            .ok_or_else(|| Error::NamespaceDeleted(record.id.zone.to_string()))?;

        if let Some(current) = zone.records.get(&key_of(&record.id)) {
            if current.change_tag != record.change_tag {
                return Err(Error::VersionConflict {
                    record: record.id.to_string(),
                    server_record: Some(Box::new(current.clone())),
                });
            }
        }
        Ok(())
    }

    fn encode_token(&self, seq: u64) -> ChangeToken {
        ChangeToken::new(format!("{}:{}", self.token_epoch, seq))
    }

    fn decode_token(&self, token: &ChangeToken) -> Result<u64> {
        let (epoch, seq) = token
            .as_str()
            .split_once(':')
            .ok_or(Error::TokenExpired)?;
        let epoch: u64 = epoch.parse().map_err(|_| Error::TokenExpired)?;
        if epoch != self.token_epoch {
            return Err(Error::TokenExpired);
        }
        seq.parse().map_err(|_| Error::TokenExpired)
    }
}

/// In-memory record store.
///
/// Several simulated devices can share one instance through an `Arc`. Besides
/// implementing [`RemoteStore`], it exposes hooks that simulate the failure
/// modes of a real cloud store: token expiry, zone deletion, injected errors
/// and concurrent writers.
pub struct MemoryRecordStore {
    inner: Mutex<Inner>,
}

impl MemoryRecordStore {
    /// Create a new empty store with no zones.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                zones: HashMap::new(),
                next_seq: 0,
                token_epoch: 1,
                page_size: 200,
                subscriptions: HashSet::new(),
                assets: HashMap::new(),
                account: AccountStatus::Available,
                failures: HashMap::new(),
                interleaved: HashMap::new(),
                calls: HashMap::new(),
            }),
        }
    }

    /// Cap the number of changes returned per page.
    pub async fn set_page_size(&self, page_size: usize) {
        self.inner.lock().await.page_size = page_size.max(1);
    }

    pub async fn set_account_status(&self, status: AccountStatus) {
        self.inner.lock().await.account = status;
    }

    /// Make the next calls of `op` fail with the given errors, in order.
    pub async fn fail_next(&self, op: Operation, errors: impl IntoIterator<Item = Error>) {
        let mut inner = self.inner.lock().await;
        inner
            .failures
            .entry(op)
            .or_default()
            .extend(errors.into_iter().map(Some));
    }

    /// Let `successes` more calls of `op` through, then fail the next one.
    pub async fn fail_after(&self, op: Operation, successes: usize, error: Error) {
        let mut inner = self.inner.lock().await;
        let queue = inner.failures.entry(op).or_default();
        queue.extend(std::iter::repeat_with(|| None).take(successes));
        queue.push_back(Some(error));
    }

    /// Simulate another device writing `record` right before our next save
    /// of the same record name.
    pub async fn interleave_next_save(&self, record: RemoteRecord) {
        let mut inner = self.inner.lock().await;
        inner.interleaved.insert(record.id.name.clone(), record);
    }

    /// Invalidate every issued change token.
    pub async fn expire_change_tokens(&self) {
        self.inner.lock().await.token_epoch += 1;
    }

    /// Drop a zone with all its records.
    pub async fn delete_zone(&self, zone: &ZoneId) {
        let mut inner = self.inner.lock().await;
        inner.zones.remove(zone);
        inner.subscriptions.retain(|(z, _)| z != zone);
    }

    /// Number of times `op` was invoked.
    pub async fn call_count(&self, op: Operation) -> usize {
        self.inner.lock().await.calls.get(&op).copied().unwrap_or(0)
    }

    /// Peek at a stored record without counting a call.
    pub async fn record(&self, id: &RecordId) -> Option<RemoteRecord> {
        let inner = self.inner.lock().await;
        inner
            .zones
            .get(&id.zone)
            .and_then(|z| z.records.get(&key_of(id)))
            .cloned()
    }

    /// Number of records of a type in a zone.
    pub async fn record_count(&self, zone: &ZoneId, record_type: &str) -> usize {
        let inner = self.inner.lock().await;
        inner
            .zones
            .get(zone)
            .map(|z| {
                z.records
                    .keys()
                    .filter(|(t, _)| t == record_type)
                    .count()
            })
            .unwrap_or(0)
    }

    pub async fn has_subscription(&self, zone: &ZoneId, subscription_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .subscriptions
            .contains(&(zone.clone(), subscription_id.to_string()))
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteStore for MemoryRecordStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn account_status(&self) -> Result<AccountStatus> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::AccountStatus)?;
        Ok(inner.account)
    }

    async fn create_zone(&self, zone: &ZoneId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::CreateZone)?;
        inner.zones.entry(zone.clone()).or_default();
        Ok(())
    }

    async fn save_subscription(&self, zone: &ZoneId, subscription_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::SaveSubscription)?;
        inner.zone_mut(zone)?;
        inner
            .subscriptions
            .insert((zone.clone(), subscription_id.to_string()));
        Ok(())
    }

    async fn fetch_record(&self, id: &RecordId) -> Result<Option<RemoteRecord>> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::FetchRecord)?;
        let zone = inner.zone_mut(&id.zone)?;
        Ok(zone.records.get(&key_of(id)).cloned())
    }

    async fn save_record(&self, record: RemoteRecord) -> Result<RemoteRecord> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::SaveRecord)?;
        inner.apply_interleaved(&record.id.name)?;
        inner.check_version(&record)?;
        inner.put(record)
    }

    async fn delete_record(&self, id: &RecordId) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::DeleteRecord)?;
        if inner.remove(id)? {
            Ok(())
        } else {
            Err(Error::NotFound(format!("Record not found: {}", id)))
        }
    }

    async fn modify_records(
        &self,
        saves: Vec<RemoteRecord>,
        deletes: Vec<RecordId>,
    ) -> Result<Vec<RemoteRecord>> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::ModifyRecords)?;

        for record in &saves {
            inner.apply_interleaved(&record.id.name)?;
        }
        // Validate the whole batch before touching anything.
        for record in &saves {
            inner.check_version(record)?;
        }
        for id in &deletes {
            inner.zone_mut(&id.zone)?;
        }

        let mut saved = Vec::with_capacity(saves.len());
        for record in saves {
            saved.push(inner.put(record)?);
        }
        for id in &deletes {
            inner.remove(id)?;
        }
        Ok(saved)
    }

    async fn query(&self, zone: &ZoneId, query: &RecordQuery) -> Result<Vec<RemoteRecord>> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::Query)?;
        let zone = inner.zone_mut(zone)?;
        let mut results: Vec<RemoteRecord> = zone
            .records
            .values()
            .filter(|r| r.record_type() == query.record_type && query.predicate.matches(r))
            .cloned()
            .collect();
        results.sort_by(|a, b| a.name().cmp(b.name()));
        Ok(results)
    }

    async fn fetch_changes(
        &self,
        zone: &ZoneId,
        token: Option<&ChangeToken>,
        limit: usize,
    ) -> Result<ChangePage> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::FetchChanges)?;

        let since = match token {
            Some(token) => inner.decode_token(token)?,
            None => 0,
        };
        let limit = limit.min(inner.page_size).max(1);

        let zone_state = inner
            .zones
            .get(zone)
            .ok_or_else(|| Error::NamespaceDeleted(zone.to_string()))?;

        // Latest event per record after `since`, in sequence order.
        let mut latest: HashMap<RecordKey, &LogEntry> = HashMap::new();
        for entry in zone_state.log.iter().filter(|e| e.seq > since) {
            latest.insert(key_of(&entry.id), entry);
        }
        let mut pending: Vec<&LogEntry> = latest.into_values().collect();
        pending.sort_by_key(|e| e.seq);

        let more_coming = pending.len() > limit;
        let page: Vec<&LogEntry> = pending.into_iter().take(limit).collect();
        let last_seq = page.last().map(|e| e.seq).unwrap_or(since);

        let mut changed = Vec::new();
        let mut deleted = Vec::new();
        for entry in page {
            match zone_state.records.get(&key_of(&entry.id)) {
                Some(record) => changed.push(record.clone()),
                None => deleted.push(entry.id.clone()),
            }
        }

        // When the feed is drained the token jumps to the head of the log.
        let position = if more_coming {
            last_seq
        } else {
            zone_state.log.last().map(|e| e.seq).unwrap_or(since).max(last_seq)
        };

        Ok(ChangePage {
            changed,
            deleted,
            token: inner.encode_token(position),
            more_coming,
        })
    }

    async fn upload_asset(&self, data: Vec<u8>) -> Result<AssetRef> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::UploadAsset)?;
        let asset = AssetRef {
            key: Uuid::new_v4().to_string(),
            size: Some(data.len() as u64),
        };
        inner.assets.insert(asset.key.clone(), data);
        Ok(asset)
    }

    async fn download_asset(&self, asset: &AssetRef) -> Result<Vec<u8>> {
        let mut inner = self.inner.lock().await;
        inner.enter(Operation::DownloadAsset)?;
        inner
            .assets
            .get(&asset.key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Asset not found: {}", asset.key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapedeck_common::FieldValue;

    fn zone() -> ZoneId {
        ZoneId::new("Recordings")
    }

    fn tag_record(name: &str, label: &str) -> RemoteRecord {
        let mut record = RemoteRecord::new(RecordId::new(zone(), "Tag", name));
        record.set("name", FieldValue::String(label.into()));
        record
    }

    async fn store() -> MemoryRecordStore {
        let store = MemoryRecordStore::new();
        store.create_zone(&zone()).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_save_and_fetch() {
        let store = store().await;
        let saved = store.save_record(tag_record("t1", "Drums")).await.unwrap();
        assert!(saved.change_tag.is_some());

        let fetched = store.fetch_record(&saved.id).await.unwrap().unwrap();
        assert_eq!(fetched.string("name"), Some("Drums"));
    }

    #[tokio::test]
    async fn test_stale_save_conflicts() {
        let store = store().await;
        let first = store.save_record(tag_record("t1", "Drums")).await.unwrap();
        let mut second = first.clone();
        second.set("name", FieldValue::String("Bass".into()));
        store.save_record(second).await.unwrap();

        // `first` still carries the old tag.
        let err = store.save_record(first).await.unwrap_err();
        match err {
            Error::VersionConflict { server_record, .. } => {
                let server = server_record.unwrap();
                assert_eq!(server.string("name"), Some("Bass"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_zone_reports_namespace_deleted() {
        let store = MemoryRecordStore::new();
        let err = store.save_record(tag_record("t1", "x")).await.unwrap_err();
        assert!(matches!(err, Error::NamespaceDeleted(_)));
    }

    #[tokio::test]
    async fn test_change_feed_pagination() {
        let store = store().await;
        store.set_page_size(2).await;
        for i in 0..5 {
            store
                .save_record(tag_record(&format!("t{i}"), "x"))
                .await
                .unwrap();
        }

        let mut token = None;
        let mut seen = 0;
        let mut pages = 0;
        loop {
            let page = store.fetch_changes(&zone(), token.as_ref(), 100).await.unwrap();
            seen += page.changed.len();
            pages += 1;
            token = Some(page.token);
            if !page.more_coming {
                break;
            }
        }
        assert_eq!(seen, 5);
        assert_eq!(pages, 3);

        let empty = store.fetch_changes(&zone(), token.as_ref(), 100).await.unwrap();
        assert!(empty.changed.is_empty());
        assert!(!empty.more_coming);
    }

    #[tokio::test]
    async fn test_change_feed_reports_deletions() {
        let store = store().await;
        let saved = store.save_record(tag_record("t1", "x")).await.unwrap();
        let page = store.fetch_changes(&zone(), None, 100).await.unwrap();

        store.delete_record(&saved.id).await.unwrap();
        let next = store.fetch_changes(&zone(), Some(&page.token), 100).await.unwrap();
        assert!(next.changed.is_empty());
        assert_eq!(next.deleted, vec![saved.id]);
    }

    #[tokio::test]
    async fn test_expired_token() {
        let store = store().await;
        let page = store.fetch_changes(&zone(), None, 100).await.unwrap();
        store.expire_change_tokens().await;
        let err = store
            .fetch_changes(&zone(), Some(&page.token), 100)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenExpired));
    }

    #[tokio::test]
    async fn test_modify_records_is_atomic() {
        let store = store().await;
        let saved = store.save_record(tag_record("t1", "x")).await.unwrap();
        let mut stale = saved.clone();
        stale.change_tag = Some("stale".into());

        let err = store
            .modify_records(vec![tag_record("t2", "y"), stale], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VersionConflict { .. }));
        assert_eq!(store.record_count(&zone(), "Tag").await, 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let store = store().await;
        store
            .fail_next(
                Operation::FetchRecord,
                [Error::ServiceUnavailable("busy".into())],
            )
            .await;
        let id = RecordId::new(zone(), "Tag", "t1");
        assert!(store.fetch_record(&id).await.is_err());
        assert!(store.fetch_record(&id).await.unwrap().is_none());
        assert_eq!(store.call_count(Operation::FetchRecord).await, 2);
    }

    #[tokio::test]
    async fn test_fail_after_lets_calls_through_first() {
        let store = store().await;
        store
            .fail_after(Operation::Query, 1, Error::NetworkUnavailable("down".into()))
            .await;
        let query = RecordQuery::new("Tag", crate::provider::RecordPredicate::All);
        assert!(store.query(&zone(), &query).await.is_ok());
        assert!(store.query(&zone(), &query).await.is_err());
        assert!(store.query(&zone(), &query).await.is_ok());
    }

    #[tokio::test]
    async fn test_interleaved_write_causes_conflict() {
        let store = store().await;
        store.interleave_next_save(tag_record("t1", "other device")).await;
        let err = store.save_record(tag_record("t1", "mine")).await.unwrap_err();
        assert!(matches!(err, Error::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn test_assets() {
        let store = store().await;
        let asset = store.upload_asset(vec![1, 2, 3]).await.unwrap();
        assert_eq!(asset.size, Some(3));
        assert_eq!(store.download_asset(&asset).await.unwrap(), vec![1, 2, 3]);
    }
}
