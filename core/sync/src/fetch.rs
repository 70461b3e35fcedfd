//! Incremental fetch of remote changes.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use tapedeck_common::{ChangeToken, Error, RecordId, RemoteRecord, Result, ZoneId};
use tapedeck_storage::RemoteStore;

use crate::apply::{ApplyReport, ChangeApplier, ChangeSet};
use crate::retry::RetryExecutor;
use crate::state::SyncStateStore;
use crate::tombstone::TombstoneLedger;

/// Result of a fetch pass.
#[derive(Debug)]
pub enum FetchOutcome {
    /// All pages were applied and the token advanced.
    Applied(ApplyReport),
    /// The zone no longer exists; the caller must reprovision.
    NamespaceDeleted,
}

/// Pulls the delta feed page by page.
///
/// All pages are collected before anything is applied, and the change token
/// is persisted only after the local batch has been committed.
pub struct ChangeFetcher {
    remote: Arc<dyn RemoteStore>,
    state: Arc<dyn SyncStateStore>,
    retry: RetryExecutor,
    zone: ZoneId,
    page_size: usize,
}

impl ChangeFetcher {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        state: Arc<dyn SyncStateStore>,
        retry: RetryExecutor,
        zone: ZoneId,
        page_size: usize,
    ) -> Self {
        Self {
            remote,
            state,
            retry,
            zone,
            page_size: page_size.max(1),
        }
    }

    /// Fetch every pending change and apply it.
    ///
    /// An expired token is cleared and the fetch restarts once from scratch.
    /// Any other failure leaves the persisted token untouched.
    pub async fn fetch_and_apply(
        &self,
        applier: &ChangeApplier,
        ledger: &mut TombstoneLedger,
    ) -> Result<FetchOutcome> {
        let mut restarted = false;

        loop {
            let since = self.state.change_token(&self.zone).await?;
            let collected = self.collect(since.clone()).await;

            match collected {
                Ok((changes, token)) => {
                    let count = changes.len();
                    let report = applier.apply(changes, ledger).await?;
                    if since.as_ref() != Some(&token) {
                        self.state.set_change_token(&self.zone, Some(token)).await?;
                    }
                    debug!("Fetched {} changes from {}", count, self.zone);
                    return Ok(FetchOutcome::Applied(report));
                }
                Err(Error::TokenExpired) if !restarted => {
                    warn!("Change token for {} expired, refetching from scratch", self.zone);
                    self.state.set_change_token(&self.zone, None).await?;
                    restarted = true;
                }
                Err(Error::NamespaceDeleted(zone)) => {
                    info!("Zone {} no longer exists", zone);
                    return Ok(FetchOutcome::NamespaceDeleted);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read all pages after `since`, returning the changes and the final token.
    async fn collect(&self, since: Option<ChangeToken>) -> Result<(ChangeSet, ChangeToken)> {
        let remote = self.remote.as_ref();
        let mut token = since;
        let mut events: Vec<(RecordId, Option<RemoteRecord>)> = Vec::new();
        let mut pages = 0usize;

        loop {
            let cursor = token.clone();
            let page = self
                .retry
                .execute(|| remote.fetch_changes(&self.zone, cursor.as_ref(), self.page_size))
                .await?;
            pages += 1;

            events.extend(page.changed.into_iter().map(|r| (r.id.clone(), Some(r))));
            events.extend(page.deleted.into_iter().map(|id| (id, None)));
            token = Some(page.token);

            if !page.more_coming {
                break;
            }
        }

        let token = token.ok_or_else(|| Error::Storage("change feed returned no token".to_string()))?;
        debug!("Collected {} events over {} pages", events.len(), pages);
        Ok((coalesce(events), token))
    }
}

/// Keep only the last event per record, in order of last occurrence.
fn coalesce(events: Vec<(RecordId, Option<RemoteRecord>)>) -> ChangeSet {
    let mut last: HashMap<RecordId, usize> = HashMap::new();
    for (index, (id, _)) in events.iter().enumerate() {
        last.insert(id.clone(), index);
    }

    let mut changes = ChangeSet::default();
    for (index, (id, record)) in events.into_iter().enumerate() {
        if last.get(&id) != Some(&index) {
            continue;
        }
        match record {
            Some(record) => changes.changed.push(record),
            None => changes.deleted.push(id),
        }
    }
    changes
}
