//! Local cache of downloaded assets the device does not own.
//!
//! Cached payloads live in one directory next to a `cache_index.json` access
//! index. Assets produced on this device are kept in the primary asset store
//! and never pass through here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};

use tapedeck_common::{AssetRef, Error, Result};
use tapedeck_storage::RemoteStore;

use crate::config::CacheConfig;
use crate::retry::RetryExecutor;
use crate::tracker::content_digest;

const INDEX_FILE: &str = "cache_index.json";

/// A cached payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Remote asset key.
    pub key: String,
    /// File name inside the cache directory.
    pub file: String,
    pub size: u64,
    pub last_accessed: DateTime<Utc>,
}

/// What an eviction pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub stale_removed: usize,
    pub lru_removed: usize,
    pub bytes_freed: u64,
}

impl EvictionReport {
    pub fn removed(&self) -> usize {
        self.stale_removed + self.lru_removed
    }
}

/// Bounded cache of downloaded assets.
pub struct AssetCache {
    dir: PathBuf,
    index_path: PathBuf,
    entries: HashMap<String, CacheEntry>,
    stale_after: chrono::Duration,
    byte_budget: u64,
}

impl AssetCache {
    /// Open the cache, creating the directory if needed.
    ///
    /// An unreadable index is discarded; the orphaned files it described are
    /// removed by [`cleanup_orphaned`](Self::cleanup_orphaned).
    pub async fn open(config: &CacheConfig) -> Result<Self> {
        let dir = config.dir.clone();
        fs::create_dir_all(&dir).await?;
        let index_path = dir.join(INDEX_FILE);

        let entries = match fs::read_to_string(&index_path).await {
            Ok(content) => match serde_json::from_str::<Vec<CacheEntry>>(&content) {
                Ok(list) => list.into_iter().map(|e| (e.key.clone(), e)).collect(),
                Err(e) => {
                    warn!("Discarding unreadable cache index: {}", e);
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(Error::Io(e)),
        };

        Ok(Self {
            dir,
            index_path,
            entries,
            stale_after: chrono::Duration::days(config.stale_after_days),
            byte_budget: config.byte_budget,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_name(key: &str) -> String {
        format!("{}.bin", content_digest(key.as_bytes()))
    }

    /// Read a cached payload, refreshing its access time.
    pub async fn get(&mut self, key: &str, now: DateTime<Utc>) -> Result<Option<Vec<u8>>> {
        let Some(entry) = self.entries.get_mut(key) else {
            return Ok(None);
        };
        match fs::read(self.dir.join(&entry.file)).await {
            Ok(data) => {
                entry.last_accessed = now;
                self.persist_index().await?;
                Ok(Some(data))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Cached file for {} vanished", key);
                self.entries.remove(key);
                self.persist_index().await?;
                Ok(None)
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Store a payload under `key`.
    pub async fn put(&mut self, key: &str, data: &[u8], now: DateTime<Utc>) -> Result<()> {
        let file = Self::file_name(key);
        let tmp = self.dir.join(format!(".{}.tmp", file));
        fs::write(&tmp, data).await?;
        fs::rename(&tmp, self.dir.join(&file)).await?;

        self.entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                file,
                size: data.len() as u64,
                last_accessed: now,
            },
        );
        self.persist_index().await
    }

    /// Return the cached payload for `asset`, downloading it on a miss.
    ///
    /// # Errors
    /// - `AssetTooLarge` when the payload exceeds `max_bytes`
    pub async fn get_or_download(
        &mut self,
        remote: &dyn RemoteStore,
        retry: &RetryExecutor,
        asset: &AssetRef,
        max_bytes: u64,
        now: DateTime<Utc>,
    ) -> Result<Vec<u8>> {
        if let Some(data) = self.get(&asset.key, now).await? {
            return Ok(data);
        }
        if let Some(size) = asset.size.filter(|size| *size > max_bytes) {
            return Err(Error::AssetTooLarge {
                size,
                limit: max_bytes,
            });
        }

        let data = retry.execute(|| remote.download_asset(asset)).await?;
        if data.len() as u64 > max_bytes {
            return Err(Error::AssetTooLarge {
                size: data.len() as u64,
                limit: max_bytes,
            });
        }
        self.put(&asset.key, &data, now).await?;
        debug!("Cached asset {} ({} bytes)", asset.key, data.len());
        Ok(data)
    }

    /// Two-phase eviction.
    ///
    /// Entries not accessed within the staleness horizon are always removed.
    /// If the cache still exceeds its byte budget, least recently accessed
    /// entries are removed until it fits.
    pub async fn evict_if_needed(&mut self, now: DateTime<Utc>) -> Result<EvictionReport> {
        let mut report = EvictionReport::default();

        let horizon = now - self.stale_after;
        let stale: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.last_accessed < horizon)
            .map(|e| e.key.clone())
            .collect();
        for key in stale {
            report.bytes_freed += self.remove_entry(&key).await?;
            report.stale_removed += 1;
        }

        if self.total_size() > self.byte_budget {
            let mut by_age: Vec<(DateTime<Utc>, String)> = self
                .entries
                .values()
                .map(|e| (e.last_accessed, e.key.clone()))
                .collect();
            by_age.sort();

            for (_, key) in by_age {
                if self.total_size() <= self.byte_budget {
                    break;
                }
                report.bytes_freed += self.remove_entry(&key).await?;
                report.lru_removed += 1;
            }
        }

        if report.removed() > 0 {
            self.persist_index().await?;
            info!(
                "Evicted {} cached assets ({} stale, {} bytes)",
                report.removed(),
                report.stale_removed,
                report.bytes_freed
            );
        }
        Ok(report)
    }

    /// Remove files with no index entry and entries with no file.
    ///
    /// Returns the number of files and entries removed.
    pub async fn cleanup_orphaned(&mut self) -> Result<usize> {
        let mut removed = 0;

        let before = self.entries.len();
        let dir = self.dir.clone();
        let mut missing = Vec::new();
        for entry in self.entries.values() {
            if !fs::try_exists(dir.join(&entry.file)).await? {
                missing.push(entry.key.clone());
            }
        }
        for key in &missing {
            self.entries.remove(key);
        }
        removed += before - self.entries.len();

        let known: std::collections::HashSet<&str> =
            self.entries.values().map(|e| e.file.as_str()).collect();
        let mut orphans = Vec::new();
        let mut listing = fs::read_dir(&dir).await?;
        while let Some(item) = listing.next_entry().await? {
            let name = item.file_name().to_string_lossy().into_owned();
            if name == INDEX_FILE || known.contains(name.as_str()) {
                continue;
            }
            if item.file_type().await?.is_file() {
                orphans.push(item.path());
            }
        }
        for path in orphans {
            fs::remove_file(&path).await?;
            removed += 1;
        }

        if removed > 0 {
            self.persist_index().await?;
            debug!("Removed {} orphaned cache items", removed);
        }
        Ok(removed)
    }

    pub fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.values()
    }

    async fn remove_entry(&mut self, key: &str) -> Result<u64> {
        let Some(entry) = self.entries.remove(key) else {
            return Ok(0);
        };
        match fs::remove_file(self.dir.join(&entry.file)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }
        Ok(entry.size)
    }

    async fn persist_index(&self) -> Result<()> {
        let mut list: Vec<&CacheEntry> = self.entries.values().collect();
        list.sort_by(|a, b| a.key.cmp(&b.key));
        let json = serde_json::to_string_pretty(&list)
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let tmp = self.dir.join(format!(".{}.tmp", INDEX_FILE));
        fs::write(&tmp, json).await?;
        fs::rename(&tmp, &self.index_path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tapedeck_storage::{MemoryRecordStore, Operation};
    use tempfile::TempDir;

    async fn cache(temp: &TempDir, budget: u64) -> AssetCache {
        let config = CacheConfig::new(temp.path().join("cache")).with_byte_budget(budget);
        AssetCache::open(&config).await.unwrap()
    }

    #[tokio::test]
    async fn test_put_get_and_reopen() {
        let temp = TempDir::new().unwrap();
        let now = Utc::now();
        {
            let mut c = cache(&temp, 1024).await;
            c.put("k1", b"payload", now).await.unwrap();
        }
        let mut c = cache(&temp, 1024).await;
        assert_eq!(c.get("k1", now).await.unwrap(), Some(b"payload".to_vec()));
        assert_eq!(c.total_size(), 7);
    }

    #[tokio::test]
    async fn test_stale_entries_always_evicted() {
        let temp = TempDir::new().unwrap();
        let now = Utc::now();
        let mut c = cache(&temp, 1024).await;
        c.put("old", b"a", now - Duration::days(31)).await.unwrap();
        c.put("fresh", b"b", now - Duration::days(1)).await.unwrap();

        let report = c.evict_if_needed(now).await.unwrap();
        assert_eq!(report.stale_removed, 1);
        assert_eq!(report.lru_removed, 0);
        assert!(c.get("old", now).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lru_eviction_until_under_budget() {
        let temp = TempDir::new().unwrap();
        let now = Utc::now();
        let mut c = cache(&temp, 10).await;
        c.put("a", &[0u8; 6], now - Duration::hours(3)).await.unwrap();
        c.put("b", &[0u8; 6], now - Duration::hours(2)).await.unwrap();
        c.put("c", &[0u8; 4], now - Duration::hours(1)).await.unwrap();

        let report = c.evict_if_needed(now).await.unwrap();
        assert_eq!(report.lru_removed, 1);
        assert_eq!(report.bytes_freed, 6);
        let mut keys: Vec<_> = c.entries().map(|e| e.key.clone()).collect();
        keys.sort();
        assert_eq!(keys, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_get_or_download_hits_cache_second_time() {
        let temp = TempDir::new().unwrap();
        let remote = MemoryRecordStore::new();
        let asset = remote.upload_asset(b"shared".to_vec()).await.unwrap();
        let mut c = cache(&temp, 1024).await;
        let retry = RetryExecutor::default();

        let first = c.get_or_download(&remote, &retry, &asset, 100, Utc::now()).await.unwrap();
        let second = c.get_or_download(&remote, &retry, &asset, 100, Utc::now()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(remote.call_count(Operation::DownloadAsset).await, 1);

        let err = c
            .get_or_download(
                &remote,
                &retry,
                &AssetRef {
                    key: "big".into(),
                    size: Some(1000),
                },
                100,
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AssetTooLarge { .. }));
    }

    #[tokio::test]
    async fn test_cleanup_orphaned() {
        let temp = TempDir::new().unwrap();
        let now = Utc::now();
        let mut c = cache(&temp, 1024).await;
        c.put("kept", b"x", now).await.unwrap();
        c.put("lost", b"y", now).await.unwrap();
        std::fs::remove_file(c.dir().join(AssetCache::file_name("lost"))).unwrap();
        std::fs::write(c.dir().join("stray.bin"), b"z").unwrap();

        assert_eq!(c.cleanup_orphaned().await.unwrap(), 2);
        assert_eq!(c.len(), 1);
        assert!(!c.dir().join("stray.bin").exists());
    }
}
