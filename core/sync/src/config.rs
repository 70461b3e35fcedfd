//! Configuration for the sync engine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tapedeck_common::{DeviceId, Error, Result, ZoneId};

use crate::retry::RetryConfig;

/// Configuration for the downloaded-asset cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory holding cached payloads and the access index.
    pub dir: PathBuf,
    /// Entries not accessed for this many days are always evicted.
    pub stale_after_days: i64,
    /// Total bytes the cache may hold after eviction.
    pub byte_budget: u64,
}

impl CacheConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            stale_after_days: 30,
            byte_budget: 500 * 1024 * 1024,
        }
    }

    pub fn with_stale_after_days(mut self, days: i64) -> Self {
        self.stale_after_days = days;
        self
    }

    pub fn with_byte_budget(mut self, bytes: u64) -> Self {
        self.byte_budget = bytes;
        self
    }
}

/// Configuration for the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// When false every cycle is a no-op and status reads `disabled`.
    pub enabled: bool,
    /// Identity stamped on tombstones issued by this device.
    pub device_id: DeviceId,
    /// Namespace holding all synchronized records.
    pub zone: ZoneId,
    /// Push subscription registered for the zone.
    pub subscription_id: String,
    /// Quiet period before a requested sync starts.
    pub debounce: Duration,
    /// Optional interval for automatic full syncs.
    pub periodic_interval: Option<Duration>,
    /// Backoff policy for remote calls.
    pub retry: RetryConfig,
    /// Extra write attempts after a version conflict.
    pub conflict_retries: u32,
    /// Maximum changes requested per delta page.
    pub fetch_page_size: usize,
    /// Failed replays after which a queued operation is dropped.
    pub queue_max_attempts: u32,
    /// Queued operations older than this are dropped unconditionally.
    pub queue_ttl_days: i64,
    /// Tombstones older than this are pruned.
    pub tombstone_retention_days: i64,
    /// Hard ceiling for inbound asset downloads.
    pub max_inbound_asset_bytes: u64,
    /// Downloaded-asset cache; disabled when `None`.
    pub cache: Option<CacheConfig>,
}

impl SyncConfig {
    /// Create a configuration with defaults for the given device.
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            enabled: true,
            device_id,
            zone: ZoneId::new("Recordings"),
            subscription_id: "recordings-changes".to_string(),
            debounce: Duration::from_millis(500),
            periodic_interval: None,
            retry: RetryConfig::default(),
            conflict_retries: 2,
            fetch_page_size: 200,
            queue_max_attempts: 5,
            queue_ttl_days: 7,
            tombstone_retention_days: 90,
            max_inbound_asset_bytes: 200 * 1024 * 1024,
            cache: None,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_zone(mut self, zone: ZoneId) -> Self {
        self.zone = zone;
        self
    }

    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn with_periodic_interval(mut self, interval: Duration) -> Self {
        self.periodic_interval = Some(interval);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_fetch_page_size(mut self, size: usize) -> Self {
        self.fetch_page_size = size.max(1);
        self
    }

    pub fn with_max_inbound_asset_bytes(mut self, bytes: u64) -> Self {
        self.max_inbound_asset_bytes = bytes;
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn queue_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.queue_ttl_days)
    }

    pub fn tombstone_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.tombstone_retention_days)
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&content).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(DeviceId::generate())
    }
}
