//! Local binary asset storage trait.

use async_trait::async_trait;

use tapedeck_common::{Error, Result};

/// Durable local storage for binary assets (audio payloads).
///
/// Assets are addressed by a flat file name. Implementations must never leave
/// a partially written payload under an asset's name.
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Read a whole asset.
    ///
    /// # Errors
    /// - `NotFound` when the asset does not exist
    async fn read(&self, name: &str) -> Result<Vec<u8>>;

    /// Check if an asset exists.
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Install a new asset.
    ///
    /// # Postconditions
    /// - On success the asset is fully written under `name`
    /// - On failure nothing is left under `name`
    async fn install(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Replace an existing asset using a safe swap.
    ///
    /// Stages the payload and commits it straight away.
    ///
    /// # Errors
    /// - `AssetCopyFailed` when the swap could not be completed
    async fn swap(&self, name: &str, data: &[u8]) -> Result<()> {
        self.stage_swap(name, data).await?;
        self.commit_swap(name).await
    }

    /// Put `data` in place under `name` while keeping the previous payload.
    ///
    /// The incoming payload is written to a temporary file, the current file
    /// is moved to a backup and the temporary file is moved into place. If
    /// any step fails the backup is restored. After success exactly one of
    /// `commit_swap` or `rollback_swap` must follow.
    ///
    /// # Errors
    /// - `AssetCopyFailed` when the payload could not be put in place
    async fn stage_swap(&self, name: &str, data: &[u8]) -> Result<()>;

    /// Drop the payload kept by `stage_swap`.
    async fn commit_swap(&self, name: &str) -> Result<()>;

    /// Restore the payload kept by `stage_swap`. A name that had no payload
    /// before staging is removed.
    async fn rollback_swap(&self, name: &str) -> Result<()>;

    /// Remove an asset. Removing a missing asset succeeds.
    async fn remove(&self, name: &str) -> Result<()>;
}

/// Validate a flat asset name.
///
/// # Errors
/// - Returns error if the name is empty, contains separators or is a dot name
pub fn validate_asset_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidInput("Asset name cannot be empty".to_string()));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(Error::InvalidInput(
            "Asset name cannot contain separators".to_string(),
        ));
    }
    if name.starts_with('.') {
        return Err(Error::InvalidInput(
            "Asset name cannot start with a dot".to_string(),
        ));
    }
    Ok(())
}
