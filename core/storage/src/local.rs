//! Local filesystem asset store.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use tapedeck_common::{Error, Result};

use crate::asset::{validate_asset_name, AssetStore};

/// Filesystem-backed asset store.
///
/// Stores each asset as one file directly under the root directory. Temporary
/// and backup files use dot-prefixed names, which are never valid asset names.
pub struct LocalAssetStore {
    root: PathBuf,
}

impl LocalAssetStore {
    /// Create a new local asset store with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }

        Ok(Self { root })
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn asset_path(&self, name: &str) -> Result<PathBuf> {
        validate_asset_name(name)?;
        Ok(self.root.join(name))
    }

    fn incoming_path(&self, name: &str) -> PathBuf {
        self.root.join(format!(".{}.incoming", name))
    }

    fn backup_path(&self, name: &str) -> PathBuf {
        self.root.join(format!(".{}.backup", name))
    }

    /// Write `data` to the temporary path for `name`.
    async fn write_incoming(&self, name: &str, data: &[u8]) -> Result<PathBuf> {
        let incoming = self.incoming_path(name);
        if let Err(e) = fs::write(&incoming, data).await {
            let _ = fs::remove_file(&incoming).await;
            return Err(Error::AssetCopyFailed(format!(
                "writing incoming payload for {}: {}",
                name, e
            )));
        }
        Ok(incoming)
    }
}

#[async_trait]
impl AssetStore for LocalAssetStore {
    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.asset_path(name)?;
        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("Asset not found: {}", name)))
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let path = self.asset_path(name)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn install(&self, name: &str, data: &[u8]) -> Result<()> {
        let target = self.asset_path(name)?;
        let incoming = self.write_incoming(name, data).await?;

        if let Err(e) = fs::rename(&incoming, &target).await {
            let _ = fs::remove_file(&incoming).await;
            return Err(Error::AssetCopyFailed(format!(
                "installing {}: {}",
                name, e
            )));
        }

        debug!("Installed asset {} ({} bytes)", name, data.len());
        Ok(())
    }

    async fn stage_swap(&self, name: &str, data: &[u8]) -> Result<()> {
        let target = self.asset_path(name)?;
        let backup = self.backup_path(name);
        if !fs::try_exists(&target).await? {
            // A leftover backup must not be restored over a fresh install.
            remove_if_present(&backup).await?;
            return self.install(name, data).await;
        }

        let incoming = self.write_incoming(name, data).await?;

        if let Err(e) = fs::rename(&target, &backup).await {
            let _ = fs::remove_file(&incoming).await;
            return Err(Error::AssetCopyFailed(format!(
                "backing up {}: {}",
                name, e
            )));
        }

        if let Err(e) = fs::rename(&incoming, &target).await {
            if let Err(restore) = fs::rename(&backup, &target).await {
                warn!("Failed to restore backup for {}: {}", name, restore);
            }
            let _ = fs::remove_file(&incoming).await;
            return Err(Error::AssetCopyFailed(format!(
                "swapping {}: {}",
                name, e
            )));
        }

        debug!("Staged asset {} ({} bytes)", name, data.len());
        Ok(())
    }

    async fn commit_swap(&self, name: &str) -> Result<()> {
        validate_asset_name(name)?;
        remove_if_present(&self.backup_path(name)).await
    }

    async fn rollback_swap(&self, name: &str) -> Result<()> {
        let target = self.asset_path(name)?;
        let backup = self.backup_path(name);
        if !fs::try_exists(&backup).await? {
            return remove_if_present(&target).await;
        }
        fs::rename(&backup, &target).await.map_err(|e| {
            Error::AssetCopyFailed(format!("restoring {}: {}", name, e))
        })?;
        debug!("Restored previous payload of {}", name);
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        let path = self.asset_path(name)?;
        remove_if_present(&path).await
    }
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_install_and_read() {
        let temp = TempDir::new().unwrap();
        let store = LocalAssetStore::new(temp.path()).unwrap();

        store.install("take.m4a", b"audio").await.unwrap();
        assert!(store.exists("take.m4a").await.unwrap());
        assert_eq!(store.read("take.m4a").await.unwrap(), b"audio");
    }

    #[tokio::test]
    async fn test_read_missing() {
        let temp = TempDir::new().unwrap();
        let store = LocalAssetStore::new(temp.path()).unwrap();
        assert!(matches!(
            store.read("missing").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_swap_replaces_and_cleans_up() {
        let temp = TempDir::new().unwrap();
        let store = LocalAssetStore::new(temp.path()).unwrap();

        store.install("take.m4a", b"old").await.unwrap();
        store.swap("take.m4a", b"new").await.unwrap();

        assert_eq!(store.read("take.m4a").await.unwrap(), b"new");
        assert!(!store.backup_path("take.m4a").exists());
        assert!(!store.incoming_path("take.m4a").exists());
    }

    #[tokio::test]
    async fn test_failed_swap_preserves_existing_payload() {
        let temp = TempDir::new().unwrap();
        let store = LocalAssetStore::new(temp.path()).unwrap();
        store.install("take.m4a", b"old").await.unwrap();

        // A directory squatting on the temp path makes the incoming write fail.
        let blocker = store.incoming_path("take.m4a");
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("x"), b"x").unwrap();

        let err = store.swap("take.m4a", b"new").await.unwrap_err();
        assert!(matches!(err, Error::AssetCopyFailed(_)));
        assert_eq!(store.read("take.m4a").await.unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_rollback_restores_staged_over_payload() {
        let temp = TempDir::new().unwrap();
        let store = LocalAssetStore::new(temp.path()).unwrap();
        store.install("take.m4a", b"old").await.unwrap();

        store.stage_swap("take.m4a", b"new").await.unwrap();
        assert_eq!(store.read("take.m4a").await.unwrap(), b"new");
        assert!(store.backup_path("take.m4a").exists());

        store.rollback_swap("take.m4a").await.unwrap();
        assert_eq!(store.read("take.m4a").await.unwrap(), b"old");
        assert!(!store.backup_path("take.m4a").exists());
    }

    #[tokio::test]
    async fn test_commit_drops_previous_payload() {
        let temp = TempDir::new().unwrap();
        let store = LocalAssetStore::new(temp.path()).unwrap();
        store.install("take.m4a", b"old").await.unwrap();

        store.stage_swap("take.m4a", b"new").await.unwrap();
        store.commit_swap("take.m4a").await.unwrap();
        assert_eq!(store.read("take.m4a").await.unwrap(), b"new");
        assert!(!store.backup_path("take.m4a").exists());
    }

    #[tokio::test]
    async fn test_rollback_of_fresh_name_removes_it() {
        let temp = TempDir::new().unwrap();
        let store = LocalAssetStore::new(temp.path()).unwrap();
        // Leftover from an interrupted run.
        std::fs::write(store.backup_path("take.m4a"), b"ancient").unwrap();

        store.stage_swap("take.m4a", b"new").await.unwrap();
        store.rollback_swap("take.m4a").await.unwrap();
        assert!(!store.exists("take.m4a").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let store = LocalAssetStore::new(temp.path()).unwrap();
        store.install("take.m4a", b"x").await.unwrap();

        store.remove("take.m4a").await.unwrap();
        store.remove("take.m4a").await.unwrap();
        assert!(!store.exists("take.m4a").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_invalid_names() {
        let temp = TempDir::new().unwrap();
        let store = LocalAssetStore::new(temp.path()).unwrap();
        assert!(store.install("../escape", b"x").await.is_err());
    }
}
