//! Storage access used by discovery and loading.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

/// Read-only view of the storage plugins live on.
#[async_trait]
pub trait PluginStorage: Send + Sync {
    /// Immediate subdirectories of `path`, sorted.
    async fn list_dirs(&self, path: &Path) -> std::io::Result<Vec<PathBuf>>;

    /// Read a UTF-8 file.
    async fn read_to_string(&self, path: &Path) -> std::io::Result<String>;

    /// Whether `path` exists.
    async fn exists(&self, path: &Path) -> bool;
}

/// [`PluginStorage`] over the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStorage;

#[async_trait]
impl PluginStorage for FsStorage {
    async fn list_dirs(&self, path: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut dirs = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    async fn read_to_string(&self, path: &Path) -> std::io::Result<String> {
        tokio::fs::read_to_string(path).await
    }

    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fs_storage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("b")).unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("file.txt"), "hi").unwrap();

        let storage = FsStorage;
        let dirs = storage.list_dirs(dir.path()).await.unwrap();
        assert_eq!(dirs, vec![dir.path().join("a"), dir.path().join("b")]);
        assert_eq!(storage.read_to_string(&dir.path().join("file.txt")).await.unwrap(), "hi");
        assert!(storage.exists(&dir.path().join("a")).await);
        assert!(!storage.exists(&dir.path().join("zzz")).await);
        assert!(storage.list_dirs(&dir.path().join("zzz")).await.is_err());
    }
}
