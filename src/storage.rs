//! Storage backends the tracker reads from and writes to.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Result of a stat call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub mtime: DateTime<Utc>,
    pub len: u64,
}

/// Async file access used during reconciliation.
#[async_trait]
pub trait FileStorage: Send + Sync {
    async fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    async fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;

    /// `Ok(None)` when the file does not exist.
    async fn stat(&self, path: &Path) -> io::Result<Option<FileStat>>;
}

/// The local filesystem, through `tokio::fs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFileStorage;

#[async_trait]
impl FileStorage for LocalFileStorage {
    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }

    async fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        tokio::fs::write(path, bytes).await
    }

    async fn stat(&self, path: &Path) -> io::Result<Option<FileStat>> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(Some(FileStat {
                mtime: DateTime::<Utc>::from(meta.modified()?),
                len: meta.len(),
            })),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Clone)]
struct MemoryFile {
    bytes: Vec<u8>,
    mtime: DateTime<Utc>,
}

/// In-process storage, e.g. for a browser-storage backend or tests.
///
/// Clones share the same files.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    files: Arc<RwLock<HashMap<PathBuf, MemoryFile>>>,
    failing: Arc<RwLock<HashMap<PathBuf, io::ErrorKind>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write as some other program would. Same as [`FileStorage::write`],
    /// named for readability at call sites.
    pub async fn write_external(&self, path: impl AsRef<Path>, bytes: impl AsRef<[u8]>) {
        self.put(path.as_ref(), bytes.as_ref(), Utc::now()).await;
    }

    /// Write with an explicit mtime.
    pub async fn put(&self, path: &Path, bytes: &[u8], mtime: DateTime<Utc>) {
        self.files.write().await.insert(
            path.to_path_buf(),
            MemoryFile {
                bytes: bytes.to_vec(),
                mtime,
            },
        );
    }

    pub async fn remove(&self, path: impl AsRef<Path>) -> bool {
        self.files.write().await.remove(path.as_ref()).is_some()
    }

    pub async fn contents(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.files
            .read()
            .await
            .get(path.as_ref())
            .map(|f| f.bytes.clone())
    }

    /// Make every operation on `path` fail with `kind` until cleared.
    pub async fn fail_with(&self, path: impl AsRef<Path>, kind: Option<io::ErrorKind>) {
        let mut failing = self.failing.write().await;
        match kind {
            Some(kind) => failing.insert(path.as_ref().to_path_buf(), kind),
            None => failing.remove(path.as_ref()),
        };
    }

    async fn check_failure(&self, path: &Path) -> io::Result<()> {
        match self.failing.read().await.get(path) {
            Some(kind) => Err(io::Error::new(*kind, "injected failure")),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl FileStorage for MemoryStorage {
    async fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.check_failure(path).await?;
        self.contents(path)
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such file"))
    }

    async fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        self.check_failure(path).await?;
        self.put(path, bytes, Utc::now()).await;
        Ok(())
    }

    async fn stat(&self, path: &Path) -> io::Result<Option<FileStat>> {
        self.check_failure(path).await?;
        Ok(self.files.read().await.get(path).map(|f| FileStat {
            mtime: f.mtime,
            len: f.bytes.len() as u64,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        let storage = LocalFileStorage;

        assert!(storage.stat(&path).await.unwrap().is_none());
        storage.write(&path, b"hello").await.unwrap();
        assert_eq!(storage.read(&path).await.unwrap(), b"hello");
        assert_eq!(storage.stat(&path).await.unwrap().unwrap().len, 5);
    }

    #[tokio::test]
    async fn test_memory_storage_failures() {
        let storage = MemoryStorage::new();
        let path = Path::new("a.txt");
        storage.write_external(path, "x").await;

        storage
            .fail_with(path, Some(io::ErrorKind::PermissionDenied))
            .await;
        let err = storage.read(path).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);

        storage.fail_with(path, None).await;
        assert_eq!(storage.read(path).await.unwrap(), b"x");
        assert!(storage.remove(path).await);
        assert!(storage.stat(path).await.unwrap().is_none());
    }
}
