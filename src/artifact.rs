// Artifact Storage Backends - local file system and in-memory stores

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::ErrorKind;

/// Errors raised by artifact stores
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Artifact not found: {0}")]
    NotFound(String),

    /// Backend temporarily unreachable; eligible for retry
    #[error("Artifact store unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Invalid artifact key: {0}")]
    InvalidKey(String),
}

impl StoreError {
    /// Machine-checkable kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NotFound(_) => ErrorKind::ArtifactMissing,
            StoreError::Unavailable(_) | StoreError::Io(_) => ErrorKind::StoreUnavailable,
            StoreError::InvalidKey(_) => ErrorKind::Internal,
        }
    }

    /// Whether a retry may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Io(_))
    }
}

/// Name of the artifact written by a backup run
pub fn artifact_name(policy_id: &str, run_id: &str) -> String {
    format!("{}_{}.backup", policy_id, run_id)
}

/// Uniform get/put/delete/exists contract over opaque artifact keys
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Persist bytes under `key`, returning the artifact reference
    async fn put(&self, key: &str, data: Bytes) -> Result<String, StoreError>;

    /// Fetch the bytes stored under `key`
    async fn get(&self, key: &str) -> Result<Bytes, StoreError>;

    /// Delete `key`; returns whether anything was removed
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Whether `key` exists
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
}

/// Stores artifacts as files under a root directory
pub struct FileArtifactStore {
    root: PathBuf,
}

impl FileArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory of this store
    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn ensure_directory_exists(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)
            .await
            .map_err(|e| StoreError::Io(format!("Failed to create artifact directory: {}", e)))
    }

    fn artifact_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        // Keys are flat file names; reject anything that could escape the root.
        if key.is_empty()
            || key.contains('/')
            || key.contains('\\')
            || key == "."
            || key == ".."
        {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ArtifactStore for FileArtifactStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<String, StoreError> {
        self.ensure_directory_exists().await?;

        let path = self.artifact_path(key)?;
        let temp_path = self.root.join(format!(".{}.tmp", key));

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StoreError::Io(format!("Failed to create artifact file: {}", e)))?;
        file.write_all(&data)
            .await
            .map_err(|e| StoreError::Io(format!("Failed to write artifact data: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| StoreError::Io(format!("Failed to sync artifact data: {}", e)))?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::Io(format!("Failed to rename artifact file: {}", e)));
        }

        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let path = self.artifact_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(StoreError::Io(format!("Failed to read artifact: {}", e))),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.artifact_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::Io(format!("Failed to delete artifact: {}", e))),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.artifact_path(key)?;
        fs::try_exists(&path)
            .await
            .map_err(|e| StoreError::Io(format!("Failed to stat artifact: {}", e)))
    }
}

/// In-memory artifact store
#[derive(Clone, Default)]
pub struct MemoryArtifactStore {
    artifacts: Arc<DashMap<String, Bytes>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite stored bytes without going through `put`
    pub fn tamper(&self, key: &str, f: impl FnOnce(&mut Vec<u8>)) -> bool {
        match self.artifacts.get_mut(key) {
            Some(mut entry) => {
                let mut data = entry.value().to_vec();
                f(&mut data);
                *entry.value_mut() = Bytes::from(data);
                true
            }
            None => false,
        }
    }

    /// Number of stored artifacts
    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    /// Stored keys, sorted
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.artifacts.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<String, StoreError> {
        self.artifacts.insert(key.to_string(), data);
        Ok(key.to_string())
    }

    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        self.artifacts
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.artifacts.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.artifacts.contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_artifact_name() {
        assert_eq!(artifact_name("nightly", "r-1"), "nightly_r-1.backup");
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileArtifactStore::new(dir.path().join("artifacts"));

        let key = artifact_name("p", "1");
        let reference = store.put(&key, Bytes::from_static(b"payload")).await.unwrap();
        assert_eq!(reference, key);
        assert!(store.exists(&key).await.unwrap());
        assert_eq!(store.get(&key).await.unwrap(), Bytes::from_static(b"payload"));

        // No temp file left behind
        let leftovers: Vec<_> = std::fs::read_dir(store.root())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        assert!(store.delete(&key).await.unwrap());
        assert!(!store.delete(&key).await.unwrap());
        assert!(!store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_file_store_missing_artifact() {
        let dir = TempDir::new().unwrap();
        let store = FileArtifactStore::new(dir.path());
        assert!(matches!(
            store.get("absent.backup").await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_file_store_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let store = FileArtifactStore::new(dir.path());
        assert!(matches!(
            store.put("../escape", Bytes::new()).await,
            Err(StoreError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_store_tamper() {
        let store = MemoryArtifactStore::new();
        store.put("k", Bytes::from_static(b"abc")).await.unwrap();
        assert!(store.tamper("k", |data| data[0] = b'z'));
        assert_eq!(store.get("k").await.unwrap(), Bytes::from_static(b"zbc"));
        assert!(!store.tamper("missing", |_| {}));
    }
}
