//! Storage collaborator
//!
//! The engine decides what bytes are produced and under which key; a
//! [`Storage`] implementation decides where they live. Keys are
//! deterministic (`<session_id>/<index>.png`, `<session_id>/metadata.json`)
//! and implementations must be idempotent per key.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Upload of {key} failed: {reason}")]
    Upload { key: String, reason: String },
}

/// Downstream artifact store
#[async_trait]
pub trait Storage: Send + Sync {
    /// Store `bytes` under `key`, returning its URI
    async fn upload(&self, bytes: Vec<u8>, key: &str) -> Result<String, StorageError>;

    /// Store a JSON document under `key`, returning its URI
    async fn upload_metadata(
        &self,
        document: &serde_json::Value,
        key: &str,
    ) -> Result<String, StorageError>;
}

/// Writes objects below a root directory
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
    base_uri: String,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>, base_uri: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            base_uri: base_uri.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path for `key`; absolute keys and `..` are rejected
    pub fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    async fn write(&self, bytes: &[u8], key: &str) -> Result<String, StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        debug!(key, bytes = bytes.len(), "Stored object");
        Ok(format!("{}/{}", self.base_uri, key))
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn upload(&self, bytes: Vec<u8>, key: &str) -> Result<String, StorageError> {
        self.write(&bytes, key).await
    }

    async fn upload_metadata(
        &self,
        document: &serde_json::Value,
        key: &str,
    ) -> Result<String, StorageError> {
        let bytes = serde_json::to_vec_pretty(document)?;
        self.write(&bytes, key).await
    }
}

/// In-process object map, URIs of the form `mem://<key>`
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.read().await.get(key).cloned()
    }

    /// Stored keys, sorted
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn upload(&self, bytes: Vec<u8>, key: &str) -> Result<String, StorageError> {
        self.objects.write().await.insert(key.to_string(), bytes);
        Ok(format!("mem://{}", key))
    }

    async fn upload_metadata(
        &self,
        document: &serde_json::Value,
        key: &str,
    ) -> Result<String, StorageError> {
        let bytes = serde_json::to_vec(document)?;
        self.upload(bytes, key).await
    }
}
