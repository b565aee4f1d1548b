//! Storage doubles: failure injection, slow uploads and a gated collection upload

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use layercast_engine::storage::{StorageError, Storage};
use layercast_engine::MemoryStorage;

/// Accepts `succeed_first` uploads, then refuses every upload
pub struct FailingStorage {
    inner: MemoryStorage,
    succeed_first: usize,
    attempts: AtomicUsize,
}

impl FailingStorage {
    pub fn new(succeed_first: usize) -> Self {
        Self {
            inner: MemoryStorage::new(),
            succeed_first,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &MemoryStorage {
        &self.inner
    }
}

#[async_trait]
impl Storage for FailingStorage {
    async fn upload(&self, bytes: Vec<u8>, key: &str) -> Result<String, StorageError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt >= self.succeed_first {
            return Err(StorageError::Upload {
                key: key.to_string(),
                reason: "bucket unavailable".to_string(),
            });
        }
        self.inner.upload(bytes, key).await
    }

    async fn upload_metadata(
        &self,
        document: &serde_json::Value,
        key: &str,
    ) -> Result<String, StorageError> {
        self.inner.upload_metadata(document, key).await
    }
}

/// Delays every upload and counts them
pub struct SlowStorage {
    inner: MemoryStorage,
    delay: Duration,
    uploads: Arc<AtomicUsize>,
}

impl SlowStorage {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MemoryStorage::new(),
            delay,
            uploads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &MemoryStorage {
        &self.inner
    }
}

#[async_trait]
impl Storage for SlowStorage {
    async fn upload(&self, bytes: Vec<u8>, key: &str) -> Result<String, StorageError> {
        tokio::time::sleep(self.delay).await;
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.inner.upload(bytes, key).await
    }

    async fn upload_metadata(
        &self,
        document: &serde_json::Value,
        key: &str,
    ) -> Result<String, StorageError> {
        tokio::time::sleep(self.delay).await;
        self.inner.upload_metadata(document, key).await
    }
}

/// Parks the collection document upload until `release` is called
pub struct GatedStorage {
    inner: MemoryStorage,
    reached: Notify,
    released: Notify,
}

impl GatedStorage {
    pub fn new() -> Self {
        Self {
            inner: MemoryStorage::new(),
            reached: Notify::new(),
            released: Notify::new(),
        }
    }

    /// Wait until a run is parked in `upload_metadata`
    pub async fn wait_reached(&self) {
        self.reached.notified().await;
    }

    pub fn release(&self) {
        self.released.notify_one();
    }

    pub fn inner(&self) -> &MemoryStorage {
        &self.inner
    }
}

#[async_trait]
impl Storage for GatedStorage {
    async fn upload(&self, bytes: Vec<u8>, key: &str) -> Result<String, StorageError> {
        self.inner.upload(bytes, key).await
    }

    async fn upload_metadata(
        &self,
        document: &serde_json::Value,
        key: &str,
    ) -> Result<String, StorageError> {
        self.reached.notify_one();
        self.released.notified().await;
        self.inner.upload_metadata(document, key).await
    }
}
