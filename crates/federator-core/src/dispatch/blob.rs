//! Side-channel storage for payloads too large to deliver inline

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes and return the key they can be fetched by
    async fn put(&self, bytes: Vec<u8>) -> Result<String>;

    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Read a blob and remove it. A failed removal is logged, not returned.
    async fn take(&self, key: &str) -> Result<Vec<u8>> {
        let bytes = self.get(key).await?;
        if let Err(e) = self.delete(key).await {
            warn!(key = %key, error = %e, "Failed to delete blob after read");
        }
        Ok(bytes)
    }
}

/// One file per blob under a directory
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    dir: PathBuf,
}

impl FsBlobStore {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.contains(['/', '\\']) || key.contains("..") {
            return Err(Error::BlobStore(format!("Invalid blob key: {}", key)));
        }
        Ok(self.dir.join(key))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<String> {
        let key = format!("{}.json", Uuid::new_v4());
        tokio::fs::write(self.path_for(&key)?, bytes).await?;
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .map_err(|e| Error::BlobStore(format!("Failed to read {}: {}", path.display(), e)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        tokio::fs::remove_file(self.path_for(key)?).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<String> {
        let key = Uuid::new_v4().to_string();
        self.blobs.write().await.insert(key.clone(), bytes);
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.blobs
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| Error::BlobStore(format!("No blob stored under {}", key)))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.blobs.write().await.remove(key);
        Ok(())
    }
}
