//! Abstract object-store sink.
//!
//! The optimization pipeline only needs `put`; the concrete client (S3,
//! GCS, …) lives outside the core. A filesystem implementation ships here
//! because it also backs the legacy download endpoint.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid blob key '{0}'")]
    InvalidKey(String),
}

#[async_trait]
pub trait BlobSink: Send + Sync {
    /// Store `bytes` under `key`, verbatim. The key doubles as the tail of
    /// the public download URL.
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<(), BlobError>;
}

/// Local-disk sink rooted at a storage directory.
pub struct FsBlobSink {
    root: PathBuf,
}

impl FsBlobSink {
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, BlobError> {
        let relative = Path::new(key);
        let traversal = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || traversal {
            return Err(BlobError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl BlobSink for FsBlobSink {
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<(), BlobError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &bytes).await?;
        debug!(key, content_type, size = bytes.len(), "blob stored");
        Ok(())
    }
}
