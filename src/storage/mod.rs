//! Blob storage for task inputs and results.
//!
//! The pipeline only needs put/get by key: the producer stages an input
//! image, the worker downloads it to a scratch directory and uploads the
//! processed result.
//!
//! # Usage
//!
//! ```rust,ignore
//! use imagepipe::storage::{FsObjectStore, ObjectStore};
//!
//! let store = FsObjectStore::new("/data");
//! store.put("input/1234_cat.png", &bytes).await?;
//! let data = store.get("input/1234_cat.png").await?;
//! ```

pub mod fs;

use std::path::Path;

use async_trait::async_trait;

pub use crate::error::StorageError;
pub use fs::FsObjectStore;

/// Key/value blob store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Reads the object at `key`.
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Writes `data` at `key`, replacing any existing object.
    async fn put(&self, key: &str, data: &[u8]) -> Result<(), StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;

    /// Downloads an object into a local file. Returns the number of bytes.
    async fn fetch_to(&self, key: &str, dest: &Path) -> Result<u64, StorageError> {
        let data = self.get(key).await?;
        tokio::fs::write(dest, &data).await?;
        Ok(data.len() as u64)
    }

    /// Uploads a local file.
    async fn store_from(&self, key: &str, src: &Path) -> Result<(), StorageError> {
        let data = tokio::fs::read(src).await?;
        self.put(key, &data).await
    }
}
