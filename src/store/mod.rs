//! Object-store client.
//!
//! Defines the [`ObjectStore`] trait -- the fixed operation set the rest of
//! the server is allowed to use against a remote bucket (get, put, list,
//! delete, stat, pre-signed transfer URLs) -- plus the S3 implementation and
//! an in-memory implementation for tests and local development. The client
//! is stateless and shared across sessions as an `Arc<dyn ObjectStore>`.

pub mod memory;
pub mod s3;

use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

pub use memory::MemoryStore;
pub use s3::S3Store;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Metadata returned by [`ObjectStore::stat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectMeta {
    pub size: u64,
}

/// A pre-signed, time-limited transfer the client performs directly against
/// the store, bypassing this server for the payload bytes.
#[derive(Debug, Clone)]
pub struct SignedTransfer {
    pub url: String,
    /// Headers the client must send verbatim with the transfer.
    pub headers: Vec<(String, String)>,
    pub expires_in: u64,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// The subset of object-store operations needed to back a POSIX-like
/// namespace and the LFS transfer negotiation. Implementations must be
/// safe for concurrent use by any number of sessions.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the whole object at `key`.
    async fn get(&self, key: &str) -> Result<Bytes, StoreError>;

    /// Fetch `len` bytes of the object at `key`, starting at `offset`.
    async fn get_range(&self, key: &str, offset: u64, len: u64) -> Result<Bytes, StoreError>;

    /// Store `data` at `key`, replacing any existing object.
    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError>;

    /// Delete the object at `key`. Deleting a missing object is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// List all keys under `prefix`, in lexical order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Metadata for the object at `key`.
    async fn stat(&self, key: &str) -> Result<ObjectMeta, StoreError>;

    /// Pre-signed GET for a direct client download.
    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<SignedTransfer, StoreError>;

    /// Pre-signed PUT for a direct client upload.
    async fn presign_put(&self, key: &str, ttl: Duration) -> Result<SignedTransfer, StoreError>;

    /// Like [`stat`](Self::stat) but mapping not-found to `None`.
    async fn exists(&self, key: &str) -> Result<Option<ObjectMeta>, StoreError> {
        match self.stat(key).await {
            Ok(meta) => Ok(Some(meta)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }
}
