//! In-memory [`ObjectStore`] for tests and credential-free local runs.
//!
//! Keys live in a `BTreeMap` so listings come back in lexical order for
//! free. Pre-signed URLs are `memory://` placeholders that carry the key
//! and expiry; nothing dereferences them, but they let the batch handler
//! run end-to-end without a real bucket.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use bytes::Bytes;

use crate::store::{ObjectMeta, ObjectStore, SignedTransfer, StoreError};

#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
        let objects = self.objects.read().expect("store lock poisoned");
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn get_range(&self, key: &str, offset: u64, len: u64) -> Result<Bytes, StoreError> {
        let data = self.get(key).await?;
        let start = (offset as usize).min(data.len());
        let end = (start + len as usize).min(data.len());
        Ok(data.slice(start..end))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
        let mut objects = self.objects.write().expect("store lock poisoned");
        objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut objects = self.objects.write().expect("store lock poisoned");
        objects.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let objects = self.objects.read().expect("store lock poisoned");
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn stat(&self, key: &str) -> Result<ObjectMeta, StoreError> {
        let objects = self.objects.read().expect("store lock poisoned");
        objects
            .get(key)
            .map(|data| ObjectMeta {
                size: data.len() as u64,
            })
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn presign_get(&self, key: &str, ttl: Duration) -> Result<SignedTransfer, StoreError> {
        Ok(SignedTransfer {
            url: format!("memory://get/{key}?expires={}", ttl.as_secs()),
            headers: Vec::new(),
            expires_in: ttl.as_secs(),
        })
    }

    async fn presign_put(&self, key: &str, ttl: Duration) -> Result<SignedTransfer, StoreError> {
        Ok(SignedTransfer {
            url: format!("memory://put/{key}?expires={}", ttl.as_secs()),
            headers: Vec::new(),
            expires_in: ttl.as_secs(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store.get("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn put_then_stat_and_get() {
        let store = MemoryStore::new();
        store.put("a/b", Bytes::from_static(b"hello")).await.unwrap();

        let meta = store.stat("a/b").await.unwrap();
        assert_eq!(meta.size, 5);
        assert_eq!(store.get("a/b").await.unwrap().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn range_is_clamped_to_object_size() {
        let store = MemoryStore::new();
        store
            .put("k", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();

        assert_eq!(store.get_range("k", 2, 3).await.unwrap().as_ref(), b"234");
        assert_eq!(store.get_range("k", 8, 10).await.unwrap().as_ref(), b"89");
        assert!(store.get_range("k", 20, 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_is_prefix_scoped_and_sorted() {
        let store = MemoryStore::new();
        for key in ["repos/b", "repos/a", "lfs/x", "repos/a/nested"] {
            store.put(key, Bytes::new()).await.unwrap();
        }

        let keys = store.list("repos/").await.unwrap();
        assert_eq!(keys, vec!["repos/a", "repos/a/nested", "repos/b"]);
    }

    #[tokio::test]
    async fn delete_missing_is_noop() {
        let store = MemoryStore::new();
        store.delete("ghost").await.unwrap();
    }
}
