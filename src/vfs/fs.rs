//! Store-backed filesystem operations.
//!
//! [`StoreFs`] translates POSIX-ish operations on virtual paths (relative
//! to the mounted subtree) into object-store calls, with the entry table
//! in front of reads and write-through behind writes. The FUSE adapter is
//! a thin shim over this type, which keeps the semantics testable without
//! a kernel mount.
//!
//! Directories are represented as zero-byte marker keys with a trailing
//! `/`, so empty directories created by `git init` survive round-trips
//! through prefix listing.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, instrument};

use crate::store::{ObjectStore, StoreError};
use crate::vfs::entry::{EntryState, EntryTable};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeMeta {
    pub kind: NodeKind,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: NodeKind,
}

// ---------------------------------------------------------------------------
// StoreFs
// ---------------------------------------------------------------------------

pub struct StoreFs {
    store: Arc<dyn ObjectStore>,
    /// Key prefix of the mounted subtree (always `/`-terminated).
    prefix: String,
    table: EntryTable,
}

impl StoreFs {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: String, max_cache_bytes: u64) -> Self {
        debug_assert!(prefix.ends_with('/'));
        Self {
            store,
            prefix,
            table: EntryTable::new(max_cache_bytes),
        }
    }

    fn key(&self, path: &str) -> String {
        format!("{}{}", self.prefix, path)
    }

    fn dir_key(&self, path: &str) -> String {
        if path.is_empty() {
            self.prefix.clone()
        } else {
            format!("{}{}/", self.prefix, path)
        }
    }

    fn virtual_path<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(&self.prefix).unwrap_or(key)
    }

    // -----------------------------------------------------------------------
    // Files
    // -----------------------------------------------------------------------

    /// Read the full content of a file, serving from cache when possible.
    #[instrument(skip(self), fields(%path))]
    pub async fn read(&self, path: &str) -> Result<Bytes, StoreError> {
        if let Some((state, content)) = self.table.lookup(path) {
            return match state {
                EntryState::Absent => Err(StoreError::NotFound(path.to_string())),
                _ => Ok(content),
            };
        }

        match self.store.get(&self.key(path)).await {
            Ok(content) => {
                self.table.note_clean(path, content.clone());
                Ok(content)
            }
            Err(err) if err.is_not_found() => {
                self.table.note_absent(path);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Write-through: the entry turns dirty, the store put happens before
    /// this returns, and only a confirmed put marks the entry clean. On
    /// failure the entry stays dirty for [`flush_all`](Self::flush_all) to
    /// retry -- dirty content is never dropped silently.
    #[instrument(skip(self, content), fields(%path, bytes = content.len()))]
    pub async fn write(&self, path: &str, content: Bytes) -> Result<(), StoreError> {
        self.table.note_dirty(path, content.clone());
        self.store.put(&self.key(path), content).await?;
        self.table.mark_flushed(path);
        Ok(())
    }

    #[instrument(skip(self), fields(%path))]
    pub async fn remove_file(&self, path: &str) -> Result<(), StoreError> {
        self.store.delete(&self.key(path)).await?;
        self.table.forget(path);
        self.table.note_absent(path);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Directories
    // -----------------------------------------------------------------------

    #[instrument(skip(self), fields(%path))]
    pub async fn make_dir(&self, path: &str) -> Result<(), StoreError> {
        self.store.put(&self.dir_key(path), Bytes::new()).await?;
        self.table.forget(path);
        Ok(())
    }

    /// Remove an empty directory. A directory with children is refused.
    #[instrument(skip(self), fields(%path))]
    pub async fn remove_dir(&self, path: &str) -> Result<(), StoreError> {
        let dir_key = self.dir_key(path);
        let keys = self.store.list(&dir_key).await?;
        if keys.iter().any(|k| k != &dir_key) {
            return Err(StoreError::Backend(format!("directory not empty: {path}")));
        }
        self.store.delete(&dir_key).await
    }

    /// List the immediate children of a directory, lexically ordered.
    /// Repeated listings within a session observe the same ordering.
    #[instrument(skip(self), fields(%path))]
    pub async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, StoreError> {
        let dir_key = self.dir_key(path);
        let keys = self.store.list(&dir_key).await?;

        let mut children: BTreeMap<String, NodeKind> = BTreeMap::new();
        for key in &keys {
            let rel = &key[dir_key.len()..];
            if rel.is_empty() {
                continue; // the directory's own marker
            }
            match rel.split_once('/') {
                Some((name, _)) => {
                    children.insert(name.to_string(), NodeKind::Dir);
                }
                None => {
                    children
                        .entry(rel.to_string())
                        .or_insert(NodeKind::File);
                }
            }
        }

        Ok(children
            .into_iter()
            .map(|(name, kind)| DirEntry { name, kind })
            .collect())
    }

    // -----------------------------------------------------------------------
    // Metadata
    // -----------------------------------------------------------------------

    #[instrument(skip(self), fields(%path))]
    pub async fn stat(&self, path: &str) -> Result<NodeMeta, StoreError> {
        if path.is_empty() {
            return Ok(NodeMeta {
                kind: NodeKind::Dir,
                size: 0,
            });
        }

        if let Some((state, content)) = self.table.lookup(path) {
            return match state {
                EntryState::Absent => Err(StoreError::NotFound(path.to_string())),
                _ => Ok(NodeMeta {
                    kind: NodeKind::File,
                    size: content.len() as u64,
                }),
            };
        }

        match self.store.stat(&self.key(path)).await {
            Ok(meta) => {
                return Ok(NodeMeta {
                    kind: NodeKind::File,
                    size: meta.size,
                })
            }
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        // Not a file: a directory exists if its marker or any child does.
        let dir_key = self.dir_key(path);
        if self.store.exists(&dir_key).await?.is_some()
            || !self.store.list(&dir_key).await?.is_empty()
        {
            return Ok(NodeMeta {
                kind: NodeKind::Dir,
                size: 0,
            });
        }

        self.table.note_absent(path);
        Err(StoreError::NotFound(path.to_string()))
    }

    // -----------------------------------------------------------------------
    // Rename
    // -----------------------------------------------------------------------

    /// Rename a file or a whole directory subtree.
    #[instrument(skip(self), fields(%from, %to))]
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), StoreError> {
        match self.read(from).await {
            Ok(content) => {
                self.write(to, content).await?;
                self.remove_file(from).await
            }
            Err(err) if err.is_not_found() => self.rename_dir(from, to).await,
            Err(err) => Err(err),
        }
    }

    async fn rename_dir(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let from_prefix = self.dir_key(from);
        let to_prefix = self.dir_key(to);

        let keys = self.store.list(&from_prefix).await?;
        if keys.is_empty() {
            return Err(StoreError::NotFound(from.to_string()));
        }

        // The marker key equals the prefix, so it moves with the loop.
        for key in keys {
            let suffix = key[from_prefix.len()..].to_string();
            let data = self.store.get(&key).await?;
            self.store.put(&format!("{to_prefix}{suffix}"), data).await?;
            self.store.delete(&key).await?;

            let old_virtual = self.virtual_path(&key).to_string();
            self.table.forget(&old_virtual);
        }

        self.table.forget(from);
        self.table.forget(to);
        debug!("directory renamed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Flush
    // -----------------------------------------------------------------------

    /// Re-flush every dirty entry. Called at unmount and after failed
    /// write-throughs; an entry only leaves the dirty set once its put
    /// succeeds.
    #[instrument(skip(self))]
    pub async fn flush_all(&self) -> Result<(), StoreError> {
        let mut first_error = None;

        for (path, content) in self.table.dirty_entries() {
            match self.store.put(&self.key(&path), content).await {
                Ok(()) => self.table.mark_flushed(&path),
                Err(err) => {
                    tracing::warn!(%path, error = %err, "flush failed; entry stays dirty");
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }

        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    pub fn cached_bytes(&self) -> u64 {
        self.table.cached_bytes()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, ObjectMeta, SignedTransfer};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn store_fs() -> (Arc<MemoryStore>, StoreFs) {
        let store = Arc::new(MemoryStore::new());
        let fs = StoreFs::new(store.clone(), "repositories/".to_string(), 1024 * 1024);
        (store, fs)
    }

    #[tokio::test]
    async fn write_is_visible_to_immediate_read() {
        let (_store, fs) = store_fs();
        fs.write("acme/widget.git/HEAD", Bytes::from_static(b"ref: refs/heads/main\n"))
            .await
            .unwrap();

        let content = fs.read("acme/widget.git/HEAD").await.unwrap();
        assert_eq!(content.as_ref(), b"ref: refs/heads/main\n");
    }

    #[tokio::test]
    async fn write_through_persists_before_returning() {
        let (store, fs) = store_fs();
        fs.write("r.git/config", Bytes::from_static(b"[core]\n"))
            .await
            .unwrap();

        let stored = store.get("repositories/r.git/config").await.unwrap();
        assert_eq!(stored.as_ref(), b"[core]\n");
    }

    #[tokio::test]
    async fn listing_is_sorted_and_stable() {
        let (_store, fs) = store_fs();
        fs.write("repo/zeta", Bytes::new()).await.unwrap();
        fs.write("repo/alpha", Bytes::new()).await.unwrap();
        fs.make_dir("repo/objects").await.unwrap();
        fs.write("repo/objects/pack-1", Bytes::new()).await.unwrap();

        let first = fs.list_dir("repo").await.unwrap();
        let second = fs.list_dir("repo").await.unwrap();
        assert_eq!(first, second);

        let names: Vec<&str> = first.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "objects", "zeta"]);
        assert_eq!(first[1].kind, NodeKind::Dir);
    }

    #[tokio::test]
    async fn empty_directory_survives_via_marker() {
        let (_store, fs) = store_fs();
        fs.make_dir("repo/refs").await.unwrap();

        let meta = fs.stat("repo/refs").await.unwrap();
        assert_eq!(meta.kind, NodeKind::Dir);

        let entries = fs.list_dir("repo").await.unwrap();
        assert_eq!(entries, vec![DirEntry { name: "refs".into(), kind: NodeKind::Dir }]);
    }

    #[tokio::test]
    async fn missing_path_is_not_found_and_negative_cached() {
        let (_store, fs) = store_fs();
        assert!(fs.read("nope").await.unwrap_err().is_not_found());
        // Second read is served from the negative cache.
        assert!(fs.read("nope").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn rename_moves_file_and_removes_source() {
        let (store, fs) = store_fs();
        fs.write("repo/tmp_pack", Bytes::from_static(b"PACK"))
            .await
            .unwrap();

        fs.rename("repo/tmp_pack", "repo/objects/pack/pack-abc.pack")
            .await
            .unwrap();

        assert!(fs.read("repo/tmp_pack").await.unwrap_err().is_not_found());
        assert_eq!(
            fs.read("repo/objects/pack/pack-abc.pack").await.unwrap().as_ref(),
            b"PACK"
        );
        assert!(store.get("repositories/repo/tmp_pack").await.is_err());
    }

    #[tokio::test]
    async fn rename_moves_directory_subtree() {
        let (store, fs) = store_fs();
        fs.make_dir("repo/incoming").await.unwrap();
        fs.write("repo/incoming/a", Bytes::from_static(b"1")).await.unwrap();
        fs.write("repo/incoming/sub/b", Bytes::from_static(b"2"))
            .await
            .unwrap();

        fs.rename("repo/incoming", "repo/landed").await.unwrap();

        assert_eq!(fs.read("repo/landed/a").await.unwrap().as_ref(), b"1");
        assert_eq!(fs.read("repo/landed/sub/b").await.unwrap().as_ref(), b"2");
        assert!(store
            .list("repositories/repo/incoming/")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn remove_dir_refuses_non_empty() {
        let (_store, fs) = store_fs();
        fs.make_dir("repo/refs").await.unwrap();
        fs.write("repo/refs/heads", Bytes::new()).await.unwrap();

        assert!(fs.remove_dir("repo/refs").await.is_err());
        fs.remove_file("repo/refs/heads").await.unwrap();
        fs.remove_dir("repo/refs").await.unwrap();
    }

    // -- flush retry ---------------------------------------------------------

    /// MemoryStore wrapper whose puts can be switched off, for exercising
    /// the failed-flush path.
    struct FlakyStore {
        inner: MemoryStore,
        fail_puts: AtomicBool,
    }

    #[async_trait::async_trait]
    impl crate::store::ObjectStore for FlakyStore {
        async fn get(&self, key: &str) -> Result<Bytes, StoreError> {
            self.inner.get(key).await
        }
        async fn get_range(&self, key: &str, offset: u64, len: u64) -> Result<Bytes, StoreError> {
            self.inner.get_range(key, offset, len).await
        }
        async fn put(&self, key: &str, data: Bytes) -> Result<(), StoreError> {
            if self.fail_puts.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("injected put failure".into()));
            }
            self.inner.put(key, data).await
        }
        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }
        async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
            self.inner.list(prefix).await
        }
        async fn stat(&self, key: &str) -> Result<ObjectMeta, StoreError> {
            self.inner.stat(key).await
        }
        async fn presign_get(&self, key: &str, ttl: Duration) -> Result<SignedTransfer, StoreError> {
            self.inner.presign_get(key, ttl).await
        }
        async fn presign_put(&self, key: &str, ttl: Duration) -> Result<SignedTransfer, StoreError> {
            self.inner.presign_put(key, ttl).await
        }
    }

    #[tokio::test]
    async fn failed_flush_is_surfaced_and_retried() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            fail_puts: AtomicBool::new(true),
        });
        let fs = StoreFs::new(store.clone(), "repositories/".to_string(), 1024);

        // Write-through fails but the content stays dirty and readable.
        assert!(fs.write("repo/HEAD", Bytes::from_static(b"ref\n")).await.is_err());
        assert_eq!(fs.read("repo/HEAD").await.unwrap().as_ref(), b"ref\n");

        // Store recovers; the retry flushes the pending entry.
        store.fail_puts.store(false, Ordering::SeqCst);
        fs.flush_all().await.unwrap();
        assert_eq!(
            store.inner.get("repositories/repo/HEAD").await.unwrap().as_ref(),
            b"ref\n"
        );
    }
}
