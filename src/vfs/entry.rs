//! Mount-entry table.
//!
//! One entry per virtual path, carrying cached content and an explicit
//! freshness state instead of loose boolean flags:
//!
//! - `Clean`  -- cached content matches the store; evictable.
//! - `Dirty`  -- cached content not yet confirmed flushed; never evicted.
//! - `Absent` -- the path is known not to exist (negative cache); the git
//!   binary probes many nonexistent paths, so this saves store round-trips.
//!
//! Eviction is size-triggered: when cached bytes exceed the configured
//! ceiling, least-recently-used `Clean`/`Absent` entries are dropped until
//! the table fits. Dirty entries survive eviction unconditionally --
//! durability is the flush path's job, not the cache's.

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;
use tracing::debug;

// ---------------------------------------------------------------------------
// Entry state machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Clean,
    Dirty,
    Absent,
}

#[derive(Debug, Clone)]
struct MountEntry {
    state: EntryState,
    content: Bytes,
    last_access: u64,
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

pub struct EntryTable {
    max_bytes: u64,
    inner: RwLock<TableInner>,
}

#[derive(Default)]
struct TableInner {
    entries: HashMap<String, MountEntry>,
    cached_bytes: u64,
    clock: u64,
}

impl EntryTable {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            inner: RwLock::new(TableInner::default()),
        }
    }

    /// Look up a path, bumping its access time.
    pub fn lookup(&self, path: &str) -> Option<(EntryState, Bytes)> {
        let mut inner = self.inner.write().expect("entry table lock poisoned");
        inner.clock += 1;
        let clock = inner.clock;
        let entry = inner.entries.get_mut(path)?;
        entry.last_access = clock;
        Some((entry.state, entry.content.clone()))
    }

    /// Record content fetched from the store.
    pub fn note_clean(&self, path: &str, content: Bytes) {
        self.record(path, EntryState::Clean, content);
    }

    /// Record locally written content awaiting (or mid-) flush.
    pub fn note_dirty(&self, path: &str, content: Bytes) {
        self.record(path, EntryState::Dirty, content);
    }

    /// Record a confirmed-missing path.
    pub fn note_absent(&self, path: &str) {
        self.record(path, EntryState::Absent, Bytes::new());
    }

    /// Transition a dirty entry to clean after a successful flush.
    pub fn mark_flushed(&self, path: &str) {
        let mut inner = self.inner.write().expect("entry table lock poisoned");
        if let Some(entry) = inner.entries.get_mut(path) {
            if entry.state == EntryState::Dirty {
                entry.state = EntryState::Clean;
            }
        }
    }

    /// Drop whatever is cached for a path.
    pub fn forget(&self, path: &str) {
        let mut inner = self.inner.write().expect("entry table lock poisoned");
        if let Some(entry) = inner.entries.remove(path) {
            inner.cached_bytes -= entry.content.len() as u64;
        }
    }

    /// Snapshot of all dirty entries, for flushing.
    pub fn dirty_entries(&self) -> Vec<(String, Bytes)> {
        let inner = self.inner.read().expect("entry table lock poisoned");
        inner
            .entries
            .iter()
            .filter(|(_, e)| e.state == EntryState::Dirty)
            .map(|(path, e)| (path.clone(), e.content.clone()))
            .collect()
    }

    pub fn cached_bytes(&self) -> u64 {
        self.inner
            .read()
            .expect("entry table lock poisoned")
            .cached_bytes
    }

    fn record(&self, path: &str, state: EntryState, content: Bytes) {
        let mut inner = self.inner.write().expect("entry table lock poisoned");
        inner.clock += 1;
        let clock = inner.clock;

        if let Some(old) = inner.entries.remove(path) {
            inner.cached_bytes -= old.content.len() as u64;
        }
        inner.cached_bytes += content.len() as u64;
        inner.entries.insert(
            path.to_string(),
            MountEntry {
                state,
                content,
                last_access: clock,
            },
        );

        self.evict_locked(&mut inner);
    }

    /// Evict least-recently-used clean entries until the table fits the
    /// byte budget. Dirty entries are skipped: their content is the only
    /// copy until the flush is confirmed.
    fn evict_locked(&self, inner: &mut TableInner) {
        while inner.cached_bytes > self.max_bytes {
            let victim = inner
                .entries
                .iter()
                .filter(|(_, e)| e.state != EntryState::Dirty)
                .min_by_key(|(_, e)| e.last_access)
                .map(|(path, _)| path.clone());

            match victim {
                Some(path) => {
                    if let Some(entry) = inner.entries.remove(&path) {
                        inner.cached_bytes -= entry.content.len() as u64;
                        debug!(%path, "evicted cache entry");
                    }
                }
                // Everything left is dirty; the budget is soft in that case.
                None => break,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_is_visible_to_following_read() {
        let table = EntryTable::new(1024);
        table.note_dirty("repo/HEAD", Bytes::from_static(b"ref: refs/heads/main\n"));

        let (state, content) = table.lookup("repo/HEAD").unwrap();
        assert_eq!(state, EntryState::Dirty);
        assert_eq!(content.as_ref(), b"ref: refs/heads/main\n");
    }

    #[test]
    fn flush_transitions_dirty_to_clean() {
        let table = EntryTable::new(1024);
        table.note_dirty("a", Bytes::from_static(b"x"));
        table.mark_flushed("a");

        let (state, _) = table.lookup("a").unwrap();
        assert_eq!(state, EntryState::Clean);
        assert!(table.dirty_entries().is_empty());
    }

    #[test]
    fn absent_entries_are_replaced_by_writes() {
        let table = EntryTable::new(1024);
        table.note_absent("ghost");
        assert_eq!(table.lookup("ghost").unwrap().0, EntryState::Absent);

        table.note_dirty("ghost", Bytes::from_static(b"now real"));
        let (state, content) = table.lookup("ghost").unwrap();
        assert_eq!(state, EntryState::Dirty);
        assert_eq!(content.as_ref(), b"now real");
    }

    #[test]
    fn eviction_prefers_oldest_clean_entry() {
        let table = EntryTable::new(10);
        table.note_clean("old", Bytes::from_static(b"aaaa"));
        table.note_clean("new", Bytes::from_static(b"bbbb"));
        // Touch "old" so "new" becomes the LRU victim.
        table.lookup("old");

        table.note_clean("third", Bytes::from_static(b"cccc"));

        assert!(table.lookup("new").is_none());
        assert!(table.lookup("old").is_some());
        assert!(table.lookup("third").is_some());
        assert!(table.cached_bytes() <= 10);
    }

    #[test]
    fn dirty_entries_survive_eviction() {
        let table = EntryTable::new(4);
        table.note_dirty("pending", Bytes::from_static(b"must-not-drop"));
        table.note_clean("filler", Bytes::from_static(b"zzzzzzzz"));

        // The clean filler goes; the dirty entry stays even over budget.
        assert!(table.lookup("pending").is_some());
        assert_eq!(table.dirty_entries().len(), 1);
        assert!(table.lookup("filler").is_none());
    }
}
