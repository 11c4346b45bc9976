//! Virtual mount layer.
//!
//! Presents the `<root>/repositories` subtree as a filesystem backed by the
//! object store, so the git binary operates on bucket-resident repositories
//! unmodified. Reads are cached in an entry table with an explicit
//! clean/dirty/absent state machine; writes go through to the store before
//! the syscall returns; directory listings come from prefix listing. The
//! mount lives for the server process and is torn down (flushing first) on
//! shutdown.

pub mod entry;
pub mod fs;
pub mod fuse;
pub mod mount;

pub use fs::StoreFs;
pub use mount::MountManager;
