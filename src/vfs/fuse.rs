//! FUSE adapter for [`StoreFs`].
//!
//! Bridges the synchronous FUSE callback surface onto the async store-backed
//! filesystem with a captured runtime handle; callbacks run on the FUSE
//! session thread, never inside the tokio runtime. Inodes are handed out on
//! first sight of a path and kept for the lifetime of the mount. Open files
//! buffer writes per handle and push the whole content through
//! [`StoreFs::write`] on flush/release, which preserves the write-through
//! durability contract at the granularity git actually uses (write file,
//! close, rename).

#[cfg(target_os = "linux")]
mod imp {
    use std::collections::HashMap;
    use std::ffi::OsStr;
    use std::sync::Arc;
    use std::time::{Duration, UNIX_EPOCH};

    use fuser::{
        FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
        ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
    };
    use libc::{c_int, EIO, ENOENT};
    use tracing::{debug, warn};

    use crate::store::StoreError;
    use crate::vfs::fs::{NodeKind, NodeMeta, StoreFs};

    const TTL: Duration = Duration::from_secs(1);
    const BLOCK_SIZE: u32 = 4096;

    fn errno(err: &StoreError) -> c_int {
        if err.is_not_found() {
            ENOENT
        } else {
            EIO
        }
    }

    struct OpenFile {
        path: String,
        buffer: Vec<u8>,
        dirty: bool,
    }

    pub struct StoreFilesystem {
        fs: Arc<StoreFs>,
        runtime: tokio::runtime::Handle,
        inodes: HashMap<u64, String>,
        paths: HashMap<String, u64>,
        next_inode: u64,
        handles: HashMap<u64, OpenFile>,
        next_fh: u64,
        uid: u32,
        gid: u32,
    }

    impl StoreFilesystem {
        pub fn new(fs: Arc<StoreFs>, runtime: tokio::runtime::Handle) -> Self {
            let mut inodes = HashMap::new();
            let mut paths = HashMap::new();
            inodes.insert(1, String::new());
            paths.insert(String::new(), 1);

            // SAFETY: getuid/getgid cannot fail and have no preconditions.
            let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };

            Self {
                fs,
                runtime,
                inodes,
                paths,
                next_inode: 2,
                handles: HashMap::new(),
                next_fh: 1,
                uid,
                gid,
            }
        }

        fn inode_for(&mut self, path: &str) -> u64 {
            if let Some(ino) = self.paths.get(path) {
                return *ino;
            }
            let ino = self.next_inode;
            self.next_inode += 1;
            self.inodes.insert(ino, path.to_string());
            self.paths.insert(path.to_string(), ino);
            ino
        }

        fn path_of(&self, ino: u64) -> Option<String> {
            self.inodes.get(&ino).cloned()
        }

        fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
            let parent_path = self.path_of(parent)?;
            let name = name.to_str()?;
            Some(if parent_path.is_empty() {
                name.to_string()
            } else {
                format!("{parent_path}/{name}")
            })
        }

        fn attr(&self, ino: u64, meta: NodeMeta) -> FileAttr {
            let (kind, perm, nlink) = match meta.kind {
                NodeKind::Dir => (FileType::Directory, 0o755, 2),
                NodeKind::File => (FileType::RegularFile, 0o644, 1),
            };
            FileAttr {
                ino,
                size: meta.size,
                blocks: meta.size.div_ceil(u64::from(BLOCK_SIZE)),
                atime: UNIX_EPOCH,
                mtime: UNIX_EPOCH,
                ctime: UNIX_EPOCH,
                crtime: UNIX_EPOCH,
                kind,
                perm,
                nlink,
                uid: self.uid,
                gid: self.gid,
                rdev: 0,
                flags: 0,
                blksize: BLOCK_SIZE,
            }
        }

        fn stat(&self, path: &str) -> Result<NodeMeta, StoreError> {
            self.runtime.block_on(self.fs.stat(path))
        }

        /// Write an open handle's buffer through to the store.
        fn flush_handle(&mut self, fh: u64) -> Result<(), c_int> {
            let (path, buffer) = match self.handles.get(&fh) {
                Some(handle) if handle.dirty => (handle.path.clone(), handle.buffer.clone()),
                _ => return Ok(()),
            };

            match self
                .runtime
                .block_on(self.fs.write(&path, bytes::Bytes::from(buffer)))
            {
                Ok(()) => {
                    if let Some(handle) = self.handles.get_mut(&fh) {
                        handle.dirty = false;
                    }
                    Ok(())
                }
                Err(err) => {
                    warn!(%path, error = %err, "write-through failed");
                    Err(errno(&err))
                }
            }
        }
    }

    impl Filesystem for StoreFilesystem {
        fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
            let Some(path) = self.child_path(parent, name) else {
                reply.error(ENOENT);
                return;
            };
            match self.stat(&path) {
                Ok(meta) => {
                    let ino = self.inode_for(&path);
                    reply.entry(&TTL, &self.attr(ino, meta), 0);
                }
                Err(err) => reply.error(errno(&err)),
            }
        }

        fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
            let Some(path) = self.path_of(ino) else {
                reply.error(ENOENT);
                return;
            };
            match self.stat(&path) {
                Ok(meta) => reply.attr(&TTL, &self.attr(ino, meta)),
                Err(err) => reply.error(errno(&err)),
            }
        }

        #[allow(clippy::too_many_arguments)]
        fn setattr(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            _mode: Option<u32>,
            _uid: Option<u32>,
            _gid: Option<u32>,
            size: Option<u64>,
            _atime: Option<TimeOrNow>,
            _mtime: Option<TimeOrNow>,
            _ctime: Option<std::time::SystemTime>,
            fh: Option<u64>,
            _crtime: Option<std::time::SystemTime>,
            _chgtime: Option<std::time::SystemTime>,
            _bkuptime: Option<std::time::SystemTime>,
            _flags: Option<u32>,
            reply: ReplyAttr,
        ) {
            let Some(path) = self.path_of(ino) else {
                reply.error(ENOENT);
                return;
            };

            if let Some(new_size) = size {
                // Truncate through an open handle when there is one,
                // otherwise rewrite the stored object.
                let mut truncated_in_handle = false;
                if let Some(fh) = fh {
                    if let Some(handle) = self.handles.get_mut(&fh) {
                        handle.buffer.resize(new_size as usize, 0);
                        handle.dirty = true;
                        truncated_in_handle = true;
                    }
                }
                if !truncated_in_handle {
                    let fs = Arc::clone(&self.fs);
                    let target = path.clone();
                    let result = self.runtime.block_on(async move {
                        let mut content = match fs.read(&target).await {
                            Ok(content) => content.to_vec(),
                            Err(err) if err.is_not_found() => Vec::new(),
                            Err(err) => return Err(err),
                        };
                        content.resize(new_size as usize, 0);
                        fs.write(&target, bytes::Bytes::from(content)).await
                    });
                    if let Err(err) = result {
                        reply.error(errno(&err));
                        return;
                    }
                }
            }

            match self.stat(&path) {
                Ok(meta) => reply.attr(&TTL, &self.attr(ino, meta)),
                Err(err) => reply.error(errno(&err)),
            }
        }

        fn mkdir(
            &mut self,
            _req: &Request<'_>,
            parent: u64,
            name: &OsStr,
            _mode: u32,
            _umask: u32,
            reply: ReplyEntry,
        ) {
            let Some(path) = self.child_path(parent, name) else {
                reply.error(ENOENT);
                return;
            };
            match self.runtime.block_on(self.fs.make_dir(&path)) {
                Ok(()) => {
                    let ino = self.inode_for(&path);
                    let meta = NodeMeta {
                        kind: NodeKind::Dir,
                        size: 0,
                    };
                    reply.entry(&TTL, &self.attr(ino, meta), 0);
                }
                Err(err) => reply.error(errno(&err)),
            }
        }

        fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
            let Some(path) = self.child_path(parent, name) else {
                reply.error(ENOENT);
                return;
            };
            match self.runtime.block_on(self.fs.remove_file(&path)) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(errno(&err)),
            }
        }

        fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
            let Some(path) = self.child_path(parent, name) else {
                reply.error(ENOENT);
                return;
            };
            match self.runtime.block_on(self.fs.remove_dir(&path)) {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(errno(&err)),
            }
        }

        fn rename(
            &mut self,
            _req: &Request<'_>,
            parent: u64,
            name: &OsStr,
            newparent: u64,
            newname: &OsStr,
            _flags: u32,
            reply: ReplyEmpty,
        ) {
            let (Some(from), Some(to)) = (
                self.child_path(parent, name),
                self.child_path(newparent, newname),
            ) else {
                reply.error(ENOENT);
                return;
            };

            match self.runtime.block_on(self.fs.rename(&from, &to)) {
                Ok(()) => {
                    // Re-point path/inode bookkeeping at the new names.
                    let moved: Vec<(String, u64)> = self
                        .paths
                        .iter()
                        .filter(|(p, _)| {
                            *p == &from || p.starts_with(&format!("{from}/"))
                        })
                        .map(|(p, ino)| (p.clone(), *ino))
                        .collect();
                    for (old_path, ino) in moved {
                        let new_path = format!("{to}{}", &old_path[from.len()..]);
                        self.paths.remove(&old_path);
                        self.paths.insert(new_path.clone(), ino);
                        self.inodes.insert(ino, new_path);
                    }
                    reply.ok();
                }
                Err(err) => reply.error(errno(&err)),
            }
        }

        fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
            let Some(path) = self.path_of(ino) else {
                reply.error(ENOENT);
                return;
            };

            let truncate = flags & libc::O_TRUNC != 0;
            let buffer = if truncate {
                Vec::new()
            } else {
                match self.runtime.block_on(self.fs.read(&path)) {
                    Ok(content) => content.to_vec(),
                    Err(err) => {
                        reply.error(errno(&err));
                        return;
                    }
                }
            };

            let fh = self.next_fh;
            self.next_fh += 1;
            self.handles.insert(
                fh,
                OpenFile {
                    path,
                    buffer,
                    dirty: truncate,
                },
            );
            reply.opened(fh, 0);
        }

        fn create(
            &mut self,
            _req: &Request<'_>,
            parent: u64,
            name: &OsStr,
            _mode: u32,
            _umask: u32,
            _flags: i32,
            reply: ReplyCreate,
        ) {
            let Some(path) = self.child_path(parent, name) else {
                reply.error(ENOENT);
                return;
            };

            let ino = self.inode_for(&path);
            let fh = self.next_fh;
            self.next_fh += 1;
            self.handles.insert(
                fh,
                OpenFile {
                    path,
                    buffer: Vec::new(),
                    dirty: true,
                },
            );

            let meta = NodeMeta {
                kind: NodeKind::File,
                size: 0,
            };
            reply.created(&TTL, &self.attr(ino, meta), 0, fh, 0);
        }

        fn read(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            fh: u64,
            offset: i64,
            size: u32,
            _flags: i32,
            _lock_owner: Option<u64>,
            reply: ReplyData,
        ) {
            let offset = offset.max(0) as usize;
            let size = size as usize;

            if let Some(handle) = self.handles.get(&fh) {
                let data = &handle.buffer;
                if offset >= data.len() {
                    reply.data(&[]);
                } else {
                    let end = (offset + size).min(data.len());
                    reply.data(&data[offset..end]);
                }
                return;
            }

            let Some(path) = self.path_of(ino) else {
                reply.error(ENOENT);
                return;
            };
            match self.runtime.block_on(self.fs.read(&path)) {
                Ok(data) => {
                    if offset >= data.len() {
                        reply.data(&[]);
                    } else {
                        let end = (offset + size).min(data.len());
                        reply.data(&data[offset..end]);
                    }
                }
                Err(err) => reply.error(errno(&err)),
            }
        }

        #[allow(clippy::too_many_arguments)]
        fn write(
            &mut self,
            _req: &Request<'_>,
            _ino: u64,
            fh: u64,
            offset: i64,
            data: &[u8],
            _write_flags: u32,
            _flags: i32,
            _lock_owner: Option<u64>,
            reply: ReplyWrite,
        ) {
            let Some(handle) = self.handles.get_mut(&fh) else {
                reply.error(EIO);
                return;
            };

            let offset = offset.max(0) as usize;
            let end = offset + data.len();
            if handle.buffer.len() < end {
                handle.buffer.resize(end, 0);
            }
            handle.buffer[offset..end].copy_from_slice(data);
            handle.dirty = true;
            reply.written(data.len() as u32);
        }

        fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
            match self.flush_handle(fh) {
                Ok(()) => reply.ok(),
                Err(code) => reply.error(code),
            }
        }

        fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
            match self.flush_handle(fh) {
                Ok(()) => reply.ok(),
                Err(code) => reply.error(code),
            }
        }

        fn release(
            &mut self,
            _req: &Request<'_>,
            _ino: u64,
            fh: u64,
            _flags: i32,
            _lock_owner: Option<u64>,
            _flush: bool,
            reply: ReplyEmpty,
        ) {
            let result = self.flush_handle(fh);
            self.handles.remove(&fh);
            match result {
                Ok(()) => reply.ok(),
                Err(code) => reply.error(code),
            }
        }

        fn readdir(
            &mut self,
            _req: &Request<'_>,
            ino: u64,
            _fh: u64,
            offset: i64,
            mut reply: ReplyDirectory,
        ) {
            let Some(path) = self.path_of(ino) else {
                reply.error(ENOENT);
                return;
            };

            let entries = match self.runtime.block_on(self.fs.list_dir(&path)) {
                Ok(entries) => entries,
                Err(err) => {
                    reply.error(errno(&err));
                    return;
                }
            };

            let mut all: Vec<(u64, FileType, String)> = Vec::with_capacity(entries.len() + 2);
            all.push((ino, FileType::Directory, ".".to_string()));
            all.push((1, FileType::Directory, "..".to_string()));
            for entry in entries {
                let child = if path.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{path}/{}", entry.name)
                };
                let child_ino = self.inode_for(&child);
                let kind = match entry.kind {
                    NodeKind::Dir => FileType::Directory,
                    NodeKind::File => FileType::RegularFile,
                };
                all.push((child_ino, kind, entry.name));
            }

            for (i, (entry_ino, kind, name)) in
                all.into_iter().enumerate().skip(offset.max(0) as usize)
            {
                if reply.add(entry_ino, (i + 1) as i64, kind, &name) {
                    break;
                }
            }
            debug!(%path, "readdir served");
            reply.ok();
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use std::sync::Arc;

    use crate::vfs::fs::StoreFs;

    /// Placeholder for platforms without FUSE support; the mount manager
    /// refuses to mount there before this type is ever exercised.
    pub struct StoreFilesystem;

    impl StoreFilesystem {
        pub fn new(_fs: Arc<StoreFs>, _runtime: tokio::runtime::Handle) -> Self {
            Self
        }
    }
}

pub use imp::StoreFilesystem;
