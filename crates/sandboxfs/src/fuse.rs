// Copyright (c) Contributors to the sandboxfs project.
// SPDX-License-Identifier: Apache-2.0

//! Translation of kernel requests into node operations.

use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use fuser::consts::{FUSE_ASYNC_READ, FUSE_BIG_WRITES, FUSE_PARALLEL_DIROPS};
use fuser::{
    FileAttr,
    KernelConfig,
    MountOption,
    ReplyAttr,
    ReplyCreate,
    ReplyData,
    ReplyDirectory,
    ReplyEmpty,
    ReplyEntry,
    ReplyOpen,
    ReplyWrite,
    Request,
    TimeOrNow,
    FUSE_ROOT_ID,
};

use crate::mapping::Mapping;
use crate::nodes::{AttrChanges, Cache, DirEntry, IdGenerator, Node};
use crate::root::Root;
use crate::tree;
use crate::Result;

/// How long the kernel may cache the attributes and entries we reply with.
///
/// Kept short because mapped nodes reflect the underlying file at the time
/// of each request; a long TTL would just widen the staleness window.
const TTL: Duration = Duration::from_secs(1);

/// Options to configure the mounted file system.
#[derive(Debug, Clone)]
pub struct Config {
    /// The user that owns synthesized scaffold directories.
    pub uid: nix::unistd::Uid,
    /// The group that owns synthesized scaffold directories.
    pub gid: nix::unistd::Gid,
    /// Mount options to be used when setting up.
    pub mount_options: HashSet<MountOption>,
}

/// Extract the ok value from a result, or reply with an error to the kernel
macro_rules! unwrap {
    ($reply:ident, $op:expr) => {{
        match $op {
            Ok(r) => r,
            Err(err) => err!($reply, err),
        }
    }};
}

/// Reply with an error to the kernel and return
macro_rules! err {
    ($reply:ident, $err:expr) => {{
        let err = $err;
        let errno = match err.raw_os_error() {
            Some(errno) => errno,
            None => {
                tracing::error!("{err}");
                libc::EIO
            }
        };
        $reply.error(errno);
        return;
    }};
}

struct TableEntry {
    node: Arc<Node>,
    nlookup: u64,
}

enum Handle {
    File { file: std::fs::File },
    Dir { entries: Vec<DirEntry> },
}

/// Holds the live tree and the bookkeeping needed to serve kernel requests
/// against it: the identifier tables, the open handle table, and the node
/// cache that preserves file identity across rediscoveries.
pub struct Filesystem {
    root: Arc<Root>,
    ids: Arc<IdGenerator>,
    cache: Arc<Cache>,
    opts: Config,

    ttl: Duration,
    next_handle: AtomicU64,
    nodes: DashMap<u64, TableEntry>,
    handles: DashMap<u64, Handle>,
}

impl Filesystem {
    /// Creates a file system serving the tree described by `mappings`.
    pub fn new(mappings: &[Mapping], opts: Config) -> Result<Self> {
        let ids = Arc::new(IdGenerator::new(FUSE_ROOT_ID));
        let root_ino = ids.next();
        debug_assert_eq!(FUSE_ROOT_ID, root_ino, "the root must be node 1");

        let top = tree::build(mappings, &ids, opts.uid, opts.gid)?;
        Ok(Filesystem {
            root: Arc::new(Root::new(top)),
            ids,
            cache: Arc::new(Cache::default()),
            opts,
            ttl: TTL,
            // we do not allocate handle 0, so skip it
            next_handle: AtomicU64::new(1),
            nodes: DashMap::new(),
            handles: DashMap::new(),
        })
    }

    /// The root indirection holding the installed tree.
    pub fn root(&self) -> Arc<Root> {
        Arc::clone(&self.root)
    }

    /// Builds a replacement tree from `mappings` without touching the live
    /// one. Identifiers come from the same generator, so nodes of old and
    /// new trees never collide.
    pub fn build_tree(&self, mappings: &[Mapping]) -> Result<Arc<Node>> {
        tree::build(mappings, &self.ids, self.opts.uid, self.opts.gid)
    }

    fn find_node(&self, ino: u64) -> Option<Arc<Node>> {
        if ino == FUSE_ROOT_ID {
            return Some(self.root.current());
        }
        self.nodes.get(&ino).map(|entry| Arc::clone(&entry.node))
    }

    /// Records that the kernel has been told about `node` one more time.
    /// The entry stays alive until the matching forgets arrive.
    fn remember(&self, node: Arc<Node>) {
        match self.nodes.entry(node.ino()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                occupied.get_mut().nlookup += 1;
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(TableEntry { node, nlookup: 1 });
            }
        }
    }

    fn allocate_handle(&self, data: Handle) -> u64 {
        loop {
            let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
            if id == 0 {
                // the 'empty/zero' handle value is never allocated so that
                // the explicit lack of a handle remains detectable
                continue;
            }
            match self.handles.entry(id) {
                // continue until we find a vacant entry for this handle
                dashmap::mapref::entry::Entry::Occupied(_) => continue,
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    vacant.insert(data);
                    break id;
                }
            }
        }
    }

    /// Reports `attr` as the kernel expects for `ino`. Attributes served
    /// through the root come from the backing directory but must carry the
    /// root's own stable identifier.
    fn rewrite_root_attr(ino: u64, mut attr: FileAttr) -> FileAttr {
        if ino == FUSE_ROOT_ID {
            attr.ino = FUSE_ROOT_ID;
        }
        attr
    }
}

// these functions mirror the fuse operations and so we don't have much
// control over their shape
#[allow(clippy::too_many_arguments)]
impl Filesystem {
    async fn lookup(&self, parent: u64, name: OsString, reply: ReplyEntry) {
        let Some(dir) = self.find_node(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let (node, attr) = unwrap!(reply, dir.lookup(&name, &self.ids, &self.cache));
        tracing::trace!(parent, ?name, ino = node.ino(), "lookup");
        self.remember(node);
        reply.entry(&self.ttl, &attr, 0);
    }

    async fn forget(&self, ino: u64, nlookup: u64) {
        if ino == FUSE_ROOT_ID {
            return;
        }
        if let dashmap::mapref::entry::Entry::Occupied(mut occupied) = self.nodes.entry(ino) {
            let entry = occupied.get_mut();
            entry.nlookup = entry.nlookup.saturating_sub(nlookup);
            if entry.nlookup == 0 {
                occupied.remove();
            }
        }
    }

    async fn getattr(&self, ino: u64, reply: ReplyAttr) {
        let Some(node) = self.find_node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let attr = unwrap!(reply, node.getattr());
        reply.attr(&self.ttl, &Self::rewrite_root_attr(ino, attr));
    }

    async fn setattr(&self, ino: u64, changes: AttrChanges, reply: ReplyAttr) {
        let Some(node) = self.find_node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let attr = unwrap!(reply, node.setattr(&changes));
        reply.attr(&self.ttl, &Self::rewrite_root_attr(ino, attr));
    }

    async fn readlink(&self, ino: u64, reply: ReplyData) {
        let Some(node) = self.find_node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let target = unwrap!(reply, node.readlink());
        reply.data(target.as_os_str().as_bytes());
    }

    async fn mknod(&self, parent: u64, name: OsString, mode: u32, rdev: u32, reply: ReplyEntry) {
        let Some(dir) = self.find_node(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let (node, attr) = unwrap!(reply, dir.mknod(&name, mode, rdev, &self.ids, &self.cache));
        self.remember(node);
        reply.entry(&self.ttl, &attr, 0);
    }

    async fn mkdir(&self, parent: u64, name: OsString, mode: u32, reply: ReplyEntry) {
        let Some(dir) = self.find_node(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let (node, attr) = unwrap!(reply, dir.mkdir(&name, mode, &self.ids, &self.cache));
        self.remember(node);
        reply.entry(&self.ttl, &attr, 0);
    }

    async fn unlink(&self, parent: u64, name: OsString, reply: ReplyEmpty) {
        let Some(dir) = self.find_node(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        unwrap!(reply, dir.unlink(&name, &self.cache));
        reply.ok();
    }

    async fn rmdir(&self, parent: u64, name: OsString, reply: ReplyEmpty) {
        let Some(dir) = self.find_node(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        unwrap!(reply, dir.rmdir(&name, &self.cache));
        reply.ok();
    }

    async fn symlink(&self, parent: u64, name: OsString, target: PathBuf, reply: ReplyEntry) {
        let Some(dir) = self.find_node(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let (node, attr) = unwrap!(reply, dir.symlink(&name, &target, &self.ids, &self.cache));
        self.remember(node);
        reply.entry(&self.ttl, &attr, 0);
    }

    async fn rename(
        &self,
        parent: u64,
        name: OsString,
        new_parent: u64,
        new_name: OsString,
        reply: ReplyEmpty,
    ) {
        let Some(dir) = self.find_node(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        // When the destination is the root we must hand the backing
        // directory to the rename, not the root indirection.
        let Some(new_dir) = self.find_node(new_parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        unwrap!(reply, dir.rename(&name, &new_dir, &new_name, &self.cache));
        reply.ok();
    }

    async fn link(&self, ino: u64, new_parent: u64, new_name: OsString, reply: ReplyEntry) {
        let Some(source) = self.find_node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(dir) = self.find_node(new_parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let (node, attr) = unwrap!(reply, dir.link(&source, &new_name, &self.ids, &self.cache));
        self.remember(node);
        reply.entry(&self.ttl, &attr, 0);
    }

    async fn open(&self, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(node) = self.find_node(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let file = unwrap!(reply, node.open(flags));
        let fh = self.allocate_handle(Handle::File { file });
        tracing::trace!(ino, fh, "open");
        reply.opened(fh, 0);
    }

    async fn create(
        &self,
        parent: u64,
        name: OsString,
        mode: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(dir) = self.find_node(parent) else {
            reply.error(libc::ENOENT);
            return;
        };
        let (node, attr, file) =
            unwrap!(reply, dir.create(&name, mode, flags, &self.ids, &self.cache));
        self.remember(node);
        let fh = self.allocate_handle(Handle::File { file });
        tracing::trace!(parent, ?name, fh, "create");
        reply.created(&self.ttl, &attr, 0, fh, 0);
    }

    async fn read(&self, _ino: u64, fh: u64, offset: i64, size: u32, reply: ReplyData) {
        let Some(handle) = self.handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match handle.value() {
            Handle::Dir { .. } => reply.error(libc::EISDIR),
            Handle::File { file } => {
                let mut buf = vec![0; size as usize];
                let mut consumed = 0;
                while consumed < size as usize {
                    let count = unwrap!(
                        reply,
                        file.read_at(&mut buf[consumed..], offset as u64 + consumed as u64)
                    );
                    if count == 0 {
                        // the end of the file has been reached
                        break;
                    }
                    consumed += count;
                }
                tracing::trace!(fh, consumed, "read");
                reply.data(&buf[..consumed]);
            }
        }
    }

    async fn write(&self, _ino: u64, fh: u64, offset: i64, data: Vec<u8>, reply: ReplyWrite) {
        let Some(handle) = self.handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match handle.value() {
            Handle::Dir { .. } => reply.error(libc::EISDIR),
            Handle::File { file } => {
                let mut written = 0;
                while written < data.len() {
                    let count = unwrap!(
                        reply,
                        file.write_at(&data[written..], offset as u64 + written as u64)
                    );
                    written += count;
                }
                tracing::trace!(fh, written, "write");
                reply.written(written as u32);
            }
        }
    }

    async fn release(&self, _ino: u64, fh: u64, reply: ReplyEmpty) {
        if self.handles.remove(&fh).is_none() {
            reply.error(libc::EBADF);
            return;
        }
        reply.ok();
    }

    async fn opendir(&self, ino: u64, reply: ReplyOpen) {
        let entries = if ino == FUSE_ROOT_ID {
            // The listing must be drained from a single tree: hold the
            // exclusive lease so a reconfiguration cannot land mid-drain.
            unwrap!(
                reply,
                self.root
                    .with_exclusive(|dir| dir.entries(&self.ids, &self.cache))
            )
        } else {
            let Some(node) = self.find_node(ino) else {
                reply.error(libc::ENOENT);
                return;
            };
            unwrap!(reply, node.entries(&self.ids, &self.cache))
        };
        let fh = self.allocate_handle(Handle::Dir { entries });
        tracing::trace!(ino, fh, "opendir");
        reply.opened(fh, 0);
    }

    async fn readdir(&self, _ino: u64, fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Some(handle) = self.handles.get(&fh) else {
            reply.error(libc::EBADF);
            return;
        };
        match handle.value() {
            Handle::File { .. } => reply.error(libc::ENOTDIR),
            Handle::Dir { entries } => {
                // offsets are indices into the snapshot taken at opendir
                for (index, entry) in entries.iter().enumerate().skip(offset as usize) {
                    let next_offset = index as i64 + 1;
                    if reply.add(entry.ino, next_offset, entry.kind, &entry.name) {
                        break;
                    }
                }
                reply.ok();
            }
        }
    }

    async fn releasedir(&self, _ino: u64, fh: u64, reply: ReplyEmpty) {
        if self.handles.remove(&fh).is_none() {
            reply.error(libc::EBADF);
            return;
        }
        reply.ok();
    }
}

/// Represents a connected FUSE session.
///
/// This implements the [`fuser::Filesystem`] trait, receives all requests
/// and arranges for their async execution against the shared [`Filesystem`].
pub struct Session {
    fs: Arc<Filesystem>,
}

impl Session {
    /// Constructs a new session serving `fs`.
    pub fn new(fs: Arc<Filesystem>) -> Self {
        Session { fs }
    }
}

impl fuser::Filesystem for Session {
    fn init(
        &mut self,
        _req: &Request<'_>,
        config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        const DESIRED: &[(&str, u32)] = &[
            ("FUSE_ASYNC_READ", FUSE_ASYNC_READ),
            ("FUSE_BIG_WRITES", FUSE_BIG_WRITES),
            ("FUSE_PARALLEL_DIROPS", FUSE_PARALLEL_DIROPS),
        ];
        let all_desired = DESIRED.iter().fold(0, |prev, (_, cap)| prev | cap);
        if let Err(unsupported) = config.add_capabilities(all_desired) {
            let rejected = DESIRED
                .iter()
                .filter_map(|d| (d.1 & unsupported != 0).then_some(d.0));
            for name in rejected {
                tracing::warn!("FUSE feature rejected: {name}");
            }
            config
                .add_capabilities(all_desired & !unsupported)
                .expect("should accept after we remove unsupported caps");
        }
        tracing::info!("Filesystem initialized");
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = name.to_owned();
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.lookup(parent, name, reply).await });
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.forget(ino, nlookup).await });
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.getattr(ino, reply).await });
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let changes = AttrChanges {
            mode,
            uid,
            gid,
            size,
            atime,
            mtime,
        };
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.setattr(ino, changes, reply).await });
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.readlink(ino, reply).await });
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let name = name.to_owned();
        let fs = Arc::clone(&self.fs);
        let mode = mode & !umask;
        tokio::task::spawn(async move { fs.mknod(parent, name, mode, rdev, reply).await });
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        let name = name.to_owned();
        let fs = Arc::clone(&self.fs);
        let mode = mode & !umask;
        tokio::task::spawn(async move { fs.mkdir(parent, name, mode, reply).await });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_owned();
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.unlink(parent, name, reply).await });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name = name.to_owned();
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.rmdir(parent, name, reply).await });
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        let name = link_name.to_owned();
        let target = target.to_path_buf();
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.symlink(parent, name, target, reply).await });
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
        let name = name.to_owned();
        let newname = newname.to_owned();
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.rename(parent, name, newparent, newname, reply).await });
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let newname = newname.to_owned();
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.link(ino, newparent, newname, reply).await });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.open(ino, flags, reply).await });
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let name = name.to_owned();
        let fs = Arc::clone(&self.fs);
        let mode = mode & !umask;
        tokio::task::spawn(async move { fs.create(parent, name, mode, flags, reply).await });
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
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.read(ino, fh, offset, size, reply).await });
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let data = data.to_vec();
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.write(ino, fh, offset, data, reply).await });
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.release(ino, fh, reply).await });
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.opendir(ino, reply).await });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        reply: ReplyDirectory,
    ) {
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.readdir(ino, fh, offset, reply).await });
    }

    fn releasedir(&mut self, _req: &Request<'_>, ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        let fs = Arc::clone(&self.fs);
        tokio::task::spawn(async move { fs.releasedir(ino, fh, reply).await });
    }
}
