// Copyright (c) Contributors to the sandboxfs project.
// SPDX-License-Identifier: Apache-2.0

//! In-memory representation of the composed tree.
//!
//! The tree has exactly two node flavors: [`Mapped`] nodes delegate every
//! operation to an underlying host path, while [`Scaffold`] nodes are
//! synthetic read-only directories that exist only to host descendants.
//! The two are deliberately kept as separate variants with separate state;
//! operations dispatch over the enum the same way the rest of the crate
//! dispatches over open handles.

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{FileAttr, FileType, TimeOrNow};
use nix::errno::Errno;
use nix::sys::stat::FileStat;

use crate::Result;

mod mapped;
mod scaffold;

pub use mapped::Mapped;
pub use scaffold::Scaffold;

/// Monotonically-increasing generator of node and handle identifiers.
///
/// Identifiers are never reused within the lifetime of the process, which
/// is what lets reconfigurations hand out entirely new trees while the
/// kernel still holds references into old ones.
pub struct IdGenerator {
    last_id: AtomicU64,
}

impl IdGenerator {
    pub fn new(start_value: u64) -> Self {
        IdGenerator {
            last_id: AtomicU64::new(start_value),
        }
    }

    /// Obtains a new identifier.
    pub fn next(&self) -> u64 {
        let id = self.last_id.fetch_add(1, Ordering::Relaxed);
        if id == u64::MAX {
            panic!("Ran out of node identifiers");
        }
        id
    }
}

/// A single directory entry as served to the kernel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DirEntry {
    pub ino: u64,
    pub kind: FileType,
    pub name: OsString,
}

/// The subset of attributes a `setattr` request may change.
#[derive(Debug, Default)]
pub struct AttrChanges {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeOrNow>,
    pub mtime: Option<TimeOrNow>,
}

impl AttrChanges {
    fn is_empty(&self) -> bool {
        self.mode.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
            && self.size.is_none()
            && self.atime.is_none()
            && self.mtime.is_none()
    }
}

/// Nodes indexed by their underlying path.
///
/// A path that is rediscovered through lookup, or unmapped and mapped again
/// across reconfigurations, must keep presenting the same identifier or the
/// kernel will treat it as a brand new file and drop every cache it had for
/// it. Directories are exempt: their content partially lives in the mappings
/// configuration, so each discovery builds a fresh node.
///
/// Entries are evicted when the user explicitly deletes the underlying file,
/// because a recreation truly is a different file.
#[derive(Default)]
pub struct Cache {
    entries: Mutex<HashMap<PathBuf, Arc<Node>>>,
}

impl Cache {
    /// Gets the node for `underlying_path` from the cache, or creates one
    /// with the given stat data and writability if not yet known.
    pub fn get_or_create(
        &self,
        ids: &IdGenerator,
        underlying_path: &Path,
        st: &FileStat,
        writable: bool,
    ) -> Arc<Node> {
        if file_type_of(st) == FileType::Directory {
            return Arc::new(Node::Mapped(Mapped::from_stat(
                ids.next(),
                underlying_path.to_path_buf(),
                st,
                writable,
            )));
        }

        let mut entries = self.entries.lock().unwrap();
        if let Some(node) = entries.get(underlying_path) {
            if node.writable() == writable {
                return Arc::clone(node);
            }
            // Writability is a property of the mappings, not of the
            // underlying file, so a mismatch means the configuration
            // changed and the node must be rebuilt.
            tracing::info!(
                ?underlying_path,
                "recreating node because writability changed"
            );
        }

        let node = Arc::new(Node::Mapped(Mapped::from_stat(
            ids.next(),
            underlying_path.to_path_buf(),
            st,
            writable,
        )));
        entries.insert(underlying_path.to_path_buf(), Arc::clone(&node));
        node
    }

    /// Drops the entry for `underlying_path`, if any.
    pub fn remove(&self, underlying_path: &Path) {
        self.entries.lock().unwrap().remove(underlying_path);
    }
}

/// A node in the composed tree.
#[derive(Debug)]
pub enum Node {
    Mapped(Mapped),
    Scaffold(Scaffold),
}

impl Node {
    /// The identifier the kernel knows this node by.
    pub fn ino(&self) -> u64 {
        match self {
            Node::Mapped(node) => node.ino(),
            Node::Scaffold(node) => node.ino(),
        }
    }

    /// Whether operations through this node may mutate the host.
    pub fn writable(&self) -> bool {
        match self {
            Node::Mapped(node) => node.writable(),
            Node::Scaffold(_) => false,
        }
    }

    /// The node's type as captured at construction time.
    ///
    /// Used when listing explicitly grafted entries, where re-statting every
    /// child on each readdir would be wasteful. The getattr path always
    /// queries the host anew.
    pub fn file_type(&self) -> FileType {
        match self {
            Node::Mapped(node) => node.file_type(),
            Node::Scaffold(_) => FileType::Directory,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    /// The host path this node is bound to, if it is a mapped node.
    pub fn underlying_path(&self) -> Option<&Path> {
        match self {
            Node::Mapped(node) => Some(node.underlying_path()),
            Node::Scaffold(_) => None,
        }
    }

    /// Retrieves the node's current attributes.
    pub fn getattr(&self) -> Result<FileAttr> {
        match self {
            Node::Mapped(node) => node.getattr(),
            Node::Scaffold(node) => Ok(node.getattr()),
        }
    }

    /// Looks up `name` within this directory, returning the node and its
    /// attributes at the time of the query.
    pub fn lookup(
        &self,
        name: &OsStr,
        ids: &IdGenerator,
        cache: &Cache,
    ) -> Result<(Arc<Node>, FileAttr)> {
        match self {
            Node::Mapped(node) => node.lookup(name, ids, cache),
            Node::Scaffold(node) => node.lookup(name),
        }
    }

    /// Produces the full listing of this directory.
    pub fn entries(&self, ids: &IdGenerator, cache: &Cache) -> Result<Vec<DirEntry>> {
        match self {
            Node::Mapped(node) => node.entries(ids, cache),
            Node::Scaffold(node) => Ok(node.entries()),
        }
    }

    /// Produces only the names in this directory, without instantiating any
    /// nodes. Used to drive kernel cache invalidation.
    pub fn entry_names(&self) -> Result<Vec<OsString>> {
        match self {
            Node::Mapped(node) => node.entry_names(),
            Node::Scaffold(node) => Ok(node.entry_names()),
        }
    }

    /// Reads the literal target of a symlink.
    pub fn readlink(&self) -> Result<PathBuf> {
        match self {
            Node::Mapped(node) => node.readlink(),
            Node::Scaffold(_) => Err(Errno::EINVAL.into()),
        }
    }

    /// Opens the underlying file, honoring the mapping's writability.
    pub fn open(&self, flags: i32) -> Result<File> {
        match self {
            Node::Mapped(node) => node.open(flags),
            Node::Scaffold(_) => Err(Errno::EISDIR.into()),
        }
    }

    /// Applies attribute changes to the underlying file.
    pub fn setattr(&self, changes: &AttrChanges) -> Result<FileAttr> {
        match self {
            Node::Mapped(node) => node.setattr(changes),
            Node::Scaffold(_) => Err(Errno::EROFS.into()),
        }
    }

    pub fn create(
        &self,
        name: &OsStr,
        mode: u32,
        flags: i32,
        ids: &IdGenerator,
        cache: &Cache,
    ) -> Result<(Arc<Node>, FileAttr, File)> {
        match self {
            Node::Mapped(node) => node.create(name, mode, flags, ids, cache),
            Node::Scaffold(_) => Err(Errno::EROFS.into()),
        }
    }

    pub fn mkdir(
        &self,
        name: &OsStr,
        mode: u32,
        ids: &IdGenerator,
        cache: &Cache,
    ) -> Result<(Arc<Node>, FileAttr)> {
        match self {
            Node::Mapped(node) => node.mkdir(name, mode, ids, cache),
            Node::Scaffold(_) => Err(Errno::EROFS.into()),
        }
    }

    pub fn mknod(
        &self,
        name: &OsStr,
        mode: u32,
        rdev: u32,
        ids: &IdGenerator,
        cache: &Cache,
    ) -> Result<(Arc<Node>, FileAttr)> {
        match self {
            Node::Mapped(node) => node.mknod(name, mode, rdev, ids, cache),
            Node::Scaffold(_) => Err(Errno::EROFS.into()),
        }
    }

    pub fn symlink(
        &self,
        name: &OsStr,
        target: &Path,
        ids: &IdGenerator,
        cache: &Cache,
    ) -> Result<(Arc<Node>, FileAttr)> {
        match self {
            Node::Mapped(node) => node.symlink(name, target, ids, cache),
            Node::Scaffold(_) => Err(Errno::EROFS.into()),
        }
    }

    /// Creates a hard link named `name` to `source` in this directory.
    pub fn link(
        &self,
        source: &Node,
        name: &OsStr,
        ids: &IdGenerator,
        cache: &Cache,
    ) -> Result<(Arc<Node>, FileAttr)> {
        match self {
            Node::Mapped(node) => node.link(source, name, ids, cache),
            Node::Scaffold(_) => Err(Errno::EROFS.into()),
        }
    }

    pub fn unlink(&self, name: &OsStr, cache: &Cache) -> Result<()> {
        match self {
            Node::Mapped(node) => node.unlink(name, cache),
            Node::Scaffold(_) => Err(Errno::EROFS.into()),
        }
    }

    pub fn rmdir(&self, name: &OsStr, cache: &Cache) -> Result<()> {
        match self {
            Node::Mapped(node) => node.rmdir(name, cache),
            Node::Scaffold(_) => Err(Errno::EROFS.into()),
        }
    }

    /// Moves `name` in this directory to `new_name` under `new_dir`.
    ///
    /// Both endpoints must resolve into mapped directories; the host then
    /// decides whether the rename is possible (including EXDEV across
    /// devices). Any endpoint in a scaffold directory is a write into the
    /// synthetic tree and fails accordingly.
    pub fn rename(&self, name: &OsStr, new_dir: &Node, new_name: &OsStr, cache: &Cache) -> Result<()> {
        match (self, new_dir) {
            (Node::Mapped(node), Node::Mapped(new_dir)) => {
                node.rename(name, new_dir, new_name, cache)
            }
            _ => Err(Errno::EROFS.into()),
        }
    }
}

/// Derives the FUSE file type from a raw stat result.
pub(crate) fn file_type_of(st: &FileStat) -> FileType {
    match st.st_mode as u32 & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

fn system_time(secs: i64, nanos: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos as u32)
    } else {
        UNIX_EPOCH - Duration::new(secs.unsigned_abs(), 0)
    }
}

/// Converts a raw stat result into the attributes the kernel expects,
/// reported under our own node identifier rather than the host inode.
pub(crate) fn attr_from_stat(st: &FileStat, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: system_time(st.st_atime, st.st_atime_nsec),
        mtime: system_time(st.st_mtime, st.st_mtime_nsec),
        ctime: system_time(st.st_ctime, st.st_ctime_nsec),
        crtime: system_time(st.st_ctime, st.st_ctime_nsec),
        kind: file_type_of(st),
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: 0,
    }
}

/// Maps a `setattr` timestamp to the timespec `utimensat` expects.
fn timespec_of(time: Option<TimeOrNow>) -> nix::sys::time::TimeSpec {
    use nix::sys::time::TimeSpec;
    match time {
        None => TimeSpec::new(0, libc::UTIME_OMIT),
        Some(TimeOrNow::Now) => TimeSpec::new(0, libc::UTIME_NOW),
        Some(TimeOrNow::SpecificTime(at)) => match at.duration_since(UNIX_EPOCH) {
            Ok(since) => TimeSpec::new(since.as_secs() as i64, since.subsec_nanos() as i64),
            Err(_) => TimeSpec::new(0, 0),
        },
    }
}
