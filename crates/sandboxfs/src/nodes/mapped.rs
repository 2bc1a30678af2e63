// Copyright (c) Contributors to the sandboxfs project.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fuser::{FileAttr, FileType};
use nix::errno::Errno;
use nix::sys::stat::{self, FchmodatFlags, FileStat, Mode, SFlag, UtimensatFlags};
use nix::unistd::{Gid, Uid};
use once_cell::sync::OnceCell;

use super::{attr_from_stat, file_type_of, timespec_of, AttrChanges, Cache, DirEntry, IdGenerator, Node};
use crate::{Error, Result};

/// A node whose behavior is delegated to an underlying host path.
///
/// Attributes are re-stat'd on every request so that outside modifications
/// to the underlying file become visible, subject only to whatever the
/// kernel still has cached. Directories additionally carry a graft table:
/// the mappings installed beneath them, which shadow host entries of the
/// same name.
#[derive(Debug)]
pub struct Mapped {
    ino: u64,
    underlying_path: PathBuf,
    writable: bool,
    kind: FileType,
    grafts: BTreeMap<OsString, Arc<Node>>,
    link_target: OnceCell<PathBuf>,
}

impl Mapped {
    /// Creates a node for a directory mapping with the given grafted
    /// children. Only the tree builder constructs nodes this way.
    pub(crate) fn new_directory(
        ino: u64,
        underlying_path: PathBuf,
        writable: bool,
        grafts: BTreeMap<OsString, Arc<Node>>,
    ) -> Self {
        Mapped {
            ino,
            underlying_path,
            writable,
            kind: FileType::Directory,
            grafts,
            link_target: OnceCell::new(),
        }
    }

    /// Creates a node for a non-directory mapping whose kind was captured
    /// when the tree builder stat'd the target.
    pub(crate) fn new_leaf(
        ino: u64,
        underlying_path: PathBuf,
        kind: FileType,
        writable: bool,
    ) -> Self {
        Mapped {
            ino,
            underlying_path,
            writable,
            kind,
            grafts: BTreeMap::new(),
            link_target: OnceCell::new(),
        }
    }

    /// Creates a node for a host object discovered through `st`.
    pub(crate) fn from_stat(ino: u64, underlying_path: PathBuf, st: &FileStat, writable: bool) -> Self {
        Mapped {
            ino,
            underlying_path,
            writable,
            kind: file_type_of(st),
            grafts: BTreeMap::new(),
            link_target: OnceCell::new(),
        }
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn file_type(&self) -> FileType {
        self.kind
    }

    pub fn underlying_path(&self) -> &Path {
        &self.underlying_path
    }

    fn check_is_dir(&self) -> Result<()> {
        if self.kind != FileType::Directory {
            return Err(Errno::ENOTDIR.into());
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if !self.writable {
            return Err(Errno::EROFS.into());
        }
        Ok(())
    }

    /// Guards a mutation aimed at `name` within this directory.
    ///
    /// Grafted entries are owned by the mappings configuration: translating
    /// the operation to the host would touch the shadowed object instead of
    /// the one the mount exposes, so such requests are treated as writes
    /// into the synthetic tree.
    fn check_mutable_entry(&self, name: &OsStr) -> Result<PathBuf> {
        self.check_is_dir()?;
        self.check_writable()?;
        if self.grafts.contains_key(name) {
            return Err(Errno::EROFS.into());
        }
        Ok(self.underlying_path.join(name))
    }

    pub fn getattr(&self) -> Result<FileAttr> {
        let st = stat::lstat(&self.underlying_path)?;
        Ok(attr_from_stat(&st, self.ino))
    }

    pub fn lookup(
        &self,
        name: &OsStr,
        ids: &IdGenerator,
        cache: &Cache,
    ) -> Result<(Arc<Node>, FileAttr)> {
        self.check_is_dir()?;
        if let Some(child) = self.grafts.get(name) {
            let attr = child.getattr()?;
            return Ok((Arc::clone(child), attr));
        }
        let path = self.underlying_path.join(name);
        let st = stat::lstat(&path)?;
        let node = cache.get_or_create(ids, &path, &st, self.writable);
        let attr = attr_from_stat(&st, node.ino());
        Ok((node, attr))
    }

    /// Lists this directory: the union of the host's entries and the graft
    /// table, with grafts shadowing host entries of the same name.
    pub fn entries(&self, ids: &IdGenerator, cache: &Cache) -> Result<Vec<DirEntry>> {
        self.check_is_dir()?;
        let mut entries: Vec<DirEntry> = self
            .grafts
            .iter()
            .map(|(name, child)| DirEntry {
                ino: child.ino(),
                kind: child.file_type(),
                name: name.clone(),
            })
            .collect();
        for host_entry in std::fs::read_dir(&self.underlying_path)? {
            let host_entry = host_entry?;
            let name = host_entry.file_name();
            if self.grafts.contains_key(&name) {
                continue;
            }
            let path = host_entry.path();
            let st = match stat::lstat(&path) {
                Ok(st) => st,
                Err(err) => {
                    // The entry may have vanished between readdir and stat.
                    tracing::debug!(?path, "skipping unstattable entry: {err}");
                    continue;
                }
            };
            let node = cache.get_or_create(ids, &path, &st, self.writable);
            entries.push(DirEntry {
                ino: node.ino(),
                kind: node.file_type(),
                name,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub fn entry_names(&self) -> Result<Vec<OsString>> {
        self.check_is_dir()?;
        let mut names: Vec<OsString> = self.grafts.keys().cloned().collect();
        for host_entry in std::fs::read_dir(&self.underlying_path)? {
            let name = host_entry?.file_name();
            if !self.grafts.contains_key(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }

    pub fn readlink(&self) -> Result<PathBuf> {
        if self.kind != FileType::Symlink {
            return Err(Errno::EINVAL.into());
        }
        // The target is what the host stores, never resolved; whether it
        // escapes the mount is for the kernel to decide during resolution.
        self.link_target
            .get_or_try_init(|| std::fs::read_link(&self.underlying_path).map_err(Error::from))
            .cloned()
    }

    pub fn open(&self, flags: i32) -> Result<File> {
        if self.kind == FileType::Directory {
            return Err(Errno::EISDIR.into());
        }
        let wants_write = flags & (libc::O_WRONLY | libc::O_RDWR) != 0;
        if (wants_write || flags & libc::O_TRUNC != 0) && !self.writable {
            return Err(Errno::EROFS.into());
        }
        let mut options = OpenOptions::new();
        match flags & libc::O_ACCMODE {
            libc::O_RDONLY => options.read(true),
            libc::O_WRONLY => options.write(true),
            libc::O_RDWR => options.read(true).write(true),
            _ => return Err(Errno::EINVAL.into()),
        };
        if flags & libc::O_APPEND != 0 {
            options.append(true);
        }
        if flags & libc::O_TRUNC != 0 {
            options.truncate(true);
        }
        Ok(options.open(&self.underlying_path)?)
    }

    pub fn setattr(&self, changes: &AttrChanges) -> Result<FileAttr> {
        if !changes.is_empty() {
            self.check_writable()?;
        }
        let path = &self.underlying_path;
        if let Some(mode) = changes.mode {
            stat::fchmodat(
                None,
                path,
                Mode::from_bits_truncate(mode),
                FchmodatFlags::FollowSymlink,
            )?;
        }
        if changes.uid.is_some() || changes.gid.is_some() {
            nix::unistd::chown(
                path,
                changes.uid.map(Uid::from_raw),
                changes.gid.map(Gid::from_raw),
            )?;
        }
        if let Some(size) = changes.size {
            nix::unistd::truncate(path, size as libc::off_t)?;
        }
        if changes.atime.is_some() || changes.mtime.is_some() {
            stat::utimensat(
                None,
                path,
                &timespec_of(changes.atime),
                &timespec_of(changes.mtime),
                UtimensatFlags::NoFollowSymlink,
            )?;
        }
        self.getattr()
    }

    pub fn create(
        &self,
        name: &OsStr,
        mode: u32,
        flags: i32,
        ids: &IdGenerator,
        cache: &Cache,
    ) -> Result<(Arc<Node>, FileAttr, File)> {
        let path = self.check_mutable_entry(name)?;
        let mut options = OpenOptions::new();
        // The internal handle is always opened for writing: creation
        // requires it, and the kernel enforces the caller's access mode on
        // its side of the handle.
        options
            .read(flags & libc::O_ACCMODE != libc::O_WRONLY)
            .write(true)
            .create(true)
            .mode(mode);
        if flags & libc::O_EXCL != 0 {
            options.create_new(true);
        }
        if flags & libc::O_TRUNC != 0 {
            options.truncate(true);
        }
        let file = options.open(&path)?;
        let st = stat::lstat(&path)?;
        let node = cache.get_or_create(ids, &path, &st, self.writable);
        let attr = attr_from_stat(&st, node.ino());
        Ok((node, attr, file))
    }

    pub fn mkdir(
        &self,
        name: &OsStr,
        mode: u32,
        ids: &IdGenerator,
        cache: &Cache,
    ) -> Result<(Arc<Node>, FileAttr)> {
        let path = self.check_mutable_entry(name)?;
        std::fs::DirBuilder::new().mode(mode).create(&path)?;
        self.register_new(path, ids, cache)
    }

    pub fn mknod(
        &self,
        name: &OsStr,
        mode: u32,
        rdev: u32,
        ids: &IdGenerator,
        cache: &Cache,
    ) -> Result<(Arc<Node>, FileAttr)> {
        let path = self.check_mutable_entry(name)?;
        stat::mknod(
            &path,
            SFlag::from_bits_truncate(mode),
            Mode::from_bits_truncate(mode),
            rdev as libc::dev_t,
        )?;
        self.register_new(path, ids, cache)
    }

    pub fn symlink(
        &self,
        name: &OsStr,
        target: &Path,
        ids: &IdGenerator,
        cache: &Cache,
    ) -> Result<(Arc<Node>, FileAttr)> {
        let path = self.check_mutable_entry(name)?;
        std::os::unix::fs::symlink(target, &path)?;
        self.register_new(path, ids, cache)
    }

    pub fn link(
        &self,
        source: &Node,
        name: &OsStr,
        ids: &IdGenerator,
        cache: &Cache,
    ) -> Result<(Arc<Node>, FileAttr)> {
        let path = self.check_mutable_entry(name)?;
        let Some(source_path) = source.underlying_path() else {
            return Err(Errno::EPERM.into());
        };
        std::fs::hard_link(source_path, &path)?;
        self.register_new(path, ids, cache)
    }

    /// Stats a freshly created entry and hands back its node. Shared tail
    /// of every creation operation.
    fn register_new(
        &self,
        path: PathBuf,
        ids: &IdGenerator,
        cache: &Cache,
    ) -> Result<(Arc<Node>, FileAttr)> {
        let st = stat::lstat(&path)?;
        let node = cache.get_or_create(ids, &path, &st, self.writable);
        let attr = attr_from_stat(&st, node.ino());
        Ok((node, attr))
    }

    pub fn unlink(&self, name: &OsStr, cache: &Cache) -> Result<()> {
        let path = self.check_mutable_entry(name)?;
        std::fs::remove_file(&path)?;
        cache.remove(&path);
        Ok(())
    }

    pub fn rmdir(&self, name: &OsStr, cache: &Cache) -> Result<()> {
        let path = self.check_mutable_entry(name)?;
        std::fs::remove_dir(&path)?;
        cache.remove(&path);
        Ok(())
    }

    pub fn rename(
        &self,
        name: &OsStr,
        new_dir: &Mapped,
        new_name: &OsStr,
        cache: &Cache,
    ) -> Result<()> {
        let old_path = self.check_mutable_entry(name)?;
        let new_path = new_dir.check_mutable_entry(new_name)?;
        std::fs::rename(&old_path, &new_path)?;
        // The moved and displaced objects both changed identity on the host.
        cache.remove(&old_path);
        cache.remove(&new_path);
        Ok(())
    }
}

#[cfg(test)]
#[path = "./mapped_test.rs"]
mod mapped_test;
