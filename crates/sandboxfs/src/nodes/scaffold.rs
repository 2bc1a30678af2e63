// Copyright (c) Contributors to the sandboxfs project.
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::sync::Arc;
use std::time::SystemTime;

use fuser::{FileAttr, FileType};
use nix::errno::Errno;
use nix::unistd::{Gid, Uid};

use super::{DirEntry, Node};
use crate::Result;

/// A purely synthetic directory.
///
/// Scaffold directories exist only to provide the intermediate path
/// components leading to a mapping. They have no underlying path, their
/// child table never changes after construction, and every mutation is
/// rejected as a write to a read-only file system. Attributes are frozen at
/// construction time.
#[derive(Debug)]
pub struct Scaffold {
    ino: u64,
    children: BTreeMap<OsString, Arc<Node>>,
    attr: FileAttr,
}

impl Scaffold {
    pub(crate) fn new(
        ino: u64,
        children: BTreeMap<OsString, Arc<Node>>,
        uid: Uid,
        gid: Gid,
        now: SystemTime,
    ) -> Self {
        let attr = FileAttr {
            ino,
            size: children.len() as u64,
            blocks: 0,
            atime: now,
            mtime: now,
            ctime: now,
            crtime: now,
            kind: FileType::Directory,
            perm: 0o555,
            nlink: 2,
            uid: uid.as_raw(),
            gid: gid.as_raw(),
            rdev: 0,
            blksize: 512,
            flags: 0,
        };
        Scaffold {
            ino,
            children,
            attr,
        }
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn getattr(&self) -> FileAttr {
        self.attr
    }

    pub fn lookup(&self, name: &OsStr) -> Result<(Arc<Node>, FileAttr)> {
        let Some(child) = self.children.get(name) else {
            return Err(Errno::ENOENT.into());
        };
        let attr = child.getattr()?;
        Ok((Arc::clone(child), attr))
    }

    /// Lists the child table in name order.
    pub fn entries(&self) -> Vec<DirEntry> {
        self.children
            .iter()
            .map(|(name, child)| DirEntry {
                ino: child.ino(),
                kind: child.file_type(),
                name: name.clone(),
            })
            .collect()
    }

    pub fn entry_names(&self) -> Vec<OsString> {
        self.children.keys().cloned().collect()
    }
}

#[cfg(test)]
#[path = "./scaffold_test.rs"]
mod scaffold_test;
