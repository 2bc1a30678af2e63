// Copyright (c) Contributors to the sandboxfs project.
// SPDX-License-Identifier: Apache-2.0

//! Construction of the initial node hierarchy from a list of mappings.
//!
//! Mappings are installed one by one, in input order, into a provisional
//! tree. Missing intermediate components become scaffold directories; a
//! mapping whose target is a directory may land on top of such a scaffold
//! and adopt its children ("promotion"). Once every mapping is installed
//! the provisional tree is frozen into immutable nodes with freshly
//! allocated identifiers.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use fuser::FileType;
use nix::sys::stat;
use nix::unistd::{Gid, Uid};

use crate::mapping::Mapping;
use crate::nodes::{self, IdGenerator, Mapped, Node, Scaffold};
use crate::paths;
use crate::{Error, Result};

/// A node of the provisional tree manipulated during installation.
enum Pending {
    Scaffold {
        children: BTreeMap<OsString, Pending>,
    },
    Mapped {
        underlying_path: PathBuf,
        writable: bool,
        kind: FileType,
        grafts: BTreeMap<OsString, Pending>,
    },
}

impl Pending {
    fn empty_scaffold() -> Pending {
        Pending::Scaffold {
            children: BTreeMap::new(),
        }
    }
}

/// Builds the node hierarchy described by `mappings`.
///
/// `uid` and `gid` become the owner reported by any synthesized scaffold
/// directories. An empty mapping list yields a bare scaffold root.
pub fn build(
    mappings: &[Mapping],
    ids: &IdGenerator,
    uid: Uid,
    gid: Gid,
) -> Result<Arc<Node>> {
    let mut root = Pending::empty_scaffold();
    for mapping in mappings {
        install(&mut root, mapping)?;
    }
    Ok(freeze(root, ids, uid, gid, SystemTime::now()))
}

/// Stats a mapping's target, turning failures into configuration errors
/// that name both sides of the mapping.
fn stat_target(mapping: &Mapping) -> Result<FileType> {
    let st = stat::lstat(mapping.underlying_path()).map_err(|errno| Error::StatFailed {
        path: mapping.path().to_path_buf(),
        underlying: mapping.underlying_path().to_path_buf(),
        source: errno,
    })?;
    Ok(nodes::file_type_of(&st))
}

fn install(root: &mut Pending, mapping: &Mapping) -> Result<()> {
    if mapping.is_root() {
        return install_at_root(root, mapping);
    }

    let components: Vec<&OsStr> = paths::components(mapping.path()).collect();
    let (last, intermediate) = components.split_last().expect("non-root path has components");

    let mut cursor = root;
    for name in intermediate {
        cursor = descend(cursor, name, mapping.path())?;
    }

    let children = match cursor {
        Pending::Scaffold { children } => children,
        Pending::Mapped { grafts, .. } => grafts,
    };
    match children.entry((*last).to_owned()) {
        std::collections::btree_map::Entry::Vacant(vacant) => {
            let kind = stat_target(mapping)?;
            vacant.insert(Pending::Mapped {
                underlying_path: mapping.underlying_path().to_path_buf(),
                writable: mapping.writable(),
                kind,
                grafts: BTreeMap::new(),
            });
            Ok(())
        }
        std::collections::btree_map::Entry::Occupied(mut occupied) => match occupied.get_mut() {
            Pending::Scaffold { children } => {
                let kind = stat_target(mapping)?;
                if kind != FileType::Directory {
                    return Err(Error::FileOverDirectory {
                        path: mapping.path().to_path_buf(),
                    });
                }
                let grafts = mem::take(children);
                *occupied.get_mut() = Pending::Mapped {
                    underlying_path: mapping.underlying_path().to_path_buf(),
                    writable: mapping.writable(),
                    kind,
                    grafts,
                };
                Ok(())
            }
            Pending::Mapped { .. } => Err(Error::AlreadyMapped {
                path: mapping.path().to_path_buf(),
            }),
        },
    }
}

/// Steps into (or creates) the intermediate component `name`, failing if an
/// existing non-directory mapping stands in the way.
fn descend<'tree>(
    node: &'tree mut Pending,
    name: &OsStr,
    full_path: &Path,
) -> Result<&'tree mut Pending> {
    let children = match node {
        Pending::Scaffold { children } => children,
        Pending::Mapped {
            kind: FileType::Directory,
            grafts,
            ..
        } => grafts,
        // A mapped leaf cannot gain children.
        Pending::Mapped { .. } => {
            return Err(Error::AlreadyMapped {
                path: full_path.to_path_buf(),
            })
        }
    };
    Ok(children
        .entry(name.to_owned())
        .or_insert_with(Pending::empty_scaffold))
}

fn install_at_root(root: &mut Pending, mapping: &Mapping) -> Result<()> {
    match root {
        Pending::Scaffold { children } => {
            let kind = stat_target(mapping)?;
            if kind != FileType::Directory {
                return Err(Error::NotADirectory {
                    path: mapping.path().to_path_buf(),
                    underlying: mapping.underlying_path().to_path_buf(),
                });
            }
            let grafts = mem::take(children);
            *root = Pending::Mapped {
                underlying_path: mapping.underlying_path().to_path_buf(),
                writable: mapping.writable(),
                kind,
                grafts,
            };
            Ok(())
        }
        Pending::Mapped { .. } => Err(Error::AlreadyMapped {
            path: mapping.path().to_path_buf(),
        }),
    }
}

/// Turns the provisional tree into immutable nodes, allocating identifiers
/// depth first.
fn freeze(pending: Pending, ids: &IdGenerator, uid: Uid, gid: Gid, now: SystemTime) -> Arc<Node> {
    match pending {
        Pending::Scaffold { children } => {
            let ino = ids.next();
            let children = children
                .into_iter()
                .map(|(name, child)| (name, freeze(child, ids, uid, gid, now)))
                .collect();
            Arc::new(Node::Scaffold(Scaffold::new(ino, children, uid, gid, now)))
        }
        Pending::Mapped {
            underlying_path,
            writable,
            kind,
            grafts,
        } => {
            let ino = ids.next();
            if kind == FileType::Directory {
                let grafts = grafts
                    .into_iter()
                    .map(|(name, child)| (name, freeze(child, ids, uid, gid, now)))
                    .collect();
                Arc::new(Node::Mapped(Mapped::new_directory(
                    ino,
                    underlying_path,
                    writable,
                    grafts,
                )))
            } else {
                debug_assert!(grafts.is_empty(), "non-directory mappings have no grafts");
                Arc::new(Node::Mapped(Mapped::new_leaf(
                    ino,
                    underlying_path,
                    kind,
                    writable,
                )))
            }
        }
    }
}

#[cfg(test)]
#[path = "./tree_test.rs"]
mod tree_test;
