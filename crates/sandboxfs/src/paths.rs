// Copyright (c) Contributors to the sandboxfs project.
// SPDX-License-Identifier: Apache-2.0

//! Handling of synthetic (in-mount) paths.
//!
//! Synthetic paths are the left-hand side of a mapping: absolute paths whose
//! components name entries inside the mount. They are compared byte for byte,
//! so lookups across them are always case sensitive regardless of the host
//! file system mounted underneath.

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path};

use crate::{Error, Result};

/// Ensures `path` is absolute and canonical.
///
/// Paths containing `.`, `..` or empty components are rejected, not
/// collapsed: a mapping at `/a//b` or `/a/./b` is a configuration mistake
/// that silently rewriting would only hide.
pub fn validate(path: &Path) -> Result<()> {
    let bytes = path.as_os_str().as_bytes();
    if bytes.first() != Some(&b'/') {
        return Err(Error::PathNotAbsolute {
            path: path.to_path_buf(),
        });
    }
    if bytes.len() == 1 {
        // the root itself
        return Ok(());
    }
    for part in bytes[1..].split(|b| *b == b'/') {
        match part {
            b"" | b"." | b".." => {
                return Err(Error::PathNotNormalized {
                    path: path.to_path_buf(),
                })
            }
            _ => (),
        }
    }
    Ok(())
}

/// Iterates over the name components of a validated synthetic path, root
/// excluded. Yields nothing for `/`.
pub fn components(path: &Path) -> impl Iterator<Item = &OsStr> {
    path.components().filter_map(|component| match component {
        Component::Normal(name) => Some(name),
        _ => None,
    })
}

#[cfg(test)]
#[path = "./paths_test.rs"]
mod paths_test;
