// Copyright (c) Contributors to the sandboxfs project.
// SPDX-License-Identifier: Apache-2.0

//! Mapping specifications.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;

use crate::paths;
use crate::{Error, Result};

/// Connects an individual path within the sandbox to a path on the host
/// file system, either read-only or read-write.
///
/// The synthetic `path` must be absolute and canonical; the
/// `underlying_path` must be absolute. Neither is stat'd here: whether the
/// target actually exists is the tree builder's concern.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq)]
#[serde(try_from = "WireMapping")]
pub struct Mapping {
    path: PathBuf,
    underlying_path: PathBuf,
    writable: bool,
}

impl Mapping {
    /// Creates a new mapping from its individual components.
    pub fn new(path: PathBuf, underlying_path: PathBuf, writable: bool) -> Result<Mapping> {
        paths::validate(&path)?;
        if !underlying_path.is_absolute() {
            return Err(Error::PathNotAbsolute {
                path: underlying_path,
            });
        }
        Ok(Mapping {
            path,
            underlying_path,
            writable,
        })
    }

    /// The location of this mapping within the mount point.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The host path exposed at [`Mapping::path`].
    pub fn underlying_path(&self) -> &Path {
        &self.underlying_path
    }

    /// Whether writes are allowed through this mapping.
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Returns true if this mapping is for the root directory.
    pub fn is_root(&self) -> bool {
        self.path.parent().is_none()
    }
}

impl fmt::Display for Mapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = if self.writable { "rw" } else { "ro" };
        write!(
            f,
            "{}:{}:{}",
            mode,
            self.path.display(),
            self.underlying_path.display()
        )
    }
}

impl FromStr for Mapping {
    type Err = Error;

    /// Parses a mapping of the form `TYPE:PATH:TARGET` where `TYPE` is one
    /// of `ro` or `rw`. The target may itself contain colons.
    fn from_str(spec: &str) -> Result<Mapping> {
        let mut parts = spec.splitn(3, ':');
        let (mode, path, target) = match (parts.next(), parts.next(), parts.next()) {
            (Some(mode), Some(path), Some(target)) => (mode, path, target),
            _ => {
                return Err(Error::MalformedMapping {
                    spec: spec.to_owned(),
                    reason: "expected three colon-separated fields",
                })
            }
        };
        let writable = match mode {
            "ro" => false,
            "rw" => true,
            _ => {
                return Err(Error::MalformedMapping {
                    spec: spec.to_owned(),
                    reason: "type was not 'ro' or 'rw'",
                })
            }
        };
        Mapping::new(PathBuf::from(path), PathBuf::from(target), writable)
    }
}

/// On-the-wire shape of a mapping in the reconfiguration stream.
#[derive(Deserialize)]
struct WireMapping {
    path: PathBuf,
    underlying_path: PathBuf,
    writable: bool,
}

impl TryFrom<WireMapping> for Mapping {
    type Error = Error;

    fn try_from(wire: WireMapping) -> Result<Mapping> {
        Mapping::new(wire.path, wire.underlying_path, wire.writable)
    }
}

#[cfg(test)]
#[path = "./mapping_test.rs"]
mod mapping_test;
