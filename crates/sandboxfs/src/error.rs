// Copyright (c) Contributors to the sandboxfs project.
// SPDX-License-Identifier: Apache-2.0

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by mapping validation, tree construction and node serving.
///
/// Configuration errors carry the failing synthetic path so that startup and
/// reconfiguration failures point at the offending mapping. Errors that reach
/// the kernel are reduced to an errno via [`Error::raw_os_error`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("path {path:?} is not absolute")]
    PathNotAbsolute { path: PathBuf },

    #[error("path {path:?} is not normalized")]
    PathNotNormalized { path: PathBuf },

    #[error("invalid mapping {spec:?}: {reason}")]
    MalformedMapping { spec: String, reason: &'static str },

    #[error("cannot map {path:?}: already mapped")]
    AlreadyMapped { path: PathBuf },

    #[error("cannot map {path:?}: file mapped over existing directory")]
    FileOverDirectory { path: PathBuf },

    #[error("cannot map {path:?}: {underlying:?} is not a directory")]
    NotADirectory { path: PathBuf, underlying: PathBuf },

    #[error("cannot map {path:?}: stat failed for {underlying:?}: {source}")]
    StatFailed {
        path: PathBuf,
        underlying: PathBuf,
        source: nix::Error,
    },

    #[error(transparent)]
    Nix(#[from] nix::Error),

    #[error(transparent)]
    IO(#[from] io::Error),

    #[error("{0}")]
    String(String),
}

impl Error {
    /// The errno equivalent of this error, if it has one.
    ///
    /// Callers serving the kernel map `None` to `EIO` after logging; the
    /// configuration variants intentionally have no errno because they never
    /// come out of a file system operation.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Nix(errno) => Some(*errno as i32),
            Error::IO(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
