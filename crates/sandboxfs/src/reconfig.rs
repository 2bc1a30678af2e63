// Copyright (c) Contributors to the sandboxfs project.
// SPDX-License-Identifier: Apache-2.0

//! Live reconfiguration of the served tree.
//!
//! Commands arrive as newline-framed JSON records, one per line, so a
//! reader can find record boundaries without understanding record contents.
//! Each command is answered with a single status line on the output stream:
//! `ok`, or `error: <message>`.

use std::ffi::OsStr;
use std::io;
use std::sync::Arc;

use fuser::FUSE_ROOT_ID;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::fuse::Filesystem;
use crate::mapping::Mapping;
use crate::nodes::Node;
use crate::{Error, Result};

/// The kernel cache invalidation surface used after a tree swap.
///
/// Abstracted from [`fuser::Notifier`] so the engine can run against plain
/// buffers in tests.
pub trait Invalidator: Send + Sync {
    fn inval_inode(&self, ino: u64) -> io::Result<()>;
    fn inval_entry(&self, parent: u64, name: &OsStr) -> io::Result<()>;
}

impl Invalidator for fuser::Notifier {
    fn inval_inode(&self, ino: u64) -> io::Result<()> {
        fuser::Notifier::inval_inode(self, ino, 0, 0)
    }

    fn inval_entry(&self, parent: u64, name: &OsStr) -> io::Result<()> {
        fuser::Notifier::inval_entry(self, parent, name)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum Command {
    /// Installs a new tree built from the given mapping list.
    Apply { mappings: Vec<Mapping> },
    /// Installs an empty scaffold tree.
    Clear,
}

/// Consumes reconfiguration commands from `input` until it is exhausted,
/// writing one status line per command to `output`.
pub async fn run<R, W>(
    fs: Arc<Filesystem>,
    invalidator: Arc<dyn Invalidator>,
    input: R,
    mut output: W,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = BufReader::new(input).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let status = match apply_command(&fs, invalidator.as_ref(), &line) {
            Ok(()) => "ok\n".to_owned(),
            Err(err) => format!("error: {err}\n"),
        };
        output.write_all(status.as_bytes()).await?;
        output.flush().await?;
    }
    tracing::debug!("reconfiguration input exhausted");
    Ok(())
}

/// Parses and executes one command. The returned error becomes the status
/// line; the live tree is untouched unless the swap actually happened.
fn apply_command(fs: &Filesystem, invalidator: &dyn Invalidator, line: &str) -> Result<()> {
    let command: Command = serde_json::from_str(line)
        .map_err(|err| Error::String(format!("invalid command: {err}")))?;
    let mappings = match command {
        Command::Apply { mappings } => mappings,
        Command::Clear => Vec::new(),
    };

    // Build the replacement offline: a build failure must leave the
    // current tree serving.
    let new_top = fs.build_tree(&mappings)?;
    let old_top = fs.root().reconfigure(Arc::clone(&new_top));

    // The swap already happened, so from here on the reconfiguration has
    // succeeded: invalidation problems are logged and swallowed. The root
    // lock is not held across any of these calls, which re-enter the file
    // system from the kernel side.
    invalidate_tree_swap(invalidator, &old_top, &new_top);
    Ok(())
}

/// Evicts kernel cache entries made stale by a tree swap: names under the
/// old top-level directory that may no longer exist, then names under the
/// new one for which the kernel may hold negative lookups.
fn invalidate_tree_swap(invalidator: &dyn Invalidator, old_top: &Node, new_top: &Node) {
    if let Err(err) = invalidator.inval_inode(FUSE_ROOT_ID) {
        tracing::warn!("could not invalidate root: {err}");
    }
    for dir in [old_top, new_top] {
        let names = match dir.entry_names() {
            Ok(names) => names,
            Err(err) => {
                tracing::warn!("could not list directory for invalidation: {err}");
                continue;
            }
        };
        for name in names {
            if let Err(err) = invalidator.inval_entry(FUSE_ROOT_ID, &name) {
                // Common and harmless: the kernel may have nothing cached
                // under this name.
                tracing::debug!(?name, "entry invalidation failed: {err}");
            }
        }
    }
}

#[cfg(test)]
#[path = "./reconfig_test.rs"]
mod reconfig_test;
