// Copyright (c) Contributors to the sandboxfs project.
// SPDX-License-Identifier: Apache-2.0

//! Stable identity for the mount root.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;

use crate::nodes::Node;

/// The node at the root of the file system.
///
/// The root cannot simply be the top-level directory because of
/// reconfigurations: the contents and even the flavor of the top directory
/// may change (say, from a mapped directory to a scaffold one), but the
/// kernel offers no way to replace node 1 with another node. The root
/// therefore wraps whichever directory is currently installed, and the
/// kernel never learns about the backing node's own identity.
///
/// The installed pointer is an atomically swappable handle rather than a
/// lock: operation-serving paths grab the current directory without ever
/// waiting on a swapper, so a reconfiguration under contention cannot
/// starve readers. The only exclusion needed is between a swap and the
/// root's own readdir drain, which `swap_lock` provides.
pub struct Root {
    dir: ArcSwap<Node>,
    swap_lock: Mutex<()>,
}

impl Root {
    pub fn new(dir: Arc<Node>) -> Self {
        Root {
            dir: ArcSwap::new(dir),
            swap_lock: Mutex::new(()),
        }
    }

    /// The currently installed top-level directory.
    ///
    /// Callers keep serving whatever tree was installed when they grabbed
    /// the reference; a concurrent reconfiguration does not wait for them.
    pub fn current(&self) -> Arc<Node> {
        self.dir.load_full()
    }

    /// Installs `new_dir` as the top-level directory and returns the
    /// previous one.
    ///
    /// This swap is the linearization point of a reconfiguration. It cannot
    /// stop in-flight operations, nor hold new ones back until they drain:
    /// requests are already in the kernel by the time we see them, and
    /// waiting would deadlock against cache invalidations that re-enter the
    /// file system. Operations started against the old tree simply run to
    /// completion there. Callers are expected to reconfigure only while the
    /// file system is quiescent.
    pub fn reconfigure(&self, new_dir: Arc<Node>) -> Arc<Node> {
        let _guard = self.swap_lock.lock().unwrap();
        self.dir.swap(new_dir)
    }

    /// Runs `op` against the installed directory under the exclusive lease.
    ///
    /// The root's readdir path goes through here: the listing is drained
    /// from whichever directory is current for the whole duration, so a
    /// concurrent reconfiguration produces either the old or the new
    /// listing, never a mix.
    pub fn with_exclusive<T>(&self, op: impl FnOnce(&Arc<Node>) -> T) -> T {
        let _guard = self.swap_lock.lock().unwrap();
        let dir = self.dir.load_full();
        op(&dir)
    }
}

#[cfg(test)]
#[path = "./root_test.rs"]
mod root_test;
