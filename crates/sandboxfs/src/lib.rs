// Copyright (c) Contributors to the sandboxfs project.
// SPDX-License-Identifier: Apache-2.0

//! Sandbox file system composition and serving.
//!
//! A sandboxfs instance exposes a synthetic directory tree assembled from
//! arbitrary subtrees of the host file system. Each graft ("mapping") is
//! either read-only or read-write, and the composed tree is served to the
//! kernel over FUSE. The installed tree can be replaced atomically at
//! runtime through the reconfiguration engine.

mod error;
pub mod fuse;
pub mod mapping;
pub mod nodes;
pub mod paths;
pub mod reconfig;
pub mod root;
pub mod tree;

pub use error::{Error, Result};
pub use fuse::{Config, Filesystem, Session};
pub use mapping::Mapping;
pub use root::Root;
