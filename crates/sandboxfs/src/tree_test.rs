// Copyright (c) Contributors to the sandboxfs project.
// SPDX-License-Identifier: Apache-2.0

use std::ffi::OsStr;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use fuser::FileType;
use rstest::rstest;
use tempfile::TempDir;

use super::build;
use crate::mapping::Mapping;
use crate::nodes::{Cache, IdGenerator, Node};
use crate::Error;

struct Fixture {
    ids: IdGenerator,
    cache: Cache,
    tmp: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Fixture {
            ids: IdGenerator::new(2),
            cache: Cache::default(),
            tmp: tempfile::tempdir().unwrap(),
        }
    }

    fn dir(&self, name: &str) -> PathBuf {
        let path = self.tmp.path().join(name);
        fs::create_dir_all(&path).unwrap();
        path
    }

    fn file(&self, name: &str) -> PathBuf {
        let path = self.tmp.path().join(name);
        fs::write(&path, b"").unwrap();
        path
    }

    fn build(&self, mappings: &[Mapping]) -> crate::Result<Arc<Node>> {
        build(mappings, &self.ids, nix::unistd::geteuid(), nix::unistd::getegid())
    }

    fn lookup(&self, node: &Node, name: &str) -> Arc<Node> {
        node.lookup(OsStr::new(name), &self.ids, &self.cache)
            .unwrap()
            .0
    }
}

fn ro(path: &str, target: &std::path::Path) -> Mapping {
    Mapping::new(PathBuf::from(path), target.to_path_buf(), false).unwrap()
}

fn rw(path: &str, target: &std::path::Path) -> Mapping {
    Mapping::new(PathBuf::from(path), target.to_path_buf(), true).unwrap()
}

#[rstest]
fn test_empty_mappings_yield_scaffold_root() {
    let fixture = Fixture::new();
    let root = fixture.build(&[]).unwrap();
    assert!(matches!(*root, Node::Scaffold(_)));
    assert!(root.entries(&fixture.ids, &fixture.cache).unwrap().is_empty());
}

#[rstest]
fn test_root_mapping_becomes_the_root() {
    let fixture = Fixture::new();
    let target = fixture.dir("target");
    fs::write(target.join("inner"), b"").unwrap();

    let root = fixture.build(&[ro("/", &target)]).unwrap();
    assert!(matches!(*root, Node::Mapped(_)));
    assert!(!root.writable());
    let inner = fixture.lookup(&root, "inner");
    assert_eq!(FileType::RegularFile, inner.file_type());
}

#[rstest]
fn test_scaffolding_fill_for_intermediate_components() {
    let fixture = Fixture::new();
    let target = fixture.dir("target");

    let root = fixture.build(&[ro("/a/b/c", &target)]).unwrap();
    assert!(matches!(*root, Node::Scaffold(_)));

    let a = fixture.lookup(&root, "a");
    assert!(matches!(*a, Node::Scaffold(_)));
    let b = fixture.lookup(&a, "b");
    assert!(matches!(*b, Node::Scaffold(_)));
    let c = fixture.lookup(&b, "c");
    assert!(matches!(*c, Node::Mapped(_)));
    assert!(c.is_dir());
}

#[rstest]
fn test_scaffold_promotion_adopts_children() {
    let fixture = Fixture::new();
    let deep = fixture.dir("deep");
    let shallow = fixture.dir("shallow");
    fs::write(shallow.join("native"), b"").unwrap();

    let root = fixture
        .build(&[ro("/a/b", &deep), rw("/a", &shallow)])
        .unwrap();

    let a = fixture.lookup(&root, "a");
    assert!(matches!(*a, Node::Mapped(_)));
    assert!(a.writable());

    // The promoted directory serves both the graft and its own entries.
    let b = fixture.lookup(&a, "b");
    assert!(matches!(*b, Node::Mapped(_)));
    let names: Vec<_> = a
        .entries(&fixture.ids, &fixture.cache)
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect();
    assert_eq!(vec!["b", "native"], names);
}

#[rstest]
fn test_root_scaffold_can_be_promoted_later() {
    let fixture = Fixture::new();
    let sub = fixture.dir("sub");
    let top = fixture.dir("top");

    let root = fixture.build(&[ro("/a", &sub), rw("/", &top)]).unwrap();
    assert!(matches!(*root, Node::Mapped(_)));
    assert!(root.writable());
    let a = fixture.lookup(&root, "a");
    assert!(matches!(*a, Node::Mapped(_)));
}

#[rstest]
fn test_duplicate_mapping() {
    let fixture = Fixture::new();
    let target = fixture.dir("target");

    let err = fixture
        .build(&[ro("/a/a", &target), ro("/a/a", &target)])
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyMapped { .. }));
    let message = err.to_string();
    assert!(message.contains("/a/a"), "got {message}");
    assert!(message.contains("already mapped"), "got {message}");
}

#[rstest]
fn test_duplicate_root_mapping() {
    let fixture = Fixture::new();
    let target = fixture.dir("target");
    let err = fixture
        .build(&[ro("/", &target), ro("/", &target)])
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyMapped { .. }));
}

#[rstest]
fn test_file_mapped_over_scaffold_directory() {
    let fixture = Fixture::new();
    let dir = fixture.dir("dir");
    let file = fixture.file("file");

    let err = fixture
        .build(&[ro("/a/b/c", &dir), ro("/a", &file)])
        .unwrap_err();
    assert!(matches!(err, Error::FileOverDirectory { .. }));
    let message = err.to_string();
    assert!(message.contains("/a"), "got {message}");
    assert!(message.contains("file mapped over existing directory"), "got {message}");
}

#[rstest]
fn test_mapped_leaf_cannot_gain_children() {
    let fixture = Fixture::new();
    let file = fixture.file("file");
    let dir = fixture.dir("dir");

    let err = fixture
        .build(&[ro("/a", &file), ro("/a/b", &dir)])
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyMapped { .. }));
}

#[rstest]
fn test_root_must_be_a_directory() {
    let fixture = Fixture::new();
    let file = fixture.file("file");

    let err = fixture.build(&[ro("/", &file)]).unwrap_err();
    let message = err.to_string();
    assert!(matches!(err, Error::NotADirectory { .. }));
    assert!(message.contains("file"), "got {message}");
    assert!(message.contains("not a directory"), "got {message}");
}

#[rstest]
fn test_stat_failure_is_fatal_and_names_the_target() {
    let fixture = Fixture::new();
    let missing = fixture.tmp.path().join("non-existent");

    let err = fixture.build(&[ro("/a", &missing)]).unwrap_err();
    assert!(matches!(err, Error::StatFailed { .. }));
    let message = err.to_string();
    assert!(message.contains("stat"), "got {message}");
    assert!(message.contains("non-existent"), "got {message}");
}

#[rstest]
fn test_writability_is_per_mapping() {
    let fixture = Fixture::new();
    let a = fixture.dir("a");
    let b = fixture.dir("b");

    let root = fixture.build(&[rw("/rw", &a), ro("/ro", &b)]).unwrap();
    assert!(fixture.lookup(&root, "rw").writable());
    assert!(!fixture.lookup(&root, "ro").writable());
}

#[rstest]
fn test_mapping_kinds_follow_their_targets() {
    let fixture = Fixture::new();
    let dir = fixture.dir("dir");
    let file = fixture.file("file");
    let link = fixture.tmp.path().join("link");
    std::os::unix::fs::symlink("file", &link).unwrap();

    let root = fixture
        .build(&[ro("/d", &dir), ro("/f", &file), ro("/l", &link)])
        .unwrap();
    assert_eq!(FileType::Directory, fixture.lookup(&root, "d").file_type());
    assert_eq!(FileType::RegularFile, fixture.lookup(&root, "f").file_type());
    assert_eq!(FileType::Symlink, fixture.lookup(&root, "l").file_type());
}

#[rstest]
fn test_identifiers_are_not_reused_across_builds() {
    let fixture = Fixture::new();
    let target = fixture.dir("target");

    let first = fixture.build(&[ro("/a", &target)]).unwrap();
    let second = fixture.build(&[ro("/a", &target)]).unwrap();

    let first_inos = [first.ino(), fixture.lookup(&first, "a").ino()];
    let second_inos = [second.ino(), fixture.lookup(&second, "a").ino()];
    for ino in first_inos {
        assert!(!second_inos.contains(&ino));
    }
}
