// Copyright (c) Contributors to the sandboxfs project.
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rstest::rstest;
use tempfile::TempDir;

use super::{run, Invalidator};
use crate::fuse::{Config, Filesystem};
use crate::mapping::Mapping;
use crate::nodes::{Cache, IdGenerator};

/// Records invalidation requests instead of talking to a kernel.
#[derive(Default)]
struct RecordingInvalidator {
    inodes: Mutex<Vec<u64>>,
    entries: Mutex<Vec<(u64, OsString)>>,
}

impl Invalidator for RecordingInvalidator {
    fn inval_inode(&self, ino: u64) -> io::Result<()> {
        self.inodes.lock().unwrap().push(ino);
        Ok(())
    }

    fn inval_entry(&self, parent: u64, name: &OsStr) -> io::Result<()> {
        self.entries.lock().unwrap().push((parent, name.to_owned()));
        Ok(())
    }
}

struct Fixture {
    fs: Arc<Filesystem>,
    invalidator: Arc<RecordingInvalidator>,
    tmp: TempDir,
}

impl Fixture {
    /// A file system initially serving a directory that holds `file-a`.
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let dir_a = tmp.path().join("a");
        fs::create_dir(&dir_a).unwrap();
        fs::write(dir_a.join("file-a"), b"").unwrap();

        let mapping = Mapping::new("/".into(), dir_a, false).unwrap();
        let config = Config {
            uid: nix::unistd::geteuid(),
            gid: nix::unistd::getegid(),
            mount_options: HashSet::new(),
        };
        Fixture {
            fs: Arc::new(Filesystem::new(&[mapping], config).unwrap()),
            invalidator: Arc::new(RecordingInvalidator::default()),
            tmp,
        }
    }

    async fn feed(&self, input: &str) -> String {
        let mut output = Vec::new();
        run(
            Arc::clone(&self.fs),
            Arc::clone(&self.invalidator) as Arc<dyn Invalidator>,
            input.as_bytes(),
            &mut output,
        )
        .await
        .unwrap();
        String::from_utf8(output).unwrap()
    }

    fn root_has_entry(&self, name: &str) -> bool {
        let ids = IdGenerator::new(1 << 32);
        let cache = Cache::default();
        self.fs
            .root()
            .current()
            .lookup(OsStr::new(name), &ids, &cache)
            .is_ok()
    }
}

fn apply_command(target: &Path) -> String {
    format!(
        r#"{{"apply": {{"mappings": [{{"path": "/", "underlying_path": {:?}, "writable": false}}]}}}}"#,
        target.display().to_string(),
    )
}

#[rstest]
#[tokio::test]
async fn test_apply_swaps_the_tree() {
    let fixture = Fixture::new();
    let dir_b = fixture.tmp.path().join("b");
    fs::create_dir(&dir_b).unwrap();
    fs::write(dir_b.join("file-b"), b"").unwrap();

    let output = fixture.feed(&format!("{}\n", apply_command(&dir_b))).await;
    assert_eq!("ok\n", output);

    // A fresh lookup sees only the new tree.
    assert!(fixture.root_has_entry("file-b"));
    assert!(!fixture.root_has_entry("file-a"));
}

#[rstest]
#[tokio::test]
async fn test_apply_invalidates_old_and_new_entries() {
    let fixture = Fixture::new();
    let dir_b = fixture.tmp.path().join("b");
    fs::create_dir(&dir_b).unwrap();
    fs::write(dir_b.join("file-b"), b"").unwrap();

    fixture.feed(&format!("{}\n", apply_command(&dir_b))).await;

    assert_eq!(vec![fuser::FUSE_ROOT_ID], *fixture.invalidator.inodes.lock().unwrap());
    let entries = fixture.invalidator.entries.lock().unwrap();
    let names: Vec<OsString> = entries.iter().map(|(_, name)| name.clone()).collect();
    // Pass one evicts the old names, pass two the new ones.
    assert_eq!(vec!["file-a", "file-b"], names);
    assert!(entries.iter().all(|(parent, _)| *parent == fuser::FUSE_ROOT_ID));
}

#[rstest]
#[tokio::test]
async fn test_build_failure_preserves_the_live_tree() {
    let fixture = Fixture::new();
    let missing = fixture.tmp.path().join("non-existent");

    let output = fixture.feed(&format!("{}\n", apply_command(&missing))).await;
    assert!(output.starts_with("error: "), "got {output:?}");
    assert!(output.contains("stat failed"), "got {output:?}");

    assert!(fixture.root_has_entry("file-a"));
    assert!(fixture.invalidator.inodes.lock().unwrap().is_empty());
}

#[rstest]
#[tokio::test]
async fn test_clear_installs_an_empty_scaffold() {
    let fixture = Fixture::new();

    let output = fixture.feed("\"clear\"\n").await;
    assert_eq!("ok\n", output);
    assert!(!fixture.root_has_entry("file-a"));
}

#[rstest]
#[tokio::test]
async fn test_malformed_command_reports_and_continues() {
    let fixture = Fixture::new();
    let dir_b = fixture.tmp.path().join("b");
    fs::create_dir(&dir_b).unwrap();

    let input = format!("this is not json\n{}\n", apply_command(&dir_b));
    let output = fixture.feed(&input).await;

    let lines: Vec<&str> = output.lines().collect();
    assert_eq!(2, lines.len(), "got {output:?}");
    assert!(lines[0].starts_with("error: invalid command"), "got {output:?}");
    assert_eq!("ok", lines[1]);
}

#[rstest]
#[tokio::test]
async fn test_blank_lines_are_ignored() {
    let fixture = Fixture::new();
    let output = fixture.feed("\n\n").await;
    assert_eq!("", output);
}
