// Copyright (c) Contributors to the sandboxfs project.
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};

use rstest::rstest;

use super::Mapping;
use crate::Error;

#[rstest]
fn test_new_ok() {
    let mapping = Mapping::new(PathBuf::from("/foo/bar"), PathBuf::from("/bar/baz"), false).unwrap();
    assert_eq!(Path::new("/foo/bar"), mapping.path());
    assert_eq!(Path::new("/bar/baz"), mapping.underlying_path());
    assert!(!mapping.writable());
}

#[rstest]
fn test_new_path_is_not_absolute() {
    let err = Mapping::new(PathBuf::from("foo"), PathBuf::from("/bar"), false).unwrap_err();
    assert!(matches!(
        err,
        Error::PathNotAbsolute { path } if path == Path::new("foo")
    ));
}

#[rstest]
#[case::dotdot("/foo/../bar")]
#[case::dot("/foo/./bar")]
#[case::double_slash("/foo//bar")]
fn test_new_path_is_not_normalized(#[case] path: &str) {
    let err = Mapping::new(PathBuf::from(path), PathBuf::from("/bar"), false).unwrap_err();
    assert!(matches!(err, Error::PathNotNormalized { .. }), "got {err:?}");
}

#[rstest]
fn test_new_underlying_path_is_not_absolute() {
    let err = Mapping::new(PathBuf::from("/foo"), PathBuf::from("bar"), false).unwrap_err();
    assert!(matches!(
        err,
        Error::PathNotAbsolute { path } if path == Path::new("bar")
    ));
}

#[rstest]
fn test_is_root() {
    let irrelevant = PathBuf::from("/some/place");
    let root = Mapping::new(PathBuf::from("/"), irrelevant.clone(), false).unwrap();
    assert!(root.is_root());
    let nested = Mapping::new(PathBuf::from("/a"), irrelevant, false).unwrap();
    assert!(!nested.is_root());
}

#[rstest]
#[case::read_only("ro:/a:/b", false)]
#[case::read_write("rw:/a:/b", true)]
fn test_from_str_ok(#[case] spec: &str, #[case] writable: bool) {
    let mapping: Mapping = spec.parse().unwrap();
    assert_eq!(Path::new("/a"), mapping.path());
    assert_eq!(Path::new("/b"), mapping.underlying_path());
    assert_eq!(writable, mapping.writable());
}

#[rstest]
fn test_from_str_target_may_contain_colons() {
    let mapping: Mapping = "ro:/a:/b:c".parse().unwrap();
    assert_eq!(Path::new("/b:c"), mapping.underlying_path());
}

#[rstest]
#[case::bad_mode("rx:/a:/b")]
#[case::empty_mode(":/a:/b")]
#[case::one_field("ro")]
#[case::two_fields("ro:/a")]
fn test_from_str_malformed(#[case] spec: &str) {
    let err = spec.parse::<Mapping>().unwrap_err();
    assert!(matches!(err, Error::MalformedMapping { .. }), "got {err:?}");
}

#[rstest]
fn test_from_str_validates_paths() {
    let err = "ro:a:/b".parse::<Mapping>().unwrap_err();
    assert!(matches!(err, Error::PathNotAbsolute { .. }));
}

#[rstest]
fn test_display_round_trips() {
    for spec in ["ro:/a:/b", "rw:/x/y:/tmp/z"] {
        let mapping: Mapping = spec.parse().unwrap();
        assert_eq!(spec, mapping.to_string());
    }
}

#[rstest]
fn test_deserialize_validates() {
    let mapping: Mapping = serde_json::from_str(
        r#"{"path": "/a", "underlying_path": "/b", "writable": true}"#,
    )
    .unwrap();
    assert!(mapping.writable());

    serde_json::from_str::<Mapping>(r#"{"path": "a", "underlying_path": "/b", "writable": true}"#)
        .expect_err("relative synthetic path should be rejected");
}
