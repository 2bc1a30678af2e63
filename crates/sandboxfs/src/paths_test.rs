// Copyright (c) Contributors to the sandboxfs project.
// SPDX-License-Identifier: Apache-2.0

use std::path::Path;

use rstest::rstest;

use super::{components, validate};
use crate::Error;

#[rstest]
#[case::root("/")]
#[case::simple("/foo")]
#[case::nested("/foo/bar/baz")]
#[case::hidden("/.config")]
fn test_validate_accepts_canonical(#[case] path: &str) {
    validate(Path::new(path)).unwrap();
}

#[rstest]
#[case::relative("foo/bar")]
#[case::empty("")]
#[case::lone_dot(".")]
fn test_validate_rejects_non_absolute(#[case] path: &str) {
    let err = validate(Path::new(path)).unwrap_err();
    assert!(
        matches!(err, Error::PathNotAbsolute { .. }),
        "got {err:?} for {path:?}"
    );
}

#[rstest]
#[case::dot("/a/./b")]
#[case::trailing_dot("/a/.")]
#[case::dotdot("/a/../b")]
#[case::trailing_dotdot("/a/..")]
#[case::double_slash("/a//b")]
#[case::trailing_slash("/a/")]
#[case::many_slashes("///")]
fn test_validate_rejects_non_normalized(#[case] path: &str) {
    let err = validate(Path::new(path)).unwrap_err();
    assert!(
        matches!(err, Error::PathNotNormalized { .. }),
        "got {err:?} for {path:?}"
    );
}

#[rstest]
fn test_components_of_root_is_empty() {
    assert_eq!(0, components(Path::new("/")).count());
}

#[rstest]
fn test_components_yields_names_in_order() {
    let names: Vec<_> = components(Path::new("/foo/bar/baz")).collect();
    assert_eq!(vec!["foo", "bar", "baz"], names);
}
