// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Lexical path utilities
//!
//! Everything here is purely textual; `realpath` (which does I/O) lives on
//! the VFS. Paths are absolute, `/`-separated, and collapsed: no `.`, `..`,
//! or repeated slashes survive normalization.

use crate::error::{FsError, FsResult};

/// Normalize a path: reject empty strings and NUL bytes, root relative
/// input at `/`, and resolve `.` / `..` / `//` without touching storage.
pub fn normalize(path: &str) -> FsResult<String> {
    if path.is_empty() {
        return Err(FsError::invalid(path));
    }
    if path.as_bytes().contains(&0) {
        return Err(FsError::invalid(path.replace('\0', "\\0")));
    }

    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }

    if parts.is_empty() {
        return Ok("/".to_string());
    }
    let mut out = String::with_capacity(path.len());
    for part in parts {
        out.push('/');
        out.push_str(part);
    }
    Ok(out)
}

/// The directory portion of a normalized path. `dirname("/a/b") == "/a"`,
/// `dirname("/a") == "/"`, `dirname("/") == "/"`.
pub fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

/// The final component of a normalized path; empty for the root.
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

/// Join `rel` onto `base`. An absolute `rel` replaces `base` entirely.
pub fn join(base: &str, rel: &str) -> FsResult<String> {
    if rel.starts_with('/') {
        normalize(rel)
    } else {
        normalize(&format!("{}/{}", base, rel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses() {
        assert_eq!(normalize("/a//b/./c").unwrap(), "/a/b/c");
        assert_eq!(normalize("/a/b/../c").unwrap(), "/a/c");
        assert_eq!(normalize("/../..").unwrap(), "/");
        assert_eq!(normalize("/").unwrap(), "/");
        assert_eq!(normalize("a/b").unwrap(), "/a/b");
    }

    #[test]
    fn normalize_is_idempotent() {
        for p in ["/a//b/../c/.", "x/y/z", "/", "//", "/.."] {
            let once = normalize(p).unwrap();
            assert_eq!(normalize(&once).unwrap(), once);
            assert!(!once.contains("//"));
            assert!(once.starts_with('/'));
        }
    }

    #[test]
    fn normalize_rejects_bad_input() {
        assert!(normalize("").is_err());
        assert!(normalize("/a\0b").is_err());
    }

    #[test]
    fn dirname_basename() {
        assert_eq!(dirname("/a/b/c"), "/a/b");
        assert_eq!(dirname("/a"), "/");
        assert_eq!(dirname("/"), "/");
        assert_eq!(basename("/a/b"), "b");
        assert_eq!(basename("/"), "");
    }

    #[test]
    fn join_handles_absolute_and_relative() {
        assert_eq!(join("/a/b", "c").unwrap(), "/a/b/c");
        assert_eq!(join("/a/b", "../c").unwrap(), "/a/c");
        assert_eq!(join("/a/b", "/x/y").unwrap(), "/x/y");
    }
}
