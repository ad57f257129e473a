// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for stratafs

use std::fmt;
use std::io;

/// POSIX error class carried by every [`FsError`].
#[derive(thiserror::Error, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    #[error("no such file or directory")]
    NotFound,
    #[error("file exists")]
    Exists,
    #[error("permission denied")]
    AccessDenied,
    #[error("operation not permitted")]
    NotPermitted,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("bad file descriptor")]
    BadFileDescriptor,
    #[error("is a directory")]
    IsDirectory,
    #[error("not a directory")]
    NotDirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("cross-device link")]
    CrossDevice,
    #[error("resource busy or locked")]
    Busy,
    #[error("resource deadlock would occur")]
    Deadlock,
    #[error("no space left on device")]
    NoSpace,
    #[error("file too large")]
    FileTooLarge,
    #[error("function not implemented")]
    NotImplemented,
    #[error("operation not supported")]
    NotSupported,
    #[error("too many levels of symbolic links")]
    SymlinkLoop,
    #[error("input/output error")]
    Io,
}

impl ErrorKind {
    /// The POSIX mnemonic (`"ENOENT"`, ...).
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "ENOENT",
            ErrorKind::Exists => "EEXIST",
            ErrorKind::AccessDenied => "EACCES",
            ErrorKind::NotPermitted => "EPERM",
            ErrorKind::InvalidArgument => "EINVAL",
            ErrorKind::BadFileDescriptor => "EBADF",
            ErrorKind::IsDirectory => "EISDIR",
            ErrorKind::NotDirectory => "ENOTDIR",
            ErrorKind::NotEmpty => "ENOTEMPTY",
            ErrorKind::CrossDevice => "EXDEV",
            ErrorKind::Busy => "EBUSY",
            ErrorKind::Deadlock => "EDEADLK",
            ErrorKind::NoSpace => "ENOSPC",
            ErrorKind::FileTooLarge => "EFBIG",
            ErrorKind::NotImplemented => "ENOSYS",
            ErrorKind::NotSupported => "ENOTSUP",
            ErrorKind::SymlinkLoop => "ELOOP",
            ErrorKind::Io => "EIO",
        }
    }

    /// The matching errno integer for the host platform.
    pub fn errno(&self) -> i32 {
        match self {
            ErrorKind::NotFound => libc::ENOENT,
            ErrorKind::Exists => libc::EEXIST,
            ErrorKind::AccessDenied => libc::EACCES,
            ErrorKind::NotPermitted => libc::EPERM,
            ErrorKind::InvalidArgument => libc::EINVAL,
            ErrorKind::BadFileDescriptor => libc::EBADF,
            ErrorKind::IsDirectory => libc::EISDIR,
            ErrorKind::NotDirectory => libc::ENOTDIR,
            ErrorKind::NotEmpty => libc::ENOTEMPTY,
            ErrorKind::CrossDevice => libc::EXDEV,
            ErrorKind::Busy => libc::EBUSY,
            ErrorKind::Deadlock => libc::EDEADLK,
            ErrorKind::NoSpace => libc::ENOSPC,
            ErrorKind::FileTooLarge => libc::EFBIG,
            ErrorKind::NotImplemented => libc::ENOSYS,
            ErrorKind::NotSupported => libc::ENOTSUP,
            ErrorKind::SymlinkLoop => libc::ELOOP,
            ErrorKind::Io => libc::EIO,
        }
    }
}

/// Filesystem error: a POSIX kind plus the path and syscall it was raised for.
///
/// The `path` field always holds the user-facing path; backend-local paths
/// are rewritten at the dispatch boundary before an error escapes the VFS.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FsError {
    pub kind: ErrorKind,
    pub path: Option<String>,
    pub syscall: Option<&'static str>,
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            path: None,
            syscall: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_syscall(mut self, syscall: &'static str) -> Self {
        self.syscall = Some(syscall);
        self
    }

    pub fn errno(&self) -> i32 {
        self.kind.errno()
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn not_found(path: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound).with_path(path)
    }

    pub fn exists(path: impl Into<String>) -> Self {
        Self::new(ErrorKind::Exists).with_path(path)
    }

    pub fn access_denied(path: impl Into<String>) -> Self {
        Self::new(ErrorKind::AccessDenied).with_path(path)
    }

    pub fn not_permitted(path: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotPermitted).with_path(path)
    }

    pub fn invalid(path: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument).with_path(path)
    }

    pub fn bad_fd() -> Self {
        Self::new(ErrorKind::BadFileDescriptor)
    }

    pub fn is_directory(path: impl Into<String>) -> Self {
        Self::new(ErrorKind::IsDirectory).with_path(path)
    }

    pub fn not_directory(path: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotDirectory).with_path(path)
    }

    pub fn not_empty(path: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotEmpty).with_path(path)
    }

    pub fn cross_device(path: impl Into<String>) -> Self {
        Self::new(ErrorKind::CrossDevice).with_path(path)
    }

    pub fn busy(path: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy).with_path(path)
    }

    pub fn deadlock(path: impl Into<String>) -> Self {
        Self::new(ErrorKind::Deadlock).with_path(path)
    }

    pub fn symlink_loop(path: impl Into<String>) -> Self {
        Self::new(ErrorKind::SymlinkLoop).with_path(path)
    }

    pub fn not_supported(path: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotSupported).with_path(path)
    }

    /// Rewrite a backend-local `path` to its user-facing form.
    ///
    /// `pairs` is the substitution dictionary computed at the dispatch site;
    /// only exact matches are rewritten, other paths pass through untouched.
    pub fn remap_paths(mut self, pairs: &[(&str, &str)]) -> Self {
        if let Some(p) = &self.path {
            for (local, user) in pairs {
                if p == local {
                    self.path = Some((*user).to_string());
                    break;
                }
            }
        }
        self
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.kind)?;
        if let Some(syscall) = self.syscall {
            write!(f, ", {}", syscall)?;
        }
        if let Some(path) = &self.path {
            write!(f, " '{}'", path)?;
        }
        Ok(())
    }
}

impl std::error::Error for FsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::AlreadyExists => ErrorKind::Exists,
            io::ErrorKind::PermissionDenied => ErrorKind::AccessDenied,
            io::ErrorKind::InvalidInput => ErrorKind::InvalidArgument,
            _ => ErrorKind::Io,
        };
        Self::new(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_errnos_agree() {
        assert_eq!(ErrorKind::NotFound.code(), "ENOENT");
        assert_eq!(ErrorKind::NotFound.errno(), libc::ENOENT);
        assert_eq!(ErrorKind::Deadlock.code(), "EDEADLK");
        assert_eq!(ErrorKind::SymlinkLoop.errno(), libc::ELOOP);
    }

    #[test]
    fn display_includes_context() {
        let err = FsError::not_found("/a/b").with_syscall("open");
        let s = err.to_string();
        assert!(s.contains("ENOENT"));
        assert!(s.contains("open"));
        assert!(s.contains("/a/b"));
    }

    #[test]
    fn remap_rewrites_exact_local_path() {
        let err = FsError::not_found("/x").remap_paths(&[("/x", "/mnt/a/x")]);
        assert_eq!(err.path.as_deref(), Some("/mnt/a/x"));

        let untouched = FsError::not_found("/other").remap_paths(&[("/x", "/mnt/a/x")]);
        assert_eq!(untouched.path.as_deref(), Some("/other"));
    }
}
