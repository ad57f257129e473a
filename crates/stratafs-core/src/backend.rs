// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The backend contract
//!
//! A backend is a concrete store spliced into the namespace at a mount
//! point. The VFS hands it backend-local paths (always absolute, always
//! normalized) and never asks it to resolve symlinks; link traversal is the
//! VFS's job. Every operation has an async form and a non-suspending
//! `*_sync` twin: the async surface of the VFS uses the former, the blocking
//! surface the latter.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, FsResult};
use crate::flags::OpenFlags;
use crate::stats::Stats;

/// Optional capabilities a backend may advertise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendFeature {
    /// The backend applies setuid/setgid inheritance itself; the VFS will
    /// not compute inherited ownership on create.
    Setid,
}

/// Static description of a backend.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackendMetadata {
    pub name: String,
    pub readonly: bool,
    pub features: Vec<BackendFeature>,
    pub total_space: u64,
    pub free_space: u64,
}

impl BackendMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            readonly: false,
            features: Vec::new(),
            total_space: 0,
            free_space: 0,
        }
    }

    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    pub fn with_feature(mut self, feature: BackendFeature) -> Self {
        self.features.push(feature);
        self
    }

    pub fn has_feature(&self, feature: BackendFeature) -> bool {
        self.features.contains(&feature)
    }
}

/// Ownership applied to newly created nodes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

/// An open file within a backend.
///
/// Handles use interior mutability: all methods take `&self` so boxed
/// handles can be shared behind the FD table. A closed handle fails every
/// operation with `EBADF`; `close` itself is idempotent.
impl std::fmt::Debug for dyn FsFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn FsFile")
    }
}

#[async_trait]
pub trait FsFile: Send + Sync {
    async fn stat(&self) -> FsResult<Stats>;
    fn stat_sync(&self) -> FsResult<Stats>;

    /// Read up to `buf.len()` bytes at `position`. Returns the count read;
    /// zero at or past end of file.
    async fn read(&self, buf: &mut [u8], position: u64) -> FsResult<usize>;
    fn read_sync(&self, buf: &mut [u8], position: u64) -> FsResult<usize>;

    /// Write `data` at `position`, extending the file as needed.
    async fn write(&self, data: &[u8], position: u64) -> FsResult<usize>;
    fn write_sync(&self, data: &[u8], position: u64) -> FsResult<usize>;

    async fn truncate(&self, size: u64) -> FsResult<()>;
    fn truncate_sync(&self, size: u64) -> FsResult<()>;

    async fn chmod(&self, mode: u32) -> FsResult<()>;
    fn chmod_sync(&self, mode: u32) -> FsResult<()>;

    async fn chown(&self, uid: u32, gid: u32) -> FsResult<()>;
    fn chown_sync(&self, uid: u32, gid: u32) -> FsResult<()>;

    async fn utimes(&self, atime_ms: i64, mtime_ms: i64) -> FsResult<()>;
    fn utimes_sync(&self, atime_ms: i64, mtime_ms: i64) -> FsResult<()>;

    /// Flush data and metadata to the backing store.
    async fn sync(&self) -> FsResult<()>;
    fn sync_sync(&self) -> FsResult<()>;

    /// Flush data only. Defaults to a full sync.
    async fn datasync(&self) -> FsResult<()> {
        self.sync().await
    }
    fn datasync_sync(&self) -> FsResult<()> {
        self.sync_sync()
    }

    async fn close(&self) -> FsResult<()>;
    fn close_sync(&self) -> FsResult<()>;
}

/// The filesystem backend contract.
///
/// Paths are backend-local: `/` is the backend's own root regardless of
/// where it is mounted. Implementations must be safe to call concurrently;
/// composed-operation atomicity is provided by wrapping the backend in
/// [`MutexedFs`](crate::mutex::MutexedFs), not by the backend itself.
#[async_trait]
pub trait FileSystem: Send + Sync {
    fn metadata(&self) -> BackendMetadata;

    /// One-time readiness hook, awaited when the backend is mounted.
    async fn ready(&self) -> FsResult<()> {
        Ok(())
    }
    fn ready_sync(&self) -> FsResult<()> {
        Ok(())
    }

    async fn stat(&self, path: &str) -> FsResult<Stats>;
    fn stat_sync(&self, path: &str) -> FsResult<Stats>;

    async fn open_file(&self, path: &str, flags: OpenFlags) -> FsResult<Box<dyn FsFile>>;
    fn open_file_sync(&self, path: &str, flags: OpenFlags) -> FsResult<Box<dyn FsFile>>;

    /// Create `path` and open it. `mode` carries both type and permission
    /// bits (a bare permission mode means a regular file).
    async fn create_file(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: u32,
        owner: Owner,
    ) -> FsResult<Box<dyn FsFile>>;
    fn create_file_sync(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: u32,
        owner: Owner,
    ) -> FsResult<Box<dyn FsFile>>;

    async fn exists(&self, path: &str) -> FsResult<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
    fn exists_sync(&self, path: &str) -> FsResult<bool> {
        match self.stat_sync(path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> FsResult<()>;
    fn rename_sync(&self, from: &str, to: &str) -> FsResult<()>;

    async fn unlink(&self, path: &str) -> FsResult<()>;
    fn unlink_sync(&self, path: &str) -> FsResult<()>;

    async fn rmdir(&self, path: &str) -> FsResult<()>;
    fn rmdir_sync(&self, path: &str) -> FsResult<()>;

    /// Create a directory. `mode` carries permission bits only.
    async fn mkdir(&self, path: &str, mode: u32, owner: Owner) -> FsResult<()>;
    fn mkdir_sync(&self, path: &str, mode: u32, owner: Owner) -> FsResult<()>;

    /// Basenames of the entries of `path`, in whatever order the store
    /// yields them.
    async fn readdir(&self, path: &str) -> FsResult<Vec<String>>;
    fn readdir_sync(&self, path: &str) -> FsResult<Vec<String>>;

    /// Hard-link `link_path` to the node at `target`.
    async fn link(&self, target: &str, link_path: &str) -> FsResult<()>;
    fn link_sync(&self, target: &str, link_path: &str) -> FsResult<()>;

    /// Write a whole-file image: create or replace `path` with `data` and
    /// the given stats. The parent directory must exist.
    async fn sync(&self, path: &str, data: &[u8], stats: &Stats) -> FsResult<()>;
    fn sync_sync(&self, path: &str, data: &[u8], stats: &Stats) -> FsResult<()>;
}
