// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! High-level handle objects over descriptors

use crate::error::FsResult;
use crate::fd::Fd;
use crate::stats::{Dirent, Stats};
use crate::vfs::Vfs;

/// Object wrapper around an open descriptor. Dropping the handle does not
/// close the descriptor; call [`close`](FileHandle::close).
pub struct FileHandle {
    vfs: Vfs,
    fd: Fd,
}

impl FileHandle {
    pub(crate) fn new(vfs: Vfs, fd: Fd) -> Self {
        Self { vfs, fd }
    }

    pub fn fd(&self) -> Fd {
        self.fd
    }

    pub async fn read(&self, buf: &mut [u8], position: Option<u64>) -> FsResult<usize> {
        self.vfs.read(self.fd, buf, position).await
    }

    pub fn read_sync(&self, buf: &mut [u8], position: Option<u64>) -> FsResult<usize> {
        self.vfs.read_sync(self.fd, buf, position)
    }

    pub async fn write(&self, data: &[u8], position: Option<u64>) -> FsResult<usize> {
        self.vfs.write(self.fd, data, position).await
    }

    pub fn write_sync(&self, data: &[u8], position: Option<u64>) -> FsResult<usize> {
        self.vfs.write_sync(self.fd, data, position)
    }

    pub async fn readv(&self, bufs: &mut [&mut [u8]], position: Option<u64>) -> FsResult<usize> {
        self.vfs.readv(self.fd, bufs, position).await
    }

    pub async fn writev(&self, bufs: &[&[u8]], position: Option<u64>) -> FsResult<usize> {
        self.vfs.writev(self.fd, bufs, position).await
    }

    pub async fn stat(&self) -> FsResult<Stats> {
        self.vfs.fstat(self.fd).await
    }

    pub fn stat_sync(&self) -> FsResult<Stats> {
        self.vfs.fstat_sync(self.fd)
    }

    pub async fn chmod(&self, mode: u32) -> FsResult<()> {
        self.vfs.fchmod(self.fd, mode).await
    }

    pub fn chmod_sync(&self, mode: u32) -> FsResult<()> {
        self.vfs.fchmod_sync(self.fd, mode)
    }

    pub async fn chown(&self, uid: u32, gid: u32) -> FsResult<()> {
        self.vfs.fchown(self.fd, uid, gid).await
    }

    pub fn chown_sync(&self, uid: u32, gid: u32) -> FsResult<()> {
        self.vfs.fchown_sync(self.fd, uid, gid)
    }

    pub async fn utimes(&self, atime_ms: i64, mtime_ms: i64) -> FsResult<()> {
        self.vfs.futimes(self.fd, atime_ms, mtime_ms).await
    }

    pub fn utimes_sync(&self, atime_ms: i64, mtime_ms: i64) -> FsResult<()> {
        self.vfs.futimes_sync(self.fd, atime_ms, mtime_ms)
    }

    pub async fn truncate(&self, size: u64) -> FsResult<()> {
        self.vfs.ftruncate(self.fd, size).await
    }

    pub fn truncate_sync(&self, size: u64) -> FsResult<()> {
        self.vfs.ftruncate_sync(self.fd, size)
    }

    pub async fn sync(&self) -> FsResult<()> {
        self.vfs.fsync(self.fd).await
    }

    pub fn sync_sync(&self) -> FsResult<()> {
        self.vfs.fsync_sync(self.fd)
    }

    pub async fn datasync(&self) -> FsResult<()> {
        self.vfs.fdatasync(self.fd).await
    }

    pub fn datasync_sync(&self) -> FsResult<()> {
        self.vfs.fdatasync_sync(self.fd)
    }

    /// Close the descriptor. Consumes the handle.
    pub async fn close(self) -> FsResult<()> {
        self.vfs.close(self.fd).await
    }

    pub fn close_sync(self) -> FsResult<()> {
        self.vfs.close_sync(self.fd)
    }
}

/// Directory cursor from [`Vfs::opendir`]: a snapshot of the entries with a
/// read position.
pub struct Dir {
    path: String,
    entries: Vec<Dirent>,
    position: usize,
}

impl Dir {
    pub(crate) fn new(path: String, entries: Vec<Dirent>) -> Self {
        Self {
            path,
            entries,
            position: 0,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// The next entry, or `None` at the end.
    pub fn read(&mut self) -> Option<Dirent> {
        let entry = self.entries.get(self.position).cloned();
        if entry.is_some() {
            self.position += 1;
        }
        entry
    }

    pub fn rewind(&mut self) {
        self.position = 0;
    }

    pub fn close(self) {}
}

impl Iterator for Dir {
    type Item = Dirent;

    fn next(&mut self) -> Option<Dirent> {
        self.read()
    }
}
