// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-backend serialization adapter
//!
//! [`MutexedFs`] wraps any backend and funnels every call through a single
//! queue lock, so the wrapped backend sees at most one operation in flight
//! and composed operations built on it are atomic. The lock covers the whole
//! backend; the `path`/`syscall` arguments on [`lock`](MutexedFs::lock) are
//! diagnostics only. Waiters acquire strictly in arrival order.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::backend::{BackendMetadata, FileSystem, FsFile, Owner};
use crate::error::{FsError, FsResult};
use crate::flags::OpenFlags;
use crate::stats::Stats;

/// Options for [`MutexedFs`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MutexOptions {
    /// How long a queued acquisition may wait before it is reported as a
    /// suspected deadlock. Diagnostic, not a correctness mechanism.
    pub deadline: Duration,
}

impl Default for MutexOptions {
    fn default() -> Self {
        Self {
            deadline: Duration::from_secs(5),
        }
    }
}

impl MutexOptions {
    pub fn validate(&self) -> FsResult<()> {
        if self.deadline.is_zero() {
            return Err(FsError::invalid("mutex deadline must be non-zero"));
        }
        Ok(())
    }
}

/// A held queue lock. Releases on [`unlock`](LockGuard::unlock) or drop.
#[derive(Debug)]
pub struct LockGuard {
    _guard: OwnedMutexGuard<()>,
    path: String,
    syscall: &'static str,
}

impl LockGuard {
    pub fn unlock(self) {}

    /// The path this lock was requested for (diagnostic).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The syscall this lock was requested for (diagnostic).
    pub fn syscall(&self) -> &'static str {
        self.syscall
    }
}

/// Serializing wrapper around a backend.
pub struct MutexedFs {
    inner: Arc<dyn FileSystem>,
    lock: Arc<Mutex<()>>,
    deadline: Duration,
}

impl MutexedFs {
    pub fn new(inner: Arc<dyn FileSystem>) -> Self {
        Self::with_options(inner, MutexOptions::default()).expect("default options are valid")
    }

    pub fn with_options(inner: Arc<dyn FileSystem>, options: MutexOptions) -> FsResult<Self> {
        options.validate()?;
        Ok(Self {
            inner,
            lock: Arc::new(Mutex::new(())),
            deadline: options.deadline,
        })
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &Arc<dyn FileSystem> {
        &self.inner
    }

    /// Queue for the lock and wait until every earlier holder releases.
    /// Fails `EDEADLK` if the wait outlives the configured deadline.
    pub async fn lock(&self, path: &str, syscall: &'static str) -> FsResult<LockGuard> {
        match tokio::time::timeout(self.deadline, self.lock.clone().lock_owned()).await {
            Ok(guard) => Ok(LockGuard {
                _guard: guard,
                path: path.to_string(),
                syscall,
            }),
            Err(_) => {
                debug!(path, syscall, deadline_ms = self.deadline.as_millis() as u64,
                    "lock held past deadline");
                Err(FsError::deadlock(path).with_syscall(syscall))
            }
        }
    }

    /// Take the lock only if nobody holds it; fails `EBUSY` otherwise.
    pub fn lock_sync(&self, path: &str, syscall: &'static str) -> FsResult<LockGuard> {
        match self.lock.clone().try_lock_owned() {
            Ok(guard) => Ok(LockGuard {
                _guard: guard,
                path: path.to_string(),
                syscall,
            }),
            Err(_) => Err(FsError::busy(path).with_syscall(syscall)),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.lock.try_lock().is_err()
    }
}

#[async_trait]
impl FileSystem for MutexedFs {
    fn metadata(&self) -> BackendMetadata {
        self.inner.metadata()
    }

    async fn ready(&self) -> FsResult<()> {
        let _guard = self.lock("/", "ready").await?;
        self.inner.ready().await
    }
    fn ready_sync(&self) -> FsResult<()> {
        let _guard = self.lock_sync("/", "ready")?;
        self.inner.ready_sync()
    }

    async fn stat(&self, path: &str) -> FsResult<Stats> {
        let _guard = self.lock(path, "stat").await?;
        self.inner.stat(path).await
    }
    fn stat_sync(&self, path: &str) -> FsResult<Stats> {
        let _guard = self.lock_sync(path, "stat")?;
        self.inner.stat_sync(path)
    }

    async fn open_file(&self, path: &str, flags: OpenFlags) -> FsResult<Box<dyn FsFile>> {
        let _guard = self.lock(path, "open").await?;
        self.inner.open_file(path, flags).await
    }
    fn open_file_sync(&self, path: &str, flags: OpenFlags) -> FsResult<Box<dyn FsFile>> {
        let _guard = self.lock_sync(path, "open")?;
        self.inner.open_file_sync(path, flags)
    }

    async fn create_file(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: u32,
        owner: Owner,
    ) -> FsResult<Box<dyn FsFile>> {
        let _guard = self.lock(path, "open").await?;
        self.inner.create_file(path, flags, mode, owner).await
    }
    fn create_file_sync(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: u32,
        owner: Owner,
    ) -> FsResult<Box<dyn FsFile>> {
        let _guard = self.lock_sync(path, "open")?;
        self.inner.create_file_sync(path, flags, mode, owner)
    }

    async fn exists(&self, path: &str) -> FsResult<bool> {
        let _guard = self.lock(path, "exists").await?;
        self.inner.exists(path).await
    }
    fn exists_sync(&self, path: &str) -> FsResult<bool> {
        let _guard = self.lock_sync(path, "exists")?;
        self.inner.exists_sync(path)
    }

    async fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let _guard = self.lock(from, "rename").await?;
        self.inner.rename(from, to).await
    }
    fn rename_sync(&self, from: &str, to: &str) -> FsResult<()> {
        let _guard = self.lock_sync(from, "rename")?;
        self.inner.rename_sync(from, to)
    }

    async fn unlink(&self, path: &str) -> FsResult<()> {
        let _guard = self.lock(path, "unlink").await?;
        self.inner.unlink(path).await
    }
    fn unlink_sync(&self, path: &str) -> FsResult<()> {
        let _guard = self.lock_sync(path, "unlink")?;
        self.inner.unlink_sync(path)
    }

    async fn rmdir(&self, path: &str) -> FsResult<()> {
        let _guard = self.lock(path, "rmdir").await?;
        self.inner.rmdir(path).await
    }
    fn rmdir_sync(&self, path: &str) -> FsResult<()> {
        let _guard = self.lock_sync(path, "rmdir")?;
        self.inner.rmdir_sync(path)
    }

    async fn mkdir(&self, path: &str, mode: u32, owner: Owner) -> FsResult<()> {
        let _guard = self.lock(path, "mkdir").await?;
        self.inner.mkdir(path, mode, owner).await
    }
    fn mkdir_sync(&self, path: &str, mode: u32, owner: Owner) -> FsResult<()> {
        let _guard = self.lock_sync(path, "mkdir")?;
        self.inner.mkdir_sync(path, mode, owner)
    }

    async fn readdir(&self, path: &str) -> FsResult<Vec<String>> {
        let _guard = self.lock(path, "readdir").await?;
        self.inner.readdir(path).await
    }
    fn readdir_sync(&self, path: &str) -> FsResult<Vec<String>> {
        let _guard = self.lock_sync(path, "readdir")?;
        self.inner.readdir_sync(path)
    }

    async fn link(&self, target: &str, link_path: &str) -> FsResult<()> {
        let _guard = self.lock(link_path, "link").await?;
        self.inner.link(target, link_path).await
    }
    fn link_sync(&self, target: &str, link_path: &str) -> FsResult<()> {
        let _guard = self.lock_sync(link_path, "link")?;
        self.inner.link_sync(target, link_path)
    }

    async fn sync(&self, path: &str, data: &[u8], stats: &Stats) -> FsResult<()> {
        let _guard = self.lock(path, "sync").await?;
        self.inner.sync(path, data, stats).await
    }
    fn sync_sync(&self, path: &str, data: &[u8], stats: &Stats) -> FsResult<()> {
        let _guard = self.lock_sync(path, "sync")?;
        self.inner.sync_sync(path, data, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::memory::InMemoryFs;

    fn mutexed() -> MutexedFs {
        MutexedFs::new(Arc::new(InMemoryFs::new()))
    }

    #[tokio::test]
    async fn serializes_in_acquisition_order() {
        let fs = Arc::new(mutexed());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut handles = Vec::new();

        // Each acquisition waits for the previous task's unlock, so the
        // completion order must match the acquisition order.
        for i in 0..3 {
            let guard = fs.lock("/r", "test").await.unwrap();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                order.lock().unwrap().push(i);
                guard.unlock();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn lock_sync_fails_busy_while_held() {
        let fs = mutexed();
        let guard = fs.lock("/r", "t").await.unwrap();
        assert!(fs.is_locked());
        assert_eq!(fs.lock_sync("/r", "t").unwrap_err().kind, ErrorKind::Busy);
        guard.unlock();
        assert!(!fs.is_locked());
        assert!(fs.lock_sync("/r", "t").is_ok());
    }

    #[tokio::test]
    async fn expired_deadline_reports_deadlock() {
        let fs = MutexedFs::with_options(
            Arc::new(InMemoryFs::new()),
            MutexOptions {
                deadline: Duration::from_millis(20),
            },
        )
        .unwrap();
        let _held = fs.lock("/r", "t").await.unwrap();
        let err = fs.lock("/r", "t").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Deadlock);
        assert_eq!(err.syscall, Some("t"));
    }

    #[tokio::test]
    async fn zero_deadline_rejected() {
        let err = MutexedFs::with_options(
            Arc::new(InMemoryFs::new()),
            MutexOptions {
                deadline: Duration::ZERO,
            },
        )
        .map(|_| ())
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn calls_pass_through_to_inner() {
        let fs = mutexed();
        fs.mkdir("/d", 0o755, Owner::default()).await.unwrap();
        assert!(fs.stat("/d").await.unwrap().is_dir());
        assert!(!fs.exists("/missing").await.unwrap());
    }
}
