// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! VFS dispatch
//!
//! [`Vfs`] turns the path-based public API into backend calls: it normalizes
//! paths, resolves symlinks across mounts (`realpath`), picks the owning
//! backend by longest mount-point prefix, enforces permission bits against
//! the active credentials, keeps the descriptor table, and emits change
//! notifications. Every operation exists in an async form and a
//! non-suspending `*_sync` twin; the twins require the backends' sync
//! surface and never await.
//!
//! Table locks (mounts, descriptors, watchers) are short-held and never kept
//! across backend I/O.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;
use tracing::{debug, trace};

use crate::backend::{BackendFeature, FileSystem, FsFile, Owner};
use crate::error::{ErrorKind, FsError, FsResult};
use crate::fd::{Fd, FdTable, OpenFile};
use crate::flags::OpenFlags;
use crate::handle::{Dir, FileHandle};
use crate::memory::InMemoryFs;
use crate::mount::{MountInfo, MountTable, Resolved};
use crate::path::{basename, dirname, join, normalize};
use crate::stats::{
    Credentials, Dirent, FileType, Stats, StatsFs, R_OK, S_IFLNK, S_IFMT, S_IFREG, S_ISGID,
    S_ISUID, W_OK,
};
use crate::watch::{EventType, Watcher, WatcherBus};

/// Bound on symlink traversals in one resolution.
const MAX_SYMLINK_DEPTH: u32 = 40;

/// `copy_file` flag: fail `EEXIST` if the destination already exists.
pub const COPYFILE_EXCL: u32 = 1;

/// Options for [`Vfs::mkdir`].
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct MkdirOptions {
    pub recursive: bool,
    pub mode: u32,
}

impl Default for MkdirOptions {
    fn default() -> Self {
        Self {
            recursive: false,
            mode: 0o777,
        }
    }
}

/// Options for [`Vfs::rm`].
#[derive(Clone, Copy, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct RmOptions {
    pub recursive: bool,
    /// Suppress `ENOENT`, for the target and throughout the recursive walk.
    pub force: bool,
}

/// Options for [`Vfs::write_file_with`] / [`Vfs::append_file_with`].
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct WriteOptions {
    pub flag: String,
    pub mode: u32,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            flag: "w".to_string(),
            mode: 0o644,
        }
    }
}

/// Filter callback for [`Vfs::cp`]: `(src, dst) -> copy?`.
pub type CpFilter = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Options for [`Vfs::cp`].
#[derive(Clone, Default)]
pub struct CpOptions {
    pub recursive: bool,
    /// Fail `EEXIST` instead of overwriting existing destination files.
    pub error_on_exist: bool,
    pub preserve_timestamps: bool,
    /// Copy the targets of symlinks instead of the links themselves.
    pub dereference: bool,
    pub filter: Option<CpFilter>,
}

/// Accepted for API compatibility; only meaningful on platforms with typed
/// links, ignored here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SymlinkType {
    File,
    Dir,
    Junction,
}

struct VfsInner {
    mounts: MountTable,
    fds: FdTable,
    watchers: Arc<WatcherBus>,
    credentials: RwLock<Credentials>,
}

/// The virtual filesystem. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Vfs {
    inner: Arc<VfsInner>,
}

fn remap<'a>(resolved: &'a Resolved, user_path: &'a str) -> impl Fn(FsError) -> FsError + 'a {
    move |e| e.remap_paths(&resolved.error_paths(user_path))
}

/// Combine an operation result with the close that must always follow it:
/// the operation's error wins, otherwise the close error surfaces.
fn finish<T>(result: FsResult<T>, close_result: FsResult<()>) -> FsResult<T> {
    match result {
        Ok(value) => close_result.map(|_| value),
        Err(e) => {
            let _ = close_result;
            Err(e)
        }
    }
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    /// A VFS with a fresh in-memory backend mounted at `/`.
    pub fn new() -> Self {
        Self::with_root(Arc::new(InMemoryFs::new())).expect("in-memory root is always ready")
    }

    /// A VFS with `root` mounted at `/`. The backend's sync readiness hook
    /// runs before the mount is registered.
    pub fn with_root(root: Arc<dyn FileSystem>) -> FsResult<Self> {
        let vfs = Self {
            inner: Arc::new(VfsInner {
                mounts: MountTable::new(),
                fds: FdTable::new(),
                watchers: Arc::new(WatcherBus::new()),
                credentials: RwLock::new(Credentials::root()),
            }),
        };
        root.ready_sync()?;
        vfs.inner.mounts.add("/", root)?;
        Ok(vfs)
    }

    pub fn credentials(&self) -> Credentials {
        self.inner.credentials.read().unwrap().clone()
    }

    pub fn set_credentials(&self, credentials: Credentials) {
        *self.inner.credentials.write().unwrap() = credentials;
    }

    fn emit(&self, event_type: EventType, path: &str) {
        self.inner.watchers.emit(event_type, path);
    }

    fn resolve(&self, path: &str) -> FsResult<Resolved> {
        self.inner.mounts.resolve(path)
    }

    // ------------------------------------------------------------------
    // Mounting

    /// Splice `backend` into the namespace at `mount_point`. The parent of
    /// the mount point must already exist as a directory; mounting never
    /// creates it.
    pub async fn mount(&self, mount_point: &str, backend: Arc<dyn FileSystem>) -> FsResult<()> {
        let point = normalize(mount_point)?;
        if point != "/" {
            let parent = dirname(&point).to_string();
            let st = self.stat_nofollow(&parent).await?;
            if !st.is_dir() {
                return Err(FsError::not_directory(parent).with_syscall("mount"));
            }
        }
        backend.ready().await?;
        self.inner.mounts.add(&point, backend)?;
        debug!(mount_point = %point, "mounted backend");
        Ok(())
    }

    pub fn mount_sync(&self, mount_point: &str, backend: Arc<dyn FileSystem>) -> FsResult<()> {
        let point = normalize(mount_point)?;
        if point != "/" {
            let parent = dirname(&point).to_string();
            let st = self.stat_nofollow_sync(&parent)?;
            if !st.is_dir() {
                return Err(FsError::not_directory(parent).with_syscall("mount"));
            }
        }
        backend.ready_sync()?;
        self.inner.mounts.add(&point, backend)?;
        debug!(mount_point = %point, "mounted backend");
        Ok(())
    }

    /// Remove the mount at `mount_point`. Flushing is the backend's own
    /// responsibility.
    pub fn umount(&self, mount_point: &str) -> FsResult<()> {
        let point = normalize(mount_point)?;
        self.inner.mounts.remove(&point)?;
        debug!(mount_point = %point, "unmounted backend");
        Ok(())
    }

    pub fn mounts(&self) -> Vec<MountInfo> {
        self.inner.mounts.list()
    }

    // ------------------------------------------------------------------
    // Path resolution

    /// Canonical absolute path with every symlink resolved. A missing node
    /// resolves to the (normalized) input, which is what lets
    /// `open(p, "w")` create through this.
    pub async fn realpath(&self, path: &str) -> FsResult<String> {
        self.realpath_depth(normalize(path)?, 0).await
    }

    fn realpath_depth<'a>(&'a self, path: String, depth: u32) -> BoxFuture<'a, FsResult<String>> {
        Box::pin(async move {
            if depth > MAX_SYMLINK_DEPTH {
                return Err(FsError::symlink_loop(path).with_syscall("realpath"));
            }
            if path == "/" {
                return Ok(path);
            }
            let dir = self.realpath_depth(dirname(&path).to_string(), depth).await?;
            let joined = join(&dir, basename(&path))?;
            let resolved = self.resolve(&joined)?;
            match resolved.backend.stat(&resolved.local_path).await {
                Err(e) if e.kind == ErrorKind::NotFound => Ok(path),
                Err(e) => Err(remap(&resolved, &joined)(e)),
                Ok(st) if st.is_symlink() => {
                    let target = self.read_link_target(&resolved, &joined).await?;
                    let target = join(&dir, &target)?;
                    self.realpath_depth(target, depth + 1).await
                }
                Ok(_) => Ok(joined),
            }
        })
    }

    pub fn realpath_sync(&self, path: &str) -> FsResult<String> {
        self.realpath_depth_sync(normalize(path)?, 0)
    }

    fn realpath_depth_sync(&self, path: String, depth: u32) -> FsResult<String> {
        if depth > MAX_SYMLINK_DEPTH {
            return Err(FsError::symlink_loop(path).with_syscall("realpath"));
        }
        if path == "/" {
            return Ok(path);
        }
        let dir = self.realpath_depth_sync(dirname(&path).to_string(), depth)?;
        let joined = join(&dir, basename(&path))?;
        let resolved = self.resolve(&joined)?;
        match resolved.backend.stat_sync(&resolved.local_path) {
            Err(e) if e.kind == ErrorKind::NotFound => Ok(path),
            Err(e) => Err(remap(&resolved, &joined)(e)),
            Ok(st) if st.is_symlink() => {
                let target = self.read_link_target_sync(&resolved, &joined)?;
                let target = join(&dir, &target)?;
                self.realpath_depth_sync(target, depth + 1)
            }
            Ok(_) => Ok(joined),
        }
    }

    /// Stat without following a final symlink. `path` must be normalized.
    async fn stat_nofollow(&self, path: &str) -> FsResult<Stats> {
        let resolved = self.resolve(path)?;
        resolved
            .backend
            .stat(&resolved.local_path)
            .await
            .map_err(remap(&resolved, path))
    }

    fn stat_nofollow_sync(&self, path: &str) -> FsResult<Stats> {
        let resolved = self.resolve(path)?;
        resolved
            .backend
            .stat_sync(&resolved.local_path)
            .map_err(remap(&resolved, path))
    }

    /// Read the target of a symlink node (stored as its contents).
    async fn read_link_target(&self, resolved: &Resolved, user_path: &str) -> FsResult<String> {
        let st = resolved
            .backend
            .stat(&resolved.local_path)
            .await
            .map_err(remap(resolved, user_path))?;
        let file = resolved
            .backend
            .open_file(&resolved.local_path, OpenFlags::parse("r")?)
            .await
            .map_err(remap(resolved, user_path))?;
        let mut buf = vec![0u8; st.size as usize];
        let result = file.read(&mut buf, 0).await;
        let n = finish(result, file.close().await).map_err(remap(resolved, user_path))?;
        buf.truncate(n);
        String::from_utf8(buf)
            .map_err(|_| FsError::invalid(user_path).with_syscall("readlink"))
    }

    fn read_link_target_sync(&self, resolved: &Resolved, user_path: &str) -> FsResult<String> {
        let st = resolved
            .backend
            .stat_sync(&resolved.local_path)
            .map_err(remap(resolved, user_path))?;
        let file = resolved
            .backend
            .open_file_sync(&resolved.local_path, OpenFlags::parse("r")?)
            .map_err(remap(resolved, user_path))?;
        let mut buf = vec![0u8; st.size as usize];
        let result = file.read_sync(&mut buf, 0);
        let n = finish(result, file.close_sync()).map_err(remap(resolved, user_path))?;
        buf.truncate(n);
        String::from_utf8(buf)
            .map_err(|_| FsError::invalid(user_path).with_syscall("readlink"))
    }

    // ------------------------------------------------------------------
    // The open protocol

    fn create_owner(&self, resolved: &Resolved, parent: &Stats, creds: &Credentials) -> Owner {
        if resolved.backend.metadata().has_feature(BackendFeature::Setid) {
            Owner {
                uid: creds.euid,
                gid: creds.egid,
            }
        } else {
            Owner {
                uid: if parent.mode & S_ISUID != 0 {
                    parent.uid
                } else {
                    creds.euid
                },
                gid: if parent.mode & S_ISGID != 0 {
                    parent.gid
                } else {
                    creds.egid
                },
            }
        }
    }

    /// The open-file protocol. `mode` may carry type bits; a bare permission
    /// mode creates a regular file. Returns the resolved user-facing path
    /// together with the backend handle.
    async fn open_file_at(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> FsResult<(String, Box<dyn FsFile>)> {
        let creds = self.credentials();
        let p = self.realpath(path).await?;
        let resolved = self.resolve(&p)?;
        trace!(path = %p, backend = %resolved.mount_point, "open dispatch");
        match resolved.backend.stat(&resolved.local_path).await {
            Err(e) if e.kind == ErrorKind::NotFound => {
                if !flags.create {
                    return Err(FsError::not_found(&p).with_syscall("open"));
                }
                let parent = dirname(&p).to_string();
                let parent_st = self.stat_nofollow(&parent).await?;
                if !parent_st.is_dir() {
                    return Err(FsError::not_directory(parent).with_syscall("open"));
                }
                if !parent_st.has_access(W_OK, &creds) {
                    return Err(FsError::access_denied(parent).with_syscall("open"));
                }
                let owner = self.create_owner(&resolved, &parent_st, &creds);
                let full_mode = if mode & S_IFMT == 0 {
                    S_IFREG | (mode & 0o7777)
                } else {
                    mode
                };
                let file = resolved
                    .backend
                    .create_file(&resolved.local_path, flags, full_mode, owner)
                    .await
                    .map_err(remap(&resolved, &p))?;
                self.emit(EventType::Rename, &p);
                Ok((p, file))
            }
            Err(e) => Err(remap(&resolved, &p)(e)),
            Ok(st) => {
                if !st.has_access(flags.access_mask(), &creds) {
                    return Err(FsError::access_denied(&p).with_syscall("open"));
                }
                if flags.exclusive {
                    return Err(FsError::exists(&p).with_syscall("open"));
                }
                if st.is_dir() && (flags.writable || flags.appendable) {
                    return Err(FsError::is_directory(&p).with_syscall("open"));
                }
                let file = resolved
                    .backend
                    .open_file(&resolved.local_path, flags)
                    .await
                    .map_err(remap(&resolved, &p))?;
                if flags.truncate {
                    let result = file.truncate(0).await;
                    if let Err(e) = result {
                        let _ = file.close().await;
                        return Err(e.remap_paths(&resolved.error_paths(&p)));
                    }
                    self.emit(EventType::Change, &p);
                }
                Ok((p, file))
            }
        }
    }

    fn open_file_at_sync(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: u32,
    ) -> FsResult<(String, Box<dyn FsFile>)> {
        let creds = self.credentials();
        let p = self.realpath_sync(path)?;
        let resolved = self.resolve(&p)?;
        match resolved.backend.stat_sync(&resolved.local_path) {
            Err(e) if e.kind == ErrorKind::NotFound => {
                if !flags.create {
                    return Err(FsError::not_found(&p).with_syscall("open"));
                }
                let parent = dirname(&p).to_string();
                let parent_st = self.stat_nofollow_sync(&parent)?;
                if !parent_st.is_dir() {
                    return Err(FsError::not_directory(parent).with_syscall("open"));
                }
                if !parent_st.has_access(W_OK, &creds) {
                    return Err(FsError::access_denied(parent).with_syscall("open"));
                }
                let owner = self.create_owner(&resolved, &parent_st, &creds);
                let full_mode = if mode & S_IFMT == 0 {
                    S_IFREG | (mode & 0o7777)
                } else {
                    mode
                };
                let file = resolved
                    .backend
                    .create_file_sync(&resolved.local_path, flags, full_mode, owner)
                    .map_err(remap(&resolved, &p))?;
                self.emit(EventType::Rename, &p);
                Ok((p, file))
            }
            Err(e) => Err(remap(&resolved, &p)(e)),
            Ok(st) => {
                if !st.has_access(flags.access_mask(), &creds) {
                    return Err(FsError::access_denied(&p).with_syscall("open"));
                }
                if flags.exclusive {
                    return Err(FsError::exists(&p).with_syscall("open"));
                }
                if st.is_dir() && (flags.writable || flags.appendable) {
                    return Err(FsError::is_directory(&p).with_syscall("open"));
                }
                let file = resolved
                    .backend
                    .open_file_sync(&resolved.local_path, flags)
                    .map_err(remap(&resolved, &p))?;
                if flags.truncate {
                    if let Err(e) = file.truncate_sync(0) {
                        let _ = file.close_sync();
                        return Err(e.remap_paths(&resolved.error_paths(&p)));
                    }
                    self.emit(EventType::Change, &p);
                }
                Ok((p, file))
            }
        }
    }

    /// Open `path` and register a descriptor for it.
    pub async fn open(&self, path: &str, flag: &str, mode: u32) -> FsResult<Fd> {
        let flags = OpenFlags::parse(flag)?;
        let (p, file) = self.open_file_at(path, flags, mode).await?;
        Ok(self.inner.fds.insert(Arc::new(OpenFile::new(p, flags, file))))
    }

    pub fn open_sync(&self, path: &str, flag: &str, mode: u32) -> FsResult<Fd> {
        let flags = OpenFlags::parse(flag)?;
        let (p, file) = self.open_file_at_sync(path, flags, mode)?;
        Ok(self.inner.fds.insert(Arc::new(OpenFile::new(p, flags, file))))
    }

    /// Like [`open`](Self::open), wrapped in the object API.
    pub async fn open_handle(&self, path: &str, flag: &str, mode: u32) -> FsResult<FileHandle> {
        Ok(FileHandle::new(self.clone(), self.open(path, flag, mode).await?))
    }

    pub fn open_handle_sync(&self, path: &str, flag: &str, mode: u32) -> FsResult<FileHandle> {
        Ok(FileHandle::new(self.clone(), self.open_sync(path, flag, mode)?))
    }

    // ------------------------------------------------------------------
    // Whole-file reads and writes

    pub async fn read_file(&self, path: &str) -> FsResult<Vec<u8>> {
        let (p, file) = self.open_file_at(path, OpenFlags::parse("r")?, 0o644).await?;
        let result = async {
            let st = file.stat().await?;
            let mut buf = vec![0u8; st.size as usize];
            let n = file.read(&mut buf, 0).await?;
            buf.truncate(n);
            Ok(buf)
        }
        .await;
        finish(result, file.close().await).map_err(|e: FsError| match e.path {
            Some(_) => e,
            None => e.with_path(p),
        })
    }

    pub fn read_file_sync(&self, path: &str) -> FsResult<Vec<u8>> {
        let (p, file) = self.open_file_at_sync(path, OpenFlags::parse("r")?, 0o644)?;
        let result = (|| {
            let st = file.stat_sync()?;
            let mut buf = vec![0u8; st.size as usize];
            let n = file.read_sync(&mut buf, 0)?;
            buf.truncate(n);
            Ok(buf)
        })();
        finish(result, file.close_sync()).map_err(|e: FsError| match e.path {
            Some(_) => e,
            None => e.with_path(p),
        })
    }

    /// Read and decode as UTF-8; invalid bytes fail `EINVAL`.
    pub async fn read_file_to_string(&self, path: &str) -> FsResult<String> {
        let bytes = self.read_file(path).await?;
        String::from_utf8(bytes).map_err(|_| FsError::invalid(path).with_syscall("read"))
    }

    pub fn read_file_to_string_sync(&self, path: &str) -> FsResult<String> {
        let bytes = self.read_file_sync(path)?;
        String::from_utf8(bytes).map_err(|_| FsError::invalid(path).with_syscall("read"))
    }

    pub async fn write_file(&self, path: &str, data: impl AsRef<[u8]>) -> FsResult<()> {
        self.write_file_with(path, data, &WriteOptions::default()).await
    }

    pub fn write_file_sync(&self, path: &str, data: impl AsRef<[u8]>) -> FsResult<()> {
        self.write_file_with_sync(path, data, &WriteOptions::default())
    }

    pub async fn write_file_with(
        &self,
        path: &str,
        data: impl AsRef<[u8]>,
        options: &WriteOptions,
    ) -> FsResult<()> {
        let flags = OpenFlags::parse(&options.flag)?;
        if !flags.writable && !flags.appendable {
            return Err(FsError::invalid(path).with_syscall("write"));
        }
        let (p, file) = self.open_file_at(path, flags, options.mode).await?;
        let data = data.as_ref();
        let result = async {
            let position = if flags.appendable {
                file.stat().await?.size
            } else {
                0
            };
            file.write(data, position).await?;
            Ok(())
        }
        .await;
        let out = finish(result, file.close().await);
        if out.is_ok() {
            self.emit(EventType::Change, &p);
        }
        out
    }

    pub fn write_file_with_sync(
        &self,
        path: &str,
        data: impl AsRef<[u8]>,
        options: &WriteOptions,
    ) -> FsResult<()> {
        let flags = OpenFlags::parse(&options.flag)?;
        if !flags.writable && !flags.appendable {
            return Err(FsError::invalid(path).with_syscall("write"));
        }
        let (p, file) = self.open_file_at_sync(path, flags, options.mode)?;
        let data = data.as_ref();
        let result = (|| {
            let position = if flags.appendable {
                file.stat_sync()?.size
            } else {
                0
            };
            file.write_sync(data, position)?;
            Ok(())
        })();
        let out = finish(result, file.close_sync());
        if out.is_ok() {
            self.emit(EventType::Change, &p);
        }
        out
    }

    pub async fn append_file(&self, path: &str, data: impl AsRef<[u8]>) -> FsResult<()> {
        self.write_file_with(
            path,
            data,
            &WriteOptions {
                flag: "a".to_string(),
                mode: 0o644,
            },
        )
        .await
    }

    pub fn append_file_sync(&self, path: &str, data: impl AsRef<[u8]>) -> FsResult<()> {
        self.write_file_with_sync(
            path,
            data,
            &WriteOptions {
                flag: "a".to_string(),
                mode: 0o644,
            },
        )
    }

    // ------------------------------------------------------------------
    // Metadata operations

    /// Stat, following symlinks.
    pub async fn stat(&self, path: &str) -> FsResult<Stats> {
        let p = self.realpath(path).await?;
        self.stat_nofollow(&p).await.map_err(|e| e.with_syscall("stat"))
    }

    pub fn stat_sync(&self, path: &str) -> FsResult<Stats> {
        let p = self.realpath_sync(path)?;
        self.stat_nofollow_sync(&p).map_err(|e| e.with_syscall("stat"))
    }

    /// Stat without following a final symlink.
    pub async fn lstat(&self, path: &str) -> FsResult<Stats> {
        let p = normalize(path)?;
        self.stat_nofollow(&p).await.map_err(|e| e.with_syscall("lstat"))
    }

    pub fn lstat_sync(&self, path: &str) -> FsResult<Stats> {
        let p = normalize(path)?;
        self.stat_nofollow_sync(&p).map_err(|e| e.with_syscall("lstat"))
    }

    /// `false` only for a missing path; other failures propagate.
    pub async fn exists(&self, path: &str) -> FsResult<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn exists_sync(&self, path: &str) -> FsResult<bool> {
        match self.stat_sync(path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Check the active credentials against `mask` (`R_OK | W_OK | X_OK`).
    pub async fn access(&self, path: &str, mask: u32) -> FsResult<()> {
        let st = self.stat(path).await?;
        if st.has_access(mask, &self.credentials()) {
            Ok(())
        } else {
            Err(FsError::access_denied(path).with_syscall("access"))
        }
    }

    pub fn access_sync(&self, path: &str, mask: u32) -> FsResult<()> {
        let st = self.stat_sync(path)?;
        if st.has_access(mask, &self.credentials()) {
            Ok(())
        } else {
            Err(FsError::access_denied(path).with_syscall("access"))
        }
    }

    pub async fn truncate(&self, path: &str, size: u64) -> FsResult<()> {
        let (p, file) = self.open_file_at(path, OpenFlags::parse("r+")?, 0o644).await?;
        let result = file.truncate(size).await;
        let out = finish(result, file.close().await);
        if out.is_ok() {
            self.emit(EventType::Change, &p);
        }
        out
    }

    pub fn truncate_sync(&self, path: &str, size: u64) -> FsResult<()> {
        let (p, file) = self.open_file_at_sync(path, OpenFlags::parse("r+")?, 0o644)?;
        let result = file.truncate_sync(size);
        let out = finish(result, file.close_sync());
        if out.is_ok() {
            self.emit(EventType::Change, &p);
        }
        out
    }

    /// Open a backend metadata handle on an existing node without the open
    /// protocol's access checks (chmod/chown/utimes have their own rules).
    async fn metadata_handle(&self, p: &str) -> FsResult<(Resolved, Box<dyn FsFile>)> {
        let resolved = self.resolve(p)?;
        let file = resolved
            .backend
            .open_file(&resolved.local_path, OpenFlags::parse("r")?)
            .await
            .map_err(remap(&resolved, p))?;
        Ok((resolved, file))
    }

    fn metadata_handle_sync(&self, p: &str) -> FsResult<(Resolved, Box<dyn FsFile>)> {
        let resolved = self.resolve(p)?;
        let file = resolved
            .backend
            .open_file_sync(&resolved.local_path, OpenFlags::parse("r")?)
            .map_err(remap(&resolved, p))?;
        Ok((resolved, file))
    }

    fn chmod_allowed(st: &Stats, creds: &Credentials, path: &str) -> FsResult<()> {
        if creds.euid != 0 && creds.euid != st.uid {
            return Err(FsError::not_permitted(path).with_syscall("chmod"));
        }
        Ok(())
    }

    fn chown_allowed(st: &Stats, creds: &Credentials, uid: u32, gid: u32, path: &str) -> FsResult<()> {
        if uid != st.uid && creds.euid != 0 {
            return Err(FsError::not_permitted(path).with_syscall("chown"));
        }
        if gid != st.gid && creds.euid != 0 && (creds.euid != st.uid || !creds.in_group(gid)) {
            return Err(FsError::not_permitted(path).with_syscall("chown"));
        }
        Ok(())
    }

    async fn chmod_at(&self, p: &str, mode: u32) -> FsResult<()> {
        let creds = self.credentials();
        let st = self.stat_nofollow(p).await?;
        Self::chmod_allowed(&st, &creds, p)?;
        let (resolved, file) = self.metadata_handle(p).await?;
        let result = file.chmod(mode & 0o7777).await;
        finish(result, file.close().await).map_err(remap(&resolved, p))?;
        self.emit(EventType::Change, p);
        Ok(())
    }

    fn chmod_at_sync(&self, p: &str, mode: u32) -> FsResult<()> {
        let creds = self.credentials();
        let st = self.stat_nofollow_sync(p)?;
        Self::chmod_allowed(&st, &creds, p)?;
        let (resolved, file) = self.metadata_handle_sync(p)?;
        let result = file.chmod_sync(mode & 0o7777);
        finish(result, file.close_sync()).map_err(remap(&resolved, p))?;
        self.emit(EventType::Change, p);
        Ok(())
    }

    pub async fn chmod(&self, path: &str, mode: u32) -> FsResult<()> {
        let p = self.realpath(path).await?;
        self.chmod_at(&p, mode).await
    }

    pub fn chmod_sync(&self, path: &str, mode: u32) -> FsResult<()> {
        let p = self.realpath_sync(path)?;
        self.chmod_at_sync(&p, mode)
    }

    pub async fn lchmod(&self, path: &str, mode: u32) -> FsResult<()> {
        let p = normalize(path)?;
        self.chmod_at(&p, mode).await
    }

    pub fn lchmod_sync(&self, path: &str, mode: u32) -> FsResult<()> {
        let p = normalize(path)?;
        self.chmod_at_sync(&p, mode)
    }

    async fn chown_at(&self, p: &str, uid: u32, gid: u32) -> FsResult<()> {
        let creds = self.credentials();
        let st = self.stat_nofollow(p).await?;
        Self::chown_allowed(&st, &creds, uid, gid, p)?;
        let (resolved, file) = self.metadata_handle(p).await?;
        let result = async {
            file.chown(uid, gid).await?;
            // Ownership changes drop the setuid/setgid bits.
            if st.mode & (S_ISUID | S_ISGID) != 0 {
                file.chmod(st.mode & 0o7777 & !(S_ISUID | S_ISGID)).await?;
            }
            Ok(())
        }
        .await;
        finish(result, file.close().await).map_err(remap(&resolved, p))?;
        self.emit(EventType::Change, p);
        Ok(())
    }

    fn chown_at_sync(&self, p: &str, uid: u32, gid: u32) -> FsResult<()> {
        let creds = self.credentials();
        let st = self.stat_nofollow_sync(p)?;
        Self::chown_allowed(&st, &creds, uid, gid, p)?;
        let (resolved, file) = self.metadata_handle_sync(p)?;
        let result = (|| {
            file.chown_sync(uid, gid)?;
            if st.mode & (S_ISUID | S_ISGID) != 0 {
                file.chmod_sync(st.mode & 0o7777 & !(S_ISUID | S_ISGID))?;
            }
            Ok(())
        })();
        finish(result, file.close_sync()).map_err(remap(&resolved, p))?;
        self.emit(EventType::Change, p);
        Ok(())
    }

    pub async fn chown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        let p = self.realpath(path).await?;
        self.chown_at(&p, uid, gid).await
    }

    pub fn chown_sync(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        let p = self.realpath_sync(path)?;
        self.chown_at_sync(&p, uid, gid)
    }

    pub async fn lchown(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        let p = normalize(path)?;
        self.chown_at(&p, uid, gid).await
    }

    pub fn lchown_sync(&self, path: &str, uid: u32, gid: u32) -> FsResult<()> {
        let p = normalize(path)?;
        self.chown_at_sync(&p, uid, gid)
    }

    async fn utimes_at(&self, p: &str, atime_ms: i64, mtime_ms: i64) -> FsResult<()> {
        let creds = self.credentials();
        let st = self.stat_nofollow(p).await?;
        if creds.euid != 0 && creds.euid != st.uid {
            return Err(FsError::not_permitted(p).with_syscall("utimes"));
        }
        let (resolved, file) = self.metadata_handle(p).await?;
        let result = file.utimes(atime_ms, mtime_ms).await;
        finish(result, file.close().await).map_err(remap(&resolved, p))?;
        self.emit(EventType::Change, p);
        Ok(())
    }

    fn utimes_at_sync(&self, p: &str, atime_ms: i64, mtime_ms: i64) -> FsResult<()> {
        let creds = self.credentials();
        let st = self.stat_nofollow_sync(p)?;
        if creds.euid != 0 && creds.euid != st.uid {
            return Err(FsError::not_permitted(p).with_syscall("utimes"));
        }
        let (resolved, file) = self.metadata_handle_sync(p)?;
        let result = file.utimes_sync(atime_ms, mtime_ms);
        finish(result, file.close_sync()).map_err(remap(&resolved, p))?;
        self.emit(EventType::Change, p);
        Ok(())
    }

    pub async fn utimes(&self, path: &str, atime_ms: i64, mtime_ms: i64) -> FsResult<()> {
        let p = self.realpath(path).await?;
        self.utimes_at(&p, atime_ms, mtime_ms).await
    }

    pub fn utimes_sync(&self, path: &str, atime_ms: i64, mtime_ms: i64) -> FsResult<()> {
        let p = self.realpath_sync(path)?;
        self.utimes_at_sync(&p, atime_ms, mtime_ms)
    }

    pub async fn lutimes(&self, path: &str, atime_ms: i64, mtime_ms: i64) -> FsResult<()> {
        let p = normalize(path)?;
        self.utimes_at(&p, atime_ms, mtime_ms).await
    }

    pub fn lutimes_sync(&self, path: &str, atime_ms: i64, mtime_ms: i64) -> FsResult<()> {
        let p = normalize(path)?;
        self.utimes_at_sync(&p, atime_ms, mtime_ms)
    }

    // ------------------------------------------------------------------
    // Namespace mutations

    pub async fn unlink(&self, path: &str) -> FsResult<()> {
        let p = normalize(path)?;
        let creds = self.credentials();
        let parent = dirname(&p).to_string();
        let parent_st = self.stat_nofollow(&parent).await?;
        if !parent_st.has_access(W_OK, &creds) {
            return Err(FsError::access_denied(parent).with_syscall("unlink"));
        }
        let resolved = self.resolve(&p)?;
        resolved
            .backend
            .unlink(&resolved.local_path)
            .await
            .map_err(remap(&resolved, &p))?;
        self.emit(EventType::Rename, &p);
        Ok(())
    }

    pub fn unlink_sync(&self, path: &str) -> FsResult<()> {
        let p = normalize(path)?;
        let creds = self.credentials();
        let parent = dirname(&p).to_string();
        let parent_st = self.stat_nofollow_sync(&parent)?;
        if !parent_st.has_access(W_OK, &creds) {
            return Err(FsError::access_denied(parent).with_syscall("unlink"));
        }
        let resolved = self.resolve(&p)?;
        resolved
            .backend
            .unlink_sync(&resolved.local_path)
            .map_err(remap(&resolved, &p))?;
        self.emit(EventType::Rename, &p);
        Ok(())
    }

    pub async fn rmdir(&self, path: &str) -> FsResult<()> {
        let p = self.realpath(path).await?;
        let creds = self.credentials();
        let parent = dirname(&p).to_string();
        let parent_st = self.stat_nofollow(&parent).await?;
        if !parent_st.has_access(W_OK, &creds) {
            return Err(FsError::access_denied(parent).with_syscall("rmdir"));
        }
        let resolved = self.resolve(&p)?;
        resolved
            .backend
            .rmdir(&resolved.local_path)
            .await
            .map_err(remap(&resolved, &p))?;
        self.emit(EventType::Rename, &p);
        Ok(())
    }

    pub fn rmdir_sync(&self, path: &str) -> FsResult<()> {
        let p = self.realpath_sync(path)?;
        let creds = self.credentials();
        let parent = dirname(&p).to_string();
        let parent_st = self.stat_nofollow_sync(&parent)?;
        if !parent_st.has_access(W_OK, &creds) {
            return Err(FsError::access_denied(parent).with_syscall("rmdir"));
        }
        let resolved = self.resolve(&p)?;
        resolved
            .backend
            .rmdir_sync(&resolved.local_path)
            .map_err(remap(&resolved, &p))?;
        self.emit(EventType::Rename, &p);
        Ok(())
    }

    fn dir_owner_and_mode(
        &self,
        resolved: &Resolved,
        parent: &Stats,
        creds: &Credentials,
        mode: u32,
    ) -> (Owner, u32) {
        if resolved.backend.metadata().has_feature(BackendFeature::Setid) {
            return (
                Owner {
                    uid: creds.euid,
                    gid: creds.egid,
                },
                mode,
            );
        }
        if parent.mode & S_ISGID != 0 {
            // New directories under a setgid directory inherit its group and
            // the setgid bit itself.
            (
                Owner {
                    uid: creds.euid,
                    gid: parent.gid,
                },
                mode | S_ISGID,
            )
        } else {
            (
                Owner {
                    uid: creds.euid,
                    gid: creds.egid,
                },
                mode,
            )
        }
    }

    /// Create a directory. With `recursive`, missing ancestors are created
    /// too and the topmost newly-created path is returned; a fully existing
    /// chain is a no-op returning `None`.
    pub async fn mkdir(&self, path: &str, options: &MkdirOptions) -> FsResult<Option<String>> {
        let creds = self.credentials();
        let p = self.realpath(path).await?;
        if options.recursive {
            let mut missing: Vec<String> = Vec::new();
            let mut cur = p.clone();
            loop {
                match self.stat_nofollow(&cur).await {
                    Ok(st) => {
                        if !st.is_dir() {
                            return Err(FsError::not_directory(cur).with_syscall("mkdir"));
                        }
                        break;
                    }
                    Err(e) if e.kind == ErrorKind::NotFound => {
                        missing.push(cur.clone());
                        cur = dirname(&cur).to_string();
                    }
                    Err(e) => return Err(e),
                }
            }
            if missing.is_empty() {
                return Ok(None);
            }
            let anchor = self.stat_nofollow(&cur).await?;
            if !anchor.has_access(W_OK, &creds) {
                return Err(FsError::access_denied(cur).with_syscall("mkdir"));
            }
            let first_created = missing.last().cloned();
            for dir in missing.iter().rev() {
                let parent_st = self.stat_nofollow(dirname(dir)).await?;
                let resolved = self.resolve(dir)?;
                let (owner, mode) =
                    self.dir_owner_and_mode(&resolved, &parent_st, &creds, options.mode);
                resolved
                    .backend
                    .mkdir(&resolved.local_path, mode, owner)
                    .await
                    .map_err(remap(&resolved, dir))?;
                self.emit(EventType::Rename, dir);
            }
            Ok(first_created)
        } else {
            let parent = dirname(&p).to_string();
            let parent_st = self.stat_nofollow(&parent).await?;
            if !parent_st.is_dir() {
                return Err(FsError::not_directory(parent).with_syscall("mkdir"));
            }
            if !parent_st.has_access(W_OK, &creds) {
                return Err(FsError::access_denied(parent).with_syscall("mkdir"));
            }
            let resolved = self.resolve(&p)?;
            let (owner, mode) = self.dir_owner_and_mode(&resolved, &parent_st, &creds, options.mode);
            resolved
                .backend
                .mkdir(&resolved.local_path, mode, owner)
                .await
                .map_err(remap(&resolved, &p))?;
            self.emit(EventType::Rename, &p);
            Ok(None)
        }
    }

    pub fn mkdir_sync(&self, path: &str, options: &MkdirOptions) -> FsResult<Option<String>> {
        let creds = self.credentials();
        let p = self.realpath_sync(path)?;
        if options.recursive {
            let mut missing: Vec<String> = Vec::new();
            let mut cur = p.clone();
            loop {
                match self.stat_nofollow_sync(&cur) {
                    Ok(st) => {
                        if !st.is_dir() {
                            return Err(FsError::not_directory(cur).with_syscall("mkdir"));
                        }
                        break;
                    }
                    Err(e) if e.kind == ErrorKind::NotFound => {
                        missing.push(cur.clone());
                        cur = dirname(&cur).to_string();
                    }
                    Err(e) => return Err(e),
                }
            }
            if missing.is_empty() {
                return Ok(None);
            }
            let anchor = self.stat_nofollow_sync(&cur)?;
            if !anchor.has_access(W_OK, &creds) {
                return Err(FsError::access_denied(cur).with_syscall("mkdir"));
            }
            let first_created = missing.last().cloned();
            for dir in missing.iter().rev() {
                let parent_st = self.stat_nofollow_sync(dirname(dir))?;
                let resolved = self.resolve(dir)?;
                let (owner, mode) =
                    self.dir_owner_and_mode(&resolved, &parent_st, &creds, options.mode);
                resolved
                    .backend
                    .mkdir_sync(&resolved.local_path, mode, owner)
                    .map_err(remap(&resolved, dir))?;
                self.emit(EventType::Rename, dir);
            }
            Ok(first_created)
        } else {
            let parent = dirname(&p).to_string();
            let parent_st = self.stat_nofollow_sync(&parent)?;
            if !parent_st.is_dir() {
                return Err(FsError::not_directory(parent).with_syscall("mkdir"));
            }
            if !parent_st.has_access(W_OK, &creds) {
                return Err(FsError::access_denied(parent).with_syscall("mkdir"));
            }
            let resolved = self.resolve(&p)?;
            let (owner, mode) = self.dir_owner_and_mode(&resolved, &parent_st, &creds, options.mode);
            resolved
                .backend
                .mkdir_sync(&resolved.local_path, mode, owner)
                .map_err(remap(&resolved, &p))?;
            self.emit(EventType::Rename, &p);
            Ok(None)
        }
    }

    /// Create a unique directory whose name starts with `prefix`, mode
    /// `0o700`. Returns the created path.
    pub async fn mkdtemp(&self, prefix: &str) -> FsResult<String> {
        let base = normalize(prefix)?;
        for _ in 0..32 {
            let candidate = format!("{}{}", base, temp_suffix());
            match self
                .mkdir(
                    &candidate,
                    &MkdirOptions {
                        recursive: false,
                        mode: 0o700,
                    },
                )
                .await
            {
                Ok(_) => return Ok(candidate),
                Err(e) if e.kind == ErrorKind::Exists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(FsError::exists(base).with_syscall("mkdtemp"))
    }

    pub fn mkdtemp_sync(&self, prefix: &str) -> FsResult<String> {
        let base = normalize(prefix)?;
        for _ in 0..32 {
            let candidate = format!("{}{}", base, temp_suffix());
            match self.mkdir_sync(
                &candidate,
                &MkdirOptions {
                    recursive: false,
                    mode: 0o700,
                },
            ) {
                Ok(_) => return Ok(candidate),
                Err(e) if e.kind == ErrorKind::Exists => continue,
                Err(e) => return Err(e),
            }
        }
        Err(FsError::exists(base).with_syscall("mkdtemp"))
    }

    // ------------------------------------------------------------------
    // Directory listing

    /// Entry basenames, in backend order, unioned with the names of any
    /// mount points that are direct children of `path`.
    pub async fn readdir(&self, path: &str) -> FsResult<Vec<String>> {
        let p = self.realpath(path).await?;
        let resolved = self.resolve(&p)?;
        let st = resolved
            .backend
            .stat(&resolved.local_path)
            .await
            .map_err(remap(&resolved, &p))?;
        if !st.has_access(R_OK, &self.credentials()) {
            return Err(FsError::access_denied(&p).with_syscall("readdir"));
        }
        let mut names = resolved
            .backend
            .readdir(&resolved.local_path)
            .await
            .map_err(remap(&resolved, &p))?;
        for name in self.inner.mounts.child_mount_names(&p) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }

    pub fn readdir_sync(&self, path: &str) -> FsResult<Vec<String>> {
        let p = self.realpath_sync(path)?;
        let resolved = self.resolve(&p)?;
        let st = resolved
            .backend
            .stat_sync(&resolved.local_path)
            .map_err(remap(&resolved, &p))?;
        if !st.has_access(R_OK, &self.credentials()) {
            return Err(FsError::access_denied(&p).with_syscall("readdir"));
        }
        let mut names = resolved
            .backend
            .readdir_sync(&resolved.local_path)
            .map_err(remap(&resolved, &p))?;
        for name in self.inner.mounts.child_mount_names(&p) {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        Ok(names)
    }

    /// Like [`readdir`](Self::readdir), with each entry's file type.
    pub async fn readdir_ents(&self, path: &str) -> FsResult<Vec<Dirent>> {
        let p = self.realpath(path).await?;
        let names = self.readdir(&p).await?;
        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let child = join(&p, &name)?;
            match self.stat_nofollow(&child).await {
                Ok(st) => entries.push(Dirent {
                    name,
                    kind: st.file_type().unwrap_or(FileType::File),
                }),
                Err(e) if e.kind == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(entries)
    }

    pub fn readdir_ents_sync(&self, path: &str) -> FsResult<Vec<Dirent>> {
        let p = self.realpath_sync(path)?;
        let names = self.readdir_sync(&p)?;
        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let child = join(&p, &name)?;
            match self.stat_nofollow_sync(&child) {
                Ok(st) => entries.push(Dirent {
                    name,
                    kind: st.file_type().unwrap_or(FileType::File),
                }),
                Err(e) if e.kind == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(entries)
    }

    /// All paths under `path`, relative to it, walking into subdirectories
    /// but not through symlinks.
    pub async fn readdir_recursive(&self, path: &str) -> FsResult<Vec<String>> {
        let root = self.realpath(path).await?;
        let mut out = Vec::new();
        let mut stack = vec![root.clone()];
        while let Some(dir) = stack.pop() {
            for name in self.readdir(&dir).await? {
                let child = join(&dir, &name)?;
                out.push(relative_to(&root, &child));
                if let Ok(st) = self.stat_nofollow(&child).await {
                    if st.is_dir() {
                        stack.push(child);
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn readdir_recursive_sync(&self, path: &str) -> FsResult<Vec<String>> {
        let root = self.realpath_sync(path)?;
        let mut out = Vec::new();
        let mut stack = vec![root.clone()];
        while let Some(dir) = stack.pop() {
            for name in self.readdir_sync(&dir)? {
                let child = join(&dir, &name)?;
                out.push(relative_to(&root, &child));
                if let Ok(st) = self.stat_nofollow_sync(&child) {
                    if st.is_dir() {
                        stack.push(child);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Snapshot a directory into a cursor handle.
    pub async fn opendir(&self, path: &str) -> FsResult<Dir> {
        let p = self.realpath(path).await?;
        let entries = self.readdir_ents(&p).await?;
        Ok(Dir::new(p, entries))
    }

    pub fn opendir_sync(&self, path: &str) -> FsResult<Dir> {
        let p = self.realpath_sync(path)?;
        let entries = self.readdir_ents_sync(&p)?;
        Ok(Dir::new(p, entries))
    }

    // ------------------------------------------------------------------
    // Links

    /// Hard link. Both paths must live on the same mount (`EXDEV`).
    pub async fn link(&self, target: &str, link_path: &str) -> FsResult<()> {
        let t = normalize(target)?;
        let l = normalize(link_path)?;
        let rt = self.resolve(&t)?;
        let rl = self.resolve(&l)?;
        if rt.mount_point != rl.mount_point {
            return Err(FsError::cross_device(&l).with_syscall("link"));
        }
        let parent = dirname(&l).to_string();
        let parent_st = self.stat_nofollow(&parent).await?;
        if !parent_st.has_access(W_OK, &self.credentials()) {
            return Err(FsError::access_denied(parent).with_syscall("link"));
        }
        rt.backend
            .link(&rt.local_path, &rl.local_path)
            .await
            .map_err(|e| {
                e.remap_paths(&[
                    (rt.local_path.as_str(), t.as_str()),
                    (rl.local_path.as_str(), l.as_str()),
                ])
            })?;
        self.emit(EventType::Rename, &l);
        Ok(())
    }

    pub fn link_sync(&self, target: &str, link_path: &str) -> FsResult<()> {
        let t = normalize(target)?;
        let l = normalize(link_path)?;
        let rt = self.resolve(&t)?;
        let rl = self.resolve(&l)?;
        if rt.mount_point != rl.mount_point {
            return Err(FsError::cross_device(&l).with_syscall("link"));
        }
        let parent = dirname(&l).to_string();
        let parent_st = self.stat_nofollow_sync(&parent)?;
        if !parent_st.has_access(W_OK, &self.credentials()) {
            return Err(FsError::access_denied(parent).with_syscall("link"));
        }
        rt.backend
            .link_sync(&rt.local_path, &rl.local_path)
            .map_err(|e| {
                e.remap_paths(&[
                    (rt.local_path.as_str(), t.as_str()),
                    (rl.local_path.as_str(), l.as_str()),
                ])
            })?;
        self.emit(EventType::Rename, &l);
        Ok(())
    }

    /// Create a symlink at `link_path` pointing at `target`. The target is
    /// stored verbatim; it may be relative and may dangle.
    pub async fn symlink(&self, target: &str, link_path: &str) -> FsResult<()> {
        self.symlink_with(target, link_path, SymlinkType::File).await
    }

    pub fn symlink_sync(&self, target: &str, link_path: &str) -> FsResult<()> {
        self.symlink_with_sync(target, link_path, SymlinkType::File)
    }

    pub async fn symlink_with(
        &self,
        target: &str,
        link_path: &str,
        _kind: SymlinkType,
    ) -> FsResult<()> {
        if target.is_empty() || target.as_bytes().contains(&0) {
            return Err(FsError::invalid(link_path).with_syscall("symlink"));
        }
        let p = normalize(link_path)?;
        match self.stat_nofollow(&p).await {
            Ok(_) => return Err(FsError::exists(&p).with_syscall("symlink")),
            Err(e) if e.kind == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let creds = self.credentials();
        let parent = dirname(&p).to_string();
        let parent_st = self.stat_nofollow(&parent).await?;
        if !parent_st.is_dir() {
            return Err(FsError::not_directory(parent).with_syscall("symlink"));
        }
        if !parent_st.has_access(W_OK, &creds) {
            return Err(FsError::access_denied(parent).with_syscall("symlink"));
        }
        let resolved = self.resolve(&p)?;
        let owner = self.create_owner(&resolved, &parent_st, &creds);
        let file = resolved
            .backend
            .create_file(
                &resolved.local_path,
                OpenFlags::parse("w")?,
                S_IFLNK | 0o644,
                owner,
            )
            .await
            .map_err(remap(&resolved, &p))?;
        let result = file.write(target.as_bytes(), 0).await.map(|_| ());
        finish(result, file.close().await).map_err(remap(&resolved, &p))?;
        self.emit(EventType::Rename, &p);
        Ok(())
    }

    pub fn symlink_with_sync(
        &self,
        target: &str,
        link_path: &str,
        _kind: SymlinkType,
    ) -> FsResult<()> {
        if target.is_empty() || target.as_bytes().contains(&0) {
            return Err(FsError::invalid(link_path).with_syscall("symlink"));
        }
        let p = normalize(link_path)?;
        match self.stat_nofollow_sync(&p) {
            Ok(_) => return Err(FsError::exists(&p).with_syscall("symlink")),
            Err(e) if e.kind == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let creds = self.credentials();
        let parent = dirname(&p).to_string();
        let parent_st = self.stat_nofollow_sync(&parent)?;
        if !parent_st.is_dir() {
            return Err(FsError::not_directory(parent).with_syscall("symlink"));
        }
        if !parent_st.has_access(W_OK, &creds) {
            return Err(FsError::access_denied(parent).with_syscall("symlink"));
        }
        let resolved = self.resolve(&p)?;
        let owner = self.create_owner(&resolved, &parent_st, &creds);
        let file = resolved
            .backend
            .create_file_sync(
                &resolved.local_path,
                OpenFlags::parse("w")?,
                S_IFLNK | 0o644,
                owner,
            )
            .map_err(remap(&resolved, &p))?;
        let result = file.write_sync(target.as_bytes(), 0).map(|_| ());
        finish(result, file.close_sync()).map_err(remap(&resolved, &p))?;
        self.emit(EventType::Rename, &p);
        Ok(())
    }

    /// The stored target of a symlink; `EINVAL` if the node is not one.
    pub async fn readlink(&self, path: &str) -> FsResult<String> {
        let p = normalize(path)?;
        let resolved = self.resolve(&p)?;
        let st = resolved
            .backend
            .stat(&resolved.local_path)
            .await
            .map_err(remap(&resolved, &p))?;
        if !st.is_symlink() {
            return Err(FsError::invalid(&p).with_syscall("readlink"));
        }
        self.read_link_target(&resolved, &p).await
    }

    pub fn readlink_sync(&self, path: &str) -> FsResult<String> {
        let p = normalize(path)?;
        let resolved = self.resolve(&p)?;
        let st = resolved
            .backend
            .stat_sync(&resolved.local_path)
            .map_err(remap(&resolved, &p))?;
        if !st.is_symlink() {
            return Err(FsError::invalid(&p).with_syscall("readlink"));
        }
        self.read_link_target_sync(&resolved, &p)
    }

    // ------------------------------------------------------------------
    // Composed operations

    /// Rename. Same-mount renames delegate to the backend; cross-mount
    /// renames copy the bytes and unlink the source.
    pub async fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        let old = normalize(from)?;
        let new = normalize(to)?;
        let creds = self.credentials();
        for parent in [dirname(&old).to_string(), dirname(&new).to_string()] {
            let st = self.stat_nofollow(&parent).await?;
            if !st.has_access(W_OK, &creds) {
                return Err(FsError::access_denied(parent).with_syscall("rename"));
            }
        }
        let ro = self.resolve(&old)?;
        let rn = self.resolve(&new)?;
        if ro.mount_point == rn.mount_point {
            ro.backend
                .rename(&ro.local_path, &rn.local_path)
                .await
                .map_err(|e| {
                    e.remap_paths(&[
                        (ro.local_path.as_str(), old.as_str()),
                        (rn.local_path.as_str(), new.as_str()),
                    ])
                })?;
        } else {
            trace!(from = %old, to = %new, "cross-mount rename, copying bytes");
            let data = self.read_file(&old).await?;
            self.write_file(&new, &data).await?;
            self.unlink(&old).await?;
        }
        self.emit(EventType::Rename, &old);
        self.emit(EventType::Change, &new);
        Ok(())
    }

    pub fn rename_sync(&self, from: &str, to: &str) -> FsResult<()> {
        let old = normalize(from)?;
        let new = normalize(to)?;
        let creds = self.credentials();
        for parent in [dirname(&old).to_string(), dirname(&new).to_string()] {
            let st = self.stat_nofollow_sync(&parent)?;
            if !st.has_access(W_OK, &creds) {
                return Err(FsError::access_denied(parent).with_syscall("rename"));
            }
        }
        let ro = self.resolve(&old)?;
        let rn = self.resolve(&new)?;
        if ro.mount_point == rn.mount_point {
            ro.backend
                .rename_sync(&ro.local_path, &rn.local_path)
                .map_err(|e| {
                    e.remap_paths(&[
                        (ro.local_path.as_str(), old.as_str()),
                        (rn.local_path.as_str(), new.as_str()),
                    ])
                })?;
        } else {
            let data = self.read_file_sync(&old)?;
            self.write_file_sync(&new, &data)?;
            self.unlink_sync(&old)?;
        }
        self.emit(EventType::Rename, &old);
        self.emit(EventType::Change, &new);
        Ok(())
    }

    /// Remove a file, or a whole tree with `recursive`. Children are deleted
    /// before their directory. `force` suppresses `ENOENT` everywhere.
    pub async fn rm(&self, path: &str, options: &RmOptions) -> FsResult<()> {
        let p = normalize(path)?;
        self.rm_node(p, *options).await
    }

    fn rm_node(&self, p: String, options: RmOptions) -> BoxFuture<'_, FsResult<()>> {
        Box::pin(async move {
            let st = match self.stat_nofollow(&p).await {
                Err(e) if e.kind == ErrorKind::NotFound && options.force => return Ok(()),
                other => other?,
            };
            if st.is_dir() {
                if !options.recursive {
                    return Err(FsError::is_directory(&p).with_syscall("rm"));
                }
                for name in self.readdir(&p).await? {
                    let child = join(&p, &name)?;
                    self.rm_node(child, options).await?;
                }
                match self.rmdir(&p).await {
                    Err(e) if e.kind == ErrorKind::NotFound && options.force => Ok(()),
                    other => other,
                }
            } else {
                match self.unlink(&p).await {
                    Err(e) if e.kind == ErrorKind::NotFound && options.force => Ok(()),
                    other => other,
                }
            }
        })
    }

    pub fn rm_sync(&self, path: &str, options: &RmOptions) -> FsResult<()> {
        let p = normalize(path)?;
        self.rm_node_sync(&p, *options)
    }

    fn rm_node_sync(&self, p: &str, options: RmOptions) -> FsResult<()> {
        let st = match self.stat_nofollow_sync(p) {
            Err(e) if e.kind == ErrorKind::NotFound && options.force => return Ok(()),
            other => other?,
        };
        if st.is_dir() {
            if !options.recursive {
                return Err(FsError::is_directory(p).with_syscall("rm"));
            }
            for name in self.readdir_sync(p)? {
                let child = join(p, &name)?;
                self.rm_node_sync(&child, options)?;
            }
            match self.rmdir_sync(p) {
                Err(e) if e.kind == ErrorKind::NotFound && options.force => Ok(()),
                other => other,
            }
        } else {
            match self.unlink_sync(p) {
                Err(e) if e.kind == ErrorKind::NotFound && options.force => Ok(()),
                other => other,
            }
        }
    }

    /// Copy one file's bytes and permission bits. `COPYFILE_EXCL` fails
    /// `EEXIST` when the destination exists.
    pub async fn copy_file(&self, src: &str, dst: &str, flags: u32) -> FsResult<()> {
        if flags & COPYFILE_EXCL != 0 && self.exists(dst).await? {
            return Err(FsError::exists(dst).with_syscall("copyfile"));
        }
        let st = self.stat(src).await?;
        let data = self.read_file(src).await?;
        self.write_file_with(
            dst,
            &data,
            &WriteOptions {
                flag: "w".to_string(),
                mode: st.mode & 0o7777,
            },
        )
        .await
    }

    pub fn copy_file_sync(&self, src: &str, dst: &str, flags: u32) -> FsResult<()> {
        if flags & COPYFILE_EXCL != 0 && self.exists_sync(dst)? {
            return Err(FsError::exists(dst).with_syscall("copyfile"));
        }
        let st = self.stat_sync(src)?;
        let data = self.read_file_sync(src)?;
        self.write_file_with_sync(
            dst,
            &data,
            &WriteOptions {
                flag: "w".to_string(),
                mode: st.mode & 0o7777,
            },
        )
    }

    /// Recursive copy. Directories require `recursive`; symlinks are copied
    /// as links unless `dereference` is set.
    pub async fn cp(&self, src: &str, dst: &str, options: &CpOptions) -> FsResult<()> {
        let s = normalize(src)?;
        let d = normalize(dst)?;
        self.cp_node(s, d, options.clone()).await
    }

    fn cp_node(&self, src: String, dst: String, options: CpOptions) -> BoxFuture<'_, FsResult<()>> {
        Box::pin(async move {
            if let Some(filter) = &options.filter {
                if !filter(&src, &dst) {
                    return Ok(());
                }
            }
            let st = if options.dereference {
                self.stat(&src).await?
            } else {
                self.stat_nofollow(&src).await?
            };
            if st.is_dir() {
                if !options.recursive {
                    return Err(FsError::is_directory(&src).with_syscall("cp"));
                }
                if !self.exists(&dst).await? {
                    self.mkdir(
                        &dst,
                        &MkdirOptions {
                            recursive: false,
                            mode: st.mode & 0o7777,
                        },
                    )
                    .await?;
                }
                for name in self.readdir(&src).await? {
                    let child_src = join(&src, &name)?;
                    let child_dst = join(&dst, &name)?;
                    self.cp_node(child_src, child_dst, options.clone()).await?;
                }
            } else if st.is_symlink() && !options.dereference {
                let target = self.readlink(&src).await?;
                if self.lstat(&dst).await.is_ok() {
                    if options.error_on_exist {
                        return Err(FsError::exists(&dst).with_syscall("cp"));
                    }
                    self.unlink(&dst).await?;
                }
                self.symlink(&target, &dst).await?;
            } else {
                if options.error_on_exist && self.exists(&dst).await? {
                    return Err(FsError::exists(&dst).with_syscall("cp"));
                }
                let data = self.read_file(&src).await?;
                self.write_file_with(
                    &dst,
                    &data,
                    &WriteOptions {
                        flag: "w".to_string(),
                        mode: st.mode & 0o7777,
                    },
                )
                .await?;
            }
            if options.preserve_timestamps {
                self.lutimes(&dst, st.atime_ms, st.mtime_ms).await?;
            }
            Ok(())
        })
    }

    pub fn cp_sync(&self, src: &str, dst: &str, options: &CpOptions) -> FsResult<()> {
        let s = normalize(src)?;
        let d = normalize(dst)?;
        self.cp_node_sync(&s, &d, options)
    }

    fn cp_node_sync(&self, src: &str, dst: &str, options: &CpOptions) -> FsResult<()> {
        if let Some(filter) = &options.filter {
            if !filter(src, dst) {
                return Ok(());
            }
        }
        let st = if options.dereference {
            self.stat_sync(src)?
        } else {
            self.stat_nofollow_sync(src)?
        };
        if st.is_dir() {
            if !options.recursive {
                return Err(FsError::is_directory(src).with_syscall("cp"));
            }
            if !self.exists_sync(dst)? {
                self.mkdir_sync(
                    dst,
                    &MkdirOptions {
                        recursive: false,
                        mode: st.mode & 0o7777,
                    },
                )?;
            }
            for name in self.readdir_sync(src)? {
                let child_src = join(src, &name)?;
                let child_dst = join(dst, &name)?;
                self.cp_node_sync(&child_src, &child_dst, options)?;
            }
        } else if st.is_symlink() && !options.dereference {
            let target = self.readlink_sync(src)?;
            if self.lstat_sync(dst).is_ok() {
                if options.error_on_exist {
                    return Err(FsError::exists(dst).with_syscall("cp"));
                }
                self.unlink_sync(dst)?;
            }
            self.symlink_sync(&target, dst)?;
        } else {
            if options.error_on_exist && self.exists_sync(dst)? {
                return Err(FsError::exists(dst).with_syscall("cp"));
            }
            let data = self.read_file_sync(src)?;
            self.write_file_with_sync(
                dst,
                &data,
                &WriteOptions {
                    flag: "w".to_string(),
                    mode: st.mode & 0o7777,
                },
            )?;
        }
        if options.preserve_timestamps {
            self.lutimes_sync(dst, st.atime_ms, st.mtime_ms)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Filesystem-level queries

    /// Synthesized from the owning backend's metadata.
    pub fn statfs(&self, path: &str) -> FsResult<StatsFs> {
        let p = normalize(path)?;
        let resolved = self.resolve(&p)?;
        let md = resolved.backend.metadata();
        let bsize: u32 = 4096;
        Ok(StatsFs {
            bsize,
            blocks: md.total_space / bsize as u64,
            bfree: md.free_space / bsize as u64,
            bavail: md.free_space / bsize as u64,
            files: 0,
            ffree: 0,
        })
    }

    /// Subscribe to change events for `path` (and its direct children; all
    /// descendants with `recursive`).
    pub fn watch(&self, path: &str, recursive: bool) -> FsResult<Watcher> {
        let p = normalize(path)?;
        Ok(self.inner.watchers.subscribe(p, recursive))
    }

    // ------------------------------------------------------------------
    // Globbing

    /// Paths matching a `*`/`?`/`**` pattern, walked from the pattern's
    /// literal prefix. For custom matching use [`glob_with`](Self::glob_with).
    pub async fn glob(&self, pattern: &str) -> FsResult<Vec<String>> {
        let pattern = normalize(pattern)?;
        let matcher = glob_to_regex(&pattern)?;
        let root = glob_literal_root(&pattern);
        self.glob_with(&root, move |p| matcher.is_match(p)).await
    }

    /// Walk everything under `root` and keep paths the matcher accepts.
    pub async fn glob_with<M>(&self, root: &str, matcher: M) -> FsResult<Vec<String>>
    where
        M: Fn(&str) -> bool,
    {
        let root = normalize(root)?;
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(dir) = stack.pop() {
            let names = match self.readdir(&dir).await {
                Ok(names) => names,
                Err(e)
                    if e.kind == ErrorKind::NotFound || e.kind == ErrorKind::NotDirectory =>
                {
                    continue
                }
                Err(e) => return Err(e),
            };
            for name in names {
                let child = join(&dir, &name)?;
                if matcher(&child) {
                    out.push(child.clone());
                }
                if let Ok(st) = self.stat_nofollow(&child).await {
                    if st.is_dir() {
                        stack.push(child);
                    }
                }
            }
        }
        Ok(out)
    }

    pub fn glob_sync(&self, pattern: &str) -> FsResult<Vec<String>> {
        let pattern = normalize(pattern)?;
        let matcher = glob_to_regex(&pattern)?;
        let root = glob_literal_root(&pattern);
        self.glob_with_sync(&root, move |p| matcher.is_match(p))
    }

    pub fn glob_with_sync<M>(&self, root: &str, matcher: M) -> FsResult<Vec<String>>
    where
        M: Fn(&str) -> bool,
    {
        let root = normalize(root)?;
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(dir) = stack.pop() {
            let names = match self.readdir_sync(&dir) {
                Ok(names) => names,
                Err(e)
                    if e.kind == ErrorKind::NotFound || e.kind == ErrorKind::NotDirectory =>
                {
                    continue
                }
                Err(e) => return Err(e),
            };
            for name in names {
                let child = join(&dir, &name)?;
                if matcher(&child) {
                    out.push(child.clone());
                }
                if let Ok(st) = self.stat_nofollow_sync(&child) {
                    if st.is_dir() {
                        stack.push(child);
                    }
                }
            }
        }
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Descriptor operations

    pub async fn close(&self, fd: Fd) -> FsResult<()> {
        let of = self.inner.fds.remove(fd)?;
        of.mark_closed();
        of.file.close().await
    }

    pub fn close_sync(&self, fd: Fd) -> FsResult<()> {
        let of = self.inner.fds.remove(fd)?;
        of.mark_closed();
        of.file.close_sync()
    }

    pub async fn fstat(&self, fd: Fd) -> FsResult<Stats> {
        let of = self.inner.fds.get(fd)?;
        of.guard_open()?;
        of.file.stat().await
    }

    pub fn fstat_sync(&self, fd: Fd) -> FsResult<Stats> {
        let of = self.inner.fds.get(fd)?;
        of.guard_open()?;
        of.file.stat_sync()
    }

    /// Read into `buf`. A `None` position uses (and advances) the
    /// descriptor's own position.
    pub async fn read(&self, fd: Fd, buf: &mut [u8], position: Option<u64>) -> FsResult<usize> {
        let of = self.inner.fds.get(fd)?;
        of.guard_open()?;
        if !of.flags.readable {
            return Err(FsError::bad_fd().with_path(&of.path).with_syscall("read"));
        }
        let pos = position.unwrap_or_else(|| of.position.load(Ordering::SeqCst));
        let n = of.file.read(buf, pos).await?;
        if position.is_none() {
            of.position.store(pos + n as u64, Ordering::SeqCst);
        }
        Ok(n)
    }

    pub fn read_sync(&self, fd: Fd, buf: &mut [u8], position: Option<u64>) -> FsResult<usize> {
        let of = self.inner.fds.get(fd)?;
        of.guard_open()?;
        if !of.flags.readable {
            return Err(FsError::bad_fd().with_path(&of.path).with_syscall("read"));
        }
        let pos = position.unwrap_or_else(|| of.position.load(Ordering::SeqCst));
        let n = of.file.read_sync(buf, pos)?;
        if position.is_none() {
            of.position.store(pos + n as u64, Ordering::SeqCst);
        }
        Ok(n)
    }

    /// Write `data`. Append-mode descriptors always write at end of file.
    pub async fn write(&self, fd: Fd, data: &[u8], position: Option<u64>) -> FsResult<usize> {
        let of = self.inner.fds.get(fd)?;
        of.guard_open()?;
        if !of.flags.writable && !of.flags.appendable {
            return Err(FsError::bad_fd().with_path(&of.path).with_syscall("write"));
        }
        let pos = if of.flags.appendable {
            of.file.stat().await?.size
        } else {
            position.unwrap_or_else(|| of.position.load(Ordering::SeqCst))
        };
        let n = of.file.write(data, pos).await?;
        if position.is_none() {
            of.position.store(pos + n as u64, Ordering::SeqCst);
        }
        self.emit(EventType::Change, &of.path);
        Ok(n)
    }

    pub fn write_sync(&self, fd: Fd, data: &[u8], position: Option<u64>) -> FsResult<usize> {
        let of = self.inner.fds.get(fd)?;
        of.guard_open()?;
        if !of.flags.writable && !of.flags.appendable {
            return Err(FsError::bad_fd().with_path(&of.path).with_syscall("write"));
        }
        let pos = if of.flags.appendable {
            of.file.stat_sync()?.size
        } else {
            position.unwrap_or_else(|| of.position.load(Ordering::SeqCst))
        };
        let n = of.file.write_sync(data, pos)?;
        if position.is_none() {
            of.position.store(pos + n as u64, Ordering::SeqCst);
        }
        self.emit(EventType::Change, &of.path);
        Ok(n)
    }

    /// Scatter read into several buffers at consecutive positions.
    pub async fn readv(
        &self,
        fd: Fd,
        bufs: &mut [&mut [u8]],
        position: Option<u64>,
    ) -> FsResult<usize> {
        let mut total = 0;
        let mut pos = position;
        for buf in bufs.iter_mut() {
            let n = self.read(fd, buf, pos).await?;
            total += n;
            if let Some(p) = pos.as_mut() {
                *p += n as u64;
            }
            if n < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    pub fn readv_sync(
        &self,
        fd: Fd,
        bufs: &mut [&mut [u8]],
        position: Option<u64>,
    ) -> FsResult<usize> {
        let mut total = 0;
        let mut pos = position;
        for buf in bufs.iter_mut() {
            let n = self.read_sync(fd, buf, pos)?;
            total += n;
            if let Some(p) = pos.as_mut() {
                *p += n as u64;
            }
            if n < buf.len() {
                break;
            }
        }
        Ok(total)
    }

    /// Gather write from several buffers at consecutive positions.
    pub async fn writev(&self, fd: Fd, bufs: &[&[u8]], position: Option<u64>) -> FsResult<usize> {
        let mut total = 0;
        let mut pos = position;
        for buf in bufs {
            let n = self.write(fd, buf, pos).await?;
            total += n;
            if let Some(p) = pos.as_mut() {
                *p += n as u64;
            }
        }
        Ok(total)
    }

    pub fn writev_sync(&self, fd: Fd, bufs: &[&[u8]], position: Option<u64>) -> FsResult<usize> {
        let mut total = 0;
        let mut pos = position;
        for buf in bufs {
            let n = self.write_sync(fd, buf, pos)?;
            total += n;
            if let Some(p) = pos.as_mut() {
                *p += n as u64;
            }
        }
        Ok(total)
    }

    pub async fn ftruncate(&self, fd: Fd, size: u64) -> FsResult<()> {
        let of = self.inner.fds.get(fd)?;
        of.guard_open()?;
        if !of.flags.writable && !of.flags.appendable {
            return Err(FsError::bad_fd().with_path(&of.path).with_syscall("ftruncate"));
        }
        of.file.truncate(size).await?;
        self.emit(EventType::Change, &of.path);
        Ok(())
    }

    pub fn ftruncate_sync(&self, fd: Fd, size: u64) -> FsResult<()> {
        let of = self.inner.fds.get(fd)?;
        of.guard_open()?;
        if !of.flags.writable && !of.flags.appendable {
            return Err(FsError::bad_fd().with_path(&of.path).with_syscall("ftruncate"));
        }
        of.file.truncate_sync(size)?;
        self.emit(EventType::Change, &of.path);
        Ok(())
    }

    pub async fn fsync(&self, fd: Fd) -> FsResult<()> {
        let of = self.inner.fds.get(fd)?;
        of.guard_open()?;
        of.file.sync().await
    }

    pub fn fsync_sync(&self, fd: Fd) -> FsResult<()> {
        let of = self.inner.fds.get(fd)?;
        of.guard_open()?;
        of.file.sync_sync()
    }

    pub async fn fdatasync(&self, fd: Fd) -> FsResult<()> {
        let of = self.inner.fds.get(fd)?;
        of.guard_open()?;
        of.file.datasync().await
    }

    pub fn fdatasync_sync(&self, fd: Fd) -> FsResult<()> {
        let of = self.inner.fds.get(fd)?;
        of.guard_open()?;
        of.file.datasync_sync()
    }

    pub async fn fchmod(&self, fd: Fd, mode: u32) -> FsResult<()> {
        let of = self.inner.fds.get(fd)?;
        of.guard_open()?;
        let st = of.file.stat().await?;
        Self::chmod_allowed(&st, &self.credentials(), &of.path)?;
        of.file.chmod(mode & 0o7777).await?;
        self.emit(EventType::Change, &of.path);
        Ok(())
    }

    pub fn fchmod_sync(&self, fd: Fd, mode: u32) -> FsResult<()> {
        let of = self.inner.fds.get(fd)?;
        of.guard_open()?;
        let st = of.file.stat_sync()?;
        Self::chmod_allowed(&st, &self.credentials(), &of.path)?;
        of.file.chmod_sync(mode & 0o7777)?;
        self.emit(EventType::Change, &of.path);
        Ok(())
    }

    pub async fn fchown(&self, fd: Fd, uid: u32, gid: u32) -> FsResult<()> {
        let of = self.inner.fds.get(fd)?;
        of.guard_open()?;
        let st = of.file.stat().await?;
        Self::chown_allowed(&st, &self.credentials(), uid, gid, &of.path)?;
        of.file.chown(uid, gid).await?;
        if st.mode & (S_ISUID | S_ISGID) != 0 {
            of.file.chmod(st.mode & 0o7777 & !(S_ISUID | S_ISGID)).await?;
        }
        self.emit(EventType::Change, &of.path);
        Ok(())
    }

    pub fn fchown_sync(&self, fd: Fd, uid: u32, gid: u32) -> FsResult<()> {
        let of = self.inner.fds.get(fd)?;
        of.guard_open()?;
        let st = of.file.stat_sync()?;
        Self::chown_allowed(&st, &self.credentials(), uid, gid, &of.path)?;
        of.file.chown_sync(uid, gid)?;
        if st.mode & (S_ISUID | S_ISGID) != 0 {
            of.file.chmod_sync(st.mode & 0o7777 & !(S_ISUID | S_ISGID))?;
        }
        self.emit(EventType::Change, &of.path);
        Ok(())
    }

    pub async fn futimes(&self, fd: Fd, atime_ms: i64, mtime_ms: i64) -> FsResult<()> {
        let of = self.inner.fds.get(fd)?;
        of.guard_open()?;
        of.file.utimes(atime_ms, mtime_ms).await?;
        self.emit(EventType::Change, &of.path);
        Ok(())
    }

    pub fn futimes_sync(&self, fd: Fd, atime_ms: i64, mtime_ms: i64) -> FsResult<()> {
        let of = self.inner.fds.get(fd)?;
        of.guard_open()?;
        of.file.utimes_sync(atime_ms, mtime_ms)?;
        self.emit(EventType::Change, &of.path);
        Ok(())
    }

    /// Number of descriptors currently open.
    pub fn open_fds(&self) -> usize {
        self.inner.fds.open_count()
    }
}

fn relative_to(root: &str, path: &str) -> String {
    if root == "/" {
        path.trim_start_matches('/').to_string()
    } else {
        path.strip_prefix(root)
            .map(|r| r.trim_start_matches('/').to_string())
            .unwrap_or_else(|| path.to_string())
    }
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Six base36 characters derived from the clock and a process-local counter.
/// Consecutive calls always differ: the counter stride is coprime to 36, so
/// the first digit alone already distinguishes them.
fn temp_suffix() -> String {
    let count = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut n = (crate::stats::now_ms() as u64).wrapping_add(count.wrapping_mul(0x10001));
    let mut out = String::with_capacity(6);
    for _ in 0..6 {
        let digit = (n % 36) as u32;
        out.push(char::from_digit(digit, 36).unwrap_or('0'));
        n = n / 36 + 7919;
    }
    out
}

fn glob_to_regex(pattern: &str) -> FsResult<regex::Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    // `**/` spans zero or more whole directories.
                    if chars.peek() == Some(&'/') {
                        chars.next();
                        re.push_str("(?:.*/)?");
                    } else {
                        re.push_str(".*");
                    }
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push_str("[^/]"),
            '\\' | '.' | '+' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$' => {
                re.push('\\');
                re.push(c);
            }
            c => re.push(c),
        }
    }
    re.push('$');
    regex::Regex::new(&re).map_err(|_| FsError::invalid(pattern).with_syscall("glob"))
}

/// The leading pattern components with no metacharacters; the walk starts
/// there instead of `/`.
fn glob_literal_root(pattern: &str) -> String {
    let mut root = String::from("/");
    for segment in pattern.split('/').filter(|s| !s.is_empty()) {
        if segment.contains(['*', '?']) {
            break;
        }
        if root.len() > 1 {
            root.push('/');
        }
        root.push_str(segment);
    }
    if root.len() > 1 && root.ends_with('/') {
        root.pop();
    }
    root
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_translation() {
        let re = glob_to_regex("/a/*.txt").unwrap();
        assert!(re.is_match("/a/x.txt"));
        assert!(!re.is_match("/a/b/x.txt"));

        let deep = glob_to_regex("/a/**/x").unwrap();
        assert!(deep.is_match("/a/b/c/x"));

        let q = glob_to_regex("/f?").unwrap();
        assert!(q.is_match("/fa"));
        assert!(!q.is_match("/f"));
    }

    #[test]
    fn glob_roots() {
        assert_eq!(glob_literal_root("/a/b/*.rs"), "/a/b");
        assert_eq!(glob_literal_root("/*.rs"), "/");
        assert_eq!(glob_literal_root("/a/**"), "/a");
    }

    #[test]
    fn temp_suffixes_differ() {
        let a = temp_suffix();
        let b = temp_suffix();
        assert_eq!(a.len(), 6);
        assert_ne!(a, b);
    }
}
