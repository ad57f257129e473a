// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Overlay backend
//!
//! Layers a writable `upper` filesystem over a readable `lower` one. Reads
//! prefer `upper`; a write to a lower-only path first materializes it on
//! `upper` (copy-up). Deletions of lower paths cannot touch `lower`, so they
//! are recorded in a deletion log at `/.deleted` on `upper` and replayed
//! into an in-memory set on startup.
//!
//! A path P is visible iff it exists on upper, or exists on lower and is not
//! in the deleted set. Every operation validates against that merged view
//! before mutating anything.
//!
//! Composed operations here (copy-up, log rewrites) assume they never
//! overlap; mount the overlay wrapped in [`MutexedFs`] (see
//! [`OverlayFs::mutexed`]).

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tracing::trace;

use crate::backend::{BackendMetadata, FileSystem, FsFile, Owner};
use crate::error::{ErrorKind, FsError, FsResult};
use crate::flags::OpenFlags;
use crate::mutex::MutexedFs;
use crate::path::{dirname, join};
use crate::stats::{now_ms, Stats, S_IFREG};

/// Path of the deletion log on the upper filesystem.
pub const DELETION_LOG: &str = "/.deleted";

/// Options for [`OverlayFs`].
#[derive(Clone)]
pub struct OverlayOptions {
    /// The writable layer. All mutations land here.
    pub upper: Arc<dyn FileSystem>,
    /// The readable layer. Never written.
    pub lower: Arc<dyn FileSystem>,
}

impl OverlayOptions {
    pub fn validate(&self) -> FsResult<()> {
        if self.upper.metadata().readonly {
            return Err(FsError::invalid("upper backend must be writable"));
        }
        Ok(())
    }
}

struct LogWriter {
    in_flight: bool,
    pending: bool,
    error: Option<FsError>,
}

struct OverlayInner {
    upper: Arc<dyn FileSystem>,
    lower: Arc<dyn FileSystem>,
    deleted: RwLock<HashSet<String>>,
    log: Mutex<LogWriter>,
}

/// The overlay backend. See the module docs for semantics.
pub struct OverlayFs {
    inner: Arc<OverlayInner>,
}

impl OverlayFs {
    pub fn new(options: OverlayOptions) -> FsResult<Self> {
        options.validate()?;
        Ok(Self {
            inner: Arc::new(OverlayInner {
                upper: options.upper,
                lower: options.lower,
                deleted: RwLock::new(HashSet::new()),
                log: Mutex::new(LogWriter {
                    in_flight: false,
                    pending: false,
                    error: None,
                }),
            }),
        })
    }

    /// The overlay wrapped in the serialization adapter, ready to mount.
    pub fn mutexed(options: OverlayOptions) -> FsResult<MutexedFs> {
        Ok(MutexedFs::new(Arc::new(Self::new(options)?)))
    }
}

fn parse_log(text: &str) -> HashSet<String> {
    let mut deleted = HashSet::new();
    for line in text.lines() {
        if let Some(path) = line.strip_prefix('d') {
            if !path.is_empty() {
                deleted.insert(path.to_string());
            }
        }
    }
    deleted
}

fn render_log(deleted: &HashSet<String>) -> String {
    let mut paths: Vec<&String> = deleted.iter().collect();
    paths.sort();
    let mut out = String::new();
    for p in paths {
        out.push('d');
        out.push_str(p);
        out.push('\n');
    }
    out
}

fn log_stats(len: usize) -> Stats {
    Stats::new(S_IFREG | 0o644, 0, 0, len as u64, 0)
}

/// Read a whole file from `fs`.
async fn read_all(fs: &Arc<dyn FileSystem>, path: &str) -> FsResult<Vec<u8>> {
    let stats = fs.stat(path).await?;
    let file = fs.open_file(path, OpenFlags::parse("r")?).await?;
    let mut buf = vec![0u8; stats.size as usize];
    let result = file.read(&mut buf, 0).await;
    let close_result = file.close().await;
    let n = result?;
    close_result?;
    buf.truncate(n);
    Ok(buf)
}

fn read_all_sync(fs: &Arc<dyn FileSystem>, path: &str) -> FsResult<Vec<u8>> {
    let stats = fs.stat_sync(path)?;
    let file = fs.open_file_sync(path, OpenFlags::parse("r")?)?;
    let mut buf = vec![0u8; stats.size as usize];
    let result = file.read_sync(&mut buf, 0);
    let close_result = file.close_sync();
    let n = result?;
    close_result?;
    buf.truncate(n);
    Ok(buf)
}

impl OverlayInner {
    fn is_deleted(&self, path: &str) -> bool {
        self.deleted.read().unwrap().contains(path)
    }

    /// Surface (and clear) any error latched by the background log writer.
    fn check_log_error(&self) -> FsResult<()> {
        let mut log = self.log.lock().unwrap();
        match log.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Schedule a deletion-log rewrite. Writes are coalesced: while one is
    /// in flight the next request only sets a flag, and the in-flight writer
    /// runs again after finishing. Errors are latched for the next public
    /// call to surface.
    fn queue_log_write(self: &Arc<Self>) {
        {
            let mut log = self.log.lock().unwrap();
            if log.in_flight {
                log.pending = true;
                return;
            }
            log.in_flight = true;
        }
        let inner = self.clone();
        tokio::spawn(async move {
            loop {
                let content = render_log(&inner.deleted.read().unwrap().clone());
                trace!(bytes = content.len(), "rewriting deletion log");
                let result = inner
                    .upper
                    .sync(DELETION_LOG, content.as_bytes(), &log_stats(content.len()))
                    .await;
                let mut log = inner.log.lock().unwrap();
                if let Err(err) = result {
                    log.error = Some(err);
                }
                if log.pending {
                    log.pending = false;
                } else {
                    log.in_flight = false;
                    break;
                }
            }
        });
    }

    /// Blocking log rewrite for the sync surface.
    fn write_log_sync(&self) -> FsResult<()> {
        let content = render_log(&self.deleted.read().unwrap().clone());
        self.upper
            .sync_sync(DELETION_LOG, content.as_bytes(), &log_stats(content.len()))
    }

    fn mark_deleted(self: &Arc<Self>, path: &str) {
        self.deleted.write().unwrap().insert(path.to_string());
        self.queue_log_write();
    }

    fn mark_deleted_sync(&self, path: &str) -> FsResult<()> {
        self.deleted.write().unwrap().insert(path.to_string());
        self.write_log_sync()
    }

    /// Clear a deletion mark, rewriting the log only when something changed.
    fn unmark_deleted(self: &Arc<Self>, path: &str) {
        if self.deleted.write().unwrap().remove(path) {
            self.queue_log_write();
        }
    }

    fn unmark_deleted_sync(&self, path: &str) -> FsResult<()> {
        if self.deleted.write().unwrap().remove(path) {
            self.write_log_sync()?;
        }
        Ok(())
    }

    /// Merged-view stat: upper wins; lower hits are reported writable so the
    /// view reflects what a subsequent copy-up will produce.
    async fn merged_stat(&self, path: &str) -> FsResult<Stats> {
        if path != "/" && self.is_deleted(path) {
            return Err(FsError::not_found(path));
        }
        match self.upper.stat(path).await {
            Ok(stats) => Ok(stats),
            Err(e) if e.kind == ErrorKind::NotFound => {
                let mut stats = self.lower.stat(path).await?;
                stats.mode |= 0o222;
                Ok(stats)
            }
            Err(e) => Err(e),
        }
    }

    fn merged_stat_sync(&self, path: &str) -> FsResult<Stats> {
        if path != "/" && self.is_deleted(path) {
            return Err(FsError::not_found(path));
        }
        match self.upper.stat_sync(path) {
            Ok(stats) => Ok(stats),
            Err(e) if e.kind == ErrorKind::NotFound => {
                let mut stats = self.lower.stat_sync(path)?;
                stats.mode |= 0o222;
                Ok(stats)
            }
            Err(e) => Err(e),
        }
    }

    /// Create every missing ancestor of `path` on upper, copying each
    /// directory's mode and ownership from the merged view.
    async fn ensure_upper_parents(&self, path: &str) -> FsResult<()> {
        let mut ancestors = Vec::new();
        let mut dir = dirname(path).to_string();
        while dir != "/" {
            ancestors.push(dir.clone());
            dir = dirname(&dir).to_string();
        }
        for ancestor in ancestors.into_iter().rev() {
            if self.upper.exists(&ancestor).await? {
                continue;
            }
            let stats = self.merged_stat(&ancestor).await?;
            self.upper
                .mkdir(
                    &ancestor,
                    stats.mode & 0o7777,
                    Owner {
                        uid: stats.uid,
                        gid: stats.gid,
                    },
                )
                .await?;
        }
        Ok(())
    }

    fn ensure_upper_parents_sync(&self, path: &str) -> FsResult<()> {
        let mut ancestors = Vec::new();
        let mut dir = dirname(path).to_string();
        while dir != "/" {
            ancestors.push(dir.clone());
            dir = dirname(&dir).to_string();
        }
        for ancestor in ancestors.into_iter().rev() {
            if self.upper.exists_sync(&ancestor)? {
                continue;
            }
            let stats = self.merged_stat_sync(&ancestor)?;
            self.upper.mkdir_sync(
                &ancestor,
                stats.mode & 0o7777,
                Owner {
                    uid: stats.uid,
                    gid: stats.gid,
                },
            )?;
        }
        Ok(())
    }

    /// Materialize a lower-only `path` on upper so it can be modified.
    async fn copy_up(&self, path: &str) -> FsResult<()> {
        let stats = self.lower.stat(path).await?;
        self.ensure_upper_parents(path).await?;
        if stats.is_dir() {
            self.upper
                .mkdir(
                    path,
                    stats.mode & 0o7777,
                    Owner {
                        uid: stats.uid,
                        gid: stats.gid,
                    },
                )
                .await
        } else {
            let data = read_all(&self.lower, path).await?;
            let mut up = stats;
            up.mode |= 0o222;
            self.upper.sync(path, &data, &up).await
        }
    }

    fn copy_up_sync(&self, path: &str) -> FsResult<()> {
        let stats = self.lower.stat_sync(path)?;
        self.ensure_upper_parents_sync(path)?;
        if stats.is_dir() {
            self.upper.mkdir_sync(
                path,
                stats.mode & 0o7777,
                Owner {
                    uid: stats.uid,
                    gid: stats.gid,
                },
            )
        } else {
            let data = read_all_sync(&self.lower, path)?;
            let mut up = stats;
            up.mode |= 0o222;
            self.upper.sync_sync(path, &data, &up)
        }
    }

    /// Flush a whole-file image to upper, copying up parents as needed.
    /// This is the landing point for preload-handle writes.
    async fn sync_up(&self, path: &str, data: &[u8], stats: &Stats) -> FsResult<()> {
        if !self.upper.exists(path).await? {
            self.ensure_upper_parents(path).await?;
        }
        self.upper.sync(path, data, stats).await
    }

    fn sync_up_sync(&self, path: &str, data: &[u8], stats: &Stats) -> FsResult<()> {
        if !self.upper.exists_sync(path)? {
            self.ensure_upper_parents_sync(path)?;
        }
        self.upper.sync_sync(path, data, stats)
    }
}

#[async_trait]
impl FileSystem for OverlayFs {
    fn metadata(&self) -> BackendMetadata {
        let lower = self.inner.lower.metadata();
        BackendMetadata {
            name: "overlay".to_string(),
            readonly: false,
            features: Vec::new(),
            total_space: lower.total_space,
            free_space: lower.free_space,
        }
    }

    /// Replay the deletion log. A missing log is an empty deleted-set.
    async fn ready(&self) -> FsResult<()> {
        self.inner.upper.ready().await?;
        self.inner.lower.ready().await?;
        let deleted = match read_all(&self.inner.upper, DELETION_LOG).await {
            Ok(bytes) => parse_log(&String::from_utf8_lossy(&bytes)),
            Err(e) if e.kind == ErrorKind::NotFound => HashSet::new(),
            Err(e) => return Err(e),
        };
        *self.inner.deleted.write().unwrap() = deleted;
        Ok(())
    }

    fn ready_sync(&self) -> FsResult<()> {
        self.inner.upper.ready_sync()?;
        self.inner.lower.ready_sync()?;
        let deleted = match read_all_sync(&self.inner.upper, DELETION_LOG) {
            Ok(bytes) => parse_log(&String::from_utf8_lossy(&bytes)),
            Err(e) if e.kind == ErrorKind::NotFound => HashSet::new(),
            Err(e) => return Err(e),
        };
        *self.inner.deleted.write().unwrap() = deleted;
        Ok(())
    }

    async fn stat(&self, path: &str) -> FsResult<Stats> {
        self.inner.check_log_error()?;
        self.inner.merged_stat(path).await
    }
    fn stat_sync(&self, path: &str) -> FsResult<Stats> {
        self.inner.check_log_error()?;
        self.inner.merged_stat_sync(path)
    }

    async fn open_file(&self, path: &str, flags: OpenFlags) -> FsResult<Box<dyn FsFile>> {
        self.inner.check_log_error()?;
        if self.inner.upper.exists(path).await? {
            return self.inner.upper.open_file(path, flags).await;
        }
        if self.inner.is_deleted(path) {
            return Err(FsError::not_found(path));
        }
        let mut stats = self.inner.lower.stat(path).await?;
        stats.mode |= 0o222;
        let data = if stats.is_dir() {
            Vec::new()
        } else {
            read_all(&self.inner.lower, path).await?
        };
        Ok(Box::new(PreloadFile::new(
            self.inner.clone(),
            path.to_string(),
            data,
            stats,
        )))
    }
    fn open_file_sync(&self, path: &str, flags: OpenFlags) -> FsResult<Box<dyn FsFile>> {
        self.inner.check_log_error()?;
        if self.inner.upper.exists_sync(path)? {
            return self.inner.upper.open_file_sync(path, flags);
        }
        if self.inner.is_deleted(path) {
            return Err(FsError::not_found(path));
        }
        let mut stats = self.inner.lower.stat_sync(path)?;
        stats.mode |= 0o222;
        let data = if stats.is_dir() {
            Vec::new()
        } else {
            read_all_sync(&self.inner.lower, path)?
        };
        Ok(Box::new(PreloadFile::new(
            self.inner.clone(),
            path.to_string(),
            data,
            stats,
        )))
    }

    async fn create_file(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: u32,
        owner: Owner,
    ) -> FsResult<Box<dyn FsFile>> {
        self.inner.check_log_error()?;
        self.inner.ensure_upper_parents(path).await?;
        let file = self.inner.upper.create_file(path, flags, mode, owner).await?;
        self.inner.unmark_deleted(path);
        Ok(file)
    }
    fn create_file_sync(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: u32,
        owner: Owner,
    ) -> FsResult<Box<dyn FsFile>> {
        self.inner.check_log_error()?;
        self.inner.ensure_upper_parents_sync(path)?;
        let file = self.inner.upper.create_file_sync(path, flags, mode, owner)?;
        self.inner.unmark_deleted_sync(path)?;
        Ok(file)
    }

    async fn unlink(&self, path: &str) -> FsResult<()> {
        self.inner.check_log_error()?;
        let stats = self.inner.merged_stat(path).await?;
        if stats.is_dir() {
            return Err(FsError::is_directory(path));
        }
        if self.inner.upper.exists(path).await? {
            self.inner.upper.unlink(path).await?;
        }
        if self.inner.lower.exists(path).await? {
            self.inner.mark_deleted(path);
        }
        Ok(())
    }
    fn unlink_sync(&self, path: &str) -> FsResult<()> {
        self.inner.check_log_error()?;
        let stats = self.inner.merged_stat_sync(path)?;
        if stats.is_dir() {
            return Err(FsError::is_directory(path));
        }
        if self.inner.upper.exists_sync(path)? {
            self.inner.upper.unlink_sync(path)?;
        }
        if self.inner.lower.exists_sync(path)? {
            self.inner.mark_deleted_sync(path)?;
        }
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> FsResult<()> {
        self.inner.check_log_error()?;
        let stats = self.inner.merged_stat(path).await?;
        if !stats.is_dir() {
            return Err(FsError::not_directory(path));
        }
        if !self.readdir(path).await?.is_empty() {
            return Err(FsError::not_empty(path));
        }
        if self.inner.upper.exists(path).await? {
            self.inner.upper.rmdir(path).await?;
        }
        if self.inner.lower.exists(path).await? {
            self.inner.mark_deleted(path);
        }
        Ok(())
    }
    fn rmdir_sync(&self, path: &str) -> FsResult<()> {
        self.inner.check_log_error()?;
        let stats = self.inner.merged_stat_sync(path)?;
        if !stats.is_dir() {
            return Err(FsError::not_directory(path));
        }
        if !self.readdir_sync(path)?.is_empty() {
            return Err(FsError::not_empty(path));
        }
        if self.inner.upper.exists_sync(path)? {
            self.inner.upper.rmdir_sync(path)?;
        }
        if self.inner.lower.exists_sync(path)? {
            self.inner.mark_deleted_sync(path)?;
        }
        Ok(())
    }

    async fn mkdir(&self, path: &str, mode: u32, owner: Owner) -> FsResult<()> {
        self.inner.check_log_error()?;
        match self.inner.merged_stat(path).await {
            Ok(_) => return Err(FsError::exists(path)),
            Err(e) if e.kind == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.inner.ensure_upper_parents(path).await?;
        self.inner.upper.mkdir(path, mode, owner).await?;
        self.inner.unmark_deleted(path);
        Ok(())
    }
    fn mkdir_sync(&self, path: &str, mode: u32, owner: Owner) -> FsResult<()> {
        self.inner.check_log_error()?;
        match self.inner.merged_stat_sync(path) {
            Ok(_) => return Err(FsError::exists(path)),
            Err(e) if e.kind == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.inner.ensure_upper_parents_sync(path)?;
        self.inner.upper.mkdir_sync(path, mode, owner)?;
        self.inner.unmark_deleted_sync(path)?;
        Ok(())
    }

    async fn readdir(&self, path: &str) -> FsResult<Vec<String>> {
        self.inner.check_log_error()?;
        let stats = self.inner.merged_stat(path).await?;
        if !stats.is_dir() {
            return Err(FsError::not_directory(path));
        }
        let mut entries = if self.inner.upper.exists(path).await? {
            self.inner.upper.readdir(path).await?
        } else {
            Vec::new()
        };
        if path == "/" {
            entries.retain(|name| format!("/{}", name) != DELETION_LOG);
        }
        if self.inner.lower.exists(path).await? {
            for name in self.inner.lower.readdir(path).await? {
                let child = join(path, &name)?;
                if !self.inner.is_deleted(&child) && !entries.contains(&name) {
                    entries.push(name);
                }
            }
        }
        Ok(entries)
    }
    fn readdir_sync(&self, path: &str) -> FsResult<Vec<String>> {
        self.inner.check_log_error()?;
        let stats = self.inner.merged_stat_sync(path)?;
        if !stats.is_dir() {
            return Err(FsError::not_directory(path));
        }
        let mut entries = if self.inner.upper.exists_sync(path)? {
            self.inner.upper.readdir_sync(path)?
        } else {
            Vec::new()
        };
        if path == "/" {
            entries.retain(|name| format!("/{}", name) != DELETION_LOG);
        }
        if self.inner.lower.exists_sync(path)? {
            for name in self.inner.lower.readdir_sync(path)? {
                let child = join(path, &name)?;
                if !self.inner.is_deleted(&child) && !entries.contains(&name) {
                    entries.push(name);
                }
            }
        }
        Ok(entries)
    }

    async fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        self.inner.check_log_error()?;
        self.inner.merged_stat(from).await?;
        if !self.inner.upper.exists(from).await? {
            self.inner.copy_up(from).await?;
        }
        self.inner.ensure_upper_parents(to).await?;
        self.inner.upper.rename(from, to).await?;
        if self.inner.lower.exists(from).await? {
            self.inner.mark_deleted(from);
        }
        self.inner.unmark_deleted(to);
        Ok(())
    }
    fn rename_sync(&self, from: &str, to: &str) -> FsResult<()> {
        self.inner.check_log_error()?;
        self.inner.merged_stat_sync(from)?;
        if !self.inner.upper.exists_sync(from)? {
            self.inner.copy_up_sync(from)?;
        }
        self.inner.ensure_upper_parents_sync(to)?;
        self.inner.upper.rename_sync(from, to)?;
        if self.inner.lower.exists_sync(from)? {
            self.inner.mark_deleted_sync(from)?;
        }
        self.inner.unmark_deleted_sync(to)?;
        Ok(())
    }

    async fn link(&self, target: &str, link_path: &str) -> FsResult<()> {
        self.inner.check_log_error()?;
        self.inner.merged_stat(target).await?;
        if !self.inner.upper.exists(target).await? {
            self.inner.copy_up(target).await?;
        }
        self.inner.ensure_upper_parents(link_path).await?;
        self.inner.upper.link(target, link_path).await?;
        self.inner.unmark_deleted(link_path);
        Ok(())
    }
    fn link_sync(&self, target: &str, link_path: &str) -> FsResult<()> {
        self.inner.check_log_error()?;
        self.inner.merged_stat_sync(target)?;
        if !self.inner.upper.exists_sync(target)? {
            self.inner.copy_up_sync(target)?;
        }
        self.inner.ensure_upper_parents_sync(link_path)?;
        self.inner.upper.link_sync(target, link_path)?;
        self.inner.unmark_deleted_sync(link_path)?;
        Ok(())
    }

    async fn sync(&self, path: &str, data: &[u8], stats: &Stats) -> FsResult<()> {
        self.inner.check_log_error()?;
        self.inner.sync_up(path, data, stats).await?;
        self.inner.unmark_deleted(path);
        Ok(())
    }
    fn sync_sync(&self, path: &str, data: &[u8], stats: &Stats) -> FsResult<()> {
        self.inner.check_log_error()?;
        self.inner.sync_up_sync(path, data, stats)?;
        self.inner.unmark_deleted_sync(path)?;
        Ok(())
    }
}

/// Handle for a lower-only file: the whole contents are held in memory and
/// flushed to upper (copy-up) when the handle is synced or closed dirty.
struct PreloadFile {
    inner: Arc<OverlayInner>,
    path: String,
    buffer: Mutex<Vec<u8>>,
    stats: Mutex<Stats>,
    dirty: AtomicBool,
    closed: AtomicBool,
}

impl PreloadFile {
    fn new(inner: Arc<OverlayInner>, path: String, data: Vec<u8>, stats: Stats) -> Self {
        Self {
            inner,
            path,
            buffer: Mutex::new(data),
            stats: Mutex::new(stats),
            dirty: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    fn guard(&self) -> FsResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(FsError::bad_fd().with_path(&self.path))
        } else {
            Ok(())
        }
    }

    fn snapshot(&self) -> (Vec<u8>, Stats) {
        (self.buffer.lock().unwrap().clone(), *self.stats.lock().unwrap())
    }

    fn do_read(&self, buf: &mut [u8], position: u64) -> FsResult<usize> {
        self.guard()?;
        if self.stats.lock().unwrap().is_dir() {
            return Err(FsError::is_directory(&self.path));
        }
        let data = self.buffer.lock().unwrap();
        let start = (position as usize).min(data.len());
        let end = (start + buf.len()).min(data.len());
        buf[..end - start].copy_from_slice(&data[start..end]);
        Ok(end - start)
    }

    fn do_write(&self, data: &[u8], position: u64) -> FsResult<usize> {
        self.guard()?;
        if self.stats.lock().unwrap().is_dir() {
            return Err(FsError::is_directory(&self.path));
        }
        let mut buffer = self.buffer.lock().unwrap();
        let start = position as usize;
        let end = start + data.len();
        if end > buffer.len() {
            buffer.resize(end, 0);
        }
        buffer[start..end].copy_from_slice(data);
        self.stats.lock().unwrap().update_size(buffer.len() as u64);
        self.dirty.store(true, Ordering::SeqCst);
        Ok(data.len())
    }

    fn do_truncate(&self, size: u64) -> FsResult<()> {
        self.guard()?;
        let mut buffer = self.buffer.lock().unwrap();
        buffer.resize(size as usize, 0);
        self.stats.lock().unwrap().update_size(size);
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl FsFile for PreloadFile {
    async fn stat(&self) -> FsResult<Stats> {
        self.guard()?;
        Ok(*self.stats.lock().unwrap())
    }
    fn stat_sync(&self) -> FsResult<Stats> {
        self.guard()?;
        Ok(*self.stats.lock().unwrap())
    }

    async fn read(&self, buf: &mut [u8], position: u64) -> FsResult<usize> {
        self.do_read(buf, position)
    }
    fn read_sync(&self, buf: &mut [u8], position: u64) -> FsResult<usize> {
        self.do_read(buf, position)
    }

    async fn write(&self, data: &[u8], position: u64) -> FsResult<usize> {
        self.do_write(data, position)
    }
    fn write_sync(&self, data: &[u8], position: u64) -> FsResult<usize> {
        self.do_write(data, position)
    }

    async fn truncate(&self, size: u64) -> FsResult<()> {
        self.do_truncate(size)
    }
    fn truncate_sync(&self, size: u64) -> FsResult<()> {
        self.do_truncate(size)
    }

    async fn chmod(&self, mode: u32) -> FsResult<()> {
        self.guard()?;
        let mut stats = self.stats.lock().unwrap();
        stats.mode = (stats.mode & crate::stats::S_IFMT) | (mode & 0o7777);
        stats.ctime_ms = now_ms();
        drop(stats);
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }
    fn chmod_sync(&self, mode: u32) -> FsResult<()> {
        self.guard()?;
        let mut stats = self.stats.lock().unwrap();
        stats.mode = (stats.mode & crate::stats::S_IFMT) | (mode & 0o7777);
        stats.ctime_ms = now_ms();
        drop(stats);
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn chown(&self, uid: u32, gid: u32) -> FsResult<()> {
        self.guard()?;
        let mut stats = self.stats.lock().unwrap();
        stats.uid = uid;
        stats.gid = gid;
        stats.ctime_ms = now_ms();
        drop(stats);
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }
    fn chown_sync(&self, uid: u32, gid: u32) -> FsResult<()> {
        self.guard()?;
        let mut stats = self.stats.lock().unwrap();
        stats.uid = uid;
        stats.gid = gid;
        stats.ctime_ms = now_ms();
        drop(stats);
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn utimes(&self, atime_ms: i64, mtime_ms: i64) -> FsResult<()> {
        self.guard()?;
        let mut stats = self.stats.lock().unwrap();
        stats.atime_ms = atime_ms;
        stats.mtime_ms = mtime_ms;
        stats.ctime_ms = now_ms();
        drop(stats);
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }
    fn utimes_sync(&self, atime_ms: i64, mtime_ms: i64) -> FsResult<()> {
        self.guard()?;
        let mut stats = self.stats.lock().unwrap();
        stats.atime_ms = atime_ms;
        stats.mtime_ms = mtime_ms;
        stats.ctime_ms = now_ms();
        drop(stats);
        self.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn sync(&self) -> FsResult<()> {
        self.guard()?;
        if self.dirty.swap(false, Ordering::SeqCst) {
            let (data, stats) = self.snapshot();
            if let Err(e) = self.inner.sync_up(&self.path, &data, &stats).await {
                self.dirty.store(true, Ordering::SeqCst);
                return Err(e);
            }
            self.inner.unmark_deleted(&self.path);
        }
        Ok(())
    }
    fn sync_sync(&self) -> FsResult<()> {
        self.guard()?;
        if self.dirty.swap(false, Ordering::SeqCst) {
            let (data, stats) = self.snapshot();
            if let Err(e) = self.inner.sync_up_sync(&self.path, &data, &stats) {
                self.dirty.store(true, Ordering::SeqCst);
                return Err(e);
            }
            self.inner.unmark_deleted_sync(&self.path)?;
        }
        Ok(())
    }

    async fn close(&self) -> FsResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.sync().await?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
    fn close_sync(&self) -> FsResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.sync_sync()?;
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryFs;

    fn seeded_lower() -> Arc<dyn FileSystem> {
        let fs = InMemoryFs::new();
        fs.mkdir_sync("/docs", 0o755, Owner::default()).unwrap();
        fs.sync_sync("/f", b"hello", &Stats::new(S_IFREG | 0o444, 0, 0, 5, 0)).unwrap();
        fs.sync_sync(
            "/docs/readme",
            b"lower readme",
            &Stats::new(S_IFREG | 0o444, 0, 0, 12, 0),
        )
        .unwrap();
        Arc::new(fs)
    }

    fn overlay_over(lower: Arc<dyn FileSystem>) -> (OverlayFs, Arc<dyn FileSystem>) {
        let upper: Arc<dyn FileSystem> = Arc::new(InMemoryFs::new());
        let fs = OverlayFs::new(OverlayOptions {
            upper: upper.clone(),
            lower,
        })
        .unwrap();
        fs.ready_sync().unwrap();
        (fs, upper)
    }

    #[tokio::test]
    async fn lower_files_visible_and_marked_writable() {
        let (fs, _upper) = overlay_over(seeded_lower());
        let st = fs.stat("/f").await.unwrap();
        assert_ne!(st.mode & 0o222, 0);
        let mut names = fs.readdir("/").await.unwrap();
        names.sort();
        assert_eq!(names, vec!["docs", "f"]);
    }

    #[tokio::test]
    async fn write_copies_up_without_touching_lower() {
        let lower = seeded_lower();
        let (fs, upper) = overlay_over(lower.clone());

        let file = fs.open_file("/f", OpenFlags::parse("r+").unwrap()).await.unwrap();
        file.write(b"HELLO", 0).await.unwrap();
        file.close().await.unwrap();

        assert!(upper.exists("/f").await.unwrap());
        let data = read_all(&lower, "/f").await.unwrap();
        assert_eq!(data, b"hello");

        let through = fs.open_file("/f", OpenFlags::parse("r").unwrap()).await.unwrap();
        let mut buf = [0u8; 8];
        let n = through.read(&mut buf, 0).await.unwrap();
        assert_eq!(&buf[..n], b"HELLO");
    }

    #[tokio::test]
    async fn unlink_of_lower_path_persists_in_log() {
        let lower = seeded_lower();
        let (fs, upper) = overlay_over(lower.clone());

        fs.unlink("/f").await.unwrap();
        assert!(!fs.exists("/f").await.unwrap());
        // The log write is queued; give the writer task a turn.
        tokio::task::yield_now().await;
        let log = read_all(&upper, DELETION_LOG).await.unwrap();
        assert!(String::from_utf8(log).unwrap().contains("d/f\n"));

        // A fresh overlay over the same two layers replays the log.
        let fs2 = OverlayFs::new(OverlayOptions {
            upper,
            lower,
        })
        .unwrap();
        fs2.ready().await.unwrap();
        assert!(!fs2.exists("/f").await.unwrap());
    }

    #[tokio::test]
    async fn create_after_delete_clears_the_mark() {
        let (fs, _upper) = overlay_over(seeded_lower());
        fs.unlink("/f").await.unwrap();
        let file = fs
            .create_file(
                "/f",
                OpenFlags::parse("w").unwrap(),
                S_IFREG | 0o644,
                Owner::default(),
            )
            .await
            .unwrap();
        file.write(b"new", 0).await.unwrap();
        file.close().await.unwrap();
        assert!(fs.exists("/f").await.unwrap());
        assert_eq!(fs.stat("/f").await.unwrap().size, 3);
    }

    #[tokio::test]
    async fn readdir_merges_and_filters_deleted() {
        let (fs, _upper) = overlay_over(seeded_lower());
        let f = fs
            .create_file(
                "/upper-only",
                OpenFlags::parse("w").unwrap(),
                S_IFREG | 0o644,
                Owner::default(),
            )
            .await
            .unwrap();
        f.close().await.unwrap();
        fs.unlink("/f").await.unwrap();

        let mut names = fs.readdir("/").await.unwrap();
        names.sort();
        assert_eq!(names, vec!["docs", "upper-only"]);
    }

    #[tokio::test]
    async fn rmdir_requires_merged_empty() {
        let (fs, _upper) = overlay_over(seeded_lower());
        assert_eq!(fs.rmdir("/docs").await.unwrap_err().kind, ErrorKind::NotEmpty);
        fs.unlink("/docs/readme").await.unwrap();
        fs.rmdir("/docs").await.unwrap();
        assert!(!fs.exists("/docs").await.unwrap());
    }

    #[tokio::test]
    async fn rename_of_lower_file_lands_on_upper() {
        let lower = seeded_lower();
        let (fs, upper) = overlay_over(lower.clone());

        fs.rename("/f", "/g").await.unwrap();
        assert!(!fs.exists("/f").await.unwrap());
        assert!(upper.exists("/g").await.unwrap());
        let data = read_all(&upper, "/g").await.unwrap();
        assert_eq!(data, b"hello");
        assert!(lower.exists("/f").await.unwrap());
    }

    #[tokio::test]
    async fn mkdir_on_visible_path_is_eexist() {
        let (fs, _upper) = overlay_over(seeded_lower());
        assert_eq!(
            fs.mkdir("/docs", 0o755, Owner::default()).await.unwrap_err().kind,
            ErrorKind::Exists
        );
        fs.mkdir("/fresh", 0o700, Owner::default()).await.unwrap();
        assert!(fs.stat("/fresh").await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn copy_up_creates_parent_chain_with_merged_modes() {
        let lower = InMemoryFs::new();
        lower.mkdir_sync("/a", 0o750, Owner { uid: 5, gid: 6 }).unwrap();
        lower.mkdir_sync("/a/b", 0o700, Owner { uid: 5, gid: 6 }).unwrap();
        lower
            .sync_sync("/a/b/f", b"deep", &Stats::new(S_IFREG | 0o400, 5, 6, 4, 0))
            .unwrap();
        let lower: Arc<dyn FileSystem> = Arc::new(lower);
        let (fs, upper) = overlay_over(lower);

        let file = fs.open_file("/a/b/f", OpenFlags::parse("r+").unwrap()).await.unwrap();
        file.write(b"DEEP", 0).await.unwrap();
        file.close().await.unwrap();

        let a = upper.stat("/a").await.unwrap();
        assert!(a.is_dir());
        // Merged view adds the write bits before the mode is copied.
        assert_eq!(a.mode & 0o7777, 0o750 | 0o222);
        assert_eq!(a.uid, 5);
        assert!(upper.stat("/a/b/f").await.unwrap().size == 4);
    }

    #[test]
    fn log_round_trip() {
        let mut deleted = HashSet::new();
        deleted.insert("/f".to_string());
        deleted.insert("/docs/readme".to_string());
        let text = render_log(&deleted);
        assert_eq!(parse_log(&text), deleted);
        // Unknown lines are ignored.
        assert_eq!(parse_log("x/junk\n\nd/f\n"), {
            let mut s = HashSet::new();
            s.insert("/f".to_string());
            s
        });
    }

    #[test]
    fn readonly_upper_rejected() {
        let readonly = crate::memory::MemoryFsOptions {
            readonly: true,
            ..Default::default()
        };
        let err = OverlayOptions {
            upper: Arc::new(InMemoryFs::with_options(readonly).unwrap()),
            lower: Arc::new(InMemoryFs::new()),
        }
        .validate()
        .unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidArgument);

        assert!(OverlayOptions {
            upper: Arc::new(InMemoryFs::new()),
            lower: Arc::new(InMemoryFs::new()),
        }
        .validate()
        .is_ok());
    }
}
