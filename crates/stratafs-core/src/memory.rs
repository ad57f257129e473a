// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory reference backend
//!
//! Path-keyed node store with inode indirection so hard links share
//! contents. This is the backend the test suite mounts, and the default
//! root filesystem of a fresh [`Vfs`](crate::vfs::Vfs). All data is lost on
//! drop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::backend::{BackendMetadata, FileSystem, FsFile, Owner};
use crate::error::{FsError, FsResult};
use crate::flags::OpenFlags;
use crate::path::dirname;
use crate::stats::{now_ms, Stats, S_IFDIR, S_IFMT, S_IFREG};

/// Options for [`InMemoryFs`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryFsOptions {
    /// Backend name reported in [`BackendMetadata`].
    pub name: String,
    /// Advertise the store as read-only. Enforcement is the caller's side of
    /// the contract; the flag is what mount-time validation inspects.
    pub readonly: bool,
}

impl Default for MemoryFsOptions {
    fn default() -> Self {
        Self {
            name: "inmemory".to_string(),
            readonly: false,
        }
    }
}

impl MemoryFsOptions {
    pub fn validate(&self) -> FsResult<()> {
        if self.name.is_empty() {
            return Err(FsError::invalid("backend name must not be empty"));
        }
        Ok(())
    }
}

struct MemNode {
    data: Vec<u8>,
    stats: Stats,
}

struct MemState {
    /// path -> inode number
    paths: HashMap<String, u64>,
    /// inode number -> node
    nodes: HashMap<u64, MemNode>,
}

struct MemStore {
    state: RwLock<MemState>,
    next_ino: AtomicU64,
}

impl MemStore {
    fn alloc_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, Ordering::Relaxed)
    }
}

pub struct InMemoryFs {
    name: String,
    readonly: bool,
    store: Arc<MemStore>,
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryFs {
    pub fn new() -> Self {
        Self::with_options(MemoryFsOptions::default()).expect("default options are valid")
    }

    pub fn with_options(options: MemoryFsOptions) -> FsResult<Self> {
        options.validate()?;
        let store = MemStore {
            state: RwLock::new(MemState {
                paths: HashMap::new(),
                nodes: HashMap::new(),
            }),
            next_ino: AtomicU64::new(1),
        };
        let root_ino = store.alloc_ino();
        {
            let mut state = store.state.write().unwrap();
            state.paths.insert("/".to_string(), root_ino);
            state.nodes.insert(
                root_ino,
                MemNode {
                    data: Vec::new(),
                    stats: Stats::new(S_IFDIR | 0o777, 0, 0, 0, root_ino),
                },
            );
        }
        Ok(Self {
            name: options.name,
            readonly: options.readonly,
            store: Arc::new(store),
        })
    }

    fn do_stat(&self, path: &str) -> FsResult<Stats> {
        let state = self.store.state.read().unwrap();
        let ino = *state.paths.get(path).ok_or_else(|| FsError::not_found(path))?;
        Ok(state.nodes[&ino].stats)
    }

    fn require_parent_dir(state: &MemState, path: &str) -> FsResult<u64> {
        let parent = dirname(path);
        let ino = *state
            .paths
            .get(parent)
            .ok_or_else(|| FsError::not_found(parent))?;
        if !state.nodes[&ino].stats.is_dir() {
            return Err(FsError::not_directory(parent));
        }
        Ok(ino)
    }

    fn drop_path_entry(state: &mut MemState, path: &str) {
        if let Some(ino) = state.paths.remove(path) {
            let orphaned = {
                let node = state.nodes.get_mut(&ino).expect("path entry has a node");
                node.stats.nlink = node.stats.nlink.saturating_sub(1);
                node.stats.ctime_ms = now_ms();
                node.stats.nlink == 0
            };
            if orphaned {
                state.nodes.remove(&ino);
            }
        }
    }

    fn do_open(&self, path: &str, _flags: OpenFlags) -> FsResult<Box<dyn FsFile>> {
        let state = self.store.state.read().unwrap();
        let ino = *state.paths.get(path).ok_or_else(|| FsError::not_found(path))?;
        Ok(Box::new(MemFile {
            store: self.store.clone(),
            path: path.to_string(),
            ino,
            closed: AtomicBool::new(false),
        }))
    }

    fn do_create(
        &self,
        path: &str,
        _flags: OpenFlags,
        mode: u32,
        owner: Owner,
    ) -> FsResult<Box<dyn FsFile>> {
        let ino = {
            let mut state = self.store.state.write().unwrap();
            Self::require_parent_dir(&state, path)?;
            if state.paths.contains_key(path) {
                return Err(FsError::exists(path));
            }
            let mode = if mode & S_IFMT == 0 { S_IFREG | mode } else { mode };
            let ino = self.store.alloc_ino();
            state.paths.insert(path.to_string(), ino);
            state.nodes.insert(
                ino,
                MemNode {
                    data: Vec::new(),
                    stats: Stats::new(mode, owner.uid, owner.gid, 0, ino),
                },
            );
            ino
        };
        Ok(Box::new(MemFile {
            store: self.store.clone(),
            path: path.to_string(),
            ino,
            closed: AtomicBool::new(false),
        }))
    }

    fn do_rename(&self, from: &str, to: &str) -> FsResult<()> {
        let mut state = self.store.state.write().unwrap();
        let src_ino = *state.paths.get(from).ok_or_else(|| FsError::not_found(from))?;
        let src_is_dir = state.nodes[&src_ino].stats.is_dir();
        Self::require_parent_dir(&state, to)?;

        if let Some(&dst_ino) = state.paths.get(to) {
            let dst_is_dir = state.nodes[&dst_ino].stats.is_dir();
            match (src_is_dir, dst_is_dir) {
                (true, false) => return Err(FsError::not_directory(to)),
                (false, true) => return Err(FsError::is_directory(to)),
                (true, true) => {
                    let prefix = format!("{}/", to);
                    if state.paths.keys().any(|p| p.starts_with(&prefix)) {
                        return Err(FsError::not_empty(to));
                    }
                }
                (false, false) => {}
            }
            Self::drop_path_entry(&mut state, to);
        }

        if src_is_dir {
            let prefix = format!("{}/", from);
            let moved: Vec<String> =
                state.paths.keys().filter(|p| p.starts_with(&prefix)).cloned().collect();
            for old in moved {
                let ino = state.paths.remove(&old).expect("key listed above");
                let new = format!("{}{}", to, &old[from.len()..]);
                state.paths.insert(new, ino);
            }
        }
        let ino = state.paths.remove(from).expect("source checked above");
        state.paths.insert(to.to_string(), ino);
        if let Some(node) = state.nodes.get_mut(&ino) {
            node.stats.ctime_ms = now_ms();
        }
        Ok(())
    }

    fn do_unlink(&self, path: &str) -> FsResult<()> {
        let mut state = self.store.state.write().unwrap();
        let ino = *state.paths.get(path).ok_or_else(|| FsError::not_found(path))?;
        if state.nodes[&ino].stats.is_dir() {
            return Err(FsError::is_directory(path));
        }
        Self::drop_path_entry(&mut state, path);
        Ok(())
    }

    fn do_rmdir(&self, path: &str) -> FsResult<()> {
        let mut state = self.store.state.write().unwrap();
        if path == "/" {
            return Err(FsError::not_permitted(path));
        }
        let ino = *state.paths.get(path).ok_or_else(|| FsError::not_found(path))?;
        if !state.nodes[&ino].stats.is_dir() {
            return Err(FsError::not_directory(path));
        }
        let prefix = format!("{}/", path);
        if state.paths.keys().any(|p| p.starts_with(&prefix)) {
            return Err(FsError::not_empty(path));
        }
        Self::drop_path_entry(&mut state, path);
        Ok(())
    }

    fn do_mkdir(&self, path: &str, mode: u32, owner: Owner) -> FsResult<()> {
        let mut state = self.store.state.write().unwrap();
        Self::require_parent_dir(&state, path)?;
        if state.paths.contains_key(path) {
            return Err(FsError::exists(path));
        }
        let ino = self.store.alloc_ino();
        state.paths.insert(path.to_string(), ino);
        state.nodes.insert(
            ino,
            MemNode {
                data: Vec::new(),
                stats: Stats::new(S_IFDIR | (mode & 0o7777), owner.uid, owner.gid, 0, ino),
            },
        );
        Ok(())
    }

    fn do_readdir(&self, path: &str) -> FsResult<Vec<String>> {
        let state = self.store.state.read().unwrap();
        let ino = *state.paths.get(path).ok_or_else(|| FsError::not_found(path))?;
        if !state.nodes[&ino].stats.is_dir() {
            return Err(FsError::not_directory(path));
        }
        Ok(state
            .paths
            .keys()
            .filter(|p| p.as_str() != "/" && dirname(p) == path)
            .map(|p| crate::path::basename(p).to_string())
            .collect())
    }

    fn do_link(&self, target: &str, link_path: &str) -> FsResult<()> {
        let mut state = self.store.state.write().unwrap();
        let ino = *state
            .paths
            .get(target)
            .ok_or_else(|| FsError::not_found(target))?;
        if state.nodes[&ino].stats.is_dir() {
            return Err(FsError::not_permitted(target));
        }
        Self::require_parent_dir(&state, link_path)?;
        if state.paths.contains_key(link_path) {
            return Err(FsError::exists(link_path));
        }
        state.paths.insert(link_path.to_string(), ino);
        let node = state.nodes.get_mut(&ino).expect("target has a node");
        node.stats.nlink += 1;
        node.stats.ctime_ms = now_ms();
        Ok(())
    }

    fn do_sync(&self, path: &str, data: &[u8], stats: &Stats) -> FsResult<()> {
        let mut state = self.store.state.write().unwrap();
        Self::require_parent_dir(&state, path)?;
        let ino = match state.paths.get(path) {
            Some(&ino) => ino,
            None => {
                let ino = self.store.alloc_ino();
                state.paths.insert(path.to_string(), ino);
                state.nodes.insert(
                    ino,
                    MemNode {
                        data: Vec::new(),
                        stats: Stats::new(S_IFREG | 0o644, 0, 0, 0, ino),
                    },
                );
                ino
            }
        };
        let node = state.nodes.get_mut(&ino).expect("just ensured");
        let preserved = (node.stats.ino, node.stats.nlink);
        node.data = data.to_vec();
        node.stats = *stats;
        node.stats.ino = preserved.0;
        node.stats.nlink = preserved.1;
        node.stats.update_size(data.len() as u64);
        Ok(())
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    fn metadata(&self) -> BackendMetadata {
        let md = BackendMetadata::new(self.name.clone());
        if self.readonly {
            md.readonly()
        } else {
            md
        }
    }

    async fn stat(&self, path: &str) -> FsResult<Stats> {
        self.do_stat(path)
    }
    fn stat_sync(&self, path: &str) -> FsResult<Stats> {
        self.do_stat(path)
    }

    async fn open_file(&self, path: &str, flags: OpenFlags) -> FsResult<Box<dyn FsFile>> {
        self.do_open(path, flags)
    }
    fn open_file_sync(&self, path: &str, flags: OpenFlags) -> FsResult<Box<dyn FsFile>> {
        self.do_open(path, flags)
    }

    async fn create_file(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: u32,
        owner: Owner,
    ) -> FsResult<Box<dyn FsFile>> {
        self.do_create(path, flags, mode, owner)
    }
    fn create_file_sync(
        &self,
        path: &str,
        flags: OpenFlags,
        mode: u32,
        owner: Owner,
    ) -> FsResult<Box<dyn FsFile>> {
        self.do_create(path, flags, mode, owner)
    }

    async fn rename(&self, from: &str, to: &str) -> FsResult<()> {
        self.do_rename(from, to)
    }
    fn rename_sync(&self, from: &str, to: &str) -> FsResult<()> {
        self.do_rename(from, to)
    }

    async fn unlink(&self, path: &str) -> FsResult<()> {
        self.do_unlink(path)
    }
    fn unlink_sync(&self, path: &str) -> FsResult<()> {
        self.do_unlink(path)
    }

    async fn rmdir(&self, path: &str) -> FsResult<()> {
        self.do_rmdir(path)
    }
    fn rmdir_sync(&self, path: &str) -> FsResult<()> {
        self.do_rmdir(path)
    }

    async fn mkdir(&self, path: &str, mode: u32, owner: Owner) -> FsResult<()> {
        self.do_mkdir(path, mode, owner)
    }
    fn mkdir_sync(&self, path: &str, mode: u32, owner: Owner) -> FsResult<()> {
        self.do_mkdir(path, mode, owner)
    }

    async fn readdir(&self, path: &str) -> FsResult<Vec<String>> {
        self.do_readdir(path)
    }
    fn readdir_sync(&self, path: &str) -> FsResult<Vec<String>> {
        self.do_readdir(path)
    }

    async fn link(&self, target: &str, link_path: &str) -> FsResult<()> {
        self.do_link(target, link_path)
    }
    fn link_sync(&self, target: &str, link_path: &str) -> FsResult<()> {
        self.do_link(target, link_path)
    }

    async fn sync(&self, path: &str, data: &[u8], stats: &Stats) -> FsResult<()> {
        self.do_sync(path, data, stats)
    }
    fn sync_sync(&self, path: &str, data: &[u8], stats: &Stats) -> FsResult<()> {
        self.do_sync(path, data, stats)
    }
}

struct MemFile {
    store: Arc<MemStore>,
    path: String,
    ino: u64,
    closed: AtomicBool,
}

impl MemFile {
    fn guard(&self) -> FsResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(FsError::bad_fd().with_path(&self.path))
        } else {
            Ok(())
        }
    }

    fn do_stat(&self) -> FsResult<Stats> {
        self.guard()?;
        let state = self.store.state.read().unwrap();
        state
            .nodes
            .get(&self.ino)
            .map(|n| n.stats)
            .ok_or_else(|| FsError::not_found(&self.path))
    }

    fn do_read(&self, buf: &mut [u8], position: u64) -> FsResult<usize> {
        self.guard()?;
        let mut state = self.store.state.write().unwrap();
        let node = state
            .nodes
            .get_mut(&self.ino)
            .ok_or_else(|| FsError::not_found(&self.path))?;
        if node.stats.is_dir() {
            return Err(FsError::is_directory(&self.path));
        }
        let start = (position as usize).min(node.data.len());
        let end = (start + buf.len()).min(node.data.len());
        buf[..end - start].copy_from_slice(&node.data[start..end]);
        node.stats.atime_ms = now_ms();
        Ok(end - start)
    }

    fn do_write(&self, data: &[u8], position: u64) -> FsResult<usize> {
        self.guard()?;
        let mut state = self.store.state.write().unwrap();
        let node = state
            .nodes
            .get_mut(&self.ino)
            .ok_or_else(|| FsError::not_found(&self.path))?;
        if node.stats.is_dir() {
            return Err(FsError::is_directory(&self.path));
        }
        let start = position as usize;
        let end = start + data.len();
        if end > node.data.len() {
            node.data.resize(end, 0);
        }
        node.data[start..end].copy_from_slice(data);
        let len = node.data.len() as u64;
        node.stats.update_size(len);
        Ok(data.len())
    }

    fn do_truncate(&self, size: u64) -> FsResult<()> {
        self.guard()?;
        let mut state = self.store.state.write().unwrap();
        let node = state
            .nodes
            .get_mut(&self.ino)
            .ok_or_else(|| FsError::not_found(&self.path))?;
        if node.stats.is_dir() {
            return Err(FsError::is_directory(&self.path));
        }
        node.data.resize(size as usize, 0);
        node.stats.update_size(size);
        Ok(())
    }

    fn do_chmod(&self, mode: u32) -> FsResult<()> {
        self.guard()?;
        let mut state = self.store.state.write().unwrap();
        let node = state
            .nodes
            .get_mut(&self.ino)
            .ok_or_else(|| FsError::not_found(&self.path))?;
        node.stats.mode = (node.stats.mode & S_IFMT) | (mode & 0o7777);
        node.stats.ctime_ms = now_ms();
        Ok(())
    }

    fn do_chown(&self, uid: u32, gid: u32) -> FsResult<()> {
        self.guard()?;
        let mut state = self.store.state.write().unwrap();
        let node = state
            .nodes
            .get_mut(&self.ino)
            .ok_or_else(|| FsError::not_found(&self.path))?;
        node.stats.uid = uid;
        node.stats.gid = gid;
        node.stats.ctime_ms = now_ms();
        Ok(())
    }

    fn do_utimes(&self, atime_ms: i64, mtime_ms: i64) -> FsResult<()> {
        self.guard()?;
        let mut state = self.store.state.write().unwrap();
        let node = state
            .nodes
            .get_mut(&self.ino)
            .ok_or_else(|| FsError::not_found(&self.path))?;
        node.stats.atime_ms = atime_ms;
        node.stats.mtime_ms = mtime_ms;
        node.stats.ctime_ms = now_ms();
        Ok(())
    }

    fn do_close(&self) -> FsResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl FsFile for MemFile {
    async fn stat(&self) -> FsResult<Stats> {
        self.do_stat()
    }
    fn stat_sync(&self) -> FsResult<Stats> {
        self.do_stat()
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
        self.do_chmod(mode)
    }
    fn chmod_sync(&self, mode: u32) -> FsResult<()> {
        self.do_chmod(mode)
    }

    async fn chown(&self, uid: u32, gid: u32) -> FsResult<()> {
        self.do_chown(uid, gid)
    }
    fn chown_sync(&self, uid: u32, gid: u32) -> FsResult<()> {
        self.do_chown(uid, gid)
    }

    async fn utimes(&self, atime_ms: i64, mtime_ms: i64) -> FsResult<()> {
        self.do_utimes(atime_ms, mtime_ms)
    }
    fn utimes_sync(&self, atime_ms: i64, mtime_ms: i64) -> FsResult<()> {
        self.do_utimes(atime_ms, mtime_ms)
    }

    async fn sync(&self) -> FsResult<()> {
        self.guard()
    }
    fn sync_sync(&self) -> FsResult<()> {
        self.guard()
    }

    async fn close(&self) -> FsResult<()> {
        self.do_close()
    }
    fn close_sync(&self) -> FsResult<()> {
        self.do_close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(fs: &InMemoryFs, path: &str) -> Box<dyn FsFile> {
        fs.create_file_sync(
            path,
            OpenFlags::parse("w").unwrap(),
            S_IFREG | 0o644,
            Owner::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn create_write_read() {
        let fs = InMemoryFs::new();
        let f = create(&fs, "/hello.txt");
        f.write(b"hello world", 0).await.unwrap();

        let mut buf = [0u8; 32];
        let n = f.read(&mut buf, 6).await.unwrap();
        assert_eq!(&buf[..n], b"world");

        let st = fs.stat("/hello.txt").await.unwrap();
        assert_eq!(st.size, 11);
        assert!(st.is_file());
    }

    #[tokio::test]
    async fn create_requires_parent_directory() {
        let fs = InMemoryFs::new();
        let err = fs
            .create_file(
                "/no/such/file",
                OpenFlags::parse("w").unwrap(),
                0o644,
                Owner::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn hard_links_share_contents() {
        let fs = InMemoryFs::new();
        let f = create(&fs, "/a");
        f.write(b"data", 0).await.unwrap();

        fs.link("/a", "/b").await.unwrap();
        assert_eq!(fs.stat("/a").await.unwrap().nlink, 2);
        assert_eq!(fs.stat("/a").await.unwrap().ino, fs.stat("/b").await.unwrap().ino);

        fs.unlink("/a").await.unwrap();
        let g = fs.open_file("/b", OpenFlags::parse("r").unwrap()).await.unwrap();
        let mut buf = [0u8; 8];
        let n = g.read(&mut buf, 0).await.unwrap();
        assert_eq!(&buf[..n], b"data");
        assert_eq!(fs.stat("/b").await.unwrap().nlink, 1);
    }

    #[tokio::test]
    async fn rename_moves_directory_trees() {
        let fs = InMemoryFs::new();
        fs.mkdir("/d", 0o755, Owner::default()).await.unwrap();
        let f = create(&fs, "/d/f");
        f.write(b"x", 0).await.unwrap();

        fs.rename("/d", "/e").await.unwrap();
        assert!(fs.stat("/d").await.is_err());
        assert!(fs.stat("/e/f").await.is_ok());
    }

    #[tokio::test]
    async fn rmdir_rejects_non_empty() {
        let fs = InMemoryFs::new();
        fs.mkdir("/d", 0o755, Owner::default()).await.unwrap();
        create(&fs, "/d/f");
        assert_eq!(
            fs.rmdir("/d").await.unwrap_err().kind,
            crate::error::ErrorKind::NotEmpty
        );
        fs.unlink("/d/f").await.unwrap();
        fs.rmdir("/d").await.unwrap();
    }

    #[tokio::test]
    async fn readdir_lists_direct_children_only() {
        let fs = InMemoryFs::new();
        fs.mkdir("/d", 0o755, Owner::default()).await.unwrap();
        create(&fs, "/d/a");
        create(&fs, "/top");

        let mut names = fs.readdir("/d").await.unwrap();
        names.sort();
        assert_eq!(names, vec!["a"]);

        let mut root = fs.readdir("/").await.unwrap();
        root.sort();
        assert_eq!(root, vec!["d", "top"]);
    }

    #[tokio::test]
    async fn sync_creates_and_replaces() {
        let fs = InMemoryFs::new();
        let stats = Stats::new(S_IFREG | 0o600, 7, 7, 3, 0);
        fs.sync("/f", b"abc", &stats).await.unwrap();

        let st = fs.stat("/f").await.unwrap();
        assert_eq!(st.size, 3);
        assert_eq!(st.uid, 7);
        assert_eq!(st.mode & 0o777, 0o600);

        fs.sync("/f", b"defg", &stats).await.unwrap();
        assert_eq!(fs.stat("/f").await.unwrap().size, 4);
    }

    #[tokio::test]
    async fn closed_handle_is_ebadf() {
        let fs = InMemoryFs::new();
        let f = create(&fs, "/a");
        f.close().await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(
            f.read(&mut buf, 0).await.unwrap_err().kind,
            crate::error::ErrorKind::BadFileDescriptor
        );
        // Close is idempotent.
        f.close().await.unwrap();
    }
}
