// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! # stratafs-core
//!
//! An in-process virtual filesystem. A single namespace is assembled from
//! pluggable backends mounted at arbitrary points; the [`Vfs`] dispatches a
//! POSIX-shaped API (open/read/write/stat/mkdir/symlink/rename/watch/...)
//! to the owning backend, resolving symlinks across mount boundaries,
//! enforcing permission bits, and maintaining a descriptor table.
//!
//! Every operation has an async form and a non-suspending `*_sync` twin.
//! The async surface suspends only on backend I/O; the tables themselves
//! are guarded by short-held locks.
//!
//! ```
//! use std::sync::Arc;
//! use stratafs_core::{InMemoryFs, Vfs};
//!
//! # async fn demo() -> stratafs_core::FsResult<()> {
//! let vfs = Vfs::new();
//! vfs.mkdir("/data", &Default::default()).await?;
//! vfs.mount("/data/cache", Arc::new(InMemoryFs::new())).await?;
//! vfs.write_file("/data/cache/greeting", "hello").await?;
//! assert_eq!(vfs.read_file_to_string("/data/cache/greeting").await?, "hello");
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod error;
pub mod fd;
pub mod flags;
pub mod handle;
pub mod memory;
pub mod mount;
pub mod mutex;
pub mod overlay;
pub mod path;
pub mod stats;
pub mod vfs;
pub mod watch;

#[cfg(test)]
mod test_scenarios;

pub use backend::{BackendFeature, BackendMetadata, FileSystem, FsFile, Owner};
pub use error::{ErrorKind, FsError, FsResult};
pub use fd::Fd;
pub use flags::OpenFlags;
pub use handle::{Dir, FileHandle};
pub use memory::{InMemoryFs, MemoryFsOptions};
pub use mount::MountInfo;
pub use mutex::{LockGuard, MutexOptions, MutexedFs};
pub use overlay::{OverlayFs, OverlayOptions, DELETION_LOG};
pub use path::{basename, dirname, join, normalize};
pub use stats::{
    Credentials, Dirent, FileType, Stats, StatsFs, F_OK, R_OK, S_IFBLK, S_IFCHR, S_IFDIR,
    S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK, S_ISGID, S_ISUID, S_ISVTX, W_OK, X_OK,
};
pub use vfs::{
    CpFilter, CpOptions, MkdirOptions, RmOptions, SymlinkType, Vfs, WriteOptions, COPYFILE_EXCL,
};
pub use watch::{EventType, WatchEvent, Watcher};
