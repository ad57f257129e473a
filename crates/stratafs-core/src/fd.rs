// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The file-descriptor table
//!
//! Process-wide mapping of small non-negative integers to open files. Slots
//! are reused: a new FD always takes the lowest free index, like a POSIX
//! descriptor table.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::backend::FsFile;
use crate::error::{FsError, FsResult};
use crate::flags::OpenFlags;

/// A file descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fd(pub i32);

impl std::fmt::Display for Fd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// An open file: the user-facing path it was opened at, the parsed flags,
/// the per-descriptor position, and the backend handle.
#[derive(Debug)]
pub(crate) struct OpenFile {
    pub path: String,
    pub flags: OpenFlags,
    pub position: AtomicU64,
    pub file: Box<dyn FsFile>,
    closed: AtomicBool,
}

impl OpenFile {
    pub fn new(path: String, flags: OpenFlags, file: Box<dyn FsFile>) -> Self {
        Self {
            path,
            flags,
            position: AtomicU64::new(0),
            file,
            closed: AtomicBool::new(false),
        }
    }

    /// Flag the record closed. Returns `false` when it already was, so a
    /// second close can be treated as a no-op.
    pub fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }

    pub fn guard_open(&self) -> FsResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(FsError::bad_fd().with_path(&self.path))
        } else {
            Ok(())
        }
    }
}

pub(crate) struct FdTable {
    slots: Mutex<Vec<Option<Arc<OpenFile>>>>,
}

impl FdTable {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
        }
    }

    /// Register an open file at the lowest free descriptor.
    pub fn insert(&self, file: Arc<OpenFile>) -> Fd {
        let mut slots = self.slots.lock().unwrap();
        for (i, slot) in slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(file);
                return Fd(i as i32);
            }
        }
        slots.push(Some(file));
        Fd((slots.len() - 1) as i32)
    }

    pub fn get(&self, fd: Fd) -> FsResult<Arc<OpenFile>> {
        let slots = self.slots.lock().unwrap();
        usize::try_from(fd.0)
            .ok()
            .and_then(|i| slots.get(i).cloned().flatten())
            .ok_or_else(FsError::bad_fd)
    }

    pub fn remove(&self, fd: Fd) -> FsResult<Arc<OpenFile>> {
        let mut slots = self.slots.lock().unwrap();
        usize::try_from(fd.0)
            .ok()
            .and_then(|i| slots.get_mut(i).and_then(|slot| slot.take()))
            .ok_or_else(FsError::bad_fd)
    }

    pub fn open_count(&self) -> usize {
        self.slots.lock().unwrap().iter().filter(|s| s.is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::memory::InMemoryFs;
    use crate::backend::{FileSystem, Owner};

    fn open_file(path: &str) -> Arc<OpenFile> {
        let fs = InMemoryFs::new();
        let flags = OpenFlags::parse("w").unwrap();
        let file = fs
            .create_file_sync(path, flags, crate::stats::S_IFREG | 0o644, Owner::default())
            .unwrap();
        Arc::new(OpenFile::new(path.to_string(), flags, file))
    }

    #[test]
    fn fds_are_dense_and_reused() {
        let table = FdTable::new();
        let a = table.insert(open_file("/a"));
        let b = table.insert(open_file("/b"));
        let c = table.insert(open_file("/c"));
        assert_eq!((a, b, c), (Fd(0), Fd(1), Fd(2)));

        table.remove(b).unwrap();
        assert_eq!(table.insert(open_file("/d")), Fd(1));
        assert_eq!(table.insert(open_file("/e")), Fd(3));
    }

    #[test]
    fn bad_fd_is_ebadf() {
        let table = FdTable::new();
        assert_eq!(table.get(Fd(7)).unwrap_err().kind, ErrorKind::BadFileDescriptor);
        assert_eq!(table.get(Fd(-1)).unwrap_err().kind, ErrorKind::BadFileDescriptor);

        let fd = table.insert(open_file("/a"));
        table.remove(fd).unwrap();
        assert_eq!(table.remove(fd).unwrap_err().kind, ErrorKind::BadFileDescriptor);
    }

    #[test]
    fn closed_records_reject_use() {
        let of = open_file("/a");
        assert!(of.guard_open().is_ok());
        assert!(of.mark_closed());
        assert!(!of.mark_closed());
        assert_eq!(of.guard_open().unwrap_err().kind, ErrorKind::BadFileDescriptor);
    }
}
