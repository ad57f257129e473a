// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The mount table
//!
//! Longest-prefix routing of user paths to backends. The table is ordered by
//! descending mount-point length so the first prefix match wins. The lock is
//! held only for table reads and mutations, never across backend I/O.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::backend::FileSystem;
use crate::error::{FsError, FsResult};
use crate::path::{basename, dirname};

/// One mount, as reported by [`Vfs::mounts`](crate::vfs::Vfs::mounts).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    pub mount_point: String,
    pub backend: String,
    pub readonly: bool,
}

/// A resolved dispatch target: the backend owning a path and the path
/// rewritten into the backend's own namespace.
pub(crate) struct Resolved {
    pub backend: Arc<dyn FileSystem>,
    pub mount_point: String,
    pub local_path: String,
}

impl Resolved {
    /// Substitution pair for rewriting backend-local error paths back to the
    /// user-facing form.
    pub fn error_paths<'a>(&'a self, user_path: &'a str) -> [(&'a str, &'a str); 1] {
        [(self.local_path.as_str(), user_path)]
    }
}

pub(crate) struct MountTable {
    /// `(mount_point, backend)`, sorted by descending mount-point length.
    mounts: RwLock<Vec<(String, Arc<dyn FileSystem>)>>,
}

impl MountTable {
    pub fn new() -> Self {
        Self {
            mounts: RwLock::new(Vec::new()),
        }
    }

    /// Register a backend. The mount point must be absolute and normalized,
    /// and must not already be mounted.
    pub fn add(&self, mount_point: &str, backend: Arc<dyn FileSystem>) -> FsResult<()> {
        if !mount_point.starts_with('/')
            || mount_point != crate::path::normalize(mount_point)?.as_str()
        {
            return Err(FsError::invalid(mount_point).with_syscall("mount"));
        }
        let mut mounts = self.mounts.write().unwrap();
        if mounts.iter().any(|(mp, _)| mp == mount_point) {
            return Err(FsError::invalid(mount_point).with_syscall("mount"));
        }
        let at = mounts
            .iter()
            .position(|(mp, _)| mp.len() < mount_point.len())
            .unwrap_or(mounts.len());
        mounts.insert(at, (mount_point.to_string(), backend));
        Ok(())
    }

    /// Remove the mount at `mount_point`, returning its backend.
    pub fn remove(&self, mount_point: &str) -> FsResult<Arc<dyn FileSystem>> {
        let mut mounts = self.mounts.write().unwrap();
        match mounts.iter().position(|(mp, _)| mp == mount_point) {
            Some(i) => Ok(mounts.remove(i).1),
            None => Err(FsError::invalid(mount_point).with_syscall("umount")),
        }
    }

    /// Longest-prefix match. `path` must be normalized.
    pub fn resolve(&self, path: &str) -> FsResult<Resolved> {
        let mounts = self.mounts.read().unwrap();
        for (mp, backend) in mounts.iter() {
            let matched = if mp == "/" {
                true
            } else {
                path == mp || path.strip_prefix(mp.as_str()).is_some_and(|r| r.starts_with('/'))
            };
            if matched {
                let local_path = if path == mp {
                    "/".to_string()
                } else if mp == "/" {
                    path.to_string()
                } else {
                    path[mp.len()..].to_string()
                };
                return Ok(Resolved {
                    backend: backend.clone(),
                    mount_point: mp.clone(),
                    local_path,
                });
            }
        }
        Err(FsError::not_found(path))
    }

    pub fn list(&self) -> Vec<MountInfo> {
        let mounts = self.mounts.read().unwrap();
        mounts
            .iter()
            .map(|(mp, backend)| {
                let md = backend.metadata();
                MountInfo {
                    mount_point: mp.clone(),
                    backend: md.name,
                    readonly: md.readonly,
                }
            })
            .collect()
    }

    pub fn contains(&self, mount_point: &str) -> bool {
        self.mounts.read().unwrap().iter().any(|(mp, _)| mp == mount_point)
    }

    /// Basenames of mount points that are direct children of `parent`,
    /// for merging into `readdir` listings.
    pub fn child_mount_names(&self, parent: &str) -> Vec<String> {
        let mounts = self.mounts.read().unwrap();
        mounts
            .iter()
            .filter(|(mp, _)| mp != "/" && dirname(mp) == parent)
            .map(|(mp, _)| basename(mp).to_string())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryFs;

    fn mem() -> Arc<dyn FileSystem> {
        Arc::new(InMemoryFs::new())
    }

    #[test]
    fn longest_prefix_wins() {
        let table = MountTable::new();
        table.add("/", mem()).unwrap();
        table.add("/mnt", mem()).unwrap();
        table.add("/mnt/deep", mem()).unwrap();

        assert_eq!(table.resolve("/mnt/deep/x").unwrap().mount_point, "/mnt/deep");
        assert_eq!(table.resolve("/mnt/deeper").unwrap().mount_point, "/mnt");
        assert_eq!(table.resolve("/other").unwrap().mount_point, "/");
    }

    #[test]
    fn local_path_rewriting() {
        let table = MountTable::new();
        table.add("/", mem()).unwrap();
        table.add("/mnt", mem()).unwrap();

        assert_eq!(table.resolve("/mnt").unwrap().local_path, "/");
        assert_eq!(table.resolve("/mnt/a/b").unwrap().local_path, "/a/b");
        assert_eq!(table.resolve("/a/b").unwrap().local_path, "/a/b");
    }

    #[test]
    fn duplicate_and_relative_mounts_rejected() {
        let table = MountTable::new();
        table.add("/m", mem()).unwrap();
        assert!(table.add("/m", mem()).is_err());
        assert!(table.add("relative", mem()).is_err());
        assert!(table.add("/m/../x", mem()).is_err());
    }

    #[test]
    fn umount_unknown_point_errors() {
        let table = MountTable::new();
        table.add("/m", mem()).unwrap();
        assert!(table.remove("/m").is_ok());
        assert!(table.remove("/m").is_err());
        // Remounting after a umount is allowed.
        assert!(table.add("/m", mem()).is_ok());
    }

    #[test]
    fn child_mounts_listed_one_level_deep() {
        let table = MountTable::new();
        table.add("/", mem()).unwrap();
        table.add("/a", mem()).unwrap();
        table.add("/a/b", mem()).unwrap();
        table.add("/a/b/c", mem()).unwrap();

        let mut names = table.child_mount_names("/a");
        names.sort();
        assert_eq!(names, vec!["b"]);
        assert_eq!(table.child_mount_names("/"), vec!["a"]);
    }
}
