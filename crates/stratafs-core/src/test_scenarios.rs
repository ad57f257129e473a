// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Cross-cutting scenario tests
//!
//! End-to-end flows over a fully assembled VFS: multiple mounts, the overlay
//! backend under the mutex adapter, permission enforcement, and the watcher
//! bus. Narrow per-module properties live next to their modules; these tests
//! exercise the composed system.

use std::sync::Arc;

use crate::backend::{FileSystem, FsFile};
use crate::error::ErrorKind;
use crate::memory::InMemoryFs;
use crate::mutex::MutexedFs;
use crate::overlay::{OverlayFs, OverlayOptions, DELETION_LOG};
use crate::stats::{Credentials, Stats, R_OK, S_IFDIR, S_IFREG};
use crate::vfs::{MkdirOptions, RmOptions, Vfs, COPYFILE_EXCL};
use crate::watch::EventType;

fn mkdir_opts(recursive: bool, mode: u32) -> MkdirOptions {
    MkdirOptions { recursive, mode }
}

/// A lower layer holding `/f` with contents `hello`, mode `0o444`.
fn seeded_lower() -> Arc<dyn FileSystem> {
    let fs = InMemoryFs::new();
    fs.sync_sync("/f", b"hello", &Stats::new(S_IFREG | 0o444, 0, 0, 5, 0)).unwrap();
    Arc::new(fs)
}

fn overlay_vfs(upper: Arc<dyn FileSystem>, lower: Arc<dyn FileSystem>) -> Vfs {
    let overlay = OverlayFs::mutexed(OverlayOptions { upper, lower }).unwrap();
    Vfs::with_root(Arc::new(overlay)).unwrap()
}

#[tokio::test]
async fn mkdir_recursive_creates_chain_and_is_idempotent() {
    let vfs = Vfs::new();

    let first = vfs.mkdir("/a/b/c", &mkdir_opts(true, 0o755)).await.unwrap();
    assert_eq!(first.as_deref(), Some("/a"));

    for dir in ["/a", "/a/b", "/a/b/c"] {
        let st = vfs.stat(dir).await.unwrap();
        assert_eq!(st.mode, S_IFDIR | 0o755, "mode of {}", dir);
    }

    // Second call: no error, nothing created.
    let second = vfs.mkdir("/a/b/c", &mkdir_opts(true, 0o755)).await.unwrap();
    assert_eq!(second, None);
}

#[tokio::test]
async fn mutex_serializes_a_read_modify_write() {
    let fs = Arc::new(MutexedFs::new(Arc::new(InMemoryFs::new())));
    let x = Arc::new(std::sync::Mutex::new(1u32));

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let fs = fs.clone();
        let x = x.clone();
        tasks.push(tokio::spawn(async move {
            let guard = fs.lock("/r", "t").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            *x.lock().unwrap() += 1;
            guard.unlock();
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
    assert_eq!(*x.lock().unwrap(), 4);
}

#[tokio::test]
async fn overlay_write_shadows_read_only_lower() {
    let upper: Arc<dyn FileSystem> = Arc::new(InMemoryFs::new());
    let lower = seeded_lower();
    let vfs = overlay_vfs(upper.clone(), lower.clone());

    assert_eq!(vfs.read_file_to_string("/f").await.unwrap(), "hello");

    vfs.write_file("/f", "HELLO").await.unwrap();
    assert_eq!(vfs.read_file_to_string("/f").await.unwrap(), "HELLO");

    // The lower layer still holds the original bytes; the write landed on
    // the upper layer.
    let lower_stat = lower.stat("/f").await.unwrap();
    assert_eq!(lower_stat.size, 5);
    assert!(upper.exists("/f").await.unwrap());
}

#[tokio::test]
async fn overlay_delete_persists_across_reconstruction() {
    let upper: Arc<dyn FileSystem> = Arc::new(InMemoryFs::new());
    let lower = seeded_lower();
    let vfs = overlay_vfs(upper.clone(), lower.clone());

    vfs.unlink("/f").await.unwrap();
    assert!(!vfs.exists("/f").await.unwrap());

    // Let the queued log writer finish, then inspect the upper layer.
    tokio::task::yield_now().await;
    let log = upper.stat(DELETION_LOG).await.unwrap();
    let file = upper
        .open_file(DELETION_LOG, crate::flags::OpenFlags::parse("r").unwrap())
        .await
        .unwrap();
    let mut buf = vec![0u8; log.size as usize];
    let n = file.read(&mut buf, 0).await.unwrap();
    file.close().await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).contains("d/f\n"));

    // A fresh overlay over the same layers replays the log.
    let vfs2 = overlay_vfs(upper, lower);
    assert!(!vfs2.exists("/f").await.unwrap());
}

#[tokio::test]
async fn cross_mount_rename_falls_back_to_copy() {
    let vfs = Vfs::new();
    vfs.mount("/a", Arc::new(InMemoryFs::new())).await.unwrap();
    vfs.mount("/b", Arc::new(InMemoryFs::new())).await.unwrap();

    vfs.write_file("/a/x", "v").await.unwrap();
    vfs.rename("/a/x", "/b/x").await.unwrap();

    assert!(!vfs.exists("/a/x").await.unwrap());
    assert_eq!(vfs.read_file_to_string("/b/x").await.unwrap(), "v");
}

#[tokio::test]
async fn exclusive_create_fails_on_existing_path() {
    let vfs = Vfs::new();
    vfs.write_file("/e", "1").await.unwrap();
    let err = vfs.open("/e", "wx", 0o644).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::Exists);
}

#[tokio::test]
async fn byte_round_trip_and_utf8_decoding() {
    let vfs = Vfs::new();
    let bytes: Vec<u8> = vec![0, 159, 146, 150, 255, 17];
    vfs.write_file("/blob", &bytes).await.unwrap();
    assert_eq!(vfs.read_file("/blob").await.unwrap(), bytes);
    assert_eq!(
        vfs.read_file_to_string("/blob").await.unwrap_err().kind,
        ErrorKind::InvalidArgument
    );

    vfs.write_file("/text", "grüße").await.unwrap();
    assert_eq!(vfs.read_file_to_string("/text").await.unwrap(), "grüße");
}

#[tokio::test]
async fn realpath_resolves_symlinks_across_mounts() {
    let vfs = Vfs::new();
    vfs.mkdir("/data", &mkdir_opts(false, 0o755)).await.unwrap();
    vfs.mount("/data/store", Arc::new(InMemoryFs::new())).await.unwrap();
    vfs.write_file("/data/store/file", "x").await.unwrap();
    vfs.symlink("/data/store", "/shortcut").await.unwrap();

    let resolved = vfs.realpath("/shortcut/file").await.unwrap();
    assert_eq!(resolved, "/data/store/file");
    // The canonical path is not itself a symlink.
    assert_eq!(
        vfs.readlink(&resolved).await.unwrap_err().kind,
        ErrorKind::InvalidArgument
    );

    // Reads through the link see the same file.
    assert_eq!(vfs.read_file_to_string("/shortcut/file").await.unwrap(), "x");

    // Missing targets resolve to the input path.
    assert_eq!(vfs.realpath("/no/such/node").await.unwrap(), "/no/such/node");
}

#[tokio::test]
async fn symlink_cycles_are_eloop() {
    let vfs = Vfs::new();
    vfs.symlink("/cycle-b", "/cycle-a").await.unwrap();
    vfs.symlink("/cycle-a", "/cycle-b").await.unwrap();
    let err = vfs.realpath("/cycle-a").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::SymlinkLoop);
}

#[tokio::test]
async fn permission_bits_are_enforced_for_non_root() {
    let vfs = Vfs::new();
    vfs.write_file("/locked", "secret").await.unwrap();
    vfs.chmod("/locked", 0o000).await.unwrap();

    vfs.set_credentials(Credentials::new(1000, 1000));
    let err = vfs.open("/locked", "r", 0o644).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::AccessDenied);
    assert_eq!(
        vfs.access("/locked", R_OK).await.unwrap_err().kind,
        ErrorKind::AccessDenied
    );

    // Root bypasses.
    vfs.set_credentials(Credentials::root());
    assert!(vfs.open("/locked", "r", 0o644).await.is_ok());
}

#[tokio::test]
async fn descriptor_positions_and_growth() {
    let vfs = Vfs::new();
    let fd = vfs.open("/f", "w+", 0o644).await.unwrap();

    vfs.write(fd, b"abcdef", None).await.unwrap();
    let st = vfs.fstat(fd).await.unwrap();
    assert_eq!(st.size, 6);

    // Positional write past the end grows the file to pos + len.
    vfs.write(fd, b"zz", Some(10)).await.unwrap();
    assert_eq!(vfs.fstat(fd).await.unwrap().size, 12);

    let mut buf = [0u8; 4];
    let n = vfs.read(fd, &mut buf, Some(0)).await.unwrap();
    assert_eq!(&buf[..n], b"abcd");

    vfs.close(fd).await.unwrap();
    assert_eq!(vfs.close(fd).await.unwrap_err().kind, ErrorKind::BadFileDescriptor);
    assert_eq!(
        vfs.fstat(fd).await.unwrap_err().kind,
        ErrorKind::BadFileDescriptor
    );
}

#[tokio::test]
async fn append_descriptors_always_write_at_eof() {
    let vfs = Vfs::new();
    vfs.write_file("/log", "one\n").await.unwrap();
    let fd = vfs.open("/log", "a", 0o644).await.unwrap();
    vfs.write(fd, b"two\n", None).await.unwrap();
    // Even an explicit position is ignored in append mode.
    vfs.write(fd, b"three\n", Some(0)).await.unwrap();
    vfs.close(fd).await.unwrap();
    assert_eq!(
        vfs.read_file_to_string("/log").await.unwrap(),
        "one\ntwo\nthree\n"
    );
}

#[tokio::test]
async fn readdir_unions_child_mounts_without_duplicates() {
    let vfs = Vfs::new();
    vfs.write_file("/x", "").await.unwrap();
    vfs.mount("/m", Arc::new(InMemoryFs::new())).await.unwrap();

    let mut names = vfs.readdir("/").await.unwrap();
    names.sort();
    assert_eq!(names, vec!["m", "x"]);

    // Listing the mount point itself reads the mounted backend.
    vfs.write_file("/m/inside", "").await.unwrap();
    assert_eq!(vfs.readdir("/m").await.unwrap(), vec!["inside"]);
}

#[tokio::test]
async fn hard_links_stay_within_a_mount() {
    let vfs = Vfs::new();
    vfs.mount("/other", Arc::new(InMemoryFs::new())).await.unwrap();
    vfs.write_file("/file", "data").await.unwrap();

    assert_eq!(
        vfs.link("/file", "/other/link").await.unwrap_err().kind,
        ErrorKind::CrossDevice
    );

    vfs.link("/file", "/link").await.unwrap();
    assert_eq!(vfs.stat("/link").await.unwrap().nlink, 2);
    assert_eq!(vfs.read_file_to_string("/link").await.unwrap(), "data");
}

#[tokio::test]
async fn rm_recursive_and_force() {
    let vfs = Vfs::new();
    vfs.mkdir("/tree/sub", &mkdir_opts(true, 0o755)).await.unwrap();
    vfs.write_file("/tree/a", "1").await.unwrap();
    vfs.write_file("/tree/sub/b", "2").await.unwrap();

    assert_eq!(
        vfs.rm("/tree", &RmOptions::default()).await.unwrap_err().kind,
        ErrorKind::IsDirectory
    );

    vfs.rm(
        "/tree",
        &RmOptions {
            recursive: true,
            force: false,
        },
    )
    .await
    .unwrap();
    assert!(!vfs.exists("/tree").await.unwrap());

    // force suppresses the missing-target error.
    assert_eq!(
        vfs.rm("/tree", &RmOptions::default()).await.unwrap_err().kind,
        ErrorKind::NotFound
    );
    vfs.rm(
        "/tree",
        &RmOptions {
            recursive: false,
            force: true,
        },
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn copy_file_honours_excl() {
    let vfs = Vfs::new();
    vfs.write_file("/src", "payload").await.unwrap();
    vfs.chmod("/src", 0o600).await.unwrap();

    vfs.copy_file("/src", "/dst", 0).await.unwrap();
    assert_eq!(vfs.read_file_to_string("/dst").await.unwrap(), "payload");
    assert_eq!(vfs.stat("/dst").await.unwrap().mode & 0o7777, 0o600);

    assert_eq!(
        vfs.copy_file("/src", "/dst", COPYFILE_EXCL).await.unwrap_err().kind,
        ErrorKind::Exists
    );
}

#[tokio::test]
async fn cp_recursive_copies_trees_and_symlinks() {
    let vfs = Vfs::new();
    vfs.mkdir("/srcdir/nested", &mkdir_opts(true, 0o750)).await.unwrap();
    vfs.write_file("/srcdir/f", "f").await.unwrap();
    vfs.write_file("/srcdir/nested/g", "g").await.unwrap();
    vfs.symlink("/srcdir/f", "/srcdir/ln").await.unwrap();

    let err = vfs.cp("/srcdir", "/dstdir", &Default::default()).await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::IsDirectory);

    vfs.cp(
        "/srcdir",
        "/dstdir",
        &crate::vfs::CpOptions {
            recursive: true,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    assert_eq!(vfs.read_file_to_string("/dstdir/f").await.unwrap(), "f");
    assert_eq!(vfs.read_file_to_string("/dstdir/nested/g").await.unwrap(), "g");
    // The link is copied as a link, still pointing at the original target.
    assert_eq!(vfs.readlink("/dstdir/ln").await.unwrap(), "/srcdir/f");
    assert_eq!(vfs.stat("/dstdir").await.unwrap().mode & 0o7777, 0o750);
}

#[tokio::test]
async fn watchers_see_renames_and_changes() {
    let vfs = Vfs::new();
    let mut watcher = vfs.watch("/", false).unwrap();

    vfs.write_file("/w", "1").await.unwrap();
    // Creation emits a rename, the write itself a change.
    let ev = watcher.next_event().await.unwrap();
    assert_eq!(ev.event_type, EventType::Rename);
    assert_eq!(ev.filename, "w");
    let ev = watcher.next_event().await.unwrap();
    assert_eq!(ev.event_type, EventType::Change);

    vfs.unlink("/w").await.unwrap();
    let ev = watcher.next_event().await.unwrap();
    assert_eq!(ev.event_type, EventType::Rename);

    watcher.close();
    assert!(watcher.next_event().await.is_none());
}

#[tokio::test]
async fn mkdtemp_creates_private_directories() {
    let vfs = Vfs::new();
    vfs.mkdir("/tmp", &mkdir_opts(false, 0o777)).await.unwrap();

    let a = vfs.mkdtemp("/tmp/job-").await.unwrap();
    let b = vfs.mkdtemp("/tmp/job-").await.unwrap();
    assert_ne!(a, b);
    assert!(a.starts_with("/tmp/job-"));

    let st = vfs.stat(&a).await.unwrap();
    assert!(st.is_dir());
    assert_eq!(st.mode & 0o7777, 0o700);
}

#[tokio::test]
async fn glob_matches_by_segments() {
    let vfs = Vfs::new();
    vfs.mkdir("/src/deep", &mkdir_opts(true, 0o755)).await.unwrap();
    vfs.write_file("/src/main.rs", "").await.unwrap();
    vfs.write_file("/src/lib.rs", "").await.unwrap();
    vfs.write_file("/src/deep/util.rs", "").await.unwrap();
    vfs.write_file("/src/notes.txt", "").await.unwrap();

    let mut one_level = vfs.glob("/src/*.rs").await.unwrap();
    one_level.sort();
    assert_eq!(one_level, vec!["/src/lib.rs", "/src/main.rs"]);

    let mut all = vfs.glob("/src/**/*.rs").await.unwrap();
    all.sort();
    assert_eq!(all, vec!["/src/deep/util.rs", "/src/lib.rs", "/src/main.rs"]);
}

#[tokio::test]
async fn statfs_reflects_backend_metadata() {
    let vfs = Vfs::new();
    let sf = vfs.statfs("/").unwrap();
    assert_eq!(sf.bsize, 4096);
}

#[tokio::test]
async fn opendir_iterates_a_snapshot() {
    let vfs = Vfs::new();
    vfs.mkdir("/d", &mkdir_opts(false, 0o755)).await.unwrap();
    vfs.write_file("/d/a", "").await.unwrap();
    vfs.mkdir("/d/sub", &mkdir_opts(false, 0o755)).await.unwrap();

    let dir = vfs.opendir("/d").await.unwrap();
    let mut names: Vec<String> = dir.map(|e| e.name).collect();
    names.sort();
    assert_eq!(names, vec!["a", "sub"]);
}

#[test]
fn sync_surface_round_trip() {
    let vfs = Vfs::new();
    vfs.mkdir_sync("/s/deep", &mkdir_opts(true, 0o755)).unwrap();
    vfs.write_file_sync("/s/deep/f", "sync bytes").unwrap();
    assert_eq!(vfs.read_file_to_string_sync("/s/deep/f").unwrap(), "sync bytes");

    vfs.symlink_sync("/s/deep", "/sd").unwrap();
    assert_eq!(vfs.realpath_sync("/sd/f").unwrap(), "/s/deep/f");
    assert_eq!(vfs.stat_sync("/sd/f").unwrap().size, 10);

    vfs.rename_sync("/s/deep/f", "/s/deep/g").unwrap();
    assert!(!vfs.exists_sync("/s/deep/f").unwrap());

    let fd = vfs.open_sync("/s/deep/g", "r", 0o644).unwrap();
    let mut buf = [0u8; 16];
    let n = vfs.read_sync(fd, &mut buf, None).unwrap();
    assert_eq!(&buf[..n], b"sync bytes");
    vfs.close_sync(fd).unwrap();

    vfs.rm_sync(
        "/s",
        &RmOptions {
            recursive: true,
            force: false,
        },
    )
    .unwrap();
    assert!(!vfs.exists_sync("/s").unwrap());
}

#[tokio::test]
async fn umount_detaches_and_allows_remount() {
    let vfs = Vfs::new();
    let backend = Arc::new(InMemoryFs::new());
    vfs.mount("/m", backend.clone()).await.unwrap();
    vfs.write_file("/m/keep", "kept").await.unwrap();

    vfs.umount("/m").unwrap();
    assert_eq!(vfs.umount("/m").unwrap_err().kind, ErrorKind::InvalidArgument);
    assert!(!vfs.exists("/m/keep").await.unwrap());

    // The backend retained its data across the unmount.
    vfs.mount("/m", backend).await.unwrap();
    assert_eq!(vfs.read_file_to_string("/m/keep").await.unwrap(), "kept");
}

#[tokio::test]
async fn setgid_directories_propagate_group() {
    let vfs = Vfs::new();
    vfs.mkdir("/shared", &mkdir_opts(false, 0o777)).await.unwrap();
    vfs.chown("/shared", 0, 42).await.unwrap();
    vfs.chmod("/shared", 0o2777).await.unwrap();

    vfs.set_credentials(Credentials::new(1000, 1000));
    vfs.write_file("/shared/f", "x").await.unwrap();
    let st = vfs.stat("/shared/f").await.unwrap();
    assert_eq!(st.gid, 42);
    assert_eq!(st.uid, 1000);

    vfs.mkdir("/shared/sub", &mkdir_opts(false, 0o755)).await.unwrap();
    let sub = vfs.stat("/shared/sub").await.unwrap();
    assert_eq!(sub.gid, 42);
    assert_ne!(sub.mode & crate::stats::S_ISGID, 0);
}

#[tokio::test]
async fn chown_rules_and_setid_clearing() {
    let vfs = Vfs::new();
    vfs.write_file("/owned", "x").await.unwrap();
    vfs.chown("/owned", 1000, 1000).await.unwrap();
    vfs.chmod("/owned", 0o4755).await.unwrap();

    // Non-owner cannot chmod or chown.
    vfs.set_credentials(Credentials::new(2000, 2000));
    assert_eq!(
        vfs.chmod("/owned", 0o600).await.unwrap_err().kind,
        ErrorKind::NotPermitted
    );
    assert_eq!(
        vfs.chown("/owned", 2000, 2000).await.unwrap_err().kind,
        ErrorKind::NotPermitted
    );

    // The owner may hand the file to a group they belong to; the setuid bit
    // drops in the process.
    let mut creds = Credentials::new(1000, 1000);
    creds.groups.push(42);
    vfs.set_credentials(creds);
    vfs.chown("/owned", 1000, 42).await.unwrap();
    let st = vfs.stat("/owned").await.unwrap();
    assert_eq!(st.gid, 42);
    assert_eq!(st.mode & 0o6000, 0);
}

#[tokio::test]
async fn truncate_and_utimes() {
    let vfs = Vfs::new();
    vfs.write_file("/t", "0123456789").await.unwrap();
    vfs.truncate("/t", 4).await.unwrap();
    assert_eq!(vfs.read_file_to_string("/t").await.unwrap(), "0123");

    vfs.utimes("/t", 1_000, 2_000).await.unwrap();
    let st = vfs.stat("/t").await.unwrap();
    assert_eq!((st.atime_ms, st.mtime_ms), (1_000, 2_000));
}
