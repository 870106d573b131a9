// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

mod support;

use dagfs_core::fault::{FaultOp, FaultPolicy, FaultRule};
use dagfs_core::memory::MemoryStack;
use dagfs_core::{FsError, OpenFlags};
use std::time::{Duration, Instant};
use support::{ctx, list, mount, mount_with, read_all, self_key, test_config, write_file};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn write_then_read_in_fresh_mount() {
    let (_stack, fs) = mount().await;
    let ctx = ctx();

    let fh = fs
        .create(&ctx, "/mutable/greeting", OpenFlags::read_write(), 0o644)
        .await
        .expect("create");
    assert_eq!(fs.write(&ctx, fh, 0, b"hello").await.expect("write"), 5);
    assert_eq!(fs.read(&ctx, fh, 0, 5).await.expect("read"), b"hello");

    let attrs = fs.getattr(&ctx, "/mutable/greeting", Some(fh)).await.expect("getattr");
    assert_eq!(attrs.size, 5);
    fs.release(&ctx, fh).await.expect("release");
}

#[tokio::test]
async fn nested_mkdir_is_listed() {
    let (_stack, fs) = mount().await;
    let ctx = ctx();

    fs.mkdir(&ctx, "/mutable/d", 0o755).await.expect("mkdir d");
    fs.mkdir(&ctx, "/mutable/d/sub", 0o755).await.expect("mkdir sub");

    assert_eq!(list(&fs, "/mutable/d").await, vec!["sub"]);
}

#[tokio::test]
async fn immutable_child_is_readable_but_not_writable() {
    let stack = MemoryStack::new(self_key());
    let child = stack.dag.insert_file(b"hello, world");
    let root = stack.dag.insert_dir([("child", child)]);
    let (_stack, fs) = mount_with(test_config(), stack).await;
    let ctx = ctx();

    let path = format!("/immutable/{root}/child");
    let fh = fs.open(&ctx, &path, OpenFlags::read_only()).await.expect("open");
    assert_eq!(fs.read(&ctx, fh, 0, 12).await.expect("read"), b"hello, world");

    let err = fs.write(&ctx, fh, 0, b"x").await.expect_err("write must fail");
    assert_eq!(err, FsError::ReadOnlySection);
    assert_eq!(err.errno(), libc::EROFS);
    assert_eq!(read_all(&fs, fh).await, b"hello, world");
}

#[tokio::test]
async fn concurrent_handles_share_content() {
    let (_stack, fs) = mount().await;
    let ctx = ctx();
    write_file(&fs, "/mutable/file", b"").await;

    let a = fs
        .open(&ctx, "/mutable/file", OpenFlags::read_write())
        .await
        .expect("open a");
    let b = fs
        .open(&ctx, "/mutable/file", OpenFlags::read_write())
        .await
        .expect("open b");
    assert_ne!(a, b);

    fs.write(&ctx, a, 0, b"AA").await.expect("write a");
    assert_eq!(fs.read(&ctx, b, 0, 2).await.expect("read b"), b"AA");
}

#[tokio::test]
async fn symlink_round_trip_and_nofollow() {
    let (_stack, fs) = mount().await;
    let ctx = ctx();
    write_file(&fs, "/mutable/target", b"pointed at").await;

    let attrs = fs
        .symlink(&ctx, "/mutable/target", "/mutable/link")
        .await
        .expect("symlink");
    assert!(attrs.is_symlink());
    assert_eq!(fs.readlink(&ctx, "/mutable/link").await.expect("readlink"), "/mutable/target");

    let nofollow = OpenFlags {
        nofollow: true,
        ..OpenFlags::read_only()
    };
    let err = fs.open(&ctx, "/mutable/link", nofollow).await.expect_err("nofollow");
    assert_eq!(err.errno(), libc::ELOOP);

    let fh = fs
        .open(&ctx, "/mutable/link", OpenFlags::read_only())
        .await
        .expect("open through link");
    assert_eq!(read_all(&fs, fh).await, b"pointed at");
}

#[tokio::test]
async fn rename_keeps_open_handles_on_the_moved_file() {
    let (_stack, fs) = mount().await;
    let ctx = ctx();
    write_file(&fs, "/mutable/old", b"original").await;

    let fh = fs
        .open(&ctx, "/mutable/old", OpenFlags::read_only())
        .await
        .expect("open");
    fs.rename(&ctx, "/mutable/old", "/mutable/new").await.expect("rename");

    assert_eq!(
        fs.lookup(&ctx, "/mutable", "old").await.expect_err("old is gone"),
        FsError::NotFound
    );
    let attrs = fs.lookup(&ctx, "/mutable", "new").await.expect("lookup new");
    assert_eq!(attrs.size, 8);
    assert_eq!(read_all(&fs, fh).await, b"original");
}

#[tokio::test]
async fn cancelled_read_leaves_handle_usable() {
    let stack = MemoryStack::new(self_key());
    let child = stack.dag.insert_file(b"hello, world");
    let root = stack.dag.insert_dir([("child", child)]);
    let (stack, fs) = mount_with(test_config(), stack).await;
    let ctx = ctx();

    let fh = fs
        .open(&ctx, &format!("/immutable/{root}/child"), OpenFlags::read_only())
        .await
        .expect("open");
    stack
        .faults
        .set_policy(FaultPolicy::single(FaultRule::stall(FaultOp::Read)));

    let cancel = CancellationToken::new();
    let read_ctx = ctx.clone().with_cancel(cancel.clone());
    let (result, ()) = tokio::join!(fs.read(&read_ctx, fh, 0, 12), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });
    let err = result.expect_err("read must be interrupted");
    assert_eq!(err, FsError::Interrupted);
    assert_eq!(err.errno(), libc::EINTR);

    stack.faults.clear();
    assert_eq!(fs.read(&ctx, fh, 0, 12).await.expect("read"), b"hello, world");
    fs.release(&ctx, fh).await.expect("release");
}

#[tokio::test]
async fn statfs_reports_host_capacity_and_free_handles() {
    let data_dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config();
    config.data_dir = data_dir.path().to_path_buf();
    config.limits.max_open_handles = 16;
    let (_stack, fs) = mount_with(config, MemoryStack::new(self_key())).await;
    let ctx = ctx();

    write_file(&fs, "/mutable/a", b"a").await;
    let fh = fs
        .open(&ctx, "/mutable/a", OpenFlags::read_only())
        .await
        .expect("open");

    let stat = fs.statfs(&ctx, "/").await.expect("statfs");
    let host = nix::sys::statvfs::statvfs(data_dir.path()).expect("host statvfs");
    assert_eq!(stat.block_size as u64, host.block_size() as u64);
    assert_eq!(stat.blocks, host.blocks() as u64);
    assert_eq!(stat.files, 16);
    assert_eq!(stat.files_free, 15);

    fs.release(&ctx, fh).await.expect("release");
    let stat = fs.statfs(&ctx, "/").await.expect("statfs");
    assert_eq!(stat.files_free, 16);
}

#[tokio::test]
async fn stalled_create_does_not_block_other_handles() {
    let stack = MemoryStack::new(self_key());
    let child = stack.dag.insert_file(b"immutable");
    let root = stack.dag.insert_dir([("child", child)]);
    let mut config = test_config();
    config.timeouts.structural_ms = 1500;
    let (stack, fs) = mount_with(config, stack).await;
    let ctx = ctx();

    write_file(&fs, "/mutable/m", b"data").await;
    let fh = fs
        .open(&ctx, "/mutable/m", OpenFlags::read_only())
        .await
        .expect("open");
    stack
        .faults
        .set_policy(FaultPolicy::single(FaultRule::stall(FaultOp::Resolve)));

    let slow_path = format!("/immutable/{root}/child");
    let (slow, elapsed) = tokio::join!(
        fs.open(&ctx, &slow_path, OpenFlags::read_only().with_create()),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let started = Instant::now();
            let data = fs.read(&ctx, fh, 0, 4).await.expect("read");
            let elapsed = started.elapsed();
            assert_eq!(data, b"data");
            stack.faults.clear();
            elapsed
        }
    );
    assert!(elapsed < Duration::from_millis(500), "read waited {elapsed:?}");

    if let Ok(slow_fh) = slow {
        fs.release(&ctx, slow_fh).await.expect("release slow");
    }
    fs.release(&ctx, fh).await.expect("release");
}

#[tokio::test]
async fn unlinked_file_stays_reachable_through_its_handle() {
    let (_stack, fs) = mount().await;
    let ctx = ctx();

    write_file(&fs, "/mutable/f", b"old").await;
    let old = fs
        .open(&ctx, "/mutable/f", OpenFlags::read_write())
        .await
        .expect("open old");
    fs.unlink(&ctx, "/mutable/f").await.expect("unlink");

    let new = fs
        .create(&ctx, "/mutable/f", OpenFlags::read_write(), 0o644)
        .await
        .expect("recreate");
    assert_eq!(fs.write(&ctx, old, 0, &[7u8; 100]).await.expect("write old"), 100);

    let old_attrs = fs.getattr(&ctx, "/mutable/f", Some(old)).await.expect("fstat old");
    assert_eq!(old_attrs.size, 100);
    let new_attrs = fs.getattr(&ctx, "/mutable/f", Some(new)).await.expect("fstat new");
    assert_eq!(new_attrs.size, 0);
    let by_path = fs.getattr(&ctx, "/mutable/f", None).await.expect("stat path");
    assert_eq!(by_path.size, 0);

    fs.release(&ctx, old).await.expect("release old");
    fs.release(&ctx, new).await.expect("release new");
}

#[tokio::test]
async fn renamed_away_file_keeps_its_handle_identity() {
    let (_stack, fs) = mount().await;
    let ctx = ctx();

    write_file(&fs, "/mutable/f", b"original").await;
    let old = fs
        .open(&ctx, "/mutable/f", OpenFlags::read_only())
        .await
        .expect("open old");
    fs.rename(&ctx, "/mutable/f", "/mutable/g").await.expect("rename");

    let new = fs
        .create(&ctx, "/mutable/f", OpenFlags::read_write(), 0o644)
        .await
        .expect("recreate");
    let old_attrs = fs.getattr(&ctx, "/mutable/f", Some(old)).await.expect("fstat old");
    assert_eq!(old_attrs.size, 8);
    let new_attrs = fs.getattr(&ctx, "/mutable/f", Some(new)).await.expect("fstat new");
    assert_eq!(new_attrs.size, 0);
    assert_eq!(read_all(&fs, old).await, b"original");

    fs.release(&ctx, old).await.expect("release old");
    fs.release(&ctx, new).await.expect("release new");
}
