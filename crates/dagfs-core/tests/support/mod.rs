// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

#![allow(dead_code)]

use dagfs_core::memory::MemoryStack;
use dagfs_core::{
    Cid, FsConfig, HandleId, Key, MountContext, OpContext, OpenFlags, PublishPolicy,
};
use std::time::Duration;

pub fn self_key() -> Key {
    Key {
        name: "self".to_string(),
        id: "k-self".to_string(),
    }
}

pub fn ctx() -> OpContext {
    OpContext::new(1000, 1000, 4242)
}

/// Config with publish windows short enough for tests.
pub fn test_config() -> FsConfig {
    FsConfig {
        publish: PublishPolicy {
            short_window_ms: 20,
            long_window_ms: 200,
        },
        ..FsConfig::default()
    }
}

pub async fn mount() -> (MemoryStack, MountContext) {
    mount_with(test_config(), MemoryStack::new(self_key())).await
}

pub async fn mount_with(config: FsConfig, stack: MemoryStack) -> (MemoryStack, MountContext) {
    let fs = MountContext::new(config, stack.backends()).await.expect("mount");
    (stack, fs)
}

/// Creates `path` holding `data` and closes the handle.
pub async fn write_file(fs: &MountContext, path: &str, data: &[u8]) {
    let ctx = ctx();
    let fh = fs.create(&ctx, path, OpenFlags::read_write(), 0o644).await.expect("create");
    assert_eq!(fs.write(&ctx, fh, 0, data).await.expect("write"), data.len());
    fs.release(&ctx, fh).await.expect("release");
}

pub async fn read_all(fs: &MountContext, fh: HandleId) -> Vec<u8> {
    fs.read(&ctx(), fh, 0, 1 << 20).await.expect("read")
}

pub async fn list(fs: &MountContext, path: &str) -> Vec<String> {
    let ctx = ctx();
    let fh = fs.opendir(&ctx, path).await.expect("opendir");
    let mut names = Vec::new();
    fs.readdir(&ctx, fh, 0, |name, _, _| {
        names.push(name.to_string());
        true
    })
    .await
    .expect("readdir");
    fs.releasedir(&ctx, fh).await.expect("releasedir");
    names
}

/// Waits for the republisher to publish `key_id` and returns the latest root.
pub async fn wait_for_publish(stack: &MemoryStack, key_id: &str) -> Cid {
    for _ in 0..100 {
        let latest = stack
            .names
            .published()
            .into_iter()
            .rev()
            .find(|(id, _)| id == key_id);
        if let Some((_, cid)) = latest {
            return cid;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{key_id} was never published");
}
