// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Lookup, attributes, statfs and extended attributes

use super::MountContext;
use crate::error::{FsError, FsResult};
use crate::path;
use crate::registry::FsNode;
use crate::scheduler::OpClass;
use crate::types::{HandleId, Metadata, OpContext, StatFs};
use std::sync::Arc;
use std::time::SystemTime;

impl MountContext {
    /// Resolves `name` inside `parent` and returns its attributes.
    pub async fn lookup(&self, ctx: &OpContext, parent: &str, name: &str) -> FsResult<Metadata> {
        self.scheduler
            .run("lookup", OpClass::Interactive, ctx, async {
                path::validate_name(name, self.config.limits.name_max)?;
                let node = self.registry.lookup(&path::join(parent, name)).await?;
                self.node_attrs(&node, ctx).await
            })
            .await
    }

    /// Attributes of the node behind `fh` when it is valid, of `path`
    /// otherwise.
    pub async fn getattr(
        &self,
        ctx: &OpContext,
        path: &str,
        fh: Option<HandleId>,
    ) -> FsResult<Metadata> {
        self.scheduler
            .run("getattr", OpClass::Interactive, ctx, async {
                let node = self.node_for(path, fh).await?;
                self.node_attrs(&node, ctx).await
            })
            .await
    }

    /// Updates timestamps in memory; nothing is persisted.
    pub async fn utimens(
        &self,
        ctx: &OpContext,
        path: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
        fh: Option<HandleId>,
    ) -> FsResult<Metadata> {
        self.scheduler
            .run("utimens", OpClass::Interactive, ctx, async {
                let node = self.node_for(path, fh).await?;
                if !node.is_mutable() {
                    return Err(FsError::ReadOnlySection);
                }
                self.node_attrs(&node, ctx).await?;
                let mut state = node.write().await;
                if let Some(atime) = atime {
                    state.metadata.times.atime = atime;
                }
                if let Some(mtime) = mtime {
                    state.metadata.times.mtime = mtime;
                }
                state.metadata.times.ctime = SystemTime::now();
                Ok(self.attrs.stamp(&state.metadata, ctx))
            })
            .await
    }

    /// Accepted and ignored: permission bits derive from the namespace.
    pub async fn chmod(&self, ctx: &OpContext, path: &str, mode: u32) -> FsResult<Metadata> {
        self.scheduler
            .run("chmod", OpClass::Interactive, ctx, async {
                let node = self.registry.lookup(path).await?;
                tracing::debug!(path, mode = %format!("{mode:o}"), "ignoring chmod");
                self.node_attrs(&node, ctx).await
            })
            .await
    }

    /// Accepted and ignored: ownership is reported from the caller.
    pub async fn chown(
        &self,
        ctx: &OpContext,
        path: &str,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> FsResult<Metadata> {
        self.scheduler
            .run("chown", OpClass::Interactive, ctx, async {
                let node = self.registry.lookup(path).await?;
                tracing::debug!(path, ?uid, ?gid, "ignoring chown");
                self.node_attrs(&node, ctx).await
            })
            .await
    }

    /// Capacity of the host filesystem holding the data directory, with
    /// the handle table standing in for inode counts.
    pub async fn statfs(&self, ctx: &OpContext, path: &str) -> FsResult<StatFs> {
        self.scheduler
            .run("statfs", OpClass::Interactive, ctx, async {
                self.registry.lookup(path).await?;
                let data_dir = self.config.data_dir.clone();
                let stat =
                    tokio::task::spawn_blocking(move || nix::sys::statvfs::statvfs(&data_dir))
                        .await
                        .map_err(|err| FsError::Unexpected(format!("statfs task failed: {err}")))??;
                Ok(StatFs {
                    block_size: stat.block_size() as u32,
                    fragment_size: stat.fragment_size() as u32,
                    blocks: stat.blocks() as u64,
                    blocks_free: stat.blocks_free() as u64,
                    blocks_available: stat.blocks_available() as u64,
                    files: self.handles.capacity(),
                    files_free: self.handles.free(),
                    name_max: self.config.limits.name_max,
                })
            })
            .await
    }

    pub async fn getxattr(
        &self,
        ctx: &OpContext,
        path: &str,
        name: &str,
        _size: u32,
    ) -> FsResult<Vec<u8>> {
        self.xattr_unsupported(ctx, path, "getxattr", name).await?;
        Err(FsError::NotSupported)
    }

    pub async fn setxattr(
        &self,
        ctx: &OpContext,
        path: &str,
        name: &str,
        _value: &[u8],
        _flags: i32,
    ) -> FsResult<()> {
        self.xattr_unsupported(ctx, path, "setxattr", name).await?;
        Err(FsError::NotSupported)
    }

    pub async fn removexattr(&self, ctx: &OpContext, path: &str, name: &str) -> FsResult<()> {
        self.xattr_unsupported(ctx, path, "removexattr", name).await?;
        Err(FsError::NotSupported)
    }

    /// No node carries extended attributes, so the list is always empty.
    pub async fn listxattr(&self, ctx: &OpContext, path: &str, _size: u32) -> FsResult<Vec<u8>> {
        self.scheduler
            .run("listxattr", OpClass::Interactive, ctx, async {
                self.registry.lookup(path).await?;
                Ok(Vec::new())
            })
            .await
    }

    async fn xattr_unsupported(
        &self,
        ctx: &OpContext,
        path: &str,
        op: &'static str,
        name: &str,
    ) -> FsResult<()> {
        self.scheduler
            .run(op, OpClass::Interactive, ctx, async {
                self.registry.lookup(path).await?;
                tracing::trace!(path, name, op, "extended attributes are not supported");
                Ok(())
            })
            .await
    }

    async fn node_for(&self, path: &str, fh: Option<HandleId>) -> FsResult<Arc<FsNode>> {
        if let Some(handle) = fh.and_then(|fh| self.handles.get(fh).ok()) {
            return Ok(handle.node().clone());
        }
        self.registry.lookup(path).await
    }
}
