// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! File handle operations

use super::{Followed, MountContext};
use crate::error::{FsError, FsResult};
use crate::handles::{IoKind, OpenHandle, Reservation};
use crate::registry::FsNode;
use crate::scheduler::OpClass;
use crate::types::{FileKind, HandleId, Metadata, OpContext, OpenFlags, Whence};
use std::sync::Arc;
use std::time::SystemTime;

impl MountContext {
    /// Opens a regular file, following symlinks unless `flags.nofollow`.
    ///
    /// The handle slot is claimed before anything else, so exhaustion never
    /// creates a file as a side effect.
    pub async fn open(&self, ctx: &OpContext, path: &str, flags: OpenFlags) -> FsResult<HandleId> {
        let class = if flags.create {
            OpClass::Structural
        } else {
            OpClass::Interactive
        };
        self.scheduler
            .run("open", class, ctx, self.open_file(ctx, path, flags))
            .await
    }

    /// `open` with `O_CREAT`. Permission bits come from the namespace, so
    /// `mode` is not recorded.
    pub async fn create(
        &self,
        ctx: &OpContext,
        path: &str,
        flags: OpenFlags,
        _mode: u32,
    ) -> FsResult<HandleId> {
        self.open(ctx, path, flags.with_create()).await
    }

    /// Without `flags.create` this runs under the shared registry lock taken
    /// by the scheduler. With it, the lock is taken here: shared while
    /// following the path, exclusive only if the leaf has to be created.
    async fn open_file(&self, ctx: &OpContext, path: &str, flags: OpenFlags) -> FsResult<HandleId> {
        let reservation = self.handles.reserve()?;
        if !flags.create {
            let node = self.open_node(path, flags).await?;
            return self.bind_file(ctx, path, node, flags, reservation).await;
        }

        let missing = {
            let _shared = self.registry.shared().await;
            match self.follow(path, flags).await? {
                Followed::Node(node) => {
                    return self.bind_file(ctx, path, node, flags, reservation).await;
                }
                Followed::Missing(missing) => missing,
            }
        };
        let node = match self.create_file(&missing).await {
            Ok(node) => node,
            // Lost a race with another creator.
            Err(FsError::AlreadyExists) if !flags.exclusive => {
                let _shared = self.registry.shared().await;
                let existing = OpenFlags {
                    create: false,
                    ..flags
                };
                let node = self.open_node(&missing, existing).await?;
                return self.bind_file(ctx, path, node, flags, reservation).await;
            }
            Err(err) => return Err(err),
        };
        let _shared = self.registry.shared().await;
        self.bind_file(ctx, path, node, flags, reservation).await
    }

    /// Type and access checks on an opened node, then the handle itself.
    async fn bind_file(
        &self,
        ctx: &OpContext,
        path: &str,
        node: Arc<FsNode>,
        flags: OpenFlags,
        reservation: Reservation<'_>,
    ) -> FsResult<HandleId> {
        self.node_attrs(&node, ctx).await?;
        let (kind, target) = {
            let state = node.read().await;
            (state.metadata.kind, state.target()?.clone())
        };
        match kind {
            FileKind::Directory => return Err(FsError::IsADirectory),
            FileKind::Symlink => return Err(FsError::SymlinkLoop),
            FileKind::File if flags.directory => return Err(FsError::NotADirectory),
            FileKind::File => {}
        }
        if (flags.write || flags.truncate) && !(node.is_mutable() && target.is_writable()) {
            return Err(FsError::ReadOnlySection);
        }

        let mut io = self.file_io(&target, flags.write).await?;
        if flags.truncate && flags.write {
            let mut state = node.write().await;
            io.truncate(0).await?;
            state.metadata.size = 0;
            drop(state);
            self.registry.invalidate(node.path());
        }

        let id = reservation.commit_file(&self.registry, node, flags, io);
        tracing::debug!(path, fh = id.0, write = flags.write, "opened file");
        Ok(id)
    }

    /// Reads up to `size` bytes at `offset`; short or empty at end of file.
    pub async fn read(
        &self,
        ctx: &OpContext,
        fh: HandleId,
        offset: u64,
        size: u32,
    ) -> FsResult<Vec<u8>> {
        self.scheduler
            .run("read", OpClass::Interactive, ctx, async {
                let handle = self.handles.lookup(fh, IoKind::File)?;
                if !handle.flags().read {
                    return Err(FsError::BadHandle);
                }
                let _node = handle.node().read().await;
                let mut io = handle.file()?.lock().await;
                let mut buf = vec![0u8; size as usize];
                let n = io.read(&mut buf, offset).await?;
                buf.truncate(n);
                tracing::trace!(fh = fh.0, offset, n, "read");
                Ok(buf)
            })
            .await
    }

    /// Writes `data` at `offset` (at end of file for append handles).
    ///
    /// Read-only namespaces are reported before handle access mode.
    pub async fn write(
        &self,
        ctx: &OpContext,
        fh: HandleId,
        offset: u64,
        data: &[u8],
    ) -> FsResult<usize> {
        self.scheduler
            .run("write", OpClass::Interactive, ctx, async {
                let handle = self.handles.get(fh)?;
                if !self.is_writable(handle.node()).await {
                    return Err(FsError::ReadOnlySection);
                }
                if !handle.flags().write {
                    return Err(FsError::BadHandle);
                }
                let file = handle.file()?;

                let mut state = handle.node().write().await;
                let mut io = file.lock().await;
                let offset = if handle.flags().append {
                    io.size().await?
                } else {
                    offset
                };
                self.check_file_size(offset.saturating_add(data.len() as u64))?;
                let written = io.write(data, offset).await?;
                drop(io);

                let end = offset + written as u64;
                if end > state.metadata.size {
                    state.metadata.size = end;
                }
                touch_modified(&mut state.metadata);
                drop(state);

                handle.mark_dirty();
                self.registry.invalidate(handle.node().path());
                tracing::trace!(fh = fh.0, offset, written, "write");
                Ok(written)
            })
            .await
    }

    /// Repositions the handle cursor and returns the new absolute offset.
    pub async fn lseek(
        &self,
        ctx: &OpContext,
        fh: HandleId,
        offset: i64,
        whence: Whence,
    ) -> FsResult<u64> {
        self.scheduler
            .run("lseek", OpClass::Interactive, ctx, async {
                let handle = self.handles.lookup(fh, IoKind::File)?;
                let _node = handle.node().read().await;
                let pos = handle.file()?.lock().await.seek(offset, whence).await?;
                Ok(pos)
            })
            .await
    }

    pub async fn release(&self, ctx: &OpContext, fh: HandleId) -> FsResult<()> {
        self.scheduler
            .run("release", OpClass::Interactive, ctx, async {
                let handle = self.handles.lookup(fh, IoKind::File)?;
                let path = handle.node().path().to_string();
                drop(handle);
                self.handles.release(fh, &self.registry).await?;
                tracing::debug!(path, fh = fh.0, "released file");
                Ok(())
            })
            .await
    }

    /// Flushes buffered writes of a handle to its backend.
    pub async fn fsync(&self, ctx: &OpContext, fh: HandleId, data_only: bool) -> FsResult<()> {
        self.scheduler
            .run("fsync", OpClass::Interactive, ctx, async {
                let handle = self.handles.get(fh)?;
                self.sync_handle(&handle, data_only).await
            })
            .await
    }

    /// Close-time flush; same as a data-only fsync.
    pub async fn flush(&self, ctx: &OpContext, fh: HandleId) -> FsResult<()> {
        self.scheduler
            .run("flush", OpClass::Interactive, ctx, async {
                let handle = self.handles.get(fh)?;
                self.sync_handle(&handle, true).await
            })
            .await
    }

    fn check_file_size(&self, size: u64) -> FsResult<()> {
        if size > self.config.limits.max_file_size {
            tracing::debug!(size, max = self.config.limits.max_file_size, "file too large");
            return Err(FsError::FileTooLarge);
        }
        Ok(())
    }

    /// Handles without write access have nothing to flush.
    async fn sync_handle(&self, handle: &OpenHandle, data_only: bool) -> FsResult<()> {
        let Ok(file) = handle.file() else {
            return Ok(());
        };
        if !handle.flags().write {
            return Ok(());
        }
        let _node = handle.node().write().await;
        file.lock().await.sync().await?;
        handle.mark_clean();
        tracing::trace!(fh = handle.id().0, data_only, "synced");
        Ok(())
    }

    /// Sets the size of a file, through `fh` when it is a valid file handle
    /// and through a short-lived IO otherwise.
    pub async fn truncate(
        &self,
        ctx: &OpContext,
        path: &str,
        size: u64,
        fh: Option<HandleId>,
    ) -> FsResult<Metadata> {
        self.scheduler
            .run("truncate", OpClass::Interactive, ctx, async {
                self.check_file_size(size)?;
                let handle = fh.and_then(|fh| self.handles.lookup(fh, IoKind::File).ok());
                if let Some(handle) = handle {
                    let node = handle.node();
                    if !self.is_writable(node).await {
                        return Err(FsError::ReadOnlySection);
                    }
                    if !handle.flags().write {
                        return Err(FsError::BadHandle);
                    }
                    let mut state = node.write().await;
                    handle.file()?.lock().await.truncate(size).await?;
                    state.metadata.size = size;
                    touch_modified(&mut state.metadata);
                    drop(state);
                    handle.mark_dirty();
                    self.registry.invalidate(node.path());
                    return self.node_attrs(node, ctx).await;
                }

                let node = self.registry.lookup(path).await?;
                if !self.is_writable(&node).await {
                    return Err(FsError::ReadOnlySection);
                }
                let target = node.read().await.target()?.clone();
                let mut io = self.file_io(&target, true).await?;
                let mut state = node.write().await;
                io.truncate(size).await?;
                io.sync().await?;
                io.close().await?;
                state.metadata.size = size;
                touch_modified(&mut state.metadata);
                drop(state);
                self.registry.invalidate(path);
                tracing::debug!(path, size, "truncated");
                self.node_attrs(&node, ctx).await
            })
            .await
    }
}

fn touch_modified(metadata: &mut Metadata) {
    if metadata.is_initialized() {
        let now = SystemTime::now();
        metadata.times.mtime = now;
        metadata.times.ctime = now;
    }
}
