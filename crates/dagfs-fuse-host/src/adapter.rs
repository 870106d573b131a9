// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! DagFS FUSE adapter implementation
//!
//! Maps FUSE requests onto [`MountContext`] operations. Every request runs
//! as a task on the tokio runtime and replies from there, so a slow backend
//! never blocks the session thread.

#[cfg(not(all(feature = "fuse", target_os = "linux")))]
compile_error!("This module requires the 'fuse' feature on Linux");

use crate::inodes::InodeTable;
use dagfs_core::{
    FileKind, FsConfig, FsError, FsResult, HandleId, Metadata, MountContext, MountOptions,
    OpContext, OpenFlags, Whence,
};
use fuser::{
    FileAttr, FileType, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyDirectoryPlus,
    ReplyEmpty, ReplyEntry, ReplyLseek, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr, Request,
    TimeOrNow,
};
use libc::{c_int, EINVAL, ENOENT, ERANGE};
use std::ffi::OsStr;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// DagFS FUSE filesystem adapter
pub struct DagFsFuse {
    fs: Arc<MountContext>,
    runtime: Handle,
    inodes: Arc<Mutex<InodeTable>>,
    /// Parent of every per-request cancellation token.
    shutdown: CancellationToken,
    attr_ttl: Duration,
    entry_ttl: Duration,
    readdirplus: bool,
}

impl DagFsFuse {
    pub fn new(fs: Arc<MountContext>, runtime: Handle, shutdown: CancellationToken) -> Self {
        let cache = &fs.config().cache;
        let attr_ttl = cache.attr_ttl();
        let entry_ttl = cache.entry_ttl();
        let readdirplus = fs.config().mount.readdirplus;
        Self {
            fs,
            runtime,
            inodes: Arc::new(Mutex::new(InodeTable::new())),
            shutdown,
            attr_ttl,
            entry_ttl,
            readdirplus,
        }
    }

    fn context(&self, req: &Request<'_>) -> OpContext {
        OpContext::new(req.uid(), req.gid(), req.pid()).with_cancel(self.shutdown.child_token())
    }

    /// Path currently naming `ino`.
    fn path(&self, ino: u64) -> Result<String, c_int> {
        let inodes = self.inodes.lock().unwrap();
        if !inodes.is_linked(ino) {
            return Err(ENOENT);
        }
        inodes.path(ino).map(str::to_string).ok_or(ENOENT)
    }

    /// Like [`Self::path`], but an unlinked inode is still reachable when
    /// the request carries a handle, which the core prefers over the path.
    fn handle_path(&self, ino: u64, fh: Option<u64>) -> Result<String, c_int> {
        if fh.is_none() {
            return self.path(ino);
        }
        self.inodes.lock().unwrap().path(ino).map(str::to_string).ok_or(ENOENT)
    }

    fn child(&self, parent: u64, name: &OsStr) -> Result<String, c_int> {
        let name = name.to_str().ok_or(EINVAL)?;
        let inodes = self.inodes.lock().unwrap();
        if !inodes.is_linked(parent) {
            return Err(ENOENT);
        }
        inodes.child_path(parent, name).ok_or(ENOENT)
    }

    fn spawn<F>(&self, op: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(op);
    }

    /// Replies to an entry-creating request with the new node's attributes.
    fn reply_entry<F>(&self, path: String, reply: ReplyEntry, op: F)
    where
        F: Future<Output = FsResult<Metadata>> + Send + 'static,
    {
        let inodes = self.inodes.clone();
        let ttl = self.entry_ttl;
        self.spawn(async move {
            match op.await {
                Ok(attrs) => {
                    let ino = inodes.lock().unwrap().lookup(&path);
                    reply.entry(&ttl, &file_attr(&attrs, ino), 0);
                }
                Err(err) => reply.error(err.errno()),
            }
        });
    }

    fn reply_empty<F>(&self, reply: ReplyEmpty, op: F)
    where
        F: Future<Output = FsResult<()>> + Send + 'static,
    {
        self.spawn(async move {
            match op.await {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err.errno()),
            }
        });
    }
}

fn file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::File => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
    }
}

fn file_attr(attrs: &Metadata, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: attrs.size,
        blocks: attrs.blocks(),
        atime: attrs.times.atime,
        mtime: attrs.times.mtime,
        ctime: attrs.times.ctime,
        crtime: attrs.times.birthtime,
        kind: file_type(attrs.kind),
        perm: (attrs.mode & 0o7777) as u16,
        nlink: attrs.nlink,
        uid: attrs.uid,
        gid: attrs.gid,
        rdev: 0,
        blksize: attrs.blksize,
        flags: 0,
    }
}

fn system_time(time: Option<TimeOrNow>) -> Option<SystemTime> {
    time.map(|t| match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    })
}

fn whence(raw: i32) -> FsResult<Whence> {
    match raw {
        libc::SEEK_SET => Ok(Whence::Start),
        libc::SEEK_CUR => Ok(Whence::Current),
        libc::SEEK_END => Ok(Whence::End),
        _ => Err(FsError::InvalidArgument),
    }
}

fn offset(raw: i64) -> FsResult<u64> {
    u64::try_from(raw).map_err(|_| FsError::InvalidArgument)
}

/// Answers an xattr query: the size alone when `size` is zero, otherwise
/// the data if it fits.
fn reply_xattr(reply: ReplyXattr, size: u32, value: FsResult<Vec<u8>>) {
    match value {
        Ok(value) if size == 0 => reply.size(value.len() as u32),
        Ok(value) if value.len() > size as usize => reply.error(ERANGE),
        Ok(value) => reply.data(&value),
        Err(err) => reply.error(err.errno()),
    }
}

macro_rules! try_reply {
    ($reply:expr, $value:expr) => {
        match $value {
            Ok(value) => value,
            Err(errno) => {
                $reply.error(errno);
                return;
            }
        }
    };
}

impl fuser::Filesystem for DagFsFuse {
    fn init(&mut self, _req: &Request<'_>, config: &mut fuser::KernelConfig) -> Result<(), c_int> {
        if self.readdirplus {
            if let Err(unsupported) = config.add_capabilities(fuser::consts::FUSE_DO_READDIRPLUS) {
                warn!(unsupported, "kernel does not support readdirplus");
                self.readdirplus = false;
            }
        }
        info!(
            attr_ttl_ms = self.attr_ttl.as_millis() as u64,
            entry_ttl_ms = self.entry_ttl.as_millis() as u64,
            readdirplus = self.readdirplus,
            "DagFS FUSE adapter initialized"
        );
        Ok(())
    }

    fn destroy(&mut self) {
        self.shutdown.cancel();
        let inodes = self.inodes.lock().unwrap().len();
        info!(inodes, "DagFS FUSE adapter destroyed");
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.inodes.lock().unwrap().forget(ino, nlookup);
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let parent_path = try_reply!(reply, self.path(parent));
        let path = try_reply!(reply, self.child(parent, name));
        let name = try_reply!(reply, name.to_str().ok_or(EINVAL)).to_string();
        let (fs, ctx) = (self.fs.clone(), self.context(req));
        self.reply_entry(path, reply, async move { fs.lookup(&ctx, &parent_path, &name).await });
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        let path = try_reply!(reply, self.handle_path(ino, fh));
        let (fs, ctx, ttl) = (self.fs.clone(), self.context(req), self.attr_ttl);
        self.spawn(async move {
            match fs.getattr(&ctx, &path, fh.map(HandleId)).await {
                Ok(attrs) => reply.attr(&ttl, &file_attr(&attrs, ino)),
                Err(err) => reply.error(err.errno()),
            }
        });
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        // Mode and ownership changes go by path, which no longer names an
        // unlinked inode.
        let path = if mode.is_some() || uid.is_some() || gid.is_some() {
            try_reply!(reply, self.path(ino))
        } else {
            try_reply!(reply, self.handle_path(ino, fh))
        };
        let (fs, ctx, ttl) = (self.fs.clone(), self.context(req), self.attr_ttl);
        let fh = fh.map(HandleId);
        let (atime, mtime) = (system_time(atime), system_time(mtime));
        self.spawn(async move {
            let result = async {
                if let Some(size) = size {
                    fs.truncate(&ctx, &path, size, fh).await?;
                }
                if let Some(mode) = mode {
                    fs.chmod(&ctx, &path, mode).await?;
                }
                if uid.is_some() || gid.is_some() {
                    fs.chown(&ctx, &path, uid, gid).await?;
                }
                if atime.is_some() || mtime.is_some() {
                    fs.utimens(&ctx, &path, atime, mtime, fh).await?;
                }
                fs.getattr(&ctx, &path, fh).await
            }
            .await;
            match result {
                Ok(attrs) => reply.attr(&ttl, &file_attr(&attrs, ino)),
                Err(err) => reply.error(err.errno()),
            }
        });
    }

    fn readlink(&mut self, req: &Request<'_>, ino: u64, reply: ReplyData) {
        let path = try_reply!(reply, self.path(ino));
        let (fs, ctx) = (self.fs.clone(), self.context(req));
        self.spawn(async move {
            match fs.readlink(&ctx, &path).await {
                Ok(target) => reply.data(target.as_bytes()),
                Err(err) => reply.error(err.errno()),
            }
        });
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let path = try_reply!(reply, self.child(parent, name));
        let (fs, ctx, target) = (self.fs.clone(), self.context(req), path.clone());
        self.reply_entry(path, reply, async move { fs.mknod(&ctx, &target, mode, rdev).await });
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let path = try_reply!(reply, self.child(parent, name));
        let (fs, ctx, target) = (self.fs.clone(), self.context(req), path.clone());
        self.reply_entry(path, reply, async move { fs.mkdir(&ctx, &target, mode).await });
    }

    fn unlink(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = try_reply!(reply, self.child(parent, name));
        let (fs, ctx, inodes) = (self.fs.clone(), self.context(req), self.inodes.clone());
        self.reply_empty(reply, async move {
            fs.unlink(&ctx, &path).await?;
            inodes.lock().unwrap().remove_path(&path);
            Ok(())
        });
    }

    fn rmdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = try_reply!(reply, self.child(parent, name));
        let (fs, ctx, inodes) = (self.fs.clone(), self.context(req), self.inodes.clone());
        self.reply_empty(reply, async move {
            fs.rmdir(&ctx, &path).await?;
            inodes.lock().unwrap().remove_path(&path);
            Ok(())
        });
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let path = try_reply!(reply, self.child(parent, link_name));
        let target = try_reply!(reply, target.to_str().ok_or(EINVAL)).to_string();
        let (fs, ctx, link) = (self.fs.clone(), self.context(req), path.clone());
        self.reply_entry(path, reply, async move { fs.symlink(&ctx, &target, &link).await });
    }

    fn rename(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        // RENAME_NOREPLACE and RENAME_EXCHANGE have no backend counterpart.
        if flags != 0 {
            reply.error(EINVAL);
            return;
        }
        let from = try_reply!(reply, self.child(parent, name));
        let to = try_reply!(reply, self.child(newparent, newname));
        let (fs, ctx, inodes) = (self.fs.clone(), self.context(req), self.inodes.clone());
        self.reply_empty(reply, async move {
            fs.rename(&ctx, &from, &to).await?;
            inodes.lock().unwrap().rename(&from, &to);
            Ok(())
        });
    }

    fn open(&mut self, req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let path = try_reply!(reply, self.path(ino));
        let (fs, ctx) = (self.fs.clone(), self.context(req));
        self.spawn(async move {
            match fs.open(&ctx, &path, OpenFlags::from_libc(flags)).await {
                Ok(fh) => reply.opened(fh.0, 0),
                Err(err) => reply.error(err.errno()),
            }
        });
    }

    fn read(
        &mut self,
        req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let (fs, ctx) = (self.fs.clone(), self.context(req));
        self.spawn(async move {
            let result = match self::offset(offset) {
                Ok(offset) => fs.read(&ctx, HandleId(fh), offset, size).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(data) => reply.data(&data),
                Err(err) => reply.error(err.errno()),
            }
        });
    }

    fn write(
        &mut self,
        req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let (fs, ctx, data) = (self.fs.clone(), self.context(req), data.to_vec());
        self.spawn(async move {
            let result = match self::offset(offset) {
                Ok(offset) => fs.write(&ctx, HandleId(fh), offset, &data).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(written) => reply.written(written as u32),
                Err(err) => reply.error(err.errno()),
            }
        });
    }

    fn lseek(
        &mut self,
        req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        whence: i32,
        reply: ReplyLseek,
    ) {
        let (fs, ctx) = (self.fs.clone(), self.context(req));
        self.spawn(async move {
            let result = match self::whence(whence) {
                Ok(whence) => fs.lseek(&ctx, HandleId(fh), offset, whence).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(pos) => reply.offset(pos as i64),
                Err(err) => reply.error(err.errno()),
            }
        });
    }

    fn flush(
        &mut self,
        req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        let (fs, ctx) = (self.fs.clone(), self.context(req));
        self.reply_empty(reply, async move { fs.flush(&ctx, HandleId(fh)).await });
    }

    fn release(
        &mut self,
        req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let (fs, ctx) = (self.fs.clone(), self.context(req));
        self.reply_empty(reply, async move { fs.release(&ctx, HandleId(fh)).await });
    }

    fn fsync(&mut self, req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let (fs, ctx) = (self.fs.clone(), self.context(req));
        self.reply_empty(reply, async move { fs.fsync(&ctx, HandleId(fh), datasync).await });
    }

    fn opendir(&mut self, req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let path = try_reply!(reply, self.path(ino));
        let (fs, ctx) = (self.fs.clone(), self.context(req));
        self.spawn(async move {
            match fs.opendir(&ctx, &path).await {
                Ok(fh) => reply.opened(fh.0, 0),
                Err(err) => reply.error(err.errno()),
            }
        });
    }

    fn readdir(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let path = try_reply!(reply, self.path(ino));
        let (fs, ctx, inodes) = (self.fs.clone(), self.context(req), self.inodes.clone());
        self.spawn(async move {
            let offset = match self::offset(offset) {
                Ok(offset) => offset,
                Err(err) => return reply.error(err.errno()),
            };
            let result = fs
                .readdir(&ctx, HandleId(fh), offset, |name, attrs, next| {
                    let child_ino = match name {
                        "." | ".." => ino,
                        _ => {
                            let mut inodes = inodes.lock().unwrap();
                            let child = inodes.child_path(ino, name).unwrap_or_else(|| {
                                format!("{}/{name}", path.trim_end_matches('/'))
                            });
                            inodes.get_or_alloc(&child)
                        }
                    };
                    !reply.add(child_ino, next as i64, file_type(attrs.kind), name)
                })
                .await;
            match result {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err.errno()),
            }
        });
    }

    fn readdirplus(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectoryPlus,
    ) {
        let path = try_reply!(reply, self.path(ino));
        let (fs, ctx, inodes) = (self.fs.clone(), self.context(req), self.inodes.clone());
        let ttl = self.entry_ttl;
        self.spawn(async move {
            let offset = match self::offset(offset) {
                Ok(offset) => offset,
                Err(err) => return reply.error(err.errno()),
            };
            let result = fs
                .readdir(&ctx, HandleId(fh), offset, |name, attrs, next| {
                    let (child_ino, counted) = match name {
                        "." | ".." => (ino, false),
                        _ => {
                            let mut inodes = inodes.lock().unwrap();
                            let child = inodes.child_path(ino, name).unwrap_or_else(|| {
                                format!("{}/{name}", path.trim_end_matches('/'))
                            });
                            (inodes.get_or_alloc(&child), true)
                        }
                    };
                    let attr = file_attr(attrs, child_ino);
                    let full = reply.add(child_ino, next as i64, name, &ttl, &attr, 0);
                    // The kernel holds a lookup on every entry it was handed.
                    if !full && counted {
                        inodes.lock().unwrap().add_lookup(child_ino);
                    }
                    !full
                })
                .await;
            match result {
                Ok(()) => reply.ok(),
                Err(err) => reply.error(err.errno()),
            }
        });
    }

    fn releasedir(
        &mut self,
        req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        let (fs, ctx) = (self.fs.clone(), self.context(req));
        self.reply_empty(reply, async move { fs.releasedir(&ctx, HandleId(fh)).await });
    }

    fn fsyncdir(
        &mut self,
        req: &Request<'_>,
        _ino: u64,
        fh: u64,
        datasync: bool,
        reply: ReplyEmpty,
    ) {
        let (fs, ctx) = (self.fs.clone(), self.context(req));
        self.reply_empty(reply, async move { fs.fsyncdir(&ctx, HandleId(fh), datasync).await });
    }

    fn statfs(&mut self, req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let path = try_reply!(reply, self.path(ino));
        let (fs, ctx) = (self.fs.clone(), self.context(req));
        self.spawn(async move {
            match fs.statfs(&ctx, &path).await {
                Ok(stat) => reply.statfs(
                    stat.blocks,
                    stat.blocks_free,
                    stat.blocks_available,
                    stat.files,
                    stat.files_free,
                    stat.block_size,
                    stat.name_max,
                    stat.fragment_size,
                ),
                Err(err) => reply.error(err.errno()),
            }
        });
    }

    fn setxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let path = try_reply!(reply, self.path(ino));
        let name = try_reply!(reply, name.to_str().ok_or(EINVAL)).to_string();
        let (fs, ctx, value) = (self.fs.clone(), self.context(req), value.to_vec());
        self.reply_empty(reply, async move {
            fs.setxattr(&ctx, &path, &name, &value, flags).await
        });
    }

    fn getxattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let path = try_reply!(reply, self.path(ino));
        let name = try_reply!(reply, name.to_str().ok_or(EINVAL)).to_string();
        let (fs, ctx) = (self.fs.clone(), self.context(req));
        self.spawn(async move {
            let value = fs.getxattr(&ctx, &path, &name, size).await;
            reply_xattr(reply, size, value);
        });
    }

    fn listxattr(&mut self, req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let path = try_reply!(reply, self.path(ino));
        let (fs, ctx) = (self.fs.clone(), self.context(req));
        self.spawn(async move {
            let value = fs.listxattr(&ctx, &path, size).await;
            reply_xattr(reply, size, value);
        });
    }

    fn removexattr(&mut self, req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let path = try_reply!(reply, self.path(ino));
        let name = try_reply!(reply, name.to_str().ok_or(EINVAL)).to_string();
        let (fs, ctx) = (self.fs.clone(), self.context(req));
        self.reply_empty(reply, async move { fs.removexattr(&ctx, &path, &name).await });
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let path = try_reply!(reply, self.child(parent, name));
        let (fs, ctx, inodes) = (self.fs.clone(), self.context(req), self.inodes.clone());
        let ttl = self.entry_ttl;
        self.spawn(async move {
            let result = create_and_stat(&fs, &ctx, &path, OpenFlags::from_libc(flags), mode).await;
            match result {
                Ok((fh, attrs)) => {
                    let ino = inodes.lock().unwrap().lookup(&path);
                    debug!(path = %path, ino, fh = fh.0, "created");
                    reply.created(&ttl, &file_attr(&attrs, ino), 0, fh.0, 0);
                }
                Err(err) => reply.error(err.errno()),
            }
        });
    }
}

/// Creates `path` and reads back its attributes. The handle is released
/// again when the attributes cannot be read, so a failed reply leaks nothing.
async fn create_and_stat(
    fs: &MountContext,
    ctx: &OpContext,
    path: &str,
    flags: OpenFlags,
    mode: u32,
) -> FsResult<(HandleId, Metadata)> {
    let fh = fs.create(ctx, path, flags, mode).await?;
    match fs.getattr(ctx, path, Some(fh)).await {
        Ok(attrs) => Ok((fh, attrs)),
        Err(err) => {
            if let Err(release) = fs.release(ctx, fh).await {
                warn!(path, fh = fh.0, %release, "release after failed create");
            }
            Err(err)
        }
    }
}

/// Builds the adapter for a mount whose core has already been started.
pub fn build(
    config: &FsConfig,
    fs: Arc<MountContext>,
    runtime: Handle,
    shutdown: CancellationToken,
) -> (DagFsFuse, Vec<fuser::MountOption>) {
    (DagFsFuse::new(fs, runtime, shutdown), mount_options(&config.mount))
}

fn mount_options(mount: &MountOptions) -> Vec<fuser::MountOption> {
    if let Some(label) = &mount.volume_label {
        warn!(label = %label, "volume labels are not supported by FUSE on Linux, ignoring");
    }
    let mut options = vec![
        fuser::MountOption::FSName(mount.fs_name.clone()),
        fuser::MountOption::Subtype("dagfs".to_string()),
        fuser::MountOption::NoSuid,
        fuser::MountOption::NoDev,
    ];
    if mount.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }
    if mount.allow_root {
        options.push(fuser::MountOption::AllowRoot);
    }
    options
}
