// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for DagFS

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;

/// Content address of a DAG node (blake3 digest of its encoded form).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cid(pub [u8; 32]);

impl Cid {
    pub fn for_bytes(bytes: &[u8]) -> Self {
        Cid(*blake3::hash(bytes).as_bytes())
    }
}

impl std::fmt::Display for Cid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl std::str::FromStr for Cid {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 64 {
            return Err("Invalid length".to_string());
        }
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes).map_err(|e| format!("Invalid hex: {e}"))?;
        Ok(Cid(bytes))
    }
}

/// Opaque handle token handed to the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(pub u64);

impl HandleId {
    /// Reserved value meaning "no handle".
    pub const NONE: HandleId = HandleId(u64::MAX);

    pub fn is_none(self) -> bool {
        self == Self::NONE
    }

    /// Interprets a raw kernel handle, mapping the reserved value to `None`.
    pub fn from_raw(raw: u64) -> Option<HandleId> {
        let id = HandleId(raw);
        (!id.is_none()).then_some(id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileTimes {
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub birthtime: SystemTime,
}

impl FileTimes {
    pub fn at(t: SystemTime) -> Self {
        Self {
            atime: t,
            mtime: t,
            ctime: t,
            birthtime: t,
        }
    }
}

/// POSIX-like attributes of a node. `mode == 0` marks metadata that has not
/// been resolved yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub kind: FileKind,
    /// Permission bits only; the file type lives in `kind`.
    pub mode: u32,
    pub size: u64,
    pub times: FileTimes,
    pub blksize: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
}

pub const DEFAULT_BLKSIZE: u32 = 4096;

impl Metadata {
    pub fn uninitialized(kind: FileKind) -> Self {
        Self {
            kind,
            mode: 0,
            size: 0,
            times: FileTimes::at(SystemTime::UNIX_EPOCH),
            blksize: DEFAULT_BLKSIZE,
            nlink: 1,
            uid: 0,
            gid: 0,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.mode != 0
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        self.kind == FileKind::Symlink
    }

    /// Number of 512-byte blocks, as reported by stat(2).
    pub fn blocks(&self) -> u64 {
        self.size.div_ceil(512)
    }
}

/// Per-handle lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleState {
    OpenReadable,
    Dirty,
    Clean,
}

/// Open flags decoded from the kernel request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub exclusive: bool,
    pub truncate: bool,
    pub append: bool,
    pub nofollow: bool,
    pub directory: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            ..Self::default()
        }
    }

    pub fn from_libc(flags: i32) -> Self {
        let access = flags & libc::O_ACCMODE;
        Self {
            read: access == libc::O_RDONLY || access == libc::O_RDWR,
            write: access == libc::O_WRONLY || access == libc::O_RDWR,
            create: flags & libc::O_CREAT != 0,
            exclusive: flags & libc::O_EXCL != 0,
            truncate: flags & libc::O_TRUNC != 0,
            append: flags & libc::O_APPEND != 0,
            nofollow: flags & libc::O_NOFOLLOW != 0,
            directory: flags & libc::O_DIRECTORY != 0,
        }
    }

    pub fn with_create(mut self) -> Self {
        self.create = true;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

/// A directory entry with attributes computed at enumeration time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirItem {
    pub name: String,
    pub attrs: Metadata,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatFs {
    pub block_size: u32,
    pub fragment_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_available: u64,
    pub files: u64,
    pub files_free: u64,
    pub name_max: u32,
}

/// Caller context attached to every kernel request.
#[derive(Clone, Debug)]
pub struct OpContext {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub cancel: CancellationToken,
}

impl OpContext {
    pub fn new(uid: u32, gid: u32, pid: u32) -> Self {
        Self {
            uid,
            gid,
            pid,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_display_round_trips() {
        let cid = Cid::for_bytes(b"hello, world");
        let parsed: Cid = cid.to_string().parse().expect("parse cid");
        assert_eq!(cid, parsed);
        assert!("abc".parse::<Cid>().is_err());
    }

    #[test]
    fn reserved_handle_is_not_a_handle() {
        assert_eq!(HandleId::from_raw(u64::MAX), None);
        assert_eq!(HandleId::from_raw(7), Some(HandleId(7)));
    }

    #[test]
    fn open_flags_decode_access_mode() {
        let flags = OpenFlags::from_libc(libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL);
        assert!(!flags.read);
        assert!(flags.write);
        assert!(flags.create && flags.exclusive);
        let flags = OpenFlags::from_libc(libc::O_RDONLY | libc::O_NOFOLLOW);
        assert!(flags.read && !flags.write && flags.nofollow);
    }
}
