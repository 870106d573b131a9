// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Attribute synthesis from namespace rules

use crate::config::MountOptions;
use crate::path::PathKind;
use crate::resolve::Target;
use crate::types::{FileKind, FileTimes, Metadata, OpContext};
use std::time::SystemTime;

/// Write policy a node's attributes advertise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// Immutable namespace and the synthetic roots above it.
    Immutable,
    /// Named content reached through a key we do not own.
    ReadOnly,
    /// Owned named keys and the mutable tree.
    Writable,
}

impl Access {
    pub fn of(kind: &PathKind, target: &Target) -> Self {
        match kind {
            PathKind::MountRoot
            | PathKind::ImmutableRoot
            | PathKind::NamedRoot
            | PathKind::ImmutableNode { .. } => Access::Immutable,
            PathKind::MutableRoot | PathKind::MutableNode { .. } => Access::Writable,
            PathKind::NamedKey { .. } | PathKind::NamedNode { .. } => {
                if target.is_writable() {
                    Access::Writable
                } else {
                    Access::ReadOnly
                }
            }
        }
    }

    pub fn mode(self, kind: FileKind) -> u32 {
        match (self, kind) {
            (_, FileKind::Symlink) => 0o777,
            (Access::Immutable, _) => 0o555,
            (Access::ReadOnly, FileKind::Directory) => 0o555,
            (Access::ReadOnly, FileKind::File) => 0o444,
            (Access::Writable, FileKind::Directory) => 0o755,
            (Access::Writable, FileKind::File) => 0o644,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AttrPolicy {
    mount_time: SystemTime,
    uid_override: Option<u32>,
    gid_override: Option<u32>,
}

impl AttrPolicy {
    pub fn new(mount: &MountOptions) -> Self {
        Self {
            mount_time: SystemTime::now(),
            uid_override: mount.uid_override,
            gid_override: mount.gid_override,
        }
    }

    pub fn mount_time(&self) -> SystemTime {
        self.mount_time
    }

    /// Fills uninitialized metadata in place. Initialized metadata keeps its
    /// mode and timestamps; only the size tracks the backend.
    pub fn initialize(&self, metadata: &mut Metadata, kind: &PathKind, target: &Target) {
        if metadata.is_initialized() {
            return;
        }
        let stamp = if kind.is_synthetic_root() {
            self.mount_time
        } else {
            SystemTime::now()
        };
        metadata.mode = Access::of(kind, target).mode(metadata.kind);
        metadata.times = FileTimes::at(stamp);
        metadata.nlink = if metadata.is_dir() { 2 } else { 1 };
    }

    /// Attributes as reported to a caller.
    pub fn stamp(&self, metadata: &Metadata, ctx: &OpContext) -> Metadata {
        let mut out = *metadata;
        out.uid = self.uid_override.unwrap_or(ctx.uid);
        out.gid = self.gid_override.unwrap_or(ctx.gid);
        out
    }

    /// Attributes for a directory entry that has no registered node.
    pub fn listing(&self, kind: FileKind, size: u64, access: Access, ctx: &OpContext) -> Metadata {
        let mut metadata = Metadata::uninitialized(kind);
        metadata.size = size;
        metadata.mode = access.mode(kind);
        metadata.times = FileTimes::at(SystemTime::now());
        metadata.nlink = if kind == FileKind::Directory { 2 } else { 1 };
        self.stamp(&metadata, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modes_follow_namespace() {
        let immutable = PathKind::ImmutableNode {
            addr: "x".into(),
            rest: String::new(),
        };
        let access = Access::of(&immutable, &Target::Synthetic);
        assert_eq!(access, Access::Immutable);
        assert_eq!(access.mode(FileKind::File), 0o555);

        let mutable = PathKind::MutableNode { rest: "/a".into() };
        let access = Access::of(&mutable, &Target::Synthetic);
        assert_eq!(access.mode(FileKind::Directory), 0o755);
        assert_eq!(access.mode(FileKind::File), 0o644);
        assert_eq!(access.mode(FileKind::Symlink), 0o777);

        let foreign = PathKind::NamedNode {
            key: "k".into(),
            rest: "/f".into(),
        };
        let access = Access::of(&foreign, &Target::Synthetic);
        assert_eq!(access, Access::ReadOnly);
        assert_eq!(access.mode(FileKind::File), 0o444);
    }

    #[test]
    fn roots_are_stamped_with_mount_time() {
        let policy = AttrPolicy::new(&MountOptions::default());
        let mut metadata = Metadata::uninitialized(FileKind::Directory);
        policy.initialize(&mut metadata, &PathKind::MountRoot, &Target::Synthetic);
        assert!(metadata.is_initialized());
        assert_eq!(metadata.times.mtime, policy.mount_time());
        assert_eq!(metadata.nlink, 2);
    }

    #[test]
    fn overrides_win_over_caller_identity() {
        let options = MountOptions {
            uid_override: Some(7),
            ..MountOptions::default()
        };
        let policy = AttrPolicy::new(&options);
        let ctx = OpContext::new(1000, 1000, 1);
        let stamped = policy.stamp(&Metadata::uninitialized(FileKind::File), &ctx);
        assert_eq!(stamped.uid, 7);
        assert_eq!(stamped.gid, 1000);
    }
}
