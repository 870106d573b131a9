// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! DagFS Core: a filesystem gateway over content-addressed storage.
//!
//! The crate projects three namespaces onto one mount: an immutable view of
//! the content-addressed DAG, a named view backed by published key records,
//! and a mutable file tree. Kernel-facing hosts drive a [`MountContext`]
//! which owns every piece of per-mount state.

pub mod attrs;
pub mod backend;
pub mod cache;
pub mod config;
pub mod dirstream;
pub mod error;
pub mod fault;
pub mod fileio;
pub mod handles;
pub mod maintainer;
pub mod memory;
pub mod names;
pub mod path;
pub mod registry;
pub mod resolve;
pub mod scheduler;
#[cfg(test)]
mod testing;
pub mod types;
pub mod vfs;

// Re-export key types
pub use backend::{
    Backends, DagNode, DagReader, DagService, DagStat, Key, KeyService, LinkResult, MutableTree,
    MutableTreeFactory, NameService, NameTarget, TreeFd, TreeFile, TreeNode,
};
pub use config::{
    CachePolicy, FsConfig, FsLimits, MountOptions, NamespaceRoots, PublishPolicy, TimeoutPolicy,
};
pub use error::{FsError, FsResult};
pub use path::{Namespace, PathClassifier, PathKind};
pub use types::{
    Cid, DirItem, FileKind, FileTimes, HandleId, HandleState, Metadata, OpContext, OpenFlags,
    StatFs, Whence,
};
pub use vfs::MountContext;
