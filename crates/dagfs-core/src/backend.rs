// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Collaborator contracts consumed by the core.
//!
//! The DAG store, the name publisher/resolver, the key store and the mutable
//! file-tree engine live outside this crate. The core reaches them only
//! through the traits in this module; [`crate::memory`] provides in-process
//! implementations.

use crate::error::FsResult;
use crate::types::{Cid, FileKind};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// A node of the content-addressed DAG.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DagNode {
    File { data: Vec<u8> },
    Directory { links: BTreeMap<String, Cid> },
    Symlink { target: String },
}

impl DagNode {
    pub fn kind(&self) -> FileKind {
        match self {
            DagNode::File { .. } => FileKind::File,
            DagNode::Directory { .. } => FileKind::Directory,
            DagNode::Symlink { .. } => FileKind::Symlink,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            DagNode::File { data } => data.len() as u64,
            DagNode::Directory { .. } => 0,
            DagNode::Symlink { target } => target.len() as u64,
        }
    }
}

/// Pre-enumeration stat of a DAG node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DagStat {
    pub kind: FileKind,
    pub size: u64,
    /// Number of child links, when the backend knows it up front.
    pub num_links: Option<u64>,
}

/// One child link reported while enumerating a DAG directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkResult {
    pub name: String,
    pub cid: Cid,
    pub kind: FileKind,
    pub size: u64,
}

/// Streaming reader over a DAG file.
#[async_trait]
pub trait DagReader: Send + Sync {
    fn size(&self) -> u64;

    /// Moves the cursor. Positions past the end are allowed.
    async fn seek(&mut self, pos: u64) -> FsResult<u64>;

    /// Reads from the cursor; zero bytes at or past the end.
    async fn read(&mut self, buf: &mut [u8]) -> FsResult<usize>;
}

/// Content-addressed DAG. Paths have the form `/<cid>/child/...`.
#[async_trait]
pub trait DagService: Send + Sync {
    async fn resolve(&self, path: &str) -> FsResult<Cid>;

    async fn get(&self, cid: &Cid) -> FsResult<DagNode>;

    async fn stat(&self, path: &str) -> FsResult<DagStat>;

    async fn fetch_file(&self, path: &str) -> FsResult<Box<dyn DagReader>>;

    async fn list(&self, path: &str) -> FsResult<BoxStream<'static, FsResult<LinkResult>>>;

    async fn put(&self, node: DagNode) -> FsResult<Cid>;
}

/// Value a name record points at.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NameTarget {
    Content(Cid),
    Name(String),
}

#[derive(Clone, Debug, Default)]
pub struct ResolveOptions {
    /// Follow name-to-name records until content is reached.
    pub recursive: bool,
}

#[derive(Clone, Debug, Default)]
pub struct PublishOptions {
    pub ttl: Option<Duration>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NameService: Send + Sync {
    async fn resolve(&self, name: &str, opts: &ResolveOptions) -> FsResult<NameTarget>;

    async fn publish(&self, key: &Key, root: &Cid, opts: &PublishOptions) -> FsResult<()>;
}

/// A locally owned signing key. `id` is the name the key publishes under;
/// `name` is the local alias.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Key {
    pub name: String,
    pub id: String,
}

#[async_trait]
pub trait KeyService: Send + Sync {
    async fn list(&self) -> FsResult<Vec<Key>>;

    async fn remove(&self, name: &str) -> FsResult<Key>;

    async fn self_key(&self) -> FsResult<Key>;
}

/// Node found in a mutable tree. Files keep their identity across moves.
#[derive(Clone)]
pub enum TreeNode {
    Directory,
    File(Arc<dyn TreeFile>),
    Symlink(String),
}

impl TreeNode {
    pub fn kind(&self) -> FileKind {
        match self {
            TreeNode::Directory => FileKind::Directory,
            TreeNode::File(_) => FileKind::File,
            TreeNode::Symlink(_) => FileKind::Symlink,
        }
    }
}

impl std::fmt::Debug for TreeNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TreeNode::Directory => f.write_str("Directory"),
            TreeNode::File(_) => f.write_str("File"),
            TreeNode::Symlink(target) => f.debug_tuple("Symlink").field(target).finish(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub kind: FileKind,
    pub size: u64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FdFlags {
    pub read: bool,
    pub write: bool,
}

/// Writable file tree layered over the DAG. Paths are tree-relative
/// (`/a/b`); the empty string and `/` both denote the tree root.
#[async_trait]
pub trait MutableTree: Send + Sync {
    async fn lookup(&self, path: &str) -> FsResult<TreeNode>;

    async fn list(&self, path: &str) -> FsResult<Vec<TreeEntry>>;

    async fn mkdir(&self, path: &str) -> FsResult<()>;

    async fn create(&self, path: &str) -> FsResult<Arc<dyn TreeFile>>;

    async fn symlink(&self, path: &str, target: &str) -> FsResult<()>;

    /// Removes a file or symlink.
    async fn unlink(&self, path: &str) -> FsResult<()>;

    async fn rmdir(&self, path: &str) -> FsResult<()>;

    async fn mv(&self, from: &str, to: &str) -> FsResult<()>;

    /// Commits pending changes under `path` into the DAG.
    async fn flush(&self, path: &str) -> FsResult<Cid>;
}

/// A file inside a mutable tree.
#[async_trait]
pub trait TreeFile: Send + Sync {
    /// Opens a descriptor. Write descriptors are exclusive: a second writer
    /// waits until the first one is closed.
    async fn open(&self, flags: FdFlags) -> FsResult<Box<dyn TreeFd>>;

    async fn size(&self) -> FsResult<u64>;

    async fn flush(&self) -> FsResult<Cid>;
}

#[async_trait]
pub trait TreeFd: Send + Sync {
    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> FsResult<usize>;

    /// Writes past the end zero-fill the gap.
    async fn write_at(&mut self, buf: &[u8], offset: u64) -> FsResult<usize>;

    async fn truncate(&mut self, size: u64) -> FsResult<()>;

    async fn size(&self) -> FsResult<u64>;

    async fn flush(&mut self) -> FsResult<()>;

    async fn close(self: Box<Self>) -> FsResult<()>;
}

#[async_trait]
pub trait MutableTreeFactory: Send + Sync {
    /// Loads a tree rooted at `root`, or an empty directory tree for `None`.
    async fn load(&self, root: Option<Cid>) -> FsResult<Arc<dyn MutableTree>>;
}

/// Bundle of collaborators a mount is built from.
#[derive(Clone)]
pub struct Backends {
    pub dag: Arc<dyn DagService>,
    pub names: Arc<dyn NameService>,
    pub keys: Arc<dyn KeyService>,
    /// Tree projected under the mutable root.
    pub files: Arc<dyn MutableTree>,
    /// Loader for per-key trees in the named namespace.
    pub trees: Arc<dyn MutableTreeFactory>,
}
