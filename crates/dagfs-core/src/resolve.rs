// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Backend probing: what a classified path currently points at

use crate::backend::{Backends, DagStat, MutableTree, NameTarget, ResolveOptions, TreeNode};
use crate::error::{FsError, FsResult};
use crate::names::{KeyRoot, KeyValue, NameRootIndex, Owned};
use crate::path::PathKind;
use crate::types::{Cid, FileKind};
use std::sync::Arc;

/// Backend object a registered node is bound to.
#[derive(Clone)]
pub enum Target {
    /// Directory that exists by construction (mount and namespace roots).
    Synthetic,
    /// Node of the immutable DAG at `path` (`/<cid>/...`).
    Dag {
        path: String,
        cid: Cid,
        stat: DagStat,
    },
    /// Node of a mutable tree; `key` is set for trees owned by a named key.
    Tree {
        tree: Arc<dyn MutableTree>,
        path: String,
        node: TreeNode,
        key: Option<Arc<KeyRoot>>,
    },
    /// Owned named key whose value is a single file.
    KeyFile { root: Arc<KeyRoot> },
    /// Symlink synthesized by the name layer.
    Link { target: String },
}

impl Target {
    pub fn is_writable(&self) -> bool {
        matches!(self, Target::Tree { .. } | Target::KeyFile { .. })
    }

    pub fn key_root(&self) -> Option<&Arc<KeyRoot>> {
        match self {
            Target::Tree { key, .. } => key.as_ref(),
            Target::KeyFile { root } => Some(root),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Synthetic => f.write_str("Synthetic"),
            Target::Dag { path, .. } => f.debug_struct("Dag").field("path", path).finish(),
            Target::Tree { path, node, .. } => {
                f.debug_struct("Tree").field("path", path).field("node", node).finish()
            }
            Target::KeyFile { root } => {
                f.debug_struct("KeyFile").field("key", &root.key().id).finish()
            }
            Target::Link { target } => f.debug_struct("Link").field("target", target).finish(),
        }
    }
}

/// Outcome of a successful probe.
#[derive(Clone, Debug)]
pub struct Resolved {
    pub target: Target,
    pub kind: FileKind,
    pub size: u64,
}

impl Resolved {
    pub fn synthetic() -> Self {
        Self {
            target: Target::Synthetic,
            kind: FileKind::Directory,
            size: 0,
        }
    }

    pub fn link(target: String) -> Self {
        Self {
            size: target.len() as u64,
            kind: FileKind::Symlink,
            target: Target::Link { target },
        }
    }
}

pub struct Resolver {
    backends: Backends,
    names: Arc<NameRootIndex>,
    max_depth: u32,
    /// Prefix foreign names are symlinked under, e.g. `/mnt/dagfs/immutable`.
    link_prefix: String,
}

impl Resolver {
    pub fn new(
        backends: Backends,
        names: Arc<NameRootIndex>,
        max_depth: u32,
        link_prefix: String,
    ) -> Self {
        Self {
            backends,
            names,
            max_depth,
            link_prefix,
        }
    }

    pub async fn probe(&self, kind: &PathKind) -> FsResult<Resolved> {
        match kind {
            PathKind::MountRoot | PathKind::ImmutableRoot | PathKind::NamedRoot => {
                Ok(Resolved::synthetic())
            }
            PathKind::MutableRoot => self.tree_node(self.backends.files.clone(), "", None).await,
            PathKind::MutableNode { rest } => {
                self.tree_node(self.backends.files.clone(), rest, None).await
            }
            PathKind::ImmutableNode { addr, rest } => self.dag_node(format!("/{addr}{rest}")).await,
            PathKind::NamedKey { key } => match self.names.owned(key) {
                Some(Owned::Id(key)) => {
                    let root = self.names.root_for(&key).await?;
                    self.key_node(root, "").await
                }
                Some(Owned::Alias(key)) => Ok(Resolved::link(key.id)),
                None => {
                    let cid = self.resolve_name(key).await?;
                    Ok(Resolved::link(format!("{}/{cid}", self.link_prefix)))
                }
            },
            PathKind::NamedNode { key, rest } => match self.names.owned(key) {
                Some(Owned::Id(key)) | Some(Owned::Alias(key)) => {
                    let root = self.names.root_for(&key).await?;
                    self.key_node(root, rest).await
                }
                None => {
                    let cid = self.resolve_name(key).await?;
                    self.dag_node(format!("/{cid}{rest}")).await
                }
            },
        }
    }

    /// Content address a named path currently points at, with the sub-path
    /// below it. Owned keys are looked up by id.
    pub async fn reference(&self, kind: &PathKind) -> FsResult<(Cid, String)> {
        let (name, rest) = match kind {
            PathKind::NamedKey { key } => (key, ""),
            PathKind::NamedNode { key, rest } => (key, rest.as_str()),
            _ => return Err(FsError::InvalidArgument),
        };
        let record = match self.names.owned(name) {
            Some(Owned::Id(key)) | Some(Owned::Alias(key)) => key.id,
            None => name.clone(),
        };
        Ok((self.resolve_name(&record).await?, rest.to_string()))
    }

    /// Follows name records one hop at a time until content is reached.
    pub async fn resolve_name(&self, name: &str) -> FsResult<Cid> {
        let opts = ResolveOptions { recursive: false };
        let mut current = name.to_string();
        for _ in 0..=self.max_depth {
            match self.backends.names.resolve(&current, &opts).await? {
                NameTarget::Content(cid) => return Ok(cid),
                NameTarget::Name(next) => current = next,
            }
        }
        tracing::warn!(name, depth = self.max_depth, "name indirection chain too deep");
        Err(FsError::RecursionLimit)
    }

    async fn key_node(&self, root: Arc<KeyRoot>, rest: &str) -> FsResult<Resolved> {
        match root.value() {
            KeyValue::Tree(tree) => self.tree_node(tree.clone(), rest, Some(root.clone())).await,
            KeyValue::File(modifier) => {
                if !rest.is_empty() {
                    return Err(FsError::NotADirectory);
                }
                let size = modifier.lock().await.size().await?;
                Ok(Resolved {
                    target: Target::KeyFile { root },
                    kind: FileKind::File,
                    size,
                })
            }
        }
    }

    async fn tree_node(
        &self,
        tree: Arc<dyn MutableTree>,
        path: &str,
        key: Option<Arc<KeyRoot>>,
    ) -> FsResult<Resolved> {
        let node = tree.lookup(path).await?;
        let size = match &node {
            TreeNode::Directory => 0,
            TreeNode::File(file) => file.size().await?,
            TreeNode::Symlink(target) => target.len() as u64,
        };
        Ok(Resolved {
            kind: node.kind(),
            size,
            target: Target::Tree {
                tree,
                path: path.to_string(),
                node,
                key,
            },
        })
    }

    async fn dag_node(&self, path: String) -> FsResult<Resolved> {
        let cid = self.backends.dag.resolve(&path).await?;
        let stat = self.backends.dag.stat(&path).await?;
        Ok(Resolved {
            kind: stat.kind,
            size: stat.size,
            target: Target::Dag { path, cid, stat },
        })
    }
}
