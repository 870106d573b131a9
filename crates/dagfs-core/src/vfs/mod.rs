// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Mount context: the kernel-facing operations of one mount.
//!
//! Every operation takes the caller's [`OpContext`] and canonical mount
//! paths. Operations run through the [`Scheduler`], which applies the
//! registry lock, the deadline of the operation class and the caller's
//! cancellation token.

mod dirs;
mod files;
mod meta;
mod structure;

use crate::attrs::AttrPolicy;
use crate::backend::{Backends, DagNode, MutableTree, TreeNode};
use crate::cache::ResolutionCache;
use crate::config::FsConfig;
use crate::error::{FsError, FsResult};
use crate::fileio::{FileIo, ImmutableFile, MutableTreeFile, NamedFile};
use crate::handles::HandleTable;
use crate::maintainer::BackgroundMaintainer;
use crate::names::{KeyRoot, KeyValue, NameRootIndex};
use crate::path::{self, Namespace, PathClassifier, PathKind};
use crate::registry::{FsNode, NodeRegistry, NodeState};
use crate::resolve::{Resolved, Resolver, Target};
use crate::scheduler::{OpClass, Scheduler};
use crate::types::{FileKind, HandleId, HandleState, Metadata, OpContext, OpenFlags};
use std::sync::Arc;
use std::time::Duration;

/// All mutable state of one mount.
pub struct MountContext {
    config: FsConfig,
    backends: Backends,
    names: Arc<NameRootIndex>,
    registry: Arc<NodeRegistry>,
    handles: HandleTable,
    scheduler: Scheduler,
    maintainer: BackgroundMaintainer,
    attrs: AttrPolicy,
    /// Mount point as a string, used to rebase absolute symlink targets.
    mount_point: Option<String>,
}

/// Where a structural operation takes effect inside a mutable tree.
struct TreeSlot {
    tree: Arc<dyn MutableTree>,
    /// Path relative to the tree root, `""` or `/a/b`.
    rel: String,
    key: Option<Arc<KeyRoot>>,
}

/// Where following a path for `open` ended.
enum Followed {
    Node(Arc<FsNode>),
    /// Nothing exists at this path; only reported with `flags.create`.
    Missing(String),
}

impl TreeSlot {
    fn touch(&self) {
        if let Some(key) = &self.key {
            key.touch();
        }
    }

    fn same_tree(&self, other: &TreeSlot) -> bool {
        Arc::ptr_eq(&self.tree, &other.tree)
    }

    fn resolved(&self, node: TreeNode, kind: FileKind, size: u64) -> Resolved {
        Resolved {
            target: Target::Tree {
                tree: self.tree.clone(),
                path: self.rel.clone(),
                node,
                key: self.key.clone(),
            },
            kind,
            size,
        }
    }
}

impl MountContext {
    /// Builds the per-mount state. Invalid configuration, an unusable cache
    /// or an unreachable key service abort the mount.
    pub async fn new(config: FsConfig, backends: Backends) -> FsResult<Self> {
        config.validate()?;

        let record_ttl = Duration::from_millis(config.cache.named_ttl_ms);
        let names = match NameRootIndex::new(backends.clone(), config.publish.clone(), record_ttl)
            .await
        {
            Ok(names) => Arc::new(names),
            Err(err) => {
                tracing::error!(%err, "failed to list owned keys");
                return Err(err);
            }
        };
        let cache = Arc::new(ResolutionCache::new(config.cache.capacity)?);

        let classifier = PathClassifier::new(&config.roots);
        let mount_point = config
            .mount
            .mount_point
            .as_ref()
            .map(|p| p.to_string_lossy().trim_end_matches('/').to_string());
        let link_prefix = format!(
            "{}{}",
            mount_point.as_deref().unwrap_or(""),
            classifier.root_path(Namespace::Immutable)
        );
        let resolver = Arc::new(Resolver::new(
            backends.clone(),
            names.clone(),
            config.limits.max_link_depth,
            link_prefix,
        ));
        let registry = Arc::new(NodeRegistry::new(classifier, resolver, cache.clone()));
        let handles = HandleTable::new(config.limits.max_open_handles);
        let scheduler = Scheduler::new(registry.clone(), config.timeouts.clone());
        let maintainer = BackgroundMaintainer::spawn(registry.clone(), cache, &config.cache);
        let attrs = AttrPolicy::new(&config.mount);

        tracing::info!(
            mount_point = ?config.mount.mount_point,
            keys = names.keys().len(),
            cache_capacity = config.cache.capacity,
            max_open_handles = config.limits.max_open_handles,
            "mount context ready"
        );

        Ok(Self {
            config,
            backends,
            names,
            registry,
            handles,
            scheduler,
            maintainer,
            attrs,
            mount_point,
        })
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn open_handles(&self) -> u64 {
        self.handles.open_count()
    }

    /// Lifecycle state of an open handle.
    pub fn handle_state(&self, fh: HandleId) -> FsResult<HandleState> {
        Ok(self.handles.get(fh)?.state())
    }

    /// Mount path of the immutable node a named path currently points at.
    pub async fn resolve_reference(&self, ctx: &OpContext, path: &str) -> FsResult<String> {
        self.scheduler
            .run("resolve_reference", OpClass::Interactive, ctx, async {
                let node = self.registry.lookup(path).await?;
                let global = self.registry.resolve_reference(&node).await?;
                Ok(global.path().to_string())
            })
            .await
    }

    /// Tears the mount down: pending publishes and the mutable tree are
    /// flushed, every handle is closed and the registry is emptied.
    pub async fn shutdown(&self) -> FsResult<()> {
        self.maintainer.stop().await;

        let _exclusive = self.registry.gate().write().await;
        for id in self.handles.ids() {
            if let Err(err) = self.handles.release(id, &self.registry).await {
                tracing::warn!(fh = id.0, %err, "failed to close handle during teardown");
            }
        }
        self.names.shutdown().await;
        let flushed = self.backends.files.flush("").await;
        self.registry.clear();
        match flushed {
            Ok(root) => {
                tracing::info!(%root, "flushed mutable tree");
                Ok(())
            }
            Err(err) => {
                tracing::error!(%err, "failed to flush mutable tree");
                Err(err)
            }
        }
    }

    fn fetch_attempt(&self) -> Duration {
        Duration::from_millis((self.config.timeouts.interactive_ms / 2).max(1))
    }

    /// Attributes of a node, initializing them from namespace rules on
    /// first use.
    async fn node_attrs(&self, node: &FsNode, ctx: &OpContext) -> FsResult<Metadata> {
        let mut state = node.write().await;
        if !state.metadata.is_initialized() {
            let NodeState { metadata, target } = &mut *state;
            let target = target.as_ref().ok_or(FsError::NotInitialized)?;
            self.attrs.initialize(metadata, node.kind(), target);
        }
        Ok(self.attrs.stamp(&state.metadata, ctx))
    }

    /// Whether writes through `node` may succeed. Nodes that lost their
    /// target keep the answer of their namespace.
    async fn is_writable(&self, node: &FsNode) -> bool {
        node.is_mutable() && node.read().await.target.as_ref().map_or(true, Target::is_writable)
    }

    /// Looks `path` up and follows symlinks at the leaf.
    async fn open_node(&self, path: &str, flags: OpenFlags) -> FsResult<Arc<FsNode>> {
        match self.follow(path, flags).await? {
            Followed::Node(node) => Ok(node),
            Followed::Missing(_) => Err(FsError::NotFound),
        }
    }

    /// `open_node`, except that with `flags.create` a missing leaf is
    /// reported with the path it should be created at.
    async fn follow(&self, path: &str, flags: OpenFlags) -> FsResult<Followed> {
        let mut current = path.to_string();
        for _ in 0..=self.config.limits.max_link_depth {
            let node = match self.registry.lookup(&current).await {
                Ok(node) => node,
                Err(FsError::NotFound) if flags.create => return Ok(Followed::Missing(current)),
                Err(err) => return Err(err),
            };
            if flags.create && flags.exclusive {
                return Err(FsError::AlreadyExists);
            }
            let link = {
                let state = node.read().await;
                match state.metadata.kind {
                    FileKind::Symlink => Some(state.target()?.clone()),
                    _ => None,
                }
            };
            let Some(link) = link else {
                return Ok(Followed::Node(node));
            };
            if flags.nofollow {
                return Err(FsError::SymlinkLoop);
            }
            let target = self.link_target(&link).await?;
            current = path::follow_link(&current, &target, self.mount_point.as_deref());
        }
        tracing::warn!(
            path,
            depth = self.config.limits.max_link_depth,
            "too many levels of symbolic links"
        );
        Err(FsError::RecursionLimit)
    }

    /// Creates an empty file. Must be called without the registry lock held.
    async fn create_file(&self, path: &str) -> FsResult<Arc<FsNode>> {
        let slot = self.locate(path).await?;
        let _exclusive = self.registry.exclusive().await;
        let file = slot.tree.create(&slot.rel).await?;
        slot.touch();
        self.registry.invalidate(path);
        let node = self
            .registry
            .install_created(path, slot.resolved(TreeNode::File(file), FileKind::File, 0))
            .await?;
        tracing::debug!(path, "created file");
        Ok(node)
    }

    /// [`Self::slot`] under the shared registry lock. Structural ops resolve
    /// through this and take the exclusive lock only afterwards.
    async fn locate(&self, path: &str) -> FsResult<TreeSlot> {
        let _shared = self.registry.shared().await;
        self.slot(path).await
    }

    /// Resolves the writable tree location for a new or removed entry.
    async fn slot(&self, path: &str) -> FsResult<TreeSlot> {
        match self.registry.classifier().classify(path)? {
            PathKind::ImmutableRoot | PathKind::ImmutableNode { .. } => {
                return Err(FsError::ReadOnlySection);
            }
            PathKind::MountRoot
            | PathKind::NamedRoot
            | PathKind::MutableRoot
            | PathKind::NamedKey { .. } => return Err(FsError::AccessDenied),
            PathKind::NamedNode { .. } | PathKind::MutableNode { .. } => {}
        }
        let name = path::file_name(path);
        path::validate_name(name, self.config.limits.name_max)?;
        let parent = path::parent_of(path).ok_or(FsError::InvalidArgument)?;
        let parent = self.open_node(parent, OpenFlags::default()).await?;
        let state = parent.read().await;
        match state.target()? {
            Target::Tree {
                tree,
                path: dir,
                node: TreeNode::Directory,
                key,
            } => Ok(TreeSlot {
                tree: tree.clone(),
                rel: format!("{dir}/{name}"),
                key: key.clone(),
            }),
            Target::Tree { .. } | Target::KeyFile { .. } => Err(FsError::NotADirectory),
            Target::Dag { .. } | Target::Link { .. } => Err(FsError::ReadOnlySection),
            Target::Synthetic => Err(FsError::AccessDenied),
        }
    }

    /// Payload of a symlink target.
    async fn link_target(&self, target: &Target) -> FsResult<String> {
        match target {
            Target::Link { target } => Ok(target.clone()),
            Target::Tree {
                node: TreeNode::Symlink(target),
                ..
            } => Ok(target.clone()),
            Target::Dag { cid, stat, .. } if stat.kind == FileKind::Symlink => {
                match self.backends.dag.get(cid).await? {
                    DagNode::Symlink { target } => Ok(target),
                    _ => Err(FsError::Unexpected(format!("{cid} is not a symlink"))),
                }
            }
            _ => Err(FsError::InvalidArgument),
        }
    }

    /// File IO for a bound target.
    async fn file_io(&self, target: &Target, writable: bool) -> FsResult<Box<dyn FileIo>> {
        match target {
            Target::Dag { path, stat, .. } => match stat.kind {
                FileKind::File => {
                    let file =
                        ImmutableFile::open(self.backends.dag.clone(), path, self.fetch_attempt())
                            .await?;
                    Ok(Box::new(file))
                }
                FileKind::Directory => Err(FsError::IsADirectory),
                FileKind::Symlink => Err(FsError::InvalidArgument),
            },
            Target::Tree {
                node: TreeNode::File(file),
                key,
                ..
            } => Ok(Box::new(MutableTreeFile::new(file.clone(), writable, key.clone()))),
            Target::KeyFile { root } => match root.value() {
                KeyValue::File(modifier) => {
                    Ok(Box::new(NamedFile::new(modifier.clone(), root.clone(), writable)))
                }
                KeyValue::Tree(_) => Err(FsError::Unexpected(format!(
                    "key {} holds a tree, not a file",
                    root.key().id
                ))),
            },
            Target::Tree {
                node: TreeNode::Directory,
                ..
            }
            | Target::Synthetic => Err(FsError::IsADirectory),
            Target::Tree {
                node: TreeNode::Symlink(_),
                ..
            }
            | Target::Link { .. } => Err(FsError::InvalidArgument),
        }
    }
}
