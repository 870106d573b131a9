// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Registry of live filesystem nodes keyed by canonical path

use crate::cache::ResolutionCache;
use crate::error::{FsError, FsResult};
use crate::path::{self, Namespace, PathClassifier, PathKind};
use crate::resolve::{Resolved, Resolver, Target};
use crate::types::{FileKind, HandleId, Metadata};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Mutable part of a node, guarded by the node lock.
#[derive(Debug)]
pub struct NodeState {
    pub metadata: Metadata,
    /// `None` once the backing object is gone (unlinked or renamed away).
    pub target: Option<Target>,
}

impl NodeState {
    fn bind(&mut self, resolved: Resolved) {
        if self.metadata.kind != resolved.kind {
            self.metadata = Metadata::uninitialized(resolved.kind);
        }
        self.metadata.size = resolved.size;
        self.target = Some(resolved.target);
    }

    pub fn target(&self) -> FsResult<&Target> {
        self.target.as_ref().ok_or(FsError::NotFound)
    }
}

/// Unit of registered identity.
pub struct FsNode {
    path: String,
    kind: PathKind,
    state: RwLock<NodeState>,
    handles: Mutex<BTreeSet<HandleId>>,
    /// Set once the path stopped naming this node; open handles keep it
    /// alive outside the index.
    detached: AtomicBool,
}

impl FsNode {
    pub fn new(path: String, kind: PathKind) -> Self {
        Self {
            path,
            kind,
            state: RwLock::new(NodeState {
                metadata: Metadata::uninitialized(FileKind::File),
                target: None,
            }),
            handles: Mutex::new(BTreeSet::new()),
            detached: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> &PathKind {
        &self.kind
    }

    /// Immutable namespaces never accept writes.
    pub fn is_mutable(&self) -> bool {
        self.kind.is_mutable()
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, NodeState> {
        self.state.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, NodeState> {
        self.state.write().await
    }

    pub fn has_handle(&self, id: HandleId) -> bool {
        self.handles.lock().unwrap().contains(&id)
    }

    pub fn handle_count(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    fn attach(&self, id: HandleId) {
        self.handles.lock().unwrap().insert(id);
    }

    fn detach(&self, id: HandleId) -> bool {
        self.handles.lock().unwrap().remove(&id)
    }
}

impl std::fmt::Debug for FsNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsNode")
            .field("path", &self.path)
            .field("handles", &self.handle_count())
            .finish()
    }
}

/// Path index plus the registry lock.
///
/// The registry lock (`gate`) is taken by the scheduler around every
/// operation: shared for data ops, exclusive for structural ones. The
/// index itself sits behind a short-lived mutex.
pub struct NodeRegistry {
    gate: RwLock<()>,
    index: Mutex<HashMap<String, Arc<FsNode>>>,
    classifier: PathClassifier,
    resolver: Arc<Resolver>,
    cache: Arc<ResolutionCache>,
}

impl NodeRegistry {
    pub fn new(
        classifier: PathClassifier,
        resolver: Arc<Resolver>,
        cache: Arc<ResolutionCache>,
    ) -> Self {
        Self {
            gate: RwLock::new(()),
            index: Mutex::new(HashMap::new()),
            classifier,
            resolver,
            cache,
        }
    }

    pub fn gate(&self) -> &RwLock<()> {
        &self.gate
    }

    /// Registry lock in shared mode.
    pub async fn shared(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read().await
    }

    /// Registry lock in exclusive mode. Held only around tree mutations and
    /// the index updates that follow them, never across backend lookups.
    pub async fn exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.gate.write().await
    }

    pub fn cache(&self) -> &Arc<ResolutionCache> {
        &self.cache
    }

    pub fn classifier(&self) -> &PathClassifier {
        &self.classifier
    }

    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    /// Returns the registered node for a syntactically valid path without
    /// consulting any backend.
    pub fn lookup_shallow(&self, path: &str) -> FsResult<Arc<FsNode>> {
        let kind = self.classifier.classify(path)?;
        Ok(self.get_or_insert(path, kind))
    }

    /// Resolves `path` to a bound node, probing backends on a cache miss.
    pub async fn lookup(&self, path: &str) -> FsResult<Arc<FsNode>> {
        if let Some(node) = self.cache.get(path) {
            if node.read().await.target.is_some() {
                return Ok(node);
            }
            tracing::debug!(path, "stale cache hit, re-probing");
            self.cache.invalidate(path);
        }

        let kind = self.classifier.classify(path)?;
        match self.resolver.probe(&kind).await {
            Ok(resolved) => self.install(path, resolved).await,
            Err(FsError::NotFound) => {
                self.forget(path).await;
                Err(FsError::NotFound)
            }
            Err(err) => Err(err),
        }
    }

    /// Binds `path` to a freshly resolved target and caches it.
    pub async fn install(&self, path: &str, resolved: Resolved) -> FsResult<Arc<FsNode>> {
        self.install_with(path, resolved, false).await
    }

    /// Binds `path` to an object that was just created; attributes
    /// synthesized for a previous object at the same path are dropped.
    /// The entry is cached on its next lookup.
    pub async fn install_created(&self, path: &str, resolved: Resolved) -> FsResult<Arc<FsNode>> {
        self.install_with(path, resolved, true).await
    }

    async fn install_with(
        &self,
        path: &str,
        resolved: Resolved,
        fresh: bool,
    ) -> FsResult<Arc<FsNode>> {
        let kind = self.classifier.classify(path)?;
        let node = self.get_or_insert(path, kind);
        {
            let mut state = node.write().await;
            if fresh {
                state.metadata = Metadata::uninitialized(resolved.kind);
            }
            state.bind(resolved);
        }
        if !fresh {
            self.cache.add(path, node.clone());
        }
        Ok(node)
    }

    /// Follows a named node to the immutable node it currently points at.
    pub async fn resolve_reference(&self, node: &FsNode) -> FsResult<Arc<FsNode>> {
        if let PathKind::ImmutableNode { .. } = node.kind() {
            return self.lookup(node.path()).await;
        }
        let (cid, rest) = self.resolver.reference(node.kind()).await?;
        let root = self.classifier.root_path(Namespace::Immutable);
        self.lookup(&format!("{root}/{cid}{rest}")).await
    }

    /// Syntactic parent of a node.
    pub fn parent(&self, node: &FsNode) -> FsResult<Arc<FsNode>> {
        let parent = path::parent_of(node.path()).ok_or(FsError::InvalidArgument)?;
        self.lookup_shallow(parent)
    }

    pub fn get(&self, path: &str) -> Option<Arc<FsNode>> {
        self.index.lock().unwrap().get(path).cloned()
    }

    pub fn attach_handle(&self, node: &Arc<FsNode>, id: HandleId) {
        // Handles pin the node: make sure it is the registered one, unless its
        // path already names another object.
        if !node.is_detached() {
            self.index
                .lock()
                .unwrap()
                .entry(node.path().to_string())
                .or_insert_with(|| node.clone());
        }
        node.attach(id);
    }

    pub fn detach_handle(&self, node: &FsNode, id: HandleId) -> bool {
        node.detach(id)
    }

    /// Drops cache entries for `path` and its parent.
    pub fn invalidate(&self, path: &str) {
        self.cache.invalidate(path);
        if let Some(parent) = path::parent_of(path) {
            self.cache.invalidate(parent);
        }
    }

    /// Unbinds `path` and everything below it after the backing objects went
    /// away. Nodes still pinned by handles leave the index as well and live on
    /// through their handles only, so an object created later at the same
    /// path gets a node of its own.
    pub async fn forget(&self, path: &str) {
        self.cache.invalidate_tree(path);
        if let Some(parent) = path::parent_of(path) {
            self.cache.invalidate(parent);
        }
        let prefix = format!("{path}/");
        let pinned: Vec<Arc<FsNode>> = {
            let mut index = self.index.lock().unwrap();
            let affected: Vec<String> = index
                .keys()
                .filter(|p| p.as_str() == path || p.starts_with(&prefix))
                .cloned()
                .collect();
            let mut pinned = Vec::new();
            for p in affected {
                if let Some(node) = index.remove(&p) {
                    if node.handle_count() > 0 {
                        node.detached.store(true, Ordering::Release);
                        pinned.push(node);
                    }
                }
            }
            pinned
        };
        for node in pinned {
            tracing::debug!(path = node.path(), "detached node kept alive by open handles");
            node.write().await.target = None;
        }
    }

    /// Removes idle nodes, optionally restricted to one namespace. Returns the
    /// number of nodes dropped.
    pub fn prune(&self, namespace: Option<Namespace>) -> usize {
        let removed: Vec<String> = {
            let mut index = self.index.lock().unwrap();
            let idle: Vec<String> = index
                .iter()
                .filter(|(_, n)| n.handle_count() == 0)
                .filter(|(_, n)| namespace.map_or(true, |ns| n.kind().namespace() == ns))
                .filter(|(_, n)| !n.kind().is_synthetic_root())
                .map(|(p, _)| p.clone())
                .collect();
            for p in &idle {
                index.remove(p);
            }
            idle
        };
        for p in &removed {
            self.cache.invalidate(p);
        }
        removed.len()
    }

    pub fn clear(&self) {
        self.index.lock().unwrap().clear();
        self.cache.clear();
    }

    pub fn len(&self) -> usize {
        self.index.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get_or_insert(&self, path: &str, kind: PathKind) -> Arc<FsNode> {
        self.index
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(FsNode::new(path.to_string(), kind)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MutableTree;
    use crate::memory::MemoryStack;
    use crate::testing;

    async fn fixture() -> (MemoryStack, Arc<NodeRegistry>) {
        let stack = MemoryStack::new(testing::self_key());
        let cache = Arc::new(ResolutionCache::new(64).expect("cache"));
        let registry = testing::registry_over(&stack, cache).await;
        (stack, registry)
    }

    #[tokio::test]
    async fn repeated_lookups_share_identity() {
        let (stack, registry) = fixture().await;
        stack.files.mkdir("/d").await.expect("mkdir");

        let first = registry.lookup("/mutable/d").await.expect("lookup");
        let second = registry.lookup("/mutable/d").await.expect("lookup");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.read().await.metadata.kind, FileKind::Directory);

        let err = registry.lookup("/mutable/missing").await.expect_err("missing");
        assert_eq!(err, FsError::NotFound);
        let err = registry.lookup("/elsewhere").await.expect_err("unknown root");
        assert_eq!(err, FsError::NotFound);
    }

    #[tokio::test]
    async fn forget_detaches_pinned_nodes() {
        let (stack, registry) = fixture().await;
        stack.files.mkdir("/d").await.expect("mkdir");
        stack.files.create("/d/f").await.expect("create");
        stack.files.create("/d/g").await.expect("create");

        let pinned = registry.lookup("/mutable/d/f").await.expect("lookup");
        registry.lookup("/mutable/d/g").await.expect("lookup");
        registry.attach_handle(&pinned, HandleId(9));

        stack.files.unlink("/d/f").await.expect("unlink");
        registry.forget("/mutable/d/f").await;

        assert!(registry.get("/mutable/d/f").is_none());
        assert!(registry.get("/mutable/d/g").is_some());
        assert!(pinned.is_detached());
        assert!(pinned.read().await.target.is_none());
        assert!(pinned.has_handle(HandleId(9)));

        // A second handle on the detached node must not put it back.
        registry.attach_handle(&pinned, HandleId(10));
        assert!(registry.get("/mutable/d/f").is_none());

        stack.files.create("/d/f").await.expect("recreate");
        let fresh = registry.lookup("/mutable/d/f").await.expect("lookup");
        assert!(!Arc::ptr_eq(&fresh, &pinned));
        assert!(!fresh.is_detached());
    }

    #[tokio::test]
    async fn created_nodes_are_cached_on_next_lookup() {
        let (stack, registry) = fixture().await;
        let file = stack.files.create("/f").await.expect("create");
        let resolved = Resolved {
            target: Target::Tree {
                tree: stack.files.clone(),
                path: "/f".to_string(),
                node: crate::backend::TreeNode::File(file),
                key: None,
            },
            kind: FileKind::File,
            size: 0,
        };
        let node = registry
            .install_created("/mutable/f", resolved)
            .await
            .expect("install");
        assert!(registry.cache().get("/mutable/f").is_none());

        let looked_up = registry.lookup("/mutable/f").await.expect("lookup");
        assert!(Arc::ptr_eq(&node, &looked_up));
        assert!(registry.cache().get("/mutable/f").is_some());
    }

    #[tokio::test]
    async fn prune_skips_roots_and_open_nodes() {
        let (stack, registry) = fixture().await;
        stack.files.create("/a").await.expect("create");
        stack.files.create("/b").await.expect("create");
        registry.lookup("/").await.expect("root");
        let a = registry.lookup("/mutable/a").await.expect("a");
        registry.lookup("/mutable/b").await.expect("b");
        registry.attach_handle(&a, HandleId(1));

        assert_eq!(registry.prune(Some(Namespace::Immutable)), 0);
        assert_eq!(registry.prune(None), 1);
        assert!(registry.get("/").is_some());
        assert!(registry.get("/mutable/a").is_some());
        assert!(registry.get("/mutable/b").is_none());

        assert!(registry.detach_handle(&a, HandleId(1)));
        assert_eq!(registry.prune(None), 1);
    }
}
