// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Structural operations: entries appearing, disappearing and moving
//!
//! Each op resolves its tree slot under the shared registry lock, then takes
//! the exclusive lock for the tree mutation and the registry update only.

use super::MountContext;
use crate::backend::TreeNode;
use crate::error::{FsError, FsResult};
use crate::path::{self, Namespace, PathKind};
use crate::scheduler::OpClass;
use crate::types::{FileKind, Metadata, OpContext};

impl MountContext {
    pub async fn mkdir(&self, ctx: &OpContext, path: &str, _mode: u32) -> FsResult<Metadata> {
        self.scheduler
            .run("mkdir", OpClass::Structural, ctx, async {
                let slot = self.locate(path).await?;
                let node = {
                    let _exclusive = self.registry.exclusive().await;
                    slot.tree.mkdir(&slot.rel).await?;
                    slot.touch();
                    self.registry.invalidate(path);
                    let resolved = slot.resolved(TreeNode::Directory, FileKind::Directory, 0);
                    self.registry.install_created(path, resolved).await?
                };
                tracing::debug!(path, "created directory");
                self.node_attrs(&node, ctx).await
            })
            .await
    }

    /// Creates an empty regular file. Device nodes, fifos and sockets have
    /// no representation in the backends.
    pub async fn mknod(
        &self,
        ctx: &OpContext,
        path: &str,
        mode: u32,
        _rdev: u32,
    ) -> FsResult<Metadata> {
        let file_type = mode & libc::S_IFMT as u32;
        if file_type != 0 && file_type != libc::S_IFREG as u32 {
            return Err(FsError::NotSupported);
        }
        self.scheduler
            .run("mknod", OpClass::Structural, ctx, async {
                let node = self.create_file(path).await?;
                self.node_attrs(&node, ctx).await
            })
            .await
    }

    /// Removes a file or symlink. At the top of the named namespace this
    /// deletes the key itself.
    pub async fn unlink(&self, ctx: &OpContext, path: &str) -> FsResult<()> {
        self.scheduler
            .run("unlink", OpClass::Structural, ctx, self.remove(path, false))
            .await
    }

    /// Removes an empty directory. At the top of the named namespace this
    /// deletes the key itself.
    pub async fn rmdir(&self, ctx: &OpContext, path: &str) -> FsResult<()> {
        self.scheduler
            .run("rmdir", OpClass::Structural, ctx, self.remove(path, true))
            .await
    }

    async fn remove(&self, path: &str, directory: bool) -> FsResult<()> {
        if let PathKind::NamedKey { key } = self.registry.classifier().classify(path)? {
            return self.remove_key(&key).await;
        }
        let (slot, kind) = {
            let _shared = self.registry.shared().await;
            let slot = self.slot(path).await?;
            let kind = slot.tree.lookup(&slot.rel).await?.kind();
            (slot, kind)
        };
        match (kind, directory) {
            (FileKind::Directory, false) => return Err(FsError::IsADirectory),
            (FileKind::File | FileKind::Symlink, true) => return Err(FsError::NotADirectory),
            _ => {}
        }
        let _exclusive = self.registry.exclusive().await;
        if directory {
            slot.tree.rmdir(&slot.rel).await?;
        } else {
            slot.tree.unlink(&slot.rel).await?;
        }
        slot.touch();
        self.registry.forget(path).await;
        tracing::debug!(path, directory, "removed entry");
        Ok(())
    }

    async fn remove_key(&self, name: &str) -> FsResult<()> {
        let _exclusive = self.registry.exclusive().await;
        let key = self.names.remove_key(name).await?;
        let named = self.registry.classifier().root_path(Namespace::Named);
        self.registry.forget(&path::join(&named, &key.id)).await;
        self.registry.forget(&path::join(&named, &key.name)).await;
        Ok(())
    }

    /// Moves an entry within one tree. Symlinks are moved, not followed.
    pub async fn rename(&self, ctx: &OpContext, from: &str, to: &str) -> FsResult<()> {
        self.scheduler
            .run("rename", OpClass::Structural, ctx, async {
                let classifier = self.registry.classifier();
                let (src_ns, dst_ns) = (
                    classifier.classify(from)?.namespace(),
                    classifier.classify(to)?.namespace(),
                );
                if src_ns == Namespace::Immutable || dst_ns == Namespace::Immutable {
                    return Err(FsError::ReadOnlySection);
                }
                if src_ns != dst_ns {
                    return Err(FsError::CrossNamespace);
                }

                let (src, dst) = {
                    let _shared = self.registry.shared().await;
                    let src = self.slot(from).await?;
                    let dst = self.slot(to).await?;
                    if !src.same_tree(&dst) {
                        return Err(FsError::CrossNamespace);
                    }
                    src.tree.lookup(&src.rel).await?;
                    (src, dst)
                };
                if src.rel == dst.rel {
                    return Ok(());
                }
                let _exclusive = self.registry.exclusive().await;
                src.tree.mv(&src.rel, &dst.rel).await?;
                src.touch();
                self.registry.forget(from).await;
                self.registry.forget(to).await;
                tracing::debug!(from, to, "renamed");
                Ok(())
            })
            .await
    }

    /// Creates a symlink at `link` whose payload is `target`.
    pub async fn symlink(&self, ctx: &OpContext, target: &str, link: &str) -> FsResult<Metadata> {
        if target.is_empty() {
            return Err(FsError::InvalidArgument);
        }
        self.scheduler
            .run("symlink", OpClass::Structural, ctx, async {
                let slot = self.locate(link).await?;
                let node = {
                    let _exclusive = self.registry.exclusive().await;
                    slot.tree.symlink(&slot.rel, target).await?;
                    slot.touch();
                    self.registry.invalidate(link);
                    let resolved = slot.resolved(
                        TreeNode::Symlink(target.to_string()),
                        FileKind::Symlink,
                        target.len() as u64,
                    );
                    self.registry.install_created(link, resolved).await?
                };
                tracing::debug!(link, target, "created symlink");
                self.node_attrs(&node, ctx).await
            })
            .await
    }

    pub async fn readlink(&self, ctx: &OpContext, path: &str) -> FsResult<String> {
        self.scheduler
            .run("readlink", OpClass::Interactive, ctx, async {
                let node = self.registry.lookup(path).await?;
                let target = {
                    let state = node.read().await;
                    if state.metadata.kind != FileKind::Symlink {
                        return Err(FsError::InvalidArgument);
                    }
                    state.target()?.clone()
                };
                self.link_target(&target).await
            })
            .await
    }
}
