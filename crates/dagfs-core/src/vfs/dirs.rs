// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Directory handle operations

use super::MountContext;
use crate::attrs::Access;
use crate::backend::TreeNode;
use crate::dirstream::DirStream;
use crate::error::{FsError, FsResult};
use crate::handles::IoKind;
use crate::path::{Namespace, PathKind};
use crate::resolve::Target;
use crate::scheduler::OpClass;
use crate::types::{DirItem, FileKind, HandleId, Metadata, OpContext};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use std::time::Duration;

/// Entries of a directory as a stream, plus the count when known up front.
struct Listing {
    source: BoxStream<'static, FsResult<DirItem>>,
    expected: Option<u64>,
}

impl Listing {
    fn ready(items: Vec<DirItem>) -> Self {
        Self {
            expected: Some(items.len() as u64),
            source: stream::iter(items.into_iter().map(Ok)).boxed(),
        }
    }
}

impl MountContext {
    /// Opens a directory stream over a snapshot of the directory's children.
    pub async fn opendir(&self, ctx: &OpContext, path: &str) -> FsResult<HandleId> {
        self.scheduler
            .run("opendir", OpClass::Directory, ctx, async {
                let reservation = self.handles.reserve()?;
                let node = self.registry.lookup(path).await?;
                let dir_attrs = self.node_attrs(&node, ctx).await?;
                if !dir_attrs.is_dir() {
                    return Err(FsError::NotADirectory);
                }
                let target = node.read().await.target()?.clone();
                let listing = self.listing(node.kind(), &target, ctx).await?;
                let inactivity =
                    Duration::from_millis(self.config.timeouts.dir_entry_inactivity_ms);
                let stream =
                    DirStream::spawn(listing.source, listing.expected, inactivity, dir_attrs);
                let id = reservation.commit_dir(&self.registry, node, stream);
                tracing::debug!(path, fh = id.0, "opened directory");
                Ok(id)
            })
            .await
    }

    /// Feeds entries from `offset` on to `fill(name, attrs, next_offset)`
    /// until it returns `false` or the directory ends.
    pub async fn readdir<F>(
        &self,
        ctx: &OpContext,
        fh: HandleId,
        offset: u64,
        mut fill: F,
    ) -> FsResult<()>
    where
        F: FnMut(&str, &Metadata, u64) -> bool + Send,
    {
        self.scheduler
            .run("readdir", OpClass::Directory, ctx, async move {
                let handle = self.handles.lookup(fh, IoKind::Dir)?;
                let stream = handle.dir()?.clone();
                let mut offset = offset;
                while let Some(item) = stream.entry_at(offset).await? {
                    offset += 1;
                    let attrs = self.attrs.stamp(&item.attrs, ctx);
                    if !fill(&item.name, &attrs, offset) {
                        break;
                    }
                }
                Ok(())
            })
            .await
    }

    pub async fn releasedir(&self, ctx: &OpContext, fh: HandleId) -> FsResult<()> {
        self.scheduler
            .run("releasedir", OpClass::Interactive, ctx, async {
                self.handles.lookup(fh, IoKind::Dir)?;
                self.handles.release(fh, &self.registry).await?;
                tracing::debug!(fh = fh.0, "released directory");
                Ok(())
            })
            .await
    }

    /// Directories carry no buffered state.
    pub async fn fsyncdir(&self, ctx: &OpContext, fh: HandleId, _data_only: bool) -> FsResult<()> {
        self.scheduler
            .run("fsyncdir", OpClass::Interactive, ctx, async {
                self.handles.lookup(fh, IoKind::Dir).map(|_| ())
            })
            .await
    }

    async fn listing(
        &self,
        kind: &PathKind,
        target: &Target,
        ctx: &OpContext,
    ) -> FsResult<Listing> {
        match (kind, target) {
            (PathKind::MountRoot, _) => {
                let classifier = self.registry.classifier();
                let items = classifier
                    .root_entries()
                    .into_iter()
                    .map(|(name, ns)| {
                        let access = match ns {
                            Namespace::Mutable => Access::Writable,
                            _ => Access::Immutable,
                        };
                        DirItem {
                            name: name.to_string(),
                            attrs: self.attrs.listing(FileKind::Directory, 0, access, ctx),
                        }
                    })
                    .collect();
                Ok(Listing::ready(items))
            }
            // Content addresses are reachable but not enumerable.
            (PathKind::ImmutableRoot, _) => Ok(Listing::ready(Vec::new())),
            (PathKind::NamedRoot, _) => {
                let mut items = Vec::new();
                for key in self.names.keys() {
                    let kind = match self.names.loaded(&key.id).await {
                        Some(root) if root.is_file() => FileKind::File,
                        _ => FileKind::Directory,
                    };
                    items.push(DirItem {
                        name: key.id.clone(),
                        attrs: self.attrs.listing(kind, 0, Access::Writable, ctx),
                    });
                    items.push(DirItem {
                        name: key.name.clone(),
                        attrs: self.attrs.listing(
                            FileKind::Symlink,
                            key.id.len() as u64,
                            Access::Writable,
                            ctx,
                        ),
                    });
                }
                Ok(Listing::ready(items))
            }
            (
                _,
                Target::Tree {
                    tree,
                    path,
                    node: TreeNode::Directory,
                    ..
                },
            ) => {
                let access = Access::of(kind, target);
                let items = tree
                    .list(path)
                    .await?
                    .into_iter()
                    .map(|entry| DirItem {
                        attrs: self.attrs.listing(entry.kind, entry.size, access, ctx),
                        name: entry.name,
                    })
                    .collect();
                Ok(Listing::ready(items))
            }
            (_, Target::Dag { path, stat, .. }) if stat.kind == FileKind::Directory => {
                let access = Access::of(kind, target);
                let attrs = self.attrs.clone();
                let ctx = ctx.clone();
                let links = self.backends.dag.list(path).await?;
                let source = links
                    .map(move |link| {
                        link.map(|link| DirItem {
                            attrs: attrs.listing(link.kind, link.size, access, &ctx),
                            name: link.name,
                        })
                    })
                    .boxed();
                Ok(Listing {
                    source,
                    expected: stat.num_links,
                })
            }
            _ => Err(FsError::NotADirectory),
        }
    }
}
