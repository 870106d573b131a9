// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory mutable file tree committing into a DAG

use crate::backend::{
    DagNode, DagService, FdFlags, MutableTree, MutableTreeFactory, TreeEntry, TreeFd, TreeFile,
    TreeNode,
};
use crate::error::{FsError, FsResult};
use crate::types::{Cid, FileKind};
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;

type Children = BTreeMap<String, Entry>;

#[derive(Clone)]
enum Entry {
    Dir(Children),
    File(Arc<MemFile>),
    Symlink(String),
}

impl Entry {
    fn kind(&self) -> FileKind {
        match self {
            Entry::Dir(_) => FileKind::Directory,
            Entry::File(_) => FileKind::File,
            Entry::Symlink(_) => FileKind::Symlink,
        }
    }

    fn size(&self) -> u64 {
        match self {
            Entry::Dir(_) => 0,
            Entry::File(file) => file.len(),
            Entry::Symlink(target) => target.len() as u64,
        }
    }

    fn to_node(&self) -> TreeNode {
        match self {
            Entry::Dir(_) => TreeNode::Directory,
            Entry::File(file) => TreeNode::File(file.clone()),
            Entry::Symlink(target) => TreeNode::Symlink(target.clone()),
        }
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

fn split_last<'a>(path: &'a str) -> FsResult<(Vec<&'a str>, &'a str)> {
    let mut segs = segments(path);
    let name = segs.pop().ok_or(FsError::InvalidArgument)?;
    Ok((segs, name))
}

fn dir_mut<'a>(root: &'a mut Children, segs: &[&str]) -> FsResult<&'a mut Children> {
    let mut dir = root;
    for seg in segs {
        match dir.get_mut(*seg) {
            Some(Entry::Dir(children)) => dir = children,
            Some(_) => return Err(FsError::NotADirectory),
            None => return Err(FsError::NotFound),
        }
    }
    Ok(dir)
}

fn entry<'a>(root: &'a Children, segs: &[&str]) -> FsResult<Option<&'a Entry>> {
    let Some((last, parents)) = segs.split_last() else {
        return Ok(None);
    };
    let mut dir = root;
    for seg in parents {
        match dir.get(*seg) {
            Some(Entry::Dir(children)) => dir = children,
            Some(_) => return Err(FsError::NotADirectory),
            None => return Err(FsError::NotFound),
        }
    }
    dir.get(*last).map(Some).ok_or(FsError::NotFound)
}

/// Owned copy of a subtree taken under the tree lock so it can be written
/// to the DAG without holding it.
enum Snapshot {
    Dir(Vec<(String, Snapshot)>),
    File(Vec<u8>),
    Symlink(String),
}

fn snapshot_children(children: &Children) -> Snapshot {
    Snapshot::Dir(
        children
            .iter()
            .map(|(name, entry)| (name.clone(), snapshot_entry(entry)))
            .collect(),
    )
}

fn snapshot_entry(entry: &Entry) -> Snapshot {
    match entry {
        Entry::Dir(children) => snapshot_children(children),
        Entry::File(file) => Snapshot::File(file.contents()),
        Entry::Symlink(target) => Snapshot::Symlink(target.clone()),
    }
}

fn put_snapshot(dag: Arc<dyn DagService>, snapshot: Snapshot) -> BoxFuture<'static, FsResult<Cid>> {
    async move {
        match snapshot {
            Snapshot::File(data) => dag.put(DagNode::File { data }).await,
            Snapshot::Symlink(target) => dag.put(DagNode::Symlink { target }).await,
            Snapshot::Dir(children) => {
                let mut links = BTreeMap::new();
                for (name, child) in children {
                    let cid = put_snapshot(dag.clone(), child).await?;
                    links.insert(name, cid);
                }
                dag.put(DagNode::Directory { links }).await
            }
        }
    }
    .boxed()
}

fn load_entry(dag: Arc<dyn DagService>, cid: Cid) -> BoxFuture<'static, FsResult<Entry>> {
    async move {
        match dag.get(&cid).await? {
            DagNode::File { data } => Ok(Entry::File(Arc::new(MemFile::new(data, dag.clone())))),
            DagNode::Symlink { target } => Ok(Entry::Symlink(target)),
            DagNode::Directory { links } => {
                let mut children = Children::new();
                for (name, child) in links {
                    children.insert(name, load_entry(dag.clone(), child).await?);
                }
                Ok(Entry::Dir(children))
            }
        }
    }
    .boxed()
}

/// Directory tree held in memory; file objects are shared so that moving a
/// file keeps open descriptors attached to the same content.
pub struct MemoryTree {
    root: Mutex<Children>,
    dag: Arc<dyn DagService>,
}

impl MemoryTree {
    pub fn new(dag: Arc<dyn DagService>) -> Self {
        Self {
            root: Mutex::new(Children::new()),
            dag,
        }
    }

    pub async fn load(dag: Arc<dyn DagService>, root: Cid) -> FsResult<Self> {
        match load_entry(dag.clone(), root).await? {
            Entry::Dir(children) => Ok(Self {
                root: Mutex::new(children),
                dag,
            }),
            _ => Err(FsError::NotADirectory),
        }
    }

    fn insert_new(&self, path: &str, entry: Entry) -> FsResult<()> {
        let (parents, name) = split_last(path)?;
        let mut root = self.root.lock().unwrap();
        let dir = dir_mut(&mut root, &parents)?;
        if dir.contains_key(name) {
            return Err(FsError::AlreadyExists);
        }
        dir.insert(name.to_string(), entry);
        Ok(())
    }
}

#[async_trait]
impl MutableTree for MemoryTree {
    async fn lookup(&self, path: &str) -> FsResult<TreeNode> {
        let root = self.root.lock().unwrap();
        match entry(&root, &segments(path))? {
            None => Ok(TreeNode::Directory),
            Some(entry) => Ok(entry.to_node()),
        }
    }

    async fn list(&self, path: &str) -> FsResult<Vec<TreeEntry>> {
        let root = self.root.lock().unwrap();
        let children = match entry(&root, &segments(path))? {
            None => &*root,
            Some(Entry::Dir(children)) => children,
            Some(_) => return Err(FsError::NotADirectory),
        };
        Ok(children
            .iter()
            .map(|(name, entry)| TreeEntry {
                name: name.clone(),
                kind: entry.kind(),
                size: entry.size(),
            })
            .collect())
    }

    async fn mkdir(&self, path: &str) -> FsResult<()> {
        self.insert_new(path, Entry::Dir(Children::new()))
    }

    async fn create(&self, path: &str) -> FsResult<Arc<dyn TreeFile>> {
        let file = Arc::new(MemFile::new(Vec::new(), self.dag.clone()));
        self.insert_new(path, Entry::File(file.clone()))?;
        Ok(file)
    }

    async fn symlink(&self, path: &str, target: &str) -> FsResult<()> {
        self.insert_new(path, Entry::Symlink(target.to_string()))
    }

    async fn unlink(&self, path: &str) -> FsResult<()> {
        let (parents, name) = split_last(path)?;
        let mut root = self.root.lock().unwrap();
        let dir = dir_mut(&mut root, &parents)?;
        match dir.get(name) {
            None => Err(FsError::NotFound),
            Some(Entry::Dir(_)) => Err(FsError::IsADirectory),
            Some(_) => {
                dir.remove(name);
                Ok(())
            }
        }
    }

    async fn rmdir(&self, path: &str) -> FsResult<()> {
        let (parents, name) = split_last(path)?;
        let mut root = self.root.lock().unwrap();
        let dir = dir_mut(&mut root, &parents)?;
        match dir.get(name) {
            None => Err(FsError::NotFound),
            Some(Entry::Dir(children)) if !children.is_empty() => Err(FsError::NotEmpty),
            Some(Entry::Dir(_)) => {
                dir.remove(name);
                Ok(())
            }
            Some(_) => Err(FsError::NotADirectory),
        }
    }

    async fn mv(&self, from: &str, to: &str) -> FsResult<()> {
        let (from_parents, from_name) = split_last(from)?;
        let (to_parents, to_name) = split_last(to)?;
        let from_segs = segments(from);
        let to_segs = segments(to);
        if from_segs == to_segs {
            return Ok(());
        }
        if to_segs.starts_with(&from_segs) {
            return Err(FsError::InvalidArgument);
        }

        let mut root = self.root.lock().unwrap();
        let moving_kind = match entry(&root, &from_segs)? {
            Some(e) => e.kind(),
            None => return Err(FsError::InvalidArgument),
        };
        {
            let dest = dir_mut(&mut root, &to_parents)?;
            match (dest.get(to_name), moving_kind) {
                (None, _) => {}
                (Some(Entry::Dir(children)), FileKind::Directory) if children.is_empty() => {}
                (Some(Entry::Dir(_)), FileKind::Directory) => return Err(FsError::NotEmpty),
                (Some(Entry::Dir(_)), _) => return Err(FsError::IsADirectory),
                (Some(_), FileKind::Directory) => return Err(FsError::NotADirectory),
                (Some(_), _) => {}
            }
        }
        let moved = dir_mut(&mut root, &from_parents)?
            .remove(from_name)
            .ok_or(FsError::NotFound)?;
        dir_mut(&mut root, &to_parents)?.insert(to_name.to_string(), moved);
        Ok(())
    }

    async fn flush(&self, path: &str) -> FsResult<Cid> {
        let snapshot = {
            let root = self.root.lock().unwrap();
            match entry(&root, &segments(path))? {
                None => snapshot_children(&root),
                Some(entry) => snapshot_entry(entry),
            }
        };
        put_snapshot(self.dag.clone(), snapshot).await
    }
}

/// File content shared by every tree entry and descriptor referring to it.
pub struct MemFile {
    data: Arc<RwLock<Vec<u8>>>,
    writer: Arc<tokio::sync::Mutex<()>>,
    dag: Arc<dyn DagService>,
}

impl MemFile {
    fn new(data: Vec<u8>, dag: Arc<dyn DagService>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
            writer: Arc::new(tokio::sync::Mutex::new(())),
            dag,
        }
    }

    fn len(&self) -> u64 {
        self.data.read().unwrap().len() as u64
    }

    fn contents(&self) -> Vec<u8> {
        self.data.read().unwrap().clone()
    }
}

#[async_trait]
impl TreeFile for MemFile {
    async fn open(&self, flags: FdFlags) -> FsResult<Box<dyn TreeFd>> {
        let writer = if flags.write {
            Some(self.writer.clone().lock_owned().await)
        } else {
            None
        };
        Ok(Box::new(MemFd {
            data: self.data.clone(),
            flags,
            _writer: writer,
        }))
    }

    async fn size(&self) -> FsResult<u64> {
        Ok(self.len())
    }

    async fn flush(&self) -> FsResult<Cid> {
        let data = self.contents();
        self.dag.put(DagNode::File { data }).await
    }
}

struct MemFd {
    data: Arc<RwLock<Vec<u8>>>,
    flags: FdFlags,
    _writer: Option<OwnedMutexGuard<()>>,
}

#[async_trait]
impl TreeFd for MemFd {
    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        if !self.flags.read {
            return Err(FsError::BadHandle);
        }
        let data = self.data.read().unwrap();
        let len = data.len() as u64;
        if offset >= len {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    async fn write_at(&mut self, buf: &[u8], offset: u64) -> FsResult<usize> {
        if !self.flags.write {
            return Err(FsError::BadHandle);
        }
        let mut data = self.data.write().unwrap();
        let start = usize::try_from(offset).map_err(|_| FsError::InvalidArgument)?;
        let end = start.checked_add(buf.len()).ok_or(FsError::InvalidArgument)?;
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    async fn truncate(&mut self, size: u64) -> FsResult<()> {
        if !self.flags.write {
            return Err(FsError::BadHandle);
        }
        let size = usize::try_from(size).map_err(|_| FsError::InvalidArgument)?;
        self.data.write().unwrap().resize(size, 0);
        Ok(())
    }

    async fn size(&self) -> FsResult<u64> {
        Ok(self.data.read().unwrap().len() as u64)
    }

    async fn flush(&mut self) -> FsResult<()> {
        Ok(())
    }

    async fn close(self: Box<Self>) -> FsResult<()> {
        Ok(())
    }
}

/// Loads [`MemoryTree`]s for named roots.
pub struct MemoryTreeFactory {
    dag: Arc<dyn DagService>,
}

impl MemoryTreeFactory {
    pub fn new(dag: Arc<dyn DagService>) -> Self {
        Self { dag }
    }
}

#[async_trait]
impl MutableTreeFactory for MemoryTreeFactory {
    async fn load(&self, root: Option<Cid>) -> FsResult<Arc<dyn MutableTree>> {
        match root {
            None => Ok(Arc::new(MemoryTree::new(self.dag.clone()))),
            Some(cid) => Ok(Arc::new(MemoryTree::load(self.dag.clone(), cid).await?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDag;

    fn tree() -> (Arc<MemoryDag>, MemoryTree) {
        let dag = Arc::new(MemoryDag::new());
        let tree = MemoryTree::new(dag.clone());
        (dag, tree)
    }

    async fn write(file: &Arc<dyn TreeFile>, data: &[u8], offset: u64) {
        let mut fd = file
            .open(FdFlags {
                read: true,
                write: true,
            })
            .await
            .expect("open");
        fd.write_at(data, offset).await.expect("write");
        fd.close().await.expect("close");
    }

    #[tokio::test]
    async fn structural_ops() {
        let (_dag, tree) = tree();
        tree.mkdir("/d").await.expect("mkdir");
        tree.mkdir("/d/sub").await.expect("mkdir sub");
        assert_eq!(tree.mkdir("/d").await, Err(FsError::AlreadyExists));
        assert_eq!(tree.mkdir("/missing/x").await, Err(FsError::NotFound));

        let names: Vec<_> =
            tree.list("/d").await.expect("list").into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["sub"]);

        assert_eq!(tree.rmdir("/d").await, Err(FsError::NotEmpty));
        tree.rmdir("/d/sub").await.expect("rmdir");
        assert_eq!(tree.unlink("/d").await, Err(FsError::IsADirectory));
        tree.rmdir("/d").await.expect("rmdir d");
        assert!(tree.list("/").await.expect("list root").is_empty());
    }

    #[tokio::test]
    async fn writes_zero_fill_gaps() {
        let (_dag, tree) = tree();
        let file = tree.create("/f").await.expect("create");
        write(&file, b"xy", 3).await;
        let mut fd = file.open(FdFlags { read: true, write: false }).await.expect("open");
        let mut buf = [0xffu8; 8];
        let n = fd.read_at(&mut buf, 0).await.expect("read");
        assert_eq!(&buf[..n], b"\0\0\0xy");
    }

    #[tokio::test]
    async fn moved_files_keep_identity() {
        let (_dag, tree) = tree();
        let file = tree.create("/old").await.expect("create");
        write(&file, b"original", 0).await;
        tree.mv("/old", "/new").await.expect("mv");
        assert_eq!(tree.lookup("/old").await.map(|n| n.kind()), Err(FsError::NotFound));
        let TreeNode::File(moved) = tree.lookup("/new").await.expect("lookup") else {
            panic!("expected file");
        };
        assert_eq!(
            Arc::as_ptr(&moved) as *const (),
            Arc::as_ptr(&file) as *const ()
        );
        assert_eq!(moved.size().await.expect("size"), 8);
        assert_eq!(tree.mv("/", "/x").await, Err(FsError::InvalidArgument));
    }

    #[tokio::test]
    async fn flush_and_reload_round_trip() {
        let (dag, tree) = tree();
        tree.mkdir("/docs").await.expect("mkdir");
        let file = tree.create("/docs/readme").await.expect("create");
        write(&file, b"hi", 0).await;
        tree.symlink("/link", "docs/readme").await.expect("symlink");

        let root = tree.flush("").await.expect("flush");
        let reloaded = MemoryTreeFactory::new(dag.clone())
            .load(Some(root))
            .await
            .expect("load");
        let TreeNode::File(copy) = reloaded.lookup("/docs/readme").await.expect("lookup") else {
            panic!("expected file");
        };
        assert_eq!(copy.size().await.expect("size"), 2);
        assert!(matches!(
            reloaded.lookup("/link").await.expect("lookup link"),
            TreeNode::Symlink(t) if t == "docs/readme"
        ));
    }
}
