// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory content-addressed DAG

use crate::backend::{DagNode, DagReader, DagService, DagStat, LinkResult};
use crate::error::{FsError, FsResult};
use crate::fault::{FaultInjector, FaultOp};
use crate::types::Cid;
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

/// Blocks keyed by the blake3 digest of their JSON encoding.
pub struct MemoryDag {
    blocks: RwLock<HashMap<Cid, DagNode>>,
    faults: Arc<FaultInjector>,
}

impl Default for MemoryDag {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDag {
    pub fn new() -> Self {
        Self::with_faults(Arc::new(FaultInjector::new()))
    }

    pub fn with_faults(faults: Arc<FaultInjector>) -> Self {
        Self {
            blocks: RwLock::new(HashMap::new()),
            faults,
        }
    }

    pub fn faults(&self) -> &Arc<FaultInjector> {
        &self.faults
    }

    pub fn cid_of(node: &DagNode) -> Cid {
        let encoded = serde_json::to_vec(node).unwrap_or_default();
        Cid::for_bytes(&encoded)
    }

    /// Stores a node without consulting the fault policy.
    pub fn insert(&self, node: DagNode) -> Cid {
        let cid = Self::cid_of(&node);
        self.blocks.write().unwrap().insert(cid, node);
        cid
    }

    pub fn insert_file(&self, data: &[u8]) -> Cid {
        self.insert(DagNode::File {
            data: data.to_vec(),
        })
    }

    pub fn insert_dir<'a>(&self, links: impl IntoIterator<Item = (&'a str, Cid)>) -> Cid {
        let links: BTreeMap<String, Cid> =
            links.into_iter().map(|(name, cid)| (name.to_string(), cid)).collect();
        self.insert(DagNode::Directory { links })
    }

    fn node(&self, cid: &Cid) -> FsResult<DagNode> {
        self.blocks.read().unwrap().get(cid).cloned().ok_or(FsError::NotFound)
    }

    fn walk(&self, path: &str) -> FsResult<(Cid, DagNode)> {
        let mut segments = path.split('/').filter(|s| !s.is_empty());
        let root = segments.next().ok_or(FsError::InvalidArgument)?;
        let mut cid: Cid = root.parse().map_err(|_| FsError::NotFound)?;
        let mut node = self.node(&cid)?;
        for segment in segments {
            let DagNode::Directory { links } = &node else {
                return Err(FsError::NotADirectory);
            };
            cid = *links.get(segment).ok_or(FsError::NotFound)?;
            node = self.node(&cid)?;
        }
        Ok((cid, node))
    }
}

#[async_trait]
impl DagService for MemoryDag {
    async fn resolve(&self, path: &str) -> FsResult<Cid> {
        self.faults.gate(FaultOp::Resolve).await?;
        self.walk(path).map(|(cid, _)| cid)
    }

    async fn get(&self, cid: &Cid) -> FsResult<DagNode> {
        self.faults.gate(FaultOp::Resolve).await?;
        self.node(cid)
    }

    async fn stat(&self, path: &str) -> FsResult<DagStat> {
        self.faults.gate(FaultOp::Resolve).await?;
        let (_, node) = self.walk(path)?;
        let num_links = match &node {
            DagNode::Directory { links } => Some(links.len() as u64),
            _ => None,
        };
        Ok(DagStat {
            kind: node.kind(),
            size: node.size(),
            num_links,
        })
    }

    async fn fetch_file(&self, path: &str) -> FsResult<Box<dyn DagReader>> {
        self.faults.gate(FaultOp::Fetch).await?;
        match self.walk(path)?.1 {
            DagNode::File { data } => Ok(Box::new(MemoryReader {
                data: Arc::from(data),
                pos: 0,
                faults: self.faults.clone(),
            })),
            DagNode::Directory { .. } => Err(FsError::IsADirectory),
            DagNode::Symlink { .. } => Err(FsError::InvalidArgument),
        }
    }

    async fn list(&self, path: &str) -> FsResult<BoxStream<'static, FsResult<LinkResult>>> {
        self.faults.gate(FaultOp::List).await?;
        let DagNode::Directory { links } = self.walk(path)?.1 else {
            return Err(FsError::NotADirectory);
        };
        let mut results = Vec::with_capacity(links.len());
        for (name, cid) in links {
            let child = self.node(&cid)?;
            results.push(Ok(LinkResult {
                name,
                cid,
                kind: child.kind(),
                size: child.size(),
            }));
        }
        Ok(stream::iter(results).boxed())
    }

    async fn put(&self, node: DagNode) -> FsResult<Cid> {
        self.faults.gate(FaultOp::Put).await?;
        Ok(self.insert(node))
    }
}

struct MemoryReader {
    data: Arc<[u8]>,
    pos: u64,
    faults: Arc<FaultInjector>,
}

#[async_trait]
impl DagReader for MemoryReader {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    async fn seek(&mut self, pos: u64) -> FsResult<u64> {
        self.pos = pos;
        Ok(pos)
    }

    async fn read(&mut self, buf: &mut [u8]) -> FsResult<usize> {
        self.faults.gate(FaultOp::Read).await?;
        let len = self.data.len() as u64;
        if self.pos >= len {
            return Ok(0);
        }
        let start = self.pos as usize;
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}
