// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use super::{seek_position, FileIo};
use crate::backend::{DagNode, DagService};
use crate::error::{FsError, FsResult};
use crate::names::KeyRoot;
use crate::types::{Cid, Whence};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Buffered editor over a DAG file. Edits accumulate in memory and become a
/// new DAG node on [`DagModifier::commit`].
pub struct DagModifier {
    dag: Arc<dyn DagService>,
    committed: Cid,
    buffer: Option<Vec<u8>>,
    dirty: bool,
}

impl DagModifier {
    pub fn new(dag: Arc<dyn DagService>, root: Cid) -> Self {
        Self {
            dag,
            committed: root,
            buffer: None,
            dirty: false,
        }
    }

    /// Root produced by the most recent commit (or the seed).
    pub fn committed(&self) -> Cid {
        self.committed
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    async fn buffer(&mut self) -> FsResult<&mut Vec<u8>> {
        if self.buffer.is_none() {
            let mut reader = self.dag.fetch_file(&format!("/{}", self.committed)).await?;
            let mut data = vec![0u8; reader.size() as usize];
            let mut filled = 0;
            while filled < data.len() {
                let n = reader.read(&mut data[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            data.truncate(filled);
            self.buffer = Some(data);
        }
        self.buffer
            .as_mut()
            .ok_or_else(|| FsError::Unexpected("modifier buffer missing".to_string()))
    }

    pub async fn size(&mut self) -> FsResult<u64> {
        Ok(self.buffer().await?.len() as u64)
    }

    pub async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        let data = self.buffer().await?;
        if offset >= data.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    pub async fn write_at(&mut self, buf: &[u8], offset: u64) -> FsResult<usize> {
        let start = usize::try_from(offset).map_err(|_| FsError::InvalidArgument)?;
        let end = start.checked_add(buf.len()).ok_or(FsError::InvalidArgument)?;
        let data = self.buffer().await?;
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        self.dirty = true;
        Ok(buf.len())
    }

    pub async fn truncate(&mut self, size: u64) -> FsResult<()> {
        let size = usize::try_from(size).map_err(|_| FsError::InvalidArgument)?;
        self.buffer().await?.resize(size, 0);
        self.dirty = true;
        Ok(())
    }

    /// Writes buffered edits as a new DAG node and returns its address.
    pub async fn commit(&mut self) -> FsResult<Cid> {
        if !self.dirty {
            return Ok(self.committed);
        }
        let data = self.buffer().await?.clone();
        self.committed = self.dag.put(DagNode::File { data }).await?;
        self.dirty = false;
        Ok(self.committed)
    }
}

/// File that is the whole value of an owned named key.
///
/// Every handle on the key shares one modifier, so edits made through one
/// handle are visible to the others before they are committed.
pub struct NamedFile {
    modifier: Arc<Mutex<DagModifier>>,
    root: Arc<KeyRoot>,
    writable: bool,
    cursor: u64,
}

impl NamedFile {
    pub fn new(modifier: Arc<Mutex<DagModifier>>, root: Arc<KeyRoot>, writable: bool) -> Self {
        Self {
            modifier,
            root,
            writable,
            cursor: 0,
        }
    }
}

#[async_trait]
impl FileIo for NamedFile {
    async fn read(&mut self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        let n = self.modifier.lock().await.read_at(buf, offset).await?;
        self.cursor = offset + n as u64;
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8], offset: u64) -> FsResult<usize> {
        if !self.writable {
            return Err(FsError::BadHandle);
        }
        let n = self.modifier.lock().await.write_at(buf, offset).await?;
        self.cursor = offset + n as u64;
        Ok(n)
    }

    async fn seek(&mut self, offset: i64, whence: Whence) -> FsResult<u64> {
        let size = self.modifier.lock().await.size().await?;
        self.cursor = seek_position(self.cursor, size, offset, whence)?;
        Ok(self.cursor)
    }

    async fn size(&mut self) -> FsResult<u64> {
        self.modifier.lock().await.size().await
    }

    async fn truncate(&mut self, size: u64) -> FsResult<()> {
        if !self.writable {
            return Err(FsError::BadHandle);
        }
        self.modifier.lock().await.truncate(size).await
    }

    async fn sync(&mut self) -> FsResult<()> {
        let root = self.modifier.lock().await.commit().await?;
        tracing::debug!(key = %self.root.key().id, %root, "committed named file");
        self.root.touch();
        Ok(())
    }

    /// Buffered edits stay in the shared modifier until the next sync.
    async fn close(&mut self) -> FsResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryDag;

    #[tokio::test]
    async fn modifier_commits_new_roots() {
        let dag = Arc::new(MemoryDag::new());
        let seed = dag.insert_file(b"v1");
        let mut modifier = DagModifier::new(dag.clone(), seed);

        assert_eq!(modifier.commit().await.expect("clean commit"), seed);
        modifier.write_at(b"2", 1).await.expect("write");
        assert!(modifier.is_dirty());
        let root = modifier.commit().await.expect("commit");
        assert_ne!(root, seed);
        assert_eq!(root, MemoryDag::cid_of(&DagNode::File { data: b"v2".to_vec() }));
        assert_eq!(modifier.committed(), root);
    }

    #[tokio::test]
    async fn reads_see_uncommitted_edits() {
        let dag = Arc::new(MemoryDag::new());
        let seed = dag.insert_file(b"abc");
        let mut modifier = DagModifier::new(dag, seed);
        modifier.truncate(1).await.expect("truncate");
        modifier.write_at(b"Z", 3).await.expect("write");
        let mut buf = [0u8; 8];
        let n = modifier.read_at(&mut buf, 0).await.expect("read");
        assert_eq!(&buf[..n], b"a\0\0Z");
        assert_eq!(modifier.size().await.expect("size"), 4);
    }
}
