// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use super::{seek_position, FileIo};
use crate::backend::{DagReader, DagService};
use crate::error::{FsError, FsResult};
use crate::types::Whence;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Read-only file backed by a streaming DAG reader.
pub struct ImmutableFile {
    dag: Arc<dyn DagService>,
    path: String,
    reader: Box<dyn DagReader>,
    cursor: u64,
    /// Per-attempt budget; one refetch is allowed when it runs out.
    attempt_timeout: Duration,
}

impl ImmutableFile {
    pub async fn open(
        dag: Arc<dyn DagService>,
        path: &str,
        attempt_timeout: Duration,
    ) -> FsResult<Self> {
        let reader = dag.fetch_file(path).await?;
        Ok(Self {
            dag,
            path: path.to_string(),
            reader,
            cursor: 0,
            attempt_timeout,
        })
    }

    async fn read_attempt(&mut self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        self.reader.seek(offset).await?;
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.reader.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

#[async_trait]
impl FileIo for ImmutableFile {
    async fn read(&mut self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        if offset >= self.reader.size() || buf.is_empty() {
            return Ok(0);
        }
        let n = match tokio::time::timeout(self.attempt_timeout, self.read_attempt(buf, offset))
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                tracing::warn!(path = %self.path, offset, "dag read timed out, refetching");
                self.reader = self.dag.fetch_file(&self.path).await?;
                tokio::time::timeout(self.attempt_timeout, self.read_attempt(buf, offset))
                    .await
                    .map_err(|_| FsError::io(format!("read of {} timed out", self.path)))??
            }
        };
        self.cursor = offset + n as u64;
        Ok(n)
    }

    async fn write(&mut self, _buf: &[u8], _offset: u64) -> FsResult<usize> {
        Err(FsError::ReadOnlySection)
    }

    async fn seek(&mut self, offset: i64, whence: Whence) -> FsResult<u64> {
        self.cursor = seek_position(self.cursor, self.reader.size(), offset, whence)?;
        Ok(self.cursor)
    }

    async fn size(&mut self) -> FsResult<u64> {
        Ok(self.reader.size())
    }

    async fn truncate(&mut self, _size: u64) -> FsResult<()> {
        Err(FsError::ReadOnlySection)
    }

    async fn sync(&mut self) -> FsResult<()> {
        Err(FsError::ReadOnlySection)
    }

    async fn close(&mut self) -> FsResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{FaultOp, FaultPolicy, FaultRule};
    use crate::memory::MemoryDag;

    async fn open(dag: &Arc<MemoryDag>, data: &[u8]) -> ImmutableFile {
        let cid = dag.insert_file(data);
        ImmutableFile::open(dag.clone(), &format!("/{cid}"), Duration::from_millis(50))
            .await
            .expect("open")
    }

    #[tokio::test]
    async fn random_access_reads() {
        let dag = Arc::new(MemoryDag::new());
        let mut file = open(&dag, b"hello, world").await;
        let mut buf = [0u8; 5];
        assert_eq!(file.read(&mut buf, 7).await.expect("read"), 5);
        assert_eq!(&buf, b"world");
        assert_eq!(file.read(&mut buf, 0).await.expect("read"), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(file.read(&mut buf, 12).await.expect("read at size"), 0);
        assert_eq!(file.read(&mut buf, 99).await.expect("read past size"), 0);
    }

    #[tokio::test]
    async fn seek_past_end_then_read_is_empty() {
        let dag = Arc::new(MemoryDag::new());
        let mut file = open(&dag, b"abc").await;
        let pos = file.seek(10, Whence::Start).await.expect("seek");
        let mut buf = [0u8; 4];
        assert_eq!(file.read(&mut buf, pos).await.expect("read"), 0);
        assert_eq!(file.seek(1, Whence::End).await, Err(FsError::InvalidArgument));
    }

    #[tokio::test]
    async fn mutations_are_read_only() {
        let dag = Arc::new(MemoryDag::new());
        let mut file = open(&dag, b"abc").await;
        assert_eq!(file.write(b"x", 0).await, Err(FsError::ReadOnlySection));
        assert_eq!(file.truncate(0).await, Err(FsError::ReadOnlySection));
        assert_eq!(file.sync().await, Err(FsError::ReadOnlySection));
    }

    #[tokio::test]
    async fn a_timed_out_read_is_retried_once() {
        let dag = Arc::new(MemoryDag::new());
        let mut file = open(&dag, b"abc").await;
        dag.faults().set_policy(FaultPolicy::single(FaultRule {
            max_faults: Some(1),
            ..FaultRule::stall(FaultOp::Read)
        }));
        let mut buf = [0u8; 3];
        assert_eq!(file.read(&mut buf, 0).await.expect("retried read"), 3);
        assert_eq!(&buf, b"abc");
    }

    #[tokio::test]
    async fn backend_failures_surface_as_io_errors() {
        let dag = Arc::new(MemoryDag::new());
        let mut file = open(&dag, b"abc").await;
        dag.faults().set_policy(FaultPolicy::single(FaultRule::fail(FaultOp::Read)));
        let mut buf = [0u8; 3];
        assert!(matches!(file.read(&mut buf, 0).await, Err(FsError::Io(_))));
    }
}
