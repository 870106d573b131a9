// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use super::{seek_position, FileIo};
use crate::backend::{FdFlags, TreeFile};
use crate::error::{FsError, FsResult};
use crate::names::KeyRoot;
use crate::types::Whence;
use async_trait::async_trait;
use std::sync::Arc;

/// File inside a mutable tree.
///
/// The tree's descriptors are single-writer, so instead of holding one for
/// the handle's lifetime every call opens a short-lived descriptor on the
/// shared file object. Sibling handles therefore always see the latest
/// content.
pub struct MutableTreeFile {
    file: Arc<dyn TreeFile>,
    writable: bool,
    cursor: u64,
    /// Set when the tree belongs to a named key that must be republished.
    key: Option<Arc<KeyRoot>>,
}

impl MutableTreeFile {
    pub fn new(file: Arc<dyn TreeFile>, writable: bool, key: Option<Arc<KeyRoot>>) -> Self {
        Self {
            file,
            writable,
            cursor: 0,
            key,
        }
    }

    fn touch(&self) {
        if let Some(key) = &self.key {
            key.touch();
        }
    }

    fn write_flags(&self) -> FsResult<FdFlags> {
        if !self.writable {
            return Err(FsError::BadHandle);
        }
        Ok(FdFlags {
            read: false,
            write: true,
        })
    }
}

#[async_trait]
impl FileIo for MutableTreeFile {
    async fn read(&mut self, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        let mut fd = self
            .file
            .open(FdFlags {
                read: true,
                write: false,
            })
            .await?;
        let result = fd.read_at(buf, offset).await;
        fd.close().await?;
        let n = result?;
        self.cursor = offset + n as u64;
        Ok(n)
    }

    async fn write(&mut self, buf: &[u8], offset: u64) -> FsResult<usize> {
        let mut fd = self.file.open(self.write_flags()?).await?;
        let result = fd.write_at(buf, offset).await;
        fd.close().await?;
        let n = result?;
        self.cursor = offset + n as u64;
        self.touch();
        Ok(n)
    }

    async fn seek(&mut self, offset: i64, whence: Whence) -> FsResult<u64> {
        let size = self.file.size().await?;
        self.cursor = seek_position(self.cursor, size, offset, whence)?;
        Ok(self.cursor)
    }

    async fn size(&mut self) -> FsResult<u64> {
        self.file.size().await
    }

    async fn truncate(&mut self, size: u64) -> FsResult<()> {
        let mut fd = self.file.open(self.write_flags()?).await?;
        let result = fd.truncate(size).await;
        fd.close().await?;
        result?;
        self.touch();
        Ok(())
    }

    async fn sync(&mut self) -> FsResult<()> {
        let cid = self.file.flush().await?;
        tracing::trace!(%cid, "flushed tree file");
        self.touch();
        Ok(())
    }

    async fn close(&mut self) -> FsResult<()> {
        Ok(())
    }
}
