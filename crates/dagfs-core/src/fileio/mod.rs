// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-backend file IO adapters bound to open handles

mod immutable;
mod named;
mod tree;

pub use immutable::ImmutableFile;
pub use named::{DagModifier, NamedFile};
pub use tree::MutableTreeFile;

use crate::error::{FsError, FsResult};
use crate::types::Whence;
use async_trait::async_trait;

/// IO object behind a file handle.
///
/// Reads and writes take explicit offsets; `seek` moves the cursor used by
/// callers that do not track one themselves.
#[async_trait]
pub trait FileIo: Send + Sync {
    async fn read(&mut self, buf: &mut [u8], offset: u64) -> FsResult<usize>;

    async fn write(&mut self, buf: &[u8], offset: u64) -> FsResult<usize>;

    async fn seek(&mut self, offset: i64, whence: Whence) -> FsResult<u64>;

    async fn size(&mut self) -> FsResult<u64>;

    async fn truncate(&mut self, size: u64) -> FsResult<()>;

    async fn sync(&mut self) -> FsResult<()>;

    async fn close(&mut self) -> FsResult<()>;
}

/// New cursor position for a seek request.
///
/// Seeking relative to the end only accepts non-positive offsets.
pub(crate) fn seek_position(cursor: u64, size: u64, offset: i64, whence: Whence) -> FsResult<u64> {
    let base = match whence {
        Whence::Start => 0,
        Whence::Current => cursor,
        Whence::End => {
            if offset > 0 {
                return Err(FsError::InvalidArgument);
            }
            size
        }
    };
    base.checked_add_signed(offset).ok_or(FsError::InvalidArgument)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seek_rules() {
        assert_eq!(seek_position(3, 10, 4, Whence::Start), Ok(4));
        assert_eq!(seek_position(3, 10, 4, Whence::Current), Ok(7));
        assert_eq!(seek_position(3, 10, -2, Whence::End), Ok(8));
        assert_eq!(seek_position(3, 10, 20, Whence::Start), Ok(20));
        assert_eq!(seek_position(3, 10, 1, Whence::End), Err(FsError::InvalidArgument));
        assert_eq!(seek_position(3, 10, -4, Whence::Current), Err(FsError::InvalidArgument));
    }
}
