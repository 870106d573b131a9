// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for DagFS Core

use std::io;

/// Core filesystem error type.
///
/// Backends report errors in this type as well, so failures flow through the
/// core unchanged and are converted to an errno only at the kernel boundary.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("access denied")]
    AccessDenied,
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("invalid argument")]
    InvalidArgument,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("read-only section")]
    ReadOnlySection,
    #[error("wrong io type for handle")]
    WrongIoType,
    #[error("key not owned locally: {0}")]
    NoKey(String),
    #[error("node metadata not initialized")]
    NotInitialized,
    #[error("unexpected: {0}")]
    Unexpected(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("interrupted")]
    Interrupted,
    #[error("too many open files")]
    HandleExhausted,
    #[error("indirection chain too deep")]
    RecursionLimit,
    #[error("is a directory")]
    IsADirectory,
    #[error("not a directory")]
    NotADirectory,
    #[error("refusing to follow symlink")]
    SymlinkLoop,
    #[error("bad file descriptor")]
    BadHandle,
    #[error("directory not empty")]
    NotEmpty,
    #[error("unsupported")]
    NotSupported,
    #[error("buffer too small")]
    RangeTooSmall,
    #[error("cross-namespace operation")]
    CrossNamespace,
    #[error("file too large")]
    FileTooLarge,
}

impl FsError {
    /// Errno value handed back to the kernel for this error.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::AccessDenied => libc::EACCES,
            FsError::InvalidPath(_) => libc::ENOENT,
            FsError::InvalidArgument => libc::EINVAL,
            FsError::InvalidConfig(_) => libc::EINVAL,
            FsError::ReadOnlySection => libc::EROFS,
            FsError::WrongIoType => libc::EINVAL,
            FsError::NoKey(_) => libc::ENOENT,
            FsError::NotInitialized => libc::EIO,
            FsError::Unexpected(_) => libc::EIO,
            FsError::Io(_) => libc::EIO,
            FsError::Interrupted => libc::EINTR,
            FsError::HandleExhausted => libc::ENFILE,
            FsError::RecursionLimit => libc::ELOOP,
            FsError::IsADirectory => libc::EISDIR,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::SymlinkLoop => libc::ELOOP,
            FsError::BadHandle => libc::EBADF,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::NotSupported => libc::ENOSYS,
            FsError::RangeTooSmall => libc::ERANGE,
            FsError::CrossNamespace => libc::EXDEV,
            FsError::FileTooLarge => libc::EFBIG,
        }
    }

    pub fn io(msg: impl Into<String>) -> Self {
        FsError::Io(msg.into())
    }
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => FsError::NotFound,
            io::ErrorKind::AlreadyExists => FsError::AlreadyExists,
            io::ErrorKind::PermissionDenied => FsError::AccessDenied,
            io::ErrorKind::Interrupted => FsError::Interrupted,
            _ => FsError::Io(err.to_string()),
        }
    }
}

impl From<nix::errno::Errno> for FsError {
    fn from(errno: nix::errno::Errno) -> Self {
        FsError::from(io::Error::from(errno))
    }
}

pub type FsResult<T> = Result<T, FsError>;
