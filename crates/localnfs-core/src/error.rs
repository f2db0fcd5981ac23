//! Error taxonomy for the local filesystem adapter.
//!
//! Every operation returns [`FsError`]. Protocol bindings never inspect the
//! variants directly; they classify through [`FsError::kind`] and translate
//! the resulting [`FsErrorKind`] into their own status codes.

use std::ffi::OsString;
use std::io;

use thiserror::Error;

use crate::attr::SetAttrError;

/// Result alias used throughout the adapter.
pub type Result<T, E = FsError> = std::result::Result<T, E>;

/// Errors produced by the adapter.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory")]
    NotFound,

    /// The handle was issued by this adapter but its object is gone, was
    /// replaced, or belongs to a previous incarnation of the server.
    #[error("stale file handle")]
    StaleHandle,

    /// The handle bytes cannot be decoded at all.
    #[error("malformed file handle")]
    BadHandle,

    #[error("file exists")]
    AlreadyExists,

    #[error("directory not empty")]
    NotEmpty,

    #[error("not a directory")]
    NotADirectory,

    #[error("not a regular file")]
    NotAFile,

    #[error("is a directory")]
    IsADirectory,

    #[error("not a symbolic link")]
    NotASymlink,

    #[error("invalid name {0:?}")]
    InvalidName(OsString),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The directory cursor is malformed or belongs to another directory.
    #[error("invalid directory cursor")]
    BadCursor,

    /// The local filesystem refused the operation for the server's identity.
    #[error("permission denied")]
    PermissionDenied,

    /// The request would reach outside the exported subtree.
    #[error("access denied: {0}")]
    AccessDenied(String),

    #[error("export is read-only")]
    ReadOnly,

    #[error("cross-device link")]
    CrossDevice,

    #[error("no space left on device")]
    NoSpace,

    #[error("file name too long")]
    NameTooLong,

    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// An attribute update stopped part way through.
    #[error(transparent)]
    SetAttr(Box<SetAttrError>),

    #[error("I/O error: {0}")]
    Io(#[source] io::Error),
}

/// Coarse classification of [`FsError`], stable across error payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FsErrorKind {
    NotFound,
    StaleHandle,
    BadHandle,
    AlreadyExists,
    NotEmpty,
    NotADirectory,
    NotAFile,
    IsADirectory,
    NotASymlink,
    InvalidName,
    InvalidArgument,
    BadCursor,
    PermissionDenied,
    AccessDenied,
    ReadOnly,
    CrossDevice,
    NoSpace,
    NameTooLong,
    Unsupported,
    Io,
}

impl FsError {
    /// Classify this error. A partial attribute update reports the kind of
    /// the failure that interrupted it.
    pub fn kind(&self) -> FsErrorKind {
        match self {
            Self::NotFound => FsErrorKind::NotFound,
            Self::StaleHandle => FsErrorKind::StaleHandle,
            Self::BadHandle => FsErrorKind::BadHandle,
            Self::AlreadyExists => FsErrorKind::AlreadyExists,
            Self::NotEmpty => FsErrorKind::NotEmpty,
            Self::NotADirectory => FsErrorKind::NotADirectory,
            Self::NotAFile => FsErrorKind::NotAFile,
            Self::IsADirectory => FsErrorKind::IsADirectory,
            Self::NotASymlink => FsErrorKind::NotASymlink,
            Self::InvalidName(_) => FsErrorKind::InvalidName,
            Self::InvalidArgument(_) => FsErrorKind::InvalidArgument,
            Self::BadCursor => FsErrorKind::BadCursor,
            Self::PermissionDenied => FsErrorKind::PermissionDenied,
            Self::AccessDenied(_) => FsErrorKind::AccessDenied,
            Self::ReadOnly => FsErrorKind::ReadOnly,
            Self::CrossDevice => FsErrorKind::CrossDevice,
            Self::NoSpace => FsErrorKind::NoSpace,
            Self::NameTooLong => FsErrorKind::NameTooLong,
            Self::Unsupported(_) => FsErrorKind::Unsupported,
            Self::SetAttr(e) => e.source.kind(),
            Self::Io(_) => FsErrorKind::Io,
        }
    }

    /// Whether a client may reasonably retry the same request.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), FsErrorKind::Io | FsErrorKind::NoSpace)
    }
}

impl From<io::Error> for FsError {
    fn from(e: io::Error) -> Self {
        if let Some(code) = e.raw_os_error() {
            match code {
                libc::ENOENT => return Self::NotFound,
                libc::EEXIST => return Self::AlreadyExists,
                libc::ENOTEMPTY => return Self::NotEmpty,
                libc::ENOTDIR => return Self::NotADirectory,
                libc::EISDIR => return Self::IsADirectory,
                libc::EACCES | libc::EPERM => return Self::PermissionDenied,
                libc::EROFS => return Self::ReadOnly,
                libc::EXDEV => return Self::CrossDevice,
                libc::ENOSPC | libc::EDQUOT => return Self::NoSpace,
                libc::ENAMETOOLONG => return Self::NameTooLong,
                libc::ESTALE => return Self::StaleHandle,
                // O_NOFOLLOW on a symlink.
                libc::ELOOP => return Self::NotAFile,
                libc::EINVAL => return Self::InvalidArgument("rejected by local storage"),
                libc::ENOTSUP => return Self::Unsupported("rejected by local storage"),
                _ => {}
            }
        }
        match e.kind() {
            io::ErrorKind::NotFound => Self::NotFound,
            io::ErrorKind::AlreadyExists => Self::AlreadyExists,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::Unsupported => Self::Unsupported("rejected by local storage"),
            _ => Self::Io(e),
        }
    }
}

impl From<SetAttrError> for FsError {
    fn from(e: SetAttrError) -> Self {
        Self::SetAttr(Box::new(e))
    }
}
