//! Error mapping for NFS operations.
//!
//! Every adapter failure is classified by [`FsErrorKind`] and converted to
//! the matching NFSv3 status code here, so no `io::Error` reaches the wire.

use localnfs_core::{FsError, FsErrorKind};
use nfsserve::nfs::nfsstat3;

/// Converts an adapter error kind to an NFS status code.
#[inline]
pub fn kind_to_nfsstat(kind: FsErrorKind) -> nfsstat3 {
    match kind {
        FsErrorKind::NotFound => nfsstat3::NFS3ERR_NOENT,
        FsErrorKind::StaleHandle => nfsstat3::NFS3ERR_STALE,
        FsErrorKind::BadHandle => nfsstat3::NFS3ERR_BADHANDLE,
        FsErrorKind::AlreadyExists => nfsstat3::NFS3ERR_EXIST,
        FsErrorKind::NotEmpty => nfsstat3::NFS3ERR_NOTEMPTY,
        FsErrorKind::NotADirectory => nfsstat3::NFS3ERR_NOTDIR,
        FsErrorKind::IsADirectory => nfsstat3::NFS3ERR_ISDIR,
        FsErrorKind::NotAFile
        | FsErrorKind::NotASymlink
        | FsErrorKind::InvalidName
        | FsErrorKind::InvalidArgument => nfsstat3::NFS3ERR_INVAL,
        FsErrorKind::BadCursor => nfsstat3::NFS3ERR_BAD_COOKIE,
        FsErrorKind::PermissionDenied | FsErrorKind::AccessDenied => nfsstat3::NFS3ERR_ACCES,
        FsErrorKind::ReadOnly => nfsstat3::NFS3ERR_ROFS,
        FsErrorKind::CrossDevice => nfsstat3::NFS3ERR_XDEV,
        FsErrorKind::NoSpace => nfsstat3::NFS3ERR_NOSPC,
        FsErrorKind::NameTooLong => nfsstat3::NFS3ERR_NAMETOOLONG,
        FsErrorKind::Unsupported => nfsstat3::NFS3ERR_NOTSUPP,
        FsErrorKind::Io => nfsstat3::NFS3ERR_IO,
    }
}

/// Converts an adapter error to an NFS status code.
///
/// A failed attribute update reports the status of the field that failed.
#[inline]
pub fn fs_error_to_nfsstat(e: &FsError) -> nfsstat3 {
    kind_to_nfsstat(e.kind())
}
