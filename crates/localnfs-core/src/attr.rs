//! File attributes: reading live metadata, applying client changes, and
//! access checks.

use std::fs::{self, FileType, Metadata, OpenOptions, Permissions};
use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;

use filetime::FileTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::error::{FsError, Result};
use crate::handle::{FileId, FileObjectIdentity};

/// Kind of a file object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Regular,
    Directory,
    Symlink,
    BlockDevice,
    CharDevice,
    Fifo,
    Socket,
}

impl From<FileType> for ObjectKind {
    fn from(ft: FileType) -> Self {
        if ft.is_dir() {
            Self::Directory
        } else if ft.is_symlink() {
            Self::Symlink
        } else if ft.is_block_device() {
            Self::BlockDevice
        } else if ft.is_char_device() {
            Self::CharDevice
        } else if ft.is_fifo() {
            Self::Fifo
        } else if ft.is_socket() {
            Self::Socket
        } else {
            Self::Regular
        }
    }
}

/// Seconds and nanoseconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: u32) -> Self {
        Self { seconds, nanos }
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn from_parts(seconds: i64, nanos: i64) -> Self {
        Self {
            seconds,
            nanos: nanos.clamp(0, 999_999_999) as u32,
        }
    }

    fn to_file_time(self) -> FileTime {
        FileTime::from_unix_time(self.seconds, self.nanos)
    }
}

/// Attribute record of a file object, read from the local filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attributes {
    pub kind: ObjectKind,
    pub file_id: FileId,
    pub size: u64,
    /// Bytes of storage actually allocated.
    pub used: u64,
    /// Permission bits including setuid, setgid and sticky.
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    /// Device numbers for block and character devices.
    pub rdev: (u32, u32),
    /// Identifier of the local filesystem holding the object.
    pub fsid: u64,
    pub atime: Timestamp,
    pub mtime: Timestamp,
    pub ctime: Timestamp,
}

impl Attributes {
    pub(crate) fn from_metadata(file_id: FileId, meta: &Metadata) -> Self {
        Self {
            kind: ObjectKind::from(meta.file_type()),
            file_id,
            size: meta.size(),
            used: meta.blocks().saturating_mul(512),
            mode: meta.mode() & 0o7777,
            nlink: meta.nlink(),
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: split_rdev(meta.rdev()),
            fsid: meta.dev(),
            atime: Timestamp::from_parts(meta.atime(), meta.atime_nsec()),
            mtime: Timestamp::from_parts(meta.mtime(), meta.mtime_nsec()),
            ctime: Timestamp::from_parts(meta.ctime(), meta.ctime_nsec()),
        }
    }
}

#[cfg(target_os = "linux")]
#[allow(clippy::cast_possible_truncation)]
fn split_rdev(rdev: u64) -> (u32, u32) {
    let major = ((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff);
    let minor = (rdev & 0xff) | ((rdev >> 12) & !0xff);
    (major as u32, minor as u32)
}

#[cfg(not(target_os = "linux"))]
#[allow(clippy::cast_possible_truncation)]
fn split_rdev(rdev: u64) -> (u32, u32) {
    (((rdev >> 24) & 0xff) as u32, (rdev & 0xff_ffff) as u32)
}

/// Read the current attributes of an object without following symlinks.
pub fn attributes_of(identity: &FileObjectIdentity) -> Result<Attributes> {
    let meta = fs::symlink_metadata(&identity.path)?;
    Ok(Attributes::from_metadata(identity.file_id, &meta))
}

/// How a timestamp should be set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetTime {
    ServerTime,
    ClientTime(Timestamp),
}

impl SetTime {
    fn resolve(self) -> FileTime {
        match self {
            Self::ServerTime => FileTime::now(),
            Self::ClientTime(ts) => ts.to_file_time(),
        }
    }
}

/// A set of attribute changes requested by a client. Absent fields are
/// left untouched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetAttributes {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<SetTime>,
    pub mtime: Option<SetTime>,
}

impl SetAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    #[must_use]
    pub fn owner(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }

    #[must_use]
    pub fn group(mut self, gid: u32) -> Self {
        self.gid = Some(gid);
        self
    }

    #[must_use]
    pub fn size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub fn atime(mut self, time: SetTime) -> Self {
        self.atime = Some(time);
        self
    }

    #[must_use]
    pub fn mtime(mut self, time: SetTime) -> Self {
        self.mtime = Some(time);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// The same request with the permission bits dropped.
    pub(crate) fn without_mode(mut self) -> Self {
        self.mode = None;
        self
    }
}

/// One field of a [`SetAttributes`] request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrField {
    Size,
    Mode,
    Uid,
    Gid,
    Atime,
    Mtime,
}

/// An attribute update that stopped part way through.
///
/// Fields are applied in the order size, mode, uid, gid, atime, mtime;
/// `applied` lists those that took effect before `failed` was rejected.
#[derive(Debug, Error)]
#[error("setattr failed on {failed:?} after applying {applied:?}: {source}")]
pub struct SetAttrError {
    pub applied: Vec<AttrField>,
    pub failed: AttrField,
    #[source]
    pub source: FsError,
}

/// Apply `changes` to a live object, field by field.
pub fn apply_attributes(
    identity: &FileObjectIdentity,
    changes: &SetAttributes,
) -> std::result::Result<(), SetAttrError> {
    let path = identity.path.as_path();
    let mut applied = Vec::new();
    let mut step = |field: AttrField, result: Result<()>| match result {
        Ok(()) => {
            applied.push(field);
            Ok(())
        }
        Err(source) => Err(SetAttrError {
            applied: applied.clone(),
            failed: field,
            source,
        }),
    };

    if let Some(size) = changes.size {
        step(AttrField::Size, truncate(identity, size))?;
    }
    if let Some(mode) = changes.mode {
        step(AttrField::Mode, chmod(identity, mode))?;
    }
    if let Some(uid) = changes.uid {
        step(
            AttrField::Uid,
            std::os::unix::fs::lchown(path, Some(uid), None).map_err(FsError::from),
        )?;
    }
    if let Some(gid) = changes.gid {
        step(
            AttrField::Gid,
            std::os::unix::fs::lchown(path, None, Some(gid)).map_err(FsError::from),
        )?;
    }
    if let Some(atime) = changes.atime {
        step(AttrField::Atime, set_time(identity, Some(atime), None))?;
    }
    if let Some(mtime) = changes.mtime {
        step(AttrField::Mtime, set_time(identity, None, Some(mtime)))?;
    }
    trace!(path = %path.display(), ?changes, "attributes applied");
    Ok(())
}

fn truncate(identity: &FileObjectIdentity, size: u64) -> Result<()> {
    identity.require_file()?;
    let file = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NOFOLLOW)
        .open(&identity.path)?;
    file.set_len(size)?;
    Ok(())
}

fn chmod(identity: &FileObjectIdentity, mode: u32) -> Result<()> {
    if identity.kind == ObjectKind::Symlink {
        return Err(FsError::Unsupported("mode on a symbolic link"));
    }
    fs::set_permissions(&identity.path, Permissions::from_mode(mode & 0o7777))?;
    Ok(())
}

fn set_time(
    identity: &FileObjectIdentity,
    atime: Option<SetTime>,
    mtime: Option<SetTime>,
) -> Result<()> {
    let path = identity.path.as_path();
    if identity.kind == ObjectKind::Symlink {
        // Symlinks only take both times at once; keep the untouched one.
        let meta = fs::symlink_metadata(path)?;
        let atime = atime.map_or_else(|| FileTime::from_last_access_time(&meta), SetTime::resolve);
        let mtime =
            mtime.map_or_else(|| FileTime::from_last_modification_time(&meta), SetTime::resolve);
        filetime::set_symlink_file_times(path, atime, mtime)?;
        return Ok(());
    }
    if let Some(atime) = atime {
        filetime::set_file_atime(path, atime.resolve())?;
    }
    if let Some(mtime) = mtime {
        filetime::set_file_mtime(path, mtime.resolve())?;
    }
    Ok(())
}

/// Set both times on a path that is known not to be a symlink.
pub(crate) fn set_times(path: &Path, atime: Timestamp, mtime: Timestamp) -> Result<()> {
    filetime::set_file_times(path, atime.to_file_time(), mtime.to_file_time())?;
    Ok(())
}

/// Access bits, numerically equal to the NFSv3 ACCESS mask.
pub mod access {
    pub const READ: u32 = 0x0001;
    pub const LOOKUP: u32 = 0x0002;
    pub const MODIFY: u32 = 0x0004;
    pub const EXTEND: u32 = 0x0008;
    pub const DELETE: u32 = 0x0010;
    pub const EXECUTE: u32 = 0x0020;

    pub const ALL: u32 = READ | LOOKUP | MODIFY | EXTEND | DELETE | EXECUTE;
    pub const MUTATING: u32 = MODIFY | EXTEND | DELETE;
}

/// Evaluate the permission bits of `attrs` for a caller and return the
/// subset of `requested` that is granted.
pub fn check_access(attrs: &Attributes, uid: u32, gids: &[u32], requested: u32) -> u32 {
    let is_dir = attrs.kind == ObjectKind::Directory;
    if uid == 0 {
        // Root still needs some execute bit to run a regular file.
        let mut granted = requested & access::ALL;
        if !is_dir && attrs.mode & 0o111 == 0 {
            granted &= !access::EXECUTE;
        }
        return granted;
    }

    let bits = if uid == attrs.uid {
        (attrs.mode >> 6) & 0o7
    } else if gids.contains(&attrs.gid) {
        (attrs.mode >> 3) & 0o7
    } else {
        attrs.mode & 0o7
    };

    let mut granted = 0;
    if bits & 0o4 != 0 {
        granted |= access::READ;
    }
    if bits & 0o2 != 0 {
        granted |= access::MODIFY | access::EXTEND;
        if is_dir {
            granted |= access::DELETE;
        }
    }
    if bits & 0o1 != 0 {
        granted |= if is_dir { access::LOOKUP } else { access::EXECUTE };
    }
    granted & requested
}

/// Capacity figures of the filesystem holding the export root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub avail_bytes: u64,
    pub total_files: u64,
    pub free_files: u64,
    pub avail_files: u64,
}

#[allow(clippy::unnecessary_cast, clippy::useless_conversion)]
pub(crate) fn fs_stats(path: &Path) -> Result<FsStats> {
    let stat = nix::sys::statvfs::statvfs(path)
        .map_err(|errno| FsError::from(std::io::Error::from(errno)))?;
    let fragment = stat.fragment_size() as u64;
    Ok(FsStats {
        total_bytes: (stat.blocks() as u64).saturating_mul(fragment),
        free_bytes: (stat.blocks_free() as u64).saturating_mul(fragment),
        avail_bytes: (stat.blocks_available() as u64).saturating_mul(fragment),
        total_files: stat.files() as u64,
        free_files: stat.files_free() as u64,
        avail_files: stat.files_available() as u64,
    })
}
