//! Namespace operations: lookup, paged listing, creation, removal, rename
//! and hard links.
//!
//! All functions take identities already resolved by the registry and keep
//! the registry in step with every change they make to the namespace.

use std::ffi::{OsStr, OsString};
use std::fs::{self, DirBuilder, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::attr::{self, Attributes, ObjectKind, SetAttributes, Timestamp};
use crate::error::{FsError, Result};
use crate::handle::{FileHandle, FileId, FileObjectIdentity};
use crate::name::{is_dot_entry, is_plain_component, validate_lookup_name, validate_name};
use crate::registry::HandleRegistry;

/// Position in a directory listing.
///
/// A cursor remembers the last name returned; the next page starts with
/// the first name that sorts after it byte-wise. Entries created or removed
/// between pages are therefore neither skipped nor repeated if they sort
/// after the cursor, and a removed cursor name does not invalidate it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirCursor {
    dir: FileId,
    after: Option<OsString>,
}

impl DirCursor {
    /// Cursor at the start of directory `dir`.
    pub fn start(dir: FileId) -> Self {
        Self { dir, after: None }
    }

    pub(crate) fn after(dir: FileId, name: OsString) -> Self {
        Self {
            dir,
            after: Some(name),
        }
    }

    pub fn dir(&self) -> FileId {
        self.dir
    }

    /// Last name returned before this cursor, if any.
    pub fn last_name(&self) -> Option<&OsStr> {
        self.after.as_deref()
    }

    /// Opaque wire form: the directory id followed by the raw name.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.dir.to_be_bytes().to_vec();
        if let Some(name) = &self.after {
            bytes.extend_from_slice(name.as_bytes());
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(FsError::BadCursor);
        }
        let (id, name) = bytes.split_at(8);
        let mut word = [0u8; 8];
        word.copy_from_slice(id);
        let dir = u64::from_be_bytes(word);
        if name.is_empty() {
            return Ok(Self::start(dir));
        }
        if !is_plain_component(name) && name != b"." && name != b".." {
            return Err(FsError::BadCursor);
        }
        Ok(Self::after(dir, OsStr::from_bytes(name).to_owned()))
    }
}

/// One entry of a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: OsString,
    pub handle: FileHandle,
    pub attributes: Attributes,
}

/// A page of directory entries. `next` is `None` once the listing is
/// complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPage {
    pub entries: Vec<DirEntry>,
    pub next: Option<DirCursor>,
}

/// How `create` treats an existing entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    /// Create only if absent.
    Guarded,
    /// Create if absent, otherwise open the existing file and apply the
    /// requested attributes.
    Unchecked,
    /// Create if absent, otherwise truncate the existing file.
    Truncate,
    /// Create only if absent, remembering a client verifier so that a
    /// retransmitted request succeeds instead of reporting `AlreadyExists`.
    Exclusive(CreateVerifier),
}

pub type CreateVerifier = [u8; 8];

pub(crate) fn lookup(
    registry: &HandleRegistry,
    dir: &FileObjectIdentity,
    name: &OsStr,
) -> Result<(FileHandle, Attributes)> {
    dir.require_dir()?;
    validate_lookup_name(name)?;
    match name.as_bytes() {
        b"." => {
            let handle = registry.handle_for(dir)?;
            Ok((handle, attr::attributes_of(dir)?))
        }
        b".." => parent_entry(registry, dir),
        _ => {
            let path = dir.path.join(name);
            let meta = fs::symlink_metadata(&path)?;
            let handle = registry.register(dir.file_id, name, &path, &meta);
            Ok((handle, Attributes::from_metadata(handle.file_id(), &meta)))
        }
    }
}

fn parent_entry(
    registry: &HandleRegistry,
    dir: &FileObjectIdentity,
) -> Result<(FileHandle, Attributes)> {
    let parent_path = if dir.file_id == registry.root_id() {
        registry.root()
    } else {
        dir.path.parent().unwrap_or(registry.root())
    };
    let meta = fs::symlink_metadata(parent_path)?;

    let known = registry
        .parent_of(dir.file_id)
        .and_then(|parent| registry.handle_of(parent));
    let handle = match known {
        Some(handle) => handle,
        None => registry.handle_for_path(parent_path)?,
    };
    Ok((handle, Attributes::from_metadata(handle.file_id(), &meta)))
}

pub(crate) fn list(
    registry: &HandleRegistry,
    dir: &FileObjectIdentity,
    cursor: Option<&DirCursor>,
    limit: usize,
    include_dots: bool,
) -> Result<ListPage> {
    dir.require_dir()?;
    if limit == 0 {
        return Err(FsError::InvalidArgument("listing limit must be positive"));
    }
    if let Some(cursor) = cursor
        && cursor.dir != dir.file_id
    {
        return Err(FsError::BadCursor);
    }
    let after = cursor.and_then(DirCursor::last_name);

    let mut names = fs::read_dir(&dir.path)?
        .map(|entry| entry.map(|e| e.file_name()))
        .collect::<io::Result<Vec<OsString>>>()?;
    let real_after = after.filter(|name| !is_dot_entry(name));
    if let Some(after) = real_after {
        names.retain(|name| name.as_bytes() > after.as_bytes());
    }
    names.sort_unstable_by(|a, b| a.as_bytes().cmp(b.as_bytes()));

    let dots: &[&str] = match after.map(OsStrExt::as_bytes) {
        _ if !include_dots => &[],
        None => &[".", ".."],
        Some(b".") => &[".."],
        Some(_) => &[],
    };

    let mut entries = Vec::with_capacity(limit.min(dots.len() + names.len()));
    let mut last: Option<OsString> = None;

    for dot in dots {
        if entries.len() == limit {
            return Ok(page(dir.file_id, entries, last, true));
        }
        let name = OsStr::new(dot);
        let (handle, attributes) = lookup(registry, dir, name)?;
        entries.push(DirEntry {
            name: name.to_owned(),
            handle,
            attributes,
        });
        last = Some(name.to_owned());
    }

    let room = limit - entries.len();
    let more = names.len() > room;
    for name in names.into_iter().take(room) {
        let path = dir.path.join(&name);
        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            // Removed since read_dir; the cursor still moves past it.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                last = Some(name);
                continue;
            }
            Err(e) => return Err(e.into()),
        };
        let handle = registry.register(dir.file_id, &name, &path, &meta);
        entries.push(DirEntry {
            attributes: Attributes::from_metadata(handle.file_id(), &meta),
            handle,
            name: name.clone(),
        });
        last = Some(name);
    }
    Ok(page(dir.file_id, entries, last, more))
}

fn page(dir: FileId, entries: Vec<DirEntry>, last: Option<OsString>, more: bool) -> ListPage {
    let next = if more {
        last.map(|name| DirCursor::after(dir, name))
    } else {
        None
    };
    ListPage { entries, next }
}

/// Identity used to apply attributes to an object that is not registered
/// yet.
fn unregistered(path: &Path, kind: ObjectKind) -> FileObjectIdentity {
    FileObjectIdentity {
        file_id: 0,
        generation: 0,
        kind,
        path: path.to_path_buf(),
    }
}

pub(crate) fn create(
    registry: &HandleRegistry,
    dir: &FileObjectIdentity,
    name: &OsStr,
    attrs: &SetAttributes,
    mode: CreateMode,
) -> Result<FileHandle> {
    dir.require_dir()?;
    validate_name(name)?;
    let path = dir.path.join(name);

    let mut options = OpenOptions::new();
    options
        .write(true)
        .mode(attrs.mode.unwrap_or(0o644) & 0o7777)
        .custom_flags(libc::O_NOFOLLOW);
    // Only a file made by this call is discarded when attributes fail.
    let opened = match options.clone().create_new(true).open(&path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => match mode {
            CreateMode::Guarded => return Err(FsError::AlreadyExists),
            CreateMode::Exclusive(verifier) => {
                return exclusive_retry(registry, dir, name, &path, verifier);
            }
            CreateMode::Unchecked => options.open(&path).map(|_| false),
            CreateMode::Truncate => options.truncate(true).open(&path).map(|_| false),
        },
        Err(e) => Err(e),
    };
    let fresh = opened?;

    let identity = unregistered(&path, ObjectKind::Regular);
    let result = match mode {
        CreateMode::Exclusive(verifier) => {
            let (atime, mtime) = verifier_times(verifier);
            let owner = SetAttributes {
                atime: None,
                mtime: None,
                size: None,
                ..*attrs
            };
            attr::apply_attributes(&identity, &owner)
                .map_err(FsError::from)
                .and_then(|()| attr::set_times(&path, atime, mtime))
        }
        _ => attr::apply_attributes(&identity, attrs).map_err(FsError::from),
    };
    if let Err(e) = result {
        if fresh {
            discard(&path, false);
        }
        return Err(e);
    }

    let meta = fs::symlink_metadata(&path)?;
    debug!(path = %path.display(), ?mode, "created file");
    Ok(registry.register(dir.file_id, name, &path, &meta))
}

fn exclusive_retry(
    registry: &HandleRegistry,
    dir: &FileObjectIdentity,
    name: &OsStr,
    path: &Path,
    verifier: CreateVerifier,
) -> Result<FileHandle> {
    let meta = fs::symlink_metadata(path)?;
    let (atime, mtime) = verifier_times(verifier);
    if meta.is_file() && meta.atime() == atime.seconds && meta.mtime() == mtime.seconds {
        debug!(path = %path.display(), "exclusive create retransmission");
        return Ok(registry.register(dir.file_id, name, path, &meta));
    }
    Err(FsError::AlreadyExists)
}

/// The verifier is kept in the seconds of atime and mtime.
fn verifier_times(verifier: CreateVerifier) -> (Timestamp, Timestamp) {
    let [a0, a1, a2, a3, m0, m1, m2, m3] = verifier;
    (
        Timestamp::new(i64::from(u32::from_be_bytes([a0, a1, a2, a3])), 0),
        Timestamp::new(i64::from(u32::from_be_bytes([m0, m1, m2, m3])), 0),
    )
}

fn discard(path: &Path, is_dir: bool) {
    let result = if is_dir {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    };
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "failed to roll back partially created object");
    }
}

pub(crate) fn mkdir(
    registry: &HandleRegistry,
    dir: &FileObjectIdentity,
    name: &OsStr,
    attrs: &SetAttributes,
) -> Result<FileHandle> {
    dir.require_dir()?;
    validate_name(name)?;
    let path = dir.path.join(name);

    DirBuilder::new()
        .mode(attrs.mode.unwrap_or(0o755) & 0o7777)
        .create(&path)?;

    let changes = SetAttributes {
        size: None,
        ..*attrs
    };
    if let Err(e) = attr::apply_attributes(&unregistered(&path, ObjectKind::Directory), &changes) {
        discard(&path, true);
        return Err(e.into());
    }

    let meta = fs::symlink_metadata(&path)?;
    debug!(path = %path.display(), "created directory");
    Ok(registry.register(dir.file_id, name, &path, &meta))
}

pub(crate) fn symlink(
    registry: &HandleRegistry,
    dir: &FileObjectIdentity,
    name: &OsStr,
    target: &Path,
    attrs: &SetAttributes,
) -> Result<FileHandle> {
    dir.require_dir()?;
    validate_name(name)?;
    if target.as_os_str().is_empty() {
        return Err(FsError::InvalidArgument("empty symbolic link target"));
    }
    let path = dir.path.join(name);

    std::os::unix::fs::symlink(target, &path)?;

    let changes = SetAttributes {
        size: None,
        ..attrs.without_mode()
    };
    if let Err(e) = attr::apply_attributes(&unregistered(&path, ObjectKind::Symlink), &changes) {
        discard(&path, false);
        return Err(e.into());
    }

    let meta = fs::symlink_metadata(&path)?;
    Ok(registry.register(dir.file_id, name, &path, &meta))
}

pub(crate) fn readlink(identity: &FileObjectIdentity) -> Result<PathBuf> {
    if identity.kind != ObjectKind::Symlink {
        return Err(FsError::NotASymlink);
    }
    Ok(fs::read_link(&identity.path)?)
}

/// Remove a non-directory entry. Returns the file id of the removed link.
pub(crate) fn remove(
    registry: &HandleRegistry,
    dir: &FileObjectIdentity,
    name: &OsStr,
) -> Result<FileId> {
    dir.require_dir()?;
    validate_name(name)?;
    let path = dir.path.join(name);
    let meta = fs::symlink_metadata(&path)?;
    if meta.is_dir() {
        return Err(FsError::IsADirectory);
    }
    fs::remove_file(&path)?;
    debug!(path = %path.display(), "removed file");
    Ok(registry.forget_link(dir.file_id, name, &meta, meta.nlink() <= 1))
}

pub(crate) fn rmdir(
    registry: &HandleRegistry,
    dir: &FileObjectIdentity,
    name: &OsStr,
) -> Result<FileId> {
    dir.require_dir()?;
    validate_name(name)?;
    let path = dir.path.join(name);
    let meta = fs::symlink_metadata(&path)?;
    if !meta.is_dir() {
        return Err(FsError::NotADirectory);
    }
    fs::remove_dir(&path).map_err(|e| match e.raw_os_error() {
        Some(libc::EEXIST) => FsError::NotEmpty,
        _ => FsError::from(e),
    })?;
    debug!(path = %path.display(), "removed directory");
    Ok(registry.forget_link(dir.file_id, name, &meta, true))
}

/// Rename `src_name` in `src_dir` to `dst_name` in `dst_dir`, replacing a
/// compatible target. Returns the file id of the replaced target, if any.
pub(crate) fn rename(
    registry: &HandleRegistry,
    src_dir: &FileObjectIdentity,
    src_name: &OsStr,
    dst_dir: &FileObjectIdentity,
    dst_name: &OsStr,
) -> Result<Option<FileId>> {
    src_dir.require_dir()?;
    dst_dir.require_dir()?;
    validate_name(src_name)?;
    validate_name(dst_name)?;

    let from = src_dir.path.join(src_name);
    let to = dst_dir.path.join(dst_name);
    let src_meta = fs::symlink_metadata(&from)?;
    let dst_meta = match fs::symlink_metadata(&to) {
        Ok(meta) => Some(meta),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    if let Some(dst) = &dst_meta {
        if dst.dev() == src_meta.dev() && dst.ino() == src_meta.ino() {
            return Ok(None);
        }
        if dst.is_dir() != src_meta.is_dir() {
            return Err(FsError::AlreadyExists);
        }
    }
    if src_meta.is_dir() && dst_dir.path.starts_with(&from) {
        return Err(FsError::InvalidArgument("cannot move a directory into itself"));
    }

    fs::rename(&from, &to).map_err(|e| match e.raw_os_error() {
        Some(libc::EEXIST) => FsError::NotEmpty,
        _ => FsError::from(e),
    })?;

    let replaced = dst_meta.map(|dst| {
        let last = dst.is_dir() || dst.nlink() <= 1;
        registry.forget_link(dst_dir.file_id, dst_name, &dst, last)
    });
    let moved = fs::symlink_metadata(&to)?;
    registry.relink(src_dir.file_id, src_name, dst_dir.file_id, dst_name, &to, &moved);
    debug!(from = %from.display(), to = %to.display(), "renamed");
    Ok(replaced)
}

pub(crate) fn link(
    registry: &HandleRegistry,
    dir: &FileObjectIdentity,
    name: &OsStr,
    target: &FileObjectIdentity,
) -> Result<FileHandle> {
    dir.require_dir()?;
    validate_name(name)?;
    if target.is_dir() {
        return Err(FsError::IsADirectory);
    }
    let dir_meta = fs::symlink_metadata(&dir.path)?;
    let target_meta = fs::symlink_metadata(&target.path)?;
    if dir_meta.dev() != target_meta.dev() {
        return Err(FsError::CrossDevice);
    }

    let path = dir.path.join(name);
    fs::hard_link(&target.path, &path)?;
    let meta = fs::symlink_metadata(&path)?;
    Ok(registry.register(dir.file_id, name, &path, &meta))
}
