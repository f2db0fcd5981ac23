//! NFS filesystem implementation over a local directory tree.
//!
//! This module implements the `NFSFileSystem` trait from `nfsserve` on top of
//! [`LocalFs`]. nfsserve addresses objects by `fileid3`; the binding uses the
//! adapter's file ids for those and overrides `id_to_fh`/`fh_to_id` so that
//! the handles on the wire are the adapter's own generation-checked handles.
//!
//! # Write stability
//!
//! nfsserve acknowledges every WRITE as `FILE_SYNC`, so writes are synced
//! before replying unless the export covering the file carries the `async`
//! option. In that case they stay unstable until [`LocalFs::commit_all`]
//! runs at shutdown.

use std::ffi::OsString;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use localnfs_core::{
    Attributes, CreateMode, FileHandle, FsError, LocalFs, ObjectKind, SetAttributes, SetTime,
    Stability, Timestamp,
};
use nfsserve::nfs::{
    fattr3, fileid3, filename3, ftype3, nfs_fh3, nfspath3, nfsstat3, nfsstring, nfstime3, sattr3,
    set_atime, set_gid3, set_mode3, set_mtime, set_size3, set_uid3, specdata3,
};
use nfsserve::vfs::{DirEntry, NFSFileSystem, ReadDirResult, VFSCapabilities};
use tracing::{debug, trace};

use crate::error::fs_error_to_nfsstat;
use crate::pool::BlockingPool;

/// NFS filesystem serving a [`LocalFs`].
#[derive(Debug, Clone)]
pub struct LocalNFS {
    pool: BlockingPool,
    read_only: bool,
}

impl LocalNFS {
    pub fn new(fs: Arc<LocalFs>, blocking_permits: usize) -> Self {
        let read_only = fs.policy().read_only;
        Self {
            pool: BlockingPool::new(fs, blocking_permits),
            read_only,
        }
    }

    pub fn fs(&self) -> &Arc<LocalFs> {
        self.pool.fs()
    }

    /// Current handle for a file id handed out to nfsserve.
    fn handle(&self, id: fileid3) -> Result<FileHandle, nfsstat3> {
        self.fs().handle_of(id).ok_or(nfsstat3::NFS3ERR_STALE)
    }

    async fn call<T, F>(&self, op: &'static str, f: F) -> Result<T, nfsstat3>
    where
        T: Send + 'static,
        F: FnOnce(&LocalFs) -> Result<T, FsError> + Send + 'static,
    {
        self.pool.run(f).await.map_err(|e| {
            debug!(op, error = %e, "request failed");
            fs_error_to_nfsstat(&e)
        })
    }
}

/// Converts adapter attributes to NFS attributes.
pub fn to_fattr3(attrs: &Attributes) -> fattr3 {
    fattr3 {
        ftype: match attrs.kind {
            ObjectKind::Regular => ftype3::NF3REG,
            ObjectKind::Directory => ftype3::NF3DIR,
            ObjectKind::Symlink => ftype3::NF3LNK,
            ObjectKind::BlockDevice => ftype3::NF3BLK,
            ObjectKind::CharDevice => ftype3::NF3CHR,
            ObjectKind::Fifo => ftype3::NF3FIFO,
            ObjectKind::Socket => ftype3::NF3SOCK,
        },
        mode: attrs.mode,
        nlink: u32::try_from(attrs.nlink).unwrap_or(u32::MAX),
        uid: attrs.uid,
        gid: attrs.gid,
        size: attrs.size,
        used: attrs.used,
        rdev: specdata3 {
            specdata1: attrs.rdev.0,
            specdata2: attrs.rdev.1,
        },
        fsid: attrs.fsid,
        fileid: attrs.file_id,
        atime: to_nfstime(attrs.atime),
        mtime: to_nfstime(attrs.mtime),
        ctime: to_nfstime(attrs.ctime),
    }
}

/// NFSv3 times are unsigned 32-bit seconds; earlier or later times clamp.
fn to_nfstime(ts: Timestamp) -> nfstime3 {
    nfstime3 {
        seconds: u32::try_from(ts.seconds.max(0)).unwrap_or(u32::MAX),
        nseconds: ts.nanos,
    }
}

fn from_nfstime(t: &nfstime3) -> Timestamp {
    Timestamp::new(i64::from(t.seconds), t.nseconds)
}

/// Converts an NFS attribute update to an adapter change set.
pub fn from_sattr3(attr: &sattr3) -> SetAttributes {
    let mut changes = SetAttributes::new();
    if let set_mode3::mode(mode) = attr.mode {
        changes = changes.mode(mode);
    }
    if let set_uid3::uid(uid) = attr.uid {
        changes = changes.owner(uid);
    }
    if let set_gid3::gid(gid) = attr.gid {
        changes = changes.group(gid);
    }
    if let set_size3::size(size) = attr.size {
        changes = changes.size(size);
    }
    match &attr.atime {
        set_atime::DONT_CHANGE => {}
        set_atime::SET_TO_SERVER_TIME => changes = changes.atime(SetTime::ServerTime),
        set_atime::SET_TO_CLIENT_TIME(t) => {
            changes = changes.atime(SetTime::ClientTime(from_nfstime(t)));
        }
    }
    match &attr.mtime {
        set_mtime::DONT_CHANGE => {}
        set_mtime::SET_TO_SERVER_TIME => changes = changes.mtime(SetTime::ServerTime),
        set_mtime::SET_TO_CLIENT_TIME(t) => {
            changes = changes.mtime(SetTime::ClientTime(from_nfstime(t)));
        }
    }
    changes
}

fn to_name(name: &[u8]) -> OsString {
    OsString::from_vec(name.to_vec())
}

#[async_trait]
impl NFSFileSystem for LocalNFS {
    fn capabilities(&self) -> VFSCapabilities {
        if self.read_only {
            VFSCapabilities::ReadOnly
        } else {
            VFSCapabilities::ReadWrite
        }
    }

    fn root_dir(&self) -> fileid3 {
        self.fs().root_handle().file_id()
    }

    fn serverid(&self) -> [u8; 8] {
        self.fs().volume().to_be_bytes()
    }

    fn id_to_fh(&self, id: fileid3) -> nfs_fh3 {
        // An id without a live handle yields an empty handle, which the
        // client gets back as BADHANDLE.
        let data = self
            .fs()
            .handle_of(id)
            .map(|handle| handle.as_bytes().to_vec())
            .unwrap_or_default();
        nfs_fh3 { data }
    }

    fn fh_to_id(&self, fh: &nfs_fh3) -> Result<fileid3, nfsstat3> {
        let handle = FileHandle::from_bytes(&fh.data).map_err(|e| fs_error_to_nfsstat(&e))?;
        if handle.volume() != self.fs().volume() {
            return Err(nfsstat3::NFS3ERR_STALE);
        }
        match self.fs().handle_of(handle.file_id()) {
            Some(current) if current == handle => Ok(handle.file_id()),
            _ => Err(nfsstat3::NFS3ERR_STALE),
        }
    }

    async fn path_to_id(&self, path: &[u8]) -> Result<fileid3, nfsstat3> {
        let path = PathBuf::from(to_name(path));
        trace!(path = %path.display(), "path_to_id");
        self.call("path_to_id", move |fs| fs.path_to_handle(&path))
            .await
            .map(|handle| handle.file_id())
    }

    async fn lookup(&self, dirid: fileid3, filename: &filename3) -> Result<fileid3, nfsstat3> {
        let dir = self.handle(dirid)?;
        let name = to_name(filename);
        trace!(dirid, ?name, "lookup");
        self.call("lookup", move |fs| fs.lookup(&dir, &name))
            .await
            .map(|handle| handle.file_id())
    }

    async fn getattr(&self, id: fileid3) -> Result<fattr3, nfsstat3> {
        let handle = self.handle(id)?;
        self.call("getattr", move |fs| fs.getattr(&handle))
            .await
            .map(|attrs| to_fattr3(&attrs))
    }

    async fn setattr(&self, id: fileid3, setattr: sattr3) -> Result<fattr3, nfsstat3> {
        let handle = self.handle(id)?;
        let changes = from_sattr3(&setattr);
        trace!(id, ?changes, "setattr");
        self.call("setattr", move |fs| fs.setattr(&handle, &changes))
            .await
            .map(|attrs| to_fattr3(&attrs))
    }

    async fn read(
        &self,
        id: fileid3,
        offset: u64,
        count: u32,
    ) -> Result<(Vec<u8>, bool), nfsstat3> {
        let handle = self.handle(id)?;
        let count = usize::try_from(count).unwrap_or(usize::MAX);
        self.call("read", move |fs| fs.read(&handle, offset, count))
            .await
            .map(|read| (read.data, read.eof))
    }

    async fn write(&self, id: fileid3, offset: u64, data: &[u8]) -> Result<fattr3, nfsstat3> {
        let handle = self.handle(id)?;
        let data = data.to_vec();
        trace!(id, offset, len = data.len(), "write");
        self.call("write", move |fs| {
            let stability = if fs.policy_for(&handle)?.sync_writes {
                Stability::FileSync
            } else {
                Stability::Unstable
            };
            fs.write(&handle, offset, &data, stability)?;
            fs.getattr(&handle)
        })
        .await
        .map(|attrs| to_fattr3(&attrs))
    }

    async fn create(
        &self,
        dirid: fileid3,
        filename: &filename3,
        attr: sattr3,
    ) -> Result<(fileid3, fattr3), nfsstat3> {
        let dir = self.handle(dirid)?;
        let name = to_name(filename);
        let attrs = from_sattr3(&attr);
        debug!(dirid, ?name, "create");
        self.call("create", move |fs| {
            let handle = fs.create(&dir, &name, &attrs, CreateMode::Unchecked)?;
            Ok((handle.file_id(), fs.getattr(&handle)?))
        })
        .await
        .map(|(id, attrs)| (id, to_fattr3(&attrs)))
    }

    async fn create_exclusive(
        &self,
        dirid: fileid3,
        filename: &filename3,
    ) -> Result<fileid3, nfsstat3> {
        let dir = self.handle(dirid)?;
        let name = to_name(filename);
        debug!(dirid, ?name, "create_exclusive");
        self.call("create_exclusive", move |fs| {
            fs.create(&dir, &name, &SetAttributes::new(), CreateMode::Guarded)
        })
        .await
        .map(|handle| handle.file_id())
    }

    async fn mkdir(
        &self,
        dirid: fileid3,
        dirname: &filename3,
    ) -> Result<(fileid3, fattr3), nfsstat3> {
        let dir = self.handle(dirid)?;
        let name = to_name(dirname);
        debug!(dirid, ?name, "mkdir");
        self.call("mkdir", move |fs| {
            let handle = fs.mkdir(&dir, &name, &SetAttributes::new())?;
            Ok((handle.file_id(), fs.getattr(&handle)?))
        })
        .await
        .map(|(id, attrs)| (id, to_fattr3(&attrs)))
    }

    /// nfsserve routes both REMOVE and RMDIR here.
    async fn remove(&self, dirid: fileid3, filename: &filename3) -> Result<(), nfsstat3> {
        let dir = self.handle(dirid)?;
        let name = to_name(filename);
        debug!(dirid, ?name, "remove");
        self.call("remove", move |fs| {
            let (_, attrs) = fs.lookup_with_attributes(&dir, &name)?;
            if attrs.kind == ObjectKind::Directory {
                fs.rmdir(&dir, &name)
            } else {
                fs.remove(&dir, &name)
            }
        })
        .await
    }

    async fn rename(
        &self,
        from_dirid: fileid3,
        from_filename: &filename3,
        to_dirid: fileid3,
        to_filename: &filename3,
    ) -> Result<(), nfsstat3> {
        let from_dir = self.handle(from_dirid)?;
        let to_dir = self.handle(to_dirid)?;
        let from = to_name(from_filename);
        let to = to_name(to_filename);
        debug!(from_dirid, ?from, to_dirid, ?to, "rename");
        self.call("rename", move |fs| fs.rename(&from_dir, &from, &to_dir, &to))
            .await
    }

    async fn readdir(
        &self,
        dirid: fileid3,
        start_after: fileid3,
        max_entries: usize,
    ) -> Result<ReadDirResult, nfsstat3> {
        let dir = self.handle(dirid)?;
        trace!(dirid, start_after, max_entries, "readdir");
        self.call("readdir", move |fs| {
            let cursor = if start_after == 0 {
                None
            } else {
                Some(fs.cursor_after(&dir, start_after)?)
            };
            fs.list(&dir, cursor.as_ref(), max_entries)
        })
        .await
        .map(|page| ReadDirResult {
            end: page.next.is_none(),
            entries: page
                .entries
                .iter()
                .map(|entry| DirEntry {
                    fileid: entry.handle.file_id(),
                    name: nfsstring(entry.name.as_bytes().to_vec()),
                    attr: to_fattr3(&entry.attributes),
                })
                .collect(),
        })
    }

    async fn symlink(
        &self,
        dirid: fileid3,
        linkname: &filename3,
        symlink: &nfspath3,
        attr: &sattr3,
    ) -> Result<(fileid3, fattr3), nfsstat3> {
        let dir = self.handle(dirid)?;
        let name = to_name(linkname);
        let target = PathBuf::from(to_name(symlink));
        let attrs = from_sattr3(attr);
        debug!(dirid, ?name, target = %target.display(), "symlink");
        self.call("symlink", move |fs| {
            let handle = fs.symlink(&dir, &name, &target, &attrs)?;
            Ok((handle.file_id(), fs.getattr(&handle)?))
        })
        .await
        .map(|(id, attrs)| (id, to_fattr3(&attrs)))
    }

    async fn readlink(&self, id: fileid3) -> Result<nfspath3, nfsstat3> {
        let handle = self.handle(id)?;
        self.call("readlink", move |fs| fs.readlink(&handle))
            .await
            .map(|target| nfsstring(target.into_os_string().into_vec()))
    }
}
