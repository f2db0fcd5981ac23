//! The adapter facade.
//!
//! [`LocalFs`] owns the handle registry, the data component and the export
//! policy, and exposes every file operation in terms of [`FileHandle`]s.
//! All methods take `&self` and may be called from many threads at once.

use std::ffi::{OsStr, OsString};
use std::fs;
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tracing::{debug, info, trace, warn};

use crate::attr::{self, Attributes, FsStats, SetAttributes, access};
use crate::config::AdapterConfig;
use crate::data::{DataOps, ReadResult, Stability, WriteReceipt, WriteVerifier};
use crate::dir::{self, CreateMode, DirCursor, ListPage};
use crate::error::{FsError, Result};
use crate::export::{AccessMode, AccessPolicy, Decision, ExportList};
use crate::handle::{FileHandle, FileId, FileObjectIdentity};
use crate::registry::HandleRegistry;
use crate::stats::AdapterStats;

/// Page ends remembered for cursor recovery before the table is reset.
const MAX_PAGE_ENDS: usize = 4096;

/// A local directory tree served through opaque file handles.
#[derive(Debug)]
pub struct LocalFs {
    config: AdapterConfig,
    registry: HandleRegistry,
    data: DataOps,
    exports: ExportList,
    policy: AccessPolicy,
    stats: Arc<AdapterStats>,
    /// `(dir, file id)` of the last entry of each listing page to its name,
    /// so that a page boundary survives removal of that entry.
    page_ends: DashMap<(FileId, FileId), OsString>,
}

impl LocalFs {
    /// Open the adapter with the default export table.
    pub fn new(config: AdapterConfig) -> Result<Self> {
        Self::with_exports(config, ExportList::default())
    }

    pub fn with_exports(mut config: AdapterConfig, exports: ExportList) -> Result<Self> {
        let root = fs::canonicalize(&config.root)?;
        if !fs::metadata(&root)?.is_dir() {
            return Err(FsError::NotADirectory);
        }
        config.root = root;
        let registry = HandleRegistry::new(&config.root, &config.handle_mode)?;
        let policy = AccessPolicy::for_tree(&exports);
        info!(
            root = %config.root.display(),
            durable = registry.is_durable(),
            read_only = policy.read_only,
            "local filesystem adapter ready"
        );
        Ok(Self {
            config,
            registry,
            data: DataOps::new(),
            exports,
            policy,
            stats: Arc::new(AdapterStats::new()),
            page_ends: DashMap::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn registry(&self) -> &HandleRegistry {
        &self.registry
    }

    pub fn exports(&self) -> &ExportList {
        &self.exports
    }

    /// Policy over the whole tree: read-only only when no export admits
    /// writes. Individual objects follow [`LocalFs::policy_for`].
    pub fn policy(&self) -> AccessPolicy {
        self.policy
    }

    /// Policy of the export covering the object behind `handle`.
    pub fn policy_for(&self, handle: &FileHandle) -> Result<AccessPolicy> {
        self.policy_of(&self.registry.resolve(handle)?)
    }

    pub fn stats(&self) -> Arc<AdapterStats> {
        Arc::clone(&self.stats)
    }

    /// Identifies this adapter's handle space.
    pub fn volume(&self) -> u64 {
        self.registry.volume()
    }

    pub fn write_verifier(&self) -> WriteVerifier {
        self.data.verifier()
    }

    /// Handle of the export root.
    pub fn root_handle(&self) -> FileHandle {
        self.registry.root_handle()
    }

    pub fn resolve(&self, handle: &FileHandle) -> Result<FileObjectIdentity> {
        self.observe(|| self.registry.resolve(handle))
    }

    pub fn handle_for(&self, identity: &FileObjectIdentity) -> Result<FileHandle> {
        self.registry.handle_for(identity)
    }

    /// Current handle of a tracked file id.
    pub fn handle_of(&self, id: FileId) -> Option<FileHandle> {
        self.registry.handle_of(id)
    }

    /// Walk a path relative to the export root, as given by a MOUNT
    /// request. Leading `/` is optional; `..` and paths outside every
    /// export are refused.
    pub fn path_to_handle(&self, path: &Path) -> Result<FileHandle> {
        let denied = || FsError::AccessDenied(path.display().to_string());
        let mut full = self.config.root.clone();
        let mut exported = PathBuf::from("/");
        for component in path.components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(name) => {
                    full.push(name);
                    exported.push(name);
                }
                Component::ParentDir | Component::Prefix(_) => return Err(denied()),
            }
        }
        if self.exports.export_for(&exported).is_none() {
            return Err(denied());
        }
        self.observe(|| self.registry.handle_for_path(&full))
    }

    pub fn getattr(&self, handle: &FileHandle) -> Result<Attributes> {
        trace!(?handle, "getattr");
        self.observe(|| attr::attributes_of(&self.registry.resolve(handle)?))
    }

    /// Apply a partial attribute update and return the resulting attributes.
    pub fn setattr(&self, handle: &FileHandle, changes: &SetAttributes) -> Result<Attributes> {
        trace!(?handle, ?changes, "setattr");
        self.observe(|| {
            let identity = self.registry.resolve(handle)?;
            self.writable(&identity)?;
            attr::apply_attributes(&identity, changes)?;
            attr::attributes_of(&identity)
        })
    }

    /// Subset of `requested` (see [`access`]) granted to the caller.
    pub fn access(&self, handle: &FileHandle, uid: u32, gids: &[u32], requested: u32) -> Result<u32> {
        self.observe(|| {
            let identity = self.registry.resolve(handle)?;
            let attrs = attr::attributes_of(&identity)?;
            let mut granted = attr::check_access(&attrs, uid, gids, requested);
            if self.policy_of(&identity)?.read_only {
                granted &= !access::MUTATING;
            }
            Ok(granted)
        })
    }

    pub fn lookup(&self, dir: &FileHandle, name: &OsStr) -> Result<FileHandle> {
        self.lookup_with_attributes(dir, name).map(|(handle, _)| handle)
    }

    pub fn lookup_with_attributes(
        &self,
        dir: &FileHandle,
        name: &OsStr,
    ) -> Result<(FileHandle, Attributes)> {
        trace!(?dir, ?name, "lookup");
        self.observe(|| {
            let found = dir::lookup(&self.registry, &self.registry.resolve(dir)?, name)?;
            // `..` is the only step that can leave an export.
            if name == ".." {
                let parent = self.registry.resolve(&found.0)?;
                if self.exports.export_for(&self.export_path(&parent)?).is_none() {
                    return Err(FsError::AccessDenied(parent.path.display().to_string()));
                }
            }
            Ok(found)
        })
    }

    /// One page of at most `limit` entries, starting after `cursor`.
    pub fn list(
        &self,
        dir: &FileHandle,
        cursor: Option<&DirCursor>,
        limit: usize,
    ) -> Result<ListPage> {
        trace!(?dir, ?cursor, limit, "list");
        let page = self.observe(|| {
            dir::list(
                &self.registry,
                &self.registry.resolve(dir)?,
                cursor,
                limit,
                self.config.include_dot_entries,
            )
        })?;
        if let Some(last) = page.entries.last() {
            if self.page_ends.len() >= MAX_PAGE_ENDS {
                self.page_ends.clear();
            }
            self.page_ends
                .insert((dir.file_id(), last.attributes.file_id), last.name.clone());
        }
        Ok(page)
    }

    /// Cursor that resumes a listing of `dir` after the entry `child`.
    ///
    /// For protocols that continue a listing by the file id of the last
    /// entry returned rather than by an opaque cursor.
    pub fn cursor_after(&self, dir: &FileHandle, child: FileId) -> Result<DirCursor> {
        let dir_id = dir.file_id();
        if let Some(name) = self.page_ends.get(&(dir_id, child)) {
            return Ok(DirCursor::after(dir_id, name.clone()));
        }
        if child == dir_id && self.config.include_dot_entries {
            return Ok(DirCursor::after(dir_id, OsString::from(".")));
        }
        self.registry
            .link_name_in(child, dir_id)
            .map(|name| DirCursor::after(dir_id, name))
            .ok_or(FsError::BadCursor)
    }

    pub fn readlink(&self, handle: &FileHandle) -> Result<PathBuf> {
        self.observe(|| dir::readlink(&self.registry.resolve(handle)?))
    }

    pub fn create(
        &self,
        dir: &FileHandle,
        name: &OsStr,
        attrs: &SetAttributes,
        mode: CreateMode,
    ) -> Result<FileHandle> {
        trace!(?dir, ?name, ?mode, "create");
        self.observe(|| {
            let dir = self.registry.resolve(dir)?;
            self.writable(&dir)?;
            dir::create(&self.registry, &dir, name, attrs, mode)
        })
    }

    pub fn mkdir(&self, dir: &FileHandle, name: &OsStr, attrs: &SetAttributes) -> Result<FileHandle> {
        trace!(?dir, ?name, "mkdir");
        self.observe(|| {
            let dir = self.registry.resolve(dir)?;
            self.writable(&dir)?;
            dir::mkdir(&self.registry, &dir, name, attrs)
        })
    }

    pub fn symlink(
        &self,
        dir: &FileHandle,
        name: &OsStr,
        target: &Path,
        attrs: &SetAttributes,
    ) -> Result<FileHandle> {
        trace!(?dir, ?name, target = %target.display(), "symlink");
        self.observe(|| {
            let dir = self.registry.resolve(dir)?;
            self.writable(&dir)?;
            dir::symlink(&self.registry, &dir, name, target, attrs)
        })
    }

    /// Remove a non-directory entry.
    pub fn remove(&self, dir: &FileHandle, name: &OsStr) -> Result<()> {
        trace!(?dir, ?name, "remove");
        self.observe(|| {
            let dir = self.registry.resolve(dir)?;
            self.writable(&dir)?;
            let id = dir::remove(&self.registry, &dir, name)?;
            self.forget_if_gone(id);
            Ok(())
        })
    }

    pub fn rmdir(&self, dir: &FileHandle, name: &OsStr) -> Result<()> {
        trace!(?dir, ?name, "rmdir");
        self.observe(|| {
            let dir = self.registry.resolve(dir)?;
            self.writable(&dir)?;
            dir::rmdir(&self.registry, &dir, name)?;
            Ok(())
        })
    }

    pub fn rename(
        &self,
        src_dir: &FileHandle,
        src_name: &OsStr,
        dst_dir: &FileHandle,
        dst_name: &OsStr,
    ) -> Result<()> {
        trace!(?src_dir, ?src_name, ?dst_dir, ?dst_name, "rename");
        self.observe(|| {
            let from = self.registry.resolve(src_dir)?;
            let to = self.registry.resolve(dst_dir)?;
            self.writable(&from)?;
            self.writable(&to)?;
            if let Some(replaced) = dir::rename(&self.registry, &from, src_name, &to, dst_name)? {
                self.forget_if_gone(replaced);
            }
            Ok(())
        })
    }

    /// Add `name` in `dir` as a hard link to `target`.
    pub fn link(&self, dir: &FileHandle, name: &OsStr, target: &FileHandle) -> Result<FileHandle> {
        trace!(?dir, ?name, ?target, "link");
        self.observe(|| {
            let dir = self.registry.resolve(dir)?;
            let target = self.registry.resolve(target)?;
            self.writable(&dir)?;
            dir::link(&self.registry, &dir, name, &target)
        })
    }

    pub fn read(&self, handle: &FileHandle, offset: u64, count: usize) -> Result<ReadResult> {
        let start = Instant::now();
        let result = self
            .registry
            .resolve(handle)
            .and_then(|identity| self.data.read(&identity, offset, count));
        match &result {
            Ok(read) => self.stats.record_read(read.data.len() as u64, start.elapsed()),
            Err(e) => self.failed("read", e),
        }
        result
    }

    pub fn write(
        &self,
        handle: &FileHandle,
        offset: u64,
        data: &[u8],
        stability: Stability,
    ) -> Result<WriteReceipt> {
        let start = Instant::now();
        let result = self.registry.resolve(handle).and_then(|identity| {
            self.writable(&identity)?;
            self.data.write(&identity, offset, data, stability)
        });
        match &result {
            Ok(receipt) => self.stats.record_write(receipt.count as u64, start.elapsed()),
            Err(e) => self.failed("write", e),
        }
        result
    }

    pub fn commit(&self, handle: &FileHandle, offset: u64, count: u64) -> Result<WriteVerifier> {
        let result = self
            .registry
            .resolve(handle)
            .and_then(|identity| self.data.commit(&identity, offset, count));
        match &result {
            Ok(_) => self.stats.record_commit(),
            Err(e) => self.failed("commit", e),
        }
        result
    }

    /// Commit every file with unstable writes and flush the handle journal.
    /// Returns the number of files committed.
    pub fn commit_all(&self) -> Result<usize> {
        let committed = self.data.commit_all(|id| {
            let handle = self.registry.handle_of(id).ok_or(FsError::StaleHandle)?;
            self.registry.resolve(&handle)
        })?;
        self.registry.sync()?;
        if committed > 0 {
            debug!(committed, "committed pending writes");
        }
        Ok(committed)
    }

    pub fn fs_stats(&self) -> Result<FsStats> {
        self.observe(|| attr::fs_stats(&self.config.root))
    }

    /// Export decision for a client mounting `path`.
    pub fn authorize(
        &self,
        addr: IpAddr,
        hostname: Option<&str>,
        path: &Path,
        requested: AccessMode,
    ) -> Decision {
        let decision = self.exports.authorize(addr, hostname, path, requested);
        if !decision.allow {
            warn!(%addr, path = %path.display(), ?requested, "export access denied");
        }
        decision
    }

    /// Commit outstanding writes before the adapter is dropped.
    pub fn shutdown(&self) -> Result<()> {
        let committed = self.commit_all()?;
        info!(committed, stats = ?self.stats.snapshot(), "local filesystem adapter stopped");
        Ok(())
    }

    /// `identity.path` as seen by clients, rooted at the export root.
    fn export_path(&self, identity: &FileObjectIdentity) -> Result<PathBuf> {
        let relative = identity
            .path
            .strip_prefix(&self.config.root)
            .map_err(|_| FsError::AccessDenied(identity.path.display().to_string()))?;
        Ok(Path::new("/").join(relative))
    }

    fn policy_of(&self, identity: &FileObjectIdentity) -> Result<AccessPolicy> {
        Ok(AccessPolicy::for_export(&self.exports, &self.export_path(identity)?))
    }

    fn writable(&self, identity: &FileObjectIdentity) -> Result<()> {
        if self.policy_of(identity)?.read_only {
            return Err(FsError::ReadOnly);
        }
        Ok(())
    }

    fn forget_if_gone(&self, id: FileId) {
        if self.registry.handle_of(id).is_none() {
            self.data.forget(id);
        }
    }

    fn observe<T>(&self, op: impl FnOnce() -> Result<T>) -> Result<T> {
        let start = Instant::now();
        let result = op();
        match &result {
            Ok(_) => self.stats.record_metadata_op(start.elapsed()),
            Err(e) => self.failed("metadata", e),
        }
        result
    }

    fn failed(&self, op: &'static str, error: &FsError) {
        self.stats.record_error(error.kind());
        if error.is_transient() {
            warn!(op, %error, "local storage error");
        } else {
            debug!(op, %error, "operation failed");
        }
    }
}
