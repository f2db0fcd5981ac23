//! Handle registry: maps opaque handles to live file objects.
//!
//! # Design
//!
//! Each known object has a record keyed by its file id. A record stores
//! the object's generation and every `(parent id, name)` link through which
//! it has been seen. The current path is never trusted blindly: resolving a
//! handle rebuilds the path from the parent chain and checks it against a
//! fresh `lstat`. When that fails (something renamed the object outside the
//! server) the registry scans the recorded parent directories for the inode
//! and repairs the link. A handle whose object cannot be found this way is
//! stale.
//!
//! When the adapter removes the last link it knows of while the object
//! still has others, the record keeps that link's directory and the next
//! resolve scans it for a surviving name.
//!
//! Records are only removed through [`HandleRegistry::invalidate`], after
//! the adapter deleted or replaced the object. In durable mode every change
//! is appended to the [`Journal`] so that handles survive a restart.
//!
//! # Generations
//!
//! A generation is the object's birth time plus a per-id incarnation
//! counter that grows whenever an id is invalidated or found reused. Where
//! the filesystem reports no birth time the generation only changes
//! through that counter, so an inode that is deleted and reused by an
//! object of the same kind entirely outside the server keeps resolving
//! old handles until the adapter notices a change of kind.

use std::ffi::{OsStr, OsString};
use std::fs::{self, Metadata};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{DirEntryExt, MetadataExt};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, error, info, trace};

use crate::attr::ObjectKind;
use crate::config::HandleMode;
use crate::error::{FsError, Result};
use crate::handle::{FileHandle, FileId, FileObjectIdentity, SYNTHETIC_ID_BIT};
use crate::journal::{Journal, JournalError, JournalRecord, Replay};
use crate::name::is_plain_component;

/// Deepest parent chain followed while rebuilding a path.
const MAX_DEPTH: usize = 4096;

/// Links remembered per object; older ones are forgotten first.
const MAX_LINKS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Link {
    parent: FileId,
    name: OsString,
}

#[derive(Debug, Clone)]
struct Record {
    generation: u64,
    kind: ObjectKind,
    dev: u64,
    ino: u64,
    /// Most recently observed first.
    links: Vec<Link>,
    /// Last verified path, tried before walking the parent chain.
    cached_path: Option<PathBuf>,
    /// Directory of the last forgotten link while no other link is known.
    /// Another hard link may still exist there.
    orphaned_in: Option<FileId>,
}

impl Record {
    fn new(generation: u64, meta: &Metadata, link: Link, path: &Path) -> Self {
        Self {
            generation,
            kind: ObjectKind::from(meta.file_type()),
            dev: meta.dev(),
            ino: meta.ino(),
            links: vec![link],
            cached_path: Some(path.to_path_buf()),
            orphaned_in: None,
        }
    }

    fn matches(&self, meta: &Metadata) -> bool {
        meta.dev() == self.dev && meta.ino() == self.ino
    }
}

/// Thread-safe registry of issued file handles.
#[derive(Debug)]
pub struct HandleRegistry {
    root: PathBuf,
    root_dev: u64,
    root_id: FileId,
    root_generation: u64,
    volume: u64,
    records: DashMap<FileId, Record>,
    /// `(dev, ino)` of objects on nested mounts to their synthetic ids.
    synthetic_ids: DashMap<(u64, u64), FileId>,
    next_synthetic: AtomicU64,
    /// Bumped each time an id is invalidated, so that a successor object
    /// born within the same timestamp tick still gets a new generation.
    incarnations: DashMap<FileId, u64>,
    journal: Option<Journal>,
    journal_errors: AtomicU64,
}

impl HandleRegistry {
    /// Create a registry for the directory `root`, which must already be
    /// canonical.
    pub fn new(root: &Path, mode: &HandleMode) -> Result<Self> {
        let meta = fs::symlink_metadata(root)?;
        if !meta.is_dir() {
            return Err(FsError::NotADirectory);
        }

        let boot = boot_nanos();
        let (journal, replay) = match mode {
            HandleMode::Ephemeral => (None, None),
            HandleMode::Durable { state_dir } => {
                let (journal, replay) = Journal::open(state_dir, meta.ino(), boot)?;
                (Some(journal), Some(replay))
            }
        };

        let registry = Self {
            root: root.to_path_buf(),
            root_dev: meta.dev(),
            root_id: meta.ino(),
            root_generation: birth_nanos(&meta).unwrap_or(0),
            volume: replay.as_ref().map_or(boot, |r| r.volume),
            records: DashMap::new(),
            synthetic_ids: DashMap::new(),
            next_synthetic: AtomicU64::new(1),
            incarnations: DashMap::new(),
            journal,
            journal_errors: AtomicU64::new(0),
        };
        if let Some(replay) = replay {
            registry.seed(replay);
        }

        info!(
            root = %registry.root.display(),
            volume = registry.volume,
            durable = registry.journal.is_some(),
            records = registry.records.len(),
            "handle registry ready"
        );
        Ok(registry)
    }

    fn seed(&self, replay: Replay) {
        for (id, replayed) in replay.records {
            if id & SYNTHETIC_ID_BIT != 0 || id == self.root_id {
                continue;
            }
            let links: Vec<Link> = replayed
                .links
                .into_iter()
                .filter(|(_, name)| is_plain_component(name))
                .map(|(parent, name)| Link {
                    parent,
                    name: OsString::from_vec(name),
                })
                .collect();
            if links.is_empty() {
                continue;
            }
            if replayed.incarnation > 0 {
                self.incarnations.insert(id, replayed.incarnation);
            }
            self.records.insert(
                id,
                Record {
                    generation: replayed.generation,
                    kind: replayed.kind,
                    dev: replayed.dev,
                    ino: replayed.ino,
                    links,
                    cached_path: None,
                    orphaned_in: None,
                },
            );
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn root_id(&self) -> FileId {
        self.root_id
    }

    /// Tag embedded in every handle issued by this registry.
    pub fn volume(&self) -> u64 {
        self.volume
    }

    pub fn is_durable(&self) -> bool {
        self.journal.is_some()
    }

    pub fn root_handle(&self) -> FileHandle {
        FileHandle::new(self.volume, self.root_id, self.root_generation)
    }

    /// Number of tracked objects, excluding the root.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Journal appends that failed since start.
    pub fn journal_errors(&self) -> u64 {
        self.journal_errors.load(Ordering::Relaxed)
    }

    /// Current handle for a tracked file id.
    pub fn handle_of(&self, file_id: FileId) -> Option<FileHandle> {
        if file_id == self.root_id {
            return Some(self.root_handle());
        }
        self.records
            .get(&file_id)
            .map(|record| FileHandle::new(self.volume, file_id, record.generation))
    }

    /// Handle for an identity, registering the object when it was never
    /// seen before. Calling this repeatedly or concurrently for the same
    /// identity yields byte-identical handles.
    pub fn handle_for(&self, identity: &FileObjectIdentity) -> Result<FileHandle> {
        if let Some(handle) = self.handle_of(identity.file_id)
            && handle.generation() == identity.generation
        {
            return Ok(handle);
        }
        let handle = self.handle_for_path(&identity.path)?;
        if handle.file_id() != identity.file_id || handle.generation() != identity.generation {
            return Err(FsError::StaleHandle);
        }
        Ok(handle)
    }

    /// Walk `path` from the export root, registering every component.
    pub fn handle_for_path(&self, path: &Path) -> Result<FileHandle> {
        let relative = path
            .strip_prefix(&self.root)
            .map_err(|_| FsError::AccessDenied(path.display().to_string()))?;

        let mut handle = self.root_handle();
        let mut current = self.root.clone();
        for component in relative.components() {
            let name = match component {
                Component::Normal(name) => name,
                Component::CurDir => continue,
                _ => return Err(FsError::AccessDenied(path.display().to_string())),
            };
            let meta = fs::symlink_metadata(&current)?;
            if !meta.is_dir() {
                return Err(FsError::NotADirectory);
            }
            current.push(name);
            let child = fs::symlink_metadata(&current)?;
            handle = self.register(handle.file_id(), name, &current, &child);
        }
        Ok(handle)
    }

    /// Record that the object described by `meta` is reachable as `name`
    /// inside directory `parent`, at `path`.
    pub(crate) fn register(
        &self,
        parent: FileId,
        name: &OsStr,
        path: &Path,
        meta: &Metadata,
    ) -> FileHandle {
        let id = self.file_id_for(meta);
        if id == self.root_id && meta.dev() == self.root_dev {
            return self.root_handle();
        }
        let mut generation = self.generation_of(id, meta);
        let link = Link {
            parent,
            name: name.to_owned(),
        };

        match self.records.entry(id) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                let reused = record.generation != generation
                    || !record.matches(meta)
                    || record.kind != ObjectKind::from(meta.file_type());
                if reused {
                    if record.generation == generation {
                        // No birth time to tell the objects apart.
                        *self.incarnations.entry(id).or_insert(0) += 1;
                        generation = self.generation_of(id, meta);
                    }
                    debug!(
                        id,
                        old = record.generation,
                        new = generation,
                        "file id reused by a new object"
                    );
                    *record = Record::new(generation, meta, link.clone(), path);
                    self.journal_bind(id, record, &link);
                } else {
                    record.cached_path = Some(path.to_path_buf());
                    record.orphaned_in = None;
                    if record.links.first() != Some(&link) {
                        record.links.retain(|l| *l != link);
                        record.links.insert(0, link.clone());
                        record.links.truncate(MAX_LINKS);
                        self.journal_bind(id, record, &link);
                    }
                }
            }
            Entry::Vacant(entry) => {
                let record = Record::new(generation, meta, link.clone(), path);
                self.journal_bind(id, &record, &link);
                entry.insert(record);
                trace!(id, generation, name = ?name, "registered file object");
            }
        }
        FileHandle::new(self.volume, id, generation)
    }

    /// Resolve a handle to the live object it names.
    pub fn resolve(&self, handle: &FileHandle) -> Result<FileObjectIdentity> {
        if handle.volume() != self.volume {
            return Err(FsError::StaleHandle);
        }
        let id = handle.file_id();
        if id == self.root_id {
            if handle.generation() != self.root_generation {
                return Err(FsError::StaleHandle);
            }
            return Ok(FileObjectIdentity {
                file_id: id,
                generation: self.root_generation,
                kind: ObjectKind::Directory,
                path: self.root.clone(),
            });
        }

        let generation = self
            .records
            .get(&id)
            .map(|record| record.generation)
            .ok_or(FsError::StaleHandle)?;
        if generation != handle.generation() {
            return Err(FsError::StaleHandle);
        }
        let (path, meta) = self.locate(id, 0)?;
        if !path.starts_with(&self.root) {
            return Err(FsError::AccessDenied(path.display().to_string()));
        }
        Ok(FileObjectIdentity {
            file_id: id,
            generation,
            kind: ObjectKind::from(meta.file_type()),
            path,
        })
    }

    /// Find the current path of a tracked object and verify it.
    fn locate(&self, id: FileId, depth: usize) -> Result<(PathBuf, Metadata)> {
        if id == self.root_id {
            let meta = fs::symlink_metadata(&self.root)?;
            return Ok((self.root.clone(), meta));
        }
        if depth > MAX_DEPTH {
            return Err(FsError::StaleHandle);
        }

        let record = self
            .records
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or(FsError::StaleHandle)?;

        if let Some(path) = &record.cached_path
            && let Some(meta) = self.verify(id, &record, path)
        {
            return Ok((path.clone(), meta));
        }

        let mut parents = Vec::with_capacity(record.links.len());
        for link in &record.links {
            let Ok((parent_path, _)) = self.locate(link.parent, depth + 1) else {
                continue;
            };
            let candidate = parent_path.join(&link.name);
            if let Some(meta) = self.verify(id, &record, &candidate) {
                self.remember_path(id, record.generation, &candidate);
                return Ok((candidate, meta));
            }
            parents.push((link, parent_path));
        }

        // Every known link was removed, but the object outlived them through
        // a link never looked up.
        if let Some(dir) = record.orphaned_in.filter(|_| record.links.is_empty())
            && let Ok((dir_path, _)) = self.locate(dir, depth + 1)
            && let Some((name, meta)) = scan_for_inode(&dir_path, record.dev, record.ino)
            && self.generation_of(id, &meta) == record.generation
        {
            let path = dir_path.join(&name);
            debug!(id, name = ?name, "found surviving hard link");
            self.register(dir, &name, &path, &meta);
            return Ok((path, meta));
        }

        // Renamed behind our back: look for the inode in the known parents only.
        for (link, parent_path) in parents {
            if let Some((name, meta)) = scan_for_inode(&parent_path, record.dev, record.ino)
                && self.generation_of(id, &meta) == record.generation
            {
                let path = parent_path.join(&name);
                debug!(
                    id,
                    old = ?link.name,
                    new = ?name,
                    "repaired link renamed outside the server"
                );
                self.unlink(id, link.parent, &link.name);
                self.register(link.parent, &name, &path, &meta);
                return Ok((path, meta));
            }
        }

        trace!(id, "no live path for file object");
        Err(FsError::StaleHandle)
    }

    fn verify(&self, id: FileId, record: &Record, path: &Path) -> Option<Metadata> {
        let meta = fs::symlink_metadata(path).ok()?;
        (record.matches(&meta) && self.generation_of(id, &meta) == record.generation)
            .then_some(meta)
    }

    fn remember_path(&self, id: FileId, generation: u64, path: &Path) {
        if let Some(mut record) = self.records.get_mut(&id)
            && record.generation == generation
        {
            record.cached_path = Some(path.to_path_buf());
        }
    }

    /// Name of `child` inside directory `dir`, if the registry knows one.
    pub fn link_name_in(&self, child: FileId, dir: FileId) -> Option<OsString> {
        let record = self.records.get(&child)?;
        record
            .links
            .iter()
            .find(|link| link.parent == dir)
            .map(|link| link.name.clone())
    }

    /// Most recently observed parent of a tracked object.
    pub fn parent_of(&self, id: FileId) -> Option<FileId> {
        if id == self.root_id {
            return Some(self.root_id);
        }
        self.records
            .get(&id)
            .and_then(|record| record.links.first().map(|link| link.parent))
    }

    /// Forget one link of an object that remains alive through others.
    pub(crate) fn unlink(&self, id: FileId, parent: FileId, name: &OsStr) {
        let removed = match self.records.get_mut(&id) {
            Some(mut record) => {
                let before = record.links.len();
                record.links.retain(|l| !(l.parent == parent && l.name == name));
                record.cached_path = None;
                if record.links.is_empty() {
                    record.orphaned_in = Some(parent);
                }
                record.links.len() != before
            }
            None => false,
        };
        if removed && self.journals(id) {
            self.append(&JournalRecord::Unlink {
                id,
                parent,
                name: name.as_bytes().to_vec(),
            });
        }
    }

    /// Move the link `(from_parent, from_name)` of the object now found at
    /// `path` to `(to_parent, to_name)`.
    pub(crate) fn relink(
        &self,
        from_parent: FileId,
        from_name: &OsStr,
        to_parent: FileId,
        to_name: &OsStr,
        path: &Path,
        meta: &Metadata,
    ) -> FileHandle {
        let id = self.file_id_for(meta);
        self.unlink(id, from_parent, from_name);
        self.register(to_parent, to_name, path, meta)
    }

    /// Account for the removal of `name` from directory `parent`, where
    /// `meta` describes the removed entry. When it was the object's last
    /// link the object is invalidated, otherwise only the link is dropped.
    pub(crate) fn forget_link(
        &self,
        parent: FileId,
        name: &OsStr,
        meta: &Metadata,
        last_link: bool,
    ) -> FileId {
        let id = self.file_id_for(meta);
        if last_link {
            let generation = self.generation_of(id, meta);
            self.invalidate_id(id, generation);
        } else {
            self.unlink(id, parent, name);
        }
        id
    }

    /// Drop the object named by `identity`. Handles issued for it resolve
    /// to `StaleHandle` from now on, even if its inode number is reused.
    pub fn invalidate(&self, identity: &FileObjectIdentity) -> bool {
        self.invalidate_id(identity.file_id, identity.generation)
    }

    pub(crate) fn invalidate_id(&self, id: FileId, generation: u64) -> bool {
        if id == self.root_id {
            return false;
        }
        let removed = self
            .records
            .remove_if(&id, |_, record| record.generation == generation)
            .is_some();
        if removed {
            *self.incarnations.entry(id).or_insert(0) += 1;
            if id & SYNTHETIC_ID_BIT != 0 {
                self.synthetic_ids.retain(|_, synthetic| *synthetic != id);
            } else {
                self.append(&JournalRecord::Drop { id });
            }
            trace!(id, generation, "invalidated file object");
        }
        removed
    }

    /// Flush journaled bindings to stable storage.
    pub fn sync(&self) -> Result<()> {
        if let Some(journal) = &self.journal {
            journal.sync()?;
        }
        Ok(())
    }

    fn file_id_for(&self, meta: &Metadata) -> FileId {
        if meta.dev() == self.root_dev && meta.ino() & SYNTHETIC_ID_BIT == 0 {
            return meta.ino();
        }
        *self
            .synthetic_ids
            .entry((meta.dev(), meta.ino()))
            .or_insert_with(|| SYNTHETIC_ID_BIT | self.next_synthetic.fetch_add(1, Ordering::Relaxed))
    }

    fn incarnation(&self, id: FileId) -> u64 {
        self.incarnations.get(&id).map_or(0, |i| *i)
    }

    fn generation_of(&self, id: FileId, meta: &Metadata) -> u64 {
        birth_nanos(meta)
            .unwrap_or(0)
            .wrapping_add(self.incarnation(id))
    }

    fn journals(&self, id: FileId) -> bool {
        self.journal.is_some() && id & SYNTHETIC_ID_BIT == 0
    }

    fn journal_bind(&self, id: FileId, record: &Record, link: &Link) {
        if !self.journals(id) {
            return;
        }
        self.append(&JournalRecord::Bind {
            id,
            generation: record.generation,
            incarnation: self.incarnation(id),
            kind: record.kind,
            dev: record.dev,
            ino: record.ino,
            parent: link.parent,
            name: link.name.as_bytes().to_vec(),
        });
    }

    fn append(&self, record: &JournalRecord) {
        let Some(journal) = &self.journal else {
            return;
        };
        if let Err(e) = journal.append(record) {
            self.journal_errors.fetch_add(1, Ordering::Relaxed);
            error!(error = %e, "failed to append handle journal record");
        }
    }
}

fn scan_for_inode(dir: &Path, dev: u64, ino: u64) -> Option<(OsString, Metadata)> {
    let entries = fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        if entry.ino() != ino {
            continue;
        }
        if let Ok(meta) = fs::symlink_metadata(entry.path())
            && meta.dev() == dev
            && meta.ino() == ino
        {
            return Some((entry.file_name(), meta));
        }
    }
    None
}

fn birth_nanos(meta: &Metadata) -> Option<u64> {
    let created = meta.created().ok()?;
    let since = created.duration_since(UNIX_EPOCH).ok()?;
    u64::try_from(since.as_nanos()).ok()
}

pub(crate) fn boot_nanos() -> u64 {
    let since = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from(since.as_nanos()).unwrap_or(u64::MAX)
}

impl From<JournalError> for FsError {
    fn from(e: JournalError) -> Self {
        match e {
            JournalError::Io { source, .. } => Self::Io(source),
            JournalError::RootMismatch { .. } => Self::AccessDenied(e.to_string()),
            JournalError::Corrupt { .. } => {
                Self::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
            }
        }
    }
}
