//! File content: positional reads, stability-aware writes and commit.
//!
//! Unstable writes land in the page cache and are tracked per file until a
//! `commit` (or `commit_all` at shutdown) forces them to stable storage.
//! Every reply carries the instance's write verifier; a client that sees
//! it change knows uncommitted data may have been lost and must resend.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, OpenOptionsExt};

use dashmap::DashMap;
use tracing::{debug, trace, warn};

use crate::error::{FsError, Result};
use crate::handle::{FileId, FileObjectIdentity};
use crate::registry::boot_nanos;

/// Opaque token identifying one server instance.
pub type WriteVerifier = [u8; 8];

/// Durability requested for (and granted to) a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stability {
    /// May sit in the page cache until committed.
    Unstable,
    /// Data, and the metadata needed to read it back, is on stable storage.
    DataSync,
    /// Data and all metadata are on stable storage.
    FileSync,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    pub data: Vec<u8>,
    /// The read reached the end of the file.
    pub eof: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteReceipt {
    pub count: usize,
    pub committed: Stability,
    pub verifier: WriteVerifier,
}

/// Byte range written unstably and not yet committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingRange {
    start: u64,
    end: u64,
}

impl PendingRange {
    fn merge(&mut self, start: u64, end: u64) {
        self.start = self.start.min(start);
        self.end = self.end.max(end);
    }
}

/// Content operations plus the bookkeeping of uncommitted writes.
#[derive(Debug)]
pub struct DataOps {
    verifier: WriteVerifier,
    pending: DashMap<FileId, PendingRange>,
}

impl Default for DataOps {
    fn default() -> Self {
        Self::new()
    }
}

impl DataOps {
    pub fn new() -> Self {
        Self {
            verifier: boot_nanos().to_be_bytes(),
            pending: DashMap::new(),
        }
    }

    pub fn verifier(&self) -> WriteVerifier {
        self.verifier
    }

    /// Number of files with uncommitted writes.
    pub fn pending_files(&self) -> usize {
        self.pending.len()
    }

    /// Uncommitted byte range of a file, as `(start, end)`.
    pub fn pending_range(&self, id: FileId) -> Option<(u64, u64)> {
        self.pending.get(&id).map(|r| (r.start, r.end))
    }

    pub fn read(
        &self,
        identity: &FileObjectIdentity,
        offset: u64,
        count: usize,
    ) -> Result<ReadResult> {
        identity.require_file()?;
        let file = open(identity, false)?;
        let size = file.metadata()?.len();
        if offset >= size || count == 0 {
            return Ok(ReadResult {
                data: Vec::new(),
                eof: offset >= size,
            });
        }

        let wanted = usize::try_from(size - offset).map_or(count, |left| left.min(count));
        let mut data = vec![0u8; wanted];
        let mut filled = 0;
        while filled < wanted {
            let n = file.read_at(&mut data[filled..], offset + filled as u64)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        data.truncate(filled);
        let eof = offset + filled as u64 >= size;
        trace!(path = %identity.path.display(), offset, count, read = filled, eof, "read");
        Ok(ReadResult { data, eof })
    }

    pub fn write(
        &self,
        identity: &FileObjectIdentity,
        offset: u64,
        data: &[u8],
        stability: Stability,
    ) -> Result<WriteReceipt> {
        identity.require_file()?;
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(FsError::InvalidArgument("write past the largest file offset"))?;
        let file = open(identity, true)?;
        file.write_all_at(data, offset)?;

        match stability {
            Stability::Unstable => {
                self.pending
                    .entry(identity.file_id)
                    .and_modify(|range| range.merge(offset, end))
                    .or_insert(PendingRange { start: offset, end });
            }
            Stability::DataSync => {
                file.sync_data()?;
                self.pending.remove(&identity.file_id);
            }
            Stability::FileSync => {
                file.sync_all()?;
                self.pending.remove(&identity.file_id);
            }
        }
        trace!(path = %identity.path.display(), offset, len = data.len(), ?stability, "write");
        Ok(WriteReceipt {
            count: data.len(),
            committed: stability,
            verifier: self.verifier,
        })
    }

    /// Force previously written data of a file to stable storage.
    ///
    /// The whole file is synced; `offset` and `count` only have to describe
    /// a valid range.
    pub fn commit(
        &self,
        identity: &FileObjectIdentity,
        offset: u64,
        count: u64,
    ) -> Result<WriteVerifier> {
        identity.require_file()?;
        offset
            .checked_add(count)
            .ok_or(FsError::InvalidArgument("commit range overflows"))?;
        let file = open(identity, false)?;
        file.sync_all()?;
        self.pending.remove(&identity.file_id);
        debug!(path = %identity.path.display(), offset, count, "committed");
        Ok(self.verifier)
    }

    /// Commit every file with pending writes. `resolve` maps a file id to its
    /// current identity; files that no longer exist are skipped.
    pub fn commit_all<F>(&self, resolve: F) -> Result<usize>
    where
        F: Fn(FileId) -> Result<FileObjectIdentity>,
    {
        let ids: Vec<FileId> = self.pending.iter().map(|entry| *entry.key()).collect();
        let mut committed = 0;
        let mut first_error = None;
        for id in ids {
            let outcome = resolve(id).and_then(|identity| self.commit(&identity, 0, 0));
            match outcome {
                Ok(_) => committed += 1,
                Err(FsError::StaleHandle | FsError::NotFound) => {
                    self.pending.remove(&id);
                }
                Err(e) => {
                    warn!(id, error = %e, "failed to commit pending writes");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(committed),
        }
    }

    /// Drop bookkeeping for a file that no longer exists.
    pub fn forget(&self, id: FileId) {
        self.pending.remove(&id);
    }
}

fn open(identity: &FileObjectIdentity, write: bool) -> Result<File> {
    let file = OpenOptions::new()
        .read(!write)
        .write(write)
        .custom_flags(libc::O_NOFOLLOW)
        .open(&identity.path)?;
    Ok(file)
}
