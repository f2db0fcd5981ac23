//! Opaque file handles and the identities they stand for.
//!
//! A handle is 24 bytes, big-endian:
//!
//! ```text
//! +----------------+----------------+----------------+
//! | volume tag u64 |  file id u64   | generation u64 |
//! +----------------+----------------+----------------+
//! ```
//!
//! The volume tag identifies the server incarnation (ephemeral mode) or the
//! state directory (durable mode). The file id is the inode number for
//! objects on the export root's device, or a synthetic id with the top bit
//! set for objects on nested mounts. The generation tells apart successive
//! objects that reuse the same inode number.

use std::fmt;
use std::path::PathBuf;

use crate::attr::ObjectKind;
use crate::error::FsError;

/// Encoded handle length in bytes.
pub const HANDLE_LEN: usize = 24;

/// Bit marking file ids that do not come from the root device's inode space.
pub const SYNTHETIC_ID_BIT: u64 = 1 << 63;

/// Stable numeric identity of a file object within one export.
pub type FileId = u64;

/// Opaque, fixed-length handle naming one file object.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle([u8; HANDLE_LEN]);

impl FileHandle {
    pub(crate) fn new(volume: u64, file_id: FileId, generation: u64) -> Self {
        let mut bytes = [0u8; HANDLE_LEN];
        bytes[0..8].copy_from_slice(&volume.to_be_bytes());
        bytes[8..16].copy_from_slice(&file_id.to_be_bytes());
        bytes[16..24].copy_from_slice(&generation.to_be_bytes());
        Self(bytes)
    }

    /// Decode handle bytes received from a client.
    ///
    /// Only the length is checked here; whether the handle still names a live
    /// object is decided by the registry.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FsError> {
        let bytes: [u8; HANDLE_LEN] = bytes.try_into().map_err(|_| FsError::BadHandle)?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn volume(&self) -> u64 {
        self.field(0)
    }

    pub fn file_id(&self) -> FileId {
        self.field(8)
    }

    pub fn generation(&self) -> u64 {
        self.field(16)
    }

    fn field(&self, offset: usize) -> u64 {
        let mut word = [0u8; 8];
        word.copy_from_slice(&self.0[offset..offset + 8]);
        u64::from_be_bytes(word)
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FileHandle({:016x}:{:x}:{:x})",
            self.volume(),
            self.file_id(),
            self.generation()
        )
    }
}

/// A live file object as seen by the adapter.
///
/// `path` is the current absolute local path of the object; it is always
/// inside the export root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileObjectIdentity {
    pub file_id: FileId,
    pub generation: u64,
    pub kind: ObjectKind,
    pub path: PathBuf,
}

impl FileObjectIdentity {
    pub fn is_dir(&self) -> bool {
        self.kind == ObjectKind::Directory
    }

    pub(crate) fn require_dir(&self) -> Result<(), FsError> {
        if self.is_dir() {
            Ok(())
        } else {
            Err(FsError::NotADirectory)
        }
    }

    pub(crate) fn require_file(&self) -> Result<(), FsError> {
        match self.kind {
            ObjectKind::Regular => Ok(()),
            ObjectKind::Directory => Err(FsError::IsADirectory),
            _ => Err(FsError::NotAFile),
        }
    }
}
