//! Local-filesystem adapter for an NFSv3 server.
//!
//! This crate maps a directory tree on local storage to the object model an
//! NFS server works with: opaque file handles, attributes, resumable
//! directory listings and stability-aware writes. It performs no network
//! I/O; the `localnfs-nfs` crate binds it to the wire protocol.
//!
//! # Components
//!
//! - [`LocalFs`] - Facade exposing every operation in terms of [`FileHandle`]s
//! - [`HandleRegistry`] - Issues handles and resolves them back to live objects
//! - [`Journal`] - Makes handles durable across restarts
//! - [`ExportList`] - exports(5)-style access control
//! - [`AdapterStats`] - Lock-free operation counters
//!
//! # Handles
//!
//! A handle encodes the adapter volume, the object's inode number and its
//! generation (birth time). Handles stay valid across renames. After the
//! object is removed its handle is stale, even if the inode number is
//! reused. In [`HandleMode::Durable`] mode handles also survive a restart.
//!
//! # Example
//!
//! ```no_run
//! use std::ffi::OsStr;
//! use localnfs_core::{AdapterConfig, CreateMode, LocalFs, SetAttributes, Stability};
//!
//! let fs = LocalFs::new(AdapterConfig::new("/srv/export"))?;
//! let root = fs.root_handle();
//! let file = fs.create(&root, OsStr::new("hello.txt"), &SetAttributes::new(), CreateMode::Guarded)?;
//! fs.write(&file, 0, b"hello", Stability::FileSync)?;
//! assert_eq!(fs.read(&file, 0, 100)?.data, b"hello");
//! # Ok::<(), localnfs_core::FsError>(())
//! ```

#![cfg(unix)]

pub mod attr;
mod config;
pub mod data;
mod dir;
mod error;
pub mod export;
mod fs;
mod handle;
mod journal;
pub mod name;
mod registry;
pub mod stats;

pub use attr::{
    AttrField, Attributes, FsStats, ObjectKind, SetAttrError, SetAttributes, SetTime, Timestamp,
    access,
};
pub use config::{AdapterConfig, HandleMode};
pub use data::{ReadResult, Stability, WriteReceipt, WriteVerifier};
pub use dir::{CreateMode, CreateVerifier, DirCursor, DirEntry, ListPage};
pub use error::{FsError, FsErrorKind, Result};
pub use export::{
    AccessMode, AccessPolicy, ClientPattern, ClientRule, DEFAULT_EXPORTS, Decision, ExportEntry,
    ExportList, ExportParseError, Squash,
};
pub use fs::LocalFs;
pub use handle::{FileHandle, FileId, FileObjectIdentity, HANDLE_LEN};
pub use journal::{Journal, JournalError};
pub use registry::HandleRegistry;
pub use stats::{AdapterStats, StatsSnapshot};
