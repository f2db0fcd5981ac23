//! NFSv3 server for a local directory tree.
//!
//! This crate binds the synchronous [`localnfs_core::LocalFs`] adapter to
//! the wire protocol using the `nfsserve` crate.
//!
//! # Architecture
//!
//! ```text
//! NFS Client (OS) ←TCP→ LocalNFS (nfsserve) ←→ BlockingPool ←→ LocalFs
//!                              │                                  │
//!                              ├── fileid3 ↔ FileHandle           ├── HandleRegistry
//!                              └── FsErrorKind → nfsstat3         └── ExportList
//! ```
//!
//! Adapter calls may block on local storage, so every one of them runs on
//! tokio's blocking pool behind a semaphore.
//!
//! # Example
//!
//! ```no_run
//! use localnfs_nfs::{NfsServer, ServerConfig};
//!
//! # async fn run() -> Result<(), localnfs_nfs::ServerError> {
//! let server = NfsServer::start(ServerConfig::default().with_root("/srv/export")).await?;
//! println!("mount -o port={},mountport={},nolock localhost:/ /mnt", server.port(), server.port());
//! tokio::signal::ctrl_c().await.ok();
//! server.stop().await?;
//! # Ok(())
//! # }
//! ```

#![cfg(unix)]

mod error;
mod filesystem;
mod pool;
mod server;

pub use error::{fs_error_to_nfsstat, kind_to_nfsstat};
pub use filesystem::{LocalNFS, from_sattr3, to_fattr3};
pub use pool::{BlockingPool, DEFAULT_BLOCKING_PERMITS};
pub use server::{DEFAULT_PORT, NfsServer, ServerConfig, ServerError};
