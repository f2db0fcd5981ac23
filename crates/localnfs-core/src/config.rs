//! Adapter configuration.

use std::path::{Path, PathBuf};

/// How file handles survive a restart.
///
/// In either mode handles tell reused inodes apart by birth time. On
/// filesystems without one, deleting and recreating an object of the same
/// kind outside the server can leave an old handle naming the new object.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum HandleMode {
    /// Handles are valid for the lifetime of one adapter instance. After a
    /// restart every previously issued handle resolves to `StaleHandle`.
    #[default]
    Ephemeral,
    /// Handle bindings are journaled under `state_dir` and survive restarts.
    Durable { state_dir: PathBuf },
}

/// Configuration for [`LocalFs`](crate::LocalFs).
///
/// # Example
///
/// ```
/// use localnfs_core::AdapterConfig;
///
/// let config = AdapterConfig::new("/srv/export")
///     .with_state_dir("/var/lib/localnfs")
///     .with_dot_entries(true);
/// assert!(config.include_dot_entries);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    /// Directory exported to clients.
    pub root: PathBuf,
    pub handle_mode: HandleMode,
    /// Emit `.` and `..` at the start of every directory listing.
    pub include_dot_entries: bool,
}

impl AdapterConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            handle_mode: HandleMode::Ephemeral,
            include_dot_entries: false,
        }
    }

    /// Switch to durable handles journaled in `state_dir`.
    #[must_use]
    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.handle_mode = HandleMode::Durable {
            state_dir: state_dir.into(),
        };
        self
    }

    #[must_use]
    pub fn with_dot_entries(mut self, include: bool) -> Self {
        self.include_dot_entries = include;
        self
    }

    pub fn state_dir(&self) -> Option<&Path> {
        match &self.handle_mode {
            HandleMode::Durable { state_dir } => Some(state_dir),
            HandleMode::Ephemeral => None,
        }
    }
}
