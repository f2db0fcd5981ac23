//! Shared harness for adapter integration tests.
//!
//! Every [`TestTree`] owns a temporary export root (and, for durable
//! adapters, a separate state directory) that is removed on drop.

#![allow(dead_code)]

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use localnfs_core::{
    AdapterConfig, CreateMode, ExportList, FileHandle, LocalFs, SetAttributes, Stability,
};
use tempfile::TempDir;

pub struct TestTree {
    root: TempDir,
    state: TempDir,
}

impl TestTree {
    pub fn new() -> Self {
        Self {
            root: TempDir::new().expect("failed to create export root"),
            state: TempDir::new().expect("failed to create state dir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn state_dir(&self) -> PathBuf {
        self.state.path().join("localnfs")
    }

    /// Adapter with ephemeral handles.
    pub fn adapter(&self) -> LocalFs {
        LocalFs::new(AdapterConfig::new(self.root())).expect("failed to open adapter")
    }

    /// Adapter journaling its handles in this tree's state directory.
    pub fn durable_adapter(&self) -> LocalFs {
        LocalFs::new(AdapterConfig::new(self.root()).with_state_dir(self.state_dir()))
            .expect("failed to open durable adapter")
    }

    pub fn adapter_with_exports(&self, exports: &str) -> LocalFs {
        let exports = ExportList::parse(exports).expect("invalid exports");
        LocalFs::with_exports(AdapterConfig::new(self.root()), exports)
            .expect("failed to open adapter")
    }

    /// Create a file directly on disk, bypassing the adapter.
    pub fn write_file(&self, relative: &str, content: &[u8]) {
        let path = self.root().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("failed to create parent");
        }
        std::fs::write(path, content).expect("failed to write file");
    }
}

pub fn name(s: &str) -> &OsStr {
    OsStr::new(s)
}

/// Create `name` in `dir` through the adapter with `content`.
pub fn create_file(fs: &LocalFs, dir: &FileHandle, file: &str, content: &[u8]) -> FileHandle {
    let handle = fs
        .create(dir, name(file), &SetAttributes::new(), CreateMode::Guarded)
        .unwrap_or_else(|e| panic!("create {file} failed: {e}"));
    if !content.is_empty() {
        fs.write(&handle, 0, content, Stability::FileSync)
            .unwrap_or_else(|e| panic!("write {file} failed: {e}"));
    }
    handle
}

pub fn mkdir(fs: &LocalFs, dir: &FileHandle, child: &str) -> FileHandle {
    fs.mkdir(dir, name(child), &SetAttributes::new())
        .unwrap_or_else(|e| panic!("mkdir {child} failed: {e}"))
}

/// Collect a whole listing by following cursors with the given page size.
pub fn list_all(fs: &LocalFs, dir: &FileHandle, limit: usize) -> Vec<String> {
    let mut names = Vec::new();
    let mut cursor = None;
    loop {
        let page = fs.list(dir, cursor.as_ref(), limit).expect("list failed");
        assert!(page.entries.len() <= limit, "page exceeds limit");
        names.extend(
            page.entries
                .iter()
                .map(|e| e.name.to_string_lossy().into_owned()),
        );
        match page.next {
            Some(next) => cursor = Some(next),
            None => return names,
        }
    }
}
