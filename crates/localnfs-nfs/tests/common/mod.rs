//! Shared harness for the NFS binding tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use localnfs_core::{AdapterConfig, ExportList, LocalFs};
use localnfs_nfs::LocalNFS;
use nfsserve::nfs::{fileid3, filename3, nfsstring};
use nfsserve::vfs::NFSFileSystem;
use tempfile::TempDir;

/// Compare nfsstat3 variants (nfsstat3 doesn't implement PartialEq).
macro_rules! assert_nfsstat_eq {
    ($left:expr, $right:expr) => {
        assert_eq!(
            std::mem::discriminant(&$left),
            std::mem::discriminant(&$right)
        );
    };
}

/// A `LocalNFS` serving a fresh temporary directory.
pub struct TestNfs {
    pub root: TempDir,
    pub nfs: LocalNFS,
}

impl TestNfs {
    pub fn new() -> Self {
        Self::with_exports(localnfs_core::DEFAULT_EXPORTS)
    }

    pub fn with_exports(exports: &str) -> Self {
        let root = tempfile::tempdir().unwrap();
        let exports = ExportList::parse(exports).unwrap();
        let fs = LocalFs::with_exports(AdapterConfig::new(root.path()), exports).unwrap();
        let nfs = LocalNFS::new(Arc::new(fs), 8);
        Self { root, nfs }
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    pub fn root_id(&self) -> fileid3 {
        self.nfs.root_dir()
    }
}

pub fn name(s: &str) -> filename3 {
    nfsstring(s.as_bytes().to_vec())
}

/// Create a file in `dir` holding `content`; returns its file id.
pub async fn create_file(nfs: &LocalNFS, dir: fileid3, file: &str, content: &[u8]) -> fileid3 {
    let id = nfs.create_exclusive(dir, &name(file)).await.unwrap();
    if !content.is_empty() {
        nfs.write(id, 0, content).await.unwrap();
    }
    id
}

/// Every name in `dir`, reading `page` entries at a time.
pub async fn readdir_all(nfs: &LocalNFS, dir: fileid3, page: usize) -> Vec<String> {
    let mut names = Vec::new();
    let mut start_after = 0;
    loop {
        let result = nfs.readdir(dir, start_after, page).await.unwrap();
        for entry in &result.entries {
            names.push(String::from_utf8(entry.name.0.clone()).unwrap());
        }
        if let Some(last) = result.entries.last() {
            start_after = last.fileid;
        }
        if result.end {
            break;
        }
        assert!(!result.entries.is_empty(), "non-final page was empty");
    }
    names
}
