//! End-to-end tests of the adapter facade against a temporary export root.
//!
//! Run: `cargo nextest run -p localnfs-core`

#![cfg(unix)]

mod common;

use common::{TestTree, create_file, list_all, mkdir, name};
use localnfs_core::{
    CreateMode, FsError, FsErrorKind, ObjectKind, SetAttributes, SetTime, Stability, Timestamp,
};
use std::path::Path;

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_hello_world() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let root = fs.root_handle();

    let d = mkdir(&fs, &root, "d");
    let f = create_file(&fs, &d, "f", b"hello");

    let read = fs.read(&f, 0, 100).unwrap();
    assert_eq!(read.data, b"hello");
    assert!(read.eof);

    let receipt = fs.write(&f, 5, b" world", Stability::Unstable).unwrap();
    assert_eq!(receipt.count, 6);
    assert_eq!(receipt.committed, Stability::Unstable);
    let verifier = fs.commit(&f, 0, 0).unwrap();
    assert_eq!(verifier, receipt.verifier);

    let read = fs.read(&f, 0, 11).unwrap();
    assert_eq!(read.data, b"hello world");
    assert_eq!(
        std::fs::read(tree.root().join("d/f")).unwrap(),
        b"hello world"
    );
}

#[test]
fn test_remove_directory_is_type_mismatch() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let d = mkdir(&fs, &fs.root_handle(), "d");
    mkdir(&fs, &d, "e");

    let err = fs.remove(&d, name("e")).unwrap_err();
    assert_eq!(err.kind(), FsErrorKind::IsADirectory);
    assert!(tree.root().join("d/e").is_dir());

    fs.rmdir(&d, name("e")).unwrap();
    assert!(!tree.root().join("d/e").exists());
}

#[test]
fn test_removed_handle_is_stale() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let root = fs.root_handle();
    let f = create_file(&fs, &root, "f", b"data");

    fs.remove(&root, name("f")).unwrap();
    assert!(matches!(fs.getattr(&f), Err(FsError::StaleHandle)));
    assert!(matches!(fs.lookup(&root, name("f")), Err(FsError::NotFound)));

    // A new object under the same name is a different object.
    let g = create_file(&fs, &root, "f", b"new");
    assert_ne!(f, g);
    assert!(matches!(fs.read(&f, 0, 10), Err(FsError::StaleHandle)));
}

#[test]
fn test_rename_keeps_handle() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let root = fs.root_handle();
    create_file(&fs, &root, "x", b"content");

    let before = fs.lookup(&root, name("x")).unwrap();
    fs.rename(&root, name("x"), &root, name("y")).unwrap();

    assert_eq!(fs.lookup(&root, name("y")).unwrap(), before);
    assert!(matches!(fs.lookup(&root, name("x")), Err(FsError::NotFound)));
    assert_eq!(fs.read(&before, 0, 100).unwrap().data, b"content");
}

#[test]
fn test_rename_over_file_invalidates_target() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let root = fs.root_handle();
    let a = create_file(&fs, &root, "a", b"a");
    let b = create_file(&fs, &root, "b", b"b");

    fs.rename(&root, name("a"), &root, name("b")).unwrap();
    assert!(matches!(fs.getattr(&b), Err(FsError::StaleHandle)));
    assert_eq!(fs.lookup(&root, name("b")).unwrap(), a);
    assert_eq!(fs.read(&a, 0, 10).unwrap().data, b"a");
}

#[test]
fn test_rename_over_empty_directory() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let root = fs.root_handle();
    let src = mkdir(&fs, &root, "src");
    create_file(&fs, &src, "kept", b"");
    let dst = mkdir(&fs, &root, "dst");

    fs.rename(&root, name("src"), &root, name("dst")).unwrap();
    assert!(matches!(fs.getattr(&dst), Err(FsError::StaleHandle)));
    assert_eq!(fs.lookup(&root, name("dst")).unwrap(), src);
    assert!(tree.root().join("dst/kept").exists());
    assert!(!tree.root().join("src").exists());
}

#[test]
fn test_rename_over_non_empty_directory() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let root = fs.root_handle();
    mkdir(&fs, &root, "src");
    let dst = mkdir(&fs, &root, "dst");
    create_file(&fs, &dst, "occupant", b"");

    let err = fs.rename(&root, name("src"), &root, name("dst")).unwrap_err();
    assert_eq!(err.kind(), FsErrorKind::NotEmpty);
    assert!(tree.root().join("src").is_dir());
    assert!(tree.root().join("dst/occupant").exists());
    assert!(fs.getattr(&dst).is_ok());
}

#[test]
fn test_rename_across_object_types() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let root = fs.root_handle();
    let d = mkdir(&fs, &root, "d");
    let f = create_file(&fs, &root, "f", b"file");

    let err = fs.rename(&root, name("d"), &root, name("f")).unwrap_err();
    assert_eq!(err.kind(), FsErrorKind::AlreadyExists);
    let err = fs.rename(&root, name("f"), &root, name("d")).unwrap_err();
    assert_eq!(err.kind(), FsErrorKind::AlreadyExists);

    assert_eq!(fs.lookup(&root, name("d")).unwrap(), d);
    assert_eq!(fs.lookup(&root, name("f")).unwrap(), f);
    assert_eq!(fs.read(&f, 0, 10).unwrap().data, b"file");
}

#[test]
fn test_rename_directory_into_itself() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let root = fs.root_handle();
    let d = mkdir(&fs, &root, "d");
    mkdir(&fs, &d, "inner");
    let inner = fs.lookup(&d, name("inner")).unwrap();

    let err = fs.rename(&root, name("d"), &inner, name("d")).unwrap_err();
    assert_eq!(err.kind(), FsErrorKind::InvalidArgument);
}

#[test]
fn test_rmdir_non_empty() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let root = fs.root_handle();
    let d = mkdir(&fs, &root, "d");
    create_file(&fs, &d, "f", b"");

    let err = fs.rmdir(&root, name("d")).unwrap_err();
    assert_eq!(err.kind(), FsErrorKind::NotEmpty);
}

#[test]
fn test_guarded_and_exclusive_create() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let root = fs.root_handle();
    create_file(&fs, &root, "f", b"");

    let err = fs
        .create(&root, name("f"), &SetAttributes::new(), CreateMode::Guarded)
        .unwrap_err();
    assert_eq!(err.kind(), FsErrorKind::AlreadyExists);

    let verifier = *b"retry-me";
    let first = fs
        .create(&root, name("x"), &SetAttributes::new(), CreateMode::Exclusive(verifier))
        .unwrap();
    let retry = fs
        .create(&root, name("x"), &SetAttributes::new(), CreateMode::Exclusive(verifier))
        .unwrap();
    assert_eq!(first, retry);

    let err = fs
        .create(&root, name("x"), &SetAttributes::new(), CreateMode::Exclusive(*b"another!"))
        .unwrap_err();
    assert_eq!(err.kind(), FsErrorKind::AlreadyExists);
}

#[test]
fn test_unchecked_create_keeps_content() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let root = fs.root_handle();
    let f = create_file(&fs, &root, "f", b"keep");

    let again = fs
        .create(&root, name("f"), &SetAttributes::new(), CreateMode::Unchecked)
        .unwrap();
    assert_eq!(again, f);
    assert_eq!(fs.read(&f, 0, 10).unwrap().data, b"keep");

    fs.create(&root, name("f"), &SetAttributes::new(), CreateMode::Truncate)
        .unwrap();
    assert_eq!(fs.getattr(&f).unwrap().size, 0);
}

#[test]
fn test_invalid_names() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let root = fs.root_handle();
    let attrs = SetAttributes::new();

    for bad in ["", ".", "..", "a/b"] {
        let err = fs.create(&root, name(bad), &attrs, CreateMode::Guarded).unwrap_err();
        assert_eq!(err.kind(), FsErrorKind::InvalidName, "name {bad:?}");
    }
    let long = "n".repeat(256);
    let err = fs.mkdir(&root, name(&long), &attrs).unwrap_err();
    assert_eq!(err.kind(), FsErrorKind::NameTooLong);
}

#[test]
fn test_names_are_case_sensitive() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let root = fs.root_handle();
    create_file(&fs, &root, "Readme", b"");

    if tree.root().join("README").exists() {
        eprintln!("Skipping test: export root is on a case-insensitive filesystem");
        return;
    }
    assert!(matches!(fs.lookup(&root, name("README")), Err(FsError::NotFound)));
}

#[test]
fn test_symlink_and_readlink() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let root = fs.root_handle();
    let f = create_file(&fs, &root, "target", b"x");

    let link = fs
        .symlink(&root, name("link"), Path::new("target"), &SetAttributes::new())
        .unwrap();
    assert_eq!(fs.readlink(&link).unwrap(), Path::new("target"));
    assert_eq!(fs.getattr(&link).unwrap().kind, ObjectKind::Symlink);
    assert!(matches!(fs.readlink(&f), Err(FsError::NotASymlink)));
    assert!(matches!(fs.read(&link, 0, 1), Err(FsError::NotAFile)));
}

#[test]
fn test_hard_link_shares_handle() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let root = fs.root_handle();
    let f = create_file(&fs, &root, "f", b"shared");
    let d = mkdir(&fs, &root, "d");

    let linked = fs.link(&d, name("g"), &f).unwrap();
    assert_eq!(linked, f);
    assert_eq!(fs.getattr(&f).unwrap().nlink, 2);

    fs.remove(&root, name("f")).unwrap();
    assert_eq!(fs.read(&linked, 0, 10).unwrap().data, b"shared");
    assert!(matches!(fs.link(&root, name("dd"), &d), Err(FsError::IsADirectory)));
}

#[test]
fn test_hard_link_made_outside_survives_remove() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let root = fs.root_handle();
    let a = create_file(&fs, &root, "a", b"payload");
    std::fs::hard_link(tree.root().join("a"), tree.root().join("b")).unwrap();

    fs.remove(&root, name("a")).unwrap();
    let attrs = fs.getattr(&a).unwrap();
    assert_eq!(attrs.nlink, 1);
    assert_eq!(fs.read(&a, 0, 10).unwrap().data, b"payload");
    assert_eq!(fs.lookup(&root, name("b")).unwrap(), a);
}

#[test]
fn test_lookup_dot_entries() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let root = fs.root_handle();
    let d = mkdir(&fs, &root, "d");

    assert_eq!(fs.lookup(&d, name(".")).unwrap(), d);
    assert_eq!(fs.lookup(&d, name("..")).unwrap(), root);
    assert_eq!(fs.lookup(&root, name("..")).unwrap(), root);
}

#[test]
fn test_lookup_in_file_is_not_a_directory() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let f = create_file(&fs, &fs.root_handle(), "f", b"");
    assert!(matches!(fs.lookup(&f, name("x")), Err(FsError::NotADirectory)));
}

// ============================================================================
// Attributes
// ============================================================================

#[test]
fn test_setattr_round_trip() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let f = create_file(&fs, &fs.root_handle(), "f", b"abc");
    let before = fs.getattr(&f).unwrap();

    let mtime = Timestamp::new(1_000_000_000, 500);
    let changes = SetAttributes::new()
        .mode(0o640)
        .mtime(SetTime::ClientTime(mtime));
    let after = fs.setattr(&f, &changes).unwrap();

    assert_eq!(after.mode, 0o640);
    assert_eq!(after.mtime, mtime);
    assert_eq!(after.size, before.size);
    assert_eq!(after.uid, before.uid);
    assert_eq!(after.gid, before.gid);
    assert_eq!(after.nlink, before.nlink);
    assert_eq!(after.file_id, before.file_id);
    assert_eq!(after.atime, before.atime);
    assert_eq!(after.kind, before.kind);
    assert_eq!(fs.getattr(&f).unwrap(), after);
}

#[test]
fn test_truncate_via_size() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let f = create_file(&fs, &fs.root_handle(), "f", b"hello world");

    let attrs = fs.setattr(&f, &SetAttributes::new().size(5)).unwrap();
    assert_eq!(attrs.size, 5);
    assert_eq!(fs.read(&f, 0, 100).unwrap().data, b"hello");
}

#[test]
fn test_setattr_on_symlink_reports_partial_application() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let root = fs.root_handle();
    let link = fs
        .symlink(&root, name("l"), Path::new("nowhere"), &SetAttributes::new())
        .unwrap();

    let err = fs.setattr(&link, &SetAttributes::new().mode(0o600)).unwrap_err();
    assert_eq!(err.kind(), FsErrorKind::Unsupported);
    match err {
        FsError::SetAttr(inner) => assert!(inner.applied.is_empty()),
        other => panic!("expected SetAttr, got {other:?}"),
    }
}

// ============================================================================
// Data
// ============================================================================

#[test]
fn test_read_past_end() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let f = create_file(&fs, &fs.root_handle(), "f", b"abc");

    let read = fs.read(&f, 10, 5).unwrap();
    assert!(read.data.is_empty());
    assert!(read.eof);
}

#[test]
fn test_read_directory_fails() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    assert!(matches!(
        fs.read(&fs.root_handle(), 0, 1),
        Err(FsError::IsADirectory)
    ));
}

#[test]
fn test_commit_all_flushes_unstable_writes() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let root = fs.root_handle();
    let a = create_file(&fs, &root, "a", b"");
    let b = create_file(&fs, &root, "b", b"");
    let gone = create_file(&fs, &root, "gone", b"");

    fs.write(&a, 0, b"1", Stability::Unstable).unwrap();
    fs.write(&b, 0, b"2", Stability::Unstable).unwrap();
    fs.write(&gone, 0, b"3", Stability::Unstable).unwrap();
    fs.remove(&root, name("gone")).unwrap();

    assert_eq!(fs.commit_all().unwrap(), 2);
    assert_eq!(fs.commit_all().unwrap(), 0);
}

#[test]
fn test_stats_track_bytes() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let f = create_file(&fs, &fs.root_handle(), "f", b"12345");
    fs.read(&f, 0, 3).unwrap();

    let snap = fs.stats().snapshot();
    assert_eq!(snap.bytes_written, 5);
    assert_eq!(snap.bytes_read, 3);
    assert_eq!(snap.errors, 0);
}

#[test]
fn test_fs_stats() {
    let tree = TestTree::new();
    let fs = tree.adapter();
    let stats = fs.fs_stats().unwrap();
    assert!(stats.total_bytes >= stats.free_bytes);
    assert!(stats.free_bytes >= stats.avail_bytes);
}

// ============================================================================
// Export policy and root confinement
// ============================================================================

#[test]
fn test_read_only_export() {
    let tree = TestTree::new();
    tree.write_file("f", b"data");
    let fs = tree.adapter_with_exports("/ *(ro)\n");
    let root = fs.root_handle();
    let f = fs.lookup(&root, name("f")).unwrap();

    assert_eq!(fs.read(&f, 0, 10).unwrap().data, b"data");
    let attrs = SetAttributes::new();
    for err in [
        fs.create(&root, name("new"), &attrs, CreateMode::Guarded).unwrap_err(),
        fs.write(&f, 0, b"x", Stability::FileSync).unwrap_err(),
        fs.remove(&root, name("f")).unwrap_err(),
        fs.rename(&root, name("f"), &root, name("g")).unwrap_err(),
        fs.setattr(&f, &SetAttributes::new().size(0)).unwrap_err(),
    ] {
        assert_eq!(err.kind(), FsErrorKind::ReadOnly);
    }
    assert!(tree.root().join("f").exists());
}

#[test]
fn test_path_to_handle_rejects_escape() {
    let tree = TestTree::new();
    tree.write_file("d/f", b"");
    let fs = tree.adapter();

    let f = fs.path_to_handle(Path::new("/d/f")).unwrap();
    let d = fs.lookup(&fs.root_handle(), name("d")).unwrap();
    assert_eq!(fs.lookup(&d, name("f")).unwrap(), f);

    for escape in ["/..", "/d/../../etc", "../outside"] {
        let err = fs.path_to_handle(Path::new(escape)).unwrap_err();
        assert_eq!(err.kind(), FsErrorKind::AccessDenied, "path {escape}");
    }
}

#[test]
fn test_subtree_export_only() {
    let tree = TestTree::new();
    tree.write_file("data/f", b"");
    tree.write_file("private/secret", b"");
    let fs = tree.adapter_with_exports("/data *(rw)\n");

    for unexported in ["/", "/private", "/private/secret", "/database"] {
        let err = fs.path_to_handle(Path::new(unexported)).unwrap_err();
        assert_eq!(err.kind(), FsErrorKind::AccessDenied, "path {unexported}");
    }

    let data = fs.path_to_handle(Path::new("/data")).unwrap();
    let f = fs.path_to_handle(Path::new("/data/f")).unwrap();
    assert_eq!(fs.lookup(&data, name("f")).unwrap(), f);
    create_file(&fs, &data, "new", b"written");
    assert_eq!(std::fs::read(tree.root().join("data/new")).unwrap(), b"written");
    assert!(!fs.policy().read_only);
    assert!(fs.policy_for(&fs.root_handle()).unwrap().read_only);
}

#[test]
fn test_writable_subtree_under_read_only_root() {
    let tree = TestTree::new();
    tree.write_file("top", b"");
    tree.write_file("data/f", b"");
    let fs = tree.adapter_with_exports("/ *(ro)\n/data *(rw,async)\n");
    let root = fs.root_handle();
    let data = fs.path_to_handle(Path::new("/data")).unwrap();
    let attrs = SetAttributes::new();

    let f = fs.lookup(&data, name("f")).unwrap();
    fs.write(&f, 0, b"ok", Stability::FileSync).unwrap();
    fs.create(&data, name("g"), &attrs, CreateMode::Guarded).unwrap();
    assert!(!fs.policy_for(&f).unwrap().sync_writes);

    let top = fs.lookup(&root, name("top")).unwrap();
    for err in [
        fs.create(&root, name("new"), &attrs, CreateMode::Guarded).unwrap_err(),
        fs.write(&top, 0, b"x", Stability::FileSync).unwrap_err(),
        fs.rename(&data, name("g"), &root, name("g")).unwrap_err(),
    ] {
        assert_eq!(err.kind(), FsErrorKind::ReadOnly);
    }
    assert!(tree.root().join("data/g").exists());

    use localnfs_core::access;
    assert_eq!(fs.access(&top, 0, &[0], access::ALL).unwrap() & access::MUTATING, 0);
    assert_ne!(fs.access(&f, 0, &[0], access::ALL).unwrap() & access::MODIFY, 0);
}

#[test]
fn test_listing_with_dot_entries() {
    let tree = TestTree::new();
    tree.write_file("a", b"");
    tree.write_file("b", b"");
    let fs = localnfs_core::LocalFs::new(
        localnfs_core::AdapterConfig::new(tree.root()).with_dot_entries(true),
    )
    .unwrap();

    assert_eq!(list_all(&fs, &fs.root_handle(), 1), [".", "..", "a", "b"]);
}

#[test]
fn test_random_unstable_writes_match_model() {
    use rand::Rng;

    let tree = TestTree::new();
    let fs = tree.adapter();
    let file = create_file(&fs, &fs.root_handle(), "model", b"");
    let mut rng = rand::rng();
    let mut model = Vec::new();

    for _ in 0..50 {
        let offset = rng.random_range(0..4096usize);
        let len = rng.random_range(1..512usize);
        let mut chunk = vec![0u8; len];
        rng.fill(&mut chunk[..]);
        fs.write(&file, offset as u64, &chunk, Stability::Unstable)
            .unwrap();
        if model.len() < offset + len {
            model.resize(offset + len, 0);
        }
        model[offset..offset + len].copy_from_slice(&chunk);
    }
    assert_eq!(fs.commit_all().unwrap(), 1);

    let read = fs.read(&file, 0, model.len() + 10).unwrap();
    assert!(read.eof);
    assert!(read.data == model, "file diverged from model");
}
