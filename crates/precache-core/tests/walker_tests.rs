//! Tree walk traversal and containment.

mod common;

use std::os::unix::fs::MetadataExt;

use common::write_file;
use precache_core::walker::{subdirs_on_device, walk_tree, WalkError};
use precache_core::Resolver;

#[test]
fn subdirs_exclude_files_and_dot_entries() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("sub1")).unwrap();
    std::fs::create_dir(root.path().join("sub2")).unwrap();
    write_file(root.path(), "file", 64);

    let root_dev = std::fs::symlink_metadata(root.path()).unwrap().dev();
    let mut subdirs = subdirs_on_device(root.path(), root_dev);
    subdirs.sort();
    assert_eq!(
        subdirs,
        vec![root.path().join("sub1"), root.path().join("sub2")]
    );
}

#[test]
fn subdirs_on_another_device_are_rejected() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("sub")).unwrap();

    // A device id that belongs to nothing: every child fails the check.
    let subdirs = subdirs_on_device(root.path(), u64::MAX);
    assert!(subdirs.is_empty());
}

#[test]
fn walk_visits_every_level_within_the_tree() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("a")).unwrap();
    std::fs::create_dir(root.path().join("b")).unwrap();
    std::fs::create_dir(root.path().join("a").join("c")).unwrap();
    write_file(root.path(), "top", 256);
    write_file(&root.path().join("a"), "inner", 256);

    let device = write_file(root.path(), "device", 4096);
    let device = std::fs::File::open(device).unwrap();

    let mut resolver = Resolver::new();
    let stats = walk_tree(&mut resolver, root.path(), device).unwrap();
    // root, a and b, then c: one visit each, breadth first.
    assert_eq!(stats.directories_visited, 4);
}

#[test]
fn walk_of_a_missing_root_is_a_setup_error() {
    let root = tempfile::tempdir().unwrap();
    let gone = root.path().join("gone");
    let device = write_file(root.path(), "device", 64);
    let device = std::fs::File::open(device).unwrap();

    let mut resolver = Resolver::new();
    let err = walk_tree(&mut resolver, &gone, device).unwrap_err();
    assert!(matches!(err, WalkError::RootStat { .. }));
}
