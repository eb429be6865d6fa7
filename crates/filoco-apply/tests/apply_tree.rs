//! End-to-end applier behavior: scan on one store, sync, apply on the
//! other, then look at the resulting filesystem

use std::fs;
use std::path::Path;

use filoco_apply::MdApply;
use filoco_core::{DebugFlags, Id128};
use filoco_scan::{ScanOptions, Scanner};
use filoco_store::{Store, SyncMode, PLACEHOLDER_TARGET, ROOT_IID};
use filoco_sync::sync_local_pair;

fn new_store(dir: &Path) -> Store {
    Store::initialize(dir, None, SyncMode::Synctree, DebugFlags::default()).unwrap()
}

async fn scan_once(store: &Store) {
    let mut scanner = Scanner::new(store, ScanOptions::default(), DebugFlags::default()).unwrap();
    scanner.run_once().await.unwrap();
}

async fn apply(store: &Store) {
    let mut applier = MdApply::new(store, DebugFlags::default()).unwrap();
    applier.run(false).await.unwrap();
}

async fn sync(a: &Store, b: &Store) {
    sync_local_pair(a, b, DebugFlags::default()).await.unwrap();
}

/// Sorted names in a directory, `.filoco` excluded
fn listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n != ".filoco")
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn placeholders_materialize_the_tree() {
    let da = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    fs::create_dir_all(da.path().join("x/y")).unwrap();
    fs::write(da.path().join("x/y/hello.txt"), b"content").unwrap();
    let a = new_store(da.path());
    let b = new_store(db.path());

    scan_once(&a).await;
    sync(&a, &b).await;
    apply(&b).await;

    // B's filesystem mirrors A's names: dirs as empty dirs, the file as
    // a dangling sentinel symlink.
    assert!(db.path().join("x").is_dir());
    assert!(db.path().join("x/y").is_dir());
    let file = db.path().join("x/y/hello.txt");
    let target = fs::read_link(&file).unwrap();
    assert_eq!(target, Path::new(PLACEHOLDER_TARGET));

    // No dirty FOBs remain, and the staging area is empty.
    assert!(!b.any_dirty_fobs().unwrap());
    assert_eq!(
        fs::read_dir(b.placeholder_path()).unwrap().count(),
        0,
        "placeholder staging must be drained"
    );

    // The placeholders are paired with the replicated FOBs.
    let root_ino = b.inode_by_iid(ROOT_IID).unwrap().unwrap().ino;
    let x_link = b.link_get(root_ino, "x").unwrap().unwrap();
    let x_row = b.inode_by_ino(x_link.ino).unwrap().unwrap();
    assert!(x_row.fob.is_some());
    assert!(x_row.fcv.is_none());
}

#[tokio::test]
async fn apply_is_idempotent() {
    let da = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    fs::write(da.path().join("one.txt"), b"1").unwrap();
    let a = new_store(da.path());
    let b = new_store(db.path());

    scan_once(&a).await;
    sync(&a, &b).await;
    apply(&b).await;
    let first = listing(db.path());
    apply(&b).await;
    assert_eq!(listing(db.path()), first);
    assert_eq!(first, vec!["one.txt".to_string()]);
}

#[tokio::test]
async fn rename_propagates() {
    let da = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    fs::write(da.path().join("hello.txt"), b"x").unwrap();
    let a = new_store(da.path());
    let b = new_store(db.path());

    scan_once(&a).await;
    sync(&a, &b).await;
    apply(&b).await;
    assert_eq!(listing(db.path()), vec!["hello.txt".to_string()]);

    fs::rename(da.path().join("hello.txt"), da.path().join("world.txt")).unwrap();
    scan_once(&a).await;
    sync(&a, &b).await;
    apply(&b).await;

    assert_eq!(listing(db.path()), vec!["world.txt".to_string()]);
    // Same placeholder inode, just renamed.
    let target = fs::read_link(db.path().join("world.txt")).unwrap();
    assert_eq!(target, Path::new(PLACEHOLDER_TARGET));
}

#[tokio::test]
async fn move_between_directories_propagates() {
    let da = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    fs::create_dir(da.path().join("src")).unwrap();
    fs::create_dir(da.path().join("dst")).unwrap();
    fs::write(da.path().join("src/file"), b"x").unwrap();
    let a = new_store(da.path());
    let b = new_store(db.path());

    scan_once(&a).await;
    sync(&a, &b).await;
    apply(&b).await;
    assert!(db.path().join("src/file").exists() || fs::read_link(db.path().join("src/file")).is_ok());

    fs::rename(da.path().join("src/file"), da.path().join("dst/file")).unwrap();
    scan_once(&a).await;
    sync(&a, &b).await;
    apply(&b).await;

    assert!(fs::read_link(db.path().join("dst/file")).is_ok());
    assert!(fs::symlink_metadata(db.path().join("src/file")).is_err());
}

#[tokio::test]
async fn pigeonhole_conflict_keeps_both_longnamed() {
    let da = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    fs::write(da.path().join("foo"), b"from a").unwrap();
    fs::write(db.path().join("foo"), b"from b").unwrap();
    let a = new_store(da.path());
    let b = new_store(db.path());
    scan_once(&a).await;
    scan_once(&b).await;

    sync(&a, &b).await;
    apply(&b).await;

    let names = listing(db.path());
    assert_eq!(names.len(), 2, "both claimants survive: {names:?}");
    for name in &names {
        assert!(
            filoco_core::is_longname(name),
            "conflicting claimants stay longnamed, got {name}"
        );
        assert_eq!(filoco_core::shortname(name), "foo");
    }

    // B's own file kept its content; A's arrived as a placeholder.
    let mut kinds: Vec<bool> = names
        .iter()
        .map(|n| fs::symlink_metadata(db.path().join(n)).unwrap().is_symlink())
        .collect();
    kinds.sort();
    assert_eq!(kinds, vec![false, true]);
}

#[tokio::test]
async fn rename_cycle_swaps_cleanly() {
    let da = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    fs::write(da.path().join("a"), b"first").unwrap();
    fs::write(da.path().join("b"), b"second").unwrap();
    let a = new_store(da.path());
    let b = new_store(db.path());
    scan_once(&a).await;
    sync(&a, &b).await;
    apply(&b).await;

    let fob_at = |store: &Store, name: &str| -> Id128 {
        let root_ino = store.inode_by_iid(ROOT_IID).unwrap().unwrap().ino;
        let link = store.link_get(root_ino, name).unwrap().unwrap();
        store.inode_by_ino(link.ino).unwrap().unwrap().fob.unwrap()
    };
    let fob_a = fob_at(&b, "a");
    let fob_b = fob_at(&b, "b");

    // Swap the two names on A.
    fs::rename(da.path().join("a"), da.path().join("swap.tmp")).unwrap();
    fs::rename(da.path().join("b"), da.path().join("a")).unwrap();
    fs::rename(da.path().join("swap.tmp"), da.path().join("b")).unwrap();
    scan_once(&a).await;
    sync(&a, &b).await;
    apply(&b).await;

    // B ends up swapped, with no longname leftovers.
    assert_eq!(listing(db.path()), vec!["a".to_string(), "b".to_string()]);
    assert_eq!(fob_at(&b, "a"), fob_b);
    assert_eq!(fob_at(&b, "b"), fob_a);
}

#[tokio::test]
async fn apply_without_prior_scan_bootstraps_root() {
    // A store that never ran a scanner can still apply received metadata.
    let da = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    fs::write(da.path().join("seed"), b"x").unwrap();
    let a = new_store(da.path());
    let b = new_store(db.path());
    scan_once(&a).await;
    sync(&a, &b).await;

    assert!(b.inode_by_iid(ROOT_IID).unwrap().is_none());
    apply(&b).await;
    assert!(b.inode_by_iid(ROOT_IID).unwrap().is_some());
    assert_eq!(listing(db.path()), vec!["seed".to_string()]);
}

#[tokio::test]
async fn rescan_after_apply_creates_nothing_new() {
    // The applier keeps inode/link records consistent, so a following
    // scan must not originate fresh syncables for the placeholders.
    let da = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    fs::create_dir(da.path().join("d")).unwrap();
    fs::write(da.path().join("d/f"), b"x").unwrap();
    let a = new_store(da.path());
    let b = new_store(db.path());
    scan_once(&a).await;
    sync(&a, &b).await;
    apply(&b).await;

    let count = b.syncable_count().unwrap();
    scan_once(&b).await;
    assert_eq!(b.syncable_count().unwrap(), count);
}
