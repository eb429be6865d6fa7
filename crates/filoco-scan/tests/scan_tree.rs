//! End-to-end scanner behavior on real scratch stores

use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use filoco_core::{DebugFlags, FobType, Id128, SyncableBody};
use filoco_scan::{ScanOptions, Scanner};
use filoco_store::{ScanState, Store, SyncMode, ROOT_IID};

fn new_store(dir: &Path) -> Store {
    Store::initialize(dir, None, SyncMode::Synctree, DebugFlags::default()).unwrap()
}

async fn scan_once(store: &Store) {
    let mut scanner = Scanner::new(store, ScanOptions::default(), DebugFlags::default()).unwrap();
    scanner.run_once().await.unwrap();
}

fn fob_of(store: &Store, rel: &str) -> Option<(Id128, FobType)> {
    // Resolve a path through the links table from the root.
    let mut ino = store.inode_by_iid(ROOT_IID).unwrap().unwrap().ino;
    for part in rel.split('/') {
        let link = store.link_get(ino, part).unwrap()?;
        ino = link.ino;
    }
    let row = store.inode_by_ino(ino).unwrap()?;
    Some((row.fob?, row.ftype))
}

fn head_name(store: &Store, fob: &Id128) -> (Option<Id128>, String) {
    let heads = store.head_flvs(fob).unwrap();
    assert_eq!(heads.len(), 1, "expected a single head");
    (heads[0].flv.parent_fob, heads[0].flv.name.clone())
}

#[tokio::test]
async fn scan_builds_fob_chains() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("x/y")).unwrap();
    fs::write(dir.path().join("x/y/hello.txt"), b"hi").unwrap();
    let store = new_store(dir.path());

    scan_once(&store).await;

    let (x_fob, x_type) = fob_of(&store, "x").unwrap();
    let (y_fob, y_type) = fob_of(&store, "x/y").unwrap();
    let (h_fob, h_type) = fob_of(&store, "x/y/hello.txt").unwrap();
    assert_eq!(x_type, FobType::Directory);
    assert_eq!(y_type, FobType::Directory);
    assert_eq!(h_type, FobType::Regular);

    // FLV chain: x at root, y under x, hello.txt under y.
    assert_eq!(head_name(&store, &x_fob), (None, "x".to_string()));
    assert_eq!(head_name(&store, &y_fob), (Some(x_fob), "y".to_string()));
    assert_eq!(head_name(&store, &h_fob), (Some(y_fob), "hello.txt".to_string()));

    // 3 FOBs, 3 FLVs, 1 working FCV.
    assert_eq!(store.syncable_count().unwrap(), 7);

    // The directories settled.
    let root = store.inode_by_iid(ROOT_IID).unwrap().unwrap();
    assert_eq!(root.scan_state, ScanState::UpToDate);
}

#[tokio::test]
async fn rescan_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("f"), b"data").unwrap();
    let store = new_store(dir.path());

    scan_once(&store).await;
    let count = store.syncable_count().unwrap();
    scan_once(&store).await;
    assert_eq!(store.syncable_count().unwrap(), count);
}

#[tokio::test]
async fn rename_supersedes_location() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("hello.txt"), b"x").unwrap();
    let store = new_store(dir.path());
    scan_once(&store).await;

    let (fob, _) = fob_of(&store, "hello.txt").unwrap();
    let old_head = store.head_flvs(&fob).unwrap()[0].flv.id;

    fs::rename(dir.path().join("hello.txt"), dir.path().join("world.txt")).unwrap();
    scan_once(&store).await;

    let heads = store.head_flvs(&fob).unwrap();
    assert_eq!(heads.len(), 1);
    assert_eq!(heads[0].flv.name, "world.txt");
    assert_eq!(heads[0].flv.parent_vers, vec![old_head]);

    // The old FLV still exists (syncables are never deleted) but lost
    // its head flag.
    let stored = store.get_syncable(&old_head).unwrap().unwrap();
    match stored.record.body {
        SyncableBody::Flv(f) => assert_eq!(f.name, "hello.txt"),
        other => panic!("expected FLV, got {other:?}"),
    }
}

#[tokio::test]
async fn replace_inherits_fob() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("doc"), b"v1").unwrap();
    let store = new_store(dir.path());
    scan_once(&store).await;

    let (fob_before, _) = fob_of(&store, "doc").unwrap();
    let fcv_before = store
        .inode_by_ino(fs::metadata(dir.path().join("doc")).unwrap().ino())
        .unwrap()
        .unwrap()
        .fcv
        .unwrap();

    // Copy-then-rename-over: a new inode replaces the old one under the
    // same name.
    fs::write(dir.path().join("doc.tmp"), b"v2").unwrap();
    fs::rename(dir.path().join("doc.tmp"), dir.path().join("doc")).unwrap();
    scan_once(&store).await;

    let (fob_after, _) = fob_of(&store, "doc").unwrap();
    assert_eq!(fob_after, fob_before, "replacement must keep the FOB");

    let row = store
        .inode_by_ino(fs::metadata(dir.path().join("doc")).unwrap().ino())
        .unwrap()
        .unwrap();
    let fcv_after = row.fcv.unwrap();
    assert_ne!(fcv_after, fcv_before);
    // The new working version descends from the old one.
    match store.get_syncable(&fcv_after).unwrap().unwrap().record.body {
        SyncableBody::Fcv(f) => assert_eq!(f.parent_vers, vec![fcv_before]),
        other => panic!("expected FCV, got {other:?}"),
    }
}

#[tokio::test]
async fn unlink_removes_link_rows() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("gone"), b"x").unwrap();
    let store = new_store(dir.path());
    scan_once(&store).await;

    let root_ino = store.inode_by_iid(ROOT_IID).unwrap().unwrap().ino;
    assert!(store.link_get(root_ino, "gone").unwrap().is_some());

    fs::remove_file(dir.path().join("gone")).unwrap();
    scan_once(&store).await;
    assert!(store.link_get(root_ino, "gone").unwrap().is_none());
}

#[tokio::test]
async fn non_utf8_names_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let bad = std::ffi::OsStr::from_bytes(b"bad\xff\xfe");
    fs::write(dir.path().join(bad), b"x").unwrap();
    fs::write(dir.path().join("good"), b"x").unwrap();
    let store = new_store(dir.path());

    scan_once(&store).await;

    // The scan completed: the good entry is tracked, the bad one is not.
    assert!(fob_of(&store, "good").is_some());
    let root = store.inode_by_iid(ROOT_IID).unwrap().unwrap();
    assert_eq!(root.scan_state, ScanState::UpToDate);
    assert!(store.link_get(root.ino, "good").unwrap().is_some());
    assert_eq!(store.links_of_parent(root.ino).unwrap().len(), 1);
}

#[tokio::test]
async fn longnames_do_not_emit_flvs() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("report"), b"x").unwrap();
    let store = new_store(dir.path());
    scan_once(&store).await;

    let (fob, _) = fob_of(&store, "report").unwrap();
    let count = store.syncable_count().unwrap();

    // Locally qualify the file the way the applier would.
    let long = format!("report.FL-{}-1", fob.to_hex());
    fs::rename(dir.path().join("report"), dir.path().join(&long)).unwrap();
    scan_once(&store).await;

    // A longnamed entry is local-only: no new FLV was created.
    assert_eq!(store.syncable_count().unwrap(), count);
    let heads = store.head_flvs(&fob).unwrap();
    assert_eq!(heads[0].flv.name, "report");
}

#[tokio::test]
async fn second_scanner_is_locked_out() {
    let dir = tempfile::tempdir().unwrap();
    let store = new_store(dir.path());
    let _first = Scanner::new(&store, ScanOptions::default(), DebugFlags::default()).unwrap();
    let second = Scanner::new(&store, ScanOptions::default(), DebugFlags::default());
    assert!(matches!(second, Err(filoco_scan::ScanError::Locked)));
}

