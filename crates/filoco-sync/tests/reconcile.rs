//! Reconciliation behavior over in-process socket pairs

use std::path::Path;

use filoco_core::{DebugFlags, FobType, Id128};
use filoco_scan::{ScanOptions, Scanner};
use filoco_store::{Store, SyncMode};
use filoco_sync::sync_local_pair;

fn new_store(dir: &Path, mode: SyncMode) -> Store {
    Store::initialize(dir, None, mode, DebugFlags::default()).unwrap()
}

async fn scan_once(store: &Store) {
    let mut scanner = Scanner::new(store, ScanOptions::default(), DebugFlags::default()).unwrap();
    scanner.run_once().await.unwrap();
}

/// All syncable ids with their origin serials, a store's replicated state
fn syncable_set(store: &Store) -> Vec<(String, String, i64)> {
    let conn = store.db().conn();
    let mut stmt = conn
        .prepare(
            "SELECT hex(y.id), s.store_id, y.serial FROM syncables y \
             JOIN stores s ON y.origin_idx = s.idx ORDER BY hex(y.id)",
        )
        .unwrap();
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .unwrap();
    rows.map(|r| r.unwrap()).collect()
}

/// The synctree table as sorted `(pos, xor, chxor)` rows
fn tree_dump(store: &Store) -> Vec<(i64, Vec<u8>, Vec<u8>)> {
    let conn = store.db().conn();
    let mut stmt = conn
        .prepare("SELECT pos, xor, chxor FROM synctree ORDER BY pos")
        .unwrap();
    let rows = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .unwrap();
    rows.map(|r| r.unwrap()).collect()
}

fn assert_converged(a: &Store, b: &Store) {
    assert_eq!(syncable_set(a), syncable_set(b), "syncable sets differ");
    assert_eq!(tree_dump(a), tree_dump(b), "synctrees differ");
    assert!(filoco_store::tree::verify_consistent(a.db()).unwrap());
    assert!(filoco_store::tree::verify_consistent(b.db()).unwrap());
}

#[tokio::test]
async fn empty_stores_reconcile_in_one_round() {
    let da = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    let a = new_store(da.path(), SyncMode::Synctree);
    let b = new_store(db.path(), SyncMode::Synctree);

    let (sa, sb) = sync_local_pair(&a, &b, DebugFlags::default()).await.unwrap();
    assert_eq!(sa.sent, 0);
    assert_eq!(sa.received, 0);
    assert_eq!(sa.rounds, 1);
    assert_eq!(sb.rounds, 1);
    assert_converged(&a, &b);
    assert_eq!(a.syncable_count().unwrap(), 0);
}

#[tokio::test]
async fn create_then_sync_converges() {
    let da = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(da.path().join("x/y")).unwrap();
    std::fs::write(da.path().join("x/y/hello.txt"), b"hi").unwrap();
    let a = new_store(da.path(), SyncMode::Synctree);
    let b = new_store(db.path(), SyncMode::Synctree);
    scan_once(&a).await;

    let (sa, sb) = sync_local_pair(&a, &b, DebugFlags::default()).await.unwrap();
    assert_eq!(sa.sent, 7, "3 FOBs + 3 FLVs + 1 FCV");
    assert_eq!(sb.received, 7);
    assert_eq!(sb.sent, 0);
    assert_converged(&a, &b);

    // Receives flag the FOBs for the applier.
    assert!(b.any_dirty_fobs().unwrap());
    assert!(!a.any_dirty_fobs().unwrap());
}

#[tokio::test]
async fn bidirectional_union() {
    let da = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    let a = new_store(da.path(), SyncMode::Synctree);
    let b = new_store(db.path(), SyncMode::Synctree);
    for i in 0..20 {
        a.create_fob(FobType::Regular, &format!("a{i}"), None).unwrap();
        b.create_fob(FobType::Directory, &format!("b{i}"), None).unwrap();
    }

    let (sa, sb) = sync_local_pair(&a, &b, DebugFlags::default()).await.unwrap();
    // 20 regular fobs: fob+flv+fcv; 20 dirs: fob+flv.
    assert_eq!(sa.sent, 60);
    assert_eq!(sb.sent, 40);
    assert_eq!(sa.received, 40);
    assert_eq!(sb.received, 60);
    assert_converged(&a, &b);
    assert_eq!(a.syncable_count().unwrap(), 100);
}

#[tokio::test]
async fn second_sync_transfers_nothing() {
    let da = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    let a = new_store(da.path(), SyncMode::Synctree);
    let b = new_store(db.path(), SyncMode::Synctree);
    a.create_fob(FobType::Regular, "once", None).unwrap();

    sync_local_pair(&a, &b, DebugFlags::default()).await.unwrap();
    let (sa, sb) = sync_local_pair(&a, &b, DebugFlags::default()).await.unwrap();
    assert_eq!(sa.sent, 0);
    assert_eq!(sa.received, 0);
    assert_eq!(sb.sent, 0);
    assert_converged(&a, &b);
}

#[tokio::test]
async fn single_difference_ships_one_object() {
    let da = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    let a = new_store(da.path(), SyncMode::Synctree);
    let b = new_store(db.path(), SyncMode::Synctree);
    let mut fobs = Vec::new();
    for i in 0..50 {
        let (fob, _, _) = a.create_fob(FobType::Regular, &format!("f{i}"), None).unwrap();
        fobs.push(fob);
    }
    sync_local_pair(&a, &b, DebugFlags::default()).await.unwrap();

    // One new syncable on A only.
    let head = a.head_flvs(&fobs[0]).unwrap()[0].flv.id;
    a.create_flv(fobs[0], None, "renamed", vec![head]).unwrap();

    let (sa, sb) = sync_local_pair(&a, &b, DebugFlags::default()).await.unwrap();
    assert_eq!(sa.sent, 1, "exactly one object on the wire");
    assert_eq!(sb.sent, 0);
    assert_eq!(sb.received, 1);
    // The single-difference shortcut terminates the descent at the first
    // level, far from the 48-level leaf depth.
    assert!(sa.rounds <= 6, "descent took {} rounds", sa.rounds);
    assert_converged(&a, &b);
}

#[tokio::test]
async fn serial_mode_converges() {
    let da = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    let a = new_store(da.path(), SyncMode::Serial);
    let b = new_store(db.path(), SyncMode::Serial);
    for i in 0..10 {
        a.create_fob(FobType::Regular, &format!("f{i}"), None).unwrap();
    }
    b.create_fob(FobType::Directory, "bdir", None).unwrap();

    let (sa, sb) = sync_local_pair(&a, &b, DebugFlags::default()).await.unwrap();
    assert_eq!(sa.sent, 30);
    assert_eq!(sb.sent, 2);
    assert_converged(&a, &b);

    // Incremental: another object then resync.
    a.create_fob(FobType::Regular, "extra", None).unwrap();
    let (sa2, _) = sync_local_pair(&a, &b, DebugFlags::default()).await.unwrap();
    assert_eq!(sa2.sent, 3);
    assert_converged(&a, &b);
}

#[tokio::test]
async fn three_way_propagation() {
    // C learns A's objects through B.
    let da = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    let dc = tempfile::tempdir().unwrap();
    let a = new_store(da.path(), SyncMode::Synctree);
    let b = new_store(db.path(), SyncMode::Synctree);
    let c = new_store(dc.path(), SyncMode::Synctree);
    a.create_fob(FobType::Regular, "origin-a", None).unwrap();

    sync_local_pair(&a, &b, DebugFlags::default()).await.unwrap();
    let (_, sc) = sync_local_pair(&b, &c, DebugFlags::default()).await.unwrap();
    assert_eq!(sc.received, 3);
    assert_converged(&a, &c);

    // Relayed records keep their origin identity.
    let origins = c.known_origins().unwrap();
    assert!(origins.contains(&a.store_id()));
}

#[tokio::test]
async fn received_ids_are_identical_records() {
    let da = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    let a = new_store(da.path(), SyncMode::Synctree);
    let b = new_store(db.path(), SyncMode::Synctree);
    let (fob, flv, fcv) = a.create_fob(FobType::Regular, "thing", None).unwrap();

    sync_local_pair(&a, &b, DebugFlags::default()).await.unwrap();

    for id in [fob, flv, fcv.unwrap()] {
        let ra = a.get_syncable(&id).unwrap().unwrap();
        let rb = b.get_syncable(&id).unwrap().unwrap();
        assert_eq!(ra.record, rb.record);
    }
    // B assigned its own insert order, monotone in A's.
    let orders: Vec<i64> = [fob, flv, fcv.unwrap()]
        .iter()
        .map(|id| b.get_syncable(id).unwrap().unwrap().insert_order)
        .collect();
    assert!(orders.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn scan_then_sync_then_rename_roundtrip() {
    let da = tempfile::tempdir().unwrap();
    let db = tempfile::tempdir().unwrap();
    std::fs::write(da.path().join("hello.txt"), b"x").unwrap();
    let a = new_store(da.path(), SyncMode::Synctree);
    let b = new_store(db.path(), SyncMode::Synctree);
    scan_once(&a).await;
    sync_local_pair(&a, &b, DebugFlags::default()).await.unwrap();

    std::fs::rename(da.path().join("hello.txt"), da.path().join("world.txt")).unwrap();
    scan_once(&a).await;
    let (sa, _) = sync_local_pair(&a, &b, DebugFlags::default()).await.unwrap();
    assert_eq!(sa.sent, 1, "one superseding FLV");
    assert_converged(&a, &b);

    // B sees the new head too (head maintenance runs on receive).
    let fob = {
        let heads: Vec<u8> = b
            .db()
            .conn()
            .query_row(
                "SELECT fob FROM flvs WHERE _is_head = 1 AND name = 'world.txt'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        Id128::from_slice(&heads).unwrap()
    };
    let heads = b.head_flvs(&fob).unwrap();
    assert_eq!(heads.len(), 1);
    assert_eq!(heads[0].flv.name, "world.txt");
}
