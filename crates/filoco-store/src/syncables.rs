//! Syncable insertion and queries
//!
//! All mutations of the replicated tables go through here so the store
//! invariants hold everywhere:
//!
//! - `insert_order` is assigned by SQLite AUTOINCREMENT at first local
//!   insertion and never reused.
//! - A version record's parents are head-flipped in the same transaction
//!   that inserts the record.
//! - Every insertion folds the id into the persistent synctree.
//! - Serial numbers are per-origin monotone; the self store's counter
//!   lives on its `stores` row.

use std::collections::HashMap;

use rusqlite::OptionalExtension;
use tracing::trace;

use filoco_core::{Fcv, Flv, Fob, FobType, Id128, Kind, StoreId, SyncableBody};

use crate::error::{Result, StoreError};
use crate::store::Store;
use crate::tree;

/// A syncable as it travels between stores: body plus origin stamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncableRecord {
    /// Store that originated the record
    pub origin: StoreId,
    /// Per-origin monotone serial
    pub serial: i64,
    /// The record itself
    pub body: SyncableBody,
}

/// A syncable as stored locally, with its local bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSyncable {
    /// Local insertion order, strictly increasing
    pub insert_order: i64,
    /// Wall-clock seconds at first local insertion
    pub created: i64,
    /// The replicated record
    pub record: SyncableRecord,
}

/// Joins version ids for the `parent_vers` column
pub fn join_ids(ids: &[Id128]) -> String {
    ids.iter()
        .map(Id128::to_hex)
        .collect::<Vec<_>>()
        .join(",")
}

/// Splits a `parent_vers` column back into ids
pub fn split_ids(s: &str) -> Result<Vec<Id128>> {
    s.split(',')
        .filter(|part| !part.is_empty())
        .map(|part| Id128::from_hex(part).map_err(StoreError::from))
        .collect()
}

/// Wall-clock seconds since the epoch
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Store {
    /// Interns an origin store id, returning its local index
    pub fn origin_idx(&self, origin: &StoreId) -> Result<i64> {
        let conn = self.db().conn();
        let existing: Option<i64> = conn
            .query_row(
                "SELECT idx FROM stores WHERE store_id = ?1",
                [origin.to_hex()],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(idx) = existing {
            return Ok(idx);
        }
        conn.execute(
            "INSERT INTO stores (store_id) VALUES (?1)",
            [origin.to_hex()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Store id of an interned origin index
    pub fn origin_by_idx(&self, idx: i64) -> Result<StoreId> {
        let hex: String = self.db().conn().query_row(
            "SELECT store_id FROM stores WHERE idx = ?1",
            [idx],
            |row| row.get(0),
        )?;
        Ok(StoreId::from_hex(&hex)?)
    }

    /// Allocates the next serial for locally-originated syncables
    pub fn alloc_serial(&self) -> Result<i64> {
        let conn = self.db().conn();
        conn.execute(
            "UPDATE stores SET latest_serial = latest_serial + 1 WHERE self = 1",
            [],
        )?;
        let serial: i64 =
            conn.query_row("SELECT latest_serial FROM stores WHERE self = 1", [], |row| {
                row.get(0)
            })?;
        Ok(serial)
    }

    /// True if a syncable with this id is already stored
    pub fn has_syncable(&self, id: &Id128) -> Result<bool> {
        let n: i64 = self.db().conn().query_row(
            "SELECT count(*) FROM syncables WHERE id = ?1",
            [id.as_bytes().as_slice()],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    /// Inserts one syncable: shared row, kind row, head flips, tree fold
    ///
    /// `mark_dirty` stamps the owning FOB's `_new_flvs`/`_new_fcvs` so the
    /// applier visits it; the receive path sets it, locally-originated
    /// records (the filesystem already matches them) do not.
    ///
    /// Returns the assigned `insert_order`.
    pub fn insert_syncable(&self, rec: &SyncableRecord, mark_dirty: bool) -> Result<i64> {
        let txn = self.db().ensure_transaction()?;
        let conn = self.db().conn();
        let id = rec.body.id();
        let origin_idx = self.origin_idx(&rec.origin)?;
        // Keep the per-origin high-water mark current so serial-mode
        // reconciliation knows what we have seen.
        conn.execute(
            "UPDATE stores SET latest_serial = max(latest_serial, ?1) WHERE idx = ?2",
            rusqlite::params![rec.serial, origin_idx],
        )?;
        let tree_key = filoco_synctree::leaf_pos(&id) as i64;
        self.db().trace_write("INSERT INTO syncables");
        conn.execute(
            "INSERT INTO syncables (id, kind, origin_idx, serial, tree_key, created) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                id.as_bytes().as_slice(),
                rec.body.kind().as_str(),
                origin_idx,
                rec.serial,
                tree_key,
                unix_now(),
            ],
        )?;
        let insert_order = conn.last_insert_rowid();

        match &rec.body {
            SyncableBody::Fob(fob) => {
                conn.execute(
                    "INSERT INTO fobs (id, type) VALUES (?1, ?2)",
                    rusqlite::params![
                        fob.id.as_bytes().as_slice(),
                        fob.ftype.as_char().to_string()
                    ],
                )?;
            }
            SyncableBody::Flv(flv) => {
                self.flip_heads("flvs", &flv.parent_vers)?;
                conn.execute(
                    "INSERT INTO flvs (id, fob, parent_fob, name, parent_vers, _is_head) \
                     VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                    rusqlite::params![
                        flv.id.as_bytes().as_slice(),
                        flv.fob.as_bytes().as_slice(),
                        flv.parent_fob.as_ref().map(|p| p.as_bytes().to_vec()),
                        flv.name,
                        join_ids(&flv.parent_vers),
                    ],
                )?;
                if mark_dirty {
                    conn.execute(
                        "UPDATE fobs SET _new_flvs = ?1 WHERE id = ?2",
                        rusqlite::params![unix_now(), flv.fob.as_bytes().as_slice()],
                    )?;
                }
            }
            SyncableBody::Fcv(fcv) => {
                self.flip_heads("fcvs", &fcv.parent_vers)?;
                conn.execute(
                    "INSERT INTO fcvs (id, fob, content_hash, parent_vers, _is_head) \
                     VALUES (?1, ?2, ?3, ?4, 1)",
                    rusqlite::params![
                        fcv.id.as_bytes().as_slice(),
                        fcv.fob.as_bytes().as_slice(),
                        fcv.content_hash,
                        join_ids(&fcv.parent_vers),
                    ],
                )?;
                if mark_dirty {
                    conn.execute(
                        "UPDATE fobs SET _new_fcvs = ?1 WHERE id = ?2",
                        rusqlite::params![unix_now(), fcv.fob.as_bytes().as_slice()],
                    )?;
                }
            }
        }

        tree::toggle(self.db(), &id)?;
        txn.commit()?;
        trace!(id = %id, kind = rec.body.kind().as_str(), insert_order, "Inserted syncable");
        Ok(insert_order)
    }

    fn flip_heads(&self, table: &str, parents: &[Id128]) -> Result<()> {
        if parents.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; parents.len()].join(",");
        let sql = format!("UPDATE {table} SET _is_head = 0 WHERE id IN ({placeholders})");
        let params: Vec<Vec<u8>> = parents.iter().map(|p| p.as_bytes().to_vec()).collect();
        self.db()
            .conn()
            .execute(&sql, rusqlite::params_from_iter(params))?;
        Ok(())
    }

    /// Originates a FOB with its initial FLV and, for regular files, a
    /// working FCV
    ///
    /// Returns `(fob_id, flv_id, fcv_id)`.
    pub fn create_fob(
        &self,
        ftype: FobType,
        name: &str,
        parent_fob: Option<Id128>,
    ) -> Result<(Id128, Id128, Option<Id128>)> {
        let txn = self.db().ensure_transaction()?;
        let origin = self.store_id();
        let fob_id = Id128::generate();
        self.insert_syncable(
            &SyncableRecord {
                origin,
                serial: self.alloc_serial()?,
                body: SyncableBody::Fob(Fob {
                    id: fob_id,
                    ftype,
                }),
            },
            false,
        )?;
        let flv_id = self.create_flv(fob_id, parent_fob, name, Vec::new())?;
        let fcv_id = if ftype == FobType::Regular {
            Some(self.create_working_fcv(fob_id, None)?)
        } else {
            None
        };
        txn.commit()?;
        Ok((fob_id, flv_id, fcv_id))
    }

    /// Originates a new FLV for an existing FOB
    pub fn create_flv(
        &self,
        fob: Id128,
        parent_fob: Option<Id128>,
        name: &str,
        parent_vers: Vec<Id128>,
    ) -> Result<Id128> {
        filoco_core::validate_name(name)?;
        let id = Id128::generate();
        self.insert_syncable(
            &SyncableRecord {
                origin: self.store_id(),
                serial: self.alloc_serial()?,
                body: SyncableBody::Flv(Flv {
                    id,
                    fob,
                    parent_fob,
                    name: name.to_string(),
                    parent_vers,
                }),
            },
            false,
        )?;
        Ok(id)
    }

    /// Originates a working (undigested) FCV for an existing FOB
    pub fn create_working_fcv(&self, fob: Id128, parent_fcv: Option<Id128>) -> Result<Id128> {
        let id = Id128::generate();
        self.insert_syncable(
            &SyncableRecord {
                origin: self.store_id(),
                serial: self.alloc_serial()?,
                body: SyncableBody::Fcv(Fcv {
                    id,
                    fob,
                    content_hash: None,
                    parent_vers: parent_fcv.into_iter().collect(),
                }),
            },
            false,
        )?;
        Ok(id)
    }

    /// Fetches a stored syncable with its body
    pub fn get_syncable(&self, id: &Id128) -> Result<Option<StoredSyncable>> {
        let conn = self.db().conn();
        let head: Option<(i64, String, i64, i64, i64)> = conn
            .query_row(
                "SELECT insert_order, kind, origin_idx, serial, created \
                 FROM syncables WHERE id = ?1",
                [id.as_bytes().as_slice()],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((insert_order, kind, origin_idx, serial, created)) = head else {
            return Ok(None);
        };
        let kind = Kind::parse(&kind)?;
        let body = self.load_body(kind, id)?;
        Ok(Some(StoredSyncable {
            insert_order,
            created,
            record: SyncableRecord {
                origin: self.origin_by_idx(origin_idx)?,
                serial,
                body,
            },
        }))
    }

    fn load_body(&self, kind: Kind, id: &Id128) -> Result<SyncableBody> {
        let conn = self.db().conn();
        let id_blob = id.as_bytes().as_slice();
        match kind {
            Kind::Fob => {
                let ftype: String = conn.query_row(
                    "SELECT type FROM fobs WHERE id = ?1",
                    [id_blob],
                    |row| row.get(0),
                )?;
                Ok(SyncableBody::Fob(Fob {
                    id: *id,
                    ftype: FobType::parse(&ftype)?,
                }))
            }
            Kind::Flv => {
                let (fob, parent_fob, name, parent_vers): (
                    Vec<u8>,
                    Option<Vec<u8>>,
                    String,
                    String,
                ) = conn.query_row(
                    "SELECT fob, parent_fob, name, parent_vers FROM flvs WHERE id = ?1",
                    [id_blob],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
                )?;
                Ok(SyncableBody::Flv(Flv {
                    id: *id,
                    fob: Id128::from_slice(&fob)?,
                    parent_fob: parent_fob.map(|p| Id128::from_slice(&p)).transpose()?,
                    name,
                    parent_vers: split_ids(&parent_vers)?,
                }))
            }
            Kind::Fcv => {
                let (fob, content_hash, parent_vers): (Vec<u8>, Option<Vec<u8>>, String) = conn
                    .query_row(
                        "SELECT fob, content_hash, parent_vers FROM fcvs WHERE id = ?1",
                        [id_blob],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )?;
                Ok(SyncableBody::Fcv(Fcv {
                    id: *id,
                    fob: Id128::from_slice(&fob)?,
                    content_hash,
                    parent_vers: split_ids(&parent_vers)?,
                }))
            }
        }
    }

    /// Per-origin maximum serial over everything this store holds
    pub fn max_serials(&self) -> Result<HashMap<StoreId, i64>> {
        let conn = self.db().conn();
        let mut stmt = conn.prepare(
            "SELECT s.store_id, max(y.serial) FROM syncables y \
             JOIN stores s ON y.origin_idx = s.idx GROUP BY s.idx",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut out = HashMap::new();
        for row in rows {
            let (hex, serial) = row?;
            out.insert(StoreId::from_hex(&hex)?, serial);
        }
        Ok(out)
    }

    /// All origin store ids this store has ever seen (including itself)
    pub fn known_origins(&self) -> Result<Vec<StoreId>> {
        let conn = self.db().conn();
        let mut stmt = conn.prepare("SELECT store_id FROM stores ORDER BY idx")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(StoreId::from_hex(&row?)?);
        }
        Ok(out)
    }

    /// `(insert_order, id)` of syncables from `origin` with serial beyond
    /// `after`
    pub fn ids_after_serial(&self, origin: &StoreId, after: i64) -> Result<Vec<(i64, Id128)>> {
        let idx = self.origin_idx(origin)?;
        let conn = self.db().conn();
        let mut stmt = conn.prepare(
            "SELECT insert_order, id FROM syncables \
             WHERE origin_idx = ?1 AND serial > ?2 ORDER BY insert_order",
        )?;
        let rows = stmt.query_map(rusqlite::params![idx, after], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (order, id) = row?;
            out.push((order, Id128::from_slice(&id)?));
        }
        Ok(out)
    }

    /// `(insert_order, id)` of syncables whose tree key falls in a subtree
    pub fn ids_in_tree_range(&self, low: u64, high: u64) -> Result<Vec<(i64, Id128)>> {
        let conn = self.db().conn();
        let mut stmt = conn.prepare(
            "SELECT insert_order, id FROM syncables \
             WHERE tree_key BETWEEN ?1 AND ?2 ORDER BY insert_order",
        )?;
        let rows = stmt.query_map(rusqlite::params![low as i64, high as i64], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (order, id) = row?;
            out.push((order, Id128::from_slice(&id)?));
        }
        Ok(out)
    }

    /// Total number of syncables stored
    pub fn syncable_count(&self) -> Result<i64> {
        Ok(self
            .db()
            .conn()
            .query_row("SELECT count(*) FROM syncables", [], |row| row.get(0))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SyncMode;
    use filoco_core::DebugFlags;

    fn scratch_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Store::initialize(dir.path(), None, SyncMode::Synctree, DebugFlags::default()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_join_split_ids() {
        let ids = vec![Id128::generate(), Id128::generate()];
        assert_eq!(split_ids(&join_ids(&ids)).unwrap(), ids);
        assert!(split_ids("").unwrap().is_empty());
    }

    #[test]
    fn test_create_fob_chain() {
        let (_dir, store) = scratch_store();
        let (fob, flv, fcv) = store
            .create_fob(FobType::Regular, "hello.txt", None)
            .unwrap();
        assert!(fcv.is_some());

        let stored = store.get_syncable(&flv).unwrap().unwrap();
        match stored.record.body {
            SyncableBody::Flv(ref f) => {
                assert_eq!(f.fob, fob);
                assert_eq!(f.name, "hello.txt");
                assert!(f.parent_fob.is_none());
                assert!(f.parent_vers.is_empty());
            }
            ref other => panic!("expected FLV, got {other:?}"),
        }
        assert_eq!(store.syncable_count().unwrap(), 3);
    }

    #[test]
    fn test_directories_get_no_fcv() {
        let (_dir, store) = scratch_store();
        let (_, _, fcv) = store.create_fob(FobType::Directory, "docs", None).unwrap();
        assert!(fcv.is_none());
    }

    #[test]
    fn test_insert_order_monotone_and_fk_ordered() {
        let (_dir, store) = scratch_store();
        let (fob, flv1, _) = store.create_fob(FobType::Regular, "a", None).unwrap();
        let flv2 = store.create_flv(fob, None, "b", vec![flv1]).unwrap();

        let fob_order = store.get_syncable(&fob).unwrap().unwrap().insert_order;
        let flv1_order = store.get_syncable(&flv1).unwrap().unwrap().insert_order;
        let flv2_order = store.get_syncable(&flv2).unwrap().unwrap().insert_order;
        assert!(fob_order < flv1_order);
        assert!(flv1_order < flv2_order);
    }

    #[test]
    fn test_head_flipping() {
        let (_dir, store) = scratch_store();
        let (fob, flv1, _) = store.create_fob(FobType::Regular, "a", None).unwrap();
        let flv2 = store.create_flv(fob, None, "b", vec![flv1]).unwrap();

        let is_head = |id: &Id128| -> i64 {
            store
                .db()
                .conn()
                .query_row(
                    "SELECT _is_head FROM flvs WHERE id = ?1",
                    [id.as_bytes().as_slice()],
                    |row| row.get(0),
                )
                .unwrap()
        };
        assert_eq!(is_head(&flv1), 0);
        assert_eq!(is_head(&flv2), 1);
    }

    #[test]
    fn test_serial_allocation_monotone() {
        let (_dir, store) = scratch_store();
        let a = store.alloc_serial().unwrap();
        let b = store.alloc_serial().unwrap();
        assert!(b > a);
    }

    #[test]
    fn test_remote_insert_marks_dirty() {
        let (_dir, store) = scratch_store();
        let remote = StoreId::from_bytes([9u8; 32]);
        let fob_id = Id128::generate();
        store
            .insert_syncable(
                &SyncableRecord {
                    origin: remote,
                    serial: 1,
                    body: SyncableBody::Fob(Fob {
                        id: fob_id,
                        ftype: FobType::Regular,
                    }),
                },
                true,
            )
            .unwrap();
        let flv_id = Id128::generate();
        store
            .insert_syncable(
                &SyncableRecord {
                    origin: remote,
                    serial: 2,
                    body: SyncableBody::Flv(Flv {
                        id: flv_id,
                        fob: fob_id,
                        parent_fob: None,
                        name: "x".into(),
                        parent_vers: vec![],
                    }),
                },
                true,
            )
            .unwrap();
        let stamp: i64 = store
            .db()
            .conn()
            .query_row(
                "SELECT _new_flvs FROM fobs WHERE id = ?1",
                [fob_id.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .unwrap();
        assert!(stamp > 0);
        // Origin bookkeeping follows the insert.
        assert_eq!(store.max_serials().unwrap()[&remote], 2);
    }

    #[test]
    fn test_ids_after_serial() {
        let (_dir, store) = scratch_store();
        store.create_fob(FobType::Regular, "a", None).unwrap();
        let all = store
            .ids_after_serial(&store.store_id(), 0)
            .unwrap();
        assert_eq!(all.len(), 3);
        // Sorted by insert order.
        assert!(all.windows(2).all(|w| w[0].0 < w[1].0));
        let later = store.ids_after_serial(&store.store_id(), 2).unwrap();
        assert_eq!(later.len(), 1);
    }
}
