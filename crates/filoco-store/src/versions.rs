//! Version-head queries
//!
//! Read-side helpers over the FLV/FCV DAGs: current heads, pigeonhole
//! conflicts and the dirty-FOB batching the applier walks.

use rusqlite::OptionalExtension;

use filoco_core::{Flv, FobType, Id128, Kind};

use crate::error::Result;
use crate::store::Store;
use crate::syncables::split_ids;

/// One version record rendered as a DAG node, for `info` diagnostics
#[derive(Debug, Clone)]
pub struct VersionNode {
    /// Version id
    pub id: Id128,
    /// Human-readable summary of the version
    pub label: String,
    /// Predecessor version ids
    pub parent_vers: Vec<Id128>,
    /// True if no other version supersedes this one
    pub is_head: bool,
}

/// An FLV joined with its syncable bookkeeping
#[derive(Debug, Clone)]
pub struct FlvRow {
    /// The location version itself
    pub flv: Flv,
    /// Wall-clock creation stamp from the syncables row
    pub created: i64,
    /// Local insertion order
    pub insert_order: i64,
}

/// A FOB with a pending `_new_flvs` stamp, as walked by the applier
#[derive(Debug, Clone)]
pub struct DirtyFob {
    /// Table rowid, the batching cursor
    pub rowid: i64,
    /// FOB id
    pub id: Id128,
    /// FOB type
    pub ftype: FobType,
    /// The stamp observed; cleared only if still current (CAS)
    pub new_flvs: i64,
}

fn flv_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FlvRow> {
    let to_conv_err = |e: filoco_core::ModelError| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Blob, Box::new(e))
    };
    let id: Vec<u8> = row.get("id")?;
    let fob: Vec<u8> = row.get("fob")?;
    let parent_fob: Option<Vec<u8>> = row.get("parent_fob")?;
    let parent_vers: String = row.get("parent_vers")?;
    Ok(FlvRow {
        flv: Flv {
            id: Id128::from_slice(&id).map_err(to_conv_err)?,
            fob: Id128::from_slice(&fob).map_err(to_conv_err)?,
            parent_fob: parent_fob
                .map(|p| Id128::from_slice(&p))
                .transpose()
                .map_err(to_conv_err)?,
            name: row.get("name")?,
            parent_vers: split_ids(&parent_vers).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Text,
                    Box::new(e),
                )
            })?,
        },
        created: row.get("created")?,
        insert_order: row.get("insert_order")?,
    })
}

impl Store {
    /// Head FLVs of a FOB, newest first
    ///
    /// There is normally exactly one; several heads mean a name conflict
    /// between stores that the applier resolves by the newest-first
    /// pigeonhole policy.
    pub fn head_flvs(&self, fob: &Id128) -> Result<Vec<FlvRow>> {
        let conn = self.db().conn();
        let mut stmt = conn.prepare(
            "SELECT f.id, f.fob, f.parent_fob, f.name, f.parent_vers, s.created, s.insert_order \
             FROM flvs f JOIN syncables s ON f.id = s.id \
             WHERE f.fob = ?1 AND f._is_head = 1 \
             ORDER BY s.created DESC, s.insert_order DESC",
        )?;
        let rows = stmt.query_map([fob.as_bytes().as_slice()], flv_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Head FLVs of *other* FOBs claiming the same `(parent_fob, name)`
    pub fn pigeonhole_conflicts(&self, flv: &Flv) -> Result<Vec<FlvRow>> {
        let conn = self.db().conn();
        let sql = if flv.parent_fob.is_some() {
            "SELECT f.id, f.fob, f.parent_fob, f.name, f.parent_vers, s.created, s.insert_order \
             FROM flvs f JOIN syncables s ON f.id = s.id \
             WHERE f._is_head = 1 AND f.parent_fob = ?1 AND f.name = ?2 AND f.fob != ?3"
        } else {
            "SELECT f.id, f.fob, f.parent_fob, f.name, f.parent_vers, s.created, s.insert_order \
             FROM flvs f JOIN syncables s ON f.id = s.id \
             WHERE f._is_head = 1 AND f.parent_fob IS NULL AND ?1 IS NULL \
               AND f.name = ?2 AND f.fob != ?3"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(
            rusqlite::params![
                flv.parent_fob.as_ref().map(|p| p.as_bytes().to_vec()),
                flv.name,
                flv.fob.as_bytes().as_slice()
            ],
            flv_from_row,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Type of a FOB, if known
    pub fn fob_type(&self, fob: &Id128) -> Result<Option<FobType>> {
        let ftype: Option<String> = self
            .db()
            .conn()
            .query_row(
                "SELECT type FROM fobs WHERE id = ?1",
                [fob.as_bytes().as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(ftype.map(|t| FobType::parse(&t)).transpose()?)
    }

    /// FOBs with a pending location update, by rowid, bounded batch
    pub fn dirty_fobs(&self, start_rowid: i64, limit: usize, force: bool) -> Result<Vec<DirtyFob>> {
        let conn = self.db().conn();
        let sql = if force {
            "SELECT rowid, id, type, _new_flvs FROM fobs \
             WHERE rowid >= ?1 ORDER BY rowid LIMIT ?2"
        } else {
            "SELECT rowid, id, type, _new_flvs FROM fobs \
             WHERE _new_flvs > 0 AND rowid >= ?1 ORDER BY rowid LIMIT ?2"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(rusqlite::params![start_rowid, limit as i64], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (rowid, id, ftype, new_flvs) = row?;
            out.push(DirtyFob {
                rowid,
                id: Id128::from_slice(&id)?,
                ftype: FobType::parse(&ftype)?,
                new_flvs,
            });
        }
        Ok(out)
    }

    /// A dirty FOB by id, used when extending an applier batch
    pub fn dirty_fob_by_id(&self, id: &Id128) -> Result<Option<DirtyFob>> {
        Ok(self
            .db()
            .conn()
            .query_row(
                "SELECT rowid, id, type, _new_flvs FROM fobs WHERE id = ?1",
                [id.as_bytes().as_slice()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?
            .map(|(rowid, id, ftype, new_flvs)| {
                Ok::<_, crate::error::StoreError>(DirtyFob {
                    rowid,
                    id: Id128::from_slice(&id)?,
                    ftype: FobType::parse(&ftype)?,
                    new_flvs,
                })
            })
            .transpose()?)
    }

    /// All version records of a FOB as graph nodes, for diagnostics
    ///
    /// `kind` selects the location or content DAG. Labels summarize the
    /// version: `parent/name` for locations, the content digest (or
    /// `working`) for contents.
    pub fn version_graph(&self, fob: &Id128, kind: Kind) -> Result<Vec<VersionNode>> {
        let conn = self.db().conn();
        let mut out = Vec::new();
        match kind {
            Kind::Flv => {
                let mut stmt = conn.prepare(
                    "SELECT id, parent_fob, name, parent_vers, _is_head FROM flvs WHERE fob = ?1",
                )?;
                let rows = stmt.query_map([fob.as_bytes().as_slice()], |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Option<Vec<u8>>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                })?;
                for row in rows {
                    let (id, parent_fob, name, parent_vers, is_head) = row?;
                    let parent_label = match parent_fob {
                        Some(p) => Id128::from_slice(&p)?.to_hex(),
                        None => "(root)".to_string(),
                    };
                    out.push(VersionNode {
                        id: Id128::from_slice(&id)?,
                        label: format!("{parent_label}/{name}"),
                        parent_vers: split_ids(&parent_vers)?,
                        is_head: is_head != 0,
                    });
                }
            }
            Kind::Fcv => {
                let mut stmt = conn.prepare(
                    "SELECT id, content_hash, parent_vers, _is_head FROM fcvs WHERE fob = ?1",
                )?;
                let rows = stmt.query_map([fob.as_bytes().as_slice()], |row| {
                    Ok((
                        row.get::<_, Vec<u8>>(0)?,
                        row.get::<_, Option<Vec<u8>>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                })?;
                for row in rows {
                    let (id, content_hash, parent_vers, is_head) = row?;
                    let label = match content_hash {
                        Some(h) => hex::encode(h),
                        None => "working".to_string(),
                    };
                    out.push(VersionNode {
                        id: Id128::from_slice(&id)?,
                        label,
                        parent_vers: split_ids(&parent_vers)?,
                        is_head: is_head != 0,
                    });
                }
            }
            Kind::Fob => {
                return Err(crate::error::StoreError::InvariantViolated(
                    "FOBs have no version graph".into(),
                ))
            }
        }
        Ok(out)
    }

    /// Clears a FOB's `_new_flvs` stamp only if it still equals `stamp`
    ///
    /// Stamp-versioned compare-and-set: a scanner or receiver that bumped
    /// the stamp concurrently keeps the FOB dirty.
    pub fn clear_flv_stamp(&self, fob: &Id128, stamp: i64) -> Result<bool> {
        self.db().conn().execute(
            "UPDATE fobs SET _new_flvs = 0 WHERE id = ?1 AND _new_flvs = ?2",
            rusqlite::params![fob.as_bytes().as_slice(), stamp],
        )?;
        Ok(self.db().changes() > 0)
    }

    /// True if any FOB still carries a nonzero `_new_flvs` stamp
    pub fn any_dirty_fobs(&self) -> Result<bool> {
        let n: i64 = self.db().conn().query_row(
            "SELECT count(*) FROM fobs WHERE _new_flvs > 0",
            [],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SyncMode;
    use crate::syncables::SyncableRecord;
    use filoco_core::{DebugFlags, Fob, StoreId, SyncableBody};

    fn scratch_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store =
            Store::initialize(dir.path(), None, SyncMode::Synctree, DebugFlags::default()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_single_head() {
        let (_dir, store) = scratch_store();
        let (fob, flv1, _) = store.create_fob(FobType::Regular, "a", None).unwrap();
        let flv2 = store.create_flv(fob, None, "b", vec![flv1]).unwrap();
        let heads = store.head_flvs(&fob).unwrap();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].flv.id, flv2);
        assert_eq!(heads[0].flv.name, "b");
    }

    #[test]
    fn test_pigeonhole_conflicts_at_root() {
        let (_dir, store) = scratch_store();
        let (_, _, _) = store.create_fob(FobType::Regular, "same", None).unwrap();
        let (fob2, _, _) = store.create_fob(FobType::Regular, "same", None).unwrap();
        let head2 = &store.head_flvs(&fob2).unwrap()[0];
        let conflicts = store.pigeonhole_conflicts(&head2.flv).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_ne!(conflicts[0].flv.fob, fob2);
    }

    #[test]
    fn test_dirty_batching_and_cas() {
        let (_dir, store) = scratch_store();
        let remote = StoreId::from_bytes([7u8; 32]);
        let fob_id = Id128::generate();
        store
            .insert_syncable(
                &SyncableRecord {
                    origin: remote,
                    serial: 1,
                    body: SyncableBody::Fob(Fob {
                        id: fob_id,
                        ftype: FobType::Directory,
                    }),
                },
                true,
            )
            .unwrap();
        let flv = filoco_core::Flv {
            id: Id128::generate(),
            fob: fob_id,
            parent_fob: None,
            name: "d".into(),
            parent_vers: vec![],
        };
        store
            .insert_syncable(
                &SyncableRecord {
                    origin: remote,
                    serial: 2,
                    body: SyncableBody::Flv(flv),
                },
                true,
            )
            .unwrap();

        let dirty = store.dirty_fobs(0, 10, false).unwrap();
        assert_eq!(dirty.len(), 1);
        let stamp = dirty[0].new_flvs;
        assert!(stamp > 0);

        // A mismatched stamp must not clear.
        assert!(!store.clear_flv_stamp(&fob_id, stamp + 1).unwrap());
        assert!(store.any_dirty_fobs().unwrap());
        assert!(store.clear_flv_stamp(&fob_id, stamp).unwrap());
        assert!(!store.any_dirty_fobs().unwrap());
    }
}
