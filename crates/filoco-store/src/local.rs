//! Local-only metadata: inode and link rows
//!
//! These tables bind kernel inodes to the replicated object model. They
//! never travel on the wire; a store rebuilt from its peers regrows them
//! by rescanning.

use rusqlite::OptionalExtension;

use filoco_core::{FobType, Id128};

use crate::error::{Result, StoreError};
use crate::fhandle::FileHandle;
use crate::store::Store;

/// `iid` of the store root inode
pub const ROOT_IID: &str = "ROOT";

/// Scan progress of an inode
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScanState {
    /// Directory contents never read
    NeverScanned,
    /// A racy mutation was observed mid-scan; rescan required
    NeedsRescan,
    /// A rescan was requested explicitly
    WantRescan,
    /// Contents match the last observed stat tuple
    UpToDate,
}

impl ScanState {
    /// Numeric encoding stored in the database
    pub fn as_i64(&self) -> i64 {
        match self {
            ScanState::NeverScanned => 0,
            ScanState::NeedsRescan => 1,
            ScanState::WantRescan => 2,
            ScanState::UpToDate => 100,
        }
    }

    /// Decodes the stored value
    pub fn from_i64(v: i64) -> ScanState {
        match v {
            0 => ScanState::NeverScanned,
            1 => ScanState::NeedsRescan,
            2 => ScanState::WantRescan,
            _ => ScanState::UpToDate,
        }
    }
}

/// One row of the `inodes` table
#[derive(Debug, Clone)]
pub struct InodeRow {
    /// Local inode record id, `ROOT` for the store root
    pub iid: String,
    /// Kernel inode number
    pub ino: u64,
    /// Stable kernel file handle
    pub handle: FileHandle,
    /// Filesystem type at record creation
    pub ftype: FobType,
    /// Last observed size in bytes
    pub size: Option<i64>,
    /// Last observed mtime, nanoseconds
    pub mtime: Option<i64>,
    /// Last observed ctime, nanoseconds
    pub ctime: Option<i64>,
    /// Birth time (approximated by mtime at first observation), nanoseconds
    pub btime: Option<i64>,
    /// Scan progress
    pub scan_state: ScanState,
    /// Assigned FOB, if any
    pub fob: Option<Id128>,
    /// Current FLV of the assignment
    pub flv: Option<Id128>,
    /// Current FCV of the assignment (null for directories, placeholders)
    pub fcv: Option<Id128>,
}

/// One row of the `links` table: an observed directory entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRow {
    /// Inode number of the containing directory
    pub parent: u64,
    /// Entry name
    pub name: String,
    /// Inode number the entry pointed at
    pub ino: u64,
}

fn inode_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InodeRow> {
    let opt_id = |v: Option<Vec<u8>>| -> rusqlite::Result<Option<Id128>> {
        v.map(|b| {
            Id128::from_slice(&b).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    0,
                    rusqlite::types::Type::Blob,
                    Box::new(e),
                )
            })
        })
        .transpose()
    };
    let ftype: String = row.get("type")?;
    Ok(InodeRow {
        iid: row.get("iid")?,
        ino: row.get::<_, i64>("ino")? as u64,
        handle: FileHandle {
            handle_type: row.get("handle_type")?,
            bytes: row.get("handle")?,
        },
        ftype: FobType::parse(&ftype).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?,
        size: row.get("size")?,
        mtime: row.get("mtime")?,
        ctime: row.get("ctime")?,
        btime: row.get("btime")?,
        scan_state: ScanState::from_i64(row.get("scan_state")?),
        fob: opt_id(row.get("fob")?)?,
        flv: opt_id(row.get("flv")?)?,
        fcv: opt_id(row.get("fcv")?)?,
    })
}

impl Store {
    /// Looks up an inode record by kernel inode number
    pub fn inode_by_ino(&self, ino: u64) -> Result<Option<InodeRow>> {
        Ok(self
            .db()
            .conn()
            .query_row(
                "SELECT * FROM inodes WHERE ino = ?1",
                [ino as i64],
                inode_from_row,
            )
            .optional()?)
    }

    /// Looks up an inode record by its `iid`
    pub fn inode_by_iid(&self, iid: &str) -> Result<Option<InodeRow>> {
        Ok(self
            .db()
            .conn()
            .query_row("SELECT * FROM inodes WHERE iid = ?1", [iid], inode_from_row)
            .optional()?)
    }

    /// All inode records paired with a FOB
    pub fn inodes_by_fob(&self, fob: &Id128) -> Result<Vec<InodeRow>> {
        let conn = self.db().conn();
        let mut stmt = conn.prepare("SELECT * FROM inodes WHERE fob = ?1")?;
        let rows = stmt.query_map([fob.as_bytes().as_slice()], inode_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Inserts a fresh inode record
    pub fn insert_inode(&self, row: &InodeRow) -> Result<()> {
        self.db().trace_write("INSERT INTO inodes");
        self.db().conn().execute(
            "INSERT INTO inodes \
             (iid, ino, handle_type, handle, type, size, mtime, ctime, btime, scan_state, fob, flv, fcv) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                row.iid,
                row.ino as i64,
                row.handle.handle_type,
                row.handle.bytes,
                row.ftype.as_char().to_string(),
                row.size,
                row.mtime,
                row.ctime,
                row.btime,
                row.scan_state.as_i64(),
                row.fob.as_ref().map(|v| v.as_bytes().to_vec()),
                row.flv.as_ref().map(|v| v.as_bytes().to_vec()),
                row.fcv.as_ref().map(|v| v.as_bytes().to_vec()),
            ],
        )?;
        Ok(())
    }

    /// Deletes an inode record; used once the underlying inode is known gone
    pub fn delete_inode(&self, iid: &str) -> Result<bool> {
        self.db()
            .conn()
            .execute("DELETE FROM inodes WHERE iid = ?1", [iid])?;
        Ok(self.db().changes() > 0)
    }

    /// Records a fresh stat tuple and scan state for an inode
    pub fn update_inode_stat(
        &self,
        ino: u64,
        size: i64,
        mtime: i64,
        ctime: i64,
        scan_state: ScanState,
    ) -> Result<()> {
        self.db().conn().execute(
            "UPDATE inodes SET size = ?1, mtime = ?2, ctime = ?3, scan_state = ?4 WHERE ino = ?5",
            rusqlite::params![size, mtime, ctime, scan_state.as_i64(), ino as i64],
        )?;
        Ok(())
    }

    /// Sets just the scan state of an inode
    pub fn set_scan_state(&self, ino: u64, scan_state: ScanState) -> Result<()> {
        self.db().conn().execute(
            "UPDATE inodes SET scan_state = ?1 WHERE ino = ?2",
            rusqlite::params![scan_state.as_i64(), ino as i64],
        )?;
        Ok(())
    }

    /// Pairs an inode with a FOB/FLV/FCV triple
    pub fn assign_inode_versions(
        &self,
        iid: &str,
        fob: Option<&Id128>,
        flv: Option<&Id128>,
        fcv: Option<&Id128>,
    ) -> Result<()> {
        self.db().conn().execute(
            "UPDATE inodes SET fob = ?1, flv = ?2, fcv = ?3 WHERE iid = ?4",
            rusqlite::params![
                fob.map(|v| v.as_bytes().to_vec()),
                flv.map(|v| v.as_bytes().to_vec()),
                fcv.map(|v| v.as_bytes().to_vec()),
                iid
            ],
        )?;
        if self.db().changes() == 0 {
            return Err(StoreError::InvariantViolated(format!(
                "assigning versions to unknown inode {iid}"
            )));
        }
        Ok(())
    }

    /// Updates only the current FLV of an inode
    pub fn set_inode_flv(&self, iid: &str, flv: &Id128) -> Result<()> {
        self.db().conn().execute(
            "UPDATE inodes SET flv = ?1 WHERE iid = ?2",
            rusqlite::params![flv.as_bytes().to_vec(), iid],
        )?;
        Ok(())
    }

    /// Inode records not yet up to date, in inode-number order
    ///
    /// The `(scan_state, ino)` index makes the matching rows a contiguous
    /// presorted segment, so refilling the scan queue stays sequential on
    /// disk.
    pub fn unscanned_inodes(&self) -> Result<Vec<InodeRow>> {
        let conn = self.db().conn();
        let mut stmt =
            conn.prepare("SELECT * FROM inodes WHERE scan_state < ?1 ORDER BY ino")?;
        let rows = stmt.query_map([ScanState::UpToDate.as_i64()], inode_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// The link row at `(parent, name)`, if observed
    pub fn link_get(&self, parent: u64, name: &str) -> Result<Option<LinkRow>> {
        Ok(self
            .db()
            .conn()
            .query_row(
                "SELECT parent, name, ino FROM links WHERE parent = ?1 AND name = ?2",
                rusqlite::params![parent as i64, name],
                |row| {
                    Ok(LinkRow {
                        parent: row.get::<_, i64>(0)? as u64,
                        name: row.get(1)?,
                        ino: row.get::<_, i64>(2)? as u64,
                    })
                },
            )
            .optional()?)
    }

    /// All link rows under a parent directory
    pub fn links_of_parent(&self, parent: u64) -> Result<Vec<LinkRow>> {
        let conn = self.db().conn();
        let mut stmt =
            conn.prepare("SELECT parent, name, ino FROM links WHERE parent = ?1")?;
        let rows = stmt.query_map([parent as i64], |row| {
            Ok(LinkRow {
                parent: row.get::<_, i64>(0)? as u64,
                name: row.get(1)?,
                ino: row.get::<_, i64>(2)? as u64,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// All link rows pointing at an inode
    pub fn links_of_ino(&self, ino: u64) -> Result<Vec<LinkRow>> {
        let conn = self.db().conn();
        let mut stmt = conn.prepare("SELECT parent, name, ino FROM links WHERE ino = ?1")?;
        let rows = stmt.query_map([ino as i64], |row| {
            Ok(LinkRow {
                parent: row.get::<_, i64>(0)? as u64,
                name: row.get(1)?,
                ino: row.get::<_, i64>(2)? as u64,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Points an existing link row at a different inode
    pub fn link_set_ino(&self, parent: u64, name: &str, ino: u64) -> Result<()> {
        self.db().conn().execute(
            "UPDATE links SET ino = ?1 WHERE parent = ?2 AND name = ?3",
            rusqlite::params![ino as i64, parent as i64, name],
        )?;
        Ok(())
    }

    /// Records a newly observed directory entry
    ///
    /// An existing row at `(parent, name)` is replaced; what was just
    /// observed on disk wins over whatever the table remembered.
    pub fn link_insert(&self, parent: u64, name: &str, ino: u64) -> Result<()> {
        self.db().conn().execute(
            "INSERT OR REPLACE INTO links (parent, name, ino) VALUES (?1, ?2, ?3)",
            rusqlite::params![parent as i64, name, ino as i64],
        )?;
        Ok(())
    }

    /// Renames a link row, replacing any row already at the target
    ///
    /// Returns true if a source row existed.
    pub fn link_rename(
        &self,
        src_parent: u64,
        src_name: &str,
        dst_parent: u64,
        dst_name: &str,
    ) -> Result<bool> {
        self.db().conn().execute(
            "UPDATE OR REPLACE links SET parent = ?1, name = ?2 WHERE parent = ?3 AND name = ?4",
            rusqlite::params![dst_parent as i64, dst_name, src_parent as i64, src_name],
        )?;
        Ok(self.db().changes() > 0)
    }

    /// Deletes one link row
    pub fn link_delete(&self, parent: u64, name: &str) -> Result<()> {
        self.db().conn().execute(
            "DELETE FROM links WHERE parent = ?1 AND name = ?2",
            rusqlite::params![parent as i64, name],
        )?;
        Ok(())
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
            Store::initialize(dir.path(), None, SyncMode::Serial, DebugFlags::default()).unwrap();
        (dir, store)
    }

    fn sample_inode(iid: &str, ino: u64) -> InodeRow {
        InodeRow {
            iid: iid.to_string(),
            ino,
            handle: FileHandle {
                handle_type: 1,
                bytes: vec![1, 2, 3],
            },
            ftype: FobType::Directory,
            size: Some(0),
            mtime: Some(1),
            ctime: Some(1),
            btime: Some(1),
            scan_state: ScanState::NeverScanned,
            fob: None,
            flv: None,
            fcv: None,
        }
    }

    #[test]
    fn test_inode_round_trip() {
        let (_dir, store) = scratch_store();
        store.insert_inode(&sample_inode("ROOT", 42)).unwrap();
        let row = store.inode_by_ino(42).unwrap().unwrap();
        assert_eq!(row.iid, "ROOT");
        assert_eq!(row.scan_state, ScanState::NeverScanned);
        assert_eq!(row.handle.bytes, vec![1, 2, 3]);
        assert!(store.inode_by_ino(43).unwrap().is_none());
    }

    #[test]
    fn test_unscanned_order() {
        let (_dir, store) = scratch_store();
        store.insert_inode(&sample_inode("b", 20)).unwrap();
        store.insert_inode(&sample_inode("a", 10)).unwrap();
        let mut up_to_date = sample_inode("c", 30);
        up_to_date.scan_state = ScanState::UpToDate;
        store.insert_inode(&up_to_date).unwrap();

        let rows = store.unscanned_inodes().unwrap();
        let inos: Vec<u64> = rows.iter().map(|r| r.ino).collect();
        assert_eq!(inos, vec![10, 20]);
    }

    #[test]
    fn test_links() {
        let (_dir, store) = scratch_store();
        store.link_insert(1, "a", 100).unwrap();
        store.link_insert(1, "b", 101).unwrap();
        assert_eq!(store.links_of_parent(1).unwrap().len(), 2);
        store.link_set_ino(1, "a", 102).unwrap();
        assert_eq!(store.link_get(1, "a").unwrap().unwrap().ino, 102);
        assert!(store.link_rename(1, "a", 1, "b").unwrap());
        // The rename replaced the pigeon at (1, "b").
        assert_eq!(store.links_of_parent(1).unwrap().len(), 1);
        store.link_delete(1, "b").unwrap();
        assert!(store.links_of_parent(1).unwrap().is_empty());
    }

    #[test]
    fn test_assign_versions_requires_known_inode() {
        let (_dir, store) = scratch_store();
        let err = store.assign_inode_versions("nope", None, None, None);
        assert!(err.is_err());
    }

    #[test]
    fn test_scan_state_codes() {
        assert_eq!(ScanState::from_i64(0), ScanState::NeverScanned);
        assert_eq!(ScanState::from_i64(100), ScanState::UpToDate);
        assert!(ScanState::NeverScanned < ScanState::UpToDate);
    }
}
