//! SQLite wrapper
//!
//! A thin convenience layer over a single [`rusqlite::Connection`]:
//! WAL-mode setup, the `binxor` scalar function used by synctree
//! maintenance, scope-guard transactions that never nest, and early
//! write-lock acquisition for batch routines.
//!
//! The connection runs with `journal_mode=WAL` and `synchronous=normal`:
//! a crash cannot corrupt the database but may roll back the last few
//! transactions, which is acceptable for state that is rebuilt by
//! rescanning.

use std::path::Path;

use rusqlite::functions::FunctionFlags;
use rusqlite::Connection;
use tracing::trace;

use filoco_core::DebugFlags;

use crate::error::{Result, StoreError};

/// Busy timeout for the single-writer lock
const BUSY_TIMEOUT_MS: u64 = 30_000;

/// A metadata database connection
pub struct Db {
    conn: Connection,
    flags: DebugFlags,
}

impl Db {
    /// Opens (or creates) a database at `path` and applies the WAL pragmas
    pub fn open(path: &Path, flags: DebugFlags) -> Result<Db> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        register_binxor(&conn)?;
        Ok(Db { conn, flags })
    }

    /// Runs the given schema script against a fresh database
    pub fn create_schema(&self, schema: &str) -> Result<()> {
        self.conn.execute_batch(schema)?;
        Ok(())
    }

    /// The underlying connection
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Rows changed by the most recent statement
    pub fn changes(&self) -> usize {
        self.conn.changes() as usize
    }

    /// True if a transaction is currently open
    pub fn in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    /// Starts a transaction unless one is already active
    ///
    /// Returns a guard that commits on [`TxnGuard::commit`] and rolls back
    /// on drop. When a transaction is already open the guard is a no-op,
    /// so nested scopes neither commit nor roll back the outer work.
    pub fn ensure_transaction(&self) -> Result<TxnGuard<'_>> {
        if self.in_transaction() {
            return Ok(TxnGuard {
                db: self,
                owns: false,
                done: false,
            });
        }
        self.conn.execute_batch("BEGIN")?;
        if self.flags.dbw {
            trace!("BEGIN");
        }
        Ok(TxnGuard {
            db: self,
            owns: true,
            done: false,
        })
    }

    /// Acquires the write lock immediately
    ///
    /// Touches the single-row `meta_lock` table, upgrading the current
    /// transaction to a writer before any external work (filesystem
    /// renames, placeholder creation) is interleaved with reads. Must run
    /// inside a transaction scope.
    pub fn lock_now(&self) -> Result<()> {
        if !self.in_transaction() {
            return Err(StoreError::NoTransaction);
        }
        self.conn.execute("UPDATE meta_lock SET x = x", [])?;
        Ok(())
    }

    /// Forces the WAL into the main database file
    ///
    /// Used by the applier before filesystem renames: a crash between a
    /// rename and the WAL reaching the main file could otherwise let a
    /// later scan mistake a moved inode for a brand-new object.
    pub fn wal_checkpoint(&self) -> Result<()> {
        // The checkpoint pragma returns a status row; run it as a query.
        self.conn
            .query_row("PRAGMA wal_checkpoint(FULL)", [], |_| Ok(()))?;
        Ok(())
    }

    /// Logs a write statement when the `dbw` debug category is on
    pub fn trace_write(&self, sql: &str) {
        if self.flags.dbw {
            trace!(sql, "db write");
        }
    }
}

/// Scope guard for [`Db::ensure_transaction`]
pub struct TxnGuard<'a> {
    db: &'a Db,
    owns: bool,
    done: bool,
}

impl TxnGuard<'_> {
    /// Commits the transaction if this guard started one
    pub fn commit(mut self) -> Result<()> {
        if self.owns {
            self.db.conn.execute_batch("COMMIT")?;
            if self.db.flags.dbw {
                trace!("COMMIT");
            }
        }
        self.done = true;
        Ok(())
    }
}

impl Drop for TxnGuard<'_> {
    fn drop(&mut self) {
        if self.owns && !self.done {
            // Best-effort rollback; an error here means the connection is
            // already dead.
            let _ = self.db.conn.execute_batch("ROLLBACK");
        }
    }
}

/// Registers `binxor(a, b)`: bytewise XOR of two equal-length blobs
fn register_binxor(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "binxor",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let a: Vec<u8> = ctx.get(0)?;
            let b: Vec<u8> = ctx.get(1)?;
            if a.len() != b.len() {
                return Err(rusqlite::Error::UserFunctionError(
                    format!("binxor length mismatch: {} vs {}", a.len(), b.len()).into(),
                ));
            }
            let out: Vec<u8> = a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect();
            Ok(out)
        },
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_db() -> Db {
        let conn = Connection::open_in_memory().unwrap();
        register_binxor(&conn).unwrap();
        conn.execute_batch("CREATE TABLE meta_lock (x INTEGER NOT NULL); INSERT INTO meta_lock VALUES (0);")
            .unwrap();
        Db {
            conn,
            flags: DebugFlags::default(),
        }
    }

    #[test]
    fn test_binxor() {
        let db = mem_db();
        let out: Vec<u8> = db
            .conn()
            .query_row("SELECT binxor(x'0f0f', x'ff00')", [], |row| row.get(0))
            .unwrap();
        assert_eq!(out, vec![0xf0, 0x0f]);
    }

    #[test]
    fn test_binxor_length_mismatch_errors() {
        let db = mem_db();
        let res: rusqlite::Result<Vec<u8>> =
            db.conn()
                .query_row("SELECT binxor(x'00', x'0000')", [], |row| row.get(0));
        assert!(res.is_err());
    }

    #[test]
    fn test_ensure_transaction_nests_as_noop() {
        let db = mem_db();
        let outer = db.ensure_transaction().unwrap();
        assert!(db.in_transaction());
        {
            let inner = db.ensure_transaction().unwrap();
            inner.commit().unwrap();
            // The inner commit must not end the outer transaction.
            assert!(db.in_transaction());
        }
        outer.commit().unwrap();
        assert!(!db.in_transaction());
    }

    #[test]
    fn test_drop_rolls_back() {
        let db = mem_db();
        db.conn()
            .execute_batch("CREATE TABLE t (v INTEGER)")
            .unwrap();
        {
            let _guard = db.ensure_transaction().unwrap();
            db.conn().execute("INSERT INTO t VALUES (1)", []).unwrap();
            // dropped without commit
        }
        let n: i64 = db
            .conn()
            .query_row("SELECT count(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_lock_now_requires_transaction() {
        let db = mem_db();
        assert!(matches!(db.lock_now(), Err(StoreError::NoTransaction)));
        let guard = db.ensure_transaction().unwrap();
        db.lock_now().unwrap();
        guard.commit().unwrap();
    }
}
