//! Persistent synctree maintenance
//!
//! The `synctree` table mirrors the in-memory fold from `filoco-synctree`:
//! one row per nonzero node. Folding an id walks the 48 positions from its
//! leaf to the root, XOR-ing the id and its check hash into each row via
//! the `binxor` SQL function, then deletes rows whose fold became zero.
//! Because XOR is involutive the same walk performs insert and delete.

use filoco_core::Id128;
use filoco_synctree::{check_hash, fold_path, leaf_pos, Node};

use crate::db::Db;
use crate::error::Result;

/// Folds an id into (or out of) the persistent tree
pub fn toggle(db: &Db, id: &Id128) -> Result<()> {
    let conn = db.conn();
    let chk = check_hash(id);
    let positions: Vec<i64> = fold_path(leaf_pos(id)).map(|p| p as i64).collect();
    {
        let mut upsert = conn.prepare_cached(
            "INSERT INTO synctree (pos, xor, chxor) VALUES (?1, ?2, ?3) \
             ON CONFLICT(pos) DO UPDATE SET \
               xor = binxor(xor, excluded.xor), \
               chxor = binxor(chxor, excluded.chxor)",
        )?;
        for &pos in &positions {
            upsert.execute(rusqlite::params![
                pos,
                id.as_bytes().as_slice(),
                chk.as_bytes().as_slice()
            ])?;
        }
    }
    // Nodes whose fold cancelled out cease to exist.
    let placeholders = vec!["?"; positions.len()].join(",");
    let sql = format!(
        "DELETE FROM synctree WHERE pos IN ({placeholders}) \
         AND xor = zeroblob(16) AND chxor = zeroblob(16)"
    );
    conn.execute(&sql, rusqlite::params_from_iter(positions.iter()))?;
    Ok(())
}

/// Reads the nodes existing at the given positions
pub fn nodes_at(db: &Db, positions: &[u64]) -> Result<Vec<Node>> {
    if positions.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; positions.len()].join(",");
    let sql = format!("SELECT pos, xor, chxor FROM synctree WHERE pos IN ({placeholders})");
    let conn = db.conn();
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(
        rusqlite::params_from_iter(positions.iter().map(|&p| p as i64)),
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        },
    )?;
    let mut out = Vec::new();
    for row in rows {
        let (pos, xor, chxor) = row?;
        out.push(Node {
            pos: pos as u64,
            xor: Id128::from_slice(&xor)?,
            chxor: Id128::from_slice(&chxor)?,
        });
    }
    Ok(out)
}

/// Reads a single node, if present
pub fn node_at(db: &Db, pos: u64) -> Result<Option<Node>> {
    Ok(nodes_at(db, &[pos])?.into_iter().next())
}

/// Which of the given positions have a node locally
pub fn existing_positions(db: &Db, positions: &[u64]) -> Result<Vec<u64>> {
    Ok(nodes_at(db, positions)?.into_iter().map(|n| n.pos).collect())
}

/// Number of nodes in the tree
pub fn node_count(db: &Db) -> Result<i64> {
    Ok(db
        .conn()
        .query_row("SELECT count(*) FROM synctree", [], |row| row.get(0))?)
}

/// Verifies the fold invariant over the whole tree
///
/// For every non-leaf node, its folds must equal the XOR of its
/// children's. Used by tests and `info` diagnostics.
pub fn verify_consistent(db: &Db) -> Result<bool> {
    let conn = db.conn();
    let mut stmt = conn.prepare("SELECT pos, xor, chxor FROM synctree")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, i64>(0)? as u64,
            row.get::<_, Vec<u8>>(1)?,
            row.get::<_, Vec<u8>>(2)?,
        ))
    })?;
    let mut nodes = std::collections::HashMap::new();
    for row in rows {
        let (pos, xor, chxor) = row?;
        nodes.insert(pos, (Id128::from_slice(&xor)?, Id128::from_slice(&chxor)?));
    }
    for (&pos, &(xor, chxor)) in &nodes {
        if filoco_synctree::is_leaf(pos) {
            continue;
        }
        let zero = (Id128::ZERO, Id128::ZERO);
        let left = nodes.get(&(pos << 1)).copied().unwrap_or(zero);
        let right = nodes.get(&((pos << 1) | 1)).copied().unwrap_or(zero);
        if xor != left.0.xor(&right.0) || chxor != left.1.xor(&right.1) {
            return Ok(false);
        }
    }
    Ok(true)
}
