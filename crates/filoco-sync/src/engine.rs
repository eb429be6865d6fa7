//! The reconciliation engine
//!
//! Symmetric: both peers run the same code over a bidirectional byte
//! stream. The very first exchange prepends a `hello` both ways; after
//! that the store's sync mode decides the conversation:
//!
//! - **serial**: exchange per-origin max-serial maps, then stream every
//!   local syncable the peer is missing, in local insert order.
//! - **synctree**: descend the XOR-folded prefix tree level by level,
//!   classifying each position pair until the differences are isolated,
//!   then stream exactly the missing objects.
//!
//! Each descent round has a timeout; the send and receive halves of a
//! round run concurrently and are cancel-safe at frame boundaries (the
//! receiver's open transaction rolls back on drop).

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use filoco_core::{DebugFlags, Id128, StoreId};
use filoco_store::{tree, Store, SyncMode};
use filoco_synctree::{classify, is_leaf, subtree_range, Diff};

use crate::error::{Result, SyncError};
use crate::proto::{
    decode_level, encode_level, from_cbor, to_cbor, FrameReader, FrameWriter, Hello, WireSyncable,
};

/// Timeout applied to each protocol exchange round
pub const XCHG_TIMEOUT: Duration = Duration::from_secs(10);

/// First synctree level exchanged
///
/// Level 4 is 16 nodes of 40 bytes, a few hundred bytes per round even
/// when nothing changed, and saves four round-trips in the common case of
/// a handful of changes.
pub const START_LVL: u32 = 4;

/// Receive-side inserts per transaction, bounding WAL growth
const RECV_TXN_LIMIT: usize = 5000;

/// Outcome of one reconciliation run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Objects sent to the peer
    pub sent: u64,
    /// Objects received and newly inserted
    pub received: u64,
    /// Level-exchange rounds performed
    pub rounds: u64,
}

/// One endpoint of a metadata reconciliation
pub struct MdSync<'a, R, W> {
    store: &'a Store,
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    flags: DebugFlags,
    xchg_timeout: Duration,
    did_hello: bool,
}

impl<'a, R, W> MdSync<'a, R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates an endpoint over a read half and a write half
    pub fn new(store: &'a Store, read_half: R, write_half: W, flags: DebugFlags) -> Self {
        MdSync {
            store,
            reader: FrameReader::new(read_half),
            writer: FrameWriter::new(write_half),
            flags,
            xchg_timeout: XCHG_TIMEOUT,
            did_hello: false,
        }
    }

    /// Overrides the per-round exchange timeout
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.xchg_timeout = timeout;
    }

    /// Runs the reconciliation to completion in the store's sync mode
    pub async fn run(&mut self) -> Result<SyncStats> {
        let stats = match self.store.sync_mode() {
            SyncMode::Serial => self.run_serial().await?,
            SyncMode::Synctree => self.run_synctree().await?,
        };
        info!(
            sent = stats.sent,
            received = stats.received,
            rounds = stats.rounds,
            "Reconciliation finished"
        );
        Ok(stats)
    }

    /// Sends `out` frames and receives `n_recv` frames concurrently, under
    /// the round timeout
    ///
    /// The first exchange transparently prepends the hello message in both
    /// directions.
    async fn exchange_frames(&mut self, out: Vec<Vec<u8>>, n_recv: usize) -> Result<Vec<Vec<u8>>> {
        let mut out = out;
        let mut n_recv = n_recv;
        let fresh_hello = !self.did_hello;
        if fresh_hello {
            out.insert(0, to_cbor(&Hello::default())?);
            n_recv += 1;
        }
        let timeout = self.xchg_timeout;
        let writer = &mut self.writer;
        let reader = &mut self.reader;
        let send_fut = async move {
            for frame in &out {
                writer.write_frame(frame).await?;
            }
            writer.flush().await?;
            Ok::<(), SyncError>(())
        };
        let recv_fut = async move {
            let mut frames = Vec::with_capacity(n_recv);
            for _ in 0..n_recv {
                frames.push(reader.read_frame().await?);
            }
            Ok::<Vec<Vec<u8>>, SyncError>(frames)
        };
        let (_, mut received) = tokio::time::timeout(timeout, async {
            tokio::try_join!(send_fut, recv_fut)
        })
        .await
        .map_err(|_| SyncError::Timeout)??;

        if fresh_hello {
            let hello_frame = received.remove(0);
            let hello: ciborium::Value = from_cbor(&hello_frame)?;
            // Opaque for now; future versions negotiate here.
            debug!(?hello, "Peer hello");
            self.did_hello = true;
        }
        Ok(received)
    }

    // ------------------------------------------------------------------
    // Serial mode
    // ------------------------------------------------------------------

    async fn run_serial(&mut self) -> Result<SyncStats> {
        let mine: HashMap<StoreId, i64> = self.store.max_serials()?;
        let frames = self.exchange_frames(vec![to_cbor(&mine)?], 1).await?;
        let theirs: HashMap<StoreId, i64> = from_cbor(&frames[0])?;
        debug!(local_origins = mine.len(), peer_origins = theirs.len(), "Serial maps exchanged");

        // Everything of ours beyond the peer's high-water mark for each
        // origin; an origin the peer has never seen starts at zero.
        let mut pending: Vec<(i64, Id128)> = Vec::new();
        for origin in self.store.known_origins()? {
            let after = theirs.get(&origin).copied().unwrap_or(0);
            pending.extend(self.store.ids_after_serial(&origin, after)?);
        }
        pending.sort();
        pending.dedup();

        let mut stats = self.stream_objects(pending).await?;
        stats.rounds = 1;
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Synctree mode
    // ------------------------------------------------------------------

    async fn run_synctree(&mut self) -> Result<SyncStats> {
        let mut recv_eof = false;
        let mut positions: Vec<u64> = (1u64 << START_LVL..1u64 << (START_LVL + 1)).collect();
        let mut singles: Vec<Id128> = Vec::new();
        let mut subtrees: Vec<u64> = Vec::new();
        let mut rounds = 0u64;

        loop {
            let nodes = tree::nodes_at(self.store.db(), &positions)?;
            if self.flags.synctree {
                debug!(round = rounds, alive = nodes.len(), "Synctree level");
            }
            let theirs = if recv_eof {
                HashMap::new()
            } else {
                rounds += 1;
                let frames = self.exchange_frames(vec![encode_level(&nodes)], 1).await?;
                if frames[0].is_empty() {
                    if self.flags.synctree {
                        debug!("Peer finished descending");
                    }
                    recv_eof = true;
                    HashMap::new()
                } else {
                    decode_level(&frames[0])?
                }
            };
            if nodes.is_empty() {
                // The empty frame above doubled as our end-of-descent.
                break;
            }

            let mut next = Vec::new();
            for node in &nodes {
                let their = theirs
                    .get(&node.pos)
                    .copied()
                    .unwrap_or((Id128::ZERO, Id128::ZERO));
                match classify((node.xor, node.chxor), their) {
                    Diff::Same => {}
                    Diff::PeerEmpty => subtrees.push(node.pos),
                    Diff::Single(id) => {
                        // Ours to send only if we actually hold it; the
                        // symmetric case resolves on the peer's side.
                        if self.store.has_syncable(&id)? {
                            singles.push(id);
                        }
                    }
                    Diff::Descend => {
                        if is_leaf(node.pos) {
                            // Position-hash collision at the leaf; ship the
                            // whole leaf rather than descending further.
                            subtrees.push(node.pos);
                        } else {
                            let child = node.pos << 1;
                            next.push(child);
                            next.push(child | 1);
                        }
                    }
                }
            }
            if recv_eof {
                break;
            }
            positions = next;
        }

        // Materialize the send set, ordered by local insert order so the
        // peer's foreign keys resolve on insert.
        let mut by_order: BTreeMap<i64, Id128> = BTreeMap::new();
        for id in singles {
            if let Some(stored) = self.store.get_syncable(&id)? {
                by_order.insert(stored.insert_order, id);
            }
        }
        for pos in subtrees {
            let (low, high) = subtree_range(pos);
            for (order, id) in self.store.ids_in_tree_range(low, high)? {
                by_order.insert(order, id);
            }
        }
        let pending: Vec<(i64, Id128)> = by_order.into_iter().collect();

        let mut stats = self.stream_objects(pending).await?;
        stats.rounds = rounds;
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Object streaming (both modes)
    // ------------------------------------------------------------------

    /// Streams the pending objects while receiving the peer's, one CBOR
    /// frame per syncable, a zero-length frame terminating each direction
    async fn stream_objects(&mut self, pending: Vec<(i64, Id128)>) -> Result<SyncStats> {
        debug!(to_send = pending.len(), "Streaming objects");
        let store = self.store;
        let writer = &mut self.writer;
        let reader = &mut self.reader;

        let send_fut = async move {
            let mut sent = 0u64;
            for (_, id) in &pending {
                let Some(stored) = store.get_syncable(id)? else {
                    continue;
                };
                let wire = WireSyncable::from_record(&stored.record)?;
                writer.write_frame(&to_cbor(&wire)?).await?;
                sent += 1;
            }
            writer.write_eof().await?;
            writer.flush().await?;
            Ok::<u64, SyncError>(sent)
        };
        let recv_fut = async move { receive_objects(store, reader).await };

        let (sent, received) = tokio::try_join!(send_fut, recv_fut)?;
        Ok(SyncStats {
            sent,
            received,
            rounds: 0,
        })
    }
}

/// Receives the peer's object stream until its terminator frame
///
/// Inserts run in the received order (the sender's insert order), in
/// transactions of at most [`RECV_TXN_LIMIT`] rows to bound WAL growth.
/// Records already present are skipped, which makes an interrupted run
/// resumable.
async fn receive_objects<R: AsyncRead + Unpin>(
    store: &Store,
    reader: &mut FrameReader<R>,
) -> Result<u64> {
    let mut received = 0u64;
    let mut in_batch = 0usize;
    let mut txn = None;
    loop {
        let frame = reader.read_frame().await?;
        if frame.is_empty() {
            break;
        }
        let wire: WireSyncable = from_cbor(&frame)?;
        let rec = wire.into_record()?;
        if txn.is_none() {
            txn = Some(store.db().ensure_transaction()?);
        }
        if !store.has_syncable(&rec.body.id())? {
            store.insert_syncable(&rec, true)?;
            received += 1;
        }
        in_batch += 1;
        if in_batch >= RECV_TXN_LIMIT {
            if let Some(guard) = txn.take() {
                guard.commit()?;
            }
            in_batch = 0;
        }
    }
    if let Some(guard) = txn.take() {
        guard.commit()?;
    }
    Ok(received)
}
