//! Filoco metadata reconciliation ("mdsync")
//!
//! Two stores exchange their append-only syncable sets over a framed
//! binary protocol. Two strategies share the framing: *serial* (exchange
//! per-origin high-water marks, stream the gaps) and *synctree* (descend
//! the XOR-folded prefix tree, round-trip cost logarithmic in the number
//! of differences). The receive path preserves the sender's insert order
//! so foreign keys resolve on insert.

pub mod engine;
pub mod error;
pub mod proto;
pub mod transport;

pub use engine::{MdSync, SyncStats, START_LVL, XCHG_TIMEOUT};
pub use error::{Result, SyncError};
pub use proto::{FrameReader, FrameWriter, WireSyncable};
pub use transport::{sync_listen, sync_local_dir, sync_local_pair, sync_stdio, sync_tcp};
