//! Filoco store - on-disk layout and metadata database
//!
//! One [`Store`] is one peer's root directory plus its `.filoco/`
//! metadata: a WAL-mode SQLite database holding the replicated syncable
//! tables, the local inode/link bindings, and the persistent XOR-folded
//! synctree. This crate owns every invariant the database maintains:
//!
//! - `insert_order` is strictly increasing and never reused, so foreign
//!   keys resolve when peers replay in that order.
//! - Syncables are never deleted; version records are superseded by
//!   flipping `_is_head`.
//! - Every syncable insertion folds its id into the synctree in the same
//!   transaction.

pub mod db;
pub mod error;
pub mod fhandle;
pub mod local;
pub mod store;
pub mod syncables;
pub mod tree;
pub mod versions;

pub use db::{Db, TxnGuard};
pub use error::{Result, StoreError};
pub use fhandle::FileHandle;
pub use local::{InodeRow, LinkRow, ScanState, ROOT_IID};
pub use store::{Store, SyncMode, META_DIR, PLACEHOLDER_DIR, PLACEHOLDER_TARGET};
pub use syncables::{unix_now, StoredSyncable, SyncableRecord};
pub use versions::{DirtyFob, FlvRow, VersionNode};
