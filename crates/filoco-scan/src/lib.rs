//! Filoco scanner - filesystem observation into metadata
//!
//! The scanner walks a store's directory tree (and listens for change
//! notifications) and keeps the metadata database in step: inode records
//! with stable kernel handles, link rows for observed directory entries,
//! and new FOB/FLV/FCV syncables for every object it meets for the first
//! time or sees move.
//!
//! Structure:
//! - [`inode`] - the strong/weak descriptor abstraction over one inode
//! - [`queue`] - the inode-number-ordered scan request queue
//! - [`scanner`] - the engine: find-or-create, directory scans, link
//!   policy
//! - [`watcher`] - `none`/`inotify`/`fanotify` live-update modes

pub mod error;
pub mod inode;
pub mod queue;
pub mod scanner;
pub mod watcher;

pub use error::{Result, ScanError};
pub use inode::InodeInfo;
pub use queue::{ScanAction, ScanQueue, ScanRequest};
pub use scanner::{InitScan, ScanOptions, Scanner, FOB_CREATE_WAIT, QUEUE_MAX_FDS};
pub use watcher::{run_scanner, WatchMode};
