//! Filoco core - object model and shared types
//!
//! This crate contains the types every other Filoco crate speaks:
//! - **Identifiers** - [`Id128`] for syncables and inodes, [`StoreId`] for
//!   store certificate fingerprints
//! - **Syncables** - the immutable [`Fob`]/[`Flv`]/[`Fcv`] records that make
//!   up the replicated metadata DAG
//! - **Naming** - logical-name validation and the local-only longname scheme
//! - **Debug context** - the `FILOCO_DBG` category flags passed around as an
//!   explicit context value
//!
//! Nothing in here touches the filesystem or the database; those live in
//! `filoco-store` and `filoco-scan`.

pub mod debug;
pub mod error;
pub mod id;
pub mod name;
pub mod syncable;

pub use debug::DebugFlags;
pub use error::ModelError;
pub use id::{Id128, StoreId};
pub use name::{is_longname, longname, shortname, validate_name, LONGNAME_SEPARATOR};
pub use syncable::{Fcv, Flv, Fob, FobType, Kind, SyncableBody};
