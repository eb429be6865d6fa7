//! Filoco metadata applier ("mdapply")
//!
//! The reverse direction of the scanner: given syncables received from
//! peers that reference objects not yet present on disk, mutate the local
//! filesystem to match - materializing placeholder inodes for unfetched
//! data and applying renames with a cycle-safe two-phase longname
//! procedure.

pub mod apply;
pub mod error;

pub use apply::MdApply;
pub use error::{ApplyError, Result};
