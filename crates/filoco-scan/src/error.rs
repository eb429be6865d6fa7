//! Scanner error types

use thiserror::Error;

/// Errors raised by the scanner and the inode layer
#[derive(Debug, Error)]
pub enum ScanError {
    /// The inode behind a handle or descriptor no longer exists
    #[error("stale inode reference")]
    Stale,

    /// An entry lives on a different mount; skipped, never followed
    #[error("entry crosses a mount boundary")]
    CrossMount,

    /// The store root inode changed identity; unsupported and fatal
    #[error("root inode replacement is not supported")]
    RootReplaced,

    /// Another scanner already holds the store's scan lock
    #[error("another scanner is already running on this store")]
    Locked,

    /// An inode reference with neither descriptor nor handle was used
    #[error("inode reference has no descriptor and no handle")]
    NoReference,

    /// The requested path is not recorded in the store
    #[error("'{0}' is not in the store database")]
    NotTracked(String),

    /// Store/database failure
    #[error(transparent)]
    Store(#[from] filoco_store::StoreError),

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<nix::errno::Errno> for ScanError {
    fn from(errno: nix::errno::Errno) -> Self {
        match errno {
            nix::errno::Errno::ESTALE | nix::errno::Errno::ENOENT => ScanError::Stale,
            other => ScanError::Io(other.into()),
        }
    }
}

/// Scanner result alias
pub type Result<T> = std::result::Result<T, ScanError>;
