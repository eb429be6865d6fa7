//! Applier error types

use thiserror::Error;

/// Errors raised by the metadata applier
#[derive(Debug, Error)]
pub enum ApplyError {
    /// Filesystem/metadata state too tangled to act on safely
    ///
    /// Raised per FOB (dependency cycles, several inodes claiming one
    /// FOB); the batch continues without that FOB.
    #[error("too messy: {0}")]
    TooMessy(String),

    /// All longname suffixes 1..999 are taken at the target location
    #[error("longname pool exhausted for '{0}'")]
    LongnamePoolExhausted(String),

    /// Store/database failure
    #[error(transparent)]
    Store(#[from] filoco_store::StoreError),

    /// Inode-layer failure
    #[error(transparent)]
    Scan(#[from] filoco_scan::ScanError),

    /// I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<nix::errno::Errno> for ApplyError {
    fn from(errno: nix::errno::Errno) -> Self {
        ApplyError::Io(errno.into())
    }
}

/// Applier result alias
pub type Result<T> = std::result::Result<T, ApplyError>;
