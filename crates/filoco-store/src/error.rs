//! Store error types

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by store discovery, layout and database access
#[derive(Debug, Error)]
pub enum StoreError {
    /// Walking upward from the given path found no `.filoco` directory
    #[error("'{0}' is not (in) a Filoco store")]
    NotFound(PathBuf),

    /// `init` ran inside an existing store
    #[error("'{dir}' is already inside the Filoco store at '{root}'")]
    AlreadyInStore {
        /// The directory passed to init
        dir: PathBuf,
        /// Root of the enclosing store
        root: PathBuf,
    },

    /// A kernel file handle no longer resolves to a live inode
    #[error("stale file handle")]
    Stale,

    /// Opening by handle needs CAP_DAC_READ_SEARCH which this process lacks
    #[error("open by file handle not permitted")]
    HandleNotPermitted,

    /// Store metadata file is missing or malformed
    #[error("corrupt store metadata: {0}")]
    Corrupt(String),

    /// An operation that must run inside a transaction was called outside one
    #[error("no transaction active")]
    NoTransaction,

    /// A database-level invariant did not hold
    #[error("invariant violated: {0}")]
    InvariantViolated(String),

    /// Underlying SQLite error
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Model-level error (bad id, bad name)
    #[error(transparent)]
    Model(#[from] filoco_core::ModelError),
}

/// Store result alias
pub type Result<T> = std::result::Result<T, StoreError>;
