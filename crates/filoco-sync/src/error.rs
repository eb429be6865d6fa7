//! Protocol error types

use thiserror::Error;

/// Errors raised by the reconciliation protocol
#[derive(Debug, Error)]
pub enum SyncError {
    /// A protocol round exceeded the exchange timeout
    #[error("timeout while doing protocol exchange")]
    Timeout,

    /// The peer closed the stream mid-frame
    #[error("connection closed mid-frame")]
    UnexpectedEof,

    /// A frame violated the length or record-size rules
    #[error("malformed frame: {0}")]
    Frame(String),

    /// A CBOR payload did not decode to the expected shape
    #[error("malformed payload: {0}")]
    Decode(String),

    /// Store/database failure
    #[error(transparent)]
    Store(#[from] filoco_store::StoreError),

    /// Model-level failure (bad id, unknown kind)
    #[error(transparent)]
    Model(#[from] filoco_core::ModelError),

    /// Transport I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Protocol result alias
pub type Result<T> = std::result::Result<T, SyncError>;
