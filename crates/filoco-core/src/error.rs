//! Shared model errors

use thiserror::Error;

/// Errors raised by the core object model
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModelError {
    /// Malformed identifier (wrong length, bad hex)
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A logical name violating the naming rules
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Unknown syncable kind tag
    #[error("unknown syncable kind: {0}")]
    UnknownKind(String),

    /// Unknown file-object type tag
    #[error("unknown file type: {0}")]
    UnknownFileType(String),
}
