//! The syncable object model
//!
//! Everything the metadata protocol replicates is a *syncable*: an
//! immutable record identified by a random 128-bit id, stamped with the
//! store that originated it and a per-store serial. There are three kinds:
//!
//! - [`Fob`] - the abstract identity of a file or directory; created once,
//!   never mutated, never destroyed.
//! - [`Flv`] - a placement claim: "FOB x is named `n` under parent FOB p",
//!   superseding a set of predecessor FLVs of the same FOB.
//! - [`Fcv`] - a content claim for regular-file FOBs, superseding
//!   predecessor FCVs; the hash is absent while the version is still a
//!   working copy.
//!
//! The version records form per-FOB DAGs through `parent_vers`; a record
//! no other record names as a parent is a *head*.

use serde::{Deserialize, Serialize};

use crate::error::ModelError;
use crate::id::Id128;

/// Syncable kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    /// File object
    Fob,
    /// File location version
    Flv,
    /// File content version
    Fcv,
}

impl Kind {
    /// Wire/DB tag of this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Fob => "fob",
            Kind::Flv => "flv",
            Kind::Fcv => "fcv",
        }
    }

    /// Name of the kind-specific DB table
    pub fn table(&self) -> &'static str {
        match self {
            Kind::Fob => "fobs",
            Kind::Flv => "flvs",
            Kind::Fcv => "fcvs",
        }
    }

    /// Parses a wire/DB tag
    pub fn parse(s: &str) -> Result<Self, ModelError> {
        match s {
            "fob" => Ok(Kind::Fob),
            "flv" => Ok(Kind::Flv),
            "fcv" => Ok(Kind::Fcv),
            other => Err(ModelError::UnknownKind(other.to_string())),
        }
    }
}

/// The filesystem type of a FOB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FobType {
    /// Directory
    #[serde(rename = "d")]
    Directory,
    /// Regular file
    #[serde(rename = "r")]
    Regular,
    /// Symbolic link
    #[serde(rename = "l")]
    Symlink,
    /// Special file (socket, fifo, device)
    #[serde(rename = "S")]
    Special,
}

impl FobType {
    /// Single-character tag used in the DB and on the wire
    pub fn as_char(&self) -> char {
        match self {
            FobType::Directory => 'd',
            FobType::Regular => 'r',
            FobType::Symlink => 'l',
            FobType::Special => 'S',
        }
    }

    /// Parses the single-character tag
    pub fn parse(s: &str) -> Result<Self, ModelError> {
        match s {
            "d" => Ok(FobType::Directory),
            "r" => Ok(FobType::Regular),
            "l" => Ok(FobType::Symlink),
            "S" => Ok(FobType::Special),
            other => Err(ModelError::UnknownFileType(other.to_string())),
        }
    }

    /// Classifies a raw `st_mode`
    pub fn from_mode(mode: u32) -> Self {
        // S_IFMT and friends; spelled as octal to avoid a libc dependency
        // for four constants.
        const S_IFMT: u32 = 0o170000;
        const S_IFDIR: u32 = 0o040000;
        const S_IFREG: u32 = 0o100000;
        const S_IFLNK: u32 = 0o120000;
        match mode & S_IFMT {
            S_IFDIR => FobType::Directory,
            S_IFREG => FobType::Regular,
            S_IFLNK => FobType::Symlink,
            _ => FobType::Special,
        }
    }
}

/// File object - the immutable identity of a file or directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fob {
    /// Globally unique identifier
    pub id: Id128,
    /// Filesystem type, fixed at creation
    #[serde(rename = "type")]
    pub ftype: FobType,
}

/// File location version - a placement claim for a FOB
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flv {
    /// Globally unique identifier
    pub id: Id128,
    /// The FOB this version places
    pub fob: Id128,
    /// Parent FOB; `None` places the FOB at the store root
    pub parent_fob: Option<Id128>,
    /// Logical name under the parent
    pub name: String,
    /// Predecessor FLVs of the same FOB superseded by this one
    pub parent_vers: Vec<Id128>,
}

/// File content version - a content claim for a regular-file FOB
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fcv {
    /// Globally unique identifier
    pub id: Id128,
    /// The FOB this version describes
    pub fob: Id128,
    /// Content digest; `None` for a working copy not yet digested
    pub content_hash: Option<Vec<u8>>,
    /// Predecessor FCVs of the same FOB superseded by this one
    pub parent_vers: Vec<Id128>,
}

/// A syncable body of any kind
///
/// The unit the reconciliation protocol ships around, minus the origin
/// stamp (which travels alongside).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SyncableBody {
    /// File object
    Fob(Fob),
    /// File location version
    Flv(Flv),
    /// File content version
    Fcv(Fcv),
}

impl SyncableBody {
    /// The id of the wrapped record
    pub fn id(&self) -> Id128 {
        match self {
            SyncableBody::Fob(f) => f.id,
            SyncableBody::Flv(f) => f.id,
            SyncableBody::Fcv(f) => f.id,
        }
    }

    /// The kind of the wrapped record
    pub fn kind(&self) -> Kind {
        match self {
            SyncableBody::Fob(_) => Kind::Fob,
            SyncableBody::Flv(_) => Kind::Flv,
            SyncableBody::Fcv(_) => Kind::Fcv,
        }
    }

    /// Predecessor version ids, empty for FOBs
    pub fn parent_vers(&self) -> &[Id128] {
        match self {
            SyncableBody::Fob(_) => &[],
            SyncableBody::Flv(f) => &f.parent_vers,
            SyncableBody::Fcv(f) => &f.parent_vers,
        }
    }

    /// The FOB a version record belongs to, `None` for FOBs themselves
    pub fn fob(&self) -> Option<Id128> {
        match self {
            SyncableBody::Fob(_) => None,
            SyncableBody::Flv(f) => Some(f.fob),
            SyncableBody::Fcv(f) => Some(f.fob),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        assert_eq!(Kind::Fob.as_str(), "fob");
        assert_eq!(Kind::parse("flv").unwrap(), Kind::Flv);
        assert_eq!(Kind::Fcv.table(), "fcvs");
        assert!(Kind::parse("zzz").is_err());
    }

    #[test]
    fn test_fob_type_tags() {
        for t in [
            FobType::Directory,
            FobType::Regular,
            FobType::Symlink,
            FobType::Special,
        ] {
            assert_eq!(FobType::parse(&t.as_char().to_string()).unwrap(), t);
        }
        assert!(FobType::parse("x").is_err());
    }

    #[test]
    fn test_from_mode() {
        assert_eq!(FobType::from_mode(0o040755), FobType::Directory);
        assert_eq!(FobType::from_mode(0o100644), FobType::Regular);
        assert_eq!(FobType::from_mode(0o120777), FobType::Symlink);
        assert_eq!(FobType::from_mode(0o140755), FobType::Special);
    }
}
