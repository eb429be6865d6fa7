//! Opaque identifiers
//!
//! Syncables, inodes and version records are identified by 128-bit opaque
//! values ([`Id128`]); stores are identified by the 256-bit fingerprint of
//! their certificate ([`StoreId`]). Both render canonically as lowercase
//! hex. On the wire and in the database they travel as raw bytes, so the
//! serde implementations use byte strings rather than integer arrays.

use std::fmt;
use std::str::FromStr;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ModelError;

/// A 128-bit opaque identifier
///
/// Used for syncables (FOB/FLV/FCV ids) and local inode records. Freshly
/// originated ids are random with 2^-128 collision probability.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Id128([u8; 16]);

impl Id128 {
    /// Length of the identifier in bytes
    pub const LEN: usize = 16;

    /// The all-zero identifier, used as the XOR fold identity
    pub const ZERO: Id128 = Id128([0u8; 16]);

    /// Generates a fresh random identifier
    pub fn generate() -> Self {
        Id128(*uuid::Uuid::new_v4().as_bytes())
    }

    /// Wraps a raw 16-byte value
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Id128(bytes)
    }

    /// Parses an identifier from a byte slice
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ModelError> {
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| ModelError::InvalidId(format!("expected 16 bytes, got {}", bytes.len())))?;
        Ok(Id128(arr))
    }

    /// Parses an identifier from its 32-character hex rendering
    pub fn from_hex(s: &str) -> Result<Self, ModelError> {
        let bytes = hex::decode(s).map_err(|e| ModelError::InvalidId(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Raw bytes of the identifier
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Lowercase hex rendering
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Bytewise XOR, the fold operation of the synctree
    pub fn xor(&self, other: &Id128) -> Id128 {
        let mut out = [0u8; 16];
        for (o, (a, b)) in out.iter_mut().zip(self.0.iter().zip(other.0.iter())) {
            *o = a ^ b;
        }
        Id128(out)
    }

    /// True for the all-zero identifier
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }
}

impl fmt::Display for Id128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Id128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id128({})", self.to_hex())
    }
}

impl FromStr for Id128 {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for Id128 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

struct BytesVisitor<const N: usize>;

impl<'de, const N: usize> Visitor<'de> for BytesVisitor<N> {
    type Value = [u8; N];

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a byte string of length {N}")
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
        v.try_into()
            .map_err(|_| E::invalid_length(v.len(), &self))
    }

    fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut out = [0u8; N];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        if seq.next_element::<u8>()?.is_some() {
            return Err(de::Error::invalid_length(N + 1, &self));
        }
        Ok(out)
    }
}

impl<'de> Deserialize<'de> for Id128 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_bytes(BytesVisitor::<16>).map(Id128)
    }
}

/// A 256-bit store identifier - the fingerprint of the store certificate
///
/// Rendered canonically as 64 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreId([u8; 32]);

impl StoreId {
    /// Length of the identifier in bytes
    pub const LEN: usize = 32;

    /// Wraps a raw 32-byte fingerprint
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        StoreId(bytes)
    }

    /// Parses a fingerprint from a byte slice
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ModelError> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ModelError::InvalidId(format!("expected 32 bytes, got {}", bytes.len())))?;
        Ok(StoreId(arr))
    }

    /// Parses a fingerprint from its 64-character hex rendering
    pub fn from_hex(s: &str) -> Result<Self, ModelError> {
        let bytes = hex::decode(s.trim()).map_err(|e| ModelError::InvalidId(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    /// Raw bytes of the fingerprint
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex rendering
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StoreId({})", self.to_hex())
    }
}

impl FromStr for StoreId {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl Serialize for StoreId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for StoreId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer
            .deserialize_bytes(BytesVisitor::<32>)
            .map(StoreId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_random() {
        let a = Id128::generate();
        let b = Id128::generate();
        assert_ne!(a, b);
        assert!(!a.is_zero());
    }

    #[test]
    fn test_hex_round_trip() {
        let id = Id128::generate();
        let parsed = Id128::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_hex_rejects_bad_length() {
        assert!(Id128::from_hex("abcd").is_err());
        assert!(Id128::from_hex("not hex at all").is_err());
    }

    #[test]
    fn test_xor_involution() {
        let a = Id128::generate();
        let b = Id128::generate();
        assert_eq!(a.xor(&b).xor(&b), a);
        assert!(a.xor(&a).is_zero());
        assert_eq!(a.xor(&Id128::ZERO), a);
    }

    #[test]
    fn test_store_id_round_trip() {
        let sid = StoreId::from_bytes([0xab; 32]);
        assert_eq!(sid.to_hex().len(), 64);
        assert_eq!(StoreId::from_hex(&sid.to_hex()).unwrap(), sid);
    }

    #[test]
    fn test_display_is_hex() {
        let id = Id128::from_bytes([0; 16]);
        assert_eq!(id.to_string(), "00000000000000000000000000000000");
    }
}
