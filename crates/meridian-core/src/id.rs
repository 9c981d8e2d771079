//! Node and content identifiers, and the XOR metric over them.
//!
//! Identifiers are 160 bits. A node id is random and fixed for the life of the
//! node; a content hash is derived from the content's manifest (see
//! [`crate::manifest`]). Both live in the same keyspace so lookups can target
//! either.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Identifier width in bytes.
pub const ID_LEN: usize = 20;

/// Identifier width in bits. Also the number of routing buckets.
pub const ID_BITS: usize = ID_LEN * 8;

/// A 160-bit identifier in the shared keyspace.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Id(pub [u8; ID_LEN]);

/// Identifies a peer. Immutable once generated.
pub type NodeId = Id;

/// Identifies a piece of content. Derived from its manifest.
pub type ContentHash = Id;

/// BLAKE3 digest of a single chunk's bytes.
pub type ChunkDigest = [u8; 32];

impl Id {
    pub const ZERO: Self = Self([0; ID_LEN]);

    pub fn new(bytes: [u8; ID_LEN]) -> Self {
        Id(bytes)
    }

    /// Generate a fresh random identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        rand::thread_rng().fill(&mut bytes);
        Id(bytes)
    }

    /// BLAKE3 of `data`, truncated to the identifier width.
    pub fn from_hash(data: &[u8]) -> Self {
        let digest = blake3::hash(data);
        let mut bytes = [0u8; ID_LEN];
        bytes.copy_from_slice(&digest.as_bytes()[..ID_LEN]);
        Id(bytes)
    }

    /// Place `v` big-endian in the low-order bytes, zero elsewhere.
    pub fn from_low_u64(v: u64) -> Self {
        let mut bytes = [0u8; ID_LEN];
        bytes[ID_LEN - 8..].copy_from_slice(&v.to_be_bytes());
        Id(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    pub fn distance(&self, other: &Id) -> Distance {
        Distance::between(self, other)
    }

    /// First eight hex characters, for log fields.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl From<[u8; ID_LEN]> for Id {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Id(bytes)
    }
}

impl AsRef<[u8]> for Id {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.short())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum IdParseError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("expected {ID_LEN} bytes, got {0}")]
    Length(usize),
}

impl FromStr for Id {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s)?;
        if bytes.len() != ID_LEN {
            return Err(IdParseError::Length(bytes.len()));
        }
        let mut arr = [0u8; ID_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Id(arr))
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// XOR of two identifiers, ordered as a big-endian unsigned integer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Distance([u8; ID_LEN]);

impl Distance {
    pub const ZERO: Self = Self([0; ID_LEN]);
    pub const MAX: Self = Self([0xFF; ID_LEN]);

    pub fn between(a: &Id, b: &Id) -> Self {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = a.0[i] ^ b.0[i];
        }
        Self(out)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; ID_LEN]
    }

    pub fn leading_zeros(&self) -> usize {
        for (i, &byte) in self.0.iter().enumerate() {
            if byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_BITS
    }

    /// Position of the highest set bit, counted from the least significant
    /// bit. A distance of 1 is bucket 0; a distance with the top bit set is
    /// bucket 159. `None` for identical ids.
    pub fn bucket_index(&self) -> Option<usize> {
        let zeros = self.leading_zeros();
        if zeros >= ID_BITS {
            None
        } else {
            Some(ID_BITS - 1 - zeros)
        }
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }
}

impl Ord for Distance {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Distance {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(self.0))
    }
}

/// Full BLAKE3 digest of a chunk.
pub fn chunk_digest(data: &[u8]) -> ChunkDigest {
    *blake3::hash(data).as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_is_symmetric() {
        let a = Id::random();
        let b = Id::random();
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn distance_zero_only_for_identical_ids() {
        let a = Id::new([0x42; ID_LEN]);
        assert!(a.distance(&a).is_zero());
        assert_eq!(a.distance(&a).bucket_index(), None);

        let b = Id::from_low_u64(1);
        assert!(!Id::ZERO.distance(&b).is_zero());
    }

    #[test]
    fn bucket_index_is_highest_differing_bit() {
        let local = Id::ZERO;
        assert_eq!(local.distance(&Id::from_low_u64(0b0001)).bucket_index(), Some(0));
        assert_eq!(local.distance(&Id::from_low_u64(0b0110)).bucket_index(), Some(2));
        assert_eq!(local.distance(&Id::from_low_u64(0b1111)).bucket_index(), Some(3));

        let mut top = [0u8; ID_LEN];
        top[0] = 0x80;
        assert_eq!(local.distance(&Id::new(top)).bucket_index(), Some(ID_BITS - 1));
    }

    #[test]
    fn distance_orders_as_integer() {
        let target = Id::ZERO;
        let near = target.distance(&Id::from_low_u64(1));
        let mid = target.distance(&Id::from_low_u64(6));
        let far = target.distance(&Id::from_low_u64(15));
        assert!(near < mid && mid < far);
        assert!(far < Distance::MAX);
    }

    #[test]
    fn hex_roundtrip_and_json() {
        let id = Id::random();
        let parsed: Id = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);

        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let back: Id = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert_eq!("abcd".parse::<Id>(), Err(IdParseError::Length(2)));
        assert!("zz".parse::<Id>().is_err());
    }

    #[test]
    fn from_hash_truncates_blake3() {
        let id = Id::from_hash(b"meridian");
        assert_eq!(&id.0[..], &blake3::hash(b"meridian").as_bytes()[..ID_LEN]);
    }
}
