// Node identifiers and the XOR metric
//
// Ids and keys share one 256 bit space. Distances compare big endian, so
// the derived ordering on the byte array is the numeric ordering.

use crate::error::{CacheServerError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Width of the id space in bits, and the number of k-buckets
pub const ID_BITS: usize = 256;

/// 256 bit identifier of a node or a stored key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Hash an arbitrary string into the id space
    pub fn from_string(id: &str) -> Self {
        Self(*blake3::hash(id.as_bytes()).as_bytes())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(value: &str) -> Result<Self> {
        let bytes = hex::decode(value)
            .map_err(|e| CacheServerError::Serialization(format!("Invalid node id: {}", e)))?;
        let raw: [u8; 32] = bytes.try_into().map_err(|_| {
            CacheServerError::Serialization(format!("Node id {} is not 32 bytes", value))
        })?;
        Ok(Self(raw))
    }

    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(out)
    }

    /// Index of the k-bucket `other` falls into, `None` for ourselves
    ///
    /// Bucket 0 holds the farthest half of the space.
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        let zeros = self.distance(other).leading_zeros();
        (zeros < ID_BITS).then_some(zeros)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        NodeId::from_hex(&value).map_err(serde::de::Error::custom)
    }
}

/// XOR distance between two ids
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Distance([u8; 32]);

impl Distance {
    pub fn leading_zeros(&self) -> usize {
        let mut zeros = 0;
        for byte in self.0 {
            if byte == 0 {
                zeros += 8;
            } else {
                zeros += byte.leading_zeros() as usize;
                break;
            }
        }
        zeros
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_is_symmetric() {
        let a = NodeId::from_string("node-a:4222");
        let b = NodeId::from_string("node-b:4222");
        assert_eq!(a.distance(&b), b.distance(&a));
        assert!(a.distance(&a).is_zero());
        assert!(a.distance(&b) > a.distance(&a));
    }

    #[test]
    fn test_bucket_index() {
        let zero = NodeId::from_bytes([0u8; 32]);
        let mut far = [0u8; 32];
        far[0] = 0x80;
        let mut near = [0u8; 32];
        near[31] = 0x01;

        assert_eq!(zero.bucket_index(&zero), None);
        assert_eq!(zero.bucket_index(&NodeId::from_bytes(far)), Some(0));
        assert_eq!(zero.bucket_index(&NodeId::from_bytes(near)), Some(255));
    }

    #[test]
    fn test_hex_serde() {
        let id = NodeId::from_string("cache:main");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<NodeId>("\"abcd\"").is_err());
    }
}
