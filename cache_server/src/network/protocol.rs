// DHT wire messages
//
// JSON bodies exchanged on POST /dht/rpc. Every request names its sender
// and every reply names its responder so both ends can refresh their
// routing tables.

use super::node_id::NodeId;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Path of the RPC endpoint on the DHT port
pub const RPC_PATH: &str = "/dht/rpc";

/// A reachable node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contact {
    pub id: NodeId,
    /// `host:port` of the node's DHT listener
    pub address: String,
}

impl Contact {
    pub fn new(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub sender: Contact,
    pub request: DhtRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DhtRequest {
    Ping,
    FindNode {
        target: NodeId,
    },
    FindValue {
        key: NodeId,
    },
    Store {
        key: NodeId,
        #[serde(with = "base64_bytes")]
        value: Vec<u8>,
        /// Lifetime the receiver grants the value
        ttl_secs: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReply {
    pub responder: Contact,
    pub response: DhtResponse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DhtResponse {
    Pong,
    Nodes {
        contacts: Vec<Contact>,
    },
    /// Values held for the key, plus closer contacts to keep searching
    Value {
        values: Vec<StoredValue>,
        contacts: Vec<Contact>,
    },
    Stored,
    /// The node holds as many values as it accepts
    Rejected,
}

/// One publisher's value under a key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredValue {
    pub publisher: NodeId,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Unix seconds
    pub expires_at: i64,
}

impl StoredValue {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}
