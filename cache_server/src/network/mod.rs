// Network module for the cache server
//
// Kademlia style DHT used to discover other nodes serving a cache instance.

pub mod dht;
pub mod discovery;
pub mod node_id;
pub mod protocol;
pub mod routing;
pub mod transport;

pub use dht::{DhtNode, ALPHA};
pub use discovery::{cache_key, Announcement, DiscoveryNode, RemoteLookup, ANNOUNCE_INTERVAL, ANNOUNCE_TTL};
pub use node_id::{Distance, NodeId};
pub use protocol::{Contact, DhtRequest, DhtResponse, RpcEnvelope, RpcReply, StoredValue};
pub use routing::{RoutingTable, K};
pub use transport::{DhtTransport, HttpTransport};

/// Node id derived from the address other nodes reach our DHT listener at
pub fn node_id_for(hostname: &str, dht_port: u16) -> NodeId {
    NodeId::from_string(&format!("{}:{}", hostname, dht_port))
}
