// Kademlia node
//
// Serves the four RPCs from its routing table and value store, and runs
// iterative lookups against peers, ALPHA requests at a time.

use super::node_id::{Distance, NodeId};
use super::protocol::{Contact, DhtRequest, DhtResponse, RpcEnvelope, RpcReply, StoredValue, RPC_PATH};
use super::routing::{RoutingTable, K};
use super::transport::DhtTransport;
use crate::error::{CacheServerError, Result};
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use dashmap::DashMap;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Parallel requests per lookup round
pub const ALPHA: usize = 3;

/// Longest lifetime a node grants a stored value, two announce TTLs
pub const MAX_VALUE_TTL: Duration = Duration::from_secs(3600);

/// Distinct keys a node stores values for on behalf of peers
pub const MAX_STORED_KEYS: usize = 4096;

/// Publishers kept under one key
pub const MAX_PUBLISHERS_PER_KEY: usize = 64;

/// Outcome of an iterative lookup
struct Walk {
    closest: Vec<Contact>,
    values: HashMap<NodeId, StoredValue>,
    responded: usize,
    failed: usize,
}

pub struct DhtNode {
    contact: Contact,
    table: RoutingTable,
    values: DashMap<NodeId, HashMap<NodeId, StoredValue>>,
    transport: Arc<dyn DhtTransport>,
}

impl DhtNode {
    pub fn new(contact: Contact, transport: Arc<dyn DhtTransport>) -> Self {
        Self {
            table: RoutingTable::new(contact.id),
            contact,
            values: DashMap::new(),
            transport,
        }
    }

    pub fn id(&self) -> NodeId {
        self.contact.id
    }

    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Answer one request from a peer
    pub fn handle_rpc(&self, envelope: RpcEnvelope) -> RpcReply {
        let sender = envelope.sender;
        if sender.id != self.id() {
            self.table.insert(sender.clone());
        }

        let now = chrono::Utc::now().timestamp();
        let response = match envelope.request {
            DhtRequest::Ping => DhtResponse::Pong,
            DhtRequest::FindNode { target } => DhtResponse::Nodes {
                contacts: self.closest_for(&target, &sender.id),
            },
            DhtRequest::FindValue { key } => DhtResponse::Value {
                values: self.local_values(&key, now),
                contacts: self.closest_for(&key, &sender.id),
            },
            DhtRequest::Store {
                key,
                value,
                ttl_secs,
            } => {
                let ttl = ttl_secs.min(MAX_VALUE_TTL.as_secs()) as i64;
                let accepted = self.accept_remote(
                    key,
                    StoredValue {
                        publisher: sender.id,
                        data: value,
                        expires_at: now + ttl,
                    },
                    now,
                );
                if accepted {
                    DhtResponse::Stored
                } else {
                    DhtResponse::Rejected
                }
            }
        };

        RpcReply {
            responder: self.contact.clone(),
            response,
        }
    }

    fn closest_for(&self, target: &NodeId, requester: &NodeId) -> Vec<Contact> {
        let mut contacts = self.table.closest(target, K + 1);
        contacts.retain(|c| c.id != *requester);
        contacts.truncate(K);
        contacts
    }

    fn store_local(&self, key: NodeId, value: StoredValue) {
        let mut entry = self.values.entry(key).or_default();
        entry.insert(value.publisher, value);
    }

    /// Store a peer's value unless the key or publisher limits are reached
    fn accept_remote(&self, key: NodeId, value: StoredValue, now: i64) -> bool {
        if !self.values.contains_key(&key) && self.values.len() >= MAX_STORED_KEYS {
            self.prune_expired(now);
            if self.values.len() >= MAX_STORED_KEYS {
                warn!("Refusing value for {}: {} keys stored", key, MAX_STORED_KEYS);
                return false;
            }
        }

        let mut entry = self.values.entry(key).or_default();
        entry.retain(|_, v| !v.is_expired(now));
        if !entry.contains_key(&value.publisher) && entry.len() >= MAX_PUBLISHERS_PER_KEY {
            debug!("Refusing value for {} from {}: publisher limit", key, value.publisher);
            return false;
        }
        entry.insert(value.publisher, value);
        true
    }

    /// Unexpired values held locally for `key`
    pub fn local_values(&self, key: &NodeId, now: i64) -> Vec<StoredValue> {
        match self.values.get_mut(key) {
            Some(mut entry) => {
                entry.retain(|_, v| !v.is_expired(now));
                entry.values().cloned().collect()
            }
            None => Vec::new(),
        }
    }

    /// Drop every expired value
    pub fn prune_expired(&self, now: i64) {
        self.values.retain(|_, entry| {
            entry.retain(|_, v| !v.is_expired(now));
            !entry.is_empty()
        });
    }

    async fn rpc(&self, address: &str, request: DhtRequest) -> Result<DhtResponse> {
        let envelope = RpcEnvelope {
            sender: self.contact.clone(),
            request,
        };
        let reply = self.transport.call(address, envelope).await?;
        if reply.responder.id != self.id() {
            self.table.insert(reply.responder);
        }
        Ok(reply.response)
    }

    /// Join the network through the node at `bootstrap`
    ///
    /// # Returns
    ///
    /// * `Ok(n)` with the number of contacts known afterwards
    pub async fn join(&self, bootstrap: &str) -> Result<usize> {
        match self.rpc(bootstrap, DhtRequest::Ping).await? {
            DhtResponse::Pong => {}
            other => {
                return Err(CacheServerError::Discovery(format!(
                    "Bootstrap {} answered ping with {:?}",
                    bootstrap, other
                )))
            }
        }

        self.walk(self.id(), false).await;
        let known = self.table.len();
        info!("Joined DHT via {} with {} known contacts", bootstrap, known);
        Ok(known)
    }

    /// Publish `value` under `key` on the K closest nodes and locally
    ///
    /// # Returns
    ///
    /// * `Ok(n)` with the number of peers that accepted the value
    pub async fn announce(&self, key: NodeId, value: Vec<u8>, ttl: Duration) -> Result<usize> {
        let now = chrono::Utc::now().timestamp();
        self.store_local(
            key,
            StoredValue {
                publisher: self.id(),
                data: value.clone(),
                expires_at: now + ttl.as_secs() as i64,
            },
        );

        let walk = self.walk(key, false).await;
        let request = DhtRequest::Store {
            key,
            value,
            ttl_secs: ttl.as_secs(),
        };
        let replies = join_all(
            walk.closest
                .iter()
                .map(|c| self.rpc(&c.address, request.clone())),
        )
        .await;

        let mut stored = 0;
        for (contact, reply) in walk.closest.iter().zip(replies) {
            match reply {
                Ok(DhtResponse::Stored) => stored += 1,
                Ok(other) => debug!("Unexpected store reply from {}: {:?}", contact.id, other),
                Err(e) => {
                    debug!("Store on {} failed: {}", contact.address, e);
                    self.table.remove(&contact.id);
                }
            }
        }

        debug!("Announced {} on {} peers", key, stored);
        Ok(stored)
    }

    /// Every publisher's value for `key`, local and remote
    ///
    /// Fails with `Discovery` only when peers were asked, none answered and
    /// nothing is known locally.
    pub async fn lookup(&self, key: NodeId) -> Result<Vec<StoredValue>> {
        let now = chrono::Utc::now().timestamp();
        let mut found: HashMap<NodeId, StoredValue> = self
            .local_values(&key, now)
            .into_iter()
            .map(|v| (v.publisher, v))
            .collect();

        let walk = self.walk(key, true).await;
        for (publisher, value) in walk.values {
            keep_latest(&mut found, publisher, value);
        }

        if found.is_empty() && walk.responded == 0 && walk.failed > 0 {
            return Err(CacheServerError::Discovery(format!(
                "No DHT peer answered the lookup of {}",
                key
            )));
        }
        Ok(found.into_values().collect())
    }

    async fn walk(&self, target: NodeId, find_value: bool) -> Walk {
        let now = chrono::Utc::now().timestamp();
        let mut shortlist: BTreeMap<Distance, Contact> = self
            .table
            .closest(&target, K)
            .into_iter()
            .map(|c| (c.id.distance(&target), c))
            .collect();
        let mut queried: HashSet<NodeId> = HashSet::new();
        let mut values = HashMap::new();
        let mut responded = 0;
        let mut failed = 0;

        let request = if find_value {
            DhtRequest::FindValue { key: target }
        } else {
            DhtRequest::FindNode { target }
        };

        loop {
            let batch: Vec<Contact> = shortlist
                .values()
                .filter(|c| !queried.contains(&c.id))
                .take(ALPHA)
                .cloned()
                .collect();
            if batch.is_empty() {
                break;
            }
            for contact in &batch {
                queried.insert(contact.id);
            }

            let replies = join_all(batch.iter().map(|c| self.rpc(&c.address, request.clone()))).await;
            for (contact, reply) in batch.iter().zip(replies) {
                let contacts = match reply {
                    Ok(DhtResponse::Nodes { contacts }) => contacts,
                    Ok(DhtResponse::Value {
                        values: found,
                        contacts,
                    }) => {
                        for value in found.into_iter().filter(|v| !v.is_expired(now)) {
                            keep_latest(&mut values, value.publisher, value);
                        }
                        contacts
                    }
                    Ok(other) => {
                        debug!("Unexpected lookup reply from {}: {:?}", contact.id, other);
                        Vec::new()
                    }
                    Err(e) => {
                        warn!("DHT peer {} unreachable: {}", contact.address, e);
                        failed += 1;
                        self.table.remove(&contact.id);
                        shortlist.remove(&contact.id.distance(&target));
                        continue;
                    }
                };

                responded += 1;
                for found in contacts {
                    if found.id != self.id() {
                        shortlist.entry(found.id.distance(&target)).or_insert(found);
                    }
                }
            }

            if find_value && !values.is_empty() {
                break;
            }
            while shortlist.len() > K {
                shortlist.pop_last();
            }
        }

        Walk {
            closest: shortlist
                .into_values()
                .filter(|c| queried.contains(&c.id))
                .take(K)
                .collect(),
            values,
            responded,
            failed,
        }
    }

    /// Router serving the RPC endpoint
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route(RPC_PATH, post(rpc_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self)
    }
}

fn keep_latest(found: &mut HashMap<NodeId, StoredValue>, publisher: NodeId, value: StoredValue) {
    match found.get(&publisher) {
        Some(existing) if existing.expires_at >= value.expires_at => {}
        _ => {
            found.insert(publisher, value);
        }
    }
}

async fn rpc_handler(State(node): State<Arc<DhtNode>>, Json(envelope): Json<RpcEnvelope>) -> Json<RpcReply> {
    Json(node.handle_rpc(envelope))
}
