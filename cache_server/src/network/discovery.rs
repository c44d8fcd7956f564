// Cache node discovery
//
// Publishes one announcement per locally served cache instance and resolves
// other nodes serving the same instance name. Discovery never blocks local
// serving: lookups are bounded by the remote timeout and failures degrade
// to "not found remotely".

use super::dht::DhtNode;
use super::node_id::NodeId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

/// Lifetime of a published announcement
pub const ANNOUNCE_TTL: Duration = Duration::from_secs(30 * 60);

/// Default republish interval, shorter than the TTL
pub const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// DHT key under which nodes serving `cache_name` announce themselves
pub fn cache_key(cache_name: &str) -> NodeId {
    NodeId::from_string(&format!("cache:{}", cache_name))
}

/// A node serving one cache instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub cache_name: String,
    pub address: String,
    pub port: u16,
    /// Unix seconds of publication
    pub last_seen: i64,
}

impl Announcement {
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }
}

/// Result of a remote lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteLookup {
    Found(Announcement),
    NotFound,
    /// The network could not be asked; treat as a miss
    Degraded,
}

pub struct DiscoveryNode {
    dht: Option<Arc<DhtNode>>,
    hostname: String,
    bootstrap: Option<String>,
    timeout: Duration,
    served: RwLock<Vec<(String, u16)>>,
}

impl DiscoveryNode {
    /// Node with every DHT call disabled
    pub fn standalone() -> Self {
        Self {
            dht: None,
            hostname: String::new(),
            bootstrap: None,
            timeout: Duration::ZERO,
            served: RwLock::new(Vec::new()),
        }
    }

    /// Node participating in the DHT
    ///
    /// # Arguments
    ///
    /// * `hostname` - Address other nodes use to reach our cache ports
    /// * `bootstrap` - `host:port` to join through, `None` when we are the bootstrap
    /// * `timeout` - Upper bound on each lookup
    pub fn networked(dht: Arc<DhtNode>, hostname: String, bootstrap: Option<String>, timeout: Duration) -> Self {
        Self {
            dht: Some(dht),
            hostname,
            bootstrap,
            timeout,
            served: RwLock::new(Vec::new()),
        }
    }

    pub fn is_standalone(&self) -> bool {
        self.dht.is_none()
    }

    pub fn dht(&self) -> Option<&Arc<DhtNode>> {
        self.dht.as_ref()
    }

    /// Register a locally served cache for announcement
    pub fn serve(&self, cache_name: &str, port: u16) {
        let mut served = self.served.write();
        served.retain(|(name, _)| name != cache_name);
        served.push((cache_name.to_string(), port));
    }

    /// Join through the bootstrap node, logging instead of failing
    pub async fn join(&self) -> bool {
        let (Some(dht), Some(bootstrap)) = (&self.dht, &self.bootstrap) else {
            return false;
        };

        match time::timeout(self.timeout, dht.join(bootstrap)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!("DHT bootstrap via {} failed, discovery degraded: {}", bootstrap, e);
                false
            }
            Err(_) => {
                warn!("DHT bootstrap via {} timed out, discovery degraded", bootstrap);
                false
            }
        }
    }

    /// Publish a fresh announcement for every served cache
    pub async fn announce_all(&self) -> usize {
        let Some(dht) = &self.dht else {
            return 0;
        };

        let served = self.served.read().clone();
        let now = chrono::Utc::now().timestamp();
        let mut published = 0;

        for (cache_name, port) in served {
            let announcement = Announcement {
                cache_name: cache_name.clone(),
                address: self.hostname.clone(),
                port,
                last_seen: now,
            };
            let value = match serde_json::to_vec(&announcement) {
                Ok(value) => value,
                Err(e) => {
                    warn!("Could not encode announcement for {}: {}", cache_name, e);
                    continue;
                }
            };

            match dht.announce(cache_key(&cache_name), value, ANNOUNCE_TTL).await {
                Ok(peers) => {
                    debug!("Announced cache {} to {} peers", cache_name, peers);
                    published += 1;
                }
                Err(e) => warn!("Announcement of cache {} failed: {}", cache_name, e),
            }
        }
        published
    }

    /// Find another node serving `cache_name`
    ///
    /// The most recently seen announcement from a node other than us wins.
    pub async fn resolve(&self, cache_name: &str) -> RemoteLookup {
        let Some(dht) = &self.dht else {
            return RemoteLookup::NotFound;
        };

        let values = match time::timeout(self.timeout, dht.lookup(cache_key(cache_name))).await {
            Ok(Ok(values)) => values,
            Ok(Err(e)) => {
                warn!("Lookup of cache {} degraded: {}", cache_name, e);
                return RemoteLookup::Degraded;
            }
            Err(_) => {
                warn!("Lookup of cache {} timed out", cache_name);
                return RemoteLookup::Degraded;
            }
        };

        let best = values
            .into_iter()
            .filter(|v| v.publisher != dht.id())
            .filter_map(|v| serde_json::from_slice::<Announcement>(&v.data).ok())
            .filter(|a| a.cache_name == cache_name)
            .max_by_key(|a| a.last_seen);

        match best {
            Some(announcement) => RemoteLookup::Found(announcement),
            None if self.bootstrap.is_some() && dht.table().is_empty() => RemoteLookup::Degraded,
            None => RemoteLookup::NotFound,
        }
    }

    /// Join, then republish every `interval` until the handle is aborted
    ///
    /// Rejoins on each tick while the routing table is empty.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> Option<JoinHandle<()>> {
        let dht = self.dht.clone()?;
        Some(tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if self.bootstrap.is_some() && dht.table().is_empty() {
                    if self.join().await {
                        info!("DHT node {} joined the network", dht.id());
                    }
                }
                self.announce_all().await;
                dht.prune_expired(chrono::Utc::now().timestamp());
            }
        }))
    }
}
