// Server runtime
//
// Binds every listener up front so ports are known before anything is
// served, then runs the routers and background tasks until shutdown.

use crate::api::{self, cache_router, server_router, CacheState, RemoteProxy, ServerState};
use crate::cache::{CacheInstance, CacheRegistry};
use crate::config::Config;
use crate::error::{CacheServerError, Result};
use crate::network::{node_id_for, Contact, DhtNode, DhtTransport, DiscoveryNode, HttpTransport};
use crate::storage::ArtifactIndex;
use std::collections::BTreeMap;
use std::future::Future;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

struct BoundCache {
    instance: Arc<CacheInstance>,
    listener: TcpListener,
    port: u16,
}

/// A fully wired server whose listeners are bound but not yet serving
pub struct CacheServer {
    config: Config,
    registry: Arc<CacheRegistry>,
    discovery: Arc<DiscoveryNode>,
    server_listener: TcpListener,
    dht_listener: Option<TcpListener>,
    caches: Vec<BoundCache>,
}

fn bind(host: &str, port: u16) -> Result<TcpListener> {
    TcpListener::bind((host, port)).map_err(|e| {
        CacheServerError::ConfigInvalid(format!("Cannot bind {}:{}: {}", host, port, e))
    })
}

impl CacheServer {
    /// Open the index, build every instance and bind all ports
    ///
    /// A configured port of 0 binds an ephemeral port; the bound port is
    /// what gets announced.
    pub async fn bind(config: Config) -> Result<Self> {
        let server = &config.server;
        let index = ArtifactIndex::open(&server.database)?;
        let registry = Arc::new(CacheRegistry::from_config(&config.caches, server, &index).await?);
        info!("Loaded {} cache instances", registry.len());

        let server_listener = bind(&server.bind_address, server.server_port)?;

        let (discovery, dht_listener) = if server.standalone {
            info!("Standalone mode, DHT disabled");
            (DiscoveryNode::standalone(), None)
        } else {
            let listener = bind(&server.bind_address, server.dht_port)?;
            let dht_port = listener.local_addr()?.port();
            let contact = Contact::new(
                node_id_for(&server.hostname, dht_port),
                format!("{}:{}", server.hostname, dht_port),
            );
            let transport: Arc<dyn DhtTransport> = Arc::new(HttpTransport::new(server.remote_timeout())?);
            let dht = Arc::new(DhtNode::new(contact, transport));
            info!("DHT node {} on port {}", dht.id(), dht_port);

            let bootstrap = if server.is_bootstrap_self() {
                None
            } else {
                Some(format!("{}:{}", server.dht_bootstrap_host, server.dht_bootstrap_port))
            };
            let discovery = DiscoveryNode::networked(dht, server.hostname.clone(), bootstrap, server.remote_timeout());
            (discovery, Some(listener))
        };

        let mut caches = Vec::with_capacity(registry.len());
        for instance in registry.iter() {
            let listener = bind(&server.bind_address, instance.port)?;
            let port = listener.local_addr()?.port();
            discovery.serve(&instance.name, port);
            caches.push(BoundCache {
                instance: instance.clone(),
                listener,
                port,
            });
        }

        Ok(Self {
            config,
            registry,
            discovery: Arc::new(discovery),
            server_listener,
            dht_listener,
            caches,
        })
    }

    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    pub fn discovery(&self) -> &Arc<DiscoveryNode> {
        &self.discovery
    }

    pub fn server_addr(&self) -> Result<SocketAddr> {
        Ok(self.server_listener.local_addr()?)
    }

    pub fn dht_addr(&self) -> Result<Option<SocketAddr>> {
        match &self.dht_listener {
            Some(listener) => Ok(Some(listener.local_addr()?)),
            None => Ok(None),
        }
    }

    /// Bound address of the cache named `name`
    pub fn cache_addr(&self, name: &str) -> Result<Option<SocketAddr>> {
        match self.caches.iter().find(|c| c.instance.name == name) {
            Some(cache) => Ok(Some(cache.listener.local_addr()?)),
            None => Ok(None),
        }
    }

    /// Serve everything until `shutdown` resolves or a listener fails
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let server = &self.config.server;
        let (stop, stopped) = watch::channel(false);
        let mut servers: Vec<JoinHandle<Result<()>>> = Vec::new();
        let mut background: Vec<JoinHandle<()>> = Vec::new();
        let ports: BTreeMap<String, u16> = self
            .caches
            .iter()
            .map(|cache| (cache.instance.name.clone(), cache.port))
            .collect();
        let siblings: Vec<Arc<CacheInstance>> = self.registry.iter().filter(|i| i.is_public()).cloned().collect();

        for cache in self.caches {
            let proxy = if self.discovery.is_standalone() {
                None
            } else {
                Some(RemoteProxy::new(self.discovery.clone(), server.remote_timeout())?)
            };
            let state = Arc::new(CacheState {
                instance: cache.instance.clone(),
                proxy,
                siblings: siblings.clone(),
                max_upload_size: server.max_upload_size,
            });
            servers.push(tokio::spawn(api::serve(
                cache.listener,
                cache_router(state),
                wait_for_stop(stopped.clone()),
            )));
            background.push(cache.instance.sweeper().spawn(server.gc_interval()));
        }

        if let (Some(listener), Some(dht)) = (self.dht_listener, self.discovery.dht()) {
            servers.push(tokio::spawn(api::serve(
                listener,
                dht.clone().router(),
                wait_for_stop(stopped.clone()),
            )));
        }
        if let Some(handle) = self.discovery.clone().spawn(server.announce_interval()) {
            background.push(handle);
        }

        let state = Arc::new(ServerState {
            registry: self.registry.clone(),
            hostname: server.hostname.clone(),
            ports,
        });
        servers.push(tokio::spawn(api::serve(
            self.server_listener,
            server_router(state),
            wait_for_stop(stopped),
        )));

        let failed = tokio::select! {
            _ = shutdown => None,
            (result, _, _) = futures::future::select_all(servers.iter_mut()) => Some(result),
        };

        for handle in &background {
            handle.abort();
        }
        let _ = stop.send(true);

        if let Some(result) = failed {
            for handle in &servers {
                handle.abort();
            }
            let outcome = result?;
            if let Err(e) = &outcome {
                error!("Listener stopped: {}", e);
            }
            return outcome;
        }

        info!("Shutting down");
        for handle in servers {
            handle.await??;
        }
        Ok(())
    }
}

async fn wait_for_stop(mut stopped: watch::Receiver<bool>) {
    while !*stopped.borrow() {
        if stopped.changed().await.is_err() {
            return;
        }
    }
}
