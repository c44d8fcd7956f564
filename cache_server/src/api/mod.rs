// API module for the cache server
//
// HTTP surfaces: one binary cache router per instance, the server wide
// Cachix API, and the helper that serves a router on a bound listener.

use crate::error::{CacheServerError, Result};
use axum::Router;
use std::future::Future;
use std::net::TcpListener;
use tracing::info;

pub mod cache;
pub mod proxy;
pub mod server;

pub use cache::{cache_router, CacheState};
pub use proxy::{RemoteProxy, FORWARDED_HEADER};
pub use server::{server_router, ServerState};

/// Serve `router` on an already bound listener until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    listener.set_nonblocking(true)?;
    let addr = listener.local_addr()?;
    info!("Listening on {}", addr);

    axum::Server::from_tcp(listener)
        .map_err(|e| CacheServerError::Internal(format!("Cannot serve on {}: {}", addr, e)))?
        .serve(router.into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| CacheServerError::Internal(format!("Server on {} failed: {}", addr, e)))
}
