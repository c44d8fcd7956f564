// DHT transport
//
// The node talks to peers through this trait so the wire can be swapped in
// tests. The production transport POSTs JSON to the peer's DHT listener.

use super::protocol::{RpcEnvelope, RpcReply, RPC_PATH};
use crate::error::{CacheServerError, Result};
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait DhtTransport: Send + Sync {
    /// Deliver one request to the node listening at `address`
    async fn call(&self, address: &str, envelope: RpcEnvelope) -> Result<RpcReply>;
}

/// JSON over HTTP
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl DhtTransport for HttpTransport {
    async fn call(&self, address: &str, envelope: RpcEnvelope) -> Result<RpcReply> {
        let url = format!("http://{}{}", address, RPC_PATH);
        let request = self.client.post(&url).json(&envelope).send();

        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| CacheServerError::Timeout(format!("DHT call to {} timed out", address)))??;

        if !response.status().is_success() {
            return Err(CacheServerError::Discovery(format!(
                "DHT peer {} answered {}",
                address,
                response.status()
            )));
        }
        Ok(response.json::<RpcReply>().await?)
    }
}
