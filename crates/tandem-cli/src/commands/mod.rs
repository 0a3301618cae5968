//! CLI subcommand implementations.

pub mod media;
pub mod messenger;

use anyhow::{Context, Result};
use std::sync::Arc;
use tandem_client::{ClientConfig, TandemClient};
use tracing::debug;

/// Where a subcommand connects to.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Relay proxy port on `host`, if the connection goes through one.
    pub proxy_port: Option<u16>,
}

impl Endpoint {
    /// Open a client connection, directly or through the proxy.
    pub async fn connect(&self, config: ClientConfig) -> Result<Arc<TandemClient>> {
        let client = match self.proxy_port {
            Some(proxy_port) => {
                debug!(host = %self.host, proxy_port, target = self.port, "connecting via proxy");
                TandemClient::connect_via_proxy((self.host.as_str(), proxy_port), self.port, config)
                    .await
                    .with_context(|| {
                        format!("failed to reach {}:{} via proxy port {proxy_port}", self.host, self.port)
                    })?
            }
            None => TandemClient::connect((self.host.as_str(), self.port), config)
                .await
                .with_context(|| format!("failed to connect to {}:{}", self.host, self.port))?,
        };
        Ok(Arc::new(client))
    }
}

/// Finish the exit handshake, reporting (not failing on) a refused close.
async fn disconnect(client: &TandemClient) {
    if let Err(e) = client.close().await {
        debug!(error = %e, "close failed");
    }
}
