//! Client configuration at `~/.tandem/config.toml`.
//!
//! Holds the default server host, per-service ports, request deadlines and
//! the firewall policy. CLI flags always override config file values.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tandem_client::{ClientConfig, Firewall, FirewallConfig};
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub firewall: FirewallConfig,
}

/// `[client]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_messenger_port")]
    pub messenger_port: u16,

    #[serde(default = "default_media_port")]
    pub media_port: u16,

    /// Per-request deadline in seconds; 0 waits forever.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            messenger_port: default_messenger_port(),
            media_port: default_media_port(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_messenger_port() -> u16 {
    8080
}

fn default_media_port() -> u16 {
    8081
}

fn default_request_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Connection settings for [`tandem_client::TandemClient`], firewall included.
    pub fn client_config(&self) -> ClientConfig {
        let request_timeout = match self.client.request_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        ClientConfig {
            firewall: Arc::new(Firewall::from_config(&self.firewall)),
            request_timeout,
            connect_timeout: Duration::from_secs(self.client.connect_timeout_secs.max(1)),
        }
    }
}
