//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tandem_core::{TandemError, TandemResult, MAX_PACKET_LEN};
use tracing::info;

use crate::dispatcher::DispatcherConfig;
use crate::services::media::MediaConfig;
use crate::services::messenger::MessengerConfig;

/// Default location of the server config file.
pub const DEFAULT_CONFIG_PATH: &str = "~/.tandem/server.toml";

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub media: MediaSection,
    #[serde(default)]
    pub messenger: MessengerSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    /// Listening port. When absent, each service uses its own default.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
    #[serde(default = "default_max_packet_len")]
    pub max_packet_len: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: None,
            max_in_flight: default_max_in_flight(),
            drain_grace_ms: default_drain_grace_ms(),
            max_packet_len: default_max_packet_len(),
        }
    }
}

/// `[media]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaSection {
    #[serde(default = "default_root_dir")]
    pub root_dir: String,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: f64,
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,
    #[serde(default = "default_prefetch")]
    pub prefetch: usize,
}

impl Default for MediaSection {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            frame_rate: default_frame_rate(),
            frame_size: default_frame_size(),
            prefetch: default_prefetch(),
        }
    }
}

/// `[messenger]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct MessengerSection {
    /// bcrypt work factor for stored passwords.
    #[serde(default = "default_hash_cost")]
    pub hash_cost: u32,
}

impl Default for MessengerSection {
    fn default() -> Self {
        Self {
            hash_cost: default_hash_cost(),
        }
    }
}

fn default_max_in_flight() -> usize {
    64
}
fn default_drain_grace_ms() -> u64 {
    1000
}
fn default_max_packet_len() -> usize {
    MAX_PACKET_LEN
}
fn default_root_dir() -> String {
    "./videos".to_string()
}
fn default_frame_rate() -> f64 {
    24.0
}
fn default_frame_size() -> usize {
    64 * 1024
}
fn default_prefetch() -> usize {
    16
}
fn default_hash_cost() -> u32 {
    bcrypt::DEFAULT_COST
}

/// CLI values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub port: Option<u16>,
    pub max_in_flight: Option<usize>,
    pub root_dir: Option<String>,
    pub frame_rate: Option<f64>,
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub dispatcher: DispatcherConfig,
    pub media: MediaConfig,
    pub messenger: MessengerConfig,
}

impl ServerConfig {
    /// Load config from a TOML file, then apply CLI overrides.
    ///
    /// A missing file is not an error; defaults are used instead.
    /// `default_port` applies when neither the CLI nor the file names a port.
    pub fn load(
        config_path: Option<&Path>,
        default_port: u16,
        overrides: &Overrides,
    ) -> TandemResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| TandemError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, default_port, overrides)
    }

    fn resolve(file: ConfigFile, default_port: u16, overrides: &Overrides) -> TandemResult<Self> {
        let port = overrides.port.or(file.server.port).unwrap_or(default_port);
        let max_in_flight = overrides.max_in_flight.unwrap_or(file.server.max_in_flight);
        if max_in_flight == 0 {
            return Err(TandemError::Config("max_in_flight must be at least 1".into()));
        }

        let frame_rate = overrides.frame_rate.unwrap_or(file.media.frame_rate);
        if !(frame_rate.is_finite() && frame_rate > 0.0) {
            return Err(TandemError::Config(format!(
                "frame_rate must be positive, got {frame_rate}"
            )));
        }
        if file.media.frame_size == 0 {
            return Err(TandemError::Config("frame_size must be at least 1".into()));
        }

        let hash_cost = file.messenger.hash_cost;
        if !(4..=31).contains(&hash_cost) {
            return Err(TandemError::Config(format!(
                "hash_cost must be between 4 and 31, got {hash_cost}"
            )));
        }

        let root_dir = overrides
            .root_dir
            .clone()
            .unwrap_or(file.media.root_dir);

        Ok(Self {
            port,
            dispatcher: DispatcherConfig {
                max_in_flight,
                drain_grace: Duration::from_millis(file.server.drain_grace_ms),
                max_packet_len: file.server.max_packet_len,
            },
            media: MediaConfig {
                root_dir: expand_tilde_str(&root_dir),
                frame_rate,
                frame_size: file.media.frame_size,
                prefetch: file.media.prefetch.max(1),
            },
            messenger: MessengerConfig { hash_cost },
        })
    }
}

/// Expand `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
