//! Client-side admission gate keyed by the server's port.
//!
//! The firewall is split into two types, like a config/enforcer pair:
//!
//! - [`FirewallPolicy`]: the rule set: an allow-list or a deny-list of ports.
//! - [`Firewall`]: the shared runtime object that owns the active policy and
//!   answers `check` calls from every client holding it.
//!
//! | Mode        | empty list    | `open(p)`      | `close(p)`   |
//! |-------------|---------------|----------------|--------------|
//! | `WhiteList` | deny all      | adds `p`       | removes `p`  |
//! | `BlackList` | allow all     | removes `p`    | adds `p`     |

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{PoisonError, RwLock};
use tandem_core::{TandemError, TandemResult};
use tracing::{debug, info};

/// Which kind of policy is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirewallMode {
    /// Default-deny: only opened ports pass.
    WhiteList,
    /// Default-allow: only closed ports are dropped.
    #[default]
    BlackList,
}

/// A port admission policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirewallPolicy {
    WhiteList(HashSet<u16>),
    BlackList(HashSet<u16>),
}

impl FirewallPolicy {
    /// A fresh policy of the given mode with an empty list.
    pub fn new(mode: FirewallMode) -> Self {
        match mode {
            FirewallMode::WhiteList => Self::WhiteList(HashSet::new()),
            FirewallMode::BlackList => Self::BlackList(HashSet::new()),
        }
    }

    pub fn mode(&self) -> FirewallMode {
        match self {
            Self::WhiteList(_) => FirewallMode::WhiteList,
            Self::BlackList(_) => FirewallMode::BlackList,
        }
    }

    /// Let traffic to `port` through.
    pub fn open(&mut self, port: u16) {
        match self {
            Self::WhiteList(allowed) => {
                allowed.insert(port);
            }
            Self::BlackList(denied) => {
                denied.remove(&port);
            }
        }
    }

    /// Stop traffic to `port`.
    pub fn close(&mut self, port: u16) {
        match self {
            Self::WhiteList(allowed) => {
                allowed.remove(&port);
            }
            Self::BlackList(denied) => {
                denied.insert(port);
            }
        }
    }

    /// Whether traffic to `port` may pass.
    pub fn check(&self, port: u16) -> bool {
        match self {
            Self::WhiteList(allowed) => allowed.contains(&port),
            Self::BlackList(denied) => !denied.contains(&port),
        }
    }
}

impl Default for FirewallPolicy {
    fn default() -> Self {
        Self::new(FirewallMode::default())
    }
}

/// `[firewall]` section of the client config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallConfig {
    #[serde(default)]
    pub mode: FirewallMode,
    /// Ports to open after activating `mode`.
    #[serde(default)]
    pub open: Vec<u16>,
    /// Ports to close after activating `mode`.
    #[serde(default)]
    pub closed: Vec<u16>,
}

/// Shared, swappable admission gate consulted before a client touches the wire.
///
/// Hand one `Arc<Firewall>` to every client that should obey the same rules;
/// separate instances never affect each other.
#[derive(Debug, Default)]
pub struct Firewall {
    policy: RwLock<FirewallPolicy>,
}

impl Firewall {
    pub fn new(mode: FirewallMode) -> Self {
        Self {
            policy: RwLock::new(FirewallPolicy::new(mode)),
        }
    }

    /// Build a firewall from config: activate the mode, then apply `open`
    /// and `closed` in that order.
    pub fn from_config(config: &FirewallConfig) -> Self {
        let mut policy = FirewallPolicy::new(config.mode);
        for port in &config.open {
            policy.open(*port);
        }
        for port in &config.closed {
            policy.close(*port);
        }
        Self {
            policy: RwLock::new(policy),
        }
    }

    /// Replace the active policy with an empty one of `mode`.
    ///
    /// Entries of the previous policy are discarded, even when the mode
    /// does not change.
    pub fn activate(&self, mode: FirewallMode) {
        let mut policy = self.policy.write().unwrap_or_else(PoisonError::into_inner);
        *policy = FirewallPolicy::new(mode);
        info!(?mode, "firewall policy activated");
    }

    pub fn mode(&self) -> FirewallMode {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .mode()
    }

    pub fn open(&self, port: u16) {
        self.policy
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .open(port);
    }

    pub fn close(&self, port: u16) {
        self.policy
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .close(port);
    }

    pub fn check(&self, port: u16) -> bool {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .check(port)
    }

    /// Like [`check`](Self::check), but as a `Result` for `?` at call sites.
    ///
    /// # Errors
    ///
    /// Returns [`TandemError::PacketDropped`] when `port` is not admitted.
    pub fn admit(&self, port: u16) -> TandemResult<()> {
        if self.check(port) {
            Ok(())
        } else {
            debug!(port, "firewall dropped outbound packet");
            Err(TandemError::PacketDropped { port })
        }
    }

    /// Snapshot of the active policy.
    pub fn policy(&self) -> FirewallPolicy {
        self.policy
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
