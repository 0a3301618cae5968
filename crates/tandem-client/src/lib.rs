//! tandem-client: Rust client library for the tandem RPC transport.
//!
//! Provides a multiplexed client that carries many concurrent requests over a
//! single TCP connection (optionally through a relay proxy), a port-keyed
//! firewall consulted before anything is sent, and typed wrappers for the
//! messenger and media request families.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tandem_client::{ClientConfig, MediaClient, TandemClient};
//!
//! # async fn example() -> tandem_client::TandemResult<()> {
//! let client = Arc::new(TandemClient::connect("127.0.0.1:8081", ClientConfig::default()).await?);
//! let media = MediaClient::new(client.clone());
//!
//! for file in media.list_media().await? {
//!     println!("{file}");
//! }
//!
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod firewall;
pub mod media;
pub mod messenger;

// Re-export primary public types.
pub use client::{ClientConfig, TandemClient};
pub use firewall::{Firewall, FirewallConfig, FirewallMode, FirewallPolicy};
pub use media::{MediaClient, StreamHandle};
pub use messenger::MessengerClient;

// Re-export tandem-core error types for convenience.
pub use tandem_core::{ServiceError, TandemError, TandemResult};
