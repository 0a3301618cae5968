//! tandem-server: per-packet request dispatch over TCP.
//!
//! A [`Dispatcher`] accepts connections, tracks them in a
//! [`ConnectionRegistry`], and services every inbound packet on its own
//! worker through a [`Handler`]. The [`services`] module holds the messenger
//! and media handlers shipped with the `tandem-server` binary.

pub mod config;
pub mod dispatcher;
pub mod handler;
pub mod registry;
pub mod services;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use handler::Handler;
pub use registry::{ConnectionEntry, ConnectionId, ConnectionRegistry};
