//! Reference services served by the `tandem-server` binary.

pub mod media;
pub mod messenger;

pub use media::{MediaConfig, MediaService};
pub use messenger::{MessengerConfig, MessengerService};
