//! tandem-core: Shared protocol library for the tandem RPC transport.
//!
//! Provides the wire packet and correlation id, the length-prefixed CBOR
//! packet codec, the error taxonomy, and the request/response families the
//! messenger and media services exchange.

pub mod codec;
pub mod error;
pub mod messages;
pub mod packet;

// Re-export commonly used items at crate root.
pub use codec::{read_packet, read_packet_limited, write_packet, HEADER_LEN, MAX_PACKET_LEN};
pub use error::{ServiceError, TandemError, TandemResult};
pub use packet::{CorrelationId, Packet};
