use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced by the tandem transport.
#[derive(Debug, Error)]
pub enum TandemError {
    #[error("malformed packet header: {0:?}")]
    MalformedHeader(String),

    #[error("short read: expected {expected} bytes, received {received}")]
    ShortRead { expected: usize, received: usize },

    #[error("transport closed")]
    TransportClosed,

    #[error("packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("packet dropped by firewall (port {port})")]
    PacketDropped { port: u16 },

    #[error("{0}")]
    Service(ServiceError),

    #[error("timeout")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<ciborium::de::Error<std::io::Error>> for TandemError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        TandemError::Codec(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for TandemError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        TandemError::Codec(e.to_string())
    }
}

impl From<ciborium::value::Error> for TandemError {
    fn from(e: ciborium::value::Error) -> Self {
        TandemError::Codec(e.to_string())
    }
}

impl From<ServiceError> for TandemError {
    fn from(e: ServiceError) -> Self {
        TandemError::Service(e)
    }
}

pub type TandemResult<T> = Result<T, TandemError>;

/// An application-level failure raised by a request handler.
///
/// Travels as the payload of an error packet and is handed back to the
/// waiting caller unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct ServiceError {
    /// Short failure class, e.g. `"StreamingError"`.
    pub kind: String,
    /// Human-readable description.
    pub message: String,
}

impl ServiceError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// The request payload could not be decoded into the handler's type.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("BadRequest", message)
    }

    /// The server failed while producing a response.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new("Internal", message)
    }
}
