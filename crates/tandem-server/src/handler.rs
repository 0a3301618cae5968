//! The application seam of the dispatcher.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use tandem_core::ServiceError;

use crate::registry::ConnectionId;

/// Services one request family.
///
/// The dispatcher decodes each inbound payload into [`Handler::Request`],
/// calls [`Handler::handle`] on its own task, and encodes the result (or the
/// [`ServiceError`]) into the response packet.
pub trait Handler: Send + Sync + 'static {
    type Request: DeserializeOwned + Send + 'static;
    type Response: Serialize + Send + 'static;

    /// Answer one request arriving on connection `conn`.
    fn handle(
        &self,
        conn: ConnectionId,
        request: Self::Request,
    ) -> impl Future<Output = Result<Self::Response, ServiceError>> + Send;

    /// Called once after connection `conn` has been torn down.
    fn disconnected(&self, conn: ConnectionId) -> impl Future<Output = ()> + Send {
        let _ = conn;
        async {}
    }
}
