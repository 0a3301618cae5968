//! Server dispatcher: accepts connections and services every packet on its
//! own worker.
//!
//! One reader per connection pulls packets off the socket and hands each to a
//! worker task, so a slow request never delays the next one on the same
//! connection. Workers share the connection's write half; responses go out
//! in completion order and are matched by correlation id on the client.
//!
//! # Connection lifecycle
//!
//! ```text
//! accept → registry.register (exit = false)
//!   reader loop ─┬─ packet → acquire permit → spawn worker
//!                └─ exit acknowledged / transport error → stop
//!   drain workers (≤ drain_grace) → abort leftovers
//!   registry.remove → Handler::disconnected → shutdown socket
//! ```

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time;
use tracing::{debug, error, info, warn};

use tandem_core::packet::encode_payload;
use tandem_core::{
    read_packet_limited, write_packet, Packet, ServiceError, TandemError, TandemResult,
    MAX_PACKET_LEN,
};

use crate::handler::Handler;
use crate::registry::{ConnectionId, ConnectionRegistry};

/// Tuning knobs for a [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum number of requests serviced concurrently per connection.
    /// Further packets wait in the socket until a worker finishes.
    pub max_in_flight: usize,
    /// How long teardown waits for in-flight workers before aborting them.
    pub drain_grace: Duration,
    /// Largest packet body accepted from a client.
    pub max_packet_len: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            drain_grace: Duration::from_secs(1),
            max_packet_len: MAX_PACKET_LEN,
        }
    }
}

/// Per-connection state shared by the reader and its workers.
struct ConnectionContext {
    id: ConnectionId,
    writer: Mutex<OwnedWriteHalf>,
    /// Wakes the reader once the exit handshake has been acknowledged.
    exit: Notify,
}

/// Accepts connections and routes each inbound packet to a [`Handler`].
pub struct Dispatcher<H: Handler> {
    handler: Arc<H>,
    registry: Arc<ConnectionRegistry>,
    config: DispatcherConfig,
}

impl<H: Handler> Clone for Dispatcher<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            registry: self.registry.clone(),
            config: self.config.clone(),
        }
    }
}

impl<H: Handler> Dispatcher<H> {
    pub fn new(handler: H, config: DispatcherConfig) -> Self {
        Self {
            handler: Arc::new(handler),
            registry: Arc::new(ConnectionRegistry::new()),
            config,
        }
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Bind `0.0.0.0:port` and serve forever.
    pub async fn listen(self, port: u16) -> TandemResult<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        self.serve(listener).await
    }

    /// Accept connections from `listener` forever.
    ///
    /// Accept failures are logged and retried; they never stop the loop.
    pub async fn serve(self, listener: TcpListener) -> TandemResult<()> {
        let local = listener.local_addr()?;
        info!(addr = %local, "dispatcher listening");

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.handle_connection(stream, peer).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }

    /// Serve one connection until exit, peer close, or a transport error.
    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "set_nodelay failed");
        }
        let conn_id = self.registry.register(peer).await;
        info!(conn_id, peer = %peer, "accepted connection");

        let (mut reader, writer) = stream.into_split();
        let conn = Arc::new(ConnectionContext {
            id: conn_id,
            writer: Mutex::new(writer),
            exit: Notify::new(),
        });
        let limiter = Arc::new(Semaphore::new(self.config.max_in_flight.max(1)));
        let mut workers: JoinSet<()> = JoinSet::new();

        loop {
            let packet = tokio::select! {
                result = read_packet_limited(&mut reader, self.config.max_packet_len) => match result {
                    Ok(packet) => packet,
                    Err(TandemError::TransportClosed) => {
                        debug!(conn_id, "peer closed connection");
                        break;
                    }
                    Err(e) => {
                        warn!(conn_id, error = %e, "dropping connection after read failure");
                        break;
                    }
                },
                _ = conn.exit.notified() => {
                    debug!(conn_id, "exit acknowledged, reader stopping");
                    break;
                }
            };

            if self.registry.exit_requested(conn_id).await {
                debug!(conn_id, correlation_id = %packet.correlation_id, "packet after exit discarded");
                break;
            }

            let permit = tokio::select! {
                permit = limiter.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = conn.exit.notified() => {
                    debug!(conn_id, "exit acknowledged while saturated, reader stopping");
                    break;
                }
            };

            reap_finished(conn_id, &mut workers);

            let worker = Worker {
                handler: self.handler.clone(),
                registry: self.registry.clone(),
                conn: conn.clone(),
            };
            workers.spawn(async move {
                let _permit = permit;
                worker.run(packet).await;
            });
        }

        self.drain(conn_id, &mut workers).await;

        self.registry.remove(conn_id).await;
        self.handler.disconnected(conn_id).await;

        if let Err(e) = conn.writer.lock().await.shutdown().await {
            debug!(conn_id, error = %e, "socket shutdown failed");
        }
        info!(conn_id, peer = %peer, "closing connection");
    }

    /// Give in-flight workers up to `drain_grace` to finish, then abort the rest.
    async fn drain(&self, conn_id: ConnectionId, workers: &mut JoinSet<()>) {
        reap_finished(conn_id, workers);
        if workers.is_empty() {
            return;
        }

        debug!(conn_id, in_flight = workers.len(), "draining in-flight requests");
        let drained = time::timeout(self.config.drain_grace, async {
            while let Some(result) = workers.join_next().await {
                log_worker_exit(conn_id, result);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                conn_id,
                remaining = workers.len(),
                "drain grace elapsed, aborting in-flight requests"
            );
            workers.abort_all();
        }
    }
}

/// Services a single packet.
struct Worker<H: Handler> {
    handler: Arc<H>,
    registry: Arc<ConnectionRegistry>,
    conn: Arc<ConnectionContext>,
}

impl<H: Handler> Worker<H> {
    async fn run(self, packet: Packet) {
        let conn_id = self.conn.id;
        let id = packet.correlation_id;

        // Exit is terminal: acknowledge and never hand it to the application.
        if packet.is_exit {
            self.send(&Packet::exit_ack(id)).await;
            self.registry.request_exit(conn_id).await;
            self.conn.exit.notify_one();
            debug!(conn_id, correlation_id = %id, "exit acknowledged");
            return;
        }

        match self.respond(&packet).await {
            Ok(reply) => self.send(&reply).await,
            Err(e) => error!(conn_id, correlation_id = %id, error = %e, "could not build response"),
        }
    }

    /// Run the handler and wrap its outcome in a packet carrying the request's id.
    async fn respond(&self, packet: &Packet) -> TandemResult<Packet> {
        let conn_id = self.conn.id;
        let id = packet.correlation_id;

        let outcome = match packet.decode_payload::<H::Request>() {
            Ok(request) => {
                let call = self.handler.handle(conn_id, request);
                match AssertUnwindSafe(call).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        error!(conn_id, correlation_id = %id, "request handler panicked");
                        Err(ServiceError::internal("request handler panicked"))
                    }
                }
            }
            Err(e) => Err(ServiceError::bad_request(e.to_string())),
        };

        match outcome {
            Ok(response) => match encode_payload(&response) {
                Ok(payload) => Ok(Packet::response(id, payload)),
                Err(e) => {
                    warn!(conn_id, correlation_id = %id, error = %e, "response encoding failed");
                    Packet::error(id, &ServiceError::internal(e.to_string()))
                }
            },
            Err(err) => {
                warn!(conn_id, correlation_id = %id, error = %err, "request failed");
                Packet::error(id, &err)
            }
        }
    }

    async fn send(&self, packet: &Packet) {
        let mut writer = self.conn.writer.lock().await;
        if let Err(e) = write_packet(&mut *writer, packet).await {
            debug!(
                conn_id = self.conn.id,
                correlation_id = %packet.correlation_id,
                error = %e,
                "response not delivered"
            );
        }
    }
}

fn reap_finished(conn_id: ConnectionId, workers: &mut JoinSet<()>) {
    while let Some(result) = workers.try_join_next() {
        log_worker_exit(conn_id, result);
    }
}

fn log_worker_exit(conn_id: ConnectionId, result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(conn_id, error = %e, "worker panicked");
        }
    }
}
