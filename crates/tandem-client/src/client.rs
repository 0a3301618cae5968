//! The tandem client multiplexer.
//!
//! `TandemClient` owns one TCP connection. Any number of tasks may call
//! [`TandemClient::ask`] concurrently; each request gets a fresh correlation
//! id and a one-shot promise, and a single background reader routes every
//! arriving packet to the promise waiting for its id.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use tandem_core::packet::encode_payload;
use tandem_core::{read_packet, write_packet, CorrelationId, Packet, ServiceError, TandemError, TandemResult};

use crate::firewall::Firewall;

/// Waiters keyed by correlation id. Each sender is a single-use promise.
type PendingTable = Arc<Mutex<HashMap<CorrelationId, oneshot::Sender<TandemResult<Packet>>>>>;

/// Configuration for a client connection.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Admission gate consulted before every request and before `close`.
    pub firewall: Arc<Firewall>,
    /// Deadline for a single request (`None` = wait forever).
    pub request_timeout: Option<Duration>,
    /// Deadline for establishing the TCP connection.
    pub connect_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            firewall: Arc::new(Firewall::default()),
            request_timeout: Some(Duration::from_secs(30)),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// A multiplexed request/response connection to a tandem server.
pub struct TandemClient {
    /// Write half, shared by all callers.
    writer: Mutex<OwnedWriteHalf>,
    /// Outstanding requests.
    pending: PendingTable,
    /// The reader task; taken by `close`.
    reader_handle: Mutex<Option<JoinHandle<()>>>,
    /// Cleared by the reader when the transport fails or the exit ack arrives.
    connected: Arc<AtomicBool>,
    /// Set once `close` has started.
    closing: AtomicBool,
    peer_addr: SocketAddr,
    config: ClientConfig,
}

impl TandemClient {
    /// Connect directly to a server.
    pub async fn connect<A: ToSocketAddrs>(addr: A, config: ClientConfig) -> TandemResult<Self> {
        let stream = time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TandemError::Timeout)??;
        Self::from_stream(stream, config)
    }

    /// Connect through a relay proxy, asking it to forward to `target_port`.
    ///
    /// The firewall then sees the proxy's port as the remote port.
    pub async fn connect_via_proxy<A: ToSocketAddrs>(
        proxy_addr: A,
        target_port: u16,
        config: ClientConfig,
    ) -> TandemResult<Self> {
        let mut stream = time::timeout(config.connect_timeout, TcpStream::connect(proxy_addr))
            .await
            .map_err(|_| TandemError::Timeout)??;
        stream
            .write_all(format!("{target_port}\n").as_bytes())
            .await?;
        Self::from_stream(stream, config)
    }

    fn from_stream(stream: TcpStream, config: ClientConfig) -> TandemResult<Self> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();

        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        let reader_handle = {
            let pending = pending.clone();
            let connected = connected.clone();
            tokio::spawn(async move {
                Self::read_loop(read_half, pending, connected, peer_addr).await;
            })
        };

        info!(peer = %peer_addr, "connected");

        Ok(Self {
            writer: Mutex::new(write_half),
            pending,
            reader_handle: Mutex::new(Some(reader_handle)),
            connected,
            closing: AtomicBool::new(false),
            peer_addr,
            config,
        })
    }

    /// Address of the server (or proxy) this client talks to.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// The port the firewall is checked against.
    pub fn remote_port(&self) -> u16 {
        self.peer_addr.port()
    }

    /// Whether the connection is still usable.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.closing.load(Ordering::Acquire)
    }

    /// Number of requests still waiting for an answer.
    pub async fn pending_requests(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Send a request and wait for its response.
    ///
    /// # Errors
    ///
    /// - [`TandemError::PacketDropped`] if the firewall rejects the remote port;
    ///   nothing is sent.
    /// - [`TandemError::Service`] with the handler's failure if the server
    ///   answered with an error packet.
    /// - [`TandemError::Timeout`] if `request_timeout` elapsed.
    /// - [`TandemError::ConnectionClosed`] if the client was closed or the
    ///   connection failed before the answer arrived.
    pub async fn ask<Req, Resp>(&self, request: &Req) -> TandemResult<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.config.firewall.admit(self.remote_port())?;
        if !self.is_connected() {
            return Err(TandemError::ConnectionClosed);
        }

        let packet = Packet::request(encode_payload(request)?);
        let reply = self.round_trip(packet).await?;

        if reply.is_error {
            let error: ServiceError = reply.decode_payload()?;
            return Err(TandemError::Service(error));
        }
        reply.decode_payload()
    }

    /// Perform the exit handshake and release the connection.
    ///
    /// Sends an exit packet, waits for the server's acknowledgment, joins the
    /// reader and shuts the socket down. Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// [`TandemError::PacketDropped`] if the firewall rejects the remote port
    /// (the connection is left untouched), otherwise any failure of the
    /// handshake itself. The socket is shut down either way.
    pub async fn close(&self) -> TandemResult<()> {
        self.config.firewall.admit(self.remote_port())?;
        if self.closing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let ack = if self.connected.load(Ordering::Acquire) {
            self.round_trip(Packet::exit()).await.map(|_| ())
        } else {
            Err(TandemError::ConnectionClosed)
        };

        if let Some(handle) = self.reader_handle.lock().await.take() {
            if ack.is_ok() {
                let _ = handle.await;
            } else {
                handle.abort();
            }
        }

        if let Err(e) = self.writer.lock().await.shutdown().await {
            debug!(peer = %self.peer_addr, error = %e, "socket shutdown failed");
        }
        self.connected.store(false, Ordering::Release);
        info!(peer = %self.peer_addr, "connection closed");

        ack
    }

    // ── Internal ─────────────────────────────────────────────────────

    /// Register a promise, send the packet, and wait for the matching reply.
    async fn round_trip(&self, packet: Packet) -> TandemResult<Packet> {
        let id = packet.correlation_id;
        let (tx, rx) = oneshot::channel();

        // Registered before the bytes leave so a fast reply always finds its waiter.
        {
            let mut pending = self.pending.lock().await;
            // The reader drains the table under this lock after clearing
            // `connected`; an entry added once it is clear would never be failed.
            if !self.connected.load(Ordering::Acquire) {
                return Err(TandemError::ConnectionClosed);
            }
            pending.insert(id, tx);
        }

        let sent = {
            let mut writer = self.writer.lock().await;
            write_packet(&mut *writer, &packet).await
        };
        if let Err(e) = sent {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let outcome = match self.config.request_timeout {
            Some(limit) => match time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.lock().await.remove(&id);
                    warn!(correlation_id = %id, "request timed out");
                    return Err(TandemError::Timeout);
                }
            },
            None => rx.await,
        };

        outcome.map_err(|_| TandemError::ConnectionClosed)?
    }

    /// The single reader: routes arriving packets to their promises.
    async fn read_loop(
        mut reader: OwnedReadHalf,
        pending: PendingTable,
        connected: Arc<AtomicBool>,
        peer: SocketAddr,
    ) {
        loop {
            match read_packet(&mut reader).await {
                Ok(packet) => {
                    let id = packet.correlation_id;
                    let is_exit = packet.is_exit;
                    let waiter = pending.lock().await.remove(&id);
                    match waiter {
                        Some(tx) => {
                            if tx.send(Ok(packet)).is_err() {
                                debug!(correlation_id = %id, "waiter went away before delivery");
                            }
                            if is_exit {
                                debug!(peer = %peer, "exit acknowledged, reader stopping");
                                break;
                            }
                        }
                        None => {
                            warn!(correlation_id = %id, "unexpected packet (request may have been abandoned)");
                        }
                    }
                }
                Err(TandemError::TransportClosed) => {
                    debug!(peer = %peer, "server closed the connection");
                    break;
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "connection failed");
                    break;
                }
            }
        }

        connected.store(false, Ordering::Release);

        // Nobody else will answer these.
        let mut pending = pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(TandemError::ConnectionClosed));
        }
    }
}

impl Drop for TandemClient {
    fn drop(&mut self) {
        if let Some(h) = self.reader_handle.get_mut().take() {
            h.abort();
        }
    }
}
