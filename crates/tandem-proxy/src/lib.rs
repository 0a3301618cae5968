//! tandem-proxy: a byte-transparent TCP relay.
//!
//! A client opens a connection and sends one line holding a decimal port
//! number. The proxy connects to that port on its upstream host and from then
//! on copies bytes in both directions without looking at them.
//!
//! ```text
//! client ──"8080\n"──▶ proxy ──connect──▶ upstream:8080
//! client ◀═══════════ raw bytes ═══════════▶ upstream
//! ```
//!
//! End of stream from the client closes the upstream connection and ends the
//! relay. The upstream finishing does not close the client; the relay keeps
//! forwarding client bytes until the client is done too.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tracing::{debug, info, warn};

use tandem_core::{TandemError, TandemResult};

const RELAY_BUFFER: usize = 8192;

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Host every target port is resolved against.
    pub upstream_host: String,
    /// Concurrent client connections; further clients are refused.
    pub max_connections: usize,
    /// Longest accepted port line, newline excluded.
    pub max_line_len: usize,
    /// How long a new client may take to send its port line.
    pub port_line_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_host: "127.0.0.1".to_string(),
            max_connections: 64,
            max_line_len: 32,
            port_line_timeout: Duration::from_secs(10),
        }
    }
}

/// Accepts clients and relays each one to the port it asks for.
#[derive(Clone)]
pub struct RelayProxy {
    config: Arc<ProxyConfig>,
    active: Arc<AtomicUsize>,
}

impl RelayProxy {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            config: Arc::new(config),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of clients currently being relayed.
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Bind `0.0.0.0:port` and relay forever.
    pub async fn listen(self, port: u16) -> TandemResult<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        self.serve(listener).await
    }

    /// Accept clients from `listener` forever.
    pub async fn serve(self, listener: TcpListener) -> TandemResult<()> {
        info!(addr = %listener.local_addr()?, upstream = %self.config.upstream_host, "proxy listening");

        loop {
            let (client, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };

            let Some(guard) = self.try_acquire() else {
                warn!(
                    peer = %peer,
                    max = self.config.max_connections,
                    "connection limit reached, refusing client"
                );
                drop(client);
                continue;
            };

            info!(peer = %peer, "accepted connection");
            let config = self.config.clone();
            tokio::spawn(async move {
                let _guard = guard;
                if let Err(e) = relay_client(&config, client, peer).await {
                    warn!(peer = %peer, error = %e, "relay failed");
                }
                debug!(peer = %peer, "relay ended");
            });
        }
    }

    /// Take a connection slot if one is free.
    fn try_acquire(&self) -> Option<ConnectionGuard> {
        let max = self.config.max_connections;
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| ConnectionGuard {
                counter: self.active.clone(),
            })
    }
}

/// Releases a connection slot on drop.
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Serve one client: read its port line, connect upstream, pump both ways.
async fn relay_client(config: &ProxyConfig, mut client: TcpStream, peer: SocketAddr) -> TandemResult<()> {
    let (port, buffered) =
        time::timeout(config.port_line_timeout, read_target_port(&mut client, config.max_line_len))
            .await
            .map_err(|_| TandemError::Timeout)??;

    info!(peer = %peer, port, "connecting upstream");
    let upstream = TcpStream::connect((config.upstream_host.as_str(), port)).await?;
    let _ = client.set_nodelay(true);
    let _ = upstream.set_nodelay(true);

    let (mut client_rx, mut client_tx) = client.into_split();
    let (mut upstream_rx, mut upstream_tx) = upstream.into_split();

    // Bytes that arrived in the same read as the port line belong upstream.
    if !buffered.is_empty() {
        upstream_tx.write_all(&buffered).await?;
    }

    // The client leg decides when the relay ends; the upstream leg may finish
    // first without closing the client.
    let (up, down) = {
        let to_upstream = pump(&mut client_rx, &mut upstream_tx);
        let to_client = pump(&mut upstream_rx, &mut client_tx);
        tokio::pin!(to_upstream, to_client);

        let mut down = None;
        let up = loop {
            tokio::select! {
                up = &mut to_upstream => break up,
                result = &mut to_client, if down.is_none() => down = Some(result),
            }
        };
        (up, down)
    };

    match (&up, &down) {
        (Ok(sent), Some(Ok(received))) => {
            debug!(peer = %peer, port, sent = sent + buffered.len() as u64, received, "connection closed");
        }
        (Ok(sent), None) => {
            debug!(peer = %peer, port, sent = sent + buffered.len() as u64, "client left, closing upstream");
        }
        _ => {
            if let Err(e) = &up {
                debug!(peer = %peer, error = %e, "client→upstream leg failed");
            }
            if let Some(Err(e)) = &down {
                debug!(peer = %peer, error = %e, "upstream→client leg failed");
            }
        }
    }

    if let Err(e) = upstream_tx.shutdown().await {
        debug!(peer = %peer, error = %e, "upstream shutdown failed");
    }
    // Both upstream halves drop here, closing the connection.
    Ok(())
}

/// Copy `src` into `dst` until end of stream. Returns the byte count.
async fn pump<R, W>(src: &mut R, dst: &mut W) -> TandemResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];
    let mut total = 0u64;
    loop {
        let n = src.read(&mut buf).await?;
        if n == 0 {
            return Ok(total);
        }
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

/// Read the newline-terminated port line.
///
/// Returns the port and whatever bytes followed the newline in the same reads.
pub async fn read_target_port<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_line_len: usize,
) -> TandemResult<(u16, Vec<u8>)> {
    let mut buf = Vec::with_capacity(max_line_len + 1);
    let mut chunk = [0u8; 64];

    loop {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            if pos > max_line_len {
                return Err(line_too_long(max_line_len));
            }
            let rest = buf.split_off(pos + 1);
            let port = parse_port(&buf[..pos])?;
            return Ok((port, rest));
        }
        if buf.len() > max_line_len {
            return Err(line_too_long(max_line_len));
        }

        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Err(TandemError::TransportClosed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn parse_port(line: &[u8]) -> TandemResult<u16> {
    let text = std::str::from_utf8(line)
        .map_err(|_| TandemError::Other("port line is not valid UTF-8".into()))?
        .trim();
    match text.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(TandemError::Other(format!("invalid target port {text:?}"))),
    }
}

fn line_too_long(max: usize) -> TandemError {
    TandemError::Other(format!("port line longer than {max} bytes"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn port_line_with_whitespace() {
        let mut reader: &[u8] = b"  8081 \r\n";
        let (port, rest) = read_target_port(&mut reader, 32).await.unwrap();
        assert_eq!(port, 8081);
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn bytes_after_newline_are_returned() {
        let mut reader: &[u8] = b"9000\n0000000042hello";
        let (port, rest) = read_target_port(&mut reader, 32).await.unwrap();
        assert_eq!(port, 9000);
        assert_eq!(rest, b"0000000042hello");
    }

    #[tokio::test]
    async fn rejects_non_numeric_and_zero() {
        for line in [&b"http\n"[..], b"0\n", b"70000\n", b"\n"] {
            let mut reader = line;
            assert!(read_target_port(&mut reader, 32).await.is_err(), "{line:?}");
        }
    }

    #[tokio::test]
    async fn rejects_overlong_line() {
        let long = vec![b'1'; 100];
        let mut reader = &long[..];
        match read_target_port(&mut reader, 32).await {
            Err(TandemError::Other(msg)) => assert!(msg.contains("longer than 32")),
            other => panic!("expected overlong error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn eof_before_newline_is_transport_closed() {
        let mut reader: &[u8] = b"80";
        assert!(matches!(
            read_target_port(&mut reader, 32).await,
            Err(TandemError::TransportClosed)
        ));
    }

    #[test]
    fn guard_releases_slot() {
        let proxy = RelayProxy::new(ProxyConfig {
            max_connections: 2,
            ..ProxyConfig::default()
        });
        let a = proxy.try_acquire().unwrap();
        let _b = proxy.try_acquire().unwrap();
        assert!(proxy.try_acquire().is_none());
        assert_eq!(proxy.active_connections(), 2);
        drop(a);
        assert_eq!(proxy.active_connections(), 1);
        assert!(proxy.try_acquire().is_some());
    }
}
