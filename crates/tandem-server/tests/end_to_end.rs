//! Client ↔ dispatcher round trips over real loopback sockets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use tandem_client::{ClientConfig, Firewall, FirewallMode, MediaClient, MessengerClient, TandemClient};
use tandem_core::{ServiceError, TandemError};
use tandem_server::services::{MediaConfig, MediaService, MessengerConfig, MessengerService};
use tandem_server::{ConnectionId, ConnectionRegistry, Dispatcher, DispatcherConfig, Handler};

#[derive(Debug, Serialize, Deserialize)]
enum Call {
    Delayed { tag: u32, delay_ms: u64 },
    Fail { kind: String, message: String },
    Panic,
}

/// Test handler; clones share the call counter.
#[derive(Clone, Default)]
struct CountingHandler {
    calls: Arc<AtomicUsize>,
}

impl CountingHandler {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Handler for CountingHandler {
    type Request = Call;
    type Response = u32;

    async fn handle(&self, _conn: ConnectionId, call: Call) -> Result<u32, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match call {
            Call::Delayed { tag, delay_ms } => {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(tag)
            }
            Call::Fail { kind, message } => Err(ServiceError::new(kind, message)),
            Call::Panic => panic!("handler exploded"),
        }
    }
}

async fn serve<H: Handler>(handler: H) -> (std::net::SocketAddr, Arc<ConnectionRegistry>) {
    let dispatcher = Dispatcher::new(handler, DispatcherConfig::default());
    let registry = dispatcher.registry().clone();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(dispatcher.serve(listener));
    (addr, registry)
}

async fn wait_for_count(registry: &ConnectionRegistry, expected: usize) {
    for _ in 0..200 {
        if registry.count().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("registry never reached {expected} connections");
}

#[tokio::test]
async fn concurrent_asks_get_their_own_answers() {
    let handler = CountingHandler::default();
    let (addr, _) = serve(handler.clone()).await;
    let client = Arc::new(TandemClient::connect(addr, ClientConfig::default()).await.unwrap());

    // Distinct delays in shuffled order force out-of-order completion.
    let mut delays: Vec<u64> = (0..32).map(|i| i * 7).collect();
    delays.shuffle(&mut rand::thread_rng());

    let mut tasks = Vec::new();
    for (tag, delay_ms) in delays.into_iter().enumerate() {
        let client = client.clone();
        let tag = tag as u32;
        tasks.push(tokio::spawn(async move {
            let got: u32 = client.ask(&Call::Delayed { tag, delay_ms }).await.unwrap();
            assert_eq!(got, tag);
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    assert_eq!(handler.calls(), 32);
    assert_eq!(client.pending_requests().await, 0);
    client.close().await.unwrap();
}

#[tokio::test]
async fn handler_failure_reaches_caller_unchanged() {
    let (addr, _) = serve(CountingHandler::default()).await;
    let client = TandemClient::connect(addr, ClientConfig::default()).await.unwrap();

    let result: Result<u32, _> = client
        .ask(&Call::Fail {
            kind: "QuotaExceeded".into(),
            message: "too many widgets".into(),
        })
        .await;
    match result {
        Err(TandemError::Service(err)) => {
            assert_eq!(err, ServiceError::new("QuotaExceeded", "too many widgets"));
        }
        other => panic!("expected service error, got {other:?}"),
    }

    // The connection survives a failed request.
    let tag: u32 = client.ask(&Call::Delayed { tag: 5, delay_ms: 0 }).await.unwrap();
    assert_eq!(tag, 5);
    client.close().await.unwrap();
}

#[tokio::test]
async fn panicking_handler_fails_one_request_only() {
    let (addr, _) = serve(CountingHandler::default()).await;
    let client = Arc::new(TandemClient::connect(addr, ClientConfig::default()).await.unwrap());

    let slow = {
        let client = client.clone();
        tokio::spawn(async move { client.ask::<_, u32>(&Call::Delayed { tag: 1, delay_ms: 100 }).await })
    };
    let err = client.ask::<_, u32>(&Call::Panic).await.unwrap_err();
    assert!(matches!(err, TandemError::Service(ref e) if e.kind == "Internal"), "{err:?}");
    assert_eq!(slow.await.unwrap().unwrap(), 1);
    client.close().await.unwrap();
}

#[tokio::test]
async fn close_performs_exit_handshake_and_unregisters() {
    let handler = CountingHandler::default();
    let (addr, registry) = serve(handler.clone()).await;

    let client = TandemClient::connect(addr, ClientConfig::default()).await.unwrap();
    wait_for_count(&registry, 1).await;

    client.close().await.unwrap();
    assert!(!client.is_connected());
    wait_for_count(&registry, 0).await;

    // Exit never reaches the application handler.
    assert_eq!(handler.calls(), 0);

    // Closing twice is harmless; asking afterwards is not.
    client.close().await.unwrap();
    let err = client.ask::<_, u32>(&Call::Delayed { tag: 0, delay_ms: 0 }).await.unwrap_err();
    assert!(matches!(err, TandemError::ConnectionClosed));
}

#[tokio::test]
async fn firewall_blocks_before_anything_is_sent() {
    let handler = CountingHandler::default();
    let (addr, registry) = serve(handler.clone()).await;

    let firewall = Arc::new(Firewall::new(FirewallMode::WhiteList));
    let config = ClientConfig {
        firewall: firewall.clone(),
        ..ClientConfig::default()
    };
    let client = TandemClient::connect(addr, config).await.unwrap();

    let err = client.ask::<_, u32>(&Call::Delayed { tag: 1, delay_ms: 0 }).await.unwrap_err();
    assert!(matches!(err, TandemError::PacketDropped { port } if port == addr.port()));
    assert!(matches!(client.close().await, Err(TandemError::PacketDropped { .. })));
    assert_eq!(client.pending_requests().await, 0);
    assert_eq!(handler.calls(), 0);
    wait_for_count(&registry, 1).await;

    firewall.open(addr.port());
    let tag: u32 = client.ask(&Call::Delayed { tag: 9, delay_ms: 0 }).await.unwrap();
    assert_eq!(tag, 9);
    client.close().await.unwrap();
    wait_for_count(&registry, 0).await;
}

#[tokio::test]
async fn media_stream_to_end_and_close() {
    let dir = tempfile::tempdir().unwrap();
    let clip: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(dir.path().join("clip.mp4"), &clip).unwrap();
    std::fs::write(dir.path().join("readme.txt"), b"not media").unwrap();

    let service = MediaService::new(MediaConfig {
        root_dir: dir.path().to_path_buf(),
        frame_rate: 24.0,
        frame_size: 4096,
        prefetch: 4,
    })
    .unwrap();
    let (addr, _) = serve(service).await;

    let client = Arc::new(TandemClient::connect(addr, ClientConfig::default()).await.unwrap());
    let media = MediaClient::new(client.clone());

    assert_eq!(media.list_media().await.unwrap(), vec!["clip.mp4".to_string()]);

    let stream = media.start_stream("clip.mp4").await.unwrap();
    assert_eq!(stream.frame_rate, 24.0);

    let mut received = Vec::new();
    let mut frames = 0;
    while let Some(frame) = media.next_frame(&stream.stream_id).await.unwrap() {
        assert!(!frame.is_empty());
        received.extend_from_slice(&frame);
        frames += 1;
    }
    assert_eq!(frames, 3);
    assert_eq!(received, clip);

    media.close_stream(&stream.stream_id).await.unwrap();
    match media.next_frame(&stream.stream_id).await {
        Err(TandemError::Service(err)) => {
            assert_eq!(err.kind, "StreamingError");
            assert_eq!(err.message, format!("stream {} not found", stream.stream_id));
        }
        other => panic!("expected StreamingError, got {other:?}"),
    }

    match media.start_stream("missing.mp4").await {
        Err(TandemError::Service(err)) => assert_eq!(err.message, "file missing.mp4 does not exist"),
        other => panic!("expected StreamingError, got {other:?}"),
    }
    client.close().await.unwrap();
}

#[tokio::test]
async fn messenger_conversation() {
    let (addr, registry) = serve(MessengerService::with_config(MessengerConfig { hash_cost: 4 })).await;

    let ann = MessengerClient::new(Arc::new(TandemClient::connect(addr, ClientConfig::default()).await.unwrap()));
    let bob = MessengerClient::new(Arc::new(TandemClient::connect(addr, ClientConfig::default()).await.unwrap()));

    assert!(ann.is_username_available("ann").await.unwrap());
    ann.sign_up("ann", "hunter2").await.unwrap();
    bob.sign_up("bob", "swordfish").await.unwrap();
    assert!(!bob.is_username_available("ann").await.unwrap());

    match ann.login("ann", "wrong").await {
        Err(TandemError::Service(err)) => assert_eq!(err.message, "invalid password"),
        other => panic!("expected login failure, got {other:?}"),
    }
    ann.login("ann", "hunter2").await.unwrap();
    bob.login("bob", "swordfish").await.unwrap();

    ann.send_message("bob", "lunch?").await.unwrap();
    ann.send_message("bob", "noon works").await.unwrap();

    let inbox = bob.inbox().await.unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].user, "ann");
    assert_eq!(inbox[0].unread_count, 2);

    let messages = bob.read_messages("ann", 10).await.unwrap();
    let texts: Vec<_> = messages.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, ["lunch?", "noon works"]);
    assert!(messages.iter().all(|m| m.seen && m.sender == "ann"));
    assert_eq!(bob.inbox().await.unwrap()[0].unread_count, 0);

    bob.logout().await.unwrap();
    assert!(matches!(bob.inbox().await, Err(TandemError::Service(_))));

    ann.client().close().await.unwrap();
    bob.client().close().await.unwrap();
    wait_for_count(&registry, 0).await;
}

#[tokio::test]
async fn server_keeps_serving_after_client_vanishes() {
    let (addr, registry) = serve(CountingHandler::default()).await;

    {
        let client = TandemClient::connect(addr, ClientConfig::default()).await.unwrap();
        let _: u32 = client.ask(&Call::Delayed { tag: 1, delay_ms: 0 }).await.unwrap();
        // Dropped without the exit handshake.
    }
    wait_for_count(&registry, 0).await;

    let client = TandemClient::connect(addr, ClientConfig::default()).await.unwrap();
    let tag: u32 = client.ask(&Call::Delayed { tag: 2, delay_ms: 0 }).await.unwrap();
    assert_eq!(tag, 2);
    client.close().await.unwrap();
}
