use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rstest::{fixture, rstest};
use stonenet::{
    setup_local_tracing, AppError, ByteOrder, Connection, HandleFuture, Message, MessageCodec,
    Request, Router, Server, ServerConfig,
};
use stonenet::network::HEADER_LEN;
use stonenet::service::TransportMode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[fixture]
#[once]
fn log_setup() {
    let _ = setup_local_tracing();
}

struct EchoRouter;

impl Router for EchoRouter {
    fn handle<'a>(&'a self, request: &'a Request) -> HandleFuture<'a> {
        Box::pin(async move {
            request
                .connection()
                .write_msg(request.msg_id(), request.data().clone())
                .await
                .unwrap();
        })
    }
}

/// Replies once per stage it runs; "deny" is aborted in `pre_handle`.
struct StagedRouter;

impl Router for StagedRouter {
    fn pre_handle<'a>(&'a self, request: &'a Request) -> HandleFuture<'a> {
        Box::pin(async move {
            request.connection().write_msg(2, "pre").await.unwrap();
            if &request.data()[..] == b"deny" {
                request.abort();
            }
        })
    }

    fn handle<'a>(&'a self, request: &'a Request) -> HandleFuture<'a> {
        Box::pin(async move {
            request.connection().write_msg(2, "handle").await.unwrap();
        })
    }

    fn post_handle<'a>(&'a self, request: &'a Request) -> HandleFuture<'a> {
        Box::pin(async move {
            request.connection().write_msg(2, "post").await.unwrap();
        })
    }
}

fn test_config(byte_order: ByteOrder, pool_size: usize) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.network.host = "127.0.0.1".to_string();
    config.network.tcp_port = 0;
    config.network.byte_order = byte_order;
    config.network.write_timeout_ms = 1000;
    config.worker_pool.pool_size = pool_size;
    config.worker_pool.monitor_interval_ms = 100;
    config
}

async fn started_server(config: ServerConfig) -> Server {
    let mut server = Server::new(config);
    server.add_router(1, EchoRouter).unwrap();
    server.add_router(2, StagedRouter).unwrap();
    server.start().await.unwrap();
    server
}

struct Client {
    stream: TcpStream,
    codec: MessageCodec,
}

impl Client {
    async fn connect(server: &Server) -> Client {
        let stream = TcpStream::connect(server.local_addr().unwrap())
            .await
            .unwrap();
        Client {
            stream,
            codec: MessageCodec::from_config(&server.config().network),
        }
    }

    async fn send(&mut self, msg_id: u32, payload: &'static str) {
        let frame = self.codec.encode(&Message::new(msg_id, payload)).unwrap();
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn recv(&mut self) -> Option<Message> {
        let mut header = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut header).await.ok()?;
        let header = self.codec.decode(&header).unwrap();
        let mut payload = vec![0u8; header.length as usize];
        self.stream.read_exact(&mut payload).await.ok()?;
        Some(Message::new(header.id, payload))
    }

    async fn recv_within(&mut self, wait: Duration) -> Option<Message> {
        timeout(wait, self.recv()).await.ok().flatten()
    }

    /// True if the server closed its side.
    async fn closed_by_server(&mut self) -> bool {
        let mut buf = [0u8; 1];
        matches!(
            timeout(Duration::from_secs(5), self.stream.read(&mut buf)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }
}

async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[rstest]
#[tokio::test]
async fn test_ping_pong(
    _log_setup: (),
    #[values(ByteOrder::BigEndian, ByteOrder::LittleEndian)] byte_order: ByteOrder,
    #[values(0, 4)] pool_size: usize,
) {
    let mut server = started_server(test_config(byte_order, pool_size)).await;
    let mut client = Client::connect(&server).await;

    for payload in ["ping", "", "pong"] {
        client.send(1, payload).await;
        assert_eq!(client.recv().await, Some(Message::new(1, payload)));
    }
    assert_eq!(server.registry().len(), 1);

    drop(client);
    let registry = server.registry().clone();
    eventually(|| registry.is_empty()).await;
    server.stop().await;
}

#[rstest]
#[tokio::test]
async fn test_pipeline_over_tcp(_log_setup: ()) {
    let mut server = started_server(test_config(ByteOrder::BigEndian, 2)).await;
    let mut client = Client::connect(&server).await;

    for (payload, expected) in [
        ("go", vec!["pre", "handle", "post"]),
        ("deny", vec!["pre"]),
        ("go", vec!["pre", "handle", "post"]),
    ] {
        client.send(2, payload).await;
        for stage in expected {
            assert_eq!(client.recv().await, Some(Message::new(2, stage)));
        }
    }
    server.stop().await;
}

#[rstest]
#[tokio::test]
async fn test_unknown_msg_id_keeps_connection(_log_setup: ()) {
    let mut server = started_server(test_config(ByteOrder::BigEndian, 2)).await;
    let mut client = Client::connect(&server).await;

    client.send(42, "nobody home").await;
    client.send(1, "still here").await;
    assert_eq!(client.recv().await, Some(Message::new(1, "still here")));
    server.stop().await;
}

#[rstest]
#[tokio::test]
async fn test_oversized_frame_closes_connection(_log_setup: ()) {
    let mut config = test_config(ByteOrder::BigEndian, 2);
    config.network.max_packet_size = 16;
    let mut server = started_server(config).await;
    let mut client = Client::connect(&server).await;

    client.send(1, "way more than sixteen bytes").await;
    assert!(client.closed_by_server().await);
    let registry = server.registry().clone();
    eventually(|| registry.is_empty()).await;
    server.stop().await;
}

#[rstest]
#[tokio::test]
async fn test_connection_limit(_log_setup: ()) {
    let mut config = test_config(ByteOrder::BigEndian, 2);
    config.network.max_connection = 1;
    let mut server = started_server(config).await;

    let mut first = Client::connect(&server).await;
    first.send(1, "first").await;
    assert_eq!(first.recv().await, Some(Message::new(1, "first")));

    // sits in the listen backlog until the first slot frees up
    let mut second = Client::connect(&server).await;
    second.send(1, "second").await;
    assert_eq!(second.recv_within(Duration::from_millis(300)).await, None);

    drop(first);
    assert_eq!(
        second.recv_within(Duration::from_secs(5)).await,
        Some(Message::new(1, "second"))
    );
    server.stop().await;
}

#[rstest]
#[tokio::test]
async fn test_stop_closes_live_connections(_log_setup: ()) {
    let mut server = started_server(test_config(ByteOrder::BigEndian, 2)).await;
    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut client = Client::connect(&server).await;
        client.send(1, "hi").await;
        assert!(client.recv().await.is_some());
        clients.push(client);
    }
    assert_eq!(server.registry().len(), 3);

    server.stop().await;
    for client in &mut clients {
        assert!(client.closed_by_server().await);
    }
    let registry = server.registry().clone();
    eventually(|| registry.is_empty()).await;
    assert!(server.local_addr().is_none());
}

#[rstest]
#[tokio::test]
async fn test_hooks_and_connection_ids(_log_setup: ()) {
    let started = Arc::new(Mutex::new(Vec::new()));
    let stopped = Arc::new(AtomicUsize::new(0));

    let mut server = Server::new(test_config(ByteOrder::BigEndian, 2));
    server.add_router(1, EchoRouter).unwrap();
    {
        let started = started.clone();
        server.set_on_conn_start(move |connection: &Connection| {
            started.lock().push(connection.id());
        });
        let stopped = stopped.clone();
        server.set_on_conn_stop(move |_: &Connection| {
            stopped.fetch_add(1, Ordering::SeqCst);
        });
    }
    server.start().await.unwrap();

    for _ in 0..3 {
        let mut client = Client::connect(&server).await;
        client.send(1, "hi").await;
        assert!(client.recv().await.is_some());
    }
    eventually(|| stopped.load(Ordering::SeqCst) == 3).await;

    let ids: HashSet<u64> = started.lock().iter().copied().collect();
    assert_eq!(ids, HashSet::from([1, 2, 3]));
    server.stop().await;
}

#[rstest]
#[tokio::test]
async fn test_auth_hook_rejects(_log_setup: ()) {
    let mut server = Server::new(test_config(ByteOrder::BigEndian, 2));
    server.add_router(1, EchoRouter).unwrap();
    server.set_auth_hook(|_, peer| Err(AppError::Unauthenticated(peer.to_string())));
    server.start().await.unwrap();

    let mut client = Client::connect(&server).await;
    assert!(client.closed_by_server().await);
    assert!(server.registry().is_empty());
    server.stop().await;
}

#[rstest]
#[tokio::test]
async fn test_router_registration(_log_setup: ()) {
    let mut server = Server::new(test_config(ByteOrder::BigEndian, 0));
    server.add_router(1, EchoRouter).unwrap();
    assert!(matches!(
        server.add_router(1, EchoRouter),
        Err(AppError::DuplicateRouterRegistration(1))
    ));

    server.start().await.unwrap();
    assert!(matches!(
        server.add_router(3, EchoRouter),
        Err(AppError::IllegalStateError(_))
    ));
    assert!(matches!(
        server.start().await,
        Err(AppError::IllegalStateError(_))
    ));
    server.stop().await;
    // stopping twice is harmless
    server.stop().await;
}

#[rstest]
#[tokio::test]
async fn test_accepting_state_follows_lifecycle(_log_setup: ()) {
    let mut server = Server::new(test_config(ByteOrder::BigEndian, 0));
    server.add_router(1, EchoRouter).unwrap();
    assert!(!server.is_accepting());

    server.start().await.unwrap();
    assert!(server.is_accepting());
    let mut client = Client::connect(&server).await;
    client.send(1, "up").await;
    assert_eq!(client.recv().await, Some(Message::new(1, "up")));

    server.stop().await;
    assert!(!server.is_accepting());
    assert!(server.local_addr().is_none());
    assert!(client.closed_by_server().await);
}

#[rstest]
#[case(TransportMode::Websocket)]
#[case(TransportMode::Udp)]
#[tokio::test]
async fn test_unsupported_transport(_log_setup: (), #[case] mode: TransportMode) {
    let mut config = test_config(ByteOrder::BigEndian, 0);
    config.network.mode = mode;
    let mut server = Server::new(config);
    assert!(matches!(
        server.start().await,
        Err(AppError::UnsupportedTransport(_))
    ));
    assert!(server.local_addr().is_none());
}
