//! End-to-end tests over real WebSocket connections with in-memory backends.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{EncodingKey, Header};
use switchboard_core::{
    BackendError, BusSubscription, IngestionQueue, MemoryBus, MemoryDirectory, MemoryQueue,
    NodeContext, NodeId, QueueConsumer, RelayBus,
};
use switchboard_protocol::{codec, Envelope, MessageKind};
use switchboard_server::{backends, serve, Config};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const SECRET: &str = "integration-secret";
const WAIT: Duration = Duration::from_secs(3);

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    ctx: Arc<NodeContext>,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    async fn start(config: Config) -> Self {
        let ctx = backends::build_context(&config, NodeId::new("n1"))
            .await
            .unwrap();
        Self::start_with(config, ctx).await
    }

    async fn start_with(mut config: Config, ctx: Arc<NodeContext>) -> Self {
        config.auth.secret = SECRET.to_string();
        config.metrics.enabled = false;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (stop, stopped) = oneshot::channel::<()>();
        let task = tokio::spawn(serve(listener, config, ctx.clone(), async move {
            let _ = stopped.await;
        }));

        Self {
            addr,
            ctx,
            stop: Some(stop),
            task,
        }
    }

    fn url(&self, token: Option<&str>) -> String {
        match token {
            Some(t) => format!("ws://{}/ws/chat?token={}&userId=ignored", self.addr, t.replace(' ', "%20")),
            None => format!("ws://{}/ws/chat", self.addr),
        }
    }

    async fn connect(&self, user: &str) -> Client {
        let (client, _) = connect_async(self.url(Some(&token(user)))).await.unwrap();
        self.wait_for(|ctx| ctx.sessions().contains(user)).await;
        client
    }

    async fn wait_for(&self, condition: impl Fn(&NodeContext) -> bool) {
        tokio::time::timeout(WAIT, async {
            while !condition(&self.ctx) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        tokio::time::timeout(WAIT, &mut self.task)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
    }
}

fn token(sub: &str) -> String {
    let claims = serde_json::json!({
        "sub": sub,
        "exp": jsonwebtoken::get_current_timestamp() + 3600,
    });
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

/// A stream that has already ended, as after a broker connection drop.
struct EndedStream;

#[async_trait]
impl BusSubscription for EndedStream {
    async fn next(&mut self) -> Result<Option<Envelope>, BackendError> {
        Ok(None)
    }
}

#[async_trait]
impl QueueConsumer for EndedStream {
    async fn next(&mut self) -> Result<Option<Envelope>, BackendError> {
        Ok(None)
    }
}

/// Memory backends whose first stream ends immediately.
#[derive(Default)]
struct DroppingBackends {
    bus: MemoryBus,
    queue: MemoryQueue,
    subscribes: AtomicUsize,
    consumers: AtomicUsize,
}

#[async_trait]
impl RelayBus for DroppingBackends {
    async fn publish(&self, envelope: &Envelope) -> Result<(), BackendError> {
        self.bus.publish(envelope).await
    }

    async fn subscribe(&self) -> Result<Box<dyn BusSubscription>, BackendError> {
        if self.subscribes.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(Box::new(EndedStream));
        }
        self.bus.subscribe().await
    }
}

#[async_trait]
impl IngestionQueue for DroppingBackends {
    async fn publish(&self, envelope: &Envelope) -> Result<(), BackendError> {
        self.queue.publish(envelope).await
    }

    async fn consumer(&self) -> Result<Box<dyn QueueConsumer>, BackendError> {
        if self.consumers.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(Box::new(EndedStream));
        }
        self.queue.consumer().await
    }
}

fn status_of(result: Result<(Client, impl Sized), WsError>) -> u16 {
    match result {
        Err(WsError::Http(response)) => response.status().as_u16(),
        Err(e) => panic!("unexpected error: {e}"),
        Ok(_) => panic!("handshake unexpectedly succeeded"),
    }
}

async fn next_text(client: &mut Client) -> String {
    tokio::time::timeout(WAIT, async {
        loop {
            match client.next().await {
                Some(Ok(Message::Text(text))) => return text,
                Some(Ok(_)) => continue,
                other => panic!("connection ended: {other:?}"),
            }
        }
    })
    .await
    .expect("no message in time")
}

#[tokio::test]
async fn handshake_without_token_is_unauthorized() {
    let server = TestServer::start(Config::default()).await;

    assert_eq!(status_of(connect_async(server.url(None)).await), 401);
    assert_eq!(status_of(connect_async(server.url(Some("  "))).await), 401);
    assert_eq!(status_of(connect_async(server.url(Some("not-a-jwt"))).await), 401);
    assert!(server.ctx.sessions().is_empty());

    server.shutdown().await;
}

#[tokio::test]
async fn disallowed_origin_is_forbidden() {
    let mut config = Config::default();
    config.transport.allowed_origins = vec!["https://chat.example".to_string()];
    let server = TestServer::start(config).await;

    let mut request = server.url(Some(&token("alice"))).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("origin", HeaderValue::from_static("https://evil.example"));
    assert_eq!(status_of(connect_async(request).await), 403);

    let mut request = server.url(Some(&token("alice"))).into_client_request().unwrap();
    request
        .headers_mut()
        .insert("origin", HeaderValue::from_static("https://chat.example"));
    assert!(connect_async(request).await.is_ok());

    server.shutdown().await;
}

#[tokio::test]
async fn connection_limit_returns_503() {
    let mut config = Config::default();
    config.limits.max_connections = 1;
    let server = TestServer::start(config).await;

    let _alice = server.connect("alice").await;
    assert_eq!(
        status_of(connect_async(server.url(Some(&token("bob")))).await),
        503
    );

    server.shutdown().await;
}

#[tokio::test]
async fn message_reaches_recipient_with_receiver_renamed() {
    let server = TestServer::start(Config::default()).await;
    let mut alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;

    assert!(server.ctx.is_owned_by_this_node("alice").await.unwrap());
    assert!(server.ctx.is_owned_by_this_node("bob").await.unwrap());

    alice
        .send(Message::Text(
            r#"{"content":"hi bob","senderId":"alice","senderName":"Alice","targetUserId":"bob","timestamp":"2024-01-01T10:00:00"}"#
                .to_string(),
        ))
        .await
        .unwrap();

    let text = next_text(&mut bob).await;
    let envelope = codec::decode(text.as_bytes()).unwrap();
    assert_eq!(envelope.content.as_deref(), Some("hi bob"));
    assert_eq!(envelope.sender_id.as_deref(), Some("alice"));
    assert_eq!(envelope.sender_name.as_deref(), Some("Alice"));
    assert_eq!(envelope.receiver_id.as_deref(), Some("bob"));
    assert_eq!(envelope.timestamp.as_deref(), Some("2024-01-01T10:00:00"));
    assert_eq!(envelope.kind, MessageKind::Text);

    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert!(json.get("targetUserId").is_none());
    assert_eq!(json["type"], "text");

    server.shutdown().await;
}

#[tokio::test]
async fn malformed_and_oversized_frames_keep_connection_open() {
    let mut config = Config::default();
    config.limits.max_message_size = 256;
    let server = TestServer::start(config).await;
    let mut alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;

    alice.send(Message::Text("{not json".to_string())).await.unwrap();
    alice.send(Message::Text("x".repeat(1024))).await.unwrap();
    alice.send(Message::Binary(vec![0xff, 0xfe])).await.unwrap();
    server.wait_for(|ctx| ctx.stats().snapshot().malformed >= 2).await;

    alice
        .send(Message::Binary(
            br#"{"content":"still here","targetUserId":"bob"}"#.to_vec(),
        ))
        .await
        .unwrap();
    let envelope = codec::decode(next_text(&mut bob).await.as_bytes()).unwrap();
    assert_eq!(envelope.content.as_deref(), Some("still here"));
    assert!(server.ctx.sessions().contains("alice"));

    server.shutdown().await;
}

#[tokio::test]
async fn close_clears_session_and_presence() {
    let server = TestServer::start(Config::default()).await;
    let mut alice = server.connect("alice").await;

    alice.close(None).await.unwrap();
    server.wait_for(|ctx| !ctx.sessions().contains("alice")).await;
    assert!(!server.ctx.is_owned_by_this_node("alice").await.unwrap());

    server.shutdown().await;
}

#[tokio::test]
async fn idle_connection_is_closed_by_heartbeat() {
    let mut config = Config::default();
    config.heartbeat.interval_ms = 50;
    config.heartbeat.timeout_ms = 150;
    let server = TestServer::start(config).await;

    // Never polled, so the client answers no pings.
    let _alice = server.connect("alice").await;
    server.wait_for(|ctx| ctx.sessions().is_empty()).await;

    server.shutdown().await;
}

#[tokio::test]
async fn shutdown_runs_disconnect_for_open_connections() {
    let server = TestServer::start(Config::default()).await;
    let _alice = server.connect("alice").await;
    let _bob = server.connect("bob").await;
    let ctx = server.ctx.clone();

    server.shutdown().await;

    assert!(ctx.sessions().is_empty());
    assert!(!ctx.is_owned_by_this_node("alice").await.unwrap());
    assert!(!ctx.is_owned_by_this_node("bob").await.unwrap());
}

#[tokio::test]
async fn health_reports_node_id() {
    let server = TestServer::start(Config::default()).await;

    let mut stream = TcpStream::connect(server.addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    let body = response.split("\r\n\r\n").nth(1).unwrap();
    let json: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["node"], "n1");

    server.shutdown().await;
}

#[tokio::test]
async fn ended_backend_streams_are_reopened() {
    let backends = Arc::new(DroppingBackends::default());
    let ctx = Arc::new(NodeContext::new(
        NodeId::new("n1"),
        Arc::new(MemoryDirectory::new()),
        backends.clone(),
        backends.clone(),
    ));
    let server = TestServer::start_with(Config::default(), ctx).await;

    let mut alice = server.connect("alice").await;
    let mut bob = server.connect("bob").await;
    server
        .wait_for(|_| {
            backends.subscribes.load(Ordering::SeqCst) >= 2
                && backends.consumers.load(Ordering::SeqCst) >= 2
        })
        .await;

    alice
        .send(Message::Text(
            r#"{"content":"after reconnect","targetUserId":"bob"}"#.to_string(),
        ))
        .await
        .unwrap();
    let envelope = codec::decode(next_text(&mut bob).await.as_bytes()).unwrap();
    assert_eq!(envelope.content.as_deref(), Some("after reconnect"));

    // Relayed envelopes reach the reopened subscription too.
    backends
        .bus
        .publish(&Envelope::text("alice", "relayed"))
        .await
        .unwrap();
    let envelope = codec::decode(next_text(&mut alice).await.as_bytes()).unwrap();
    assert_eq!(envelope.content.as_deref(), Some("relayed"));

    server.shutdown().await;
}

#[tokio::test]
async fn zero_heartbeat_interval_still_runs_disconnect() {
    let mut config = Config::default();
    config.heartbeat.interval_ms = 0;
    let server = TestServer::start(config).await;

    let mut alice = server.connect("alice").await;
    let _ = alice.close(None).await;
    server.wait_for(|ctx| !ctx.sessions().contains("alice")).await;
    assert!(!server.ctx.is_owned_by_this_node("alice").await.unwrap());

    // The connection task survived, so new handshakes still work.
    let _bob = server.connect("bob").await;

    server.shutdown().await;
}

#[tokio::test]
async fn repeated_token_parameter_uses_first_value() {
    let server = TestServer::start(Config::default()).await;
    let good = token("alice");

    let url = format!("ws://{}/ws/chat?token={good}&token={good}", server.addr);
    let (_alice, _) = connect_async(url).await.unwrap();
    server.wait_for(|ctx| ctx.sessions().contains("alice")).await;

    let url = format!("ws://{}/ws/chat?token=not-a-jwt&token={good}", server.addr);
    assert_eq!(status_of(connect_async(url).await), 401);

    let url = format!("ws://{}/ws/chat?token&token={good}", server.addr);
    assert_eq!(status_of(connect_async(url).await), 401);

    server.shutdown().await;
}
