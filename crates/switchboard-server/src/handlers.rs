//! Connection handlers for the Switchboard server.
//!
//! This module handles the HTTP surface, the WebSocket connection lifecycle
//! and the background routing workers.

use crate::auth::Authenticator;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::{
    BusSubscription, ConnectionGateway, IngestError, NodeContext, QueueConsumer, Router as MessageRouter,
    SessionHandle,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for open connections to finish their disconnect.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// First delay before reopening an ended relay or queue stream.
const RECONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound on the reopen delay.
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(30);

/// A stream that lived this long resets the backoff.
const STABLE_STREAM: Duration = Duration::from_secs(10);

/// Shared server state.
pub struct AppState {
    /// Local connection bookkeeping.
    pub gateway: ConnectionGateway,
    /// Queue and relay dispatch.
    pub router: MessageRouter,
    /// Handshake token validation.
    pub auth: Authenticator,
    /// Server configuration.
    pub config: Config,
    connections: AtomicUsize,
    shutdown: watch::Sender<bool>,
}

impl AppState {
    /// Create new app state.
    ///
    /// # Errors
    ///
    /// Returns an error if the auth configuration is unusable.
    pub fn new(config: Config, ctx: Arc<NodeContext>) -> Result<Self> {
        let auth = Authenticator::from_config(&config.auth).context("Invalid [auth] configuration")?;
        let gateway = ConnectionGateway::new(ctx);
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            router: MessageRouter::new(gateway.clone()),
            gateway,
            auth,
            config,
            connections: AtomicUsize::new(0),
            shutdown,
        })
    }

    /// This node's context.
    #[must_use]
    pub fn context(&self) -> &Arc<NodeContext> {
        self.gateway.context()
    }

    /// Open WebSocket connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

/// A reserved connection slot, released on drop.
struct ConnectionSlot {
    state: Arc<AppState>,
}

impl ConnectionSlot {
    fn acquire(state: &Arc<AppState>) -> Option<Self> {
        let max = state.config.limits.max_connections;
        state
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1))
            .ok()
            .map(|_| Self {
                state: Arc::clone(state),
            })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.config.transport.websocket_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until Ctrl-C or SIGTERM.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config, ctx: Arc<NodeContext>) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Switchboard listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.transport.websocket_path
    );

    serve(listener, config, ctx, shutdown_signal()).await
}

/// Serve on an already bound listener until `shutdown` resolves.
///
/// Starts the relay listener, the ingestion consumers and the stats
/// exporter, then accepts connections. On shutdown every open connection is
/// closed and runs its disconnect path before the workers are stopped.
///
/// # Errors
///
/// Returns an error if the workers cannot be started or the server fails.
pub async fn serve<F>(
    listener: TcpListener,
    config: Config,
    ctx: Arc<NodeContext>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = Arc::new(AppState::new(config, ctx)?);
    let workers = spawn_workers(&state).await?;

    let signal_state = Arc::clone(&state);
    let result = axum::serve(listener, app(Arc::clone(&state)))
        .with_graceful_shutdown(async move {
            shutdown.await;
            info!("Shutdown requested, closing connections");
            signal_state.begin_shutdown();
        })
        .await;

    // A server error skips the signal above.
    state.begin_shutdown();
    drain_connections(&state).await;

    for worker in workers {
        worker.abort();
    }
    info!(node = %state.context().node_id(), "Switchboard stopped");

    result.context("Server error")
}

async fn spawn_workers(state: &Arc<AppState>) -> Result<Vec<JoinHandle<()>>> {
    let ctx = state.context();
    let mut workers = Vec::new();

    // The first subscription is opened here so a dead backend fails startup.
    let subscription = ctx
        .bus()
        .subscribe()
        .await
        .context("Failed to subscribe to relay bus")?;
    workers.push(tokio::spawn(supervise_relay(Arc::clone(state), subscription)));

    for _ in 0..state.config.node.consumers.max(1) {
        let consumer = ctx
            .queue()
            .consumer()
            .await
            .context("Failed to start ingestion consumer")?;
        workers.push(tokio::spawn(supervise_consumer(Arc::clone(state), consumer)));
    }

    if state.config.metrics.enabled {
        let ctx = Arc::clone(ctx);
        let period = Duration::from_millis(state.config.metrics.stats_interval_ms.max(100));
        workers.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                metrics::export_router_stats(&ctx.stats().snapshot(), ctx.sessions().len());
            }
        }));
    }

    info!(
        node = %ctx.node_id(),
        consumers = state.config.node.consumers.max(1),
        "Routing workers started"
    );
    Ok(workers)
}

/// Run the relay listener, resubscribing whenever its stream ends.
async fn supervise_relay(state: Arc<AppState>, mut subscription: Box<dyn BusSubscription>) {
    let mut shutdown = state.shutdown.subscribe();
    let mut failures = 0u32;
    loop {
        let started = Instant::now();
        state.router.run_relay(subscription).await;
        failures = next_failure_count(failures, started);
        warn!(
            node = %state.context().node_id(),
            attempt = failures,
            "Relay stream ended, resubscribing"
        );

        subscription = loop {
            if !backoff(&mut shutdown, failures).await {
                return;
            }
            match state.context().bus().subscribe().await {
                Ok(subscription) => break subscription,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!(error = %e, attempt = failures, "Failed to resubscribe to relay bus");
                }
            }
        };
    }
}

/// Run one ingestion consumer, reopening it whenever its stream ends.
async fn supervise_consumer(state: Arc<AppState>, mut consumer: Box<dyn QueueConsumer>) {
    let mut shutdown = state.shutdown.subscribe();
    let mut failures = 0u32;
    loop {
        let started = Instant::now();
        state.router.run_consumer(consumer).await;
        failures = next_failure_count(failures, started);
        warn!(
            node = %state.context().node_id(),
            attempt = failures,
            "Ingestion stream ended, reopening consumer"
        );

        consumer = loop {
            if !backoff(&mut shutdown, failures).await {
                return;
            }
            match state.context().queue().consumer().await {
                Ok(consumer) => break consumer,
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!(error = %e, attempt = failures, "Failed to reopen ingestion consumer");
                }
            }
        };
    }
}

/// Streams that die right after opening keep escalating the backoff.
fn next_failure_count(failures: u32, started: Instant) -> u32 {
    if started.elapsed() >= STABLE_STREAM {
        1
    } else {
        failures.saturating_add(1)
    }
}

fn backoff_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    RECONNECT_BACKOFF
        .saturating_mul(1 << exponent)
        .min(MAX_RECONNECT_BACKOFF)
}

/// Wait out the reconnect delay. Returns `false` once shutdown has begun.
async fn backoff(shutdown: &mut watch::Receiver<bool>, failures: u32) -> bool {
    if *shutdown.borrow_and_update() {
        return false;
    }
    tokio::select! {
        () = tokio::time::sleep(backoff_delay(failures)) => {}
        _ = shutdown.changed() => {}
    }
    !*shutdown.borrow()
}

async fn drain_connections(state: &AppState) {
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while state.connection_count() > 0 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let remaining = state.connection_count();
    if remaining > 0 {
        warn!(remaining, "Connections still open after drain timeout");
    }
}

/// Resolves on Ctrl-C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "node": state.context().node_id().as_str(),
    }))
}

/// The first `token` query parameter. Anything else is ignored.
fn handshake_token(params: &[(String, String)]) -> Option<&str> {
    params
        .iter()
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.as_str())
}

/// WebSocket upgrade handler.
///
/// Origin, token and connection limit are all checked before the upgrade;
/// a refused request never becomes a session.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    params: Option<Query<Vec<(String, String)>>>,
    headers: HeaderMap,
) -> Response {
    if let Some(origin) = headers.get(header::ORIGIN) {
        let allowed = origin
            .to_str()
            .map(|o| state.config.origin_allowed(o))
            .unwrap_or(false);
        if !allowed {
            debug!(origin = ?origin, "Rejected handshake from disallowed origin");
            metrics::record_rejected_handshake("origin");
            return StatusCode::FORBIDDEN.into_response();
        }
    }

    let token = params.as_ref().and_then(|Query(params)| handshake_token(params));
    let user_id = match state.auth.authenticate(token) {
        Ok(user_id) => user_id,
        Err(e) => {
            debug!(error = %e, "Rejected handshake");
            metrics::record_rejected_handshake("unauthorized");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    let Some(slot) = ConnectionSlot::acquire(&state) else {
        warn!(
            user = %user_id,
            max = state.config.limits.max_connections,
            "Connection limit reached"
        );
        metrics::record_rejected_handshake("capacity");
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    ws.on_upgrade(move |socket| handle_websocket(socket, state, user_id, slot))
}

/// Handle a WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    state: Arc<AppState>,
    user_id: String,
    _slot: ConnectionSlot,
) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let mut shutdown = state.shutdown.subscribe();

    let (handle, mut outbound) = SessionHandle::channel(state.config.limits.outbound_buffer.max(1));
    let connection_id = handle.connection_id().clone();

    // A failed directory write leaves the session reachable only from this node.
    if state.gateway.on_connect(&user_id, handle).await.is_err() {
        metrics::record_error("presence");
    }
    debug!(user = %user_id, connection = %connection_id, "WebSocket connected");

    let (mut sender, mut receiver) = socket.split();

    let interval = state.config.heartbeat.interval();
    let idle_timeout = state.config.heartbeat.timeout();
    let mut heartbeat = tokio::time::interval_at(Instant::now() + interval, interval);
    let mut last_seen = Instant::now();

    if *shutdown.borrow_and_update() {
        let _ = sender.send(Message::Close(None)).await;
    } else {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    debug!(user = %user_id, "Closing for shutdown");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }

                // Envelopes routed to this user
                Some(text) = outbound.recv() => {
                    metrics::record_message(text.len(), "outbound");
                    if sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }

                msg = receiver.next() => {
                    last_seen = Instant::now();
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            handle_payload(&state, &user_id, text.as_bytes()).await;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            handle_payload(&state, &user_id, &data).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {}
                        Some(Ok(Message::Close(_))) => {
                            debug!(user = %user_id, "Received close frame");
                            break;
                        }
                        Some(Err(e)) => {
                            warn!(user = %user_id, error = %e, "WebSocket error");
                            metrics::record_error("websocket");
                            break;
                        }
                        None => {
                            debug!(user = %user_id, "WebSocket stream ended");
                            break;
                        }
                    }
                }

                _ = heartbeat.tick() => {
                    if last_seen.elapsed() >= idle_timeout {
                        debug!(user = %user_id, "Idle timeout");
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    if state.gateway.on_disconnect(&user_id).await.is_err() {
        metrics::record_error("presence");
    }
    debug!(user = %user_id, connection = %connection_id, "WebSocket disconnected");
}

/// Queue one client frame. Problems are logged and the connection stays open.
async fn handle_payload(state: &AppState, user_id: &str, raw: &[u8]) {
    let max = state.config.limits.max_message_size;
    if raw.len() > max {
        warn!(user = %user_id, size = raw.len(), max, "Dropping oversized frame");
        metrics::record_error("oversized");
        return;
    }

    metrics::record_message(raw.len(), "inbound");
    let start = Instant::now();
    match state.gateway.on_inbound_payload(user_id, raw).await {
        Ok(()) => metrics::record_ingest_latency(start.elapsed().as_secs_f64()),
        Err(IngestError::Malformed(_)) => metrics::record_error("malformed"),
        Err(IngestError::Queue(_)) => metrics::record_error("queue"),
    }
}
