//! Connection handlers for the gateway.
//!
//! This module handles the WebSocket lifecycle: upgrade, tenant resolution
//! from the Host header, session creation, the per-connection read loop, and
//! teardown. Everything between a decoded envelope and its response lives in
//! `trellis-core`; the only thing this module knows about the protocol is
//! that frames are text.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use trellis_auth::{AuditSink, InMemoryDirectory, TokenAuthority, TracingAudit};
use trellis_core::{CoreError, Dispatcher, EnvelopeSink, IdleReaper, Session, SessionRegistry};
use trellis_protocol::{reserved, Envelope};

/// Shared server state.
pub struct AppState {
    /// Every live session.
    pub registry: Arc<SessionRegistry>,
    /// Envelope router.
    pub dispatcher: Arc<Dispatcher>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state from configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(SessionRegistry::new(config.session.max_in_flight));

        let authority = Arc::new(TokenAuthority::with_windows(
            &config.auth.secret,
            config.auth.token_ttl_secs,
            config.auth.refresh_window_secs,
        ));
        let directory = Arc::new(InMemoryDirectory::new(config.users.clone()));
        let audit = Arc::new(GatewayAudit::default());

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            authority,
            directory,
            audit,
            config.webroots(),
        ));

        Self {
            registry,
            dispatcher,
            config,
        }
    }
}

/// Audit sink that writes structured logs and bumps the login counters.
#[derive(Debug, Default)]
struct GatewayAudit {
    inner: TracingAudit,
}

impl AuditSink for GatewayAudit {
    fn record_login(&self, user: &str, protocol: &str, success: bool) {
        self.inner.record_login(user, protocol, success);
        metrics::record_login(success);
    }
}

/// Run the HTTP/WebSocket server until shutdown is requested.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let state = Arc::new(AppState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    // Start the idle reaper
    let reaper = IdleReaper::new(Arc::clone(&state.registry), config.reaper_config())
        .with_observer(metrics::record_reaped);
    let reaper_handle = reaper.spawn();

    // Build router
    let app = router(Arc::clone(&state));

    // Bind and serve
    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr).await?;

    info!("Trellis gateway listening on {}", addr);
    info!(
        "WebSocket endpoint: ws://{}{}",
        addr, config.websocket_path
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    // Drain: stop reaping, then close every live session.
    reaper_handle.abort();
    state.registry.shutdown().await;

    Ok(())
}

/// Build the HTTP router over the shared state.
fn router(state: Arc<AppState>) -> Router {
    let ws_path = state.config.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl-C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!("Failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown requested");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": state.registry.len(),
    }))
}

/// WebSocket upgrade handler. The tenant is pinned here, from the Host
/// header the browser sent with the upgrade request.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let vhost = resolve_vhost(&headers);
    ws.on_upgrade(move |socket| handle_websocket(socket, state, vhost, addr))
}

/// The vhost is the Host header minus any port, lowercased.
fn resolve_vhost(headers: &HeaderMap) -> String {
    headers
        .get(axum::http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .and_then(|host| host.split(':').next())
        .map(str::to_lowercase)
        .unwrap_or_else(|| "localhost".to_string())
}

/// Write half of an upgraded socket, owned by the session.
struct WsSink {
    sender: SplitSink<WebSocket, Message>,
}

#[async_trait::async_trait]
impl EnvelopeSink for WsSink {
    async fn send(&mut self, text: String) -> Result<(), CoreError> {
        self.sender
            .send(Message::Text(text))
            .await
            .map_err(|e| CoreError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sender.send(Message::Close(None)).await;
        let _ = self.sender.close().await;
    }
}

/// Handle one WebSocket connection from upgrade to teardown.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, vhost: String, addr: SocketAddr) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let (sender, receiver) = socket.split();
    let session = state
        .registry
        .create(vhost, addr.to_string(), Box::new(WsSink { sender }));

    // First frame on every connection: the session id handshake. The client
    // has nothing to say until it knows its id.
    let initialize = Envelope::request(reserved::CLIENT_ROUTE, reserved::types::INITIALIZE);
    if let Err(e) = session.send(initialize).await {
        warn!(session = %session.id(), error = %e, "initialize frame not delivered");
        state.registry.close_session(session.id()).await;
        return;
    }

    read_loop(&state, &session, receiver).await;

    state.registry.close_session(session.id()).await;
    debug!(session = %session.id(), "WebSocket disconnected");
}

/// Pump inbound frames into dispatch until the connection dies or the peer
/// commits a protocol violation.
async fn read_loop(state: &Arc<AppState>, session: &Arc<Session>, mut receiver: SplitStream<WebSocket>) {
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                metrics::record_message(text.len(), "inbound");

                let envelope = match trellis_protocol::decode(&text) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(session = %session.id(), error = %e, "undecodable frame, closing");
                        metrics::record_error("protocol");
                        break;
                    }
                };

                // Backpressure: a session gets a bounded number of in-flight
                // dispatch units; the read loop parks here when they are gone.
                let Ok(permit) = session.dispatch_permits().acquire_owned().await else {
                    break;
                };

                let dispatcher = Arc::clone(&state.dispatcher);
                let session = Arc::clone(session);
                tokio::spawn(async move {
                    let start = Instant::now();
                    dispatcher.dispatch(&session, envelope).await;
                    metrics::record_latency(start.elapsed().as_secs_f64());
                    drop(permit);
                });
            }
            Ok(Message::Binary(_)) => {
                warn!(session = %session.id(), "binary frame on a text protocol, closing");
                metrics::record_error("protocol");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {
                // Answered at the transport layer; not protocol activity.
            }
            Ok(Message::Close(_)) => {
                debug!(session = %session.id(), "received close frame");
                break;
            }
            Err(e) => {
                warn!(session = %session.id(), error = %e, "WebSocket error");
                metrics::record_error("websocket");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_resolve_vhost_strips_port_and_lowercases() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::HOST,
            HeaderValue::from_static("Store.Example.com:8080"),
        );
        assert_eq!(resolve_vhost(&headers), "store.example.com");
    }

    #[test]
    fn test_resolve_vhost_defaults_without_header() {
        assert_eq!(resolve_vhost(&HeaderMap::new()), "localhost");
    }

    #[test]
    fn test_app_state_from_default_config() {
        let state = AppState::new(Config::default());
        assert!(state.registry.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_frame_removes_session() {
        use tokio_tungstenite::tungstenite::Message as WireMessage;

        let state = Arc::new(AppState::new(Config::default()));
        let app = router(Arc::clone(&state));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
            .await
            .unwrap();

        // The channel-ready handshake arrives first.
        let first = socket.next().await.unwrap().unwrap();
        assert!(first.is_text());
        assert_eq!(state.registry.len(), 1);

        socket
            .send(WireMessage::Text("{not an envelope".into()))
            .await
            .unwrap();

        // The server tears the connection down.
        loop {
            match socket.next().await {
                None | Some(Err(_)) => break,
                Some(Ok(frame)) if frame.is_close() => break,
                Some(Ok(_)) => {}
            }
        }

        // Removal happens before the close frame is flushed; the poll is
        // only for slow schedulers.
        for _ in 0..50 {
            if state.registry.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(state.registry.is_empty(), "no further dispatch possible");
    }
}
