use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use relay_core::{clock, ConnectionId, Frame, FrameCodec, GatewayConfig, GatewayError, UserId};

use crate::connection::{refuse_missing_user, serve_connection};
use crate::heartbeat;
use crate::registry::{ConnectionHandle, GatewayStats, PublishOutcome, Registry};
use crate::shutdown::ShutdownCoordinator;

const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    registry: Arc<Registry>,
    shutdown: Arc<ShutdownCoordinator>,
    inbound_tx: mpsc::Sender<(UserId, Frame)>,
    config: Arc<GatewayConfig>,
    started_at: i64,
}

/// Handle the task engine uses to reach connected clients. Cheap to clone.
#[derive(Clone)]
pub struct Gateway {
    registry: Arc<Registry>,
    shutdown: Arc<ShutdownCoordinator>,
    config: Arc<GatewayConfig>,
}

impl Gateway {
    /// Deliver a frame to every live connection of the user, or into the
    /// user's replay window. Refused once shutdown has begun.
    pub fn publish_to(&self, user: &UserId, frame: Frame) -> Result<PublishOutcome, GatewayError> {
        if self.shutdown.is_shutting_down() {
            return Err(GatewayError::Shutdown);
        }
        self.registry.publish_to(user, frame)
    }

    /// Best-effort broadcast to every live connection.
    pub fn publish_all(&self, frame: &Frame) -> Result<(), GatewayError> {
        if self.shutdown.is_shutting_down() {
            return Err(GatewayError::Shutdown);
        }
        self.registry.publish_all(frame);
        Ok(())
    }

    pub fn stats(&self) -> GatewayStats {
        self.registry.stats()
    }

    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }

    /// Stop the gateway: refuse new upgrades and publishes, tell clients the
    /// server is going away, close every socket with 1001, cancel timers and
    /// wait up to the grace deadline for connection tasks to unwind.
    pub async fn shutdown(&self) {
        if self.shutdown.is_shutting_down() {
            return;
        }
        tracing::info!("gateway shutdown started");
        self.shutdown.begin();

        self.registry
            .publish_all(&Frame::connection_state("closing", 0));
        for conn in self.registry.connection_snapshot() {
            conn.request_close(1001, "going away");
        }

        let clean = self.shutdown.finish(self.config.shutdown_grace).await;
        tracing::info!(clean, "gateway shutdown complete");
    }
}

/// Handle returned by `start()` — keeps background tasks alive and exposes
/// the inbound frame stream for the task engine.
pub struct ServerHandle {
    pub port: u16,
    pub gateway: Gateway,
    /// Non-control frames received from clients, keyed by user.
    pub inbound: mpsc::Receiver<(UserId, Frame)>,
    _server: tokio::task::JoinHandle<()>,
    _heartbeat: tokio::task::JoinHandle<()>,
}

/// Build the Axum router with the upgrade path and health endpoint.
pub fn build_router(state: AppState) -> Router {
    let path = state.config.path.clone();
    Router::new()
        .route(&path, get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the gateway server.
pub async fn start(config: GatewayConfig) -> Result<ServerHandle, std::io::Error> {
    let codec = FrameCodec::new(config.max_frame_bytes);
    let registry = Arc::new(Registry::new(
        codec,
        config.pending_per_user,
        config.max_total_drops,
    ));
    let shutdown = Arc::new(ShutdownCoordinator::new());
    let (inbound_tx, inbound_rx) = mpsc::channel::<(UserId, Frame)>(1024);

    let heartbeat_handle = heartbeat::start_heartbeat(
        Arc::clone(&registry),
        config.ping_interval,
        shutdown.token(),
    );

    let config = Arc::new(config);
    let state = AppState {
        registry: Arc::clone(&registry),
        shutdown: Arc::clone(&shutdown),
        inbound_tx,
        config: Arc::clone(&config),
        started_at: clock::now_ms(),
    };

    let router = build_router(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    let cancel = shutdown.token();
    let server_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .ok();
    });

    tracing::info!(port = local_addr.port(), path = %config.path, "relay gateway started");

    Ok(ServerHandle {
        port: local_addr.port(),
        gateway: Gateway {
            registry,
            shutdown,
            config,
        },
        inbound: inbound_rx,
        _server: server_handle,
        _heartbeat: heartbeat_handle,
    })
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    user: Option<String>,
    #[serde(rename = "isAuthenticated")]
    is_authenticated: Option<bool>,
    /// Client-chosen id, for diagnostics only.
    #[serde(rename = "connectionId")]
    connection_id: Option<String>,
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    if state.shutdown.is_shutting_down() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    let tracker = state.shutdown.tracker().clone();
    ws.on_upgrade(move |socket| {
        tracker.track_future(admit_socket(socket, state, query, addr))
    })
    .into_response()
}

async fn admit_socket(
    socket: axum::extract::ws::WebSocket,
    state: AppState,
    query: WsQuery,
    addr: SocketAddr,
) {
    let user = match query.user.as_deref().map(UserId::new) {
        Some(Ok(user)) => user,
        _ => {
            tracing::warn!(remote = %addr, "upgrade without user, refusing");
            refuse_missing_user(socket, state.registry.codec()).await;
            return;
        }
    };

    // The registry key is always freshly minted; the id a client carries in
    // the query string is untrusted and logged for correlation only.
    let conn_id = ConnectionId::new();
    let (data_tx, data_rx) = mpsc::channel(state.config.max_send_queue);
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let conn = Arc::new(ConnectionHandle::new(
        conn_id,
        user.clone(),
        addr.to_string(),
        data_tx,
        control_tx,
    ));
    conn.set_authenticated(query.is_authenticated.unwrap_or(false));

    let greeting = Frame::connection_established(&user, SERVER_VERSION);
    match state.registry.admit(Arc::clone(&conn), &greeting) {
        Ok(replayed) => {
            tracing::info!(
                connection_id = %conn.id,
                user = %user,
                remote = %addr,
                client_id = query.connection_id.as_deref().unwrap_or(""),
                replayed,
                "client connected"
            );
        }
        Err(e) => {
            tracing::warn!(user = %user, error = %e, "failed to admit connection");
            return;
        }
    }

    serve_connection(
        socket,
        conn,
        data_rx,
        control_rx,
        Arc::clone(&state.registry),
        state.inbound_tx.clone(),
        state.shutdown.token(),
    )
    .await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.registry.stats();
    let uptime_secs = (clock::now_ms() - state.started_at) / 1000;
    let status = if state.shutdown.is_shutting_down() {
        "closing"
    } else {
        "healthy"
    };
    axum::Json(serde_json::json!({
        "status": status,
        "version": SERVER_VERSION,
        "timestamp": clock::now_rfc3339(),
        "uptimeSecs": uptime_secs,
        "stats": stats,
    }))
}
