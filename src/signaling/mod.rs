#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod connection;
pub mod dispatcher;
pub mod peers;
pub mod protocol;

use crate::room::RoomManager;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use dispatcher::Dispatcher;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Largest accepted WebSocket frame
const MAX_MESSAGE_SIZE: usize = 65_536;

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    dispatcher: Dispatcher,
    connection_semaphore: Arc<Semaphore>,
    metrics_token: Option<Arc<str>>,
}

impl SignalingServer {
    pub fn new(rooms: Arc<RoomManager>, max_connections: usize, metrics_token: Option<String>) -> Self {
        info!("Max connections: {}", max_connections);
        Self {
            dispatcher: Dispatcher::new(rooms),
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
            metrics_token: metrics_token.map(Arc::from),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self)
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Serves until `shutdown` is cancelled
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the address
    pub async fn serve(self, addr: SocketAddr, shutdown: CancellationToken) -> anyhow::Result<()> {
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let app = self.router();

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let rooms = server.dispatcher.rooms().registry().room_count();
    let connections = server.dispatcher.peers().len();
    let program = server.dispatcher.program().current();
    Json(serde_json::json!({
        "status": "ok",
        "rooms": rooms,
        "connections": connections,
        "program": program.room_id(),
    }))
}

/// Metrics handler, Prometheus text exposition format.
/// Protected by the optional metrics token (Bearer auth).
async fn metrics_handler(State(server): State<SignalingServer>, headers: HeaderMap) -> Response {
    if let Some(expected) = server.metrics_token.as_deref() {
        let provided = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if provided != format!("Bearer {expected}") {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let rooms = server.dispatcher.rooms();
    let live = server.dispatcher.program().current().room_id().is_some();
    let body = rooms.metrics().render_prometheus(rooms.registry().room_count(), live);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| connection::handle_connection(socket, server.dispatcher, permit))
}
