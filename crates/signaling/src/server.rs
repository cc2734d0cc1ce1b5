use crate::config::SignalingServerConfig;
use crate::registry::ConnectionRegistry;
use crate::router::SignalingRouter;

use axum::extract::ws::{Message, WebSocket};
use axum::{
    extract::{State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use shared::ServerEvent;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    router: SignalingRouter,
    config: Arc<SignalingServerConfig>,
}

impl AppState {
    pub fn new(config: SignalingServerConfig) -> Self {
        Self {
            router: SignalingRouter::new(Arc::new(ConnectionRegistry::new())),
            config: Arc::new(config),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.router.registry()
    }
}

pub async fn run_server(config: SignalingServerConfig) -> anyhow::Result<()> {
    let listener = TcpListener::bind(config.listen_addr).await?;
    serve(listener, AppState::new(config), shutdown_signal()).await
}

/// Serves the relay on an already bound listener until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "Starting signaling server");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Signaling server stopped");
    Ok(())
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(healthcheck))
        .route("/ws", get(ws_upgrade))
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

#[derive(Serialize)]
struct SignalingServerInfo {
    public_base_url: String,
    connections: usize,
    identities: usize,
    rooms: usize,
}

async fn healthcheck(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.registry().stats().await;
    let body = SignalingServerInfo {
        public_base_url: state.config.public_base_url.clone(),
        connections: stats.connections,
        identities: stats.identities,
        rooms: stats.rooms,
    };
    (StatusCode::OK, Json(body))
}

// Root handler for "/"
async fn root() -> impl IntoResponse {
    (StatusCode::OK, "Server OK!")
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let max_message_bytes = state.config.max_message_bytes;
    ws.max_message_size(max_message_bytes)
        .on_upgrade(move |socket| handle_ws(socket, state))
}

#[instrument(skip_all, fields(connection_id = %connection_id))]
async fn run_connection(socket: WebSocket, state: AppState, connection_id: Uuid) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    state.registry().connect(connection_id, tx).await;
    info!("connection established");

    // Writer: drains this connection's queue in FIFO order.
    let writer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let frame = match event.to_frame() {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(error = %err, event = event.name(), "failed to encode event");
                    continue;
                }
            };
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                state.router.handle_frame(connection_id, &text).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => debug!("ignoring binary frame"),
            Ok(_) => {}
            Err(err) => {
                debug!(error = %err, "websocket read failed");
                break;
            }
        }
    }

    let identity = state.registry().remove(connection_id).await;
    writer.abort();
    info!(?identity, "connection closed");
}

async fn handle_ws(socket: WebSocket, state: AppState) {
    run_connection(socket, state, Uuid::new_v4()).await;
}
