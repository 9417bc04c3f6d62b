use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use parley_core::ConversationId;
use parley_settings::ServerSettings;
use parley_store::ConversationStore;
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::client::{self, ClientRegistry};
use crate::router::{self, EventRouter};

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub inbound_queue: usize,
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
    pub cleanup_interval: Duration,
    pub cors_origin: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_settings(&ServerSettings::default())
    }
}

impl ServerConfig {
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            max_send_queue: settings.max_send_queue,
            inbound_queue: settings.inbound_queue,
            heartbeat_interval: settings.heartbeat_interval(),
            client_timeout: settings.client_timeout(),
            cleanup_interval: settings.cleanup_interval(),
            cors_origin: settings.cors_origin.clone(),
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<EventRouter>,
    pub client_registry: Arc<ClientRegistry>,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(config: ServerConfig, store: Arc<dyn ConversationStore>) -> Self {
        let client_registry = Arc::new(ClientRegistry::new(
            config.max_send_queue,
            config.client_timeout,
        ));
        let router = Arc::new(EventRouter::new(store, client_registry.clone()));
        Self {
            router,
            client_registry,
            config: Arc::new(config),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(state.config.cors_origin.as_deref());
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/health", get(health_handler))
        .route("/api/conversation/{user1}/{user2}", get(conversation_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origin: Option<&str>) -> CorsLayer {
    let Some(origin) = origin else {
        return CorsLayer::permissive();
    };
    match origin.parse::<HeaderValue>() {
        Ok(value) => CorsLayer::new()
            .allow_origin(value)
            .allow_methods([Method::GET, Method::POST])
            .allow_credentials(true),
        Err(e) => {
            tracing::warn!(origin, error = %e, "invalid CORS origin, allowing any");
            CorsLayer::permissive()
        }
    }
}

/// Bind, spawn the serving and cleanup tasks, and return a handle to them.
pub async fn start(
    config: ServerConfig,
    store: Arc<dyn ConversationStore>,
) -> Result<ServerHandle, std::io::Error> {
    let addr = format!("{}:{}", config.host, config.port);
    let cleanup_interval = config.cleanup_interval;
    let state = AppState::new(config, store);

    let cleanup = client::start_cleanup_task(Arc::clone(&state.client_registry), cleanup_interval);

    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(addr = %local_addr, "Parley server started");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "server stopped");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        local_addr,
        state,
        server,
        cleanup,
    })
}

/// Handle returned by `start()`. Keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    pub local_addr: SocketAddr,
    state: AppState,
    server: tokio::task::JoinHandle<()>,
    cleanup: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Stop accepting connections and close the live ones.
    pub fn shutdown(self) {
        self.server.abort();
        self.cleanup.abort();
        let closed = self.state.client_registry.close_all();
        tracing::info!(closed, "server shut down");
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a new WebSocket connection: one transport task pair plus one
/// dispatch loop that owns the connection's session.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (connection_id, rx) = state.client_registry.register();
    tracing::info!(connection_id = %connection_id, "WebSocket client connected");

    let (event_tx, event_rx) = mpsc::channel(state.config.inbound_queue);
    let dispatcher = tokio::spawn(router::run_connection(
        Arc::clone(&state.router),
        connection_id.clone(),
        event_rx,
    ));

    client::handle_ws_connection(
        socket,
        connection_id.clone(),
        rx,
        Arc::clone(&state.client_registry),
        event_tx,
        state.config.heartbeat_interval,
    )
    .await;

    if let Err(e) = dispatcher.await {
        tracing::warn!(connection_id = %connection_id, error = %e, "dispatch loop failed");
    }
    tracing::info!(connection_id = %connection_id, "WebSocket client disconnected");
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "OK",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "connections": state.client_registry.count(),
        "online": state.router.sessions().online_count(),
    }))
}

/// Recent history between two users, outside of any WebSocket session.
async fn conversation_handler(
    Path((user1, user2)): Path<(String, String)>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let conversation_id = ConversationId::between(&user1, &user2);
    match state.router.store().recent(&conversation_id).await {
        Ok(messages) => (StatusCode::OK, Json(json!(messages))),
        Err(e) => {
            tracing::warn!(conversation_id = %conversation_id, error = %e, "history request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Failed to fetch conversation" })),
            )
        }
    }
}
