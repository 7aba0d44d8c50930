//! HTTP/WebSocket surface and shared application state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use uuid::Uuid;

use periscope_protocol::PeriscopeConfig;

use crate::driver::BrowserDriver;
use crate::pool::BrowserPool;
use crate::router;
use crate::session::SessionStore;
use crate::stream::StreamLimits;

/// Socket id → owned browser id. At most one browser per socket; the entry
/// lives exactly as long as the connection's stream.
pub type ClientRegistry = RwLock<HashMap<Uuid, Uuid>>;

/// Shared application state.
pub struct AppState<D: BrowserDriver> {
    pub config: PeriscopeConfig,
    pub pool: Arc<BrowserPool<D>>,
    pub sessions: SessionStore,
    pub clients: ClientRegistry,
    pub limits: StreamLimits,
    pub started_at: std::time::Instant,
}

impl<D: BrowserDriver> AppState<D> {
    pub fn new(config: PeriscopeConfig, driver: D) -> Self {
        let limits = StreamLimits::from_config(&config);
        let pool = Arc::new(BrowserPool::new(driver, config.browser.max_browsers));
        let sessions = SessionStore::new(std::time::Duration::from_millis(
            config.security.session_timeout_ms,
        ));
        Self {
            config,
            pool,
            sessions,
            clients: RwLock::new(HashMap::new()),
            limits,
            started_at: std::time::Instant::now(),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router<D: BrowserDriver>(state: Arc<AppState<D>>) -> Router {
    let cors = cors_layer(&state.config.server.cors_origin);

    Router::new()
        .route("/ws", get(ws_upgrade::<D>))
        .route("/api/health", get(health::<D>))
        .layer(RequestBodyLimitLayer::new(65_536)) // 64KB max request body
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origin: &str) -> CorsLayer {
    if origin == "*" {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    match origin.parse::<HeaderValue>() {
        Ok(value) => CorsLayer::new()
            .allow_origin(value)
            .allow_methods(Any)
            .allow_headers(Any),
        Err(_) => {
            tracing::warn!(%origin, "Invalid CORS origin, falling back to any");
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    }
}

/// Query parameters for the WebSocket upgrade.
#[derive(Deserialize)]
struct WsQuery {
    /// Opaque session token from a previous connection.
    session: Option<String>,
}

/// GET /ws — the client's bidirectional control + frame channel.
async fn ws_upgrade<D: BrowserDriver>(
    State(state): State<Arc<AppState<D>>>,
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    ws.on_upgrade(move |socket| async move {
        let session = state
            .sessions
            .get_or_create(query.session.as_deref(), &peer.ip().to_string(), &user_agent)
            .await;
        router::handle_socket(socket, state, session).await;
    })
}

/// GET /api/health
async fn health<D: BrowserDriver>(State(state): State<Arc<AppState<D>>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "active_browsers": state.pool.count().await,
        "active_sessions": state.sessions.count().await,
        "connected_clients": state.clients.read().await.len(),
    }))
}
