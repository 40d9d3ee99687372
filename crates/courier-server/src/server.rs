use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use courier_core::{AuthError, AuthGate, MessageStore, Principal};
use courier_store::{Database, MessageRepo, SqliteMessageStore};
use futures::StreamExt;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::{RegistryMode, ServerConfig};
use crate::health::HealthReport;
use crate::hub::Hub;
use crate::registry::Registry;
use crate::router::MessageRouter;
use crate::session::{self, SessionContext};
use crate::shared::SharedRegistry;

const DEFAULT_HISTORY_LIMIT: u32 = 50;
const MAX_HISTORY_LIMIT: u32 = 500;

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<dyn Registry>,
    pub auth: Arc<dyn AuthGate>,
    pub db: Database,
    pub session: SessionContext,
    pub max_message_size: usize,
    pub started_at: Instant,
}

impl AppState {
    /// Build the registry selected by `config` and wire the router to it.
    /// Returns the hub task when the actor registry is used.
    pub fn new(
        config: &ServerConfig,
        auth: Arc<dyn AuthGate>,
        db: Database,
        shutdown: CancellationToken,
    ) -> (Self, Option<JoinHandle<()>>) {
        let (registry, hub_task) = match config.registry {
            RegistryMode::Actor => {
                let (hub, handle) = Hub::new(config.hub_capacity);
                let registry: Arc<dyn Registry> = Arc::new(handle);
                (registry, Some(hub.spawn()))
            }
            RegistryMode::Shared => {
                let registry: Arc<dyn Registry> = Arc::new(SharedRegistry::new());
                (registry, None)
            }
        };

        let store: Arc<dyn MessageStore> = Arc::new(SqliteMessageStore::new(db.clone()));
        let router = Arc::new(MessageRouter::new(Arc::clone(&registry), Some(store)));

        let state = Self {
            registry: Arc::clone(&registry),
            auth,
            db,
            session: SessionContext {
                registry,
                router,
                config: config.session(),
                shutdown,
            },
            max_message_size: config.max_message_size,
            started_at: Instant::now(),
        };
        (state, hub_task)
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/messages/{peer}", get(history_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle to shut it down.
pub async fn start(
    config: ServerConfig,
    auth: Arc<dyn AuthGate>,
    db: Database,
) -> Result<ServerHandle, std::io::Error> {
    let shutdown = CancellationToken::new();
    let (state, hub_task) = AppState::new(&config, auth, db, shutdown.clone());
    let registry = Arc::clone(&state.registry);

    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    let addr = listener.local_addr()?;

    info!(%addr, registry = ?config.registry, "courier server started");

    let token = shutdown.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move { token.cancelled().await })
            .await;
        if let Err(e) = result {
            error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        addr,
        registry,
        shutdown,
        server,
        _hub: hub_task,
    })
}

/// Handle returned by `start()`. Dropping it leaves the server running.
pub struct ServerHandle {
    pub addr: SocketAddr,
    registry: Arc<dyn Registry>,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    _hub: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    /// Stop accepting connections, end all sessions and wait for the
    /// listener to close.
    pub async fn shutdown(self) {
        info!("courier server shutting down");
        self.shutdown.cancel();
        let _ = self.server.await;
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    token: Option<String>,
    limit: Option<u32>,
}

/// Bearer header first, then the `token` query parameter.
fn credential<'a>(headers: &'a HeaderMap, query_token: Option<&'a str>) -> Option<&'a str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or(query_token)
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn authenticate(
    auth: &dyn AuthGate,
    headers: &HeaderMap,
    query_token: Option<&str>,
) -> Result<Principal, Response> {
    let result = match credential(headers, query_token) {
        Some(token) => auth.validate(token),
        None => Err(AuthError::Missing),
    };
    result.map_err(|e| {
        info!(error_kind = e.error_kind(), "credential rejected");
        let body = serde_json::json!({ "error": e.to_string(), "kind": e.error_kind() });
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    })
}

/// WebSocket upgrade handler. The credential is checked before upgrading.
async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let principal = match authenticate(state.auth.as_ref(), &headers, query.token.as_deref()) {
        Ok(principal) => principal,
        Err(rejection) => return rejection,
    };
    let ws = match upgrade {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let ctx = state.session;
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| async move {
            let (writer, reader) = socket.split();
            // Failures are logged inside the session.
            let _ = session::run_session(reader, writer, principal, ctx).await;
        })
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let report = HealthReport::collect(state.registry.as_ref(), &state.db, state.started_at).await;
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

/// Stored conversation between the caller and `peer`, oldest first.
async fn history_handler(
    State(state): State<AppState>,
    Path(peer): Path<String>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> Response {
    let caller = match authenticate(state.auth.as_ref(), &headers, query.token.as_deref()) {
        Ok(principal) => principal,
        Err(rejection) => return rejection,
    };
    let peer = Principal::new(peer);
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);

    let repo = MessageRepo::new(state.db.clone());
    let result = tokio::task::spawn_blocking(move || repo.conversation(&caller, &peer, limit)).await;
    match result {
        Ok(Ok(messages)) => Json(serde_json::json!({ "messages": messages })).into_response(),
        Ok(Err(e)) => {
            error!(error = %e, "history query failed");
            internal_error()
        }
        Err(e) => {
            error!(error = %e, "history task failed");
            internal_error()
        }
    }
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": "internal error" })),
    )
        .into_response()
}
