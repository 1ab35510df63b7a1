//! WebSocket gateway: accepts upgrades, spawns sessions, owns shutdown.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use coedit_auth::TokenVerifier;
use serde::Deserialize;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::registry::RoomRegistry;
use crate::session;

/// Live session ids, for liveness reporting and logs. Domain state lives in
/// the rooms; the gateway tracks only who is connected.
#[derive(Default)]
pub struct SessionTable(Mutex<HashSet<Uuid>>);

impl SessionTable {
    pub fn register(&self, id: Uuid) {
        self.0.lock().expect("session table poisoned").insert(id);
    }

    pub fn deregister(&self, id: Uuid) {
        self.0.lock().expect("session table poisoned").remove(&id);
    }

    pub fn len(&self) -> usize {
        self.0.lock().expect("session table poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct AppState {
    pub verifier: TokenVerifier,
    pub registry: Arc<RoomRegistry>,
    pub config: Arc<ServerConfig>,
    pub sessions: SessionTable,
    pub shutdown: watch::Sender<bool>,
}

impl AppState {
    pub fn new(
        verifier: TokenVerifier,
        registry: Arc<RoomRegistry>,
        config: Arc<ServerConfig>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            verifier,
            registry,
            config,
            sessions: SessionTable::default(),
            shutdown,
        })
    }
}

#[derive(Deserialize)]
struct WsQuery {
    token: Option<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if *state.shutdown.borrow() {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    ws.on_upgrade(move |socket| session::run(socket, query.token, state))
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "sessions": state.sessions.len(),
        "rooms": state.registry.room_count().await,
    }))
}

/// Serve until ctrl-c, then shut down gracefully: stop accepting, let
/// sessions close, flush every room within the grace budget.
pub async fn serve(addr: SocketAddr, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "gateway listening");

    let sweeper = state.registry.spawn_sweeper(state.shutdown.clone());

    let shutdown_state = state.clone();
    let shutdown_signal = async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
        let _ = shutdown_state.shutdown.send(true);
    };

    axum::serve(listener, router(state.clone()))
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    let flush = state.registry.shutdown_all();
    if tokio::time::timeout(state.config.shutdown_grace, flush)
        .await
        .is_err()
    {
        warn!("shutdown grace expired before every room flushed");
    }
    sweeper.abort();
    Ok(())
}
