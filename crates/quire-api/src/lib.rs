//! quire-api - HTTP and WebSocket surface of the Quire synchronization core.
//!
//! The binary in `main.rs` wires configuration, logging and the database;
//! this library holds the router so tests can serve it against in-memory
//! collaborators.

pub mod health;
pub mod ws;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use uuid::Uuid;

use quire_core::{defaults, TokenValidator};
use quire_db::Database;
use quire_sync::SyncRuntime;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    /// `None` when running against the in-memory store.
    pub db: Option<Database>,
    pub tokens: Arc<dyn TokenValidator>,
    pub runtime: Arc<SyncRuntime>,
    /// Active WebSocket connection count.
    pub ws_connections: Arc<AtomicUsize>,
    pub ping_interval: Duration,
}

impl AppState {
    pub fn new(
        db: Option<Database>,
        tokens: Arc<dyn TokenValidator>,
        runtime: Arc<SyncRuntime>,
    ) -> Self {
        Self {
            db,
            tokens,
            runtime,
            ws_connections: Arc::new(AtomicUsize::new(0)),
            ping_interval: Duration::from_secs(defaults::WS_PING_INTERVAL_SECS),
        }
    }

    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }
}

/// Routes without middleware layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/ws", get(ws::ws_handler))
        .with_state(state)
}

/// Generates time-ordered UUIDv7 request correlation IDs.
#[derive(Clone, Default)]
pub struct MakeRequestUuidV7;

impl tower_http::request_id::MakeRequestId for MakeRequestUuidV7 {
    fn make_request_id<B>(
        &mut self,
        _request: &axum::http::Request<B>,
    ) -> Option<tower_http::request_id::RequestId> {
        let id = Uuid::now_v7().to_string().parse().ok()?;
        Some(tower_http::request_id::RequestId::new(id))
    }
}
