//! `GET /health`: database, broker and sync status.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use tracing::warn;

use crate::AppState;

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = match &state.db {
        Some(db) => match db.ping().await {
            Ok(()) => {
                quire_db::log_pool_metrics(db.pool());
                "connected"
            }
            Err(e) => {
                warn!(subsystem = "api", error = %e, "Database health check failed");
                "unavailable"
            }
        },
        None => "memory",
    };
    let sync = state.runtime.status().await;

    let (code, status) = if database == "unavailable" {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    } else if sync.status == "ok" {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::OK, "degraded")
    };

    (
        code,
        Json(serde_json::json!({
            "status": status,
            "version": env!("CARGO_PKG_VERSION"),
            "database": database,
            "broker": sync.broker,
            "sync": sync,
        })),
    )
}
