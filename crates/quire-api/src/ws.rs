//! `GET /api/v1/ws`: authenticated realtime event stream.
//!
//! The bearer token comes from `?token=` or the `Authorization` header and
//! is validated before the upgrade. After the upgrade, one task drains the
//! connection's outbound queue onto the socket (with a periodic ping) and
//! another applies subscribe/unsubscribe commands from the client.

use std::sync::atomic::Ordering;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let Some(token) = params.token.or_else(|| bearer_token(&headers)) else {
        return unauthorized("missing token");
    };

    let user_id = match state.tokens.validate(&token).await {
        Ok(Some(user_id)) => user_id,
        Ok(None) => return unauthorized("invalid or expired token"),
        Err(e) => {
            warn!(subsystem = "api", error = %e, "Token validation failed");
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({ "error": "token validation unavailable" })),
            )
                .into_response();
        }
    };

    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, user_id))
}

async fn handle_ws_connection(socket: WebSocket, state: AppState, user_id: Uuid) {
    let fanout = state.runtime.fanout();
    let (conn_id, mut outbound) = fanout.register(user_id).await;

    let count = state.ws_connections.fetch_add(1, Ordering::Relaxed) + 1;
    info!(
        connection_id = %conn_id,
        user_id = %user_id,
        active = count,
        "WebSocket connection opened"
    );

    let (mut sender, mut receiver) = socket.split();
    let ping_every = state.ping_interval;

    let mut send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(ping_every);
        ping_interval.tick().await;
        loop {
            tokio::select! {
                message = outbound.recv() => {
                    let Some(message) = message else { break };
                    match serde_json::to_string(&message) {
                        Ok(json) => {
                            if sender.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Failed to serialize outbound message"),
                    }
                }
                _ = ping_interval.tick() => {
                    if sender.send(Message::Ping(vec![])).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let inbound = fanout.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let reply = inbound.handle_text(conn_id, &text).await;
                    if !inbound.send_to(conn_id, reply).await {
                        debug!(connection_id = %conn_id, "Reply dropped");
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    fanout.close(conn_id).await;
    let count = state.ws_connections.fetch_sub(1, Ordering::Relaxed) - 1;
    info!(
        connection_id = %conn_id,
        active = count,
        "WebSocket connection closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc123"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("abc123"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc123"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert_eq!(bearer_token(&headers), None);
    }
}
