//! HTTP admin surface: health, stats, HTTP publish, history

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::AppState;
use crate::gateway::GatewayError;
use crate::gateway::protocol::now_ms;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Seconds since this worker started
    pub uptime: u64,
    pub connections: usize,
}

/// Health check endpoint
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            uptime: state.started_at.elapsed().as_secs(),
            connections: state.supervisor.connection_count(),
        }),
    )
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub total_connections: u64,
    pub active_connections: usize,
    pub total_messages: i64,
    pub messages_per_second: f64,
    /// Subscriber count per channel on this worker
    pub channels: std::collections::HashMap<String, usize>,
    pub uptime: u64,
    #[serde(skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub workers: std::collections::HashMap<String, crate::cluster::PeerStatus>,
}

/// Gateway statistics endpoint
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let engine = state.supervisor.engine();
    (
        StatusCode::OK,
        Json(StatsResponse {
            total_connections: state.supervisor.total_accepted(),
            active_connections: state.supervisor.connection_count(),
            total_messages: engine.total_messages().await,
            messages_per_second: engine.messages_per_second(),
            channels: engine.subscriptions().stats(),
            uptime: state.started_at.elapsed().as_secs(),
            workers: state
                .cluster
                .as_ref()
                .map(|c| c.peers())
                .unwrap_or_default(),
        }),
    )
}

#[derive(Deserialize)]
pub struct BroadcastRequest {
    /// Defaults to the global channel
    pub channel: Option<String>,
    pub data: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastResponse {
    pub message_id: String,
    pub timestamp: i64,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// HTTP publish endpoint. Messages published here carry no sender, so every
/// subscribed session receives them.
pub async fn broadcast(
    State(state): State<AppState>,
    Json(request): Json<BroadcastRequest>,
) -> impl IntoResponse {
    let channel = request.channel.as_deref().unwrap_or("*");
    match state
        .supervisor
        .engine()
        .broadcast_to_channel(channel, request.data, None)
        .await
    {
        Ok(message_id) => (
            StatusCode::OK,
            Json(BroadcastResponse {
                message_id,
                timestamp: now_ms(),
            }),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    /// Defaults to the global channel, which matches all messages
    pub channel: Option<String>,
    pub limit: Option<usize>,
}

/// Recent message history for a channel, newest first
pub async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let channel = query.channel.as_deref().unwrap_or("*");
    match state
        .supervisor
        .engine()
        .get_message_history(channel, query.limit)
        .await
    {
        Ok(messages) => (StatusCode::OK, Json(messages)).into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(error: GatewayError) -> axum::response::Response {
    let status = match &error {
        GatewayError::InvalidMessage(_) => StatusCode::BAD_REQUEST,
        GatewayError::Store(_) | GatewayError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: error.client_message(),
        }),
    )
        .into_response()
}
