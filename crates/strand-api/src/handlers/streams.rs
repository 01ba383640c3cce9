//! /streams handlers: listing and poking individual streams.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use strand_nodes::stream::StreamInfo;

use super::{parse_stream_id, stream_not_found, ApiError, ApiState};

#[derive(Serialize)]
pub struct StreamsResponse {
    pub streams: Vec<StreamInfo>,
}

pub async fn handle_streams(State(state): State<ApiState>) -> Json<StreamsResponse> {
    Json(StreamsResponse {
        streams: state.nodes.streams(),
    })
}

// ── /streams/{id}/close ───────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct CloseResponse {
    pub stream: u64,
    pub closed: bool,
}

pub async fn handle_stream_close(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<CloseResponse>, ApiError> {
    let id = parse_stream_id(&id)?;
    if state.nodes.find_stream(id).is_none() {
        return Err(stream_not_found(id));
    }
    let closed = state.nodes.close_stream(id);
    tracing::info!(stream = id, closed, "stream close via API");
    Ok(Json(CloseResponse { stream: id, closed }))
}

// ── /streams/{id}/ping ────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct PingResponse {
    pub stream: u64,
    pub rtt_ms: f64,
}

pub async fn handle_stream_ping(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<PingResponse>, ApiError> {
    let id = parse_stream_id(&id)?;
    let rtt = state
        .nodes
        .ping_stream(id)
        .await
        .ok_or_else(|| stream_not_found(id))?
        .map_err(|e| (StatusCode::GATEWAY_TIMEOUT, e.to_string()))?;
    Ok(Json(PingResponse {
        stream: id,
        rtt_ms: rtt.as_secs_f64() * 1000.0,
    }))
}

// ── /streams/{id}/check ───────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct CheckResponse {
    pub stream: u64,
    pub scheduled: bool,
}

pub async fn handle_stream_check(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<CheckResponse>, ApiError> {
    let id = parse_stream_id(&id)?;
    if !state.nodes.check_stream(id) {
        return Err(stream_not_found(id));
    }
    Ok(Json(CheckResponse {
        stream: id,
        scheduled: true,
    }))
}
