//! /endpoints/{identity}: resolved endpoints of a node.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use strand_core::Context;

use super::{parse_identity, ApiError, ApiState};

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
pub struct EndpointInfo {
    pub network: String,
    pub address: String,
}

#[derive(Serialize)]
pub struct EndpointsResponse {
    pub identity: String,
    pub endpoints: Vec<EndpointInfo>,
}

pub async fn handle_endpoints(
    State(state): State<ApiState>,
    Path(identity): Path<String>,
) -> Result<Json<EndpointsResponse>, ApiError> {
    let target = parse_identity(&identity)?;
    let (ctx, _cancel) = Context::background().with_timeout(RESOLVE_TIMEOUT);
    let endpoints = state
        .nodes
        .resolve_endpoints(&ctx, &target)
        .await
        .map_err(|e| (StatusCode::BAD_GATEWAY, e.to_string()))?
        .into_iter()
        .map(|e| EndpointInfo {
            network: e.network().to_string(),
            address: e.address().to_string(),
        })
        .collect();

    Ok(Json(EndpointsResponse {
        identity: target.to_hex(),
        endpoints,
    }))
}
