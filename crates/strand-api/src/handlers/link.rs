//! /link/{identity}: get a stream to a node, linking if needed.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use strand_core::Context;
use strand_nodes::stream::StreamInfo;
use strand_nodes::{LinkError, RetrieveLinkOptions};

use super::{parse_identity, ApiError, ApiState};

const LINK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Deserialize, Default)]
#[serde(default)]
pub struct LinkRequest {
    pub include_networks: Vec<String>,
    pub exclude_networks: Vec<String>,
    pub force_new: bool,
    pub strategy: Option<String>,
}

#[derive(Serialize)]
pub struct LinkResponse {
    pub stream: StreamInfo,
}

pub async fn handle_link(
    State(state): State<ApiState>,
    Path(identity): Path<String>,
    body: Option<Json<LinkRequest>>,
) -> Result<Json<LinkResponse>, ApiError> {
    let target = parse_identity(&identity)?;
    let req = body.map(|Json(r)| r).unwrap_or_default();

    let mut opts = RetrieveLinkOptions {
        include_networks: req.include_networks,
        exclude_networks: req.exclude_networks,
        strategy: req.strategy,
        ..RetrieveLinkOptions::default()
    };
    if req.force_new {
        opts = opts.force_new();
    }

    let (ctx, _cancel) = Context::background().with_timeout(LINK_TIMEOUT);
    let stream = state
        .nodes
        .retrieve_link(&ctx, target, opts)
        .await
        .map_err(|e| (link_status(&e), e.to_string()))?;

    tracing::info!(target = %target.short(), stream = stream.id(), "link retrieved via API");
    Ok(Json(LinkResponse { stream: stream.info() }))
}

fn link_status(err: &LinkError) -> StatusCode {
    match err {
        LinkError::SelfLink => StatusCode::BAD_REQUEST,
        LinkError::NoEndpoints(_) => StatusCode::NOT_FOUND,
        LinkError::Context(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    }
}
