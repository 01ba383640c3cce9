//! /status and /daemon/shutdown.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use strand_nodes::NodesStatus;

use super::ApiState;

pub async fn handle_status(State(state): State<ApiState>) -> Json<NodesStatus> {
    Json(state.nodes.status())
}

#[derive(Serialize)]
pub struct ShutdownResponse {
    pub shutting_down: bool,
}

pub async fn handle_shutdown(State(state): State<ApiState>) -> Json<ShutdownResponse> {
    tracing::info!("shutdown requested via API");
    let shutting_down = state.shutdown_tx.send(()).is_ok();
    Json(ShutdownResponse { shutting_down })
}
