//! /sessions handler: session inspection.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use strand_nodes::session::SessionInfo;

use super::ApiState;

#[derive(Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionInfo>,
}

pub async fn handle_sessions(State(state): State<ApiState>) -> Json<SessionsResponse> {
    Json(SessionsResponse {
        sessions: state.nodes.sessions(),
    })
}
