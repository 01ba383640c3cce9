//! HTTP API handlers. Exposes the nodes module as JSON.

pub mod endpoints;
pub mod link;
pub mod sessions;
pub mod status;
pub mod streams;

use std::sync::Arc;

use axum::http::StatusCode;

use strand_core::Identity;
use strand_nodes::{Nodes, StreamId};

#[derive(Clone)]
pub struct ApiState {
    pub nodes: Arc<Nodes>,
    /// Fires once to stop the daemon.
    pub shutdown_tx: tokio::sync::broadcast::Sender<()>,
}

// ── Shared helpers ────────────────────────────────────────────────────────────

type ApiError = (StatusCode, String);

/// Parse a hex-encoded node identity.
fn parse_identity(hex_str: &str) -> Result<Identity, ApiError> {
    Identity::from_hex(hex_str).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

fn parse_stream_id(s: &str) -> Result<StreamId, ApiError> {
    s.parse()
        .map_err(|_| (StatusCode::BAD_REQUEST, "invalid stream id".to_string()))
}

fn stream_not_found(id: StreamId) -> ApiError {
    (StatusCode::NOT_FOUND, format!("stream {id} not found"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_must_be_32_hex_bytes() {
        let hex = "ab".repeat(32);
        assert_eq!(parse_identity(&hex).unwrap().to_hex(), hex);
        assert_eq!(parse_identity("abcd").unwrap_err().0, StatusCode::BAD_REQUEST);
        assert_eq!(parse_identity("zz").unwrap_err().0, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn stream_ids_are_decimal() {
        assert_eq!(parse_stream_id("42").unwrap(), 42);
        assert!(parse_stream_id("-1").is_err());
        assert!(parse_stream_id("0x10").is_err());
    }
}
