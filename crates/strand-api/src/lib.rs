pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

pub use handlers::ApiState;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/status", get(handlers::status::handle_status))
        .route("/streams", get(handlers::streams::handle_streams))
        .route("/streams/{id}/close", post(handlers::streams::handle_stream_close))
        .route("/streams/{id}/ping", post(handlers::streams::handle_stream_ping))
        .route("/streams/{id}/check", post(handlers::streams::handle_stream_check))
        .route("/sessions", get(handlers::sessions::handle_sessions))
        .route("/link/{identity}", post(handlers::link::handle_link))
        .route("/endpoints/{identity}", get(handlers::endpoints::handle_endpoints))
        .route("/daemon/shutdown", post(handlers::status::handle_shutdown))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(cors)
}

pub async fn serve(state: ApiState, port: u16) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "API listening on 127.0.0.1");
    axum::serve(listener, app).await?;
    Ok(())
}
