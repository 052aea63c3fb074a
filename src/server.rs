//! Northbound HTTP surface.

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::{rpc, sse, state::AppState};

/// Assemble the gateway router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/mcp", post(rpc::handle_mcp))
        .route("/sse", get(sse::handle_sse))
        .route(sse::MESSAGE_PATH, post(sse::handle_message))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
