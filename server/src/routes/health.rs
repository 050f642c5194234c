//! Health check endpoint.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::AppState;

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Registry prefix served by this coordinator
    pub registry: String,
    /// Names of the currently connected replicas
    pub replicas: Vec<String>,
    pub connections: usize,
    pub peers: usize,
}

/// Create health routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/", get(root))
}

/// Health check handler.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        registry: state.registry.prefix().to_string(),
        replicas: state.registry.connected(),
        connections: state.conn_manager.connection_count(),
        peers: state.conn_manager.peer_count(),
    })
}

/// Root handler.
async fn root() -> &'static str {
    "Replica Store Coordinator"
}
