//! WebSocket endpoint.

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;

use crate::error::{AppError, Result};
use crate::handlers::handle_websocket_connection;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Peer id of the connecting client
    pub peer: Option<String>,
}

/// Create WebSocket routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(ws_handler))
}

/// GET /ws - Upgrade to the event protocol.
async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let peer = match query.peer {
        Some(peer) if peer.trim().is_empty() => {
            return Err(AppError::BadRequest("peer must not be empty".into()))
        }
        Some(peer) => peer,
        None => format!("client-{}", uuid::Uuid::new_v4()),
    };

    Ok(ws.on_upgrade(move |socket| {
        handle_websocket_connection(socket, state.transport, state.conn_manager, peer)
    }))
}
