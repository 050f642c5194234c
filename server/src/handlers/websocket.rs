//! WebSocket handler for the coordinator.
//!
//! Handles WebSocket connections, relays client events to the other clients
//! and dispatches them to the coordinator registry.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::websocket::{ClientMessage, ConnectionManager, ServerMessage, WsTransport};

/// Handle an established WebSocket connection.
///
/// This function:
/// 1. Registers the connection with the manager
/// 2. Spawns a task to forward outgoing messages
/// 3. Processes incoming messages in a loop
/// 4. Cleans up on disconnect
pub async fn handle_websocket_connection(
    socket: WebSocket,
    transport: Arc<WsTransport>,
    conn_manager: Arc<ConnectionManager>,
    peer: String,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let conn_id = conn_manager.register(peer.clone(), tx);

    tracing::info!(conn_id = %conn_id, peer = %peer, "WebSocket client connected");

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize WebSocket message: {}", e);
                }
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                if let Some(response) = process_message(&text, &transport, &conn_manager, &conn_id)
                {
                    conn_manager.send_to(&conn_id, response);
                }
            }
            Ok(Message::Binary(_)) => {
                tracing::warn!("Binary messages not supported");
            }
            Ok(Message::Ping(data)) => {
                tracing::trace!("Received ping: {} bytes", data.len());
            }
            Ok(Message::Pong(_)) => {
                tracing::trace!("Received pong");
            }
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    conn_manager.unregister(&conn_id);
    send_task.abort();

    tracing::info!(
        conn_id = %conn_id,
        peer = %peer,
        active_connections = conn_manager.connection_count(),
        "WebSocket client disconnected"
    );
}

/// Process a client message, returning an immediate response if any.
///
/// Emitted events run on their own task: their handlers may wait on replies
/// that only this read loop delivers.
fn process_message(
    text: &str,
    transport: &Arc<WsTransport>,
    conn_manager: &Arc<ConnectionManager>,
    conn_id: &str,
) -> Option<ServerMessage> {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            return Some(ServerMessage::error(
                format!("Invalid message format: {}", e),
                None,
            ));
        }
    };

    match client_msg {
        ClientMessage::Emit {
            event,
            payload,
            request_id,
        } => {
            let relay = ServerMessage::event(event.clone(), payload.clone(), None);
            let relayed = conn_manager.broadcast_except(conn_id, &relay);
            tracing::trace!(event = %event, relayed, "Client event");

            let transport = transport.clone();
            let conn_manager = conn_manager.clone();
            let conn_id = conn_id.to_string();
            tokio::spawn(async move {
                let answer = transport.dispatch(&event, payload).await;
                if let Some(request_id) = request_id {
                    conn_manager.send_to(
                        &conn_id,
                        ServerMessage::Response {
                            request_id,
                            payload: answer,
                        },
                    );
                }
            });
            None
        }

        ClientMessage::Reply {
            request_id,
            payload,
        } => {
            transport.resolve(&request_id, payload);
            None
        }

        ClientMessage::Ping => Some(ServerMessage::Pong),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replica_engine::{handler, Transport};
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> (Arc<WsTransport>, Arc<ConnectionManager>) {
        let conn_manager = ConnectionManager::new_shared();
        let transport = Arc::new(WsTransport::new(
            conn_manager.clone(),
            Duration::from_secs(5),
        ));
        (transport, conn_manager)
    }

    #[tokio::test]
    async fn emit_is_relayed_and_answered() {
        let (transport, conn_manager) = setup();
        transport.on("p:registry:list", handler(|_| async { Some(json!([])) }));

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let sender = conn_manager.register("client-1".into(), tx1);
        conn_manager.register("client-2".into(), tx2);

        let text = r#"{"type":"emit","event":"p:registry:list","payload":{},"request_id":"r1"}"#;
        assert!(process_message(text, &transport, &conn_manager, &sender).is_none());

        match rx2.recv().await {
            Some(ServerMessage::Event {
                event, request_id, ..
            }) => {
                assert_eq!(event, "p:registry:list");
                assert!(request_id.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
        match rx1.recv().await {
            Some(ServerMessage::Response {
                request_id,
                payload,
            }) => {
                assert_eq!(request_id, "r1");
                assert_eq!(payload, Some(json!([])));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_and_ping_messages() {
        let (transport, conn_manager) = setup();
        let reply = process_message("not json", &transport, &conn_manager, "c");
        assert!(matches!(reply, Some(ServerMessage::Error { .. })));

        let reply = process_message(r#"{"type":"ping"}"#, &transport, &conn_manager, "c");
        assert!(matches!(reply, Some(ServerMessage::Pong)));
    }
}
