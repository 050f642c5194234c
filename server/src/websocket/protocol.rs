//! WebSocket message protocol definitions.
//!
//! All messages are JSON-encoded and use snake_case for field names. The
//! frames carry engine transport events: `event` is an engine event name such
//! as `app:main:registry:connect` or `app:main:cart:update`.

use serde::{Deserialize, Serialize};

/// Messages sent from client to server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Deliver an event to the coordinator and every other client.
    Emit {
        event: String,
        #[serde(default)]
        payload: serde_json::Value,
        /// Set when the client waits for an answer
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Answer to an event the server sent with a `request_id`.
    Reply {
        request_id: String,
        #[serde(default)]
        payload: Option<serde_json::Value>,
    },

    /// Keep-alive ping.
    Ping,
}

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// An event emitted by the coordinator or relayed from another client.
    Event {
        event: String,
        payload: serde_json::Value,
        /// Present when the sender waits for a `reply`
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },

    /// Answer to an `emit` carrying a `request_id`.
    Response {
        request_id: String,
        /// `null` when nobody answered
        payload: Option<serde_json::Value>,
    },

    /// Response to ping.
    Pong,

    /// Error message.
    Error {
        /// Error description
        message: String,
        /// Request ID from the original request (if applicable)
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
}

impl ServerMessage {
    /// Create an error message.
    pub fn error(message: impl Into<String>, request_id: Option<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            request_id,
        }
    }

    /// Create an event frame.
    pub fn event(
        event: impl Into<String>,
        payload: serde_json::Value,
        request_id: Option<String>,
    ) -> Self {
        ServerMessage::Event {
            event: event.into(),
            payload,
            request_id,
        }
    }
}
