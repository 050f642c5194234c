//! Unit tests for the WebSocket event protocol.

use replica_engine::protocol::events;
use replica_engine::{ConnectRequest, Graph, ModelRegistry, ReplicaListing, Update};
use serde_json::json;
use std::sync::Arc;

/// Mirror of the server's client frames.
#[derive(serde::Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
#[allow(dead_code)]
enum ClientMessage {
    Emit {
        event: String,
        #[serde(default)]
        payload: serde_json::Value,
        #[serde(default)]
        request_id: Option<String>,
    },
    Reply {
        request_id: String,
        #[serde(default)]
        payload: Option<serde_json::Value>,
    },
    Ping,
}

/// Mirror of the server's outgoing frames.
#[derive(serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[allow(dead_code)]
enum ServerMessage {
    Event {
        event: String,
        payload: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
    },
    Response {
        request_id: String,
        payload: Option<serde_json::Value>,
    },
    Pong,
}

#[cfg(test)]
mod websocket_protocol_tests {
    use super::*;

    #[test]
    fn test_connect_emit_deserialization() {
        let json = r#"{
            "type": "emit",
            "event": "app:main:registry:connect",
            "payload": {"name": "cart", "initial": {"items": []}, "version": 2},
            "request_id": "req-001"
        }"#;

        let msg: ClientMessage = serde_json::from_str(json).unwrap();

        match msg {
            ClientMessage::Emit {
                event,
                payload,
                request_id,
            } => {
                assert_eq!(event, events::registry("app:main", events::CONNECT));
                let request: ConnectRequest = serde_json::from_value(payload).unwrap();
                assert_eq!(request.name, "cart");
                assert_eq!(request.initial, Some(json!({"items": []})));
                assert_eq!(request.version, Some(2));
                assert_eq!(request_id, Some("req-001".to_string()));
            }
            _ => panic!("Expected Emit message"),
        }
    }

    #[test]
    fn test_update_emit_without_request_id() {
        let json = r#"{"type": "emit", "event": "app:main:cart:update", "payload": {"ops": []}}"#;

        let msg: ClientMessage = serde_json::from_str(json).unwrap();

        match msg {
            ClientMessage::Emit {
                payload,
                request_id,
                ..
            } => {
                assert!(request_id.is_none());
                assert!(Update::from_json(payload).unwrap().is_empty());
            }
            _ => panic!("Expected Emit message"),
        }
    }

    #[test]
    fn test_probe_reply_deserialization() {
        let json = r#"{"type": "reply", "request_id": "req-9", "payload": true}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Reply { ref request_id, payload: Some(serde_json::Value::Bool(true)) }
                if request_id == "req-9"
        ));

        // A client not holding the replica declines with no payload.
        let json = r#"{"type": "reply", "request_id": "req-9"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, ClientMessage::Reply { payload: None, .. }));
    }

    #[test]
    fn test_list_response_serialization() {
        let listing = vec![
            ReplicaListing {
                name: "cart".into(),
                connected: true,
            },
            ReplicaListing {
                name: "prefs".into(),
                connected: false,
            },
        ];
        let msg = ServerMessage::Response {
            request_id: "req-2".into(),
            payload: Some(serde_json::to_value(&listing).unwrap()),
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"response","request_id":"req-2","payload":[{"name":"cart","connected":true},{"name":"prefs","connected":false}]}"#
        );
    }

    #[test]
    fn test_event_serialization() {
        let msg = ServerMessage::Event {
            event: events::registry("app:main", events::PROBE),
            payload: json!({"name": "cart"}),
            request_id: Some("req-3".into()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"event""#));
        assert!(json.contains(r#""event":"app:main:registry:probe""#));
        assert!(json.contains(r#""request_id":"req-3""#));

        let json = serde_json::to_string(&ServerMessage::Pong).unwrap();
        assert_eq!(json, r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_update_survives_the_wire() {
        let mut sender = Graph::new("client-1", Arc::new(ModelRegistry::new()), true);
        sender.mount_root().unwrap();
        let (result, flush) = sender.transact(|txn| {
            let root = txn.root();
            txn.set(root, "items", json!([{"sku": "X"}]))
        });
        result.unwrap();

        let frame = serde_json::to_string(&ServerMessage::Event {
            event: events::update("app:main:cart"),
            payload: flush.update.to_json().unwrap(),
            request_id: None,
        })
        .unwrap();
        let relayed: serde_json::Value = serde_json::from_str(&frame).unwrap();

        let mut receiver = Graph::new("client-2", Arc::new(ModelRegistry::new()), true);
        receiver.mount_root().unwrap();
        let update = Update::from_json(relayed["payload"].clone()).unwrap();
        receiver.apply_remote(&update).unwrap();

        let root = receiver.root().unwrap();
        assert_eq!(
            receiver.tree().to_plain(root),
            json!({"items": [{"sku": "X"}]})
        );
    }
}
