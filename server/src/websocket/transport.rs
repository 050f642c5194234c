//! Engine transport over the WebSocket connections.
//!
//! The coordinator registry registers its handlers here. Client `emit`
//! frames are dispatched to those handlers; engine `send` calls become
//! `event` frames to every client, each carrying a `request_id` the client
//! answers with a `reply` (a `null` payload when it has nothing to say).
//! Replica `update` events are fire-and-forget and carry no `request_id`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::{join_all, ready, BoxFuture, FutureExt};
use replica_engine::{Handler, HandlerId, Transport};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{ConnectionManager, ServerMessage};

type Pending = DashMap<String, mpsc::UnboundedSender<Option<serde_json::Value>>>;

const UPDATE_SUFFIX: &str = ":update";

/// Removes a request's pending entry when its future completes or is dropped.
struct PendingEntry {
    pending: Arc<Pending>,
    request_id: String,
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

pub struct WsTransport {
    connections: Arc<ConnectionManager>,
    handlers: DashMap<String, Vec<(HandlerId, Handler)>>,
    next_id: AtomicU64,
    pending: Arc<Pending>,
    timeout: Duration,
}

impl WsTransport {
    pub fn new(connections: Arc<ConnectionManager>, timeout: Duration) -> Self {
        Self {
            connections,
            handlers: DashMap::new(),
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
            timeout,
        }
    }

    /// Run the local handlers of `event` and return the first answer.
    pub async fn dispatch(&self, event: &str, payload: serde_json::Value) -> Option<serde_json::Value> {
        let handlers: Vec<Handler> = match self.handlers.get(event) {
            Some(entry) => entry.value().iter().map(|(_, h)| h.clone()).collect(),
            None => return None,
        };
        let answers = join_all(handlers.iter().map(|h| h(payload.clone()))).await;
        answers.into_iter().flatten().next()
    }

    /// Route a client's `reply` to the request waiting for it.
    pub fn resolve(&self, request_id: &str, payload: Option<serde_json::Value>) {
        match self.pending.get(request_id) {
            Some(waiter) => {
                let _ = waiter.value().send(payload);
            }
            None => tracing::debug!(request_id = %request_id, "Reply for unknown request"),
        }
    }

    #[allow(dead_code)]
    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.get(event).map(|e| e.value().len()).unwrap_or(0)
    }

    #[allow(dead_code)]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

impl Transport for WsTransport {
    fn on(&self, event: &str, handler: Handler) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handlers
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    fn off(&self, event: &str, id: Option<HandlerId>) {
        match id {
            Some(id) => {
                if let Some(mut entry) = self.handlers.get_mut(event) {
                    entry.retain(|(hid, _)| *hid != id);
                }
                self.handlers.remove_if(event, |_, list| list.is_empty());
            }
            None => {
                self.handlers.remove(event);
            }
        }
    }

    fn send(
        &self,
        event: &str,
        payload: serde_json::Value,
    ) -> BoxFuture<'static, Option<serde_json::Value>> {
        if event.ends_with(UPDATE_SUFFIX) {
            let message = ServerMessage::event(event, payload, None);
            let sent = self.connections.broadcast_all(&message);
            tracing::trace!(event, sent, "Broadcast update");
            return ready(None).boxed();
        }

        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.pending.insert(request_id.clone(), tx);
        let entry = PendingEntry {
            pending: self.pending.clone(),
            request_id: request_id.clone(),
        };

        let message = ServerMessage::event(event, payload, Some(request_id));
        let expected = self.connections.broadcast_all(&message);
        let deadline = Instant::now() + self.timeout;

        async move {
            let _entry = entry;
            let mut answer = None;
            let mut replies = 0;
            while replies < expected {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(Some(value))) => {
                        answer = Some(value);
                        break;
                    }
                    Ok(Some(None)) => replies += 1,
                    Ok(None) | Err(_) => break,
                }
            }
            answer
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replica_engine::handler;
    use serde_json::json;

    fn transport(timeout: Duration) -> (Arc<ConnectionManager>, WsTransport) {
        let connections = ConnectionManager::new_shared();
        let transport = WsTransport::new(connections.clone(), timeout);
        (connections, transport)
    }

    #[tokio::test]
    async fn dispatch_runs_local_handlers() {
        let (_, transport) = transport(Duration::from_millis(50));
        transport.on("e", handler(|_| async { None }));
        let id = transport.on("e", handler(|p| async move { Some(json!({"echo": p})) }));

        assert_eq!(transport.dispatch("e", json!(1)).await, Some(json!({"echo": 1})));
        assert_eq!(transport.dispatch("other", json!(1)).await, None);

        transport.off("e", Some(id));
        assert_eq!(transport.handler_count("e"), 1);
        transport.off("e", None);
        assert_eq!(transport.handler_count("e"), 0);
    }

    #[tokio::test]
    async fn send_without_clients_resolves_to_none() {
        let (_, transport) = transport(Duration::from_secs(5));
        assert_eq!(transport.send("e", json!(null)).await, None);
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn send_returns_first_client_answer() {
        let (connections, transport) = transport(Duration::from_secs(5));
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        connections.register("client-1".into(), tx1);
        connections.register("client-2".into(), tx2);

        let answer = transport.send("p:registry:probe", json!({"name": "cart"}));

        let request_id = |msg: ServerMessage| match msg {
            ServerMessage::Event { request_id, .. } => request_id.unwrap(),
            other => panic!("unexpected message: {other:?}"),
        };
        let first = request_id(rx1.try_recv().unwrap());
        let second = request_id(rx2.try_recv().unwrap());
        assert_eq!(first, second);

        transport.resolve(&first, None);
        transport.resolve(&second, Some(json!(true)));
        assert_eq!(answer.await, Some(json!(true)));
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn dropped_request_clears_its_pending_entry() {
        let (connections, transport) = transport(Duration::from_secs(30));
        let (tx, _rx) = mpsc::unbounded_channel();
        connections.register("silent".into(), tx);

        let answer = transport.send("p:registry:list", json!({}));
        assert_eq!(transport.pending_count(), 1);
        drop(answer);
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn updates_are_sent_without_waiting_for_replies() {
        let (connections, transport) = transport(Duration::from_secs(30));
        let (tx, mut rx) = mpsc::unbounded_channel();
        connections.register("client-1".into(), tx);

        let answer = transport.send("p:cart:update", json!({"ops": []}));
        assert_eq!(transport.pending_count(), 0);
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(1), answer).await,
            Ok(None)
        );
        match rx.try_recv().unwrap() {
            ServerMessage::Event {
                event, request_id, ..
            } => {
                assert_eq!(event, "p:cart:update");
                assert!(request_id.is_none());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_gives_up_after_timeout() {
        let (connections, transport) = transport(Duration::from_millis(20));
        let (tx, _rx) = mpsc::unbounded_channel();
        connections.register("silent".into(), tx);

        assert_eq!(transport.send("e", json!(null)).await, None);
        assert_eq!(transport.pending_count(), 0);
    }

    #[tokio::test]
    async fn send_ends_once_every_client_declined() {
        let (connections, transport) = transport(Duration::from_secs(30));
        let (tx, mut rx) = mpsc::unbounded_channel();
        connections.register("client-1".into(), tx);

        let answer = transport.send("e", json!(null));
        if let Some(ServerMessage::Event {
            request_id: Some(id),
            ..
        }) = rx.recv().await
        {
            transport.resolve(&id, None);
        }
        assert_eq!(
            tokio::time::timeout(Duration::from_secs(1), answer).await,
            Ok(None)
        );
    }
}
