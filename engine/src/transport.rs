//! Message transport between peers.
//!
//! The engine only needs request/answer broadcast: `send` delivers a payload
//! to every remote handler registered for the event and resolves to the first
//! answer, or `None` when nobody answered.

use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type HandlerId = u64;

/// Handles one incoming event, optionally answering it.
pub type Handler =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, Option<serde_json::Value>> + Send + Sync>;

/// Wrap an async closure into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<serde_json::Value>> + Send + 'static,
{
    Arc::new(move |payload| f(payload).boxed())
}

pub trait Transport: Send + Sync {
    /// Register a handler for an event.
    fn on(&self, event: &str, handler: Handler) -> HandlerId;

    /// Remove one handler, or every handler of the event when `id` is `None`.
    fn off(&self, event: &str, id: Option<HandlerId>);

    /// Deliver a payload to remote handlers and wait for the first answer.
    fn send(&self, event: &str, payload: serde_json::Value)
        -> BoxFuture<'static, Option<serde_json::Value>>;
}

type Handlers = HashMap<String, Vec<(HandlerId, Handler)>>;

#[derive(Default)]
struct HubInner {
    endpoints: HashMap<u64, Handlers>,
}

/// In-process hub connecting co-located contexts.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubInner>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint. Its sends reach every other endpoint.
    pub fn endpoint(&self) -> Arc<MemoryTransport> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner.lock().endpoints.insert(id, HashMap::new());
        Arc::new(MemoryTransport {
            hub: self.clone(),
            id,
        })
    }

    pub fn endpoint_count(&self) -> usize {
        self.inner.lock().endpoints.len()
    }
}

impl std::fmt::Debug for MemoryHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryHub")
            .field("endpoints", &self.endpoint_count())
            .finish()
    }
}

/// One endpoint of a [`MemoryHub`]. Dropping it detaches its handlers.
pub struct MemoryTransport {
    hub: MemoryHub,
    id: u64,
}

impl MemoryTransport {
    /// Number of handlers this endpoint has for an event.
    pub fn handler_count(&self, event: &str) -> usize {
        self.hub
            .inner
            .lock()
            .endpoints
            .get(&self.id)
            .and_then(|h| h.get(event))
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Transport for MemoryTransport {
    fn on(&self, event: &str, handler: Handler) -> HandlerId {
        let id = self.hub.next_id.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.hub.inner.lock();
        inner
            .endpoints
            .entry(self.id)
            .or_default()
            .entry(event.to_string())
            .or_default()
            .push((id, handler));
        id
    }

    fn off(&self, event: &str, id: Option<HandlerId>) {
        let mut inner = self.hub.inner.lock();
        let Some(handlers) = inner.endpoints.get_mut(&self.id) else {
            return;
        };
        match id {
            Some(id) => {
                if let Some(list) = handlers.get_mut(event) {
                    list.retain(|(h, _)| *h != id);
                    if list.is_empty() {
                        handlers.remove(event);
                    }
                }
            }
            None => {
                handlers.remove(event);
            }
        }
    }

    fn send(
        &self,
        event: &str,
        payload: serde_json::Value,
    ) -> BoxFuture<'static, Option<serde_json::Value>> {
        let targets: Vec<Handler> = {
            let inner = self.hub.inner.lock();
            inner
                .endpoints
                .iter()
                .filter(|(id, _)| **id != self.id)
                .filter_map(|(_, handlers)| handlers.get(event))
                .flat_map(|list| list.iter().map(|(_, h)| h.clone()))
                .collect()
        };
        tracing::trace!(event, receivers = targets.len(), "memory send");

        async move {
            let answers = join_all(targets.into_iter().map(|h| h(payload.clone()))).await;
            answers.into_iter().flatten().next()
        }
        .boxed()
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.hub.inner.lock().endpoints.remove(&self.id);
    }
}
