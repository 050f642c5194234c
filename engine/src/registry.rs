//! Keyed collection of replicas.
//!
//! A registry owns every replica of one `(namespace, store)` pair in this
//! process. At most one live replica exists per name; concurrent connects for
//! the same name serialize on its setup lock and share the result.
//!
//! A coordinator registry answers `connect`, `remove` and `list` requests from
//! clients and evicts replicas no client references anymore. A client
//! registry answers the coordinator's probes.

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::lock::SetupLocks;
use crate::model::ModelRegistry;
use crate::protocol::{events, ConnectRequest, ListRequest, NameRequest, ReplicaListing};
use crate::replica::{Mode, Replica, ReplicaContext, ReplicaId, Role};
use crate::storage::DurableStore;
use crate::transport::{handler, HandlerId, Transport};
use crate::txn::Txn;
use crate::versioner::Versioner;
use crate::PeerId;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;

/// Builder for a [`Registry`].
pub struct RegistryBuilder {
    namespace: String,
    store_name: String,
    role: Role,
    mode: Mode,
    peer: Option<PeerId>,
    config: EngineConfig,
    models: Arc<ModelRegistry>,
    transport: Option<Arc<dyn Transport>>,
    store: Option<Arc<dyn DurableStore>>,
}

impl RegistryBuilder {
    pub fn new(namespace: impl Into<String>, store: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            store_name: store.into(),
            role: Role::Client,
            mode: Mode::Networked,
            peer: None,
            config: EngineConfig::default(),
            models: Arc::new(ModelRegistry::new()),
            transport: None,
            store: None,
        }
    }

    pub fn role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn peer(mut self, peer: impl Into<PeerId>) -> Self {
        self.peer = Some(peer.into());
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn models(mut self, models: Arc<ModelRegistry>) -> Self {
        self.models = models;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Registry {
        let peer = self.peer.unwrap_or_else(|| match self.role {
            Role::Coordinator => "coordinator".to_string(),
            Role::Client => format!("client-{}", uuid::Uuid::new_v4()),
        });
        let (transport, store) = match self.mode {
            Mode::Local => (None, None),
            Mode::Networked => (self.transport, self.store),
        };
        let registry = Registry {
            inner: Arc::new(Inner {
                prefix: format!("{}:{}", self.namespace, self.store_name),
                namespace: self.namespace,
                store_name: self.store_name,
                context: ReplicaContext {
                    peer,
                    role: self.role,
                    mode: self.mode,
                    config: self.config,
                    models: self.models,
                    transport,
                    store,
                },
                replicas: DashMap::new(),
                locks: SetupLocks::new(),
                misses: DashMap::new(),
                subscriptions: Mutex::new(Vec::new()),
                evictor: Mutex::new(None),
            }),
        };
        registry.listen();
        registry
    }
}

struct Inner {
    namespace: String,
    store_name: String,
    prefix: String,
    context: ReplicaContext,
    replicas: DashMap<String, Replica>,
    locks: SetupLocks,
    /// Consecutive unanswered probes per replica name
    misses: DashMap<String, u32>,
    subscriptions: Mutex<Vec<(String, HandlerId)>>,
    evictor: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.evictor.get_mut().take() {
            task.abort();
        }
        if let Some(transport) = &self.context.transport {
            for (event, id) in self.subscriptions.get_mut().drain(..) {
                transport.off(&event, Some(id));
            }
        }
    }
}

#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    pub fn builder(namespace: impl Into<String>, store: impl Into<String>) -> RegistryBuilder {
        RegistryBuilder::new(namespace, store)
    }

    /// `namespace:store`
    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    pub fn role(&self) -> Role {
        self.inner.context.role
    }

    pub fn mode(&self) -> Mode {
        self.inner.context.mode
    }

    pub fn peer(&self) -> &str {
        &self.inner.context.peer
    }

    fn name_or_default(&self, name: Option<&str>) -> String {
        name.unwrap_or(&self.inner.context.config.default_name)
            .to_string()
    }

    fn replica_id(&self, name: &str) -> ReplicaId {
        ReplicaId::new(
            self.inner.namespace.clone(),
            self.inner.store_name.clone(),
            name,
        )
    }

    fn is_networked(&self) -> bool {
        self.inner.context.mode == Mode::Networked
    }

    /// The connected replica with this name, if any.
    pub fn get(&self, name: Option<&str>) -> Option<Replica> {
        let name = self.name_or_default(name);
        self.inner.replicas.get(&name).map(|r| r.value().clone())
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.inner
            .replicas
            .get(name)
            .map(|r| r.value().is_ready())
            .unwrap_or(false)
    }

    /// Names of every connected replica, sorted.
    pub fn connected(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .replicas
            .iter()
            .filter(|r| r.value().is_ready())
            .map(|r| r.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Connect a replica, creating and setting it up on first use.
    pub async fn connect(
        &self,
        name: Option<&str>,
        initial: Option<serde_json::Value>,
        versioner: Option<Arc<Versioner>>,
    ) -> Result<Replica> {
        let name = self.name_or_default(name);
        self.connect_with_hint(&name, initial, versioner, None).await
    }

    async fn connect_with_hint(
        &self,
        name: &str,
        initial: Option<serde_json::Value>,
        versioner: Option<Arc<Versioner>>,
        hint: Option<u64>,
    ) -> Result<Replica> {
        if let Some(replica) = self.ready_replica(name) {
            return Ok(replica);
        }
        let id = self.replica_id(name);
        let key = id.key();
        let setup = self.inner.locks.lock(&key).await;
        if let Some(replica) = self.ready_replica(name) {
            return Ok(replica);
        }

        let result = self.set_up(name, id, initial, versioner, hint).await;
        drop(setup);
        if result.is_err() {
            self.inner.locks.forget(&key);
        }
        result
    }

    async fn set_up(
        &self,
        name: &str,
        id: ReplicaId,
        initial: Option<serde_json::Value>,
        versioner: Option<Arc<Versioner>>,
        hint: Option<u64>,
    ) -> Result<Replica> {
        if self.role() == Role::Client && self.is_networked() {
            self.request_remote_connect(name, initial.clone(), versioner.as_deref())
                .await?;
        }

        let key = id.key();
        let replica = Replica::new(id, self.inner.context.clone());
        replica.setup(initial, versioner, hint).await?;
        self.inner.replicas.insert(name.to_string(), replica.clone());
        self.inner.misses.remove(name);
        tracing::debug!(replica = %key, "connected");
        Ok(replica)
    }

    fn ready_replica(&self, name: &str) -> Option<Replica> {
        self.inner
            .replicas
            .get(name)
            .filter(|r| r.value().is_ready())
            .map(|r| r.value().clone())
    }

    async fn request_remote_connect(
        &self,
        name: &str,
        initial: Option<serde_json::Value>,
        versioner: Option<&Versioner>,
    ) -> Result<()> {
        let Some(transport) = &self.inner.context.transport else {
            return Ok(());
        };
        let request = ConnectRequest {
            name: name.to_string(),
            initial,
            version: versioner.and_then(Versioner::latest),
        };
        let payload =
            serde_json::to_value(&request).map_err(|e| Error::Transport(e.to_string()))?;
        match transport
            .send(&events::registry(&self.inner.prefix, events::CONNECT), payload)
            .await
        {
            Some(serde_json::Value::Bool(true)) => Ok(()),
            Some(answer) => Err(Error::Transport(format!(
                "coordinator refused to connect {name}: {answer}"
            ))),
            None => {
                tracing::debug!(name, "no coordinator answered connect");
                Ok(())
            }
        }
    }

    /// Disconnect a replica. A no-op when it is not connected.
    pub async fn disconnect(&self, name: Option<&str>) {
        let name = self.name_or_default(name);
        let key = self.replica_id(&name).key();
        {
            let _setup = self.inner.locks.lock(&key).await;
            if let Some((_, replica)) = self.inner.replicas.remove(&name) {
                replica.disconnect().await;
            }
            self.inner.misses.remove(&name);
        }
        self.inner.locks.forget(&key);
    }

    /// Number of per-replica setup locks currently allocated.
    pub fn setup_lock_count(&self) -> usize {
        self.inner.locks.len()
    }

    /// Disconnect a replica and delete its durable copy.
    pub async fn remove(&self, name: Option<&str>) -> Result<()> {
        let name = self.name_or_default(name);
        self.disconnect(Some(&name)).await;

        match self.role() {
            Role::Coordinator => {
                if let Some(store) = &self.inner.context.store {
                    store.delete(&self.replica_id(&name).key()).await?;
                }
            }
            Role::Client => {
                if let Some(transport) = &self.inner.context.transport {
                    let payload = json!(NameRequest { name: name.clone() });
                    let event = events::registry(&self.inner.prefix, events::REMOVE);
                    if transport.send(&event, payload).await.is_none() {
                        tracing::debug!(name = %name, "no coordinator answered remove");
                    }
                }
            }
        }
        Ok(())
    }

    /// Every persisted or connected replica, optionally filtered by a name
    /// prefix.
    pub async fn list(&self, prefix: Option<&str>) -> Result<Vec<ReplicaListing>> {
        if self.role() == Role::Client {
            if let Some(transport) = &self.inner.context.transport {
                let request = ListRequest {
                    prefix: prefix.map(str::to_string),
                };
                let event = events::registry(&self.inner.prefix, events::LIST);
                if let Some(answer) = transport.send(&event, json!(request)).await {
                    return serde_json::from_value(answer)
                        .map_err(|e| Error::Transport(e.to_string()));
                }
                tracing::debug!("no coordinator answered list, using local replicas");
            }
        }

        let mut listing: BTreeMap<String, bool> = BTreeMap::new();
        if self.role() == Role::Coordinator {
            if let Some(store) = &self.inner.context.store {
                let key_prefix = format!("{}:", self.inner.prefix);
                for key in store.keys(&key_prefix).await? {
                    if let Some(name) = key.strip_prefix(&key_prefix) {
                        listing.insert(name.to_string(), false);
                    }
                }
            }
        }
        for name in self.connected() {
            listing.insert(name, true);
        }

        Ok(listing
            .into_iter()
            .filter(|(name, _)| prefix.map(|p| name.starts_with(p)).unwrap_or(true))
            .map(|(name, connected)| ReplicaListing { name, connected })
            .collect())
    }

    /// Run `f` as one transaction on a connected replica.
    pub async fn transaction<R>(
        &self,
        name: Option<&str>,
        f: impl FnOnce(&mut Txn<'_>) -> Result<R>,
    ) -> Result<R> {
        let name = self.name_or_default(name);
        let replica = self
            .ready_replica(&name)
            .ok_or_else(|| Error::NotConnected(self.replica_id(&name).key()))?;
        replica.transaction(f).await
    }

    /// Probe every connected replica once and evict the ones that went
    /// unanswered too many times in a row. Returns the evicted names.
    pub async fn evict_idle(&self) -> Vec<String> {
        let Some(transport) = self.inner.context.transport.clone() else {
            return Vec::new();
        };
        if self.role() != Role::Coordinator {
            return Vec::new();
        }

        let event = events::registry(&self.inner.prefix, events::PROBE);
        let threshold = self.inner.context.config.eviction_misses;
        let mut evicted = Vec::new();
        for name in self.connected() {
            let answer = transport
                .send(&event, json!(NameRequest { name: name.clone() }))
                .await;
            if answer == Some(serde_json::Value::Bool(true)) {
                self.inner.misses.remove(&name);
                continue;
            }

            let misses = {
                let mut entry = self.inner.misses.entry(name.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            tracing::debug!(name = %name, misses, "probe unanswered");
            if misses >= threshold {
                tracing::info!(name = %name, "evicting idle replica");
                self.disconnect(Some(&name)).await;
                evicted.push(name);
            }
        }
        evicted
    }

    /// Run [`Registry::evict_idle`] on the configured interval.
    pub fn spawn_eviction(&self) {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let interval = self.inner.context.config.eviction_interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                Registry { inner }.evict_idle().await;
            }
        });
        if let Some(previous) = self.inner.evictor.lock().replace(task) {
            previous.abort();
        }
    }

    /// Stop eviction and disconnect every replica.
    pub async fn shutdown(&self) {
        if let Some(task) = self.inner.evictor.lock().take() {
            task.abort();
        }
        let names: Vec<String> = self.inner.replicas.iter().map(|r| r.key().clone()).collect();
        for name in names {
            self.disconnect(Some(&name)).await;
        }
        tracing::info!(prefix = %self.inner.prefix, "registry shut down");
    }

    fn listen(&self) {
        let Some(transport) = &self.inner.context.transport else {
            return;
        };
        let mut subscriptions = self.inner.subscriptions.lock();
        let prefix = &self.inner.prefix;

        match self.role() {
            Role::Coordinator => {
                let event = events::registry(prefix, events::CONNECT);
                let id = transport.on(&event, self.request_handler(Self::answer_connect));
                subscriptions.push((event, id));

                let event = events::registry(prefix, events::REMOVE);
                let id = transport.on(&event, self.request_handler(Self::answer_remove));
                subscriptions.push((event, id));

                let event = events::registry(prefix, events::LIST);
                let id = transport.on(&event, self.request_handler(Self::answer_list));
                subscriptions.push((event, id));
            }
            Role::Client => {
                let event = events::registry(prefix, events::PROBE);
                let id = transport.on(&event, self.request_handler(Self::answer_probe));
                subscriptions.push((event, id));
            }
        }
    }

    fn request_handler<F, Fut>(&self, answer: F) -> crate::transport::Handler
    where
        F: Fn(Registry, serde_json::Value) -> Fut + Send + Sync + Copy + 'static,
        Fut: std::future::Future<Output = Option<serde_json::Value>> + Send + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        handler(move |payload| {
            let weak = weak.clone();
            async move {
                let inner = weak.upgrade()?;
                answer(Registry { inner }, payload).await
            }
        })
    }

    async fn answer_connect(self, payload: serde_json::Value) -> Option<serde_json::Value> {
        let request: ConnectRequest = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "malformed connect request");
                return Some(json!(false));
            }
        };
        match self
            .connect_with_hint(&request.name, request.initial, None, request.version)
            .await
        {
            Ok(_) => Some(json!(true)),
            Err(e) => {
                tracing::warn!(name = %request.name, error = %e, "remote connect failed");
                Some(json!(false))
            }
        }
    }

    async fn answer_remove(self, payload: serde_json::Value) -> Option<serde_json::Value> {
        let request: NameRequest = serde_json::from_value(payload).ok()?;
        match self.remove(Some(&request.name)).await {
            Ok(()) => Some(json!(true)),
            Err(e) => {
                tracing::warn!(name = %request.name, error = %e, "remote remove failed");
                Some(json!(false))
            }
        }
    }

    async fn answer_list(self, payload: serde_json::Value) -> Option<serde_json::Value> {
        let request: ListRequest = serde_json::from_value(payload).unwrap_or_default();
        match self.list(request.prefix.as_deref()).await {
            Ok(listing) => serde_json::to_value(listing).ok(),
            Err(e) => {
                tracing::warn!(error = %e, "remote list failed");
                None
            }
        }
    }

    async fn answer_probe(self, payload: serde_json::Value) -> Option<serde_json::Value> {
        let request: NameRequest = serde_json::from_value(payload).ok()?;
        // Only affirmative answers count; unconnected clients stay silent.
        self.is_connected(&request.name).then(|| json!(true))
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("prefix", &self.inner.prefix)
            .field("role", &self.inner.context.role)
            .field("mode", &self.inner.context.mode)
            .field("replicas", &self.inner.replicas.len())
            .finish()
    }
}
