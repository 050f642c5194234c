//! A single replica: one root, one document, one transport channel.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──setup──▶ SettingUp ──▶ Ready ──disconnect──▶ Disconnected
//!                              │                                     ▲
//!                              └────────────── failure ──────────────┘
//! ```
//!
//! Replica state sits behind a `parking_lot` mutex that is never held across
//! an `.await`. Transport round-trips and store calls happen with the lock
//! released.

use crate::config::EngineConfig;
use crate::doc::Update;
use crate::error::{Error, Result};
use crate::graph::{Flush, Graph};
use crate::model::ModelRegistry;
use crate::protocol::events;
use crate::snapshot::DocSnapshot;
use crate::storage::DurableStore;
use crate::transport::{handler, HandlerId, Transport};
use crate::tree::{Change, NodeId, Tree};
use crate::txn::Txn;
use crate::value::Origin;
use crate::versioner::{upgrade, Versioner};
use crate::PeerId;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Composite identity of a replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReplicaId {
    pub namespace: String,
    pub store: String,
    pub name: String,
}

impl ReplicaId {
    pub fn new(
        namespace: impl Into<String>,
        store: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            store: store.into(),
            name: name.into(),
        }
    }

    /// `namespace:store`
    pub fn prefix(&self) -> String {
        format!("{}:{}", self.namespace, self.store)
    }

    /// `namespace:store:name`
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.namespace, self.store, self.name)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Never touches the transport or the durable store
    Local,
    Networked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Long-lived peer owning persistence and answering state requests
    Coordinator,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    Uninitialized,
    SettingUp,
    Ready,
    Disconnected,
}

/// All changes made by one transaction.
#[derive(Debug, Clone)]
pub struct ChangeBatch {
    pub origin: Origin,
    pub changes: Arc<Vec<Change>>,
}

/// Everything a replica needs from the registry creating it.
#[derive(Clone)]
pub struct ReplicaContext {
    pub peer: PeerId,
    pub role: Role,
    pub mode: Mode,
    pub config: EngineConfig,
    pub models: Arc<ModelRegistry>,
    pub transport: Option<Arc<dyn Transport>>,
    pub store: Option<Arc<dyn DurableStore>>,
}

impl ReplicaContext {
    fn strict(&self) -> bool {
        self.role == Role::Client && self.config.strict_models
    }
}

impl fmt::Debug for ReplicaContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaContext")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .field("mode", &self.mode)
            .field("transport", &self.transport.is_some())
            .field("store", &self.store.is_some())
            .finish()
    }
}

struct Inner {
    state: ReplicaState,
    graph: Graph,
    /// Remote updates received before the tree was built
    buffered: Vec<Update>,
    buffering: bool,
    /// The document was loaded and may be served to peers
    loaded: bool,
    /// Local document changes are broadcast
    broadcasting: bool,
    version_of_root: Option<u64>,
}

struct Shared {
    id: ReplicaId,
    key: String,
    ctx: ReplicaContext,
    inner: Mutex<Inner>,
    changes: broadcast::Sender<ChangeBatch>,
    save_signal: Arc<Notify>,
    saver: Mutex<Option<JoinHandle<()>>>,
    subscriptions: Mutex<Vec<(String, HandlerId)>>,
}

/// Handle to a replica. Clones share the same replica.
#[derive(Clone)]
pub struct Replica {
    shared: Arc<Shared>,
}

impl Replica {
    pub(crate) fn new(id: ReplicaId, ctx: ReplicaContext) -> Self {
        let graph = Graph::new(ctx.peer.clone(), ctx.models.clone(), ctx.strict());
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let key = id.key();
        Self {
            shared: Arc::new(Shared {
                id,
                key,
                ctx,
                inner: Mutex::new(Inner {
                    state: ReplicaState::Uninitialized,
                    graph,
                    buffered: Vec::new(),
                    buffering: false,
                    loaded: false,
                    broadcasting: false,
                    version_of_root: None,
                }),
                changes,
                save_signal: Arc::new(Notify::new()),
                saver: Mutex::new(None),
                subscriptions: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> &ReplicaId {
        &self.shared.id
    }

    pub fn key(&self) -> &str {
        &self.shared.key
    }

    pub fn name(&self) -> &str {
        &self.shared.id.name
    }

    pub fn mode(&self) -> Mode {
        self.shared.ctx.mode
    }

    pub fn role(&self) -> Role {
        self.shared.ctx.role
    }

    pub fn state(&self) -> ReplicaState {
        self.shared.inner.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ReplicaState::Ready
    }

    pub fn version_of_root(&self) -> Option<u64> {
        self.shared.inner.lock().version_of_root
    }

    /// Watch every transaction applied to this replica.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeBatch> {
        self.shared.changes.subscribe()
    }

    pub fn root(&self) -> Result<NodeId> {
        let inner = self.shared.ready()?;
        inner
            .graph
            .root()
            .ok_or_else(|| Error::NotConnected(self.shared.key.clone()))
    }

    /// Read the tree.
    pub fn read<R>(&self, f: impl FnOnce(&Tree, NodeId) -> R) -> Result<R> {
        let inner = self.shared.ready()?;
        let root = inner
            .graph
            .root()
            .ok_or_else(|| Error::NotConnected(self.shared.key.clone()))?;
        Ok(f(inner.graph.tree(), root))
    }

    /// Plain JSON projection of the root.
    pub fn to_plain(&self) -> Result<serde_json::Value> {
        self.read(|tree, root| tree.to_plain(root))
    }

    /// Walk map keys and list indices from the root.
    pub fn lookup(&self, path: &[&str]) -> Result<Option<serde_json::Value>> {
        self.read(|tree, _| {
            tree.lookup(path).map(|v| match v.as_node() {
                Some(node) => tree.to_plain(node),
                None => v.scalar_json().unwrap_or(serde_json::Value::Null),
            })
        })
    }

    /// The full document as one update.
    pub fn encode_state(&self) -> Result<Update> {
        let inner = self.shared.ready()?;
        Ok(inner.graph.doc().encode_state())
    }

    /// Run `f` as one transaction and broadcast what it wrote.
    ///
    /// Writes made before `f` fails stay applied and are still broadcast.
    pub async fn transaction<R>(&self, f: impl FnOnce(&mut Txn<'_>) -> Result<R>) -> Result<R> {
        let (result, flush) = {
            let mut inner = self.shared.ready()?;
            inner.graph.transact(f)
        };
        self.shared.publish(flush).await;
        result
    }

    /// Integrate an update from a peer.
    pub async fn apply_update(&self, update: Update) -> Result<()> {
        self.shared.receive(update).await
    }

    /// Persist a snapshot now.
    pub async fn save(&self) -> Result<()> {
        self.shared.save_now().await
    }

    /// Bring the replica to `Ready`.
    pub(crate) async fn setup(
        &self,
        initial: Option<serde_json::Value>,
        versioner: Option<Arc<Versioner>>,
        hint: Option<u64>,
    ) -> Result<()> {
        {
            let mut inner = self.shared.inner.lock();
            match inner.state {
                ReplicaState::Uninitialized => inner.state = ReplicaState::SettingUp,
                ReplicaState::Ready => return Ok(()),
                ReplicaState::SettingUp => {
                    return Err(Error::NotConnected(format!("{} is setting up", self.key())))
                }
                ReplicaState::Disconnected => {
                    return Err(Error::Disconnected(self.shared.key.clone()))
                }
            }
        }

        let result = match self.shared.ctx.mode {
            Mode::Local => self.shared.setup_local(initial.as_ref(), versioner.as_deref()),
            Mode::Networked => {
                Shared::setup_networked(&self.shared, initial.as_ref(), versioner.as_deref(), hint)
                    .await
            }
        };

        match result {
            Ok(flushes) => {
                for flush in flushes {
                    self.shared.publish(flush).await;
                }
                tracing::info!(replica = %self.shared.key, mode = ?self.shared.ctx.mode, "replica ready");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(replica = %self.shared.key, error = %e, "replica setup failed");
                self.shared.unsubscribe();
                let mut inner = self.shared.inner.lock();
                inner.graph.teardown();
                inner.state = ReplicaState::Disconnected;
                Err(e)
            }
        }
    }

    /// Tear the replica down. Disconnecting twice is a no-op.
    pub async fn disconnect(&self) {
        let was_ready = {
            let mut inner = self.shared.inner.lock();
            if inner.state == ReplicaState::Disconnected {
                return;
            }
            let was_ready = inner.state == ReplicaState::Ready;
            inner.state = ReplicaState::Disconnected;
            inner.broadcasting = false;
            was_ready
        };

        self.shared.unsubscribe();
        if let Some(saver) = self.shared.saver.lock().take() {
            saver.abort();
        }
        if was_ready && self.shared.persists() {
            if let Err(e) = self.shared.save_now_unchecked().await {
                tracing::warn!(replica = %self.shared.key, error = %e, "final save failed");
            }
        }

        self.shared.inner.lock().graph.teardown();
        tracing::info!(replica = %self.shared.key, "replica disconnected");
    }
}

impl fmt::Debug for Replica {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replica")
            .field("key", &self.shared.key)
            .field("role", &self.shared.ctx.role)
            .field("mode", &self.shared.ctx.mode)
            .field("state", &self.state())
            .finish()
    }
}

impl Shared {
    fn ready(&self) -> Result<parking_lot::MutexGuard<'_, Inner>> {
        let inner = self.inner.lock();
        match inner.state {
            ReplicaState::Ready => Ok(inner),
            ReplicaState::Disconnected => Err(Error::Disconnected(self.key.clone())),
            _ => Err(Error::NotConnected(self.key.clone())),
        }
    }

    fn persists(&self) -> bool {
        self.ctx.role == Role::Coordinator && self.ctx.store.is_some()
    }

    fn setup_local(
        &self,
        initial: Option<&serde_json::Value>,
        versioner: Option<&Versioner>,
    ) -> Result<Vec<Flush>> {
        let mut inner = self.inner.lock();
        inner.graph.mount_root()?;
        let (version, mut flush) = inner.graph.transact(|txn| upgrade(txn, initial, versioner, None));
        inner.version_of_root = version?;
        inner.state = ReplicaState::Ready;
        inner.graph.enable_hooks();
        let (hooks, deferred) = inner.graph.transact(|_| Ok(()));
        hooks?;
        flush.merge(deferred);
        Ok(vec![flush])
    }

    async fn setup_networked(
        self: &Arc<Self>,
        initial: Option<&serde_json::Value>,
        versioner: Option<&Versioner>,
        hint: Option<u64>,
    ) -> Result<Vec<Flush>> {
        // 1. Subscribe, buffering updates until the tree is built.
        self.inner.lock().buffering = true;
        self.subscribe_transport();

        // 2. Load.
        let loaded = match self.ctx.role {
            Role::Coordinator => self.load_snapshot().await?,
            Role::Client => self.request_state().await?,
        };
        let mut flushes = Vec::new();
        let mut inner = self.inner.lock();
        if let Some(update) = loaded {
            inner.graph.load(&update);
        }
        inner.graph.mount_root()?;
        inner.loaded = true;

        // 3. Broadcast local changes from here on.
        inner.broadcasting = true;

        // 4. Replay buffered updates in arrival order.
        inner.buffering = false;
        for update in std::mem::take(&mut inner.buffered) {
            flushes.push(inner.graph.apply_remote(&update)?);
        }

        // 5. Upgrade.
        let (version, flush) = inner.graph.transact(|txn| upgrade(txn, initial, versioner, hint));
        flushes.push(flush);
        inner.version_of_root = version?;

        // 6. Ready, then run the attach hooks deferred so far.
        inner.state = ReplicaState::Ready;
        inner.graph.enable_hooks();
        let (hooks, flush) = inner.graph.transact(|_| Ok(()));
        flushes.push(flush);
        hooks?;
        drop(inner);

        if self.persists() {
            self.spawn_saver();
        }
        Ok(flushes)
    }

    async fn load_snapshot(&self) -> Result<Option<Update>> {
        let Some(store) = &self.ctx.store else {
            return Ok(None);
        };
        match store.get(&self.key).await? {
            Some(value) => {
                let snapshot = DocSnapshot::from_value(value)?;
                tracing::debug!(replica = %self.key, ops = snapshot.op_count(), "loaded snapshot");
                Ok(Some(snapshot.into_update()))
            }
            None => Ok(None),
        }
    }

    async fn request_state(&self) -> Result<Option<Update>> {
        let Some(transport) = &self.ctx.transport else {
            return Ok(None);
        };
        match transport
            .send(&events::state(&self.key), serde_json::Value::Null)
            .await
        {
            Some(state) => Ok(Some(Update::from_json(state)?)),
            None => {
                tracing::debug!(replica = %self.key, "no coordinator answered state request");
                Ok(None)
            }
        }
    }

    fn subscribe_transport(self: &Arc<Self>) {
        let Some(transport) = &self.ctx.transport else {
            return;
        };
        let mut subscriptions = self.subscriptions.lock();

        let weak: Weak<Self> = Arc::downgrade(self);
        let update_event = events::update(&self.key);
        let id = transport.on(
            &update_event,
            handler(move |payload| {
                let weak = weak.clone();
                async move {
                    let shared = weak.upgrade()?;
                    let result = match Update::from_json(payload) {
                        Ok(update) => shared.receive(update).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = result {
                        tracing::warn!(replica = %shared.key, error = %e, "dropping remote update");
                    }
                    None
                }
            }),
        );
        subscriptions.push((update_event, id));

        if self.ctx.role == Role::Coordinator {
            let weak: Weak<Self> = Arc::downgrade(self);
            let state_event = events::state(&self.key);
            let id = transport.on(
                &state_event,
                handler(move |_| {
                    let weak = weak.clone();
                    async move {
                        let shared = weak.upgrade()?;
                        let inner = shared.inner.lock();
                        if !inner.loaded || inner.state == ReplicaState::Disconnected {
                            return None;
                        }
                        let state = inner.graph.doc().encode_state();
                        state.to_json().ok()
                    }
                }),
            );
            subscriptions.push((state_event, id));
        }
    }

    fn unsubscribe(&self) {
        let Some(transport) = &self.ctx.transport else {
            return;
        };
        for (event, id) in self.subscriptions.lock().drain(..) {
            transport.off(&event, Some(id));
        }
    }

    async fn receive(&self, update: Update) -> Result<()> {
        let flush = {
            let mut inner = self.inner.lock();
            if inner.buffering {
                inner.buffered.push(update);
                return Ok(());
            }
            if inner.state != ReplicaState::Ready {
                return Err(Error::NotConnected(self.key.clone()));
            }
            inner.graph.apply_remote(&update)?
        };
        self.publish(flush).await;
        Ok(())
    }

    /// Notify watchers, broadcast local ops and schedule a save.
    async fn publish(&self, flush: Flush) {
        if !flush.remote.is_empty() {
            let _ = self.changes.send(ChangeBatch {
                origin: Origin::Remote,
                changes: Arc::new(flush.remote),
            });
        }
        if !flush.local.is_empty() {
            let _ = self.changes.send(ChangeBatch {
                origin: Origin::Local,
                changes: Arc::new(flush.local),
            });
        }
        if flush.touched && self.persists() {
            self.save_signal.notify_one();
        }

        if flush.update.is_empty() || self.ctx.mode == Mode::Local {
            return;
        }
        if !self.inner.lock().broadcasting {
            return;
        }
        let Some(transport) = &self.ctx.transport else {
            return;
        };
        match flush.update.to_json() {
            Ok(payload) => {
                tracing::trace!(replica = %self.key, ops = flush.update.len(), "broadcasting update");
                transport.send(&events::update(&self.key), payload).await;
            }
            Err(e) => tracing::warn!(replica = %self.key, error = %e, "failed to encode update"),
        }
    }

    fn spawn_saver(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let signal = self.save_signal.clone();
        let debounce = self.ctx.config.save_debounce;
        let task = tokio::spawn(async move {
            loop {
                signal.notified().await;
                loop {
                    tokio::select! {
                        _ = signal.notified() => continue,
                        _ = tokio::time::sleep(debounce) => break,
                    }
                }
                let Some(shared) = weak.upgrade() else {
                    break;
                };
                if let Err(e) = shared.save_now_unchecked().await {
                    tracing::warn!(replica = %shared.key, error = %e, "debounced save failed");
                }
            }
        });
        *self.saver.lock() = Some(task);
    }

    async fn save_now(&self) -> Result<()> {
        drop(self.ready()?);
        self.save_now_unchecked().await
    }

    async fn save_now_unchecked(&self) -> Result<()> {
        let Some(store) = &self.ctx.store else {
            return Ok(());
        };
        let snapshot = {
            let inner = self.inner.lock();
            DocSnapshot::from_doc(inner.graph.doc())
        };
        store.set(&self.key, snapshot.to_value()?).await?;
        tracing::debug!(replica = %self.key, ops = snapshot.op_count(), "saved snapshot");
        Ok(())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(saver) = self.saver.get_mut().take() {
            saver.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::transport::MemoryHub;
    use serde_json::json;

    fn context(role: Role, mode: Mode, hub: &MemoryHub, store: Option<MemoryStore>) -> ReplicaContext {
        ReplicaContext {
            peer: format!("{role:?}").to_lowercase(),
            role,
            mode,
            config: EngineConfig::default(),
            models: Arc::new(ModelRegistry::new()),
            transport: Some(hub.endpoint() as Arc<dyn Transport>),
            store: store.map(|s| Arc::new(s) as Arc<dyn DurableStore>),
        }
    }

    #[test]
    fn replica_keys() {
        let id = ReplicaId::new("app", "main", "cart");
        assert_eq!(id.prefix(), "app:main");
        assert_eq!(id.key(), "app:main:cart");
        assert_eq!(id.to_string(), "app:main:cart");
    }

    #[tokio::test]
    async fn local_replica_is_ready_without_transport() {
        let hub = MemoryHub::new();
        let mut ctx = context(Role::Client, Mode::Local, &hub, None);
        ctx.transport = None;
        let replica = Replica::new(ReplicaId::new("app", "main", "prefs"), ctx);

        replica.setup(Some(json!({"theme": "dark"})), None, None).await.unwrap();
        assert!(replica.is_ready());
        assert_eq!(replica.to_plain().unwrap(), json!({"theme": "dark"}));
        assert_eq!(replica.version_of_root(), None);
    }

    #[tokio::test]
    async fn use_before_setup_and_after_disconnect_fails() {
        let hub = MemoryHub::new();
        let replica = Replica::new(
            ReplicaId::new("app", "main", "cart"),
            context(Role::Coordinator, Mode::Networked, &hub, None),
        );
        assert!(matches!(replica.root(), Err(Error::NotConnected(_))));

        replica.setup(None, None, None).await.unwrap();
        replica.disconnect().await;
        replica.disconnect().await;
        assert_eq!(replica.state(), ReplicaState::Disconnected);
        assert!(matches!(
            replica.transaction(|_| Ok(())).await,
            Err(Error::Disconnected(_))
        ));
    }

    #[tokio::test]
    async fn subscribers_see_one_batch_per_transaction() {
        let hub = MemoryHub::new();
        let replica = Replica::new(
            ReplicaId::new("app", "main", "cart"),
            context(Role::Coordinator, Mode::Networked, &hub, None),
        );
        replica.setup(None, None, None).await.unwrap();
        let mut changes = replica.subscribe();

        replica
            .transaction(|txn| {
                let root = txn.root();
                txn.set(root, "a", 1)?;
                txn.set(root, "b", 2)
            })
            .await
            .unwrap();

        let batch = changes.recv().await.unwrap();
        assert_eq!(batch.origin, Origin::Local);
        assert_eq!(batch.changes.len(), 2);
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn coordinator_persists_on_disconnect() {
        let hub = MemoryHub::new();
        let store = MemoryStore::new();
        let replica = Replica::new(
            ReplicaId::new("app", "main", "cart"),
            context(Role::Coordinator, Mode::Networked, &hub, Some(store.clone())),
        );
        replica.setup(Some(json!({"items": []})), None, None).await.unwrap();
        replica.disconnect().await;

        let saved = store.get("app:main:cart").await.unwrap().unwrap();
        let snapshot = DocSnapshot::from_value(saved).unwrap();
        assert_eq!(snapshot.op_count(), 1);
        assert_eq!(store.write_count(), 1);
    }
}
