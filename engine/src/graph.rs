//! The mirrored pair of a document and a reactive tree.
//!
//! Reactive nodes and their document containers form two parallel arenas
//! indexed by the same [`NodeId`]: `tree` holds the nodes, `mirrors` holds
//! each node's container, and `links` maps a container back to its node so
//! document events can find the node they address.

use crate::doc::{ContainerId, Doc, Update};
use crate::error::{Error, Result};
use crate::model::ModelRegistry;
use crate::tree::{Change, NodeId, Tree};
use crate::txn::Txn;
use crate::PeerId;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Everything one transaction left behind for its replica to publish.
#[derive(Debug, Default)]
pub struct Flush {
    /// Changes applied from a remote update
    pub remote: Vec<Change>,
    /// Changes made by local writes (including model attach hooks)
    pub local: Vec<Change>,
    /// Local document operations to broadcast
    pub update: Update,
    /// The document changed and should be persisted
    pub touched: bool,
}

impl Flush {
    pub(crate) fn merge(&mut self, other: Flush) {
        self.remote.extend(other.remote);
        self.local.extend(other.local);
        self.update.ops.extend(other.update.ops);
        self.touched |= other.touched;
    }
}

pub struct Graph {
    pub(crate) doc: Doc,
    pub(crate) tree: Tree,
    pub(crate) mirrors: Vec<Option<ContainerId>>,
    pub(crate) links: HashMap<ContainerId, NodeId>,
    pub(crate) models: Arc<ModelRegistry>,
    pub(crate) strict: bool,
    pub(crate) guard: Arc<AtomicBool>,
    /// Local ops of the open document transaction
    pub(crate) outgoing: Update,
    /// Model nodes waiting for their attach hook, in creation order
    pub(crate) deferred: VecDeque<NodeId>,
    pub(crate) hooks_enabled: bool,
    pub(crate) dirty: bool,
}

impl Graph {
    pub fn new(peer: impl Into<PeerId>, models: Arc<ModelRegistry>, strict: bool) -> Self {
        Self {
            doc: Doc::new(peer),
            tree: Tree::new(),
            mirrors: Vec::new(),
            links: HashMap::new(),
            models,
            strict,
            guard: Arc::new(AtomicBool::new(false)),
            outgoing: Update::default(),
            deferred: VecDeque::new(),
            hooks_enabled: false,
            dirty: false,
        }
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn root(&self) -> Option<NodeId> {
        self.tree.root()
    }

    /// The document container paired with a node.
    pub fn mirror_of(&self, node: NodeId) -> Option<&ContainerId> {
        if !self.tree.contains(node) {
            return None;
        }
        self.mirrors.get(node.index()).and_then(Option::as_ref)
    }

    /// The node paired with a document container.
    pub fn node_of(&self, container: &ContainerId) -> Option<NodeId> {
        self.links.get(container).copied()
    }

    pub(crate) fn applying_remote(&self) -> bool {
        self.guard.load(Ordering::SeqCst)
    }

    /// Integrate stored or received state into the document without
    /// touching the tree. Used before the root is mounted.
    pub fn load(&mut self, update: &Update) {
        let applied = self.doc.apply(update);
        tracing::debug!(ops = applied.integrated, "loaded document state");
    }

    /// Build the root node from the document root.
    pub fn mount_root(&mut self) -> Result<NodeId> {
        if let Some(root) = self.tree.root() {
            return Ok(root);
        }
        let root = self.create_from_doc(&ContainerId::Root, None)?;
        self.tree.set_root(Some(root));
        Ok(root)
    }

    /// Allow model attach hooks to run; queued ones run on the next flush.
    pub fn enable_hooks(&mut self) {
        self.hooks_enabled = true;
    }

    /// Run `f` as one local transaction.
    ///
    /// The returned [`Flush`] is meaningful even when `f` fails: writes made
    /// before the failure are already applied and must still be published.
    pub fn transact<R>(&mut self, f: impl FnOnce(&mut Txn<'_>) -> Result<R>) -> (Result<R>, Flush) {
        let Some(root) = self.tree.root() else {
            return (
                Err(Error::NotConnected("root not mounted".into())),
                Flush::default(),
            );
        };
        self.tree.begin();
        let result = f(&mut Txn::new(self, root));
        let result = match result {
            Ok(value) => self.run_deferred().map(|_| value),
            Err(e) => Err(e),
        };
        let local = self.tree.commit();
        (result, self.take_flush(Vec::new(), local))
    }

    /// Apply an update from a peer.
    pub fn apply_remote(&mut self, update: &Update) -> Result<Flush> {
        let applied = self.doc.apply(update);
        if applied.integrated == 0 {
            return Ok(Flush::default());
        }

        self.tree.begin();
        let result = self.replay(applied.events);
        let remote = self.tree.commit();
        result?;

        let mut flush = self.take_flush(remote, Vec::new());
        flush.touched = true;
        if self.hooks_enabled && !self.deferred.is_empty() {
            let (result, hooks) = self.transact(|_| Ok(()));
            flush.merge(hooks);
            result?;
        }
        Ok(flush)
    }

    fn take_flush(&mut self, remote: Vec<Change>, local: Vec<Change>) -> Flush {
        let update = std::mem::take(&mut self.outgoing);
        let touched = std::mem::take(&mut self.dirty) || !update.is_empty();
        Flush {
            remote,
            local,
            update,
            touched,
        }
    }

    /// Run queued attach hooks, including ones queued by earlier hooks.
    pub(crate) fn run_deferred(&mut self) -> Result<()> {
        if !self.hooks_enabled {
            return Ok(());
        }
        let Some(root) = self.tree.root() else {
            return Ok(());
        };
        while let Some(node) = self.deferred.pop_front() {
            let model = match self.tree.node_mut(node) {
                Some(n) if n.attached && !n.hooked => {
                    n.hooked = true;
                    n.model.clone()
                }
                _ => None,
            };
            if let Some(model) = model {
                model.on_attach(&mut Txn::new(self, root), node)?;
            }
        }
        Ok(())
    }

    /// Detach the whole tree and drop the document state.
    pub fn teardown(&mut self) {
        if let Some(root) = self.tree.root() {
            self.detach(root);
        }
        let peer = self.doc.node_id().to_string();
        self.doc = Doc::new(peer);
        self.mirrors.clear();
        self.links.clear();
        self.deferred.clear();
        self.outgoing = Update::default();
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("peer", &self.doc.node_id())
            .field("nodes", &self.tree.node_count())
            .field("links", &self.links.len())
            .field("strict", &self.strict)
            .finish()
    }
}
