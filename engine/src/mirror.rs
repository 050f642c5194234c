//! Node mirror: building and tearing down paired nodes.
//!
//! Every container is created empty, wired (linked to its document
//! container and observed), and only then filled. Filling records no change
//! events, so watchers never see a half-built node; the only signal is the
//! node being queued for its model's attach hook once filled.

use crate::doc::{ContainerId, ContainerKind, DocValue, Item};
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::model::{Model, MODEL_TAG_KEY};
use crate::tree::NodeId;
use crate::value::Value;
use std::sync::Arc;

/// Where a freshly mirrored value lands in the document.
#[derive(Debug, Clone)]
pub(crate) enum Placement {
    Key(ContainerId, String),
    Index(ContainerId, usize),
}

impl Graph {
    /// Build a reactive node (and its subtree) from an existing document
    /// container.
    pub(crate) fn create_from_doc(
        &mut self,
        container: &ContainerId,
        owner: Option<NodeId>,
    ) -> Result<NodeId> {
        let kind = self
            .doc
            .kind(container)
            .ok_or_else(|| Error::NodeNotFound(format!("{container:?}")))?;
        let tag = self.doc.tag(container).map(str::to_string);
        // Remote state is never rejected; unknown tags stay un-hydrated.
        let model = match tag.as_deref() {
            Some(tag) => {
                let model = self.models.resolve(tag, false)?;
                if model.is_none() && self.strict {
                    tracing::warn!(model = tag, "unknown model in document");
                }
                model
            }
            None => None,
        };

        let node = self.wire(owner, kind, container.clone(), tag, model)?;
        match kind {
            ContainerKind::Map => {
                for (key, item) in self.doc.entries(container) {
                    let value = self.value_from_item(item, node)?;
                    self.tree.fill_key(node, &key, value)?;
                }
            }
            ContainerKind::List => {
                for item in self.doc.items(container) {
                    let value = self.value_from_item(item, node)?;
                    self.tree.fill_item(node, value)?;
                }
            }
        }
        self.filled(node);
        Ok(node)
    }

    /// Turn a document item into a slot value, mirroring containers.
    pub(crate) fn value_from_item(&mut self, item: Item, owner: NodeId) -> Result<Value> {
        match item {
            Item::Scalar(json) => Ok(Value::from_scalar(&json)),
            Item::Container(container) => {
                Ok(Value::Node(self.create_from_doc(&container, Some(owner))?))
            }
        }
    }

    /// Mirror a plain JSON value written locally: write it into the
    /// document at `placement` and build the reactive side.
    pub(crate) fn create_from_plain(
        &mut self,
        json: &serde_json::Value,
        owner: NodeId,
        placement: Placement,
    ) -> Result<Value> {
        match json {
            serde_json::Value::Object(fields) => {
                let tag = fields
                    .get(MODEL_TAG_KEY)
                    .and_then(|t| t.as_str())
                    .map(str::to_string);
                let model = self.resolve_model(tag.as_deref())?;
                let id = self.place(placement, DocValue::Map { tag: tag.clone() })?;
                let container = ContainerId::Item(id);

                let node = self.wire(Some(owner), ContainerKind::Map, container.clone(), tag, model)?;
                for (key, value) in fields {
                    if key == MODEL_TAG_KEY {
                        continue;
                    }
                    let child = self.create_from_plain(
                        value,
                        node,
                        Placement::Key(container.clone(), key.clone()),
                    )?;
                    self.tree.fill_key(node, key, child)?;
                }
                self.filled(node);
                Ok(Value::Node(node))
            }
            serde_json::Value::Array(items) => {
                let id = self.place(placement, DocValue::List)?;
                let container = ContainerId::Item(id);

                let node = self.wire(Some(owner), ContainerKind::List, container.clone(), None, None)?;
                for (index, item) in items.iter().enumerate() {
                    let child =
                        self.create_from_plain(item, node, Placement::Index(container.clone(), index))?;
                    self.tree.fill_item(node, child)?;
                }
                self.filled(node);
                Ok(Value::Node(node))
            }
            scalar => {
                self.place(placement, DocValue::scalar(scalar.clone()))?;
                Ok(Value::from_scalar(scalar))
            }
        }
    }

    /// Reject a value before anything is written if any nested model tag is
    /// unknown to a strict registry.
    pub(crate) fn validate_plain(&self, json: &serde_json::Value) -> Result<()> {
        match json {
            serde_json::Value::Object(fields) => {
                if let Some(tag) = fields.get(MODEL_TAG_KEY) {
                    let tag = tag.as_str().ok_or_else(|| {
                        Error::UnsupportedValue(format!("{MODEL_TAG_KEY} must be a string"))
                    })?;
                    self.resolve_model(Some(tag))?;
                }
                fields.values().try_for_each(|v| self.validate_plain(v))
            }
            serde_json::Value::Array(items) => items.iter().try_for_each(|v| self.validate_plain(v)),
            _ => Ok(()),
        }
    }

    fn resolve_model(&self, tag: Option<&str>) -> Result<Option<Arc<dyn Model>>> {
        match tag {
            Some(tag) => self.models.resolve(tag, self.strict),
            None => Ok(None),
        }
    }

    fn place(&mut self, placement: Placement, value: DocValue) -> Result<crate::clock::OpId> {
        match placement {
            Placement::Key(target, key) => self.doc.set(&mut self.outgoing, &target, &key, Some(value)),
            Placement::Index(target, index) => {
                self.doc.insert(&mut self.outgoing, &target, index, value)
            }
        }
    }

    /// Allocate an empty node and link it to its container.
    fn wire(
        &mut self,
        owner: Option<NodeId>,
        kind: ContainerKind,
        container: ContainerId,
        tag: Option<String>,
        model: Option<Arc<dyn Model>>,
    ) -> Result<NodeId> {
        let declared: Vec<&'static str> = model.as_ref().map(|m| m.keys().to_vec()).unwrap_or_default();
        let node = self.tree.alloc(owner, kind, tag, model)?;
        if self.mirrors.len() <= node.index() {
            self.mirrors.resize(node.index() + 1, None);
        }
        self.mirrors[node.index()] = Some(container.clone());
        self.links.insert(container, node);
        if let Some(n) = self.tree.node_mut(node) {
            n.observed = true;
        }
        if kind == ContainerKind::Map {
            for key in declared {
                // The node was just allocated as a map, so this cannot fail.
                let _ = self.tree.fill_key(node, key, Value::Undefined);
            }
        }
        Ok(node)
    }

    fn filled(&mut self, node: NodeId) {
        if self.tree.node(node).map(|n| n.is_hydrated()).unwrap_or(false) {
            self.deferred.push_back(node);
        }
        tracing::trace!(node = %node, "node filled");
    }

    /// Detach a node and its subtree: stop observing it, unlink its
    /// container, run the detach hook, and drop it from the arena.
    ///
    /// Detaching an already detached node is a no-op.
    pub fn detach(&mut self, node: NodeId) {
        let (model, hooked) = match self.tree.node_mut(node) {
            Some(n) if n.attached => {
                n.attached = false;
                n.observed = false;
                (n.model.clone(), n.hooked)
            }
            _ => return,
        };

        if let Some(container) = self.mirrors.get_mut(node.index()).and_then(Option::take) {
            if self.links.get(&container) == Some(&node) {
                self.links.remove(&container);
            }
        }

        if let (Some(model), true) = (model, hooked) {
            model.on_detach(&self.tree, node);
        }

        for child in self.tree.children(node) {
            self.detach(child);
        }
        self.tree.free(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelRegistry;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn graph() -> Graph {
        let mut graph = Graph::new("peer-a", Arc::new(ModelRegistry::new()), true);
        graph.mount_root().unwrap();
        graph
    }

    #[test]
    fn plain_values_round_trip() {
        let mut graph = graph();
        let value = json!({"items": [{"sku": "X", "qty": 2}], "open": true, "note": null});

        let (result, flush) = graph.transact(|txn| {
            let root = txn.root();
            txn.set(root, "cart", value.clone())
        });
        result.unwrap();

        let root = graph.root().unwrap();
        assert_eq!(graph.tree().to_plain(root), json!({"cart": value}));
        assert_eq!(graph.doc().to_plain(&ContainerId::Root), json!({"cart": value}));
        assert!(!flush.update.is_empty());
    }

    #[test]
    fn every_node_has_one_owner() {
        let mut graph = graph();
        let (result, _) = graph.transact(|txn| {
            let root = txn.root();
            txn.set(root, "a", json!({"b": [{"c": {}}, []]}))
        });
        result.unwrap();

        let root = graph.root().unwrap();
        for id in graph.tree().node_ids() {
            let owner = graph.tree().owner(id);
            if id == root {
                assert_eq!(owner, None);
            } else {
                let owner = owner.expect("non-root node without owner");
                let holders = graph
                    .tree()
                    .node_ids()
                    .into_iter()
                    .filter(|n| graph.tree().children(*n).contains(&id))
                    .count();
                assert_eq!(holders, 1);
                assert!(graph.tree().children(owner).contains(&id));
            }
        }
    }

    #[test]
    fn detach_is_idempotent_and_unlinks() {
        let mut graph = graph();
        let (result, _) = graph.transact(|txn| {
            let root = txn.root();
            txn.set(root, "a", json!({"b": {"c": 1}}))
        });
        result.unwrap();

        let root = graph.root().unwrap();
        let a = graph.tree().child(root, "a").unwrap();
        let b = graph.tree().child(a, "b").unwrap();
        let container = graph.mirror_of(b).cloned().unwrap();

        graph.detach(a);
        graph.detach(a);
        assert!(!graph.tree().contains(a));
        assert!(!graph.tree().contains(b));
        assert_eq!(graph.node_of(&container), None);
    }

    struct Counting(Arc<AtomicUsize>, Arc<AtomicUsize>);
    impl Model for Counting {
        fn keys(&self) -> &[&'static str] {
            &["label"]
        }
        fn on_attach(&self, _txn: &mut crate::txn::Txn<'_>, _node: NodeId) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn on_detach(&self, _tree: &crate::tree::Tree, _node: NodeId) {
            self.1.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn model_hooks_fire_once_per_transition() {
        let attached = Arc::new(AtomicUsize::new(0));
        let detached = Arc::new(AtomicUsize::new(0));
        let models = ModelRegistry::new().with(
            "Tag",
            Arc::new(Counting(attached.clone(), detached.clone())),
        );
        let mut graph = Graph::new("peer-a", Arc::new(models), true);
        graph.mount_root().unwrap();
        graph.enable_hooks();

        let (result, _) = graph.transact(|txn| {
            let root = txn.root();
            txn.set(root, "t", json!({"__model": "Tag"}))
        });
        result.unwrap();
        assert_eq!(attached.load(Ordering::SeqCst), 1);

        let root = graph.root().unwrap();
        let t = graph.tree().child(root, "t").unwrap();
        assert_eq!(graph.tree().keys(t), vec!["label"]);

        let (result, _) = graph.transact(|txn| {
            let root = txn.root();
            txn.delete(root, "t")
        });
        result.unwrap();
        graph.detach(t);
        assert_eq!(detached.load(Ordering::SeqCst), 1);
        assert_eq!(attached.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn strict_registry_rejects_unknown_models_before_writing() {
        let mut graph = graph();
        let (result, flush) = graph.transact(|txn| {
            let root = txn.root();
            txn.set(root, "x", json!({"ok": 1, "inner": {"__model": "Missing"}}))
        });
        assert!(matches!(result, Err(Error::UnknownModel(name)) if name == "Missing"));
        assert!(flush.update.is_empty());
        let root = graph.root().unwrap();
        assert!(!graph.tree().has_key(root, "x"));
    }

    #[test]
    fn permissive_registry_keeps_unknown_tags() {
        let mut graph = Graph::new("coordinator", Arc::new(ModelRegistry::new()), false);
        graph.mount_root().unwrap();
        let value = json!({"__model": "Unknown", "n": 1});
        let (result, _) = graph.transact(|txn| {
            let root = txn.root();
            txn.set(root, "x", value.clone())
        });
        result.unwrap();

        let root = graph.root().unwrap();
        let x = graph.tree().child(root, "x").unwrap();
        assert_eq!(graph.tree().model_tag(x), Some("Unknown"));
        assert!(!graph.tree().node(x).unwrap().is_hydrated());
        assert_eq!(graph.tree().to_plain(x), value);
    }
}
