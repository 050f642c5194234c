//! The reactive tree.
//!
//! Nodes live in an arena indexed by [`NodeId`]. Each node records its
//! owner, so ownership is a tree and no node is shared between two parents.
//! Mutations made inside a transaction are collected and handed out once,
//! when the outermost transaction commits.

use crate::doc::ContainerKind;
use crate::error::{Error, Result};
use crate::model::{Model, MODEL_TAG_KEY};
use crate::value::Value;
use indexmap::IndexMap;
use std::fmt;
use std::sync::Arc;

/// Slot index plus generation of a node in the reactive arena.
///
/// Freed slots are reused with a bumped generation, so an id kept past its
/// node's lifetime never resolves to the slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

impl NodeId {
    pub(crate) fn index(self) -> usize {
        self.index as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.generation == 0 {
            write!(f, "#{}", self.index)
        } else {
            write!(f, "#{}v{}", self.index, self.generation)
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Body {
    Map(IndexMap<String, Value>),
    List(Vec<Value>),
}

/// A reactive map or list.
pub struct Node {
    pub(crate) owner: Option<NodeId>,
    pub(crate) model_tag: Option<String>,
    pub(crate) model: Option<Arc<dyn Model>>,
    pub(crate) body: Body,
    pub(crate) attached: bool,
    /// Local writes on this node are propagated
    pub(crate) observed: bool,
    /// The model's attach hook has run
    pub(crate) hooked: bool,
}

impl Node {
    pub fn owner(&self) -> Option<NodeId> {
        self.owner
    }

    pub fn model_tag(&self) -> Option<&str> {
        self.model_tag.as_deref()
    }

    /// Whether a registered model was found for the tag.
    pub fn is_hydrated(&self) -> bool {
        self.model.is_some()
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn kind(&self) -> ContainerKind {
        match self.body {
            Body::Map(_) => ContainerKind::Map,
            Body::List(_) => ContainerKind::List,
        }
    }

    fn declares(&self, key: &str) -> bool {
        self.model
            .as_ref()
            .map(|m| m.keys().contains(&key))
            .unwrap_or(false)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("owner", &self.owner)
            .field("model_tag", &self.model_tag)
            .field("hydrated", &self.model.is_some())
            .field("body", &self.body)
            .field("attached", &self.attached)
            .finish()
    }
}

/// One mutation observed on a reactive node.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Set {
        node: NodeId,
        key: String,
        old: Option<Value>,
        new: Value,
    },
    Delete {
        node: NodeId,
        key: String,
        old: Value,
    },
    Splice {
        node: NodeId,
        index: usize,
        removed: Vec<Value>,
        inserted: Vec<Value>,
    },
}

impl Change {
    pub fn node(&self) -> NodeId {
        match self {
            Change::Set { node, .. } | Change::Delete { node, .. } | Change::Splice { node, .. } => {
                *node
            }
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Arena of reactive nodes.
#[derive(Debug, Default)]
pub struct Tree {
    slots: Vec<Slot>,
    /// Vacant slot indices, reused before the arena grows
    free: Vec<u32>,
    live: usize,
    root: Option<NodeId>,
    depth: usize,
    batch: Vec<Change>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub(crate) fn set_root(&mut self, root: Option<NodeId>) {
        self.root = root;
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        match self.slots.get(id.index()) {
            Some(slot) if slot.generation == id.generation => slot.node.as_ref(),
            _ => None,
        }
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        match self.slots.get_mut(id.index()) {
            Some(slot) if slot.generation == id.generation => slot.node.as_mut(),
            _ => None,
        }
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.node(id).is_some()
    }

    /// Number of live nodes.
    pub fn node_count(&self) -> usize {
        self.live
    }

    /// Number of slots in the arena, live or vacant.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Ids of every live node.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.node.is_some())
            .map(|(i, slot)| NodeId {
                index: i as u32,
                generation: slot.generation,
            })
            .collect()
    }

    pub(crate) fn alloc(
        &mut self,
        owner: Option<NodeId>,
        kind: ContainerKind,
        model_tag: Option<String>,
        model: Option<Arc<dyn Model>>,
    ) -> Result<NodeId> {
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(self.slots.len()).map_err(|_| Error::ArenaFull)?;
                self.slots.push(Slot::default());
                index
            }
        };
        let body = match kind {
            ContainerKind::Map => Body::Map(IndexMap::new()),
            ContainerKind::List => Body::List(Vec::new()),
        };
        let slot = &mut self.slots[index as usize];
        slot.node = Some(Node {
            owner,
            model_tag,
            model,
            body,
            attached: true,
            observed: false,
            hooked: false,
        });
        self.live += 1;
        Ok(NodeId {
            index,
            generation: slot.generation,
        })
    }

    pub(crate) fn free(&mut self, id: NodeId) -> Option<Node> {
        let slot = self
            .slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation)?;
        let node = slot.node.take()?;
        self.live -= 1;
        // A slot whose generation would wrap is retired instead of reused.
        if let Some(next) = slot.generation.checked_add(1) {
            slot.generation = next;
            self.free.push(id.index);
        }
        if self.root == Some(id) {
            self.root = None;
        }
        Some(node)
    }

    fn require_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.node_mut(id)
            .ok_or_else(|| Error::NodeNotFound(id.to_string()))
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn owner(&self, id: NodeId) -> Option<NodeId> {
        self.node(id)?.owner
    }

    pub fn model_tag(&self, id: NodeId) -> Option<&str> {
        self.node(id)?.model_tag()
    }

    /// Read a map slot.
    pub fn get(&self, id: NodeId, key: &str) -> Option<&Value> {
        match &self.node(id)?.body {
            Body::Map(entries) => entries.get(key),
            Body::List(_) => None,
        }
    }

    /// Read a list item.
    pub fn at(&self, id: NodeId, index: usize) -> Option<&Value> {
        match &self.node(id)?.body {
            Body::List(items) => items.get(index),
            Body::Map(_) => None,
        }
    }

    /// The child node stored under a map key.
    pub fn child(&self, id: NodeId, key: &str) -> Option<NodeId> {
        self.get(id, key)?.as_node()
    }

    pub fn has_key(&self, id: NodeId, key: &str) -> bool {
        self.get(id, key).is_some()
    }

    /// Map keys in insertion order, including declared-but-unset slots.
    pub fn keys(&self, id: NodeId) -> Vec<&str> {
        match self.node(id).map(|n| &n.body) {
            Some(Body::Map(entries)) => entries.keys().map(String::as_str).collect(),
            _ => Vec::new(),
        }
    }

    /// Number of defined map entries or list items.
    pub fn len(&self, id: NodeId) -> usize {
        match self.node(id).map(|n| &n.body) {
            Some(Body::Map(entries)) => entries.values().filter(|v| !v.is_undefined()).count(),
            Some(Body::List(items)) => items.len(),
            None => 0,
        }
    }

    pub fn is_empty(&self, id: NodeId) -> bool {
        self.len(id) == 0
    }

    /// Direct child nodes, in slot order.
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        match self.node(id).map(|n| &n.body) {
            Some(Body::Map(entries)) => entries.values().filter_map(Value::as_node).collect(),
            Some(Body::List(items)) => items.iter().filter_map(Value::as_node).collect(),
            None => Vec::new(),
        }
    }

    /// Follow map keys and list indices from the root.
    pub fn lookup(&self, path: &[&str]) -> Option<&Value> {
        let mut node = self.root?;
        let (last, parents) = path.split_last()?;
        for segment in parents {
            node = self.step(node, segment)?.as_node()?;
        }
        self.step(node, last)
    }

    fn step(&self, node: NodeId, segment: &str) -> Option<&Value> {
        match self.node(node)?.body {
            Body::Map(_) => self.get(node, segment),
            Body::List(_) => self.at(node, segment.parse().ok()?),
        }
    }

    /// A computed value of a model-hydrated node.
    pub fn computed(&self, id: NodeId, name: &str) -> Option<serde_json::Value> {
        let model = self.node(id)?.model.clone()?;
        model.computed(self, id, name)
    }

    /// Plain JSON projection. Undefined map slots are omitted, undefined list
    /// items render as `null`, model tags render as `__model`.
    pub fn to_plain(&self, id: NodeId) -> serde_json::Value {
        let Some(node) = self.node(id) else {
            return serde_json::Value::Null;
        };
        match &node.body {
            Body::Map(entries) => {
                let mut out = serde_json::Map::new();
                if let Some(tag) = &node.model_tag {
                    out.insert(MODEL_TAG_KEY.to_string(), tag.clone().into());
                }
                for (key, value) in entries {
                    if !value.is_undefined() {
                        out.insert(key.clone(), self.value_to_plain(value));
                    }
                }
                serde_json::Value::Object(out)
            }
            Body::List(items) => {
                serde_json::Value::Array(items.iter().map(|v| self.value_to_plain(v)).collect())
            }
        }
    }

    fn value_to_plain(&self, value: &Value) -> serde_json::Value {
        match value {
            Value::Node(child) => self.to_plain(*child),
            other => other.scalar_json().unwrap_or(serde_json::Value::Null),
        }
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub(crate) fn begin(&mut self) {
        self.depth += 1;
    }

    /// Close a transaction. The outermost one hands out every change it saw.
    pub(crate) fn commit(&mut self) -> Vec<Change> {
        self.depth = self.depth.saturating_sub(1);
        if self.depth == 0 {
            std::mem::take(&mut self.batch)
        } else {
            Vec::new()
        }
    }

    fn record(&mut self, change: Change) {
        self.batch.push(change);
    }

    // ------------------------------------------------------------------
    // Filling: used while a node is being built; records no changes.
    // ------------------------------------------------------------------

    pub(crate) fn fill_key(&mut self, id: NodeId, key: &str, value: Value) -> Result<()> {
        match &mut self.require_mut(id)?.body {
            Body::Map(entries) => {
                entries.insert(key.to_string(), value);
                Ok(())
            }
            Body::List(_) => Err(Error::WrongKind {
                node: id.to_string(),
                expected: "map",
            }),
        }
    }

    pub(crate) fn fill_item(&mut self, id: NodeId, value: Value) -> Result<()> {
        match &mut self.require_mut(id)?.body {
            Body::List(items) => {
                items.push(value);
                Ok(())
            }
            Body::Map(_) => Err(Error::WrongKind {
                node: id.to_string(),
                expected: "list",
            }),
        }
    }

    // ------------------------------------------------------------------
    // Mutations: each records one change.
    // ------------------------------------------------------------------

    /// Store a value under a key, returning the previous slot value.
    pub(crate) fn put(&mut self, id: NodeId, key: &str, value: Value) -> Result<Option<Value>> {
        let old = match &mut self.require_mut(id)?.body {
            Body::Map(entries) => entries.insert(key.to_string(), value.clone()),
            Body::List(_) => {
                return Err(Error::WrongKind {
                    node: id.to_string(),
                    expected: "map",
                })
            }
        };
        self.record(Change::Set {
            node: id,
            key: key.to_string(),
            old: old.clone(),
            new: value,
        });
        Ok(old)
    }

    /// Remove a key. Keys declared by the node's model keep an undefined slot.
    pub(crate) fn remove_key(&mut self, id: NodeId, key: &str) -> Result<Option<Value>> {
        let node = self.require_mut(id)?;
        let declared = node.declares(key);
        let old = match &mut node.body {
            Body::Map(entries) if declared => entries
                .insert(key.to_string(), Value::Undefined)
                .filter(|v| !v.is_undefined()),
            Body::Map(entries) => entries.shift_remove(key),
            Body::List(_) => {
                return Err(Error::WrongKind {
                    node: id.to_string(),
                    expected: "map",
                })
            }
        };
        if let Some(old) = &old {
            self.record(Change::Delete {
                node: id,
                key: key.to_string(),
                old: old.clone(),
            });
        }
        Ok(old)
    }

    /// Replace `delete` items at `index` with `inserted`, returning the
    /// removed items.
    pub(crate) fn splice(
        &mut self,
        id: NodeId,
        index: usize,
        delete: usize,
        inserted: Vec<Value>,
    ) -> Result<Vec<Value>> {
        let removed: Vec<Value> = match &mut self.require_mut(id)?.body {
            Body::List(items) => {
                if index > items.len() || index + delete > items.len() {
                    return Err(Error::IndexOutOfRange {
                        index: index + delete,
                        len: items.len(),
                    });
                }
                items
                    .splice(index..index + delete, inserted.iter().cloned())
                    .collect()
            }
            Body::Map(_) => {
                return Err(Error::WrongKind {
                    node: id.to_string(),
                    expected: "list",
                })
            }
        };
        if !removed.is_empty() || !inserted.is_empty() {
            self.record(Change::Splice {
                node: id,
                index,
                removed: removed.clone(),
                inserted,
            });
        }
        Ok(removed)
    }
}
