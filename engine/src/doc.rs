//! The replicated document.
//!
//! A document is a tree of containers. Maps hold one last-writer-wins
//! register per key; lists are an RGA sequence. Every operation carries a
//! unique [`OpId`], so applying an update twice is a no-op and updates from
//! different peers merge in any order.
//!
//! Containers are identified by the stamp of the operation that placed
//! them, except the root map which always exists.
//!
//! Operations whose target container or list anchor has not arrived yet are
//! parked and retried after every successful application.

use crate::clock::{LogicalClock, OpId};
use crate::error::{Error, Result};
use crate::model::MODEL_TAG_KEY;
use crate::PeerId;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Identity of a container inside a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContainerId {
    Root,
    Item(OpId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    Map,
    List,
}

/// The value written by a `set` or `insert` operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DocValue {
    Scalar {
        value: serde_json::Value,
    },
    /// Places a new map container, optionally model-tagged
    Map {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tag: Option<String>,
    },
    /// Places a new list container
    List,
}

impl DocValue {
    pub fn scalar(value: serde_json::Value) -> Self {
        DocValue::Scalar { value }
    }

    fn resolve(&self, id: &OpId) -> Item {
        match self {
            DocValue::Scalar { value } => Item::Scalar(value.clone()),
            DocValue::Map { .. } | DocValue::List => Item::Container(ContainerId::Item(id.clone())),
        }
    }
}

/// A readable value in the document: a scalar or a nested container.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Scalar(serde_json::Value),
    Container(ContainerId),
}

/// One document operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Op {
    /// Write (or delete, when `value` is absent) a map key
    Set {
        id: OpId,
        target: ContainerId,
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<DocValue>,
    },
    /// Insert a list element to the right of `after` (or at the head)
    Insert {
        id: OpId,
        target: ContainerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<OpId>,
        value: DocValue,
    },
    /// Tombstone the list element inserted by `elem`
    Remove {
        id: OpId,
        target: ContainerId,
        elem: OpId,
    },
}

impl Op {
    pub fn id(&self) -> &OpId {
        match self {
            Op::Set { id, .. } | Op::Insert { id, .. } | Op::Remove { id, .. } => id,
        }
    }

    pub fn target(&self) -> &ContainerId {
        match self {
            Op::Set { target, .. } | Op::Insert { target, .. } | Op::Remove { target, .. } => {
                target
            }
        }
    }
}

/// A batch of operations exchanged between peers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub ops: Vec<Op>,
}

impl Update {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| Error::InvalidUpdate(e.to_string()))
    }

    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::InvalidUpdate(e.to_string()))
    }
}

/// A change observed while applying a remote update.
///
/// List indices are visible positions, each relative to the list state left
/// by the previous event on the same container.
#[derive(Debug, Clone, PartialEq)]
pub enum DocEvent {
    MapChanged {
        target: ContainerId,
        key: String,
        old: Option<Item>,
        new: Option<Item>,
    },
    ListInserted {
        target: ContainerId,
        index: usize,
        item: Item,
    },
    ListRemoved {
        target: ContainerId,
        index: usize,
        item: Item,
    },
}

impl DocEvent {
    pub fn target(&self) -> &ContainerId {
        match self {
            DocEvent::MapChanged { target, .. }
            | DocEvent::ListInserted { target, .. }
            | DocEvent::ListRemoved { target, .. } => target,
        }
    }
}

/// Result of applying an update.
#[derive(Debug, Default)]
pub struct Applied {
    /// Events for containers that existed before the update
    pub events: Vec<DocEvent>,
    /// Number of operations integrated (duplicates excluded)
    pub integrated: usize,
}

#[derive(Debug, Clone)]
struct MapEntry {
    id: OpId,
    value: Option<DocValue>,
}

#[derive(Debug, Clone)]
struct ListElem {
    id: OpId,
    value: DocValue,
    deleted: bool,
}

#[derive(Debug, Clone)]
enum Body {
    Map(IndexMap<String, MapEntry>),
    List(Vec<ListElem>),
}

#[derive(Debug, Clone)]
struct Container {
    tag: Option<String>,
    body: Body,
}

impl Container {
    fn from_value(value: &DocValue) -> Option<Self> {
        match value {
            DocValue::Scalar { .. } => None,
            DocValue::Map { tag } => Some(Container {
                tag: tag.clone(),
                body: Body::Map(IndexMap::new()),
            }),
            DocValue::List => Some(Container {
                tag: None,
                body: Body::List(Vec::new()),
            }),
        }
    }
}

enum Integration {
    Applied,
    Duplicate,
    Parked,
}

/// A replicated JSON-like document.
#[derive(Debug, Clone)]
pub struct Doc {
    clock: LogicalClock,
    containers: HashMap<ContainerId, Container>,
    seen: HashSet<OpId>,
    log: Vec<Op>,
    parked: Vec<Op>,
}

impl Doc {
    /// Create an empty document holding only the root map.
    pub fn new(node_id: impl Into<PeerId>) -> Self {
        let mut containers = HashMap::new();
        containers.insert(
            ContainerId::Root,
            Container {
                tag: None,
                body: Body::Map(IndexMap::new()),
            },
        );
        Self {
            clock: LogicalClock::new(node_id),
            containers,
            seen: HashSet::new(),
            log: Vec::new(),
            parked: Vec::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.clock.node_id
    }

    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    pub fn kind(&self, container: &ContainerId) -> Option<ContainerKind> {
        self.containers.get(container).map(|c| match c.body {
            Body::Map(_) => ContainerKind::Map,
            Body::List(_) => ContainerKind::List,
        })
    }

    pub fn tag(&self, container: &ContainerId) -> Option<&str> {
        self.containers.get(container)?.tag.as_deref()
    }

    /// Read a map key.
    pub fn get(&self, container: &ContainerId, key: &str) -> Option<Item> {
        match &self.containers.get(container)?.body {
            Body::Map(entries) => {
                let entry = entries.get(key)?;
                entry.value.as_ref().map(|v| v.resolve(&entry.id))
            }
            Body::List(_) => None,
        }
    }

    /// Visible map entries in first-write order.
    pub fn entries(&self, container: &ContainerId) -> Vec<(String, Item)> {
        match self.containers.get(container).map(|c| &c.body) {
            Some(Body::Map(entries)) => entries
                .iter()
                .filter_map(|(k, e)| e.value.as_ref().map(|v| (k.clone(), v.resolve(&e.id))))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Visible list items in document order.
    pub fn items(&self, container: &ContainerId) -> Vec<Item> {
        match self.containers.get(container).map(|c| &c.body) {
            Some(Body::List(elems)) => elems
                .iter()
                .filter(|e| !e.deleted)
                .map(|e| e.value.resolve(&e.id))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn len(&self, container: &ContainerId) -> usize {
        match self.containers.get(container).map(|c| &c.body) {
            Some(Body::Map(entries)) => entries.values().filter(|e| e.value.is_some()).count(),
            Some(Body::List(elems)) => elems.iter().filter(|e| !e.deleted).count(),
            None => 0,
        }
    }

    /// Operations waiting for a missing dependency.
    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    /// Plain JSON projection of a container; model tags render as `__model`.
    pub fn to_plain(&self, container: &ContainerId) -> serde_json::Value {
        let item_json = |item: Item| match item {
            Item::Scalar(v) => v,
            Item::Container(c) => self.to_plain(&c),
        };
        match self.kind(container) {
            Some(ContainerKind::Map) => {
                let mut out = serde_json::Map::new();
                if let Some(tag) = self.tag(container) {
                    out.insert(MODEL_TAG_KEY.to_string(), tag.into());
                }
                for (key, item) in self.entries(container) {
                    out.insert(key, item_json(item));
                }
                serde_json::Value::Object(out)
            }
            Some(ContainerKind::List) => {
                serde_json::Value::Array(self.items(container).into_iter().map(item_json).collect())
            }
            None => serde_json::Value::Null,
        }
    }

    /// Every integrated and parked operation, in application order.
    ///
    /// Applying it to an empty document reproduces this document's state.
    pub fn encode_state(&self) -> Update {
        let mut ops = self.log.clone();
        ops.extend(self.parked.iter().cloned());
        Update { ops }
    }

    // ------------------------------------------------------------------
    // Local writes. Each one integrates immediately and is appended to `out`.
    // ------------------------------------------------------------------

    /// Write or delete (`value = None`) a map key.
    pub fn set(
        &mut self,
        out: &mut Update,
        target: &ContainerId,
        key: &str,
        value: Option<DocValue>,
    ) -> Result<OpId> {
        self.expect_kind(target, ContainerKind::Map)?;
        let id = self.clock.tick();
        let op = Op::Set {
            id: id.clone(),
            target: target.clone(),
            key: key.to_string(),
            value,
        };
        self.integrate_local(out, op);
        Ok(id)
    }

    /// Insert at a visible list position.
    pub fn insert(
        &mut self,
        out: &mut Update,
        target: &ContainerId,
        index: usize,
        value: DocValue,
    ) -> Result<OpId> {
        self.expect_kind(target, ContainerKind::List)?;
        let after = if index == 0 {
            None
        } else {
            Some(self.visible_id(target, index - 1)?)
        };
        let id = self.clock.tick();
        let op = Op::Insert {
            id: id.clone(),
            target: target.clone(),
            after,
            value,
        };
        self.integrate_local(out, op);
        Ok(id)
    }

    /// Remove the element at a visible list position.
    pub fn remove(&mut self, out: &mut Update, target: &ContainerId, index: usize) -> Result<()> {
        self.expect_kind(target, ContainerKind::List)?;
        let elem = self.visible_id(target, index)?;
        let id = self.clock.tick();
        let op = Op::Remove {
            id,
            target: target.clone(),
            elem,
        };
        self.integrate_local(out, op);
        Ok(())
    }

    fn expect_kind(&self, target: &ContainerId, kind: ContainerKind) -> Result<()> {
        match self.kind(target) {
            Some(k) if k == kind => Ok(()),
            Some(_) => Err(Error::WrongKind {
                node: format!("{target:?}"),
                expected: match kind {
                    ContainerKind::Map => "map",
                    ContainerKind::List => "list",
                },
            }),
            None => Err(Error::NodeNotFound(format!("{target:?}"))),
        }
    }

    fn visible_id(&self, target: &ContainerId, index: usize) -> Result<OpId> {
        let elems = match self.containers.get(target).map(|c| &c.body) {
            Some(Body::List(elems)) => elems,
            _ => return Err(Error::NodeNotFound(format!("{target:?}"))),
        };
        let len = elems.iter().filter(|e| !e.deleted).count();
        elems
            .iter()
            .filter(|e| !e.deleted)
            .nth(index)
            .map(|e| e.id.clone())
            .ok_or(Error::IndexOutOfRange { index, len })
    }

    fn integrate_local(&mut self, out: &mut Update, op: Op) {
        // Local ops never park: the target was checked and the anchor is visible.
        let _ = self.integrate(&op, &mut Vec::new());
        out.ops.push(op);
    }

    // ------------------------------------------------------------------
    // Remote application
    // ------------------------------------------------------------------

    /// Apply an update received from a peer (or loaded from storage).
    pub fn apply(&mut self, update: &Update) -> Applied {
        let mut applied = Applied::default();
        let mut created = HashSet::new();
        let mut events = Vec::new();

        for op in &update.ops {
            match self.integrate(op, &mut events) {
                Integration::Applied => {
                    applied.integrated += 1;
                    Self::note_created(op, &mut created);
                }
                Integration::Duplicate => {}
                Integration::Parked => {
                    if !self.parked.iter().any(|p| p.id() == op.id()) {
                        self.parked.push(op.clone());
                    }
                }
            }
        }

        // Retry parked ops until no more progress is made.
        loop {
            let mut progressed = false;
            let parked = std::mem::take(&mut self.parked);
            for op in parked {
                match self.integrate(&op, &mut events) {
                    Integration::Applied => {
                        progressed = true;
                        applied.integrated += 1;
                        Self::note_created(&op, &mut created);
                    }
                    Integration::Duplicate => {}
                    Integration::Parked => self.parked.push(op),
                }
            }
            if !progressed {
                break;
            }
        }

        // Containers created by this update are read whole by whoever mirrors
        // them, so their own events must not be replayed on top.
        applied.events = events
            .into_iter()
            .filter(|e| !created.contains(e.target()))
            .collect();
        applied
    }

    fn note_created(op: &Op, created: &mut HashSet<ContainerId>) {
        let places_container = match op {
            Op::Set { value, .. } => matches!(value, Some(DocValue::Map { .. }) | Some(DocValue::List)),
            Op::Insert { value, .. } => matches!(value, DocValue::Map { .. } | DocValue::List),
            Op::Remove { .. } => false,
        };
        if places_container {
            created.insert(ContainerId::Item(op.id().clone()));
        }
    }

    fn integrate(&mut self, op: &Op, events: &mut Vec<DocEvent>) -> Integration {
        if self.seen.contains(op.id()) {
            return Integration::Duplicate;
        }
        let Some(container) = self.containers.get_mut(op.target()) else {
            return Integration::Parked;
        };

        let mut placed: Option<DocValue> = None;
        match (op, &mut container.body) {
            (
                Op::Set {
                    id,
                    target,
                    key,
                    value,
                },
                Body::Map(entries),
            ) => {
                if let Some(v) = value {
                    placed = Some(v.clone());
                }
                let wins = entries.get(key).map(|e| *id > e.id).unwrap_or(true);
                if wins {
                    let old = entries
                        .get(key)
                        .and_then(|e| e.value.as_ref().map(|v| v.resolve(&e.id)));
                    entries.insert(
                        key.clone(),
                        MapEntry {
                            id: id.clone(),
                            value: value.clone(),
                        },
                    );
                    let new = value.as_ref().map(|v| v.resolve(id));
                    if old.is_some() || new.is_some() {
                        events.push(DocEvent::MapChanged {
                            target: target.clone(),
                            key: key.clone(),
                            old,
                            new,
                        });
                    }
                }
            }
            (
                Op::Insert {
                    id,
                    target,
                    after,
                    value,
                },
                Body::List(elems),
            ) => {
                let mut pos = match after {
                    None => 0,
                    Some(anchor) => match elems.iter().position(|e| &e.id == anchor) {
                        Some(p) => p + 1,
                        None => return Integration::Parked,
                    },
                };
                // Concurrent inserts at the same anchor order by descending stamp.
                while pos < elems.len() && elems[pos].id > *id {
                    pos += 1;
                }
                let index = elems[..pos].iter().filter(|e| !e.deleted).count();
                elems.insert(
                    pos,
                    ListElem {
                        id: id.clone(),
                        value: value.clone(),
                        deleted: false,
                    },
                );
                placed = Some(value.clone());
                events.push(DocEvent::ListInserted {
                    target: target.clone(),
                    index,
                    item: value.resolve(id),
                });
            }
            (Op::Remove { target, elem, .. }, Body::List(elems)) => {
                let Some(pos) = elems.iter().position(|e| &e.id == elem) else {
                    return Integration::Parked;
                };
                if !elems[pos].deleted {
                    let index = elems[..pos].iter().filter(|e| !e.deleted).count();
                    elems[pos].deleted = true;
                    events.push(DocEvent::ListRemoved {
                        target: target.clone(),
                        index,
                        item: elems[pos].value.resolve(&elems[pos].id),
                    });
                }
            }
            _ => {
                tracing::warn!(op = %op.id(), "operation does not match its target container kind");
            }
        }

        // Containers exist even when their placing write lost the LWW race,
        // so ops addressed to them never park forever.
        if let Some(container) = placed.as_ref().and_then(Container::from_value) {
            self.containers
                .entry(ContainerId::Item(op.id().clone()))
                .or_insert(container);
        }

        self.clock.observe(op.id());
        self.seen.insert(op.id().clone());
        self.log.push(op.clone());
        Integration::Applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scalar(v: serde_json::Value) -> DocValue {
        DocValue::scalar(v)
    }

    #[test]
    fn local_map_writes() {
        let mut doc = Doc::new("a");
        let mut out = Update::default();
        doc.set(&mut out, &ContainerId::Root, "name", Some(scalar(json!("cart"))))
            .unwrap();
        assert_eq!(doc.to_plain(&ContainerId::Root), json!({"name": "cart"}));
        assert_eq!(out.len(), 1);

        doc.set(&mut out, &ContainerId::Root, "name", None).unwrap();
        assert_eq!(doc.to_plain(&ContainerId::Root), json!({}));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn nested_containers_replicate() {
        let mut a = Doc::new("a");
        let mut out = Update::default();
        let list_id = a
            .set(&mut out, &ContainerId::Root, "items", Some(DocValue::List))
            .unwrap();
        let list = ContainerId::Item(list_id);
        let map_id = a
            .insert(&mut out, &list, 0, DocValue::Map { tag: None })
            .unwrap();
        a.set(
            &mut out,
            &ContainerId::Item(map_id),
            "sku",
            Some(scalar(json!("X"))),
        )
        .unwrap();

        let mut b = Doc::new("b");
        let applied = b.apply(&out);
        assert_eq!(applied.integrated, 3);
        assert_eq!(
            b.to_plain(&ContainerId::Root),
            json!({"items": [{"sku": "X"}]})
        );
        // Only the root existed before, so only its event survives.
        assert_eq!(applied.events.len(), 1);
    }

    #[test]
    fn duplicate_updates_are_ignored() {
        let mut a = Doc::new("a");
        let mut out = Update::default();
        a.set(&mut out, &ContainerId::Root, "n", Some(scalar(json!(1))))
            .unwrap();

        let mut b = Doc::new("b");
        assert_eq!(b.apply(&out).integrated, 1);
        let again = b.apply(&out);
        assert_eq!(again.integrated, 0);
        assert!(again.events.is_empty());
        assert_eq!(b.to_plain(&ContainerId::Root), json!({"n": 1}));
    }

    #[test]
    fn last_writer_wins_per_key() {
        let mut a = Doc::new("a");
        let mut b = Doc::new("b");
        let mut from_a = Update::default();
        let mut from_b = Update::default();
        a.set(&mut from_a, &ContainerId::Root, "k", Some(scalar(json!("a"))))
            .unwrap();
        b.set(&mut from_b, &ContainerId::Root, "k", Some(scalar(json!("b"))))
            .unwrap();

        a.apply(&from_b);
        b.apply(&from_a);
        // Equal counters: node "b" wins the tie.
        assert_eq!(a.to_plain(&ContainerId::Root), json!({"k": "b"}));
        assert_eq!(b.to_plain(&ContainerId::Root), json!({"k": "b"}));
    }

    #[test]
    fn concurrent_list_inserts_converge() {
        let mut base = Doc::new("base");
        let mut init = Update::default();
        let list = ContainerId::Item(
            base.set(&mut init, &ContainerId::Root, "l", Some(DocValue::List))
                .unwrap(),
        );

        let mut a = Doc::new("a");
        let mut b = Doc::new("b");
        a.apply(&init);
        b.apply(&init);

        let mut from_a = Update::default();
        let mut from_b = Update::default();
        a.insert(&mut from_a, &list, 0, scalar(json!("a1"))).unwrap();
        a.insert(&mut from_a, &list, 1, scalar(json!("a2"))).unwrap();
        b.insert(&mut from_b, &list, 0, scalar(json!("b1"))).unwrap();

        a.apply(&from_b);
        b.apply(&from_a);
        assert_eq!(a.to_plain(&list), b.to_plain(&list));
        assert_eq!(a.len(&list), 3);
    }

    #[test]
    fn out_of_order_ops_are_parked() {
        let mut a = Doc::new("a");
        let mut first = Update::default();
        let list = ContainerId::Item(
            a.set(&mut first, &ContainerId::Root, "l", Some(DocValue::List))
                .unwrap(),
        );
        let mut second = Update::default();
        a.insert(&mut second, &list, 0, scalar(json!(1))).unwrap();

        let mut b = Doc::new("b");
        b.apply(&second);
        assert_eq!(b.parked(), 1);
        b.apply(&first);
        assert_eq!(b.parked(), 0);
        assert_eq!(b.to_plain(&ContainerId::Root), json!({"l": [1]}));
    }

    #[test]
    fn remote_list_events_carry_visible_indices() {
        let mut a = Doc::new("a");
        let mut init = Update::default();
        let list = ContainerId::Item(
            a.set(&mut init, &ContainerId::Root, "l", Some(DocValue::List))
                .unwrap(),
        );
        a.insert(&mut init, &list, 0, scalar(json!("x"))).unwrap();
        a.insert(&mut init, &list, 1, scalar(json!("y"))).unwrap();

        let mut b = Doc::new("b");
        b.apply(&init);

        let mut edit = Update::default();
        a.remove(&mut edit, &list, 0).unwrap();
        a.insert(&mut edit, &list, 1, scalar(json!("z"))).unwrap();

        let applied = b.apply(&edit);
        assert_eq!(
            applied.events,
            vec![
                DocEvent::ListRemoved {
                    target: list.clone(),
                    index: 0,
                    item: Item::Scalar(json!("x")),
                },
                DocEvent::ListInserted {
                    target: list.clone(),
                    index: 1,
                    item: Item::Scalar(json!("z")),
                },
            ]
        );
        assert_eq!(b.to_plain(&list), json!(["y", "z"]));
    }

    #[test]
    fn encoded_state_rebuilds_document() {
        let mut a = Doc::new("a");
        let mut out = Update::default();
        let m = a
            .set(&mut out, &ContainerId::Root, "m", Some(DocValue::Map { tag: Some("Cart".into()) }))
            .unwrap();
        a.set(&mut out, &ContainerId::Item(m), "total", Some(scalar(json!(3))))
            .unwrap();

        let json = a.encode_state().to_json().unwrap();
        let mut b = Doc::new("b");
        b.apply(&Update::from_json(json).unwrap());
        assert_eq!(
            b.to_plain(&ContainerId::Root),
            json!({"m": {"__model": "Cart", "total": 3}})
        );
    }

    #[test]
    fn local_write_to_missing_container_fails() {
        let mut a = Doc::new("a");
        let mut out = Update::default();
        let missing = ContainerId::Item(OpId::new("zz", 99));
        assert!(matches!(
            a.set(&mut out, &missing, "k", None),
            Err(Error::NodeNotFound(_))
        ));
        assert!(matches!(
            a.insert(&mut out, &ContainerId::Root, 0, DocValue::List),
            Err(Error::WrongKind { .. })
        ));
    }
}
