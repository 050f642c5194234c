//! Change propagation between a reactive node and its document container.
//!
//! Local writes go tree + document in one step and leave their operations in
//! the graph's outgoing update. Remote document events are replayed onto the
//! tree while the origin guard is held, so nothing they touch is written
//! back to the document.

use crate::doc::{DocEvent, Item};
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::mirror::Placement;
use crate::tree::NodeId;
use crate::value::{Input, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Scoped marker that a remote update is being applied to the tree.
///
/// The flag is cleared when the guard drops, on every exit path.
#[derive(Debug)]
pub(crate) struct OriginGuard {
    flag: Arc<AtomicBool>,
}

impl OriginGuard {
    pub(crate) fn enter(flag: &Arc<AtomicBool>) -> Result<Self> {
        if flag.swap(true, Ordering::SeqCst) {
            return Err(Error::ReentrantWrite);
        }
        Ok(Self { flag: flag.clone() })
    }
}

impl Drop for OriginGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl Graph {
    // ------------------------------------------------------------------
    // Replicated -> local
    // ------------------------------------------------------------------

    /// Replay document events onto the tree.
    pub(crate) fn replay(&mut self, events: Vec<DocEvent>) -> Result<()> {
        let _guard = OriginGuard::enter(&self.guard)?;
        for event in events {
            self.on_remote_event(event)?;
        }
        Ok(())
    }

    fn on_remote_event(&mut self, event: DocEvent) -> Result<()> {
        let Some(node) = self.node_of(event.target()) else {
            tracing::trace!(container = ?event.target(), "event for unmirrored container");
            return Ok(());
        };

        match event {
            DocEvent::MapChanged { key, new, .. } => {
                let old = match new {
                    Some(item) => {
                        let value = self.value_from_item(item, node)?;
                        self.tree.put(node, &key, value)?
                    }
                    None => self.tree.remove_key(node, &key)?,
                };
                self.detach_value(old);
            }
            DocEvent::ListInserted { index, item, .. } => {
                let value = self.value_from_item(item, node)?;
                self.tree.splice(node, index, 0, vec![value])?;
            }
            DocEvent::ListRemoved { index, item, .. } => {
                let removed = self.tree.splice(node, index, 1, Vec::new())?;
                if let (Item::Container(_), None) = (&item, removed.first()) {
                    tracing::warn!(node = %node, index, "removed container missing from tree");
                }
                removed.into_iter().for_each(|v| self.detach_value(Some(v)));
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Local -> replicated
    // ------------------------------------------------------------------

    fn check_writable(&self) -> Result<()> {
        if self.applying_remote() {
            return Err(Error::ReentrantWrite);
        }
        Ok(())
    }

    fn container_of(&self, node: NodeId) -> Result<crate::doc::ContainerId> {
        match (self.tree.node(node), self.mirror_of(node)) {
            (Some(n), Some(container)) if n.observed => Ok(container.clone()),
            _ => Err(Error::NodeNotFound(node.to_string())),
        }
    }

    /// Write a map key.
    pub(crate) fn local_set(&mut self, node: NodeId, key: &str, input: Input) -> Result<()> {
        self.check_writable()?;
        let container = self.container_of(node)?;

        let json = match input {
            Input::Json(json) => json,
            Input::Undefined => {
                if !self.tree.has_key(node, key) {
                    return Ok(());
                }
                let old = self.tree.put(node, key, Value::Undefined)?;
                if old.as_ref().map(|v| !v.is_undefined()).unwrap_or(false) {
                    self.doc.set(&mut self.outgoing, &container, key, None)?;
                }
                self.detach_value(old);
                self.dirty = true;
                return Ok(());
            }
        };

        self.validate_plain(&json)?;
        let value =
            self.create_from_plain(&json, node, Placement::Key(container, key.to_string()))?;
        let old = self.tree.put(node, key, value)?;
        self.detach_value(old);
        self.dirty = true;
        Ok(())
    }

    /// Delete a map key.
    pub(crate) fn local_delete(&mut self, node: NodeId, key: &str) -> Result<()> {
        self.check_writable()?;
        let container = self.container_of(node)?;
        let old = self.tree.remove_key(node, key)?;
        if old.is_some() {
            self.doc.set(&mut self.outgoing, &container, key, None)?;
            self.detach_value(old);
            self.dirty = true;
        }
        Ok(())
    }

    /// Replace `delete` list items at `index` with `inserted`.
    pub(crate) fn local_splice(
        &mut self,
        node: NodeId,
        index: usize,
        delete: usize,
        inserted: Vec<serde_json::Value>,
    ) -> Result<()> {
        self.check_writable()?;
        let container = self.container_of(node)?;
        if self.tree.node(node).map(|n| n.kind()) != Some(crate::doc::ContainerKind::List) {
            return Err(Error::WrongKind {
                node: node.to_string(),
                expected: "list",
            });
        }
        let len = self.tree.len(node);
        if index > len || index + delete > len {
            return Err(Error::IndexOutOfRange {
                index: index + delete,
                len,
            });
        }
        inserted.iter().try_for_each(|v| self.validate_plain(v))?;

        for _ in 0..delete {
            self.doc.remove(&mut self.outgoing, &container, index)?;
        }
        let mut values = Vec::with_capacity(inserted.len());
        for (offset, json) in inserted.iter().enumerate() {
            values.push(self.create_from_plain(
                json,
                node,
                Placement::Index(container.clone(), index + offset),
            )?);
        }

        let removed = self.tree.splice(node, index, delete, values)?;
        removed.into_iter().for_each(|v| self.detach_value(Some(v)));
        if delete > 0 || !inserted.is_empty() {
            self.dirty = true;
        }
        Ok(())
    }

    fn detach_value(&mut self, value: Option<Value>) {
        if let Some(Value::Node(child)) = value {
            self.detach(child);
        }
    }
}
