//! Write access to a replica's tree.

use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::tree::{NodeId, Tree};
use crate::value::Input;
use serde::Serialize;
use std::ops::Deref;

/// One open transaction on a replica.
///
/// Reads go through [`Deref`] to the [`Tree`]. Every write is mirrored into
/// the document and broadcast when the transaction ends; watchers see all
/// of its changes as one batch.
pub struct Txn<'g> {
    graph: &'g mut Graph,
    root: NodeId,
}

impl<'g> Txn<'g> {
    pub(crate) fn new(graph: &'g mut Graph, root: NodeId) -> Self {
        Self { graph, root }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn tree(&self) -> &Tree {
        &self.graph.tree
    }

    /// Write a map key. Containers are mirrored into fresh nodes.
    pub fn set(&mut self, node: NodeId, key: &str, value: impl Into<Input>) -> Result<()> {
        self.graph.local_set(node, key, value.into())
    }

    /// Write any serializable value under a key.
    pub fn set_value<T: Serialize + ?Sized>(
        &mut self,
        node: NodeId,
        key: &str,
        value: &T,
    ) -> Result<()> {
        let input = Input::from_serialize(value)?;
        self.graph.local_set(node, key, input)
    }

    pub fn delete(&mut self, node: NodeId, key: &str) -> Result<()> {
        self.graph.local_delete(node, key)
    }

    /// Set every field of a JSON object onto a map node.
    pub fn assign(&mut self, node: NodeId, fields: serde_json::Value) -> Result<()> {
        let serde_json::Value::Object(fields) = fields else {
            return Err(Error::UnsupportedValue(
                "assign expects a JSON object".to_string(),
            ));
        };
        for (key, value) in fields {
            self.graph.local_set(node, &key, Input::Json(value))?;
        }
        Ok(())
    }

    pub fn push(&mut self, list: NodeId, value: impl Into<serde_json::Value>) -> Result<()> {
        let index = self.graph.tree.len(list);
        self.graph.local_splice(list, index, 0, vec![value.into()])
    }

    pub fn insert(
        &mut self,
        list: NodeId,
        index: usize,
        value: impl Into<serde_json::Value>,
    ) -> Result<()> {
        self.graph.local_splice(list, index, 0, vec![value.into()])
    }

    pub fn remove(&mut self, list: NodeId, index: usize) -> Result<()> {
        self.graph.local_splice(list, index, 1, Vec::new())
    }

    pub fn splice(
        &mut self,
        list: NodeId,
        index: usize,
        delete: usize,
        inserted: Vec<serde_json::Value>,
    ) -> Result<()> {
        self.graph.local_splice(list, index, delete, inserted)
    }

    /// Resolve a path from the root to a node.
    pub fn node_at(&self, path: &[&str]) -> Result<NodeId> {
        if path.is_empty() {
            return Ok(self.root);
        }
        self.graph
            .tree
            .lookup(path)
            .and_then(|v| v.as_node())
            .ok_or_else(|| Error::NodeNotFound(path.join(".")))
    }
}

impl Deref for Txn<'_> {
    type Target = Tree;

    fn deref(&self) -> &Tree {
        &self.graph.tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelRegistry;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn graph() -> Graph {
        let mut graph = Graph::new("peer-a", Arc::new(ModelRegistry::new()), true);
        graph.mount_root().unwrap();
        graph
    }

    #[test]
    fn assign_and_path_lookup() {
        let mut graph = graph();
        let (result, flush) = graph.transact(|txn| {
            let root = txn.root();
            txn.assign(root, json!({"cart": {"items": []}, "open": true}))?;
            let items = txn.node_at(&["cart", "items"])?;
            txn.push(items, "apple")?;
            Ok(txn.len(items))
        });
        assert_eq!(result.unwrap(), 1);
        assert_eq!(flush.local.len(), 3);
    }

    #[test]
    fn assign_rejects_non_objects() {
        let mut graph = graph();
        let (result, _) = graph.transact(|txn| {
            let root = txn.root();
            txn.assign(root, json!([1, 2]))
        });
        assert!(matches!(result, Err(Error::UnsupportedValue(_))));
    }

    #[test]
    fn set_value_rejects_non_string_keys() {
        let mut graph = graph();
        let mut map = HashMap::new();
        map.insert((1u8, 2u8), "pair");
        let (result, _) = graph.transact(|txn| {
            let root = txn.root();
            txn.set_value(root, "bad", &map)
        });
        match result {
            Err(Error::UnsupportedValue(msg)) => assert!(msg.contains("HashMap")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn wrong_kind_is_reported() {
        let mut graph = graph();
        let (result, _) = graph.transact(|txn| {
            let root = txn.root();
            txn.push(root, 1)
        });
        assert!(matches!(result, Err(Error::WrongKind { expected: "list", .. })));
    }
}
