//! Model registry.
//!
//! A map node carrying a model tag is hydrated with the registered
//! [`Model`]: it gets the model's declared keys as slots, its computed
//! values, and its attach/detach hooks.

use crate::error::{Error, Result};
use crate::tree::{NodeId, Tree};
use crate::txn::Txn;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Reserved key carrying a map's model tag in plain JSON.
pub const MODEL_TAG_KEY: &str = "__model";

/// Behavior shared by every node tagged with one model name.
pub trait Model: Send + Sync {
    /// Keys every instance carries as slots, set or not.
    fn keys(&self) -> &[&'static str] {
        &[]
    }

    /// A value derived from the node's current state.
    fn computed(&self, _tree: &Tree, _node: NodeId, _name: &str) -> Option<serde_json::Value> {
        None
    }

    /// Runs once after the node is filled and its replica is ready.
    ///
    /// Writes made here are ordinary local writes and are broadcast.
    fn on_attach(&self, _txn: &mut Txn<'_>, _node: NodeId) -> Result<()> {
        Ok(())
    }

    /// Runs once when an attached node is detached, before its children.
    fn on_detach(&self, _tree: &Tree, _node: NodeId) {}
}

/// Process-wide mapping of model names to implementations.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    models: HashMap<String, Arc<dyn Model>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one model under a name, replacing any previous one.
    pub fn register(&mut self, name: impl Into<String>, model: Arc<dyn Model>) -> &mut Self {
        self.models.insert(name.into(), model);
        self
    }

    /// Register every `(name, model)` pair.
    pub fn register_all<I>(&mut self, models: I) -> &mut Self
    where
        I: IntoIterator<Item = (String, Arc<dyn Model>)>,
    {
        self.models.extend(models);
        self
    }

    /// Builder-style registration.
    pub fn with(mut self, name: impl Into<String>, model: Arc<dyn Model>) -> Self {
        self.register(name, model);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Model>> {
        self.models.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Look a tag up. Unknown tags fail when `strict`; otherwise the node
    /// is left un-hydrated.
    pub fn resolve(&self, tag: &str, strict: bool) -> Result<Option<Arc<dyn Model>>> {
        match self.models.get(tag) {
            Some(model) => Ok(Some(model.clone())),
            None if strict => Err(Error::UnknownModel(tag.to_string())),
            None => Ok(None),
        }
    }
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.models.keys().collect();
        names.sort();
        f.debug_struct("ModelRegistry").field("models", &names).finish()
    }
}

/// Tag a JSON object with a model name.
pub fn tagged(name: &str, mut fields: serde_json::Value) -> serde_json::Value {
    if let Some(obj) = fields.as_object_mut() {
        obj.insert(MODEL_TAG_KEY.to_string(), name.into());
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Cart;
    impl Model for Cart {
        fn keys(&self) -> &[&'static str] {
            &["items"]
        }
    }

    #[test]
    fn resolve_respects_strictness() {
        let registry = ModelRegistry::new().with("Cart", Arc::new(Cart));

        assert!(registry.resolve("Cart", true).unwrap().is_some());
        assert!(matches!(
            registry.resolve("Order", true),
            Err(Error::UnknownModel(name)) if name == "Order"
        ));
        assert!(registry.resolve("Order", false).unwrap().is_none());
    }

    #[test]
    fn register_all_and_debug() {
        let mut registry = ModelRegistry::new();
        registry.register_all(vec![
            ("B".to_string(), Arc::new(Cart) as Arc<dyn Model>),
            ("A".to_string(), Arc::new(Cart) as Arc<dyn Model>),
        ]);
        assert_eq!(registry.len(), 2);
        assert_eq!(format!("{registry:?}"), r#"ModelRegistry { models: ["A", "B"] }"#);
    }

    #[test]
    fn tagged_inserts_model_key() {
        let value = tagged("Cart", json!({"items": []}));
        assert_eq!(value, json!({"__model": "Cart", "items": []}));
    }
}
