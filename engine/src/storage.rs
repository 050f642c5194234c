//! Durable key-value storage for coordinator snapshots.

use crate::error::{Error, Result};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

pub trait DurableStore: Send + Sync {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<serde_json::Value>>>;

    fn set(&self, key: &str, value: serde_json::Value) -> BoxFuture<'_, Result<()>>;

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<()>>;

    /// Every stored key starting with `prefix`, sorted.
    fn keys(&self, prefix: &str) -> BoxFuture<'_, Result<Vec<String>>>;
}

/// In-memory store for tests and local coordinators.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<BTreeMap<String, serde_json::Value>>>,
    fail_writes: Arc<AtomicBool>,
    writes: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `set` fail with a storage error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful `set` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<serde_json::Value>>> {
        let value = self.entries.lock().get(key).cloned();
        async move { Ok(value) }.boxed()
    }

    fn set(&self, key: &str, value: serde_json::Value) -> BoxFuture<'_, Result<()>> {
        let key = key.to_string();
        async move {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(Error::Storage(format!("write to {key} rejected")));
            }
            self.entries.lock().insert(key, value);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        .boxed()
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<()>> {
        self.entries.lock().remove(key);
        async { Ok(()) }.boxed()
    }

    fn keys(&self, prefix: &str) -> BoxFuture<'_, Result<Vec<String>>> {
        let keys = self
            .entries
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        async move { Ok(keys) }.boxed()
    }
}
