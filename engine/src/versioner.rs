//! Root versioning and migrations.

use crate::error::{Error, Result};
use crate::tree::NodeId;
use crate::txn::Txn;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::fmt;

/// Root key holding the applied migration number.
pub const VERSION_KEY: &str = "version";

type Migration = Box<dyn Fn(&mut Txn<'_>, NodeId) -> Result<()> + Send + Sync>;

/// Ordered set of migrations, keyed by the version each one produces.
#[derive(Default)]
pub struct Versioner {
    migrations: BTreeMap<u64, Migration>,
}

impl Versioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the migration producing `version`.
    pub fn migration<F>(mut self, version: u64, f: F) -> Self
    where
        F: Fn(&mut Txn<'_>, NodeId) -> Result<()> + Send + Sync + 'static,
    {
        self.migrations.insert(version, Box::new(f));
        self
    }

    /// The highest declared version.
    pub fn latest(&self) -> Option<u64> {
        self.migrations.keys().next_back().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

impl fmt::Debug for Versioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Versioner")
            .field("versions", &self.migrations.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Bring the root up to date, returning the version it ends at.
///
/// A fresh root receives the initial value and is stamped with the latest
/// version (or `hint` when nothing is declared), without running migrations.
/// An existing root runs every newer migration in ascending order, stamping
/// after each one.
pub(crate) fn upgrade(
    txn: &mut Txn<'_>,
    initial: Option<&serde_json::Value>,
    versioner: Option<&Versioner>,
    hint: Option<u64>,
) -> Result<Option<u64>> {
    let root = txn.root();
    let latest = versioner.and_then(Versioner::latest);

    if txn.is_empty(root) {
        if let Some(initial) = initial {
            txn.assign(root, initial.clone())?;
        }
        let stamp = latest.or(hint);
        if let Some(version) = stamp {
            txn.set(root, VERSION_KEY, version)?;
        }
        return Ok(stamp);
    }

    let stored = txn.get(root, VERSION_KEY).and_then(|v| v.as_u64());
    let Some(versioner) = versioner else {
        return Ok(stored);
    };

    let mut current = stored.unwrap_or(0);
    let pending = versioner
        .migrations
        .range((Bound::Excluded(current), Bound::Unbounded));
    for (&version, migrate) in pending {
        tracing::info!(from = current, to = version, "running migration");
        migrate(txn, root).map_err(|e| Error::Migration {
            version,
            reason: e.to_string(),
        })?;
        txn.set(root, VERSION_KEY, version)?;
        current = version;
    }
    Ok(Some(current))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use crate::model::ModelRegistry;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn graph() -> Graph {
        let mut graph = Graph::new("coordinator", Arc::new(ModelRegistry::new()), false);
        graph.mount_root().unwrap();
        graph
    }

    fn counting(calls: Arc<Mutex<Vec<u64>>>) -> Versioner {
        let one = calls.clone();
        let two = calls;
        Versioner::new()
            .migration(1, move |_, _| {
                one.lock().unwrap().push(1);
                Ok(())
            })
            .migration(2, move |txn, root| {
                two.lock().unwrap().push(2);
                txn.set(root, "b", 2)
            })
    }

    #[test]
    fn empty_root_is_stamped_without_migrating() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let versioner = counting(calls.clone());
        let mut graph = graph();

        let (result, _) = graph.transact(|txn| upgrade(txn, None, Some(&versioner), None));
        assert_eq!(result.unwrap(), Some(2));
        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(graph.tree().to_plain(graph.root().unwrap()), json!({"version": 2}));
    }

    #[test]
    fn existing_root_runs_migrations_in_order() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let versioner = counting(calls.clone());
        let mut graph = graph();
        let (result, _) = graph.transact(|txn| {
            let root = txn.root();
            txn.set(root, "a", 1)
        });
        result.unwrap();

        let (result, _) = graph.transact(|txn| upgrade(txn, None, Some(&versioner), None));
        assert_eq!(result.unwrap(), Some(2));
        assert_eq!(*calls.lock().unwrap(), vec![1, 2]);
        assert_eq!(
            graph.tree().to_plain(graph.root().unwrap()),
            json!({"a": 1, "version": 2, "b": 2})
        );
    }

    #[test]
    fn initial_value_and_hint() {
        let mut graph = graph();
        let initial = json!({"items": []});
        let (result, _) = graph.transact(|txn| upgrade(txn, Some(&initial), None, Some(3)));
        assert_eq!(result.unwrap(), Some(3));
        assert_eq!(
            graph.tree().to_plain(graph.root().unwrap()),
            json!({"items": [], "version": 3})
        );
    }

    #[test]
    fn up_to_date_root_runs_nothing() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let versioner = Versioner::new().migration(1, move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let mut graph = graph();
        let (result, _) = graph.transact(|txn| {
            let root = txn.root();
            txn.set(root, VERSION_KEY, 1)
        });
        result.unwrap();

        let (result, _) = graph.transact(|txn| upgrade(txn, None, Some(&versioner), None));
        assert_eq!(result.unwrap(), Some(1));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn maximal_stored_version_runs_nothing() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let versioner = counting(calls.clone());
        let mut graph = graph();
        let (result, _) = graph.transact(|txn| {
            let root = txn.root();
            txn.set(root, VERSION_KEY, json!(u64::MAX))
        });
        result.unwrap();

        let (result, _) = graph.transact(|txn| upgrade(txn, None, Some(&versioner), None));
        assert_eq!(result.unwrap(), Some(u64::MAX));
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn failing_migration_names_its_version() {
        let versioner = Versioner::new().migration(4, |_, _| {
            Err(Error::UnsupportedValue("bad data".into()))
        });
        let mut graph = graph();
        let (result, _) = graph.transact(|txn| {
            let root = txn.root();
            txn.set(root, "a", 1)
        });
        result.unwrap();

        let (result, _) = graph.transact(|txn| upgrade(txn, None, Some(&versioner), None));
        match result {
            Err(Error::Migration { version, reason }) => {
                assert_eq!(version, 4);
                assert!(reason.contains("bad data"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(format!("{versioner:?}"), "Versioner { versions: [4] }");
    }
}
