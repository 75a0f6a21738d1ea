use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

/// Registry of live queries waiting for replica table commits.
///
/// Observers register for a set of tables, or for every table when the
/// tables a query reads could not be determined.
#[derive(Default)]
pub struct QueryObservers {
    registry: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    known_tables: HashSet<String>,
    by_table: HashMap<String, HashMap<u64, mpsc::UnboundedSender<String>>>,
    wildcard: HashMap<u64, mpsc::UnboundedSender<String>>,
}

/// Unregisters its observer when dropped.
pub struct ObserverGuard {
    id: u64,
    tables: Option<HashSet<String>>,
    registry: Weak<QueryObservers>,
}

impl QueryObservers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds a table name that live queries may reference.
    pub fn register_table(&self, name: &str) {
        self.registry.lock().known_tables.insert(name.to_string());
    }

    pub fn known_tables(&self) -> HashSet<String> {
        self.registry.lock().known_tables.clone()
    }

    /// Registers an observer. `None` watches every table.
    ///
    /// The receiver gets the name of each table committed after this call.
    pub fn subscribe(
        self: &Arc<Self>,
        tables: Option<HashSet<String>>,
    ) -> (ObserverGuard, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;

        match &tables {
            Some(names) => {
                for name in names {
                    registry
                        .by_table
                        .entry(name.clone())
                        .or_default()
                        .insert(id, tx.clone());
                }
            }
            None => {
                registry.wildcard.insert(id, tx);
            }
        }

        let guard = ObserverGuard {
            id,
            tables,
            registry: Arc::downgrade(self),
        };
        (guard, rx)
    }

    /// Tells every observer of `table` that it changed. Returns how many
    /// observers were notified.
    pub fn notify(&self, table: &str) -> usize {
        let mut registry = self.registry.lock();
        let mut notified = 0;

        if let Some(observers) = registry.by_table.get_mut(table) {
            observers.retain(|_, tx| tx.send(table.to_string()).is_ok());
            notified += observers.len();
        }
        registry
            .wildcard
            .retain(|_, tx| tx.send(table.to_string()).is_ok());
        notified += registry.wildcard.len();

        trace!(table, notified, "notified query observers");
        notified
    }

    /// Number of registered observers.
    pub fn observer_count(&self) -> usize {
        let registry = self.registry.lock();
        let mut ids: HashSet<u64> = registry.wildcard.keys().copied().collect();
        for observers in registry.by_table.values() {
            ids.extend(observers.keys().copied());
        }
        ids.len()
    }

    fn unsubscribe(&self, id: u64, tables: Option<&HashSet<String>>) {
        let mut registry = self.registry.lock();
        match tables {
            Some(names) => {
                for name in names {
                    if let Some(observers) = registry.by_table.get_mut(name) {
                        observers.remove(&id);
                        if observers.is_empty() {
                            registry.by_table.remove(name);
                        }
                    }
                }
            }
            None => {
                registry.wildcard.remove(&id);
            }
        }
    }
}

impl Drop for ObserverGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(self.id, self.tables.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables(names: &[&str]) -> Option<HashSet<String>> {
        Some(names.iter().map(|n| n.to_string()).collect())
    }

    #[test]
    fn test_notify_reaches_matching_observers_only() {
        let observers = QueryObservers::new();
        let (_projects, mut projects_rx) = observers.subscribe(tables(&["projects"]));
        let (_tasks, mut tasks_rx) = observers.subscribe(tables(&["tasks"]));
        let (_all, mut all_rx) = observers.subscribe(None);

        assert_eq!(observers.notify("projects"), 2);
        assert_eq!(projects_rx.try_recv().unwrap(), "projects");
        assert!(tasks_rx.try_recv().is_err());
        assert_eq!(all_rx.try_recv().unwrap(), "projects");
    }

    #[test]
    fn test_dropping_guard_unregisters() {
        let observers = QueryObservers::new();
        let (guard, _rx) = observers.subscribe(tables(&["projects", "tasks"]));
        let (wildcard, _all) = observers.subscribe(None);
        assert_eq!(observers.observer_count(), 2);

        drop(guard);
        assert_eq!(observers.observer_count(), 1);
        assert_eq!(observers.notify("projects"), 1);

        drop(wildcard);
        assert_eq!(observers.observer_count(), 0);
        assert_eq!(observers.notify("projects"), 0);
    }

    #[test]
    fn test_closed_receivers_are_pruned() {
        let observers = QueryObservers::new();
        let (_guard, rx) = observers.subscribe(tables(&["projects"]));
        drop(rx);
        assert_eq!(observers.notify("projects"), 0);
    }

    #[test]
    fn test_known_tables() {
        let observers = QueryObservers::new();
        observers.register_table("projects");
        observers.register_table("tasks");
        observers.register_table("projects");
        assert_eq!(observers.known_tables().len(), 2);
    }
}
