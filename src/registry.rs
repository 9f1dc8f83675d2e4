//! Insertion-ordered, name-keyed storage shared by the limiter and breaker registries.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

struct Entries<T> {
    index: HashMap<String, usize>,
    items: Vec<(String, Arc<T>)>,
}

/// A map from resource name to a shared instance.
///
/// Lookups take the read lock; creation takes the write lock and re-checks
/// the name first, so concurrent first lookups of one name produce exactly
/// one instance. Entries are never removed.
pub(crate) struct NamedRegistry<T> {
    entries: RwLock<Entries<T>>,
}

impl<T> NamedRegistry<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: RwLock::new(Entries {
                index: HashMap::new(),
                items: Vec::new(),
            }),
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<T>> {
        let entries = self.entries.read();
        entries
            .index
            .get(name)
            .map(|&idx| Arc::clone(&entries.items[idx].1))
    }

    /// Return the instance for `name`, creating it with `create` if absent.
    ///
    /// The flag is `true` when this call created the instance.
    pub(crate) fn get_or_insert_with<F>(&self, name: &str, create: F) -> (Arc<T>, bool)
    where
        F: FnOnce() -> T,
    {
        if let Some(existing) = self.get(name) {
            return (existing, false);
        }

        let mut entries = self.entries.write();
        if let Some(&idx) = entries.index.get(name) {
            return (Arc::clone(&entries.items[idx].1), false);
        }

        let item = Arc::new(create());
        let idx = entries.items.len();
        entries.items.push((name.to_string(), Arc::clone(&item)));
        entries.index.insert(name.to_string(), idx);
        (item, true)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().items.len()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.entries
            .read()
            .items
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Clone out every entry in insertion order.
    ///
    /// The registry lock is released before the caller touches the instances,
    /// so per-instance locks are never taken while the registry lock is held.
    pub(crate) fn snapshot(&self) -> Vec<(String, Arc<T>)> {
        self.entries
            .read()
            .items
            .iter()
            .map(|(name, item)| (name.clone(), Arc::clone(item)))
            .collect()
    }
}

impl<T> Default for NamedRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_get_or_insert_creates_once() {
        let registry: NamedRegistry<u32> = NamedRegistry::new();

        let (first, created) = registry.get_or_insert_with("a", || 1);
        assert!(created);
        let (second, created) = registry.get_or_insert_with("a", || 2);
        assert!(!created);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*second, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_snapshot_preserves_insertion_order() {
        let registry: NamedRegistry<u32> = NamedRegistry::new();
        for (i, name) in ["zeta", "alpha", "mid"].iter().enumerate() {
            registry.get_or_insert_with(name, || i as u32);
        }

        let names: Vec<String> = registry.snapshot().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert_eq!(registry.names(), names);
    }

    #[test]
    fn test_concurrent_first_lookup_creates_single_instance() {
        let registry: NamedRegistry<usize> = NamedRegistry::new();
        let constructed = AtomicUsize::new(0);

        let handles: Vec<Arc<usize>> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..16)
                .map(|_| {
                    s.spawn(|| {
                        registry
                            .get_or_insert_with("shared", || {
                                constructed.fetch_add(1, Ordering::SeqCst)
                            })
                            .0
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        assert_eq!(constructed.load(Ordering::SeqCst), 1);
        assert!(handles.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn test_get_missing_returns_none() {
        let registry: NamedRegistry<u32> = NamedRegistry::new();
        assert!(registry.get("nope").is_none());
        assert_eq!(registry.len(), 0);
    }
}
