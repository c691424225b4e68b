/// Prefix index over string keys
///
/// `PrefixLookup` owns a [`RadixTree`] behind a single reader/writer lock.
/// Point operations take the lock themselves; callers that need several
/// operations to be atomic (validate-then-write) grab a guard with
/// [`PrefixLookup::write`] and call the tree directly.

mod node;

pub use node::{NodeId, RadixTree};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub struct PrefixLookup<V> {
    tree: RwLock<RadixTree<V>>,
}

impl<V> Default for PrefixLookup<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> PrefixLookup<V> {
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(RadixTree::new()),
        }
    }

    /// Shared access for a sequence of reads
    pub fn read(&self) -> RwLockReadGuard<'_, RadixTree<V>> {
        self.tree.read()
    }

    /// Exclusive access for a sequence of reads and writes
    pub fn write(&self) -> RwLockWriteGuard<'_, RadixTree<V>> {
        self.tree.write()
    }

    pub fn add(&self, key: &str, value: V) -> Option<V> {
        self.tree.write().insert(key.as_bytes(), value)
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.tree.write().remove(key.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.read().is_empty()
    }

    pub fn clear(&self) {
        self.tree.write().clear();
    }
}

impl<V: Clone> PrefixLookup<V> {
    pub fn get(&self, key: &str) -> Option<V> {
        self.tree.read().get(key.as_bytes()).cloned()
    }

    /// Values of every key starting with `prefix`, in key order
    pub fn get_by_prefix(&self, prefix: &str) -> Vec<V> {
        self.tree
            .read()
            .values_with_prefix(prefix.as_bytes())
            .into_iter()
            .cloned()
            .collect()
    }

    /// `(key, value)` pairs for every key starting with `prefix`
    pub fn entries_with_prefix(&self, prefix: &str) -> Vec<(String, V)> {
        self.tree
            .read()
            .scan_prefix(prefix.as_bytes())
            .into_iter()
            .map(|(key, value)| (String::from_utf8_lossy(&key).into_owned(), value.clone()))
            .collect()
    }
}
