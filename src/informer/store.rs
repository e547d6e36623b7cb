//! Thread-safe keyed object cache.

use parking_lot::RwLock;
use std::collections::HashMap;

/// In-memory map from string key to object, guarded by a read/write lock.
///
/// The store mirrors the delta FIFO: FIFO operations advance it, the
/// informer loop only reads it. No ordering is guaranteed by `list`/`keys`.
pub struct ThreadSafeStore<T> {
    items: RwLock<HashMap<String, T>>,
}

impl<T: Clone> ThreadSafeStore<T> {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or overwrite. Add and update share overwrite semantics.
    pub fn add(&self, key: String, obj: T) {
        self.items.write().insert(key, obj);
    }

    pub fn update(&self, key: String, obj: T) {
        self.items.write().insert(key, obj);
    }

    pub fn delete(&self, key: &str) {
        self.items.write().remove(key);
    }

    pub fn get(&self, key: &str) -> Option<T> {
        self.items.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.read().contains_key(key)
    }

    pub fn list(&self) -> Vec<T> {
        self.items.read().values().cloned().collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.items.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    /// Replace the entire contents with `snapshot`.
    pub fn replace(&self, snapshot: HashMap<String, T>) {
        *self.items.write() = snapshot;
    }
}

impl<T: Clone> Default for ThreadSafeStore<T> {
    fn default() -> Self {
        Self::new()
    }
}
