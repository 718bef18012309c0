use std::collections::HashMap;
use std::hash::Hash;

/// Memory tier: key → live value.
///
/// Has no notion of recency and never evicts on its own; the facade picks
/// victims from the recency queue.
#[derive(Debug)]
pub struct MemoryStore<K, V> {
    data: HashMap<K, V>,
}

impl<K: Hash + Eq, V> MemoryStore<K, V> {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.data.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.data.contains_key(key)
    }

    /// Unconditional overwrite, returns the previous value
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        self.data.insert(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.data.remove(key)
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn count(&self) -> usize {
        self.data.len()
    }

    /// True when a nonzero `limit` is exceeded
    pub fn exceeds(&self, limit: usize) -> bool {
        limit > 0 && self.data.len() > limit
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.data.keys()
    }
}

impl<K: Hash + Eq, V> Default for MemoryStore<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_overwrite() {
        let mut store = MemoryStore::new();
        assert!(store.put("k".to_string(), 1).is_none());
        assert_eq!(store.put("k".to_string(), 2), Some(1));
        assert_eq!(store.get(&"k".to_string()), Some(&2));
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn test_put_does_not_self_evict() {
        let mut store = MemoryStore::new();
        for i in 0..10 {
            store.put(i, i);
        }
        assert_eq!(store.count(), 10);
        assert!(store.exceeds(5));
        assert!(!store.exceeds(10));
        assert!(!store.exceeds(0));
    }

    #[test]
    fn test_remove_and_clear() {
        let mut store = MemoryStore::new();
        store.put(1, "a");
        store.put(2, "b");
        assert_eq!(store.remove(&1), Some("a"));
        assert_eq!(store.remove(&1), None);
        store.clear();
        assert_eq!(store.count(), 0);
        assert!(!store.contains(&2));
    }
}
