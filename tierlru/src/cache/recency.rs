//! Recency Queue
//!
//! Access order for cached keys. The cache keeps one queue over both tiers
//! plus one per tier, so each tier's eviction victim is its own head. Nodes
//! live in a slot arena and are linked by index, with a key → slot index on
//! top, so touch, evict and remove are all O(1).
//!
//! ```text
//!   head (LRU) ─► [A] ◄──► [B] ◄──► [C] ◄── tail (MRU)
//! ```

use std::collections::HashMap;
use std::hash::Hash;

use crate::error::{CacheError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotId(usize);

#[derive(Debug)]
struct Node<K> {
    key: K,
    prev: Option<SlotId>,
    next: Option<SlotId>,
}

/// Ordered set of keys, least recently used at the head
#[derive(Debug)]
pub struct RecencyQueue<K> {
    slots: Vec<Option<Node<K>>>,
    free_list: Vec<usize>,
    index: HashMap<K, SlotId>,
    head: Option<SlotId>,
    tail: Option<SlotId>,
}

impl<K: Hash + Eq + Clone> RecencyQueue<K> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Moves `key` to the most-recently-used end, inserting it if absent
    pub fn touch(&mut self, key: &K) {
        match self.index.get(key).copied() {
            Some(id) => {
                if self.tail != Some(id) {
                    self.detach(id);
                    self.attach_back(id);
                }
            }
            None => {
                let id = self.alloc(Node {
                    key: key.clone(),
                    prev: None,
                    next: None,
                });
                self.attach_back(id);
                self.index.insert(key.clone(), id);
            }
        }
    }

    /// Removes and returns the least-recently-used key
    pub fn evict_candidate(&mut self) -> Result<K> {
        let id = self.head.ok_or(CacheError::EmptyQueue)?;
        let node = self.unlink(id).ok_or(CacheError::EmptyQueue)?;
        self.index.remove(&node.key);
        Ok(node.key)
    }

    /// Removes `key` wherever it sits. Returns `false` if it was absent.
    pub fn remove(&mut self, key: &K) -> bool {
        match self.index.remove(key) {
            Some(id) => {
                self.unlink(id);
                true
            }
            None => false,
        }
    }

    /// Keys from least to most recently used
    pub fn iter(&self) -> Iter<'_, K> {
        Iter {
            queue: self,
            current: self.head,
        }
    }

    /// Drops every key for which `keep` returns `false`, preserving order
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&K) -> bool,
    {
        let doomed: Vec<K> = self.iter().filter(|key| !keep(key)).cloned().collect();
        for key in &doomed {
            self.remove(key);
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free_list.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
    }

    fn node(&self, id: SlotId) -> Option<&Node<K>> {
        self.slots.get(id.0).and_then(|slot| slot.as_ref())
    }

    fn node_mut(&mut self, id: SlotId) -> Option<&mut Node<K>> {
        self.slots.get_mut(id.0).and_then(|slot| slot.as_mut())
    }

    fn alloc(&mut self, node: Node<K>) -> SlotId {
        if let Some(idx) = self.free_list.pop() {
            self.slots[idx] = Some(node);
            SlotId(idx)
        } else {
            self.slots.push(Some(node));
            SlotId(self.slots.len() - 1)
        }
    }

    fn unlink(&mut self, id: SlotId) -> Option<Node<K>> {
        self.detach(id)?;
        let node = self.slots.get_mut(id.0)?.take()?;
        self.free_list.push(id.0);
        Some(node)
    }

    fn detach(&mut self, id: SlotId) -> Option<()> {
        let (prev, next) = {
            let node = self.node(id)?;
            (node.prev, node.next)
        };

        match prev {
            Some(prev_id) => {
                if let Some(prev_node) = self.node_mut(prev_id) {
                    prev_node.next = next;
                }
            }
            None => self.head = next,
        }

        match next {
            Some(next_id) => {
                if let Some(next_node) = self.node_mut(next_id) {
                    next_node.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(node) = self.node_mut(id) {
            node.prev = None;
            node.next = None;
        }
        Some(())
    }

    fn attach_back(&mut self, id: SlotId) {
        let old_tail = self.tail;
        if let Some(node) = self.node_mut(id) {
            node.prev = old_tail;
            node.next = None;
        }
        match old_tail {
            Some(tail_id) => {
                if let Some(tail_node) = self.node_mut(tail_id) {
                    tail_node.next = Some(id);
                }
            }
            None => self.head = Some(id),
        }
        self.tail = Some(id);
    }

    #[cfg(any(test, debug_assertions))]
    pub fn debug_validate_invariants(&self) {
        if self.head.is_none() || self.tail.is_none() {
            assert!(self.head.is_none());
            assert!(self.tail.is_none());
            assert!(self.index.is_empty());
            return;
        }

        let mut count = 0usize;
        let mut prev = None;
        let mut current = self.head;
        while let Some(id) = current {
            let node = self.node(id).expect("linked slot is vacant");
            assert_eq!(node.prev, prev);
            assert_eq!(self.index.get(&node.key), Some(&id));
            prev = Some(id);
            current = node.next;
            count += 1;
            assert!(count <= self.index.len(), "cycle in recency list");
        }
        assert_eq!(prev, self.tail);
        assert_eq!(count, self.index.len());
    }
}

impl<K: Hash + Eq + Clone> Default for RecencyQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over keys from least to most recently used
pub struct Iter<'a, K> {
    queue: &'a RecencyQueue<K>,
    current: Option<SlotId>,
}

impl<'a, K: Hash + Eq + Clone> Iterator for Iter<'a, K> {
    type Item = &'a K;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.current?;
        let node = self.queue.node(id)?;
        self.current = node.next;
        Some(&node.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(queue: &RecencyQueue<&'static str>) -> Vec<&'static str> {
        queue.iter().copied().collect()
    }

    #[test]
    fn test_touch_appends_new_keys() {
        let mut queue = RecencyQueue::new();
        queue.touch(&"a");
        queue.touch(&"b");
        queue.touch(&"c");
        assert_eq!(order(&queue), vec!["a", "b", "c"]);
        assert_eq!(queue.len(), 3);
        queue.debug_validate_invariants();
    }

    #[test]
    fn test_touch_moves_existing_to_tail() {
        let mut queue = RecencyQueue::new();
        for key in ["a", "b", "c"] {
            queue.touch(&key);
        }
        queue.touch(&"a");
        assert_eq!(order(&queue), vec!["b", "c", "a"]);
        queue.touch(&"c");
        assert_eq!(order(&queue), vec!["b", "a", "c"]);
        queue.touch(&"c");
        assert_eq!(order(&queue), vec!["b", "a", "c"]);
        assert_eq!(queue.len(), 3);
        queue.debug_validate_invariants();
    }

    #[test]
    fn test_evict_candidate_pops_lru() {
        let mut queue = RecencyQueue::new();
        for key in ["a", "b", "c"] {
            queue.touch(&key);
        }
        queue.touch(&"a");
        assert_eq!(queue.evict_candidate().unwrap(), "b");
        assert_eq!(queue.evict_candidate().unwrap(), "c");
        assert_eq!(queue.evict_candidate().unwrap(), "a");
        assert!(matches!(queue.evict_candidate(), Err(CacheError::EmptyQueue)));
        queue.debug_validate_invariants();
    }

    #[test]
    fn test_remove_middle_head_tail() {
        let mut queue = RecencyQueue::new();
        for key in ["a", "b", "c", "d"] {
            queue.touch(&key);
        }
        assert!(queue.remove(&"b"));
        assert_eq!(order(&queue), vec!["a", "c", "d"]);
        assert!(queue.remove(&"a"));
        assert!(queue.remove(&"d"));
        assert_eq!(order(&queue), vec!["c"]);
        assert!(!queue.remove(&"zzz"));
        queue.debug_validate_invariants();
    }

    #[test]
    fn test_slots_are_reused() {
        let mut queue = RecencyQueue::new();
        for i in 0..100u32 {
            queue.touch(&i);
            if i >= 4 {
                queue.evict_candidate().unwrap();
            }
        }
        assert_eq!(queue.len(), 4);
        assert!(queue.slots.len() <= 5);
        assert_eq!(queue.iter().copied().collect::<Vec<_>>(), vec![96, 97, 98, 99]);
    }

    #[test]
    fn test_retain_preserves_order() {
        let mut queue = RecencyQueue::new();
        for key in [1, 2, 3, 4, 5] {
            queue.touch(&key);
        }
        queue.retain(|k| k % 2 == 1);
        assert_eq!(queue.iter().copied().collect::<Vec<_>>(), vec![1, 3, 5]);
        queue.debug_validate_invariants();
    }

    #[test]
    fn test_clear() {
        let mut queue = RecencyQueue::new();
        queue.touch(&"a");
        queue.clear();
        assert!(queue.is_empty());
        assert!(!queue.contains(&"a"));
        queue.touch(&"b");
        assert_eq!(order(&queue), vec!["b"]);
        queue.debug_validate_invariants();
    }
}
