//! Fixed-capacity LRU cache
//!
//! Entries live in a slab of nodes linked into a doubly linked list (head is
//! most recently used), with a hash index from key to slot. Every operation
//! is O(1). Freed slots are recycled through a free list.

use serde::Serialize;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;

type Listener<K, V> = Box<dyn FnMut(&K, &V) + Send>;

struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Cache occupancy snapshot
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LruStats {
    pub current_items: usize,
    pub max_items: usize,
    pub usage_percent: f64,
}

/// Least-recently-used cache with an optional eviction listener
pub struct LruCache<K, V> {
    max_items: usize,
    index: HashMap<K, usize>,
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    on_evict: Option<Listener<K, V>>,
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Create a cache holding at most `max_items` entries
    #[must_use]
    pub fn new(max_items: usize) -> Self {
        Self {
            max_items,
            index: HashMap::with_capacity(max_items.min(1024)),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            on_evict: None,
        }
    }

    /// Invoke `listener` with each entry evicted for capacity, before it is dropped
    #[must_use]
    pub fn with_eviction_listener(mut self, listener: impl FnMut(&K, &V) + Send + 'static) -> Self {
        self.on_evict = Some(Box::new(listener));
        self
    }

    /// Get a value and promote it to most recently used
    pub fn get<Q>(&mut self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = *self.index.get(key)?;
        self.move_to_front(slot);
        self.node(slot).map(|node| &node.value)
    }

    /// Get a mutable value and promote it to most recently used
    pub fn get_mut<Q>(&mut self, key: &Q) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = *self.index.get(key)?;
        self.move_to_front(slot);
        self.slots[slot].as_mut().map(|node| &mut node.value)
    }

    /// Get a value without touching recency
    #[must_use]
    pub fn peek<Q>(&self, key: &Q) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = *self.index.get(key)?;
        self.node(slot).map(|node| &node.value)
    }

    #[must_use]
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.index.contains_key(key)
    }

    /// Insert or update an entry, making it most recently used.
    ///
    /// Returns the entry evicted to make room, if any. With zero capacity the
    /// value is discarded and nothing is returned.
    pub fn put(&mut self, key: K, value: V) -> Option<(K, V)> {
        if self.max_items == 0 {
            return None;
        }

        if let Some(&slot) = self.index.get(&key) {
            if let Some(node) = self.slots[slot].as_mut() {
                node.value = value;
            }
            self.move_to_front(slot);
            return None;
        }

        let evicted = if self.index.len() >= self.max_items {
            self.evict_lru()
        } else {
            None
        };

        let node = Node {
            key: key.clone(),
            value,
            prev: None,
            next: None,
        };
        let slot = if let Some(slot) = self.free.pop() {
            self.slots[slot] = Some(node);
            slot
        } else {
            self.slots.push(Some(node));
            self.slots.len() - 1
        };
        self.index.insert(key, slot);
        self.push_front(slot);

        evicted
    }

    /// Remove an entry, returning its value
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let slot = self.index.remove(key)?;
        self.unlink(slot);
        self.free.push(slot);
        self.slots[slot].take().map(|node| node.value)
    }

    /// Remove an entry; true if it existed
    pub fn delete<Q>(&mut self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.remove(key).is_some()
    }

    /// Drop every entry without notifying the listener
    pub fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
    }

    /// Keys from most to least recently used
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        let mut keys = Vec::with_capacity(self.index.len());
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            let Some(node) = self.node(slot) else { break };
            keys.push(node.key.clone());
            cursor = node.next;
        }
        keys
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.max_items
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats(&self) -> LruStats {
        let current_items = self.index.len();
        let usage_percent = if self.max_items == 0 {
            0.0
        } else {
            current_items as f64 / self.max_items as f64 * 100.0
        };
        LruStats {
            current_items,
            max_items: self.max_items,
            usage_percent,
        }
    }

    fn node(&self, slot: usize) -> Option<&Node<K, V>> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    fn evict_lru(&mut self) -> Option<(K, V)> {
        let slot = self.tail?;
        if let (Some(listener), Some(node)) = (self.on_evict.as_mut(), self.slots[slot].as_ref()) {
            listener(&node.key, &node.value);
        }
        self.unlink(slot);
        self.free.push(slot);
        let node = self.slots[slot].take()?;
        self.index.remove(&node.key);
        Some((node.key, node.value))
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = match self.slots[slot].as_ref() {
            Some(node) => (node.prev, node.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(node) = self.slots[p].as_mut() {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.slots[n].as_mut() {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(node) = self.slots[slot].as_mut() {
            node.prev = None;
            node.next = None;
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(node) = self.slots[slot].as_mut() {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head
            && let Some(node) = self.slots[h].as_mut()
        {
            node.prev = Some(slot);
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn move_to_front(&mut self, slot: usize) {
        if self.head == Some(slot) {
            return;
        }
        self.unlink(slot);
        self.push_front(slot);
    }
}
