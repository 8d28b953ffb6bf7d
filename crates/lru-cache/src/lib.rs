//! Bounded least-recently-used cache safe for concurrent callers.
//!
//! Entries live in a slab of nodes chained into a doubly-linked recency
//! list (indices instead of pointers, so no unsafe): the list head is the
//! least recently used entry, the tail the most recently used. A `HashMap`
//! gives O(1) key lookup into the slab. A single internal lock serialises
//! all operations.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;

pub struct LruCache<K, V> {
    inner: Mutex<Inner<K, V>>,
}

struct Inner<K, V> {
    capacity: usize,
    map: HashMap<K, usize>,
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    /// Least recently used.
    head: Option<usize>,
    /// Most recently used.
    tail: Option<usize>,
}

struct Node<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "LRU cache capacity must be non-zero");

        Self {
            inner: Mutex::new(Inner {
                capacity,
                map: HashMap::new(),
                nodes: Vec::new(),
                free: Vec::new(),
                head: None,
                tail: None,
            }),
        }
    }

    /// Inserts or replaces the entry for `key`, making it the most
    /// recently used. Evicts from the least recently used end while the
    /// cache is over capacity.
    pub fn put(&self, key: K, value: V) {
        let mut inner = self.inner.lock();

        if let Some(&idx) = inner.map.get(&key) {
            inner.node_mut(idx).value = value;
            inner.promote(idx);
            return;
        }

        let idx = inner.alloc(key.clone(), value);
        inner.map.insert(key, idx);
        inner.push_tail(idx);

        while inner.map.len() > inner.capacity {
            inner.evict_lru();
        }
    }

    /// Returns a clone of the cached value and promotes the entry to most
    /// recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let idx = *inner.map.get(key)?;
        inner.promote(idx);
        Some(inner.node(idx).value.clone())
    }

    /// Removes and returns the entry for `key`, if present.
    pub fn remove(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let idx = inner.map.remove(key)?;
        inner.unlink(idx);
        Some(inner.release(idx).value)
    }

    /// Removes every entry for which `predicate` returns false.
    pub fn retain(&self, mut predicate: impl FnMut(&K) -> bool) {
        let mut inner = self.inner.lock();

        let doomed: Vec<usize> = inner
            .map
            .iter()
            .filter(|(key, _)| !predicate(key))
            .map(|(_, &idx)| idx)
            .collect();

        for idx in doomed {
            inner.unlink(idx);
            let node = inner.release(idx);
            inner.map.remove(&node.key);
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.map.clear();
        inner.nodes.clear();
        inner.free.clear();
        inner.head = None;
        inner.tail = None;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash,
{
    fn node(&self, idx: usize) -> &Node<K, V> {
        self.nodes[idx].as_ref().expect("index points at a live node")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node<K, V> {
        self.nodes[idx].as_mut().expect("index points at a live node")
    }

    fn alloc(&mut self, key: K, value: V) -> usize {
        let node = Node {
            key,
            value,
            prev: None,
            next: None,
        };

        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn release(&mut self, idx: usize) -> Node<K, V> {
        let node = self.nodes[idx].take().expect("index points at a live node");
        self.free.push(idx);
        node
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.node(idx);
            (node.prev, node.next)
        };

        match prev {
            Some(prev) => self.node_mut(prev).next = next,
            None => self.head = next,
        }

        match next {
            Some(next) => self.node_mut(next).prev = prev,
            None => self.tail = prev,
        }

        let node = self.node_mut(idx);
        node.prev = None;
        node.next = None;
    }

    fn push_tail(&mut self, idx: usize) {
        match self.tail {
            Some(tail) => {
                self.node_mut(tail).next = Some(idx);
                self.node_mut(idx).prev = Some(tail);
            }
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    fn promote(&mut self, idx: usize) {
        if self.tail == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_tail(idx);
    }

    fn evict_lru(&mut self) {
        let Some(idx) = self.head else {
            return;
        };
        self.unlink(idx);
        let node = self.release(idx);
        self.map.remove(&node.key);
    }
}
