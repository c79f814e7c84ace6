//! Bounded least-recently-used cache
//!
//! Nodes live in an arena and link to each other by slot index; a hash index
//! maps keys to slots. Everything except iteration is O(1).

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

const NIL: usize = usize::MAX;

struct Node<K, V> {
    key: K,
    value: V,
    prev: usize,
    next: usize,
    touched: Instant,
}

/// Outcome of [`Cache::set`]
#[derive(Debug, PartialEq, Eq)]
pub enum Insertion<K, V> {
    /// New key stored without evicting anything
    Inserted,
    /// Existing key overwritten, carrying the previous value
    Replaced(V),
    /// New key stored after evicting the least-recently-used entry
    Evicted(K, V),
    /// New key dropped because the least-recently-used entry is younger
    /// than the keep time
    Rejected(K, V),
}

/// Capacity-bounded key/value store ordered by recency of access
pub struct Cache<K, V> {
    index: HashMap<K, usize>,
    slots: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    /// Most recently used slot
    head: usize,
    /// Least recently used slot
    tail: usize,
    capacity: usize,
    keep_time: Option<Duration>,
    hits: u64,
    misses: u64,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Create a cache holding at most `capacity` entries (minimum 1)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            index: HashMap::with_capacity(capacity),
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            capacity,
            keep_time: None,
            hits: 0,
            misses: 0,
        }
    }

    /// Create a cache whose entries stay resident for at least `keep_time`.
    ///
    /// When the cache is full and the least-recently-used entry was touched
    /// less than `keep_time` ago, a new key is not cached at all. This keeps
    /// a working set that is slightly larger than the capacity from
    /// thrashing the whole cache on every refresh cycle.
    #[must_use]
    pub fn with_keep_time(capacity: usize, keep_time: Duration) -> Self {
        let mut cache = Self::new(capacity);
        cache.keep_time = Some(keep_time);
        cache
    }

    /// Look up a key, promoting it to most-recently-used
    pub fn get(&mut self, key: &K) -> Option<&V> {
        match self.index.get(key).copied() {
            Some(slot) => {
                self.hits += 1;
                self.promote(slot);
                Some(&self.node(slot).value)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Look up a key without touching the recency order or statistics
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.index.get(key).map(|&slot| &self.node(slot).value)
    }

    /// Overwrite the value of an existing key without reordering.
    ///
    /// Returns the previous value, or gives `value` back if the key is absent.
    pub fn replace_quiet(&mut self, key: &K, value: V) -> Result<V, V> {
        match self.index.get(key).copied() {
            Some(slot) => Ok(std::mem::replace(&mut self.node_mut(slot).value, value)),
            None => Err(value),
        }
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Insert or overwrite a key and promote it to most-recently-used.
    ///
    /// Inserting a new key into a full cache evicts the least-recently-used
    /// entry before the new one is linked in.
    pub fn set(&mut self, key: K, value: V) -> Insertion<K, V> {
        if let Some(slot) = self.index.get(&key).copied() {
            let previous = std::mem::replace(&mut self.node_mut(slot).value, value);
            self.promote(slot);
            return Insertion::Replaced(previous);
        }

        let mut evicted = None;
        if self.index.len() >= self.capacity {
            if let Some(keep_time) = self.keep_time {
                if self.node(self.tail).touched.elapsed() < keep_time {
                    return Insertion::Rejected(key, value);
                }
            }
            evicted = self.pop_lru();
        }

        let slot = self.alloc(Node {
            key: key.clone(),
            value,
            prev: NIL,
            next: NIL,
            touched: Instant::now(),
        });
        self.link_front(slot);
        self.index.insert(key, slot);

        match evicted {
            Some((key, value)) => Insertion::Evicted(key, value),
            None => Insertion::Inserted,
        }
    }

    /// Return the cached value, or compute, store and return it
    pub fn get_or_insert_with<F>(&mut self, key: K, make: F) -> V
    where
        F: FnOnce() -> V,
        V: Clone,
    {
        if let Some(value) = self.get(&key) {
            return value.clone();
        }
        let value = make();
        // A rejected insert (keep time) still hands the computed value back
        let _ = self.set(key, value.clone());
        value
    }

    /// Remove a key, returning its value if it was present
    pub fn delete(&mut self, key: &K) -> Option<V> {
        let slot = self.index.remove(key)?;
        self.unlink(slot);
        Some(self.release(slot).value)
    }

    /// Remove and return the least-recently-used entry
    pub fn pop_lru(&mut self) -> Option<(K, V)> {
        if self.tail == NIL {
            return None;
        }
        let slot = self.tail;
        self.unlink(slot);
        let node = self.release(slot);
        self.index.remove(&node.key);
        Some((node.key, node.value))
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.slots.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
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
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[must_use]
    pub fn keep_time(&self) -> Option<Duration> {
        self.keep_time
    }

    /// Number of successful `get` calls
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Number of `get` calls that found nothing
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Iterate from most- to least-recently-used
    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            cache: self,
            cursor: self.head,
            remaining: self.len(),
        }
    }

    /// Keys from most- to least-recently-used
    pub fn keys(&self) -> impl Iterator<Item = &K> + '_ {
        self.iter().map(|(key, _)| key)
    }

    /// Values from most- to least-recently-used
    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.iter().map(|(_, value)| value)
    }

    fn node(&self, slot: usize) -> &Node<K, V> {
        self.slots[slot]
            .as_ref()
            .expect("lru index points at a vacant slot")
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node<K, V> {
        self.slots[slot]
            .as_mut()
            .expect("lru index points at a vacant slot")
    }

    fn alloc(&mut self, node: Node<K, V>) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(node);
                slot
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, slot: usize) -> Node<K, V> {
        let node = self.slots[slot]
            .take()
            .expect("released an lru slot twice");
        self.free.push(slot);
        node
    }

    fn promote(&mut self, slot: usize) {
        self.node_mut(slot).touched = Instant::now();
        if self.head == slot {
            return;
        }
        self.unlink(slot);
        self.link_front(slot);
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let node = self.node(slot);
            (node.prev, node.next)
        };

        if prev == NIL {
            self.head = next;
        } else {
            self.node_mut(prev).next = next;
        }

        if next == NIL {
            self.tail = prev;
        } else {
            self.node_mut(next).prev = prev;
        }

        let node = self.node_mut(slot);
        node.prev = NIL;
        node.next = NIL;
    }

    fn link_front(&mut self, slot: usize) {
        let old_head = self.head;
        {
            let node = self.node_mut(slot);
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head == NIL {
            self.tail = slot;
        } else {
            self.node_mut(old_head).prev = slot;
        }
        self.head = slot;
    }
}

/// Iterator over a [`Cache`] in recency order
pub struct Iter<'a, K, V> {
    cache: &'a Cache<K, V>,
    cursor: usize,
    remaining: usize,
}

impl<'a, K, V> Iterator for Iter<'a, K, V>
where
    K: Eq + Hash + Clone,
{
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == NIL {
            return None;
        }
        let node = self.cache.node(self.cursor);
        self.cursor = node.next;
        self.remaining = self.remaining.saturating_sub(1);
        Some((&node.key, &node.value))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a, K, V> IntoIterator for &'a Cache<K, V>
where
    K: Eq + Hash + Clone,
{
    type Item = (&'a K, &'a V);
    type IntoIter = Iter<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K, V> std::fmt::Debug for Cache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .field("keys", &self.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
