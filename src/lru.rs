//! Bounded LRU map from record keys to decoded records.
//!
//! Nodes live in an arena (`Vec<Option<Node>>`) and link to each other by
//! index, with explicit `Option<usize>` head and tail. The most recently
//! fetched node is remembered separately so repeated reads of the same key
//! skip the hash lookup.
//!
//! A capacity of 0 disables caching: nothing is retained and every read goes
//! to the backing store.

use std::collections::HashMap;

use crate::error::Result;

#[derive(Debug)]
struct Node<V> {
    key: u32,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Least-recently-used map with a fixed number of entries.
#[derive(Debug)]
pub struct BoundedLru<V> {
    nodes: Vec<Option<Node<V>>>,
    vacant: Vec<usize>,
    map: HashMap<u32, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    last: Option<usize>,
    capacity: usize,
}

impl<V> BoundedLru<V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: Vec::new(),
            vacant: Vec::new(),
            map: HashMap::new(),
            head: None,
            tail: None,
            last: None,
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn node(&self, slot: usize) -> Option<&Node<V>> {
        self.nodes.get(slot).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, slot: usize) -> Option<&mut Node<V>> {
        self.nodes.get_mut(slot).and_then(Option::as_mut)
    }

    fn unlink(&mut self, slot: usize) {
        let Some((prev, next)) = self.node(slot).map(|n| (n.prev, n.next)) else {
            return;
        };
        match prev {
            Some(p) => {
                if let Some(node) = self.node_mut(p) {
                    node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(node) = self.node_mut(n) {
                    node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(node) = self.node_mut(slot) {
            node.prev = None;
            node.next = None;
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        if let Some(node) = self.node_mut(slot) {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(node) = self.node_mut(h) {
                node.prev = Some(slot);
            }
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn promote(&mut self, slot: usize) {
        if self.head != Some(slot) {
            self.unlink(slot);
            self.push_front(slot);
        }
    }

    /// Look up `key`, marking it most recently used.
    pub fn get(&mut self, key: u32) -> Option<&V> {
        let slot = match self.last {
            Some(slot) if self.node(slot).is_some_and(|n| n.key == key) => slot,
            _ => {
                let slot = *self.map.get(&key)?;
                self.last = Some(slot);
                slot
            }
        };
        self.promote(slot);
        self.node(slot).map(|n| &n.value)
    }

    /// Insert or replace `key`, returning the entry evicted to make room.
    pub fn insert(&mut self, key: u32, value: V) -> Option<(u32, V)> {
        if self.capacity == 0 {
            return None;
        }
        if let Some(&slot) = self.map.get(&key) {
            if let Some(node) = self.node_mut(slot) {
                node.value = value;
            }
            self.promote(slot);
            return None;
        }

        let evicted = if self.map.len() >= self.capacity {
            self.tail.and_then(|tail| self.take(tail))
        } else {
            None
        };

        let node = Node {
            key,
            value,
            prev: None,
            next: None,
        };
        let slot = match self.vacant.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.map.insert(key, slot);
        self.push_front(slot);
        evicted
    }

    fn take(&mut self, slot: usize) -> Option<(u32, V)> {
        self.unlink(slot);
        let node = self.nodes.get_mut(slot)?.take()?;
        self.map.remove(&node.key);
        self.vacant.push(slot);
        if self.last == Some(slot) {
            self.last = None;
        }
        Some((node.key, node.value))
    }

    /// Drop `key` from the cache.
    pub fn remove(&mut self, key: u32) -> Option<V> {
        let slot = *self.map.get(&key)?;
        self.take(slot).map(|(_, value)| value)
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.vacant.clear();
        self.map.clear();
        self.head = None;
        self.tail = None;
        self.last = None;
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<u32> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(node) = cursor.and_then(|slot| self.node(slot)) {
            keys.push(node.key);
            cursor = node.next;
        }
        keys
    }
}

/// How raw records turn into cached entries and field values.
pub trait RecordCodec {
    type Entry;
    type Field: Copy;

    fn decode(&self, record: &[u8]) -> Self::Entry;

    fn field(&self, entry: &Self::Entry, field: Self::Field) -> String;

    /// Decode just one field, used when caching is disabled.
    fn decode_field(&self, record: &[u8], field: Self::Field) -> String {
        self.field(&self.decode(record), field)
    }
}

/// A [`BoundedLru`] of decoded records in front of a record loader.
#[derive(Debug)]
pub struct CachedRecords<C: RecordCodec> {
    codec: C,
    lru: BoundedLru<C::Entry>,
}

impl<C: RecordCodec> CachedRecords<C> {
    pub fn new(codec: C, capacity: usize) -> Self {
        Self {
            codec,
            lru: BoundedLru::new(capacity),
        }
    }

    /// Field of the record at `key`, loading and caching it on a miss.
    pub fn get_or_load(
        &mut self,
        key: u32,
        field: C::Field,
        load: impl FnOnce() -> Result<Vec<u8>>,
    ) -> Result<String> {
        if let Some(entry) = self.lru.get(key) {
            return Ok(self.codec.field(entry, field));
        }
        let record = load()?;
        if self.lru.capacity() == 0 {
            return Ok(self.codec.decode_field(&record, field));
        }
        let entry = self.codec.decode(&record);
        let value = self.codec.field(&entry, field);
        self.lru.insert(key, entry);
        Ok(value)
    }

    pub fn remove(&mut self, key: u32) {
        self.lru.remove(key);
    }

    pub fn clear(&mut self) {
        self.lru.clear();
    }

    pub fn len(&self) -> usize {
        self.lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru.is_empty()
    }

    pub fn keys(&self) -> Vec<u32> {
        self.lru.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_least_recent() {
        let mut lru = BoundedLru::new(3);
        assert!(lru.insert(1, "a").is_none());
        assert!(lru.insert(2, "b").is_none());
        assert!(lru.insert(3, "c").is_none());
        assert_eq!(lru.insert(4, "d"), Some((1, "a")));
        assert_eq!(lru.keys(), vec![4, 3, 2]);
    }

    #[test]
    fn test_get_promotes() {
        let mut lru = BoundedLru::new(3);
        lru.insert(1, 10);
        lru.insert(2, 20);
        lru.insert(3, 30);
        assert_eq!(lru.get(1), Some(&10));
        assert_eq!(lru.insert(4, 40), Some((2, 20)));
        assert_eq!(lru.keys(), vec![4, 1, 3]);
    }

    #[test]
    fn test_repeated_get_promotes() {
        let mut lru = BoundedLru::new(2);
        lru.insert(1, 'a');
        lru.insert(2, 'b');
        assert_eq!(lru.get(1), Some(&'a'));
        assert_eq!(lru.insert(3, 'c'), Some((2, 'b')));
        // Same key as the previous lookup.
        assert_eq!(lru.get(1), Some(&'a'));
        assert_eq!(lru.keys(), vec![1, 3]);
        assert_eq!(lru.insert(4, 'd'), Some((3, 'c')));
        assert_eq!(lru.keys(), vec![4, 1]);
    }

    #[test]
    fn test_fast_path_after_remove() {
        let mut lru = BoundedLru::new(2);
        lru.insert(7, 'x');
        assert_eq!(lru.get(7), Some(&'x'));
        assert_eq!(lru.remove(7), Some('x'));
        assert_eq!(lru.get(7), None);
        lru.insert(8, 'y');
        assert_eq!(lru.get(8), Some(&'y'));
    }

    #[test]
    fn test_slots_are_reused() {
        let mut lru = BoundedLru::new(2);
        for key in 0..100 {
            lru.insert(key, key);
        }
        assert_eq!(lru.len(), 2);
        assert!(lru.nodes.len() <= 3);
        assert_eq!(lru.keys(), vec![99, 98]);
    }

    #[test]
    fn test_replace_existing_key() {
        let mut lru = BoundedLru::new(2);
        lru.insert(1, "old");
        lru.insert(2, "b");
        assert!(lru.insert(1, "new").is_none());
        assert_eq!(lru.keys(), vec![1, 2]);
        assert_eq!(lru.get(1), Some(&"new"));
    }

    #[test]
    fn test_zero_capacity_keeps_nothing() {
        let mut lru = BoundedLru::new(0);
        assert!(lru.insert(1, 1).is_none());
        assert!(lru.is_empty());
        assert_eq!(lru.get(1), None);
    }

    struct Upper;

    impl RecordCodec for Upper {
        type Entry = String;
        type Field = ();

        fn decode(&self, record: &[u8]) -> String {
            String::from_utf8_lossy(record).to_uppercase()
        }

        fn field(&self, entry: &String, _field: ()) -> String {
            entry.clone()
        }
    }

    #[test]
    fn test_cached_records_load_once() {
        let mut cache = CachedRecords::new(Upper, 4);
        let loads = std::cell::Cell::new(0);
        for _ in 0..3 {
            let value = cache
                .get_or_load(5, (), || {
                    loads.set(loads.get() + 1);
                    Ok(b"abc".to_vec())
                })
                .unwrap();
            assert_eq!(value, "ABC");
        }
        assert_eq!(loads.get(), 1);
    }

    #[test]
    fn test_cached_records_pass_through() {
        let mut cache = CachedRecords::new(Upper, 0);
        let loads = std::cell::Cell::new(0);
        for _ in 0..2 {
            cache
                .get_or_load(5, (), || {
                    loads.set(loads.get() + 1);
                    Ok(b"abc".to_vec())
                })
                .unwrap();
        }
        assert_eq!(loads.get(), 2);
        assert!(cache.is_empty());
    }
}
