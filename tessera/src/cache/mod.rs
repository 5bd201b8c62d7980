//! LRU cache of open partitions.
//!
//! Entries live in a slab with an intrusive doubly-linked recency
//! list. Eviction is refcount-guarded: a partition still referenced by
//! an iterator or writer (its `Arc` strong count above 1) is skipped,
//! so the cache can run over capacity until references drain.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::storage::partition::Partition;

struct CacheEntry {
    key: i64,
    value: Arc<Partition>,
    prev: Option<usize>,
    next: Option<usize>,
}

pub struct PartitionCache {
    capacity: usize,
    map: HashMap<i64, usize>,
    entries: Vec<Option<CacheEntry>>,
    free_list: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl PartitionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: HashMap::with_capacity(capacity),
            entries: Vec::with_capacity(capacity),
            free_list: Vec::new(),
            head: None,
            tail: None,
        }
    }

    /// Get a partition by start time, refreshing its recency.
    pub fn get(&mut self, key: i64) -> Option<Arc<Partition>> {
        if let Some(&index) = self.map.get(&key) {
            self.move_to_front(index);
            self.entries[index].as_ref().map(|e| e.value.clone())
        } else {
            None
        }
    }

    /// Insert a partition, then evict idle entries beyond capacity.
    pub fn put(&mut self, key: i64, value: Arc<Partition>) {
        if let Some(&index) = self.map.get(&key) {
            if let Some(entry) = &mut self.entries[index] {
                entry.value = value;
            }
            self.move_to_front(index);
        } else {
            let index = self.allocate_entry(key, value);
            self.map.insert(key, index);
            self.push_front(index);
            self.evict_idle();
        }
    }

    pub fn remove(&mut self, key: i64) -> Option<Arc<Partition>> {
        if let Some(index) = self.map.remove(&key) {
            self.unlink(index);
            let entry = self.entries[index].take();
            self.free_list.push(index);
            entry.map(|e| e.value)
        } else {
            None
        }
    }

    pub fn contains(&self, key: i64) -> bool {
        self.map.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Every cached partition, most recent first not guaranteed.
    pub fn values(&self) -> Vec<Arc<Partition>> {
        self.entries
            .iter()
            .flatten()
            .map(|e| e.value.clone())
            .collect()
    }

    /// Drop least-recently-used entries whose refcount is one (the
    /// cache's own) until within capacity. Entries pinned by readers
    /// are left alone.
    pub fn evict_idle(&mut self) {
        let mut over = self.map.len().saturating_sub(self.capacity);
        let mut cursor = self.tail;
        while over > 0 {
            let index = match cursor {
                Some(i) if Some(i) != self.head => i,
                _ => break,
            };
            let (key, idle, prev) = match &self.entries[index] {
                Some(e) => (e.key, Arc::strong_count(&e.value) == 1, e.prev),
                None => break,
            };
            cursor = prev;
            if idle {
                debug!(partition = key, "evicting idle partition");
                self.remove(key);
                over -= 1;
            }
        }
    }

    fn allocate_entry(&mut self, key: i64, value: Arc<Partition>) -> usize {
        let entry = CacheEntry {
            key,
            value,
            prev: None,
            next: None,
        };
        if let Some(index) = self.free_list.pop() {
            self.entries[index] = Some(entry);
            index
        } else {
            self.entries.push(Some(entry));
            self.entries.len() - 1
        }
    }

    fn push_front(&mut self, index: usize) {
        if let Some(entry) = &mut self.entries[index] {
            entry.prev = None;
            entry.next = self.head;
        }
        if let Some(old_head) = self.head {
            if let Some(entry) = &mut self.entries[old_head] {
                entry.prev = Some(index);
            }
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = match &self.entries[index] {
            Some(entry) => (entry.prev, entry.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(entry) = &mut self.entries[p] {
                    entry.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(nx) => {
                if let Some(entry) = &mut self.entries[nx] {
                    entry.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    fn move_to_front(&mut self, index: usize) {
        if self.head == Some(index) {
            return;
        }
        self.unlink(index);
        self.push_front(index);
    }
}
