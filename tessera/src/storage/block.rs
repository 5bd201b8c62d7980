//! Block items: the in-memory directory of column blocks.
//!
//! A `BlockItem` is shared between one writer and any number of
//! readers. Row visibility is published through `publish_row_count`
//! with release ordering; tombstones only ever set bits in the deleted
//! bitmap and clear the aggregate flag.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::data::{bitmap_clear, bitmap_count, bitmap_get, bitmap_len, bitmap_set, BlockId,
    EntityId, Timestamp};

#[derive(Debug)]
pub struct BlockItem {
    pub block_id: BlockId,
    pub entity_id: EntityId,
    /// Owning segment (its base block id).
    pub segment_id: BlockId,
    capacity: u32,
    publish_row_count: AtomicU32,
    alloc_row_count: AtomicU32,
    min_ts: AtomicI64,
    max_ts: AtomicI64,
    agg_available: AtomicBool,
    overflow: AtomicBool,
    has_deleted: AtomicBool,
    deleted: Mutex<Vec<u8>>,
}

impl BlockItem {
    pub fn new(block_id: BlockId, entity_id: EntityId, segment_id: BlockId, capacity: u32) -> Self {
        Self {
            block_id,
            entity_id,
            segment_id,
            capacity,
            publish_row_count: AtomicU32::new(0),
            alloc_row_count: AtomicU32::new(0),
            min_ts: AtomicI64::new(i64::MAX),
            max_ts: AtomicI64::new(i64::MIN),
            agg_available: AtomicBool::new(false),
            overflow: AtomicBool::new(false),
            has_deleted: AtomicBool::new(false),
            deleted: Mutex::new(vec![0u8; bitmap_len(capacity as usize)]),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    // ========================================================================
    // Reservation and publish
    // ========================================================================

    /// Reserve up to `want` rows; returns (start_row, n). Called under
    /// the partition allocation mutex.
    pub fn reserve(&self, want: u32) -> Option<(u32, u32)> {
        let allocated = self.alloc_row_count.load(Ordering::Relaxed);
        if allocated >= self.capacity {
            return None;
        }
        let n = want.min(self.capacity - allocated);
        self.alloc_row_count.store(allocated + n, Ordering::Relaxed);
        Some((allocated, n))
    }

    /// Release a reservation that was never published. Only the tail
    /// reservation can be rewound; anything else is tombstoned by the
    /// caller instead.
    pub fn rewind(&self, start_row: u32, n: u32) -> bool {
        let allocated = self.alloc_row_count.load(Ordering::Relaxed);
        if allocated == start_row + n {
            self.alloc_row_count.store(start_row, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Make `n` more rows visible. Release-fences the cell writes that
    /// preceded it.
    pub fn publish(&self, n: u32) {
        self.publish_row_count.fetch_add(n, Ordering::Release);
    }

    pub fn publish_count(&self) -> u32 {
        self.publish_row_count.load(Ordering::Acquire)
    }

    pub fn alloc_count(&self) -> u32 {
        self.alloc_row_count.load(Ordering::Relaxed)
    }

    pub fn is_full(&self) -> bool {
        self.alloc_row_count.load(Ordering::Relaxed) >= self.capacity
    }

    // ========================================================================
    // Timestamps
    // ========================================================================

    pub fn update_ts_range(&self, min: Timestamp, max: Timestamp) {
        self.min_ts.fetch_min(min, Ordering::Relaxed);
        self.max_ts.fetch_max(max, Ordering::Relaxed);
    }

    pub fn min_ts(&self) -> Timestamp {
        self.min_ts.load(Ordering::Relaxed)
    }

    pub fn max_ts(&self) -> Timestamp {
        self.max_ts.load(Ordering::Relaxed)
    }

    // ========================================================================
    // Aggregate flags
    // ========================================================================

    pub fn set_agg_available(&self, v: bool) {
        self.agg_available.store(v, Ordering::Release);
    }

    pub fn set_overflow(&self, v: bool) {
        self.overflow.store(v, Ordering::Release);
    }

    pub fn is_overflow(&self) -> bool {
        self.overflow.load(Ordering::Acquire)
    }

    /// Whether the stored block aggregates describe every live row.
    pub fn agg_usable(&self) -> bool {
        self.agg_available.load(Ordering::Acquire) && !self.has_deleted.load(Ordering::Acquire)
    }

    // ========================================================================
    // Tombstones
    // ========================================================================

    /// Set the deleted bit for `row`; returns false if it was already
    /// set (idempotent deletes count only once).
    pub fn mark_deleted(&self, row: u32) -> bool {
        let mut bm = self.deleted.lock();
        if bitmap_get(&bm, row as usize) {
            return false;
        }
        bitmap_set(&mut bm, row as usize);
        self.has_deleted.store(true, Ordering::Release);
        self.agg_available.store(false, Ordering::Release);
        true
    }

    pub fn unmark_deleted(&self, row: u32) {
        let mut bm = self.deleted.lock();
        bitmap_clear(&mut bm, row as usize);
        if bitmap_count(&bm, self.capacity as usize) == 0 {
            self.has_deleted.store(false, Ordering::Release);
        }
    }

    pub fn is_deleted(&self, row: u32) -> bool {
        if !self.has_deleted.load(Ordering::Acquire) {
            return false;
        }
        bitmap_get(&self.deleted.lock(), row as usize)
    }

    pub fn has_deleted_rows(&self) -> bool {
        self.has_deleted.load(Ordering::Acquire)
    }

    pub fn deleted_count(&self) -> u32 {
        if !self.has_deleted.load(Ordering::Acquire) {
            return 0;
        }
        bitmap_count(&self.deleted.lock(), self.publish_count() as usize) as u32
    }

    /// Snapshot of the deleted bitmap for scan loops.
    pub fn deleted_bitmap(&self) -> Vec<u8> {
        self.deleted.lock().clone()
    }

    // ========================================================================
    // Persistence image
    // ========================================================================

    pub fn to_image(&self) -> BlockItemImage {
        BlockItemImage {
            block_id: self.block_id,
            entity_id: self.entity_id,
            segment_id: self.segment_id,
            capacity: self.capacity,
            publish_row_count: self.publish_count(),
            min_ts: self.min_ts(),
            max_ts: self.max_ts(),
            agg_available: self.agg_available.load(Ordering::Acquire),
            overflow: self.is_overflow(),
            deleted: self.deleted.lock().clone(),
        }
    }

    pub fn from_image(img: BlockItemImage) -> Self {
        let has_deleted = bitmap_count(&img.deleted, img.capacity as usize) > 0;
        Self {
            block_id: img.block_id,
            entity_id: img.entity_id,
            segment_id: img.segment_id,
            capacity: img.capacity,
            publish_row_count: AtomicU32::new(img.publish_row_count),
            alloc_row_count: AtomicU32::new(img.publish_row_count),
            min_ts: AtomicI64::new(img.min_ts),
            max_ts: AtomicI64::new(img.max_ts),
            agg_available: AtomicBool::new(img.agg_available),
            overflow: AtomicBool::new(img.overflow),
            has_deleted: AtomicBool::new(has_deleted),
            deleted: Mutex::new(img.deleted),
        }
    }
}

/// Serialized form stored in the partition manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockItemImage {
    pub block_id: BlockId,
    pub entity_id: EntityId,
    pub segment_id: BlockId,
    pub capacity: u32,
    pub publish_row_count: u32,
    pub min_ts: Timestamp,
    pub max_ts: Timestamp,
    pub agg_available: bool,
    pub overflow: bool,
    pub deleted: Vec<u8>,
}

/// Per-entity bookkeeping within one partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityItem {
    pub row_written: u64,
    pub min_ts: Timestamp,
    pub max_ts: Timestamp,
    pub cur_block_id: BlockId,
    pub is_disordered: bool,
    pub deleted: bool,
}

impl Default for EntityItem {
    fn default() -> Self {
        Self {
            row_written: 0,
            min_ts: i64::MAX,
            max_ts: i64::MIN,
            cur_block_id: 0,
            is_disordered: false,
            deleted: false,
        }
    }
}

/// Directory of all blocks in one partition, keyed by block id, with a
/// per-entity list in allocation order.
#[derive(Debug, Default)]
pub struct BlockDirectory {
    items: BTreeMap<BlockId, Arc<BlockItem>>,
    per_entity: HashMap<EntityId, Vec<BlockId>>,
    next_block_id: BlockId,
}

impl BlockDirectory {
    pub fn new() -> Self {
        Self {
            items: BTreeMap::new(),
            per_entity: HashMap::new(),
            next_block_id: 1,
        }
    }

    pub fn next_block_id(&self) -> BlockId {
        self.next_block_id
    }

    pub fn set_next_block_id(&mut self, id: BlockId) {
        self.next_block_id = id;
    }

    /// Allocate the next block id (ids are partition-scoped and never
    /// reused).
    pub fn alloc_block_id(&mut self) -> BlockId {
        let id = self.next_block_id;
        self.next_block_id += 1;
        id
    }

    pub fn insert(&mut self, item: Arc<BlockItem>) {
        self.per_entity
            .entry(item.entity_id)
            .or_default()
            .push(item.block_id);
        self.items.insert(item.block_id, item);
    }

    pub fn get(&self, id: BlockId) -> Option<&Arc<BlockItem>> {
        self.items.get(&id)
    }

    /// Block items of one entity ordered by min_ts (out-of-order
    /// ingest can make allocation order disagree with time order), or
    /// reversed.
    pub fn all_for_entity(&self, entity_id: EntityId, reverse: bool) -> Vec<Arc<BlockItem>> {
        let mut out: Vec<Arc<BlockItem>> = self
            .per_entity
            .get(&entity_id)
            .map(|ids| ids.iter().filter_map(|id| self.items.get(id).cloned()).collect())
            .unwrap_or_default();
        out.sort_by_key(|b| (b.min_ts(), b.block_id));
        if reverse {
            out.reverse();
        }
        out
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<BlockItem>> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Swap one entity's blocks for the compacted replacement set.
    pub fn replace_entity_blocks(&mut self, entity_id: EntityId, blocks: Vec<Arc<BlockItem>>) {
        if let Some(old) = self.per_entity.remove(&entity_id) {
            for id in old {
                self.items.remove(&id);
            }
        }
        for b in blocks {
            self.insert(b);
        }
    }
}
