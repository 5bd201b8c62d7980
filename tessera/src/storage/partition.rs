//! Time-range partition: segments, block directory, per-entity meta.
//!
//! Write protocol: a writer takes its entity's write lock, runs dedup
//! analysis against published rows, reserves block space under the
//! allocation mutex, writes cells, and finally publishes, advancing
//! `publish_row_count` with release ordering so readers see complete
//! rows. A failed writer rewinds its tail reservation or tombstones
//! the touched rows.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::context::OpContext;
use crate::data::{
    bitmap_len, bitmap_set, ts_in_spans, BlockId, DedupRule, EntityId, Lsn, MetricRowId, Schema,
    Timestamp, TsSpan,
};
use crate::payload::Payload;
use crate::storage::block::{BlockDirectory, BlockItem, BlockItemImage, EntityItem};
use crate::storage::segment::{list_segments, Segment};
use crate::{Result, TesseraError};

const PARTITION_META_MAGIC: u32 = 0x5453_5054; // "TSPT"
const META_FILE: &str = "partition.meta";

#[derive(Debug, Clone, Copy)]
pub struct PartitionOptions {
    pub block_rows: usize,
    pub blocks_per_segment: u32,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        Self {
            block_rows: 1000,
            blocks_per_segment: 1000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PartitionManifest {
    magic: u32,
    start_ts_secs: i64,
    interval_secs: u64,
    next_block_id: BlockId,
    max_lsn: Lsn,
    entities: HashMap<EntityId, EntityItem>,
    block_items: Vec<BlockItemImage>,
    tainted: bool,
}

/// Outcome of one partition write.
#[derive(Debug, Default)]
pub struct PutResult {
    pub rows_written: u64,
    /// Rows tombstoned by OVERRIDE dedup; their blocks had the
    /// aggregate flag cleared.
    pub tombstoned: Vec<MetricRowId>,
    /// Rows of the payload dropped by REJECT/DISCARD.
    pub discard_bitmap: Vec<u8>,
    pub discarded_rows: u32,
    pub dedup_rows: u32,
}

/// One reserved (not yet published) run.
struct Reservation {
    item: Arc<BlockItem>,
    segment: Arc<Segment>,
    start_row: u32,
    row_count: u32,
}

pub struct Partition {
    start_ts_secs: i64,
    interval_secs: u64,
    dir: PathBuf,
    opts: PartitionOptions,
    alloc: Mutex<()>,
    entities: RwLock<HashMap<EntityId, EntityItem>>,
    entity_locks: Mutex<HashMap<EntityId, Arc<Mutex<()>>>>,
    blocks: RwLock<BlockDirectory>,
    segments: RwLock<BTreeMap<BlockId, Arc<Segment>>>,
    max_lsn: AtomicU64,
    tainted: AtomicBool,
}

impl std::fmt::Debug for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Partition")
            .field("start_ts_secs", &self.start_ts_secs)
            .field("dir", &self.dir)
            .finish()
    }
}

impl Partition {
    pub fn open(
        dir: &Path,
        start_ts_secs: i64,
        interval_secs: u64,
        opts: PartitionOptions,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let p = Self {
            start_ts_secs,
            interval_secs,
            dir: dir.to_path_buf(),
            opts,
            alloc: Mutex::new(()),
            entities: RwLock::new(HashMap::new()),
            entity_locks: Mutex::new(HashMap::new()),
            blocks: RwLock::new(BlockDirectory::new()),
            segments: RwLock::new(BTreeMap::new()),
            max_lsn: AtomicU64::new(0),
            tainted: AtomicBool::new(false),
        };

        for id in list_segments(dir)? {
            let seg = Arc::new(Segment::open(dir, id)?);
            p.segments.write().insert(id, seg);
        }

        let meta_path = dir.join(META_FILE);
        if meta_path.exists() {
            let bytes = std::fs::read(&meta_path)?;
            let manifest: PartitionManifest = bincode::deserialize(&bytes).map_err(|e| {
                TesseraError::Corruption(format!(
                    "partition manifest undecodable at {}: {e}",
                    meta_path.display()
                ))
            })?;
            if manifest.magic != PARTITION_META_MAGIC {
                return Err(TesseraError::Corruption(format!(
                    "partition manifest bad magic at {}",
                    meta_path.display()
                )));
            }
            *p.entities.write() = manifest.entities;
            let mut dirw = p.blocks.write();
            for img in manifest.block_items {
                dirw.insert(Arc::new(BlockItem::from_image(img)));
            }
            dirw.set_next_block_id(manifest.next_block_id);
            drop(dirw);
            p.max_lsn.store(manifest.max_lsn, Ordering::Relaxed);
            p.tainted.store(manifest.tainted, Ordering::Relaxed);
        }
        Ok(p)
    }

    pub fn start_ts_secs(&self) -> i64 {
        self.start_ts_secs
    }

    /// Inclusive microsecond range covered by this partition.
    pub fn ts_range(&self) -> (Timestamp, Timestamp) {
        let begin = self.start_ts_secs * 1_000_000;
        (begin, begin + (self.interval_secs as i64) * 1_000_000 - 1)
    }

    pub fn max_lsn(&self) -> Lsn {
        self.max_lsn.load(Ordering::Relaxed)
    }

    pub fn is_tainted(&self) -> bool {
        self.tainted.load(Ordering::Relaxed)
    }

    fn entity_lock(&self, entity_id: EntityId) -> Arc<Mutex<()>> {
        self.entity_locks
            .lock()
            .entry(entity_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn entity_item(&self, entity_id: EntityId) -> Option<EntityItem> {
        self.entities.read().get(&entity_id).cloned()
    }

    pub fn entities(&self) -> Vec<EntityId> {
        self.entities.read().keys().copied().collect()
    }

    /// Block items of the entity in min_ts order (allocation order is
    /// time order per entity), or reversed.
    pub fn get_all_block_items(&self, entity_id: EntityId, reverse: bool) -> Vec<Arc<BlockItem>> {
        self.blocks.read().all_for_entity(entity_id, reverse)
    }

    pub fn segment_for_block(&self, block_id: BlockId) -> Option<Arc<Segment>> {
        let segs = self.segments.read();
        segs.range(..block_id)
            .next_back()
            .map(|(_, s)| s.clone())
            .filter(|s| s.owns_block(block_id))
    }

    pub fn segments(&self) -> Vec<Arc<Segment>> {
        self.segments.read().values().cloned().collect()
    }

    // ========================================================================
    // Write path
    // ========================================================================

    /// Write the payload rows `[start_row, start_row + n)` (all of
    /// which must fall inside this partition's time range) for the
    /// payload's entity, applying `dedup` on (entity, timestamp)
    /// collisions.
    pub fn write_payload(
        &self,
        ctx: &OpContext,
        entity_id: EntityId,
        payload: &Payload,
        start_row: usize,
        n: usize,
        schema: &Schema,
        dedup: DedupRule,
    ) -> Result<PutResult> {
        if self.is_tainted() {
            return Err(TesseraError::Internal(format!(
                "partition {} is tainted, recovery required",
                self.start_ts_secs
            )));
        }
        ctx.check()?;
        let lock = self.entity_lock(entity_id);
        let _guard = lock.lock();

        let mut result = PutResult {
            discard_bitmap: vec![0u8; bitmap_len(n)],
            ..Default::default()
        };

        // dedup analysis over published rows
        let keep = self.dedup_mask(entity_id, payload, start_row, n, dedup, &mut result)?;

        let (run_min, _) = run_ts_bounds(payload, start_row, n);
        let disordered = payload.is_disordered()
            || self
                .entity_item(entity_id)
                .map(|e| e.row_written > 0 && run_min < e.max_ts)
                .unwrap_or(false);

        // write surviving rows in contiguous runs
        let mut i = 0;
        let mut written = 0u64;
        while i < n {
            if !keep[i] {
                i += 1;
                continue;
            }
            let mut run = 1;
            while i + run < n && keep[i + run] {
                run += 1;
            }
            written += self.write_run(ctx, entity_id, payload, start_row + i, run, schema)? as u64;
            i += run;
        }

        if written > 0 {
            let mut entities = self.entities.write();
            let item = entities.entry(entity_id).or_default();
            item.row_written += written;
            let (pmin, pmax) = payload_run_ts_range(payload, start_row, n, &keep);
            item.min_ts = item.min_ts.min(pmin);
            item.max_ts = item.max_ts.max(pmax);
            if disordered {
                item.is_disordered = true;
            }
        }

        self.max_lsn
            .fetch_max(payload.lsn(start_row), Ordering::Relaxed);
        result.rows_written = written;
        Ok(result)
    }

    /// Decide which payload rows survive dedup, tombstoning overridden
    /// rows as a side effect.
    fn dedup_mask(
        &self,
        entity_id: EntityId,
        payload: &Payload,
        start_row: usize,
        n: usize,
        dedup: DedupRule,
        result: &mut PutResult,
    ) -> Result<Vec<bool>> {
        let mut keep = vec![true; n];
        let entity = self.entity_item(entity_id);
        let (payload_min, payload_max) = run_ts_bounds(payload, start_row, n);

        // intra-payload duplicates
        let mut seen: HashMap<Timestamp, usize> = HashMap::new();
        for i in 0..n {
            let ts = payload.timestamp(start_row + i);
            match seen.get(&ts) {
                Some(&prev) => match dedup {
                    DedupRule::Keep => {
                        keep[i] = false;
                        result.dedup_rows += 1;
                    }
                    DedupRule::Override => {
                        keep[prev] = false;
                        result.dedup_rows += 1;
                        seen.insert(ts, i);
                    }
                    DedupRule::Reject | DedupRule::Discard => {
                        keep[i] = false;
                        result.discarded_rows += 1;
                        bitmap_set(&mut result.discard_bitmap, i);
                    }
                    _ => {}
                },
                None => {
                    seen.insert(ts, i);
                }
            }
        }

        // collisions with stored rows
        let overlaps = entity
            .map(|e| e.row_written > 0 && payload_min <= e.max_ts && payload_max >= e.min_ts)
            .unwrap_or(false);
        if !overlaps {
            return Ok(keep);
        }

        let existing = self.scan_entity_rows(entity_id, payload_min, payload_max)?;
        for i in 0..n {
            if !keep[i] {
                continue;
            }
            let ts = payload.timestamp(start_row + i);
            if let Some(rows) = existing.get(&ts) {
                match dedup {
                    DedupRule::Keep => {
                        keep[i] = false;
                        result.dedup_rows += 1;
                    }
                    DedupRule::Override => {
                        for row in rows {
                            if let Some(item) = self.blocks.read().get(row.block_id) {
                                if item.mark_deleted(row.offset_row) {
                                    result.tombstoned.push(*row);
                                }
                            }
                        }
                        result.dedup_rows += 1;
                    }
                    DedupRule::Reject | DedupRule::Discard => {
                        keep[i] = false;
                        result.discarded_rows += 1;
                        bitmap_set(&mut result.discard_bitmap, i);
                    }
                    _ => {}
                }
            }
        }
        Ok(keep)
    }

    /// Map timestamp → live row ids of the entity within `[min, max]`.
    fn scan_entity_rows(
        &self,
        entity_id: EntityId,
        min: Timestamp,
        max: Timestamp,
    ) -> Result<HashMap<Timestamp, Vec<MetricRowId>>> {
        let mut out: HashMap<Timestamp, Vec<MetricRowId>> = HashMap::new();
        for item in self.get_all_block_items(entity_id, false) {
            let published = item.publish_count();
            if published == 0 || item.min_ts() > max || item.max_ts() < min {
                continue;
            }
            let seg = self
                .segment_for_block(item.block_id)
                .ok_or_else(|| TesseraError::Internal(format!(
                    "block {} has no segment",
                    item.block_id
                )))?;
            let ts = seg.read_timestamps(item.block_id, 0, published as usize)?;
            for (row, t) in ts.into_iter().enumerate() {
                if t >= min && t <= max && !item.is_deleted(row as u32) {
                    out.entry(t)
                        .or_default()
                        .push(MetricRowId::new(item.block_id, row as u32));
                }
            }
        }
        Ok(out)
    }

    /// Write one contiguous payload run, splitting across blocks as
    /// capacity allows.
    fn write_run(
        &self,
        ctx: &OpContext,
        entity_id: EntityId,
        payload: &Payload,
        start_row: usize,
        n: usize,
        schema: &Schema,
    ) -> Result<usize> {
        let mut remaining = n;
        let mut at = start_row;
        let mut written = 0usize;
        while remaining > 0 {
            ctx.check()?;
            let res = self.reserve_space(entity_id, remaining as u32, schema)?;
            let take = res.row_count as usize;
            match res
                .segment
                .push_payload(&res.item, res.start_row, payload, at, take)
            {
                Ok(()) => {
                    self.publish_payload_space(&res, payload, at, true);
                    written += take;
                }
                Err(e) => {
                    self.publish_payload_space(&res, payload, at, false);
                    self.tainted.store(true, Ordering::Relaxed);
                    warn!(partition = self.start_ts_secs, error = %e, "payload push failed");
                    return Err(e);
                }
            }
            at += take;
            remaining -= take;
        }
        Ok(written)
    }

    /// Reserve space in the entity's tail block, allocating a new block
    /// (and a new segment when the active one is exhausted or its
    /// schema lags the payload's).
    fn reserve_space(
        &self,
        entity_id: EntityId,
        want: u32,
        schema: &Schema,
    ) -> Result<Reservation> {
        let _alloc = self.alloc.lock();

        // try the entity's current tail block
        let cur_block = self
            .entities
            .read()
            .get(&entity_id)
            .map(|e| e.cur_block_id)
            .unwrap_or(0);
        if cur_block != 0 {
            if let Some(item) = self.blocks.read().get(cur_block).cloned() {
                if let Some(seg) = self.segment_for_block(cur_block) {
                    if seg.is_active() && seg.schema().version == schema.version {
                        if let Some((start, got)) = item.reserve(want) {
                            return Ok(Reservation {
                                segment: seg,
                                item,
                                start_row: start,
                                row_count: got,
                            });
                        }
                    }
                }
            }
        }

        // need a fresh block
        let segment = self.active_segment_for(schema)?;
        let block_id = segment.alloc_block()?.ok_or_else(|| {
            TesseraError::Internal("freshly selected segment refused allocation".into())
        })?;
        let item = Arc::new(BlockItem::new(
            block_id,
            entity_id,
            segment.id(),
            self.opts.block_rows as u32,
        ));
        {
            let mut blocks = self.blocks.write();
            blocks.insert(item.clone());
            blocks.set_next_block_id(block_id + 1);
        }
        self.entities.write().entry(entity_id).or_default().cur_block_id = block_id;

        let (start, got) = item
            .reserve(want)
            .ok_or_else(|| TesseraError::Internal("fresh block refused reservation".into()))?;
        Ok(Reservation {
            segment,
            item,
            start_row: start,
            row_count: got,
        })
    }

    /// Active segment whose schema matches; otherwise create one.
    fn active_segment_for(&self, schema: &Schema) -> Result<Arc<Segment>> {
        {
            let segs = self.segments.read();
            if let Some((_, seg)) = segs.iter().next_back() {
                if seg.is_active()
                    && seg.schema().version == schema.version
                    && seg.allocated_blocks() < seg.max_blocks()
                {
                    return Ok(seg.clone());
                }
            }
        }
        let mut segs = self.segments.write();
        // someone may have raced us to it
        if let Some((_, seg)) = segs.iter().next_back() {
            if seg.is_active()
                && seg.schema().version == schema.version
                && seg.allocated_blocks() < seg.max_blocks()
            {
                return Ok(seg.clone());
            }
            seg.seal()?;
        }
        // the new segment's block range must start past every id any
        // older segment could still hand out
        let prev_bound = segs
            .iter()
            .next_back()
            .map(|(id, s)| id + s.max_blocks())
            .unwrap_or(0);
        let segment_id = prev_bound.max(self.blocks.read().next_block_id() - 1);
        let seg = Arc::new(Segment::create(
            &self.dir,
            segment_id,
            schema,
            self.opts.block_rows,
            self.opts.blocks_per_segment,
        )?);
        self.blocks.write().set_next_block_id(segment_id + 1);
        segs.insert(segment_id, seg.clone());
        info!(partition = self.start_ts_secs, segment = segment_id, version = schema.version,
            "segment created");
        Ok(seg)
    }

    /// Publish or roll back one reservation. On success the rows become
    /// visible and the block's time range widens; on failure the tail
    /// reservation is rewound (or, if others reserved after us, the
    /// rows are tombstoned) and the aggregates stay cleared.
    fn publish_payload_space(
        &self,
        res: &Reservation,
        payload: &Payload,
        payload_start: usize,
        success: bool,
    ) {
        if success {
            let mut min = i64::MAX;
            let mut max = i64::MIN;
            for i in 0..res.row_count as usize {
                let ts = payload.timestamp(payload_start + i);
                min = min.min(ts);
                max = max.max(ts);
            }
            res.item.update_ts_range(min, max);
            res.item.publish(res.row_count);
        } else if !res.item.rewind(res.start_row, res.row_count) {
            for i in 0..res.row_count {
                res.item.mark_deleted(res.start_row + i);
            }
            res.item.publish(res.row_count);
        }
    }

    // ========================================================================
    // Delete path
    // ========================================================================

    /// Live rows of the entity falling inside the spans. Read-only;
    /// the write path logs this plan before applying tombstones.
    pub fn rows_in_spans(&self, entity_id: EntityId, spans: &[TsSpan]) -> Result<Vec<MetricRowId>> {
        let mut out = Vec::new();
        for item in self.get_all_block_items(entity_id, false) {
            let published = item.publish_count();
            if published == 0 {
                continue;
            }
            if !spans.iter().any(|s| s.overlaps(item.min_ts(), item.max_ts())) {
                continue;
            }
            let seg = match self.segment_for_block(item.block_id) {
                Some(s) => s,
                None => continue,
            };
            let ts = seg.read_timestamps(item.block_id, 0, published as usize)?;
            for (row, t) in ts.into_iter().enumerate() {
                if ts_in_spans(t, spans) && !item.is_deleted(row as u32) {
                    out.push(MetricRowId::new(item.block_id, row as u32));
                }
            }
        }
        Ok(out)
    }

    /// Set tombstones for the given rows, returning how many were newly
    /// marked.
    pub fn apply_tombstones(&self, rows: &[MetricRowId]) -> u64 {
        let blocks = self.blocks.read();
        let mut count = 0u64;
        for row in rows {
            if let Some(item) = blocks.get(row.block_id) {
                if item.mark_deleted(row.offset_row) {
                    count += 1;
                }
            }
        }
        count
    }

    /// Tombstone live rows of the entity inside the spans. Returns the
    /// count of newly deleted rows (a second identical call returns 0).
    pub fn delete_data(&self, entity_id: EntityId, spans: &[TsSpan]) -> Result<u64> {
        let lock = self.entity_lock(entity_id);
        let _guard = lock.lock();
        let rows = self.rows_in_spans(entity_id, spans)?;
        Ok(self.apply_tombstones(&rows))
    }

    /// Recovery: tombstone rows whose LSN slot equals `lsn` (the rows
    /// of an uncommitted mini-transaction).
    pub fn undo_insert(&self, entity_id: EntityId, lsn: Lsn) -> Result<u64> {
        let mut count = 0u64;
        for item in self.get_all_block_items(entity_id, false) {
            let published = item.publish_count();
            if published == 0 {
                continue;
            }
            let seg = match self.segment_for_block(item.block_id) {
                Some(s) => s,
                None => continue,
            };
            let lsns = seg.read_lsns(item.block_id, 0, published as usize)?;
            for (row, l) in lsns.into_iter().enumerate() {
                if l == lsn && item.mark_deleted(row as u32) {
                    count += 1;
                }
            }
        }
        Ok(count)
    }

    /// Recovery: drop tombstones set by an uncommitted delete.
    pub fn undo_delete(&self, entity_id: EntityId, rows: &[MetricRowId]) {
        let blocks = self.blocks.read();
        for row in rows {
            if let Some(item) = blocks.get(row.block_id) {
                if item.entity_id == entity_id {
                    item.unmark_deleted(row.offset_row);
                }
            }
        }
    }

    /// Mark the whole entity deleted: tombstone everything.
    pub fn delete_entity(&self, entity_id: EntityId) -> Result<u64> {
        let n = self.delete_data(entity_id, &[TsSpan::all()])?;
        if let Some(item) = self.entities.write().get_mut(&entity_id) {
            item.deleted = true;
        }
        Ok(n)
    }

    // ========================================================================
    // Durability
    // ========================================================================

    /// Persist the manifest and sync segment files.
    pub fn flush(&self) -> Result<()> {
        for seg in self.segments() {
            seg.sync()?;
        }
        let manifest = PartitionManifest {
            magic: PARTITION_META_MAGIC,
            start_ts_secs: self.start_ts_secs,
            interval_secs: self.interval_secs,
            next_block_id: self.blocks.read().next_block_id(),
            max_lsn: self.max_lsn(),
            entities: self.entities.read().clone(),
            block_items: self.blocks.read().iter().map(|b| b.to_image()).collect(),
            tainted: self.is_tainted(),
        };
        let bytes = bincode::serialize(&manifest)?;
        let tmp = self.dir.join(format!("{META_FILE}.tmp"));
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, self.dir.join(META_FILE))?;
        Ok(())
    }

    // ========================================================================
    // Compaction
    // ========================================================================

    /// Merge every segment into one fresh sealed segment, dropping
    /// tombstoned rows, then swap the block directory atomically.
    pub fn compact(&self, schema: &Schema) -> Result<()> {
        use crate::payload::{FieldValue, PayloadBuilder};

        let entity_rows = {
            let entities = self.entities.read();
            entities.keys().copied().collect::<Vec<_>>()
        };
        if entity_rows.is_empty() {
            return Ok(());
        }

        let old_segments = self.segments();
        let bound = old_segments
            .iter()
            .map(|s| s.id() + s.max_blocks())
            .max()
            .unwrap_or(0)
            .max(self.blocks.read().next_block_id() - 1);
        let new_seg = Arc::new(Segment::create(
            &self.dir,
            bound,
            schema,
            self.opts.block_rows,
            self.opts.blocks_per_segment,
        )?);

        let mut replacement: HashMap<EntityId, Vec<Arc<BlockItem>>> = HashMap::new();
        for entity_id in entity_rows {
            let rows = self.live_rows_for_snapshot(entity_id, schema)?;
            if rows.is_empty() {
                replacement.insert(entity_id, Vec::new());
                continue;
            }
            let mut new_items = Vec::new();
            for chunk in rows.chunks(self.opts.block_rows) {
                let mut builder = PayloadBuilder::new(schema, b"");
                for row in chunk {
                    builder.add_row(row.clone());
                }
                let payload = Payload::parse(builder.build()?, schema)?;
                let block_id = new_seg.alloc_block()?.ok_or_else(|| {
                    TesseraError::Internal("compaction segment exhausted".into())
                })?;
                let item = Arc::new(BlockItem::new(
                    block_id,
                    entity_id,
                    new_seg.id(),
                    self.opts.block_rows as u32,
                ));
                new_seg.push_payload(&item, 0, &payload, 0, chunk.len())?;
                let mut min = i64::MAX;
                let mut max = i64::MIN;
                for row in chunk {
                    if let FieldValue::Timestamp(ts) = &row[0] {
                        min = min.min(*ts);
                        max = max.max(*ts);
                    }
                }
                item.update_ts_range(min, max);
                item.publish(chunk.len() as u32);
                new_items.push(item);
            }
            replacement.insert(entity_id, new_items);
        }

        // atomic swap of the directory, serialized against writers
        {
            let _alloc = self.alloc.lock();
            let mut segs = self.segments.write();
            let mut blocks = self.blocks.write();
            let mut entities = self.entities.write();
            for (entity_id, items) in replacement {
                let tail = items.last().map(|i| i.block_id).unwrap_or(0);
                blocks.replace_entity_blocks(entity_id, items);
                if let Some(e) = entities.get_mut(&entity_id) {
                    e.cur_block_id = tail;
                    e.is_disordered = false;
                }
            }
            let max_block = new_seg.id() + new_seg.allocated_blocks();
            blocks.set_next_block_id(max_block + 1);
            segs.clear();
            segs.insert(new_seg.id(), new_seg.clone());
        }

        new_seg.seal()?;
        new_seg.compress()?;
        for seg in old_segments {
            seg.remove_files()?;
        }
        self.flush()?;
        info!(partition = self.start_ts_secs, "compaction complete");
        Ok(())
    }

    /// All live rows of the entity in ascending time order, widened to
    /// the given schema. Shared by compaction and snapshot packaging.
    pub fn live_rows_for_snapshot(
        &self,
        entity_id: EntityId,
        schema: &Schema,
    ) -> Result<Vec<Vec<crate::payload::FieldValue>>> {
        use crate::payload::FieldValue;
        use crate::storage::convert;

        let mut rows: Vec<(Timestamp, Vec<FieldValue>)> = Vec::new();
        for item in self.get_all_block_items(entity_id, false) {
            let published = item.publish_count();
            if published == 0 {
                continue;
            }
            let seg = match self.segment_for_block(item.block_id) {
                Some(s) => s,
                None => continue,
            };
            let ts = seg.read_timestamps(item.block_id, 0, published as usize)?;
            let mut runs: Vec<crate::storage::segment::ColumnRun> = Vec::new();
            for col in &schema.columns {
                runs.push(seg.read_column_run(col, item.block_id, 0, published as usize)?);
            }
            for row in 0..published as usize {
                if item.is_deleted(row as u32) {
                    continue;
                }
                let mut fields = Vec::with_capacity(schema.column_count());
                for (ci, col) in schema.columns.iter().enumerate() {
                    let run = &runs[ci];
                    if crate::data::bitmap_get(&run.bitmap, row) {
                        fields.push(FieldValue::Null);
                        continue;
                    }
                    let w = col.ty.fixed_len();
                    let cell = &run.cells[row * w..(row + 1) * w];
                    let v = match col.ty {
                        crate::data::ColumnType::TimestampLsn
                        | crate::data::ColumnType::Timestamp => {
                            FieldValue::Timestamp(convert::decode_i64(cell, col.ty))
                        }
                        crate::data::ColumnType::Bool => FieldValue::Bool(cell[0] != 0),
                        crate::data::ColumnType::Int8 => FieldValue::Int8(cell[0] as i8),
                        crate::data::ColumnType::Int16 => {
                            FieldValue::Int16(convert::decode_i64(cell, col.ty) as i16)
                        }
                        crate::data::ColumnType::Int32 => {
                            FieldValue::Int32(convert::decode_i64(cell, col.ty) as i32)
                        }
                        crate::data::ColumnType::Int64 => {
                            FieldValue::Int64(convert::decode_i64(cell, col.ty))
                        }
                        crate::data::ColumnType::Float32 => {
                            FieldValue::Float32(convert::decode_f64(cell, col.ty) as f32)
                        }
                        crate::data::ColumnType::Float64 => {
                            FieldValue::Float64(convert::decode_f64(cell, col.ty))
                        }
                        crate::data::ColumnType::Char(_)
                        | crate::data::ColumnType::Binary(_) => {
                            FieldValue::Bytes(cell.to_vec())
                        }
                        crate::data::ColumnType::VarChar(_)
                        | crate::data::ColumnType::VarBinary(_) => {
                            match run.var.as_ref().and_then(|v| v[row].clone()) {
                                Some(bytes) => FieldValue::Bytes(bytes),
                                None => FieldValue::Null,
                            }
                        }
                    };
                    fields.push(v);
                }
                rows.push((ts[row], fields));
            }
        }
        rows.sort_by_key(|(ts, _)| *ts);
        Ok(rows.into_iter().map(|(_, f)| f).collect())
    }
}

fn run_ts_bounds(payload: &Payload, start_row: usize, n: usize) -> (Timestamp, Timestamp) {
    let mut min = i64::MAX;
    let mut max = i64::MIN;
    for i in 0..n {
        let ts = payload.timestamp(start_row + i);
        min = min.min(ts);
        max = max.max(ts);
    }
    (min, max)
}

fn payload_run_ts_range(
    payload: &Payload,
    start_row: usize,
    n: usize,
    keep: &[bool],
) -> (Timestamp, Timestamp) {
    let mut min = i64::MAX;
    let mut max = i64::MIN;
    for i in 0..n {
        if keep[i] {
            let ts = payload.timestamp(start_row + i);
            min = min.min(ts);
            max = max.max(ts);
        }
    }
    (min, max)
}
