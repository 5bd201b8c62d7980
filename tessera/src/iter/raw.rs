//! Raw data iterator: projected column batches in time order (or
//! reverse) across the partitions of one sub-group.
//!
//! Each `next` call returns the longest contiguous run of qualifying
//! rows from a single block. A block whose pre-aggregates are intact,
//! whose whole time range sits inside one requested span (inclusive at
//! both ends), and which carries no tombstones is returned whole with
//! no per-row timestamp checks.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::context::OpContext;
use crate::data::{ts_in_spans, ColumnSchema, EntityId, Timestamp, TsSpan};
use crate::iter::{BatchIterator, ColumnBatch, IterOutput, ResultBatch};
use crate::storage::block::BlockItem;
use crate::storage::partition::Partition;
use crate::Result;

pub struct RawIterator {
    partitions: Vec<Arc<Partition>>,
    entity_ids: Vec<EntityId>,
    ts_spans: Vec<TsSpan>,
    projection: Vec<ColumnSchema>,
    reverse: bool,

    cur_entity_idx: usize,
    /// -1 = before the first partition of the current entity.
    cur_p_idx: isize,
    block_queue: VecDeque<Arc<BlockItem>>,
    cur_block: Option<Arc<BlockItem>>,
    /// Next row offset to inspect (counts from the far end when
    /// reversed).
    cur_row: u32,
}

impl RawIterator {
    /// `partitions` must arrive in ascending time order; they are
    /// walked back-to-front when `reverse` is set.
    pub fn new(
        partitions: Vec<Arc<Partition>>,
        entity_ids: Vec<EntityId>,
        ts_spans: Vec<TsSpan>,
        projection: Vec<ColumnSchema>,
        reverse: bool,
    ) -> Self {
        let partitions = if reverse {
            partitions.into_iter().rev().collect()
        } else {
            partitions
        };
        Self {
            partitions,
            entity_ids,
            ts_spans,
            projection,
            reverse,
            cur_entity_idx: 0,
            cur_p_idx: -1,
            block_queue: VecDeque::new(),
            cur_block: None,
            cur_row: 0,
        }
    }

    fn next_entity(&mut self) {
        self.cur_entity_idx += 1;
        self.cur_p_idx = -1;
        self.block_queue.clear();
        self.cur_block = None;
        self.cur_row = 0;
    }

    /// Move to the next partition of the current entity, honoring the
    /// watermark early-exit. Returns false when partitions (or the
    /// watermark) end the entity.
    fn next_partition(&mut self, watermark: Option<Timestamp>) -> bool {
        loop {
            self.cur_p_idx += 1;
            let p = match self.partitions.get(self.cur_p_idx as usize) {
                Some(p) => p,
                None => return false,
            };
            if let Some(w) = watermark {
                let (pmin, pmax) = p.ts_range();
                let past = if self.reverse { pmax < w } else { pmin > w };
                if past {
                    return false;
                }
            }
            let entity_id = self.entity_ids[self.cur_entity_idx];
            let items = p.get_all_block_items(entity_id, self.reverse);
            if !items.is_empty() {
                self.block_queue = items.into();
                return true;
            }
        }
    }

    fn next_block(&mut self) -> bool {
        match self.block_queue.pop_front() {
            Some(item) => {
                self.cur_row = 0;
                self.cur_block = Some(item);
                true
            }
            None => false,
        }
    }

    /// Whether the whole block qualifies without per-row checks: both
    /// time endpoints inside a single requested span (inclusive), fresh
    /// aggregates, no tombstones.
    fn block_fully_selectable(&self, item: &BlockItem) -> bool {
        item.agg_usable()
            && !item.has_deleted_rows()
            && self
                .ts_spans
                .iter()
                .any(|s| s.contains(item.min_ts()) && s.contains(item.max_ts()))
    }

    fn build_batch(
        &self,
        partition: &Partition,
        item: &BlockItem,
        start_row: u32,
        n: usize,
        timestamps: Vec<Timestamp>,
    ) -> Result<ResultBatch> {
        let segment = partition.segment_for_block(item.block_id).ok_or_else(|| {
            crate::TesseraError::Internal(format!("block {} lost its segment", item.block_id))
        })?;
        let mut columns = Vec::with_capacity(self.projection.len());
        for col in &self.projection {
            let run = segment.read_column_run(col, item.block_id, start_row, n)?;
            let mut cb = ColumnBatch {
                ty: col.ty,
                cells: run.cells,
                bitmap: run.bitmap,
                var: run.var,
                row_count: n,
            };
            if self.reverse {
                cb.reverse_rows();
            }
            columns.push(cb);
        }
        let mut timestamps = timestamps;
        if self.reverse {
            timestamps.reverse();
        }
        Ok(ResultBatch {
            entity_id: item.entity_id,
            timestamps,
            columns,
            row_count: n,
        })
    }
}

impl BatchIterator for RawIterator {
    fn next(&mut self, ctx: &OpContext, watermark: Option<Timestamp>) -> Result<IterOutput> {
        loop {
            ctx.check()?;
            if self.cur_entity_idx >= self.entity_ids.len() {
                return Ok(IterOutput::finished());
            }

            let item = match &self.cur_block {
                Some(item) => item.clone(),
                None => {
                    if self.next_block() {
                        continue;
                    }
                    if self.next_partition(watermark) {
                        continue;
                    }
                    self.next_entity();
                    continue;
                }
            };

            let published = item.publish_count();
            if published == 0 || self.cur_row >= published {
                self.cur_block = None;
                continue;
            }
            let partition = self.partitions[self.cur_p_idx as usize].clone();

            // fast path: hand the whole block over in one batch
            if self.cur_row == 0 && self.block_fully_selectable(&item) {
                let segment = partition.segment_for_block(item.block_id).ok_or_else(|| {
                    crate::TesseraError::Internal(format!(
                        "block {} lost its segment",
                        item.block_id
                    ))
                })?;
                let ts = segment.read_timestamps(item.block_id, 0, published as usize)?;
                let batch = self.build_batch(&partition, &item, 0, published as usize, ts)?;
                self.cur_block = None;
                return Ok(IterOutput::batch(batch));
            }

            // slow path: find the next contiguous qualifying run
            let segment = partition.segment_for_block(item.block_id).ok_or_else(|| {
                crate::TesseraError::Internal(format!("block {} lost its segment", item.block_id))
            })?;
            let ts = segment.read_timestamps(item.block_id, 0, published as usize)?;

            let qualifies = |row: u32| -> bool {
                !item.is_deleted(row) && ts_in_spans(ts[row as usize], &self.ts_spans)
            };

            let (run_start, run_len, next_cursor) = if self.reverse {
                // cur_row counts consumed rows from the top
                let mut pos = published.checked_sub(1 + self.cur_row);
                // skip disqualified rows downward
                while let Some(row) = pos {
                    if qualifies(row) {
                        break;
                    }
                    pos = row.checked_sub(1);
                }
                match pos {
                    None => {
                        self.cur_block = None;
                        continue;
                    }
                    Some(top) => {
                        let mut bottom = top;
                        while bottom > 0 && qualifies(bottom - 1) {
                            bottom -= 1;
                        }
                        (bottom, (top - bottom + 1) as usize, published - bottom)
                    }
                }
            } else {
                let mut row = self.cur_row;
                while row < published && !qualifies(row) {
                    row += 1;
                }
                if row >= published {
                    self.cur_block = None;
                    continue;
                }
                let mut end = row + 1;
                while end < published && qualifies(end) {
                    end += 1;
                }
                (row, (end - row) as usize, end)
            };

            let run_ts = ts[run_start as usize..run_start as usize + run_len].to_vec();
            let batch = self.build_batch(&partition, &item, run_start, run_len, run_ts)?;
            self.cur_row = next_cursor;
            if self.reverse {
                if run_start == 0 {
                    self.cur_block = None;
                }
            } else if next_cursor >= published {
                self.cur_block = None;
            }
            return Ok(IterOutput::batch(batch));
        }
    }

    fn is_disordered(&self) -> bool {
        let entity_id = match self.entity_ids.get(self.cur_entity_idx) {
            Some(&e) => e,
            None => return false,
        };
        self.partitions
            .iter()
            .any(|p| p.entity_item(entity_id).map(|e| e.is_disordered).unwrap_or(false))
    }
}
