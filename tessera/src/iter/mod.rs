//! Iterator layer: raw range scans, per-entity aggregates, tag scans.
//!
//! Iterators hold `Arc` handles to the partitions (and transitively
//! the segments and string heaps) they read, so nothing they reference
//! is unmapped mid-scan. `next` blocks the calling thread; callers
//! cancel by dropping the iterator between calls, and deadlines ride
//! in on the `OpContext`.

pub mod agg;
pub mod raw;
pub mod tag;

pub use agg::{AggIterator, AggRow, AggValue};
pub use raw::RawIterator;
pub use tag::TagIterator;

use crate::context::OpContext;
use crate::data::{bitmap_get, ColumnType, EntityId, Timestamp};
use crate::Result;

/// One projected column of a result batch. `bitmap` is re-based to the
/// batch (bit 0 = first row); var columns carry materialized values.
#[derive(Debug, Clone)]
pub struct ColumnBatch {
    pub ty: ColumnType,
    pub cells: Vec<u8>,
    pub bitmap: Vec<u8>,
    pub var: Option<Vec<Option<Vec<u8>>>>,
    pub row_count: usize,
}

impl ColumnBatch {
    pub fn is_null(&self, row: usize) -> bool {
        bitmap_get(&self.bitmap, row)
    }

    pub fn cell(&self, row: usize) -> &[u8] {
        let w = self.ty.fixed_len();
        &self.cells[row * w..(row + 1) * w]
    }

    pub fn var_value(&self, row: usize) -> Option<&[u8]> {
        self.var.as_ref()?.get(row)?.as_deref()
    }

    /// Reverse row order in place (used by descending scans).
    pub fn reverse_rows(&mut self) {
        let w = self.ty.fixed_len();
        let n = self.row_count;
        let mut cells = vec![0u8; self.cells.len()];
        let mut bitmap = vec![0u8; self.bitmap.len()];
        for row in 0..n {
            let src = n - 1 - row;
            cells[row * w..(row + 1) * w].copy_from_slice(&self.cells[src * w..(src + 1) * w]);
            if bitmap_get(&self.bitmap, src) {
                crate::data::bitmap_set(&mut bitmap, row);
            }
        }
        self.cells = cells;
        self.bitmap = bitmap;
        if let Some(var) = &mut self.var {
            var.reverse();
        }
    }
}

/// One batch of rows, all from a single block of a single entity.
#[derive(Debug, Clone)]
pub struct ResultBatch {
    pub entity_id: EntityId,
    pub timestamps: Vec<Timestamp>,
    pub columns: Vec<ColumnBatch>,
    pub row_count: usize,
}

/// Result of one `next` call.
#[derive(Debug)]
pub struct IterOutput {
    pub batch: Option<ResultBatch>,
    pub finished: bool,
}

impl IterOutput {
    pub fn finished() -> Self {
        Self {
            batch: None,
            finished: true,
        }
    }

    pub fn batch(batch: ResultBatch) -> Self {
        Self {
            batch: Some(batch),
            finished: false,
        }
    }

    pub fn row_count(&self) -> usize {
        self.batch.as_ref().map(|b| b.row_count).unwrap_or(0)
    }
}

/// Common surface of the raw iterators handed to the execution layer.
pub trait BatchIterator: Send {
    /// Produce the next batch. `watermark` lets the caller stop the
    /// scan once partitions move past the interesting side of time.
    fn next(&mut self, ctx: &OpContext, watermark: Option<Timestamp>) -> Result<IterOutput>;

    /// Whether any partition of the entity being scanned holds
    /// out-of-order rows (callers may need to sort).
    fn is_disordered(&self) -> bool {
        false
    }
}

/// Multiplexes one iterator per sub-group, exhausting them in order.
pub struct TableIterator {
    iters: Vec<Box<dyn BatchIterator>>,
    current: usize,
}

impl TableIterator {
    pub fn new(iters: Vec<Box<dyn BatchIterator>>) -> Self {
        Self { iters, current: 0 }
    }

    pub fn next(&mut self, ctx: &OpContext, watermark: Option<Timestamp>) -> Result<IterOutput> {
        while self.current < self.iters.len() {
            let out = self.iters[self.current].next(ctx, watermark)?;
            if out.finished {
                self.current += 1;
                continue;
            }
            return Ok(out);
        }
        Ok(IterOutput::finished())
    }

    pub fn is_disordered(&self) -> bool {
        self.iters
            .get(self.current)
            .map(|i| i.is_disordered())
            .unwrap_or(false)
    }
}
