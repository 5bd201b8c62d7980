//! Segment: a horizontal slice of column blocks inside a partition.
//!
//! A segment owns one file per column plus a shared string heap, and
//! remembers the schema it was created with (which may lag the table
//! schema after ALTER; readers pass the table schema and get converted
//! runs back). Lifecycle: Active → Inactive → Compressed. Once
//! inactive the files are immutable; compression repackages them into
//! a single `.sqz` container addressed by the same block ids.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::agg::{AggCalc, RunAgg, SumValue};
use crate::data::{
    bitmap_get, bitmap_len, bitmap_set, BlockId, ColumnSchema, ColumnType, Lsn, Schema, Timestamp,
};
use crate::payload::Payload;
use crate::storage::block::BlockItem;
use crate::storage::column_file::{BlockAgg, ColumnFile};
use crate::storage::convert;
use crate::storage::string_heap::StringHeap;
use crate::{Result, TesseraError};

const SEGMENT_META_MAGIC: u32 = 0x5453_4547; // "TSEG"

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SegmentStatus {
    Active = 0,
    Inactive = 1,
    Compressed = 2,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SegmentMeta {
    magic: u32,
    segment_id: BlockId,
    schema: Schema,
    block_rows: u32,
    max_blocks: u32,
    allocated_blocks: u32,
    status: SegmentStatus,
}

/// In-memory image of a compressed segment. Same layout math as the
/// live files; readers go through it transparently.
#[derive(Debug, Serialize, Deserialize)]
struct SealedImage {
    cols: Vec<Vec<u8>>,
    heap: Vec<u8>,
}

/// Result of reading one column run through a (possibly newer) table
/// schema. `bitmap` is re-based to the run (bit 0 = first row of the
/// run); `var` is present for var-length target columns.
#[derive(Debug, Clone)]
pub struct ColumnRun {
    pub cells: Vec<u8>,
    pub bitmap: Vec<u8>,
    pub var: Option<Vec<Option<Vec<u8>>>>,
    pub row_count: usize,
}

pub struct Segment {
    id: BlockId,
    dir: PathBuf,
    schema: Schema,
    block_rows: usize,
    max_blocks: u32,
    status: AtomicU8,
    alloc: Mutex<u32>,
    cols: Vec<ColumnFile>,
    heap: StringHeap,
    sealed: RwLock<Option<SealedImage>>,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("schema_version", &self.schema.version)
            .field("allocated", &*self.alloc.lock())
            .finish()
    }
}

fn meta_path(dir: &Path, id: BlockId) -> PathBuf {
    dir.join(format!("{id:08}.meta"))
}

fn col_path(dir: &Path, id: BlockId, col_id: u32) -> PathBuf {
    dir.join(format!("{id:08}.{col_id}"))
}

fn heap_path(dir: &Path, id: BlockId) -> PathBuf {
    dir.join(format!("{id:08}.s"))
}

fn sqz_path(dir: &Path, id: BlockId) -> PathBuf {
    dir.join(format!("{id:08}.sqz"))
}

impl Segment {
    /// Create a fresh active segment owning block ids
    /// `[id+1 ..= id+max_blocks]`.
    pub fn create(
        dir: &Path,
        id: BlockId,
        schema: &Schema,
        block_rows: usize,
        max_blocks: u32,
    ) -> Result<Self> {
        let meta = SegmentMeta {
            magic: SEGMENT_META_MAGIC,
            segment_id: id,
            schema: schema.clone(),
            block_rows: block_rows as u32,
            max_blocks,
            allocated_blocks: 0,
            status: SegmentStatus::Active,
        };
        write_meta(dir, &meta)?;
        Self::from_meta(dir, meta)
    }

    pub fn open(dir: &Path, id: BlockId) -> Result<Self> {
        let bytes = std::fs::read(meta_path(dir, id))?;
        let meta: SegmentMeta = bincode::deserialize(&bytes).map_err(|e| {
            TesseraError::Corruption(format!("segment {id} meta undecodable: {e}"))
        })?;
        if meta.magic != SEGMENT_META_MAGIC {
            return Err(TesseraError::Corruption(format!(
                "segment {id} meta has bad magic"
            )));
        }
        Self::from_meta(dir, meta)
    }

    fn from_meta(dir: &Path, meta: SegmentMeta) -> Result<Self> {
        let mut cols = Vec::with_capacity(meta.schema.column_count());
        for col in &meta.schema.columns {
            cols.push(ColumnFile::open(
                &col_path(dir, meta.segment_id, col.id),
                col.ty,
                meta.block_rows as usize,
            )?);
        }
        let heap = StringHeap::open(&heap_path(dir, meta.segment_id))?;
        let seg = Self {
            id: meta.segment_id,
            dir: dir.to_path_buf(),
            schema: meta.schema.clone(),
            block_rows: meta.block_rows as usize,
            max_blocks: meta.max_blocks,
            status: AtomicU8::new(meta.status as u8),
            alloc: Mutex::new(meta.allocated_blocks),
            cols,
            heap,
            sealed: RwLock::new(None),
        };
        if meta.status == SegmentStatus::Compressed {
            seg.load_sealed()?;
        }
        Ok(seg)
    }

    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn block_rows(&self) -> usize {
        self.block_rows
    }

    pub fn max_blocks(&self) -> u32 {
        self.max_blocks
    }

    pub fn status(&self) -> SegmentStatus {
        match self.status.load(Ordering::Acquire) {
            0 => SegmentStatus::Active,
            1 => SegmentStatus::Inactive,
            _ => SegmentStatus::Compressed,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status() == SegmentStatus::Active
    }

    /// Whether `block_id` belongs to this segment.
    pub fn owns_block(&self, block_id: BlockId) -> bool {
        block_id > self.id && block_id <= self.id + self.max_blocks
    }

    fn local(&self, block_id: BlockId) -> usize {
        debug_assert!(self.owns_block(block_id));
        (block_id - self.id - 1) as usize
    }

    /// Allocate the next block, growing the column files. Returns None
    /// when the segment is exhausted. Called under the partition's
    /// allocation mutex.
    pub fn alloc_block(&self) -> Result<Option<BlockId>> {
        if !self.is_active() {
            return Ok(None);
        }
        let mut alloc = self.alloc.lock();
        if *alloc >= self.max_blocks {
            return Ok(None);
        }
        let local = *alloc as usize;
        for col in &self.cols {
            col.reserve(local + 1)?;
        }
        *alloc += 1;
        let id = self.id + *alloc;
        self.persist_meta(*alloc)?;
        Ok(Some(id))
    }

    pub fn allocated_blocks(&self) -> u32 {
        *self.alloc.lock()
    }

    fn persist_meta(&self, allocated: u32) -> Result<()> {
        let meta = SegmentMeta {
            magic: SEGMENT_META_MAGIC,
            segment_id: self.id,
            schema: self.schema.clone(),
            block_rows: self.block_rows as u32,
            max_blocks: self.max_blocks,
            allocated_blocks: allocated,
            status: self.status(),
        };
        write_meta(&self.dir, &meta)
    }

    // ========================================================================
    // Write path
    // ========================================================================

    /// Append `n` payload rows (starting at `payload_start`) into
    /// `block_item` at `start_row`. Cells are bulk-copied, var values
    /// go through the string heap, and the per-block aggregates are
    /// maintained. Publishing visibility is the caller's job.
    pub fn push_payload(
        &self,
        block_item: &BlockItem,
        start_row: u32,
        payload: &Payload,
        payload_start: usize,
        n: usize,
    ) -> Result<()> {
        if payload.schema().version != self.schema.version {
            return Err(TesseraError::SchemaMismatch(format!(
                "payload schema v{} against segment schema v{}",
                payload.schema().version,
                self.schema.version
            )));
        }
        let local = self.local(block_item.block_id);
        let start = start_row as usize;

        // while the slots are being rewritten the stored aggregates are
        // not trustworthy
        block_item.set_agg_available(false);

        for (ci, col) in self.schema.columns.iter().enumerate() {
            if col.ty.is_var_len() {
                self.push_var_column(ci, local, start, payload, payload_start, n, block_item)?;
            } else {
                self.push_fixed_column(ci, local, start, payload, payload_start, n, block_item)?;
            }
        }

        if !block_item.is_overflow() {
            block_item.set_agg_available(true);
        }
        Ok(())
    }

    fn push_fixed_column(
        &self,
        ci: usize,
        local: usize,
        start: usize,
        payload: &Payload,
        payload_start: usize,
        n: usize,
        block_item: &BlockItem,
    ) -> Result<()> {
        let file = &self.cols[ci];
        let ty = self.schema.columns[ci].ty;
        let cells = payload.cells(ci, payload_start, n);
        file.write_cells(local, start, cells)?;
        file.write_null_bits(local, start, payload.column_bitmap(ci), payload_start, n)?;

        let run = AggCalc::new(cells, payload.column_bitmap(ci), payload_start, ty, n).compute();
        self.merge_agg_slots(ci, local, run, None, block_item)
    }

    fn push_var_column(
        &self,
        ci: usize,
        local: usize,
        start: usize,
        payload: &Payload,
        payload_start: usize,
        n: usize,
        block_item: &BlockItem,
    ) -> Result<()> {
        let file = &self.cols[ci];
        let mut run = RunAgg::default();
        let mut min: Option<(Vec<u8>, u64)> = None;
        let mut max: Option<(Vec<u8>, u64)> = None;

        for i in 0..n {
            let row = payload_start + i;
            let cell_row = start + i;
            match payload.var_value(ci, row) {
                Some(value) => {
                    let off = self.heap.append(value)?;
                    let mut cell = [0u8; 8];
                    LittleEndian::write_u64(&mut cell, off);
                    file.write_cell(local, cell_row, &cell)?;
                    run.count += 1;
                    if min.as_ref().map(|(v, _)| value < v.as_slice()).unwrap_or(true) {
                        min = Some((value.to_vec(), off));
                    }
                    if max.as_ref().map(|(v, _)| value > v.as_slice()).unwrap_or(true) {
                        max = Some((value.to_vec(), off));
                    }
                }
                None => {
                    file.write_cell(local, cell_row, &[0u8; 8])?;
                    file.set_null(local, cell_row)?;
                }
            }
        }
        self.merge_agg_slots(ci, local, run, Some((min, max)), block_item)
    }

    /// Fold a run into the stored block aggregate slots. For var
    /// columns the run's extrema arrive as (value, heap offset) pairs
    /// and the slots store the offsets.
    #[allow(clippy::type_complexity)]
    fn merge_agg_slots(
        &self,
        ci: usize,
        local: usize,
        run: RunAgg,
        var_extrema: Option<(Option<(Vec<u8>, u64)>, Option<(Vec<u8>, u64)>)>,
        block_item: &BlockItem,
    ) -> Result<()> {
        let file = &self.cols[ci];
        let ty = self.schema.columns[ci].ty;
        let mut agg = file.read_agg(local)?;
        let had_rows = agg.count > 0;

        if let Some((min, max)) = var_extrema {
            // var column: compare dereferenced values
            if let Some((min_v, min_off)) = min {
                let replace = if had_rows {
                    let cur = LittleEndian::read_u64(&agg.min);
                    cur == 0 || self.heap.with_value(cur, |v| min_v.as_slice() < v)?
                } else {
                    true
                };
                if replace {
                    LittleEndian::write_u64(&mut agg.min, min_off);
                }
            }
            if let Some((max_v, max_off)) = max {
                let replace = if had_rows {
                    let cur = LittleEndian::read_u64(&agg.max);
                    cur == 0 || self.heap.with_value(cur, |v| max_v.as_slice() > v)?
                } else {
                    true
                };
                if replace {
                    LittleEndian::write_u64(&mut agg.max, max_off);
                }
            }
            agg.count += run.count as u16;
            file.write_agg(local, &agg)?;
            return Ok(());
        }

        if let Some(new_min) = &run.min {
            if !had_rows
                || crate::agg::cmp_cells(new_min, &agg.min, ty) == std::cmp::Ordering::Less
            {
                agg.min = new_min.clone();
            }
        }
        if let Some(new_max) = &run.max {
            if !had_rows
                || crate::agg::cmp_cells(new_max, &agg.max, ty) == std::cmp::Ordering::Greater
            {
                agg.max = new_max.clone();
            }
        }
        if let (Some(slot), Some(run_sum)) = (agg.sum.as_mut(), run.sum) {
            let mut acc = if had_rows {
                if block_item.is_overflow() || ty.is_float() {
                    SumValue::Float(LittleEndian::read_f64(slot))
                } else {
                    SumValue::Int(LittleEndian::read_i64(slot))
                }
            } else if ty.is_float() {
                SumValue::Float(0.0)
            } else {
                SumValue::Int(0)
            };
            let mut overflowed = acc.add(run_sum) || run.overflow;
            // a total past the column's native range also counts as
            // overflow: the slot switches to f64
            if let (SumValue::Int(v), Some((lo, hi))) = (acc, ty.int_range()) {
                if v < lo || v > hi {
                    acc = SumValue::Float(v as f64);
                    overflowed = true;
                }
            }
            match acc {
                SumValue::Int(v) => LittleEndian::write_i64(slot, v),
                SumValue::Float(v) => LittleEndian::write_f64(slot, v),
            }
            if overflowed {
                block_item.set_overflow(true);
            }
        }
        agg.count += run.count as u16;
        file.write_agg(local, &agg)?;
        Ok(())
    }

    /// Tombstone support: nothing to do at the segment level (rows are
    /// never moved); exposed so callers can force a heap/file sync.
    pub fn sync(&self) -> Result<()> {
        for col in &self.cols {
            col.sync()?;
        }
        self.heap.sync()
    }

    // ========================================================================
    // Read path
    // ========================================================================

    fn col_pos_by_id(&self, col_id: u32) -> Option<usize> {
        self.schema.columns.iter().position(|c| c.id == col_id)
    }

    /// Raw cells + bitmap of one stored column run (no conversion).
    fn stored_run(&self, ci: usize, local: usize, start: usize, n: usize) -> Result<(Vec<u8>, Vec<u8>)> {
        if let Some(sealed) = self.sealed.read().as_ref() {
            let ty = self.schema.columns[ci].ty;
            let lay = crate::data::BlockLayout::new(ty, self.block_rows);
            let base = local * lay.total_len;
            let img = &sealed.cols[ci];
            let cells =
                img[base + lay.value_off(start)..base + lay.value_off(start + n)].to_vec();
            let bitmap = img[base..base + bitmap_len(self.block_rows)].to_vec();
            return Ok((cells, bitmap));
        }
        let file = &self.cols[ci];
        Ok((file.read_cells(local, start, n)?, file.read_bitmap(local)?))
    }

    fn heap_get(&self, offset: u64) -> Result<Vec<u8>> {
        if let Some(sealed) = self.sealed.read().as_ref() {
            let off = offset as usize;
            let len = LittleEndian::read_u16(&sealed.heap[off..]) as usize;
            return Ok(sealed.heap[off + 2..off + 2 + len].to_vec());
        }
        self.heap.get(offset)
    }

    /// Read a run of one column through the caller's (table) schema.
    /// Unchanged columns copy straight out; changed columns convert
    /// cell by cell; columns the segment predates read as all-null.
    pub fn read_column_run(
        &self,
        target: &ColumnSchema,
        block_id: BlockId,
        start_row: u32,
        n: usize,
    ) -> Result<ColumnRun> {
        let local = self.local(block_id);
        let start = start_row as usize;
        let out_bm_len = bitmap_len(n);

        let ci = match self.col_pos_by_id(target.id) {
            Some(ci) => ci,
            None => {
                // column added after this segment was written
                let mut bitmap = vec![0u8; out_bm_len];
                for i in 0..n {
                    bitmap_set(&mut bitmap, i);
                }
                return Ok(ColumnRun {
                    cells: vec![0u8; n * target.ty.fixed_len()],
                    bitmap,
                    var: if target.ty.is_var_len() {
                        Some(vec![None; n])
                    } else {
                        None
                    },
                    row_count: n,
                });
            }
        };
        let src_ty = self.schema.columns[ci].ty;
        let (cells, block_bitmap) = self.stored_run(ci, local, start, n)?;

        let mut bitmap = vec![0u8; out_bm_len];
        for i in 0..n {
            if bitmap_get(&block_bitmap, start + i) {
                bitmap_set(&mut bitmap, i);
            }
        }

        // fast path: same physical type
        if src_ty == target.ty {
            let var = if target.ty.is_var_len() {
                Some(self.materialize_var(&cells, &bitmap, n)?)
            } else {
                None
            };
            return Ok(ColumnRun {
                cells,
                bitmap,
                var,
                row_count: n,
            });
        }

        // conversion path
        let src_w = src_ty.fixed_len();
        let dst_w = target.ty.fixed_len();
        let mut out = vec![0u8; n * dst_w];
        let mut var_out: Option<Vec<Option<Vec<u8>>>> =
            target.ty.is_var_len().then(|| vec![None; n]);

        for i in 0..n {
            if bitmap_get(&bitmap, i) {
                continue;
            }
            let src_cell = &cells[i * src_w..(i + 1) * src_w];
            let converted = if src_ty.is_var_len() {
                let off = LittleEndian::read_u64(src_cell);
                if off == 0 {
                    None
                } else {
                    let value = self.heap_get(off)?;
                    if target.ty.is_var_len() {
                        var_out.as_mut().unwrap()[i] = Some(value);
                        continue;
                    }
                    convert::parse_var_to_fixed(&value, target.ty)
                }
            } else if target.ty.is_var_len() {
                match convert::format_fixed_to_var(src_cell, src_ty) {
                    Some(v) => {
                        var_out.as_mut().unwrap()[i] = Some(v);
                        continue;
                    }
                    None => None,
                }
            } else {
                convert::convert_fixed(src_cell, src_ty, target.ty)
            };
            match converted {
                Some(v) => out[i * dst_w..i * dst_w + v.len()].copy_from_slice(&v),
                None => bitmap_set(&mut bitmap, i),
            }
        }
        Ok(ColumnRun {
            cells: out,
            bitmap,
            var: var_out,
            row_count: n,
        })
    }

    fn materialize_var(
        &self,
        cells: &[u8],
        bitmap: &[u8],
        n: usize,
    ) -> Result<Vec<Option<Vec<u8>>>> {
        let mut out = vec![None; n];
        for (i, slot) in out.iter_mut().enumerate() {
            if bitmap_get(bitmap, i) {
                continue;
            }
            let off = LittleEndian::read_u64(&cells[i * 8..(i + 1) * 8]);
            if off != 0 {
                *slot = Some(self.heap_get(off)?);
            }
        }
        Ok(out)
    }

    /// Row timestamps of a run (column 0).
    pub fn read_timestamps(&self, block_id: BlockId, start_row: u32, n: usize) -> Result<Vec<Timestamp>> {
        let local = self.local(block_id);
        let (cells, _) = self.stored_run(0, local, start_row as usize, n)?;
        Ok((0..n)
            .map(|i| LittleEndian::read_i64(&cells[i * 16..i * 16 + 8]))
            .collect())
    }

    /// Row LSNs of a run (column 0 LSN slots).
    pub fn read_lsns(&self, block_id: BlockId, start_row: u32, n: usize) -> Result<Vec<Lsn>> {
        let local = self.local(block_id);
        let (cells, _) = self.stored_run(0, local, start_row as usize, n)?;
        Ok((0..n)
            .map(|i| LittleEndian::read_u64(&cells[i * 16 + 8..i * 16 + 16]))
            .collect())
    }

    /// Stored block aggregate of one table column, with a flag telling
    /// the caller whether the stored type matches the projection (a
    /// mismatch forces recomputation from raw cells).
    pub fn read_block_agg(
        &self,
        target: &ColumnSchema,
        block_id: BlockId,
    ) -> Result<Option<(BlockAgg, bool)>> {
        let local = self.local(block_id);
        let ci = match self.col_pos_by_id(target.id) {
            Some(ci) => ci,
            None => return Ok(None),
        };
        let ty = self.schema.columns[ci].ty;
        let agg = if let Some(sealed) = self.sealed.read().as_ref() {
            let lay = crate::data::BlockLayout::new(ty, self.block_rows);
            let base = local * lay.total_len;
            let img = &sealed.cols[ci];
            BlockAgg {
                count: LittleEndian::read_u16(&img[base + lay.count_off..]),
                max: img[base + lay.max_off..base + lay.max_off + lay.cell].to_vec(),
                min: img[base + lay.min_off..base + lay.min_off + lay.cell].to_vec(),
                sum: (lay.sum_len > 0).then(|| {
                    let mut s = [0u8; 8];
                    s.copy_from_slice(&img[base + lay.sum_off..base + lay.sum_off + 8]);
                    s
                }),
            }
        } else {
            self.cols[ci].read_agg(local)?
        };
        Ok(Some((agg, ty == target.ty)))
    }

    /// Dereference a var min/max slot (heap offset) to its value.
    pub fn deref_var_offset(&self, offset: u64) -> Result<Option<Vec<u8>>> {
        if offset == 0 {
            return Ok(None);
        }
        Ok(Some(self.heap_get(offset)?))
    }

    // ========================================================================
    // Sealing
    // ========================================================================

    /// Stop accepting allocations. Idempotent.
    pub fn seal(&self) -> Result<()> {
        if self.status() == SegmentStatus::Active {
            self.status
                .store(SegmentStatus::Inactive as u8, Ordering::Release);
            self.persist_meta(self.allocated_blocks())?;
        }
        Ok(())
    }

    /// Package the sealed files into the compressed container and drop
    /// the raw files. Readers keep working through the same block ids.
    pub fn compress(&self) -> Result<()> {
        self.seal()?;
        if self.status() == SegmentStatus::Compressed {
            return Ok(());
        }
        let allocated = self.allocated_blocks() as usize;
        let mut cols = Vec::with_capacity(self.cols.len());
        for col in &self.cols {
            let mut img = Vec::new();
            for local in 0..allocated {
                img.extend_from_slice(&col.block_image(local)?);
            }
            cols.push(img);
        }
        let image = SealedImage {
            cols,
            heap: self.heap.image()?,
        };
        let raw = bincode::serialize(&image)?;
        let compressed = lz4_flex::compress_prepend_size(&raw);
        let path = sqz_path(&self.dir, self.id);
        std::fs::write(&path, &compressed)?;

        *self.sealed.write() = Some(image);
        self.status
            .store(SegmentStatus::Compressed as u8, Ordering::Release);
        self.persist_meta(self.allocated_blocks())?;

        for col in &self.schema.columns {
            let _ = std::fs::remove_file(col_path(&self.dir, self.id, col.id));
        }
        let _ = std::fs::remove_file(heap_path(&self.dir, self.id));
        info!(segment = self.id, bytes = compressed.len(), "segment compressed");
        Ok(())
    }

    fn load_sealed(&self) -> Result<()> {
        let compressed = std::fs::read(sqz_path(&self.dir, self.id))?;
        let raw = lz4_flex::decompress_size_prepended(&compressed).map_err(|e| {
            TesseraError::Corruption(format!("segment {} container undecodable: {e}", self.id))
        })?;
        let image: SealedImage = bincode::deserialize(&raw)?;
        *self.sealed.write() = Some(image);
        Ok(())
    }

    /// Delete all files of this segment.
    pub fn remove_files(&self) -> Result<()> {
        let _ = std::fs::remove_file(meta_path(&self.dir, self.id));
        let _ = std::fs::remove_file(sqz_path(&self.dir, self.id));
        for col in &self.schema.columns {
            let _ = std::fs::remove_file(col_path(&self.dir, self.id, col.id));
        }
        let _ = std::fs::remove_file(heap_path(&self.dir, self.id));
        Ok(())
    }
}

fn write_meta(dir: &Path, meta: &SegmentMeta) -> Result<()> {
    let bytes = bincode::serialize(meta)?;
    std::fs::write(meta_path(dir, meta.segment_id), bytes)?;
    Ok(())
}

/// List segment ids present in a partition directory.
pub fn list_segments(dir: &Path) -> Result<Vec<BlockId>> {
    let mut ids = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(".meta") {
            if let Ok(id) = stem.parse::<BlockId>() {
                ids.push(id);
            }
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::test_support::{simple_payload, simple_schema};
    use crate::payload::{FieldValue, PayloadBuilder};
    use tempfile::tempdir;

    fn block_item_for(seg: &Segment, cap: u32) -> BlockItem {
        let id = seg.alloc_block().unwrap().unwrap();
        BlockItem::new(id, 1, seg.id(), cap)
    }

    #[test]
    fn test_push_and_read_fixed() {
        let dir = tempdir().unwrap();
        let schema = simple_schema();
        let seg = Segment::create(dir.path(), 0, &schema, 8, 4).unwrap();
        let item = block_item_for(&seg, 8);

        let p = simple_payload(&schema, b"e1", &[(1000, Some(10)), (2000, None), (3000, Some(30))]);
        seg.push_payload(&item, 0, &p, 0, 3).unwrap();
        item.publish(3);

        let run = seg
            .read_column_run(&schema.columns[1], item.block_id, 0, 3)
            .unwrap();
        assert_eq!(LittleEndian::read_i32(&run.cells[0..4]), 10);
        assert!(bitmap_get(&run.bitmap, 1));
        assert_eq!(LittleEndian::read_i32(&run.cells[8..12]), 30);

        assert_eq!(seg.read_timestamps(item.block_id, 0, 3).unwrap(), vec![1000, 2000, 3000]);

        let (agg, matches) = seg
            .read_block_agg(&schema.columns[1], item.block_id)
            .unwrap()
            .unwrap();
        assert!(matches);
        assert_eq!(agg.count, 2);
        assert_eq!(LittleEndian::read_i32(&agg.min), 10);
        assert_eq!(LittleEndian::read_i32(&agg.max), 30);
        assert_eq!(LittleEndian::read_i64(&agg.sum.unwrap()), 40);
        assert!(item.agg_usable());
    }

    #[test]
    fn test_incremental_agg_across_pushes() {
        let dir = tempdir().unwrap();
        let schema = simple_schema();
        let seg = Segment::create(dir.path(), 0, &schema, 8, 4).unwrap();
        let item = block_item_for(&seg, 8);

        let p1 = simple_payload(&schema, b"e1", &[(1000, Some(5))]);
        seg.push_payload(&item, 0, &p1, 0, 1).unwrap();
        item.publish(1);
        let p2 = simple_payload(&schema, b"e1", &[(2000, Some(-2)), (3000, Some(9))]);
        seg.push_payload(&item, 1, &p2, 0, 2).unwrap();
        item.publish(2);

        let (agg, _) = seg
            .read_block_agg(&schema.columns[1], item.block_id)
            .unwrap()
            .unwrap();
        assert_eq!(agg.count, 3);
        assert_eq!(LittleEndian::read_i32(&agg.min), -2);
        assert_eq!(LittleEndian::read_i32(&agg.max), 9);
        assert_eq!(LittleEndian::read_i64(&agg.sum.unwrap()), 12);
    }

    #[test]
    fn test_sum_overflow_clears_agg_and_stores_f64() {
        let dir = tempdir().unwrap();
        let schema = simple_schema();
        let seg = Segment::create(dir.path(), 0, &schema, 8, 4).unwrap();
        let item = block_item_for(&seg, 8);

        // the i64 accumulator only wraps with Int64-scale values
        let schema64 = Schema::new(vec![
            ColumnSchema::new(1, "k_timestamp", ColumnType::TimestampLsn),
            ColumnSchema::new(2, "v", ColumnType::Int64),
        ]);
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        let seg64 = Segment::create(&dir.path().join("sub"), 0, &schema64, 8, 4).unwrap();
        let item64 = block_item_for(&seg64, 8);

        let mut b = PayloadBuilder::new(&schema64, b"e1");
        b.add_row(vec![FieldValue::Timestamp(1), FieldValue::Int64(i64::MAX)]);
        b.add_row(vec![FieldValue::Timestamp(2), FieldValue::Int64(1)]);
        let p = Payload::parse(b.build().unwrap(), &schema64).unwrap();
        seg64.push_payload(&item64, 0, &p, 0, 2).unwrap();
        item64.publish(2);

        assert!(item64.is_overflow());
        assert!(!item64.agg_usable());
        let (agg, _) = seg64
            .read_block_agg(&schema64.columns[1], item64.block_id)
            .unwrap()
            .unwrap();
        let stored = LittleEndian::read_f64(&agg.sum.unwrap());
        assert_eq!(stored, i64::MAX as f64 + 1.0);
        let _ = item; // first segment unused beyond allocation
    }

    #[test]
    fn test_var_column_heap_and_agg() {
        let dir = tempdir().unwrap();
        let schema = Schema::new(vec![
            ColumnSchema::new(1, "k_timestamp", ColumnType::TimestampLsn),
            ColumnSchema::new(2, "name", ColumnType::VarChar(32)),
        ]);
        let seg = Segment::create(dir.path(), 0, &schema, 8, 4).unwrap();
        let item = block_item_for(&seg, 8);

        let mut b = PayloadBuilder::new(&schema, b"e1");
        b.add_row(vec![FieldValue::Timestamp(1), FieldValue::Str("pear".into())]);
        b.add_row(vec![FieldValue::Timestamp(2), FieldValue::Null]);
        b.add_row(vec![FieldValue::Timestamp(3), FieldValue::Str("apple".into())]);
        let p = Payload::parse(b.build().unwrap(), &schema).unwrap();
        seg.push_payload(&item, 0, &p, 0, 3).unwrap();
        item.publish(3);

        let run = seg
            .read_column_run(&schema.columns[1], item.block_id, 0, 3)
            .unwrap();
        let var = run.var.unwrap();
        assert_eq!(var[0].as_deref(), Some(&b"pear"[..]));
        assert_eq!(var[1], None);
        assert_eq!(var[2].as_deref(), Some(&b"apple"[..]));

        let (agg, _) = seg
            .read_block_agg(&schema.columns[1], item.block_id)
            .unwrap()
            .unwrap();
        assert_eq!(agg.count, 2);
        let min_off = LittleEndian::read_u64(&agg.min);
        assert_eq!(seg.deref_var_offset(min_off).unwrap().unwrap(), b"apple");
        assert_eq!(agg.sum, None);
    }

    #[test]
    fn test_schema_lag_conversion_on_read() {
        let dir = tempdir().unwrap();
        let schema = simple_schema(); // v has Int32
        let seg = Segment::create(dir.path(), 0, &schema, 8, 4).unwrap();
        let item = block_item_for(&seg, 8);
        let p = simple_payload(&schema, b"e1", &[(1000, Some(7))]);
        seg.push_payload(&item, 0, &p, 0, 1).unwrap();
        item.publish(1);

        // table later altered v to Int64
        let mut altered = schema.columns[1].clone();
        altered.ty = ColumnType::Int64;
        let run = seg.read_column_run(&altered, item.block_id, 0, 1).unwrap();
        assert_eq!(LittleEndian::read_i64(&run.cells), 7);

        // and a column the segment never had reads as null
        let new_col = ColumnSchema::new(9, "added", ColumnType::Float64);
        let run = seg.read_column_run(&new_col, item.block_id, 0, 1).unwrap();
        assert!(bitmap_get(&run.bitmap, 0));
    }

    #[test]
    fn test_compress_roundtrip() {
        let dir = tempdir().unwrap();
        let schema = simple_schema();
        let seg = Segment::create(dir.path(), 0, &schema, 8, 4).unwrap();
        let item = block_item_for(&seg, 8);
        let p = simple_payload(&schema, b"e1", &[(1000, Some(1)), (2000, Some(2))]);
        seg.push_payload(&item, 0, &p, 0, 2).unwrap();
        item.publish(2);

        seg.compress().unwrap();
        assert_eq!(seg.status(), SegmentStatus::Compressed);
        // raw files gone, container remains
        assert!(!col_path(dir.path(), 0, 2).exists());
        assert!(sqz_path(dir.path(), 0).exists());

        // reads keep flowing through the same ids
        let run = seg
            .read_column_run(&schema.columns[1], item.block_id, 0, 2)
            .unwrap();
        assert_eq!(LittleEndian::read_i32(&run.cells[4..8]), 2);

        // reopen from disk
        let seg2 = Segment::open(dir.path(), 0).unwrap();
        assert_eq!(seg2.status(), SegmentStatus::Compressed);
        assert_eq!(
            seg2.read_timestamps(item.block_id, 0, 2).unwrap(),
            vec![1000, 2000]
        );
    }

    #[test]
    fn test_alloc_exhaustion() {
        let dir = tempdir().unwrap();
        let schema = simple_schema();
        let seg = Segment::create(dir.path(), 0, &schema, 4, 2).unwrap();
        assert_eq!(seg.alloc_block().unwrap(), Some(1));
        assert_eq!(seg.alloc_block().unwrap(), Some(2));
        assert_eq!(seg.alloc_block().unwrap(), None);
        seg.seal().unwrap();
        assert_eq!(seg.status(), SegmentStatus::Inactive);
    }
}
