//! One memory-mapped file per (segment, column).
//!
//! Block `k` of the column starts at `k * block_len`; inside a block
//! the null bitmap, count, max/min/sum slots and the value array are
//! addressed through `BlockLayout`. The file grows by whole blocks,
//! page-rounded.

use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::RwLock;

use crate::data::{bitmap_len, bitmap_set, BlockLayout, ColumnType};
use crate::storage::mmap_file::MmapFile;
use crate::Result;

/// Stored pre-aggregates of one block of one column, as raw slot
/// images. `min`/`max` are cell-sized (heap offsets for var columns);
/// `sum` is present only for summable columns.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockAgg {
    pub count: u16,
    pub min: Vec<u8>,
    pub max: Vec<u8>,
    pub sum: Option<[u8; 8]>,
}

#[derive(Debug)]
pub struct ColumnFile {
    ty: ColumnType,
    layout: BlockLayout,
    inner: RwLock<MmapFile>,
}

impl ColumnFile {
    pub fn open(path: &Path, ty: ColumnType, block_rows: usize) -> Result<Self> {
        let file = MmapFile::open(path)?;
        Ok(Self {
            ty,
            layout: BlockLayout::new(ty, block_rows),
            inner: RwLock::new(file),
        })
    }

    pub fn ty(&self) -> ColumnType {
        self.ty
    }

    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    fn block_off(&self, local_block: usize) -> usize {
        local_block * self.layout.total_len
    }

    /// Ensure space for `block_count` blocks.
    pub fn reserve(&self, block_count: usize) -> Result<()> {
        let need = block_count * self.layout.total_len;
        let mut file = self.inner.write();
        file.reserve(need)
    }

    // ========================================================================
    // Cells
    // ========================================================================

    /// Bulk-copy a contiguous run of pre-encoded cells.
    pub fn write_cells(&self, local_block: usize, start_row: usize, cells: &[u8]) -> Result<()> {
        debug_assert_eq!(cells.len() % self.layout.cell, 0);
        let off = self.block_off(local_block) + self.layout.value_off(start_row);
        let mut file = self.inner.write();
        file.write_at(off, cells)
    }

    pub fn write_cell(&self, local_block: usize, row: usize, cell: &[u8]) -> Result<()> {
        debug_assert_eq!(cell.len(), self.layout.cell);
        self.write_cells(local_block, row, cell)
    }

    /// Copy out a contiguous cell run. Copied because appends into a
    /// neighboring block may grow (and remap) the file.
    pub fn read_cells(&self, local_block: usize, start_row: usize, n: usize) -> Result<Vec<u8>> {
        let off = self.block_off(local_block) + self.layout.value_off(start_row);
        let file = self.inner.read();
        Ok(file.read_at(off, n * self.layout.cell)?.to_vec())
    }

    pub fn read_cell(&self, local_block: usize, row: usize) -> Result<Vec<u8>> {
        self.read_cells(local_block, row, 1)
    }

    // ========================================================================
    // Null bitmap
    // ========================================================================

    pub fn read_bitmap(&self, local_block: usize) -> Result<Vec<u8>> {
        let off = self.block_off(local_block);
        let file = self.inner.read();
        Ok(file.read_at(off, bitmap_len(self.layout.rows))?.to_vec())
    }

    /// Merge payload null bits for rows `[start_row, start_row + n)`.
    /// `payload_bitmap` is indexed from `payload_start`.
    pub fn write_null_bits(
        &self,
        local_block: usize,
        start_row: usize,
        payload_bitmap: &[u8],
        payload_start: usize,
        n: usize,
    ) -> Result<()> {
        let off = self.block_off(local_block);
        let mut file = self.inner.write();
        let bm_len = bitmap_len(self.layout.rows);
        let bm = &mut file.as_mut_slice()[off..off + bm_len];
        for i in 0..n {
            if crate::data::bitmap_get(payload_bitmap, payload_start + i) {
                bitmap_set(bm, start_row + i);
            }
        }
        Ok(())
    }

    pub fn set_null(&self, local_block: usize, row: usize) -> Result<()> {
        let off = self.block_off(local_block);
        let mut file = self.inner.write();
        let bm_len = bitmap_len(self.layout.rows);
        bitmap_set(&mut file.as_mut_slice()[off..off + bm_len], row);
        Ok(())
    }

    // ========================================================================
    // Per-block aggregates
    // ========================================================================

    pub fn read_agg(&self, local_block: usize) -> Result<BlockAgg> {
        let base = self.block_off(local_block);
        let file = self.inner.read();
        let count = LittleEndian::read_u16(file.read_at(base + self.layout.count_off, 2)?);
        let max = file.read_at(base + self.layout.max_off, self.layout.cell)?.to_vec();
        let min = file.read_at(base + self.layout.min_off, self.layout.cell)?.to_vec();
        let sum = if self.layout.sum_len > 0 {
            let mut s = [0u8; 8];
            s.copy_from_slice(file.read_at(base + self.layout.sum_off, 8)?);
            Some(s)
        } else {
            None
        };
        Ok(BlockAgg {
            count,
            min,
            max,
            sum,
        })
    }

    pub fn write_agg(&self, local_block: usize, agg: &BlockAgg) -> Result<()> {
        let base = self.block_off(local_block);
        let mut file = self.inner.write();
        let mut count = [0u8; 2];
        LittleEndian::write_u16(&mut count, agg.count);
        file.write_at(base + self.layout.count_off, &count)?;
        file.write_at(base + self.layout.max_off, &agg.max)?;
        file.write_at(base + self.layout.min_off, &agg.min)?;
        if let Some(sum) = &agg.sum {
            file.write_at(base + self.layout.sum_off, sum)?;
        }
        Ok(())
    }

    /// Whole-block image (header + values) for sealing.
    pub fn block_image(&self, local_block: usize) -> Result<Vec<u8>> {
        let off = self.block_off(local_block);
        let file = self.inner.read();
        Ok(file.read_at(off, self.layout.total_len)?.to_vec())
    }

    pub fn sync(&self) -> Result<()> {
        self.inner.read().sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_cells_roundtrip() {
        let dir = tempdir().unwrap();
        let col = ColumnFile::open(&dir.path().join("0001.2"), ColumnType::Int32, 8).unwrap();
        col.reserve(2).unwrap();

        let cells: Vec<u8> = [1i32, 2, 3]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        col.write_cells(1, 2, &cells).unwrap();
        assert_eq!(col.read_cells(1, 2, 3).unwrap(), cells);
        // neighboring rows untouched
        assert_eq!(col.read_cell(1, 0).unwrap(), vec![0u8; 4]);
    }

    #[test]
    fn test_null_bits_merge() {
        let dir = tempdir().unwrap();
        let col = ColumnFile::open(&dir.path().join("0001.3"), ColumnType::Int64, 16).unwrap();
        col.reserve(1).unwrap();

        // payload rows 0..4, of which payload row 1 is null; copied to
        // block rows 4..8
        let payload_bm = vec![0b0000_0010u8];
        col.write_null_bits(0, 4, &payload_bm, 0, 4).unwrap();
        let bm = col.read_bitmap(0).unwrap();
        assert!(!crate::data::bitmap_get(&bm, 4));
        assert!(crate::data::bitmap_get(&bm, 5));
        assert!(!crate::data::bitmap_get(&bm, 6));
    }

    #[test]
    fn test_agg_slots() {
        let dir = tempdir().unwrap();
        let col = ColumnFile::open(&dir.path().join("0001.4"), ColumnType::Int32, 8).unwrap();
        col.reserve(1).unwrap();

        let agg = BlockAgg {
            count: 5,
            min: 1i32.to_le_bytes().to_vec(),
            max: 9i32.to_le_bytes().to_vec(),
            sum: Some(25i64.to_le_bytes()),
        };
        col.write_agg(0, &agg).unwrap();
        assert_eq!(col.read_agg(0).unwrap(), agg);
    }

    #[test]
    fn test_var_column_has_no_sum() {
        let dir = tempdir().unwrap();
        let col = ColumnFile::open(&dir.path().join("0001.5"), ColumnType::VarChar(64), 8).unwrap();
        col.reserve(1).unwrap();
        assert_eq!(col.read_agg(0).unwrap().sum, None);
    }
}
