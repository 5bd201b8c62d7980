//! Columnar tag table, one per entity-group.
//!
//! File layout under the entity-group directory:
//! ```text
//! tag.meta          bincode manifest (schema, row count, capacity)
//! tag.pri           primary-tag slots:
//!                     flags u8 | sub_group u32 | entity u32
//!                     | len u16 | bytes (padded to the schema max)
//! tag.<col_id>      general-tag cells: null u8 | value (fixed width)
//! tag.<col_id>.s    string heap for var-length tag columns
//! ```
//!
//! Tag rows are append-only: `delete` sets the slot's delete flag and
//! removes the index entry, but the row number stays stable so any
//! referring metric row keeps resolving.

use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::data::{ColumnType, EntityId, SubGroupId, TagTableRowId};
use crate::payload::FieldValue;
use crate::storage::mmap_file::MmapFile;
use crate::storage::string_heap::StringHeap;
use crate::tag::hash_index::TagHashIndex;
use crate::{Result, TesseraError};

const TAG_META_MAGIC: u32 = 0x5453_5447; // "TSTG"
const FLAG_OCCUPIED: u8 = 0x01;
const FLAG_DELETED: u8 = 0x02;
const INITIAL_CAPACITY: u32 = 64;

/// One general-tag column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagColumn {
    pub id: u32,
    pub name: String,
    pub ty: ColumnType,
}

/// Tag table schema: the primary-tag length cap plus the general-tag
/// columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSchema {
    pub primary_max_len: u16,
    pub columns: Vec<TagColumn>,
}

impl TagSchema {
    pub fn primary_only(primary_max_len: u16) -> Self {
        Self {
            primary_max_len,
            columns: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct TagMeta {
    magic: u32,
    schema: TagSchema,
    row_count: u32,
    capacity: u32,
}

/// One scanned tag row.
#[derive(Debug, Clone)]
pub struct TagRowView {
    pub row_id: TagTableRowId,
    pub primary_tag: Vec<u8>,
    pub sub_group_id: SubGroupId,
    pub entity_id: EntityId,
    /// Projected general-tag values (None = null).
    pub values: Vec<Option<Vec<u8>>>,
}

struct TagTableInner {
    dir: PathBuf,
    schema: TagSchema,
    row_count: u32,
    capacity: u32,
    pri: MmapFile,
    cols: Vec<MmapFile>,
    heaps: Vec<Option<StringHeap>>,
}

pub struct TagTable {
    inner: RwLock<TagTableInner>,
    index: RwLock<TagHashIndex>,
}

fn pri_slot_len(schema: &TagSchema) -> usize {
    1 + 4 + 4 + 2 + schema.primary_max_len as usize
}

fn col_slot_len(ty: ColumnType) -> usize {
    1 + ty.fixed_len()
}

fn col_path(dir: &Path, id: u32) -> PathBuf {
    dir.join(format!("tag.{id}"))
}

impl TagTableInner {
    fn pri_off(&self, row: TagTableRowId) -> usize {
        row as usize * pri_slot_len(&self.schema)
    }

    fn grow_to(&mut self, capacity: u32) -> Result<()> {
        self.pri
            .reserve(capacity as usize * pri_slot_len(&self.schema))?;
        for (ci, col) in self.schema.columns.iter().enumerate() {
            self.cols[ci].reserve(capacity as usize * col_slot_len(col.ty))?;
        }
        self.capacity = capacity;
        Ok(())
    }

    fn write_meta(&self) -> Result<()> {
        let meta = TagMeta {
            magic: TAG_META_MAGIC,
            schema: self.schema.clone(),
            row_count: self.row_count,
            capacity: self.capacity,
        };
        let bytes = bincode::serialize(&meta)?;
        std::fs::write(self.dir.join("tag.meta"), bytes)?;
        Ok(())
    }

    fn slot_flags(&self, row: TagTableRowId) -> Result<u8> {
        Ok(self.pri.read_at(self.pri_off(row), 1)?[0])
    }

    fn read_primary(&self, row: TagTableRowId) -> Result<(u8, SubGroupId, EntityId, Vec<u8>)> {
        let off = self.pri_off(row);
        let slot = self.pri.read_at(off, pri_slot_len(&self.schema))?;
        let flags = slot[0];
        let sub = LittleEndian::read_u32(&slot[1..5]);
        let entity = LittleEndian::read_u32(&slot[5..9]);
        let len = LittleEndian::read_u16(&slot[9..11]) as usize;
        Ok((flags, sub, entity, slot[11..11 + len].to_vec()))
    }

    /// Write the general-tag cells of one row from the payload's tag
    /// section: a null bitmap over the tag columns, then per column a
    /// fixed-width value or an inline (u16 len, bytes) var value.
    fn write_tag_cells(&mut self, row: TagTableRowId, tag_row: &[u8]) -> Result<()> {
        let ncols = self.schema.columns.len();
        if ncols == 0 {
            return Ok(());
        }
        let bm_len = crate::data::bitmap_len(ncols);
        if tag_row.len() < bm_len {
            return Err(TesseraError::SchemaMismatch(
                "tag row shorter than its null bitmap".into(),
            ));
        }
        let bitmap = &tag_row[..bm_len];
        let mut at = bm_len;
        for ci in 0..ncols {
            let ty = self.schema.columns[ci].ty;
            let slot = col_slot_len(ty);
            let off = row as usize * slot;
            let null = crate::data::bitmap_get(bitmap, ci);
            if null {
                self.cols[ci].write_at(off, &[1u8])?;
                // fixed part stays zeroed; var columns keep advancing
                if !ty.is_var_len() {
                    at += ty.fixed_len();
                } else {
                    let len = LittleEndian::read_u16(&tag_row[at..]) as usize;
                    at += 2 + len;
                }
                continue;
            }
            self.cols[ci].write_at(off, &[0u8])?;
            if ty.is_var_len() {
                let len = LittleEndian::read_u16(&tag_row[at..]) as usize;
                let value = &tag_row[at + 2..at + 2 + len];
                at += 2 + len;
                let heap = self.heaps[ci]
                    .as_ref()
                    .ok_or_else(|| TesseraError::Internal("var tag column without heap".into()))?;
                let heap_off = heap.append(value)?;
                let mut cell = [0u8; 8];
                LittleEndian::write_u64(&mut cell, heap_off);
                self.pad_write(ci, off + 1, &cell, ty)?;
            } else {
                let w = ty.fixed_len();
                let value = &tag_row[at..at + w];
                at += w;
                self.pad_write(ci, off + 1, value, ty)?;
            }
        }
        Ok(())
    }

    fn pad_write(&mut self, ci: usize, off: usize, value: &[u8], ty: ColumnType) -> Result<()> {
        let mut cell = vec![0u8; ty.fixed_len()];
        cell[..value.len()].copy_from_slice(value);
        self.cols[ci].write_at(off, &cell)
    }

    fn read_tag_cell(&self, row: TagTableRowId, ci: usize) -> Result<Option<Vec<u8>>> {
        let ty = self.schema.columns[ci].ty;
        let slot = col_slot_len(ty);
        let off = row as usize * slot;
        let bytes = self.cols[ci].read_at(off, slot)?;
        if bytes[0] != 0 {
            return Ok(None);
        }
        if ty.is_var_len() {
            let heap_off = LittleEndian::read_u64(&bytes[1..9]);
            if heap_off == 0 {
                return Ok(None);
            }
            let heap = self.heaps[ci]
                .as_ref()
                .ok_or_else(|| TesseraError::Internal("var tag column without heap".into()))?;
            return Ok(Some(heap.get(heap_off)?));
        }
        Ok(Some(bytes[1..].to_vec()))
    }
}

impl TagTable {
    pub fn open(dir: &Path, schema: &TagSchema) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let meta_path = dir.join("tag.meta");
        let (schema, row_count, capacity) = if meta_path.exists() {
            let bytes = std::fs::read(&meta_path)?;
            let meta: TagMeta = bincode::deserialize(&bytes).map_err(|e| {
                TesseraError::Corruption(format!("tag.meta undecodable: {e}"))
            })?;
            if meta.magic != TAG_META_MAGIC {
                return Err(TesseraError::Corruption("tag.meta bad magic".into()));
            }
            (meta.schema, meta.row_count, meta.capacity)
        } else {
            (schema.clone(), 0, 0)
        };

        let pri = MmapFile::open(&dir.join("tag.pri"))?;
        let mut cols = Vec::new();
        let mut heaps = Vec::new();
        for col in &schema.columns {
            cols.push(MmapFile::open(&col_path(dir, col.id))?);
            heaps.push(if col.ty.is_var_len() {
                Some(StringHeap::open(&dir.join(format!("tag.{}.s", col.id)))?)
            } else {
                None
            });
        }
        let mut inner = TagTableInner {
            dir: dir.to_path_buf(),
            schema,
            row_count,
            capacity,
            pri,
            cols,
            heaps,
        };
        if inner.capacity == 0 {
            inner.grow_to(INITIAL_CAPACITY)?;
            inner.write_meta()?;
        }

        // rebuild the hash index from the primary column
        let mut index = TagHashIndex::new();
        for row in 0..inner.row_count {
            let (flags, _, _, primary) = inner.read_primary(row)?;
            if flags & FLAG_OCCUPIED != 0 && flags & FLAG_DELETED == 0 {
                index.put(&primary, row).map_err(|_| {
                    TesseraError::Corruption(format!("duplicate primary tag at row {row}"))
                })?;
            }
        }

        Ok(Self {
            inner: RwLock::new(inner),
            index: RwLock::new(index),
        })
    }

    pub fn schema(&self) -> TagSchema {
        self.inner.read().schema.clone()
    }

    pub fn row_count(&self) -> u32 {
        self.inner.read().row_count
    }

    pub fn live_count(&self) -> usize {
        self.index.read().len()
    }

    /// Append a tag row and index it. Fails with AlreadyExists for a
    /// live duplicate primary tag.
    pub fn insert_tag_record(
        &self,
        primary_tag: &[u8],
        tag_row: &[u8],
        sub_group_id: SubGroupId,
        entity_id: EntityId,
    ) -> Result<TagTableRowId> {
        let mut inner = self.inner.write();
        let mut index = self.index.write();
        if index.get(primary_tag).is_some() {
            return Err(TesseraError::TableExists(entity_id as u64));
        }
        if primary_tag.len() > inner.schema.primary_max_len as usize {
            return Err(TesseraError::SchemaMismatch(format!(
                "primary tag of {} bytes exceeds the schema cap {}",
                primary_tag.len(),
                inner.schema.primary_max_len
            )));
        }

        let row = inner.row_count;
        if row >= inner.capacity {
            let next = inner.capacity * 2;
            inner.grow_to(next)?;
        }

        let off = inner.pri_off(row);
        let mut slot = vec![0u8; pri_slot_len(&inner.schema)];
        slot[0] = FLAG_OCCUPIED;
        LittleEndian::write_u32(&mut slot[1..5], sub_group_id);
        LittleEndian::write_u32(&mut slot[5..9], entity_id);
        LittleEndian::write_u16(&mut slot[9..11], primary_tag.len() as u16);
        slot[11..11 + primary_tag.len()].copy_from_slice(primary_tag);
        inner.pri.write_at(off, &slot)?;

        inner.write_tag_cells(row, tag_row)?;
        inner.row_count += 1;
        inner.write_meta()?;
        index
            .put(primary_tag, row)
            .map_err(|_| TesseraError::Internal("index rejected fresh primary tag".into()))?;
        Ok(row)
    }

    /// Overwrite the general-tag cells of an existing row. The primary
    /// tag is immutable.
    pub fn update_tag_record(&self, primary_tag: &[u8], tag_row: &[u8]) -> Result<()> {
        let row = self
            .index
            .read()
            .get(primary_tag)
            .ok_or(TesseraError::EntityNotFound)?;
        let mut inner = self.inner.write();
        inner.write_tag_cells(row, tag_row)?;
        Ok(())
    }

    /// Set the delete mark and drop the index entry. The slot stays.
    pub fn delete_tag_record(&self, primary_tag: &[u8]) -> Result<Option<(SubGroupId, EntityId)>> {
        let mut index = self.index.write();
        let row = match index.get(primary_tag) {
            Some(r) => r,
            None => return Ok(None),
        };
        let mut inner = self.inner.write();
        let off = inner.pri_off(row);
        let mut flags = inner.slot_flags(row)?;
        flags |= FLAG_DELETED;
        inner.pri.write_at(off, &[flags])?;
        let (_, sub, entity, _) = inner.read_primary(row)?;
        index.delete(primary_tag);
        Ok(Some((sub, entity)))
    }

    /// Resolve primary-tag bytes to the entity's placement.
    pub fn get_entity_id_group_id(&self, primary_tag: &[u8]) -> Option<(SubGroupId, EntityId)> {
        let row = self.index.read().get(primary_tag)?;
        let inner = self.inner.read();
        let (flags, sub, entity, _) = inner.read_primary(row).ok()?;
        if flags & FLAG_OCCUPIED == 0 || flags & FLAG_DELETED != 0 {
            return None;
        }
        Some((sub, entity))
    }

    /// Scan live rows, materializing the projected tag columns
    /// (indices into the tag schema).
    pub fn scan(&self, projection: &[usize]) -> Result<Vec<TagRowView>> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        for row in 0..inner.row_count {
            let (flags, sub, entity, primary) = inner.read_primary(row)?;
            if flags & FLAG_OCCUPIED == 0 || flags & FLAG_DELETED != 0 {
                continue;
            }
            let mut values = Vec::with_capacity(projection.len());
            for &ci in projection {
                if ci >= inner.schema.columns.len() {
                    return Err(TesseraError::ColumnNotFound(ci as u32));
                }
                values.push(inner.read_tag_cell(row, ci)?);
            }
            out.push(TagRowView {
                row_id: row,
                primary_tag: primary,
                sub_group_id: sub,
                entity_id: entity,
                values,
            });
        }
        Ok(out)
    }

    /// Every slot ever assigned, delete-marked rows included. Recovery
    /// uses this so freed-looking slots are never handed out again.
    pub fn assigned_slots(&self) -> Result<Vec<(SubGroupId, EntityId)>> {
        let inner = self.inner.read();
        let mut out = Vec::with_capacity(inner.row_count as usize);
        for row in 0..inner.row_count {
            let (flags, sub, entity, _) = inner.read_primary(row)?;
            if flags & FLAG_OCCUPIED != 0 {
                out.push((sub, entity));
            }
        }
        Ok(out)
    }

    /// Rebuild the hash index (e.g. after heavy deletion).
    pub fn rehash(&self) {
        self.index.write().rehash();
    }

    /// Recovery: clear a delete mark set by an uncommitted delete and
    /// re-index the row. No-op when the key is live or was never
    /// stored.
    pub fn restore_tag_record(&self, primary_tag: &[u8]) -> Result<bool> {
        let mut index = self.index.write();
        if index.get(primary_tag).is_some() {
            return Ok(false);
        }
        let mut inner = self.inner.write();
        // newest matching tombstoned slot wins
        for row in (0..inner.row_count).rev() {
            let (flags, _, _, primary) = inner.read_primary(row)?;
            if flags & FLAG_OCCUPIED != 0 && flags & FLAG_DELETED != 0 && primary == primary_tag {
                let off = inner.pri_off(row);
                inner.pri.write_at(off, &[FLAG_OCCUPIED])?;
                index
                    .put(primary_tag, row)
                    .map_err(|_| TesseraError::Internal("restore re-index failed".into()))?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.read();
        inner.pri.sync()?;
        for col in &inner.cols {
            col.sync()?;
        }
        for heap in inner.heaps.iter().flatten() {
            heap.sync()?;
        }
        inner.write_meta()
    }
}

/// Encode a tag row (null bitmap + cells) for the payload tag section.
pub fn encode_tag_row(schema: &TagSchema, values: &[FieldValue]) -> Result<Vec<u8>> {
    debug_assert_eq!(values.len(), schema.columns.len());
    let bm_len = crate::data::bitmap_len(schema.columns.len());
    let mut bitmap = vec![0u8; bm_len];
    let mut cells = Vec::new();
    for (ci, (col, v)) in schema.columns.iter().zip(values).enumerate() {
        if matches!(v, FieldValue::Null) {
            crate::data::bitmap_set(&mut bitmap, ci);
            if col.ty.is_var_len() {
                cells.extend_from_slice(&0u16.to_le_bytes());
            } else {
                cells.extend(std::iter::repeat(0u8).take(col.ty.fixed_len()));
            }
            continue;
        }
        let bytes = match v {
            FieldValue::Bool(b) => vec![*b as u8],
            FieldValue::Int8(x) => vec![*x as u8],
            FieldValue::Int16(x) => x.to_le_bytes().to_vec(),
            FieldValue::Int32(x) => x.to_le_bytes().to_vec(),
            FieldValue::Int64(x) => x.to_le_bytes().to_vec(),
            FieldValue::Float32(x) => x.to_le_bytes().to_vec(),
            FieldValue::Float64(x) => x.to_le_bytes().to_vec(),
            FieldValue::Timestamp(x) => x.to_le_bytes().to_vec(),
            FieldValue::Bytes(b) => b.clone(),
            FieldValue::Str(s) => s.as_bytes().to_vec(),
            FieldValue::Null => unreachable!(),
        };
        if col.ty.is_var_len() {
            cells.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
            cells.extend_from_slice(&bytes);
        } else {
            let mut cell = vec![0u8; col.ty.fixed_len()];
            let n = bytes.len().min(cell.len());
            cell[..n].copy_from_slice(&bytes[..n]);
            cells.extend_from_slice(&cell);
        }
    }
    let mut out = bitmap;
    out.extend_from_slice(&cells);
    Ok(out)
}
