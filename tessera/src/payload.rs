//! Row payload wire format.
//!
//! A payload carries one batch of rows for a single entity, plus the
//! entity's primary tag and (optionally) its tag row. The frame is
//! bit-exact:
//!
//! ```text
//! +-------------------+------------------------------------------+
//! | header (9 B)      | primary_tag_hash u32 | flags u8          |
//! |                   | row_count u32                            |
//! | primary tag       | len u16 | bytes                          |
//! | tag section       | len u32 | tag null bitmap | tag cells    |
//! | metric section    | len u32 | per column:                    |
//! |  (absent when     |   null bitmap ceil(n/8) | cells n*fixed  |
//! |   TAG_ONLY)       |                                          |
//! | var heap          | len u32 | (u16 len | bytes)*             |
//! +-------------------+------------------------------------------+
//! ```
//!
//! Variable-length metric cells hold a u64 offset into the payload var
//! heap (relative to the heap start, 1-based so 0 keeps meaning "no
//! value"). Column 0 cells are 16 bytes: the row timestamp followed by
//! an LSN slot that the storage layer stamps at commit time.

use byteorder::{ByteOrder, LittleEndian};

use crate::data::{
    bitmap_get, bitmap_len, bitmap_set, hash_point, ColumnType, Lsn, Schema, Timestamp,
};
use crate::{Result, TesseraError};

/// What the payload carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadFlag {
    DataAndTag = 0,
    DataOnly = 1,
    TagOnly = 2,
}

impl TryFrom<u8> for PayloadFlag {
    type Error = TesseraError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PayloadFlag::DataAndTag),
            1 => Ok(PayloadFlag::DataOnly),
            2 => Ok(PayloadFlag::TagOnly),
            other => Err(TesseraError::Corruption(format!(
                "invalid payload flag {other}"
            ))),
        }
    }
}

const HEADER_LEN: usize = 9;
const HASH_OFF: usize = 0;
const FLAG_OFF: usize = 4;
const ROW_COUNT_OFF: usize = 5;

/// Parsed payload. Owns its bytes so the storage layer can stamp the
/// LSN slots before the frame goes to the WAL and the column files.
#[derive(Debug, Clone)]
pub struct Payload {
    data: Vec<u8>,
    schema: Schema,
    flag: PayloadFlag,
    row_count: usize,
    primary_off: usize,
    primary_len: usize,
    tag_off: usize,
    tag_len: usize,
    /// Per-column offset of the null bitmap inside the metric section.
    col_offsets: Vec<usize>,
    heap_off: usize,
    heap_len: usize,
}

impl Payload {
    pub fn parse(data: Vec<u8>, schema: &Schema) -> Result<Self> {
        if data.len() < HEADER_LEN + 2 {
            return Err(TesseraError::Corruption("payload shorter than header".into()));
        }
        let flag = PayloadFlag::try_from(data[FLAG_OFF])?;
        let row_count = LittleEndian::read_u32(&data[ROW_COUNT_OFF..]) as usize;

        let primary_len = LittleEndian::read_u16(&data[HEADER_LEN..]) as usize;
        let primary_off = HEADER_LEN + 2;
        let mut pos = primary_off + primary_len;

        let need = |pos: usize, n: usize| -> Result<()> {
            if pos + n > data.len() {
                Err(TesseraError::Corruption("payload truncated".into()))
            } else {
                Ok(())
            }
        };

        need(pos, 4)?;
        let tag_len = LittleEndian::read_u32(&data[pos..]) as usize;
        let tag_off = pos + 4;
        need(tag_off, tag_len)?;
        pos = tag_off + tag_len;

        let mut col_offsets = Vec::new();
        if flag != PayloadFlag::TagOnly {
            need(pos, 4)?;
            let data_len = LittleEndian::read_u32(&data[pos..]) as usize;
            let data_off = pos + 4;
            need(data_off, data_len)?;

            let bitmap = bitmap_len(row_count);
            let mut col_pos = data_off;
            col_offsets.reserve(schema.column_count());
            for col in &schema.columns {
                col_offsets.push(col_pos);
                col_pos += bitmap + col.ty.fixed_len() * row_count;
            }
            if col_pos != data_off + data_len {
                return Err(TesseraError::SchemaMismatch(format!(
                    "metric section is {} bytes, schema v{} implies {}",
                    data_len,
                    schema.version,
                    col_pos - data_off
                )));
            }
            pos = data_off + data_len;
        }

        need(pos, 4)?;
        let heap_len = LittleEndian::read_u32(&data[pos..]) as usize;
        let heap_off = pos + 4;
        need(heap_off, heap_len)?;

        let expected_hash = LittleEndian::read_u32(&data[HASH_OFF..]);
        let actual = hash_point(&data[primary_off..primary_off + primary_len]);
        if expected_hash != actual {
            return Err(TesseraError::Corruption(
                "payload primary-tag hash mismatch".into(),
            ));
        }

        Ok(Self {
            data,
            schema: schema.clone(),
            flag,
            row_count,
            primary_off,
            primary_len,
            tag_off,
            tag_len,
            col_offsets,
            heap_off,
            heap_len,
        })
    }

    pub fn flag(&self) -> PayloadFlag {
        self.flag
    }

    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn primary_tag(&self) -> &[u8] {
        &self.data[self.primary_off..self.primary_off + self.primary_len]
    }

    pub fn primary_tag_hash(&self) -> u32 {
        LittleEndian::read_u32(&self.data[HASH_OFF..])
    }

    pub fn has_data(&self) -> bool {
        self.flag != PayloadFlag::TagOnly && self.row_count > 0
    }

    pub fn has_tag_row(&self) -> bool {
        self.flag != PayloadFlag::DataOnly && self.tag_len > 0
    }

    /// Raw tag section (null bitmap + tag cells), decoded by the tag
    /// table against its own schema.
    pub fn tag_row(&self) -> &[u8] {
        &self.data[self.tag_off..self.tag_off + self.tag_len]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn col_bitmap_off(&self, col: usize) -> usize {
        self.col_offsets[col]
    }

    fn col_values_off(&self, col: usize) -> usize {
        self.col_offsets[col] + bitmap_len(self.row_count)
    }

    pub fn is_null(&self, col: usize, row: usize) -> bool {
        let off = self.col_bitmap_off(col);
        bitmap_get(&self.data[off..off + bitmap_len(self.row_count)], row)
    }

    pub fn column_bitmap(&self, col: usize) -> &[u8] {
        let off = self.col_bitmap_off(col);
        &self.data[off..off + bitmap_len(self.row_count)]
    }

    /// Fixed-width cell bytes of one row (the heap offset for var
    /// columns).
    pub fn cell(&self, col: usize, row: usize) -> &[u8] {
        let cell = self.schema.columns[col].ty.fixed_len();
        let off = self.col_values_off(col) + cell * row;
        &self.data[off..off + cell]
    }

    /// Contiguous cell run `[start_row, start_row + n)`.
    pub fn cells(&self, col: usize, start_row: usize, n: usize) -> &[u8] {
        let cell = self.schema.columns[col].ty.fixed_len();
        let off = self.col_values_off(col) + cell * start_row;
        &self.data[off..off + cell * n]
    }

    /// Var-length value of one row, dereferenced through the payload
    /// heap. None for null rows and for the 0 offset sentinel.
    pub fn var_value(&self, col: usize, row: usize) -> Option<&[u8]> {
        if self.is_null(col, row) {
            return None;
        }
        let off = LittleEndian::read_u64(self.cell(col, row));
        if off == 0 {
            return None;
        }
        let at = self.heap_off + (off - 1) as usize;
        let len = LittleEndian::read_u16(&self.data[at..]) as usize;
        Some(&self.data[at + 2..at + 2 + len])
    }

    pub fn timestamp(&self, row: usize) -> Timestamp {
        LittleEndian::read_i64(self.cell(0, row))
    }

    pub fn lsn(&self, row: usize) -> Lsn {
        LittleEndian::read_u64(&self.cell(0, row)[8..])
    }

    /// Stamp the WAL LSN into every row's LSN slot. Called by the
    /// storage layer once the covering WAL record has been appended.
    pub fn set_lsn(&mut self, lsn: Lsn) {
        if self.flag == PayloadFlag::TagOnly {
            return;
        }
        let cell = self.schema.columns[0].ty.fixed_len();
        let base = self.col_values_off(0);
        for row in 0..self.row_count {
            let off = base + cell * row + 8;
            LittleEndian::write_u64(&mut self.data[off..off + 8], lsn);
        }
    }

    pub fn min_ts(&self) -> Timestamp {
        (0..self.row_count)
            .map(|r| self.timestamp(r))
            .min()
            .unwrap_or(crate::data::INVALID_TS)
    }

    pub fn max_ts(&self) -> Timestamp {
        (0..self.row_count)
            .map(|r| self.timestamp(r))
            .max()
            .unwrap_or(crate::data::INVALID_TS)
    }

    /// True when row timestamps are not monotonically non-decreasing.
    /// Such batches force the slow write path and flag the entity.
    pub fn is_disordered(&self) -> bool {
        (1..self.row_count).any(|r| self.timestamp(r) < self.timestamp(r - 1))
    }
}

// ============================================================================
// Builder
// ============================================================================

/// One metric field value used by the builder.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Timestamp(i64),
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Bytes(Vec<u8>),
    Str(String),
}

/// Assembles bit-exact payload frames. The engine's own snapshot apply
/// path and the tests both build payloads through this.
pub struct PayloadBuilder {
    schema: Schema,
    primary_tag: Vec<u8>,
    tag_row: Vec<u8>,
    rows: Vec<Vec<FieldValue>>,
}

impl PayloadBuilder {
    pub fn new(schema: &Schema, primary_tag: &[u8]) -> Self {
        Self {
            schema: schema.clone(),
            primary_tag: primary_tag.to_vec(),
            tag_row: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Attach a pre-encoded tag row (null bitmap + cells in the tag
    /// table's schema).
    pub fn tag_row(mut self, raw: Vec<u8>) -> Self {
        self.tag_row = raw;
        self
    }

    pub fn add_row(&mut self, fields: Vec<FieldValue>) -> &mut Self {
        debug_assert_eq!(fields.len(), self.schema.column_count());
        self.rows.push(fields);
        self
    }

    pub fn build(&self) -> Result<Vec<u8>> {
        let flag = if self.rows.is_empty() {
            PayloadFlag::TagOnly
        } else if self.tag_row.is_empty() {
            PayloadFlag::DataOnly
        } else {
            PayloadFlag::DataAndTag
        };
        let n = self.rows.len();
        let bm_len = bitmap_len(n);

        let mut heap: Vec<u8> = Vec::new();
        let mut metric: Vec<u8> = Vec::new();

        if flag != PayloadFlag::TagOnly {
            for (ci, col) in self.schema.columns.iter().enumerate() {
                let cell = col.ty.fixed_len();
                let bitmap_at = metric.len();
                metric.resize(bitmap_at + bm_len, 0);
                let values_at = metric.len();
                metric.resize(values_at + cell * n, 0);
                for (ri, row) in self.rows.iter().enumerate() {
                    let out = values_at + cell * ri;
                    let v = &row[ci];
                    if matches!(v, FieldValue::Null) {
                        bitmap_set(&mut metric[bitmap_at..values_at], ri);
                        continue;
                    }
                    encode_cell(&mut metric, out, col.ty, v, &mut heap)?;
                }
            }
        }

        let mut out = Vec::with_capacity(
            HEADER_LEN + 2 + self.primary_tag.len() + 8 + self.tag_row.len() + metric.len()
                + 4
                + heap.len(),
        );
        out.resize(HEADER_LEN, 0);
        LittleEndian::write_u32(&mut out[HASH_OFF..], hash_point(&self.primary_tag));
        out[FLAG_OFF] = flag as u8;
        LittleEndian::write_u32(&mut out[ROW_COUNT_OFF..], n as u32);

        out.extend_from_slice(&(self.primary_tag.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.primary_tag);

        out.extend_from_slice(&(self.tag_row.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.tag_row);

        if flag != PayloadFlag::TagOnly {
            out.extend_from_slice(&(metric.len() as u32).to_le_bytes());
            out.extend_from_slice(&metric);
        }

        out.extend_from_slice(&(heap.len() as u32).to_le_bytes());
        out.extend_from_slice(&heap);
        Ok(out)
    }
}

fn encode_cell(
    metric: &mut [u8],
    out: usize,
    ty: ColumnType,
    v: &FieldValue,
    heap: &mut Vec<u8>,
) -> Result<()> {
    let mismatch = || {
        TesseraError::SchemaMismatch(format!("value {v:?} does not fit column type {ty:?}"))
    };
    match (ty, v) {
        (ColumnType::TimestampLsn, FieldValue::Timestamp(ts)) => {
            LittleEndian::write_i64(&mut metric[out..], *ts);
            // LSN slot stays zero until commit
        }
        (ColumnType::Timestamp, FieldValue::Timestamp(ts)) => {
            LittleEndian::write_i64(&mut metric[out..], *ts);
        }
        (ColumnType::Bool, FieldValue::Bool(b)) => metric[out] = *b as u8,
        (ColumnType::Int8, FieldValue::Int8(x)) => metric[out] = *x as u8,
        (ColumnType::Int16, FieldValue::Int16(x)) => {
            LittleEndian::write_i16(&mut metric[out..], *x)
        }
        (ColumnType::Int32, FieldValue::Int32(x)) => {
            LittleEndian::write_i32(&mut metric[out..], *x)
        }
        (ColumnType::Int64, FieldValue::Int64(x)) => {
            LittleEndian::write_i64(&mut metric[out..], *x)
        }
        (ColumnType::Float32, FieldValue::Float32(x)) => {
            LittleEndian::write_f32(&mut metric[out..], *x)
        }
        (ColumnType::Float64, FieldValue::Float64(x)) => {
            LittleEndian::write_f64(&mut metric[out..], *x)
        }
        (ColumnType::Char(cap) | ColumnType::Binary(cap), v) => {
            let bytes = match v {
                FieldValue::Bytes(b) => b.as_slice(),
                FieldValue::Str(s) => s.as_bytes(),
                _ => return Err(mismatch()),
            };
            if bytes.len() > cap as usize {
                return Err(mismatch());
            }
            metric[out..out + bytes.len()].copy_from_slice(bytes);
        }
        (ColumnType::VarChar(cap) | ColumnType::VarBinary(cap), v) => {
            let bytes = match v {
                FieldValue::Bytes(b) => b.as_slice(),
                FieldValue::Str(s) => s.as_bytes(),
                _ => return Err(mismatch()),
            };
            if bytes.len() > cap as usize {
                return Err(mismatch());
            }
            let off = heap.len() as u64 + 1; // 1-based, 0 = none
            heap.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
            heap.extend_from_slice(bytes);
            LittleEndian::write_u64(&mut metric[out..], off);
        }
        _ => return Err(mismatch()),
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::data::ColumnSchema;

    #[test]
    fn test_roundtrip_fixed() {
        let schema = simple_schema();
        let p = simple_payload(&schema, b"e1", &[(1000, Some(10)), (2000, None), (3000, Some(30))]);
        assert_eq!(p.row_count(), 3);
        assert_eq!(p.flag(), PayloadFlag::DataOnly);
        assert_eq!(p.primary_tag(), b"e1");
        assert_eq!(p.timestamp(0), 1000);
        assert_eq!(p.timestamp(2), 3000);
        assert!(!p.is_null(1, 0));
        assert!(p.is_null(1, 1));
        assert_eq!(LittleEndian::read_i32(p.cell(1, 2)), 30);
        assert!(!p.is_disordered());
        assert_eq!(p.min_ts(), 1000);
        assert_eq!(p.max_ts(), 3000);
    }

    #[test]
    fn test_roundtrip_var() {
        let schema = Schema::new(vec![
            ColumnSchema::new(1, "k_timestamp", ColumnType::TimestampLsn),
            ColumnSchema::new(2, "name", ColumnType::VarChar(32)),
        ]);
        let mut b = PayloadBuilder::new(&schema, b"dev-7");
        b.add_row(vec![
            FieldValue::Timestamp(10),
            FieldValue::Str("alpha".into()),
        ]);
        b.add_row(vec![FieldValue::Timestamp(20), FieldValue::Null]);
        let p = Payload::parse(b.build().unwrap(), &schema).unwrap();
        assert_eq!(p.var_value(1, 0), Some(&b"alpha"[..]));
        assert_eq!(p.var_value(1, 1), None);
    }

    #[test]
    fn test_lsn_stamping() {
        let schema = simple_schema();
        let mut p = simple_payload(&schema, b"e1", &[(5, Some(1)), (6, Some(2))]);
        assert_eq!(p.lsn(0), 0);
        p.set_lsn(42);
        assert_eq!(p.lsn(0), 42);
        assert_eq!(p.lsn(1), 42);
        // timestamps untouched
        assert_eq!(p.timestamp(0), 5);
    }

    #[test]
    fn test_disordered_detection() {
        let schema = simple_schema();
        let p = simple_payload(&schema, b"e1", &[(2000, Some(1)), (1000, Some(2))]);
        assert!(p.is_disordered());
    }

    #[test]
    fn test_hash_mismatch_rejected() {
        let schema = simple_schema();
        let mut bytes = PayloadBuilder::new(&schema, b"e1")
            .add_row(vec![FieldValue::Timestamp(1), FieldValue::Int32(1)])
            .build()
            .unwrap();
        bytes[0] ^= 0xff;
        assert!(matches!(
            Payload::parse(bytes, &schema),
            Err(TesseraError::Corruption(_))
        ));
    }

    #[test]
    fn test_tag_only_payload() {
        let schema = simple_schema();
        let bytes = PayloadBuilder::new(&schema, b"e9")
            .tag_row(vec![0u8, 1, 2, 3])
            .build()
            .unwrap();
        let p = Payload::parse(bytes, &schema).unwrap();
        assert_eq!(p.flag(), PayloadFlag::TagOnly);
        assert!(!p.has_data());
        assert!(p.has_tag_row());
        assert_eq!(p.tag_row(), &[0u8, 1, 2, 3]);
    }
}
