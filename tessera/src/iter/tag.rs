//! Tag iterator: batched scan of the live tag rows of one
//! entity-group.

use std::sync::Arc;

use crate::context::OpContext;
use crate::tag::{TagRowView, TagTable};
use crate::Result;

const TAG_BATCH_ROWS: usize = 1024;

pub struct TagIterator {
    table: Arc<TagTable>,
    projection: Vec<usize>,
    rows: Option<Vec<TagRowView>>,
    at: usize,
}

impl TagIterator {
    pub fn new(table: Arc<TagTable>, projection: Vec<usize>) -> Self {
        Self {
            table,
            projection,
            rows: None,
            at: 0,
        }
    }

    /// Next batch of tag rows; None when the scan is done.
    pub fn next(&mut self, ctx: &OpContext) -> Result<Option<Vec<TagRowView>>> {
        ctx.check()?;
        if self.rows.is_none() {
            self.rows = Some(self.table.scan(&self.projection)?);
        }
        let rows = self.rows.as_ref().unwrap();
        if self.at >= rows.len() {
            return Ok(None);
        }
        let end = (self.at + TAG_BATCH_ROWS).min(rows.len());
        let batch = rows[self.at..end].to_vec();
        self.at = end;
        Ok(Some(batch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ColumnType;
    use crate::payload::FieldValue;
    use crate::tag::table::encode_tag_row;
    use crate::tag::{TagColumn, TagSchema};
    use tempfile::tempdir;

    #[test]
    fn test_scan_batches() {
        let dir = tempdir().unwrap();
        let schema = TagSchema {
            primary_max_len: 16,
            columns: vec![TagColumn {
                id: 1,
                name: "zone".into(),
                ty: ColumnType::Int32,
            }],
        };
        let table = Arc::new(TagTable::open(dir.path(), &schema).unwrap());
        for i in 0..5u32 {
            let row = encode_tag_row(&schema, &[FieldValue::Int32(i as i32)]).unwrap();
            table
                .insert_tag_record(format!("e{i}").as_bytes(), &row, 1, i)
                .unwrap();
        }
        table.delete_tag_record(b"e3").unwrap();

        let mut it = TagIterator::new(table, vec![0]);
        let ctx = OpContext::new();
        let batch = it.next(&ctx).unwrap().unwrap();
        assert_eq!(batch.len(), 4);
        assert!(batch.iter().all(|r| r.primary_tag != b"e3"));
        assert!(it.next(&ctx).unwrap().is_none());
    }
}
