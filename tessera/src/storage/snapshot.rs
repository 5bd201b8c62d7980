//! Snapshot packaging: a compressed, ordered stream of frames carrying
//! a hash-span of entities (tag rows first, then metric batches) for
//! cross-node migration. Moving the bytes is the caller's transport
//! problem; both ends speak only in frames.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::context::OpContext;
use crate::data::{hash_point, DedupRule, HashSpan, Schema, TableId};
use crate::payload::{FieldValue, Payload, PayloadBuilder};
use crate::storage::entity_group::EntityGroup;
use crate::tag::table::encode_tag_row;
use crate::{Result, TesseraError};

const SNAPSHOT_CHUNK_ROWS: usize = 2048;

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotHeader {
    table_id: TableId,
    hash_span: HashSpan,
    schema_version: u32,
}

/// A snapshot in flight. On the source it is fully built at creation;
/// on the destination frames accumulate until `apply`.
pub struct Snapshot {
    pub id: u64,
    frames: Vec<Vec<u8>>,
    cursor: usize,
    enabled: bool,
}

impl Snapshot {
    pub fn empty(id: u64) -> Self {
        Self {
            id,
            frames: Vec::new(),
            cursor: 0,
            enabled: false,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Next frame of the stream; None when drained.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let frame = self.frames.get(self.cursor).cloned();
        if frame.is_some() {
            self.cursor += 1;
        }
        frame
    }

    /// Destination side: buffer one received frame.
    pub fn push_frame(&mut self, frame: Vec<u8>) {
        self.frames.push(frame);
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

fn compress_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let raw = bincode::serialize(value)?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

fn decompress_frame<T: for<'de> Deserialize<'de>>(frame: &[u8]) -> Result<T> {
    let raw = lz4_flex::decompress_size_prepended(frame)
        .map_err(|e| TesseraError::Corruption(format!("snapshot frame undecodable: {e}")))?;
    Ok(bincode::deserialize(&raw)?)
}

/// Build the full frame stream for the entities whose primary-tag hash
/// points fall inside `hash_span`.
pub fn build_snapshot(
    id: u64,
    eg: &Arc<EntityGroup>,
    schema: &Schema,
    hash_span: HashSpan,
) -> Result<Snapshot> {
    let tag_table = eg.tag_table();
    let tag_schema = tag_table.schema();
    let all_cols: Vec<usize> = (0..tag_schema.columns.len()).collect();

    let mut frames = Vec::new();
    frames.push(compress_frame(&SnapshotHeader {
        table_id: eg.table_id(),
        hash_span,
        schema_version: schema.version,
    })?);

    let mut rows_total = 0u64;
    for tag_row in tag_table.scan(&all_cols)? {
        if !hash_span.contains(hash_point(&tag_row.primary_tag)) {
            continue;
        }
        // tag frame: a TAG_ONLY payload
        let tag_values: Vec<FieldValue> = tag_row
            .values
            .iter()
            .map(|v| match v {
                Some(bytes) => FieldValue::Bytes(bytes.clone()),
                None => FieldValue::Null,
            })
            .collect();
        let raw_tag_row = encode_tag_row(&tag_schema, &tag_values)?;
        let tag_payload = PayloadBuilder::new(schema, &tag_row.primary_tag)
            .tag_row(raw_tag_row)
            .build()?;
        frames.push(lz4_flex::compress_prepend_size(&tag_payload));

        // metric frames: payload batches in time order
        let subgroup = eg.subgroups().subgroup(tag_row.sub_group_id)?;
        let mut batch = PayloadBuilder::new(schema, &tag_row.primary_tag);
        let mut batch_rows = 0usize;
        for partition in subgroup.all_partitions()? {
            for fields in partition.live_rows_for_snapshot(tag_row.entity_id, schema)? {
                batch.add_row(fields);
                batch_rows += 1;
                rows_total += 1;
                if batch_rows >= SNAPSHOT_CHUNK_ROWS {
                    frames.push(lz4_flex::compress_prepend_size(&batch.build()?));
                    batch = PayloadBuilder::new(schema, &tag_row.primary_tag);
                    batch_rows = 0;
                }
            }
        }
        if batch_rows > 0 {
            frames.push(lz4_flex::compress_prepend_size(&batch.build()?));
        }
    }

    info!(snapshot = id, frames = frames.len(), rows = rows_total, "snapshot built");
    Ok(Snapshot {
        id,
        frames,
        cursor: 0,
        enabled: true,
    })
}

/// Apply a buffered snapshot stream to the destination entity-group.
pub fn apply_snapshot(
    ctx: &OpContext,
    eg: &Arc<EntityGroup>,
    schema: &Schema,
    snapshot: &Snapshot,
) -> Result<u64> {
    if snapshot.frames.is_empty() {
        return Err(TesseraError::SnapshotNotFound(snapshot.id));
    }
    let header: SnapshotHeader = decompress_frame(&snapshot.frames[0])?;
    if header.schema_version > schema.version {
        return Err(TesseraError::SchemaMismatch(format!(
            "snapshot carries schema v{}, table is at v{}",
            header.schema_version, schema.version
        )));
    }

    let mtr = eg.mtr_begin(0, 0)?;
    let mut rows = 0u64;
    let result = (|| -> Result<()> {
        for frame in &snapshot.frames[1..] {
            ctx.check()?;
            let raw = lz4_flex::decompress_size_prepended(frame).map_err(|e| {
                TesseraError::Corruption(format!("snapshot frame undecodable: {e}"))
            })?;
            let mut payload = Payload::parse(raw, schema)?;
            if payload.has_data() {
                let res = eg.put_data(ctx, &mut payload, mtr, DedupRule::Override, schema)?;
                rows += res.rows_written;
            } else {
                eg.put_entity(ctx, &payload, mtr)?;
            }
        }
        Ok(())
    })();
    match result {
        Ok(()) => {
            eg.mtr_commit(mtr)?;
            info!(snapshot = snapshot.id, rows, "snapshot applied");
            Ok(rows)
        }
        Err(e) => {
            let _ = eg.mtr_rollback(mtr);
            Err(e)
        }
    }
}
