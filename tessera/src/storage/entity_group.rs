//! Entity-group: one shard of entities, the unit of WAL and of the
//! drop lock.
//!
//! Owns a tag table, a sub-group manager, a WAL and the transaction
//! managers. Every mutation appends its WAL record before touching a
//! data file; the record's LSN is stamped into the payload's LSN slots
//! so replay can recognize its own rows.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::context::OpContext;
use crate::data::{
    hash_point, partition_start_time, DedupRule, EntityId, HashSpan, Lsn, MetricRowId, MtrId,
    RangeGroupId, Schema, SubGroupId, TableId, TsSpan, TsxId,
};
use crate::payload::{Payload, PayloadFlag};
use crate::storage::partition::PutResult;
use crate::storage::subgroup::SubGroupManager;
use crate::storage::{EngineOptions, WalLevel};
use crate::tag::{TagSchema, TagTable};
use crate::wal::mtr::{MtrManager, TsxManager};
use crate::wal::{DelRowSpan, LogRecord, WalManager};
use crate::{Result, TesseraError};

const GROUP_META_FILE: &str = "group.meta";

/// Checkpoint image, stored both in `group.meta` and in the Checkpoint
/// WAL record (so a crash inside the checkpoint still recovers the
/// watermarks).
#[derive(Debug, serde::Serialize, serde::Deserialize, Default)]
pub(crate) struct GroupMeta {
    pub(crate) applied: std::collections::HashMap<u64, u64>,
    pub(crate) checkpoint_lsn: Lsn,
}

pub struct EntityGroup {
    table_id: TableId,
    range_group_id: RangeGroupId,
    dir: PathBuf,
    opts: EngineOptions,
    /// Shared by every API call; exclusive for drop/alter.
    drop_lock: RwLock<()>,
    tag_table: Arc<TagTable>,
    subgroups: SubGroupManager,
    wal: WalManager,
    mtr: MtrManager,
    tsx: TsxManager,
    /// Set on WAL/checkpoint failure; cleared by successful recovery.
    failed: AtomicBool,
}

impl EntityGroup {
    pub fn open(
        dir: &Path,
        table_id: TableId,
        range_group_id: RangeGroupId,
        tag_schema: &TagSchema,
        opts: &EngineOptions,
    ) -> Result<Arc<Self>> {
        std::fs::create_dir_all(dir)?;
        let tag_table = Arc::new(TagTable::open(dir, tag_schema)?);
        let subgroups = SubGroupManager::open(
            dir,
            opts.partition_interval_secs,
            opts.partition_options(),
            opts.subgroup_entity_capacity,
            opts.partition_cache_capacity,
        )?;
        let wal = match opts.wal_level {
            WalLevel::Off => WalManager::disabled(),
            _ => WalManager::open(dir, opts.wal_buffer_records)?,
        };
        let mtr = MtrManager::new();

        // the tag table is the durable record of slot assignment,
        // delete-marked rows included (their slots stay burned)
        for (sub, entity) in tag_table.assigned_slots()? {
            subgroups.restore_alloc(sub, entity);
        }

        // restore applied-index watermarks from the last checkpoint
        let meta_path = dir.join(GROUP_META_FILE);
        if meta_path.exists() {
            let bytes = std::fs::read(&meta_path)?;
            let meta: GroupMeta = bincode::deserialize(&bytes).map_err(|e| {
                TesseraError::Corruption(format!("group meta undecodable: {e}"))
            })?;
            mtr.restore_applied(meta.applied);
        }

        Ok(Arc::new(Self {
            table_id,
            range_group_id,
            dir: dir.to_path_buf(),
            opts: opts.clone(),
            drop_lock: RwLock::new(()),
            tag_table,
            subgroups,
            wal,
            mtr,
            tsx: TsxManager::new(),
            failed: AtomicBool::new(false),
        }))
    }

    pub fn range_group_id(&self) -> RangeGroupId {
        self.range_group_id
    }

    pub fn tag_table(&self) -> Arc<TagTable> {
        self.tag_table.clone()
    }

    pub fn subgroups(&self) -> &SubGroupManager {
        &self.subgroups
    }

    pub fn drop_lock(&self) -> &RwLock<()> {
        &self.drop_lock
    }

    fn check_failed(&self) -> Result<()> {
        if self.failed.load(Ordering::Acquire) {
            return Err(TesseraError::Internal(format!(
                "entity group {} failed, recovery required",
                self.range_group_id
            )));
        }
        Ok(())
    }

    fn fail(&self) {
        self.failed.store(true, Ordering::Release);
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub fn mtr_begin(&self, range_id: u64, index: u64) -> Result<MtrId> {
        self.check_failed()?;
        let mtr_id = self.mtr.begin(range_id, index)?;
        self.wal
            .append(LogRecord::MtrBegin {
                mtr_id,
                range_id,
                index,
            })
            .map_err(|e| {
                self.fail();
                e
            })?;
        Ok(mtr_id)
    }

    pub fn mtr_commit(&self, mtr_id: MtrId) -> Result<()> {
        self.check_failed()?;
        self.mtr.commit(mtr_id)?;
        let record = LogRecord::MtrCommit { mtr_id };
        let res = match self.opts.wal_level {
            WalLevel::Sync => self.wal.append_sync(record),
            _ => self.wal.append(record),
        };
        res.map_err(|e| {
            self.fail();
            e
        })?;
        Ok(())
    }

    pub fn mtr_rollback(&self, mtr_id: MtrId) -> Result<()> {
        self.check_failed()?;
        self.mtr.rollback(mtr_id)?;
        self.wal.append(LogRecord::MtrRollback { mtr_id }).map_err(|e| {
            self.fail();
            e
        })?;
        Ok(())
    }

    pub fn tsx_begin(&self, tsx_id: TsxId) -> Result<MtrId> {
        let mtr_id = self.mtr_begin(0, 0)?;
        self.tsx.begin(tsx_id, mtr_id)?;
        self.wal.append(LogRecord::TsxBegin { tsx_id, mtr_id })?;
        Ok(mtr_id)
    }

    pub fn tsx_commit(&self, tsx_id: &TsxId) -> Result<()> {
        let mtr_id = self
            .tsx
            .finish(tsx_id)
            .ok_or_else(|| TesseraError::MtrConflict("unknown distributed transaction".into()))?;
        self.wal.append(LogRecord::TsxCommit { tsx_id: *tsx_id })?;
        self.mtr_commit(mtr_id)
    }

    pub fn tsx_rollback(&self, tsx_id: &TsxId) -> Result<()> {
        let mtr_id = self
            .tsx
            .finish(tsx_id)
            .ok_or_else(|| TesseraError::MtrConflict("unknown distributed transaction".into()))?;
        self.wal.append(LogRecord::TsxRollback { tsx_id: *tsx_id })?;
        self.mtr_rollback(mtr_id)
    }

    // ========================================================================
    // Write path
    // ========================================================================

    /// Resolve the payload's primary tag, allocating a slot and
    /// inserting its tag row when the entity is new.
    fn resolve_or_create_entity(
        &self,
        payload: &Payload,
        mtr_id: MtrId,
    ) -> Result<(SubGroupId, EntityId)> {
        if let Some(found) = self.tag_table.get_entity_id_group_id(payload.primary_tag()) {
            return Ok(found);
        }
        let (sub, entity) = self.subgroups.allocate_entity()?;
        self.wal.append(LogRecord::InsertTags {
            mtr_id,
            table_id: self.table_id,
            range_group_id: self.range_group_id,
            payload: payload.as_bytes().to_vec(),
        })?;
        self.tag_table
            .insert_tag_record(payload.primary_tag(), payload.tag_row(), sub, entity)?;
        Ok((sub, entity))
    }

    /// Tag-only write: create or update the entity's tag row.
    pub fn put_entity(&self, ctx: &OpContext, payload: &Payload, mtr_id: MtrId) -> Result<()> {
        let _shared = self.drop_lock.read();
        self.check_failed()?;
        ctx.check()?;
        if self.tag_table.get_entity_id_group_id(payload.primary_tag()).is_some() {
            self.wal.append(LogRecord::UpdateTags {
                mtr_id,
                table_id: self.table_id,
                range_group_id: self.range_group_id,
                payload: payload.as_bytes().to_vec(),
            })?;
            self.tag_table
                .update_tag_record(payload.primary_tag(), payload.tag_row())?;
        } else {
            self.resolve_or_create_entity(payload, mtr_id)?;
        }
        Ok(())
    }

    /// Metric write: WAL first, then column blocks, split by partition.
    pub fn put_data(
        &self,
        ctx: &OpContext,
        payload: &mut Payload,
        mtr_id: MtrId,
        dedup: DedupRule,
        schema: &Schema,
    ) -> Result<PutResult> {
        let _shared = self.drop_lock.read();
        self.check_failed()?;
        ctx.check()?;

        let (sub, entity) = self.resolve_or_create_entity(payload, mtr_id)?;
        if payload.flag() == PayloadFlag::DataAndTag {
            // refresh mutable tags carried alongside the data
            if payload.has_tag_row() {
                self.tag_table
                    .update_tag_record(payload.primary_tag(), payload.tag_row())?;
            }
        }
        if !payload.has_data() {
            return Ok(PutResult::default());
        }

        let lsn = self
            .wal
            .append(LogRecord::InsertMetrics {
                mtr_id,
                table_id: self.table_id,
                range_group_id: self.range_group_id,
                payload: payload.as_bytes().to_vec(),
            })
            .map_err(|e| {
                self.fail();
                e
            })?;
        payload.set_lsn(lsn);

        self.write_rows(ctx, sub, entity, payload, schema, dedup)
    }

    /// Split payload rows into contiguous same-partition runs and hand
    /// them to the partitions.
    fn write_rows(
        &self,
        ctx: &OpContext,
        sub: SubGroupId,
        entity: EntityId,
        payload: &Payload,
        schema: &Schema,
        dedup: DedupRule,
    ) -> Result<PutResult> {
        let subgroup = self.subgroups.subgroup(sub)?;
        let interval = self.subgroups.partition_interval();
        let n = payload.row_count();

        let mut total = PutResult::default();
        let mut start = 0usize;
        while start < n {
            let pstart = partition_start_time(payload.timestamp(start), interval);
            let mut end = start + 1;
            while end < n && partition_start_time(payload.timestamp(end), interval) == pstart {
                end += 1;
            }
            let partition = subgroup
                .get_partition_table(payload.timestamp(start), true)?
                .ok_or_else(|| TesseraError::Internal("partition create refused".into()))?;
            let res =
                partition.write_payload(ctx, entity, payload, start, end - start, schema, dedup)?;
            total.rows_written += res.rows_written;
            total.tombstoned.extend(res.tombstoned);
            total.discarded_rows += res.discarded_rows;
            total.dedup_rows += res.dedup_rows;
            start = end;
        }
        Ok(total)
    }

    // ========================================================================
    // Delete path
    // ========================================================================

    /// Tombstone an entity's rows within the spans. WAL carries the
    /// planned row list so an uncommitted delete can be undone.
    pub fn delete_data(
        &self,
        ctx: &OpContext,
        primary_tag: &[u8],
        spans: &[TsSpan],
        mtr_id: MtrId,
    ) -> Result<u64> {
        let _shared = self.drop_lock.read();
        self.check_failed()?;
        ctx.check()?;
        let (sub, entity) = self
            .tag_table
            .get_entity_id_group_id(primary_tag)
            .ok_or(TesseraError::EntityNotFound)?;
        let subgroup = self.subgroups.subgroup(sub)?;

        // plan across partitions, log, then apply
        let mut plan: Vec<(Arc<crate::storage::partition::Partition>, Vec<MetricRowId>)> =
            Vec::new();
        let mut row_spans = Vec::new();
        for partition in subgroup.partitions_in_spans(spans, false)? {
            let rows = partition.rows_in_spans(entity, spans)?;
            if rows.is_empty() {
                continue;
            }
            for row in &rows {
                row_spans.push(DelRowSpan {
                    partition_start_secs: partition.start_ts_secs(),
                    block_id: row.block_id,
                    row: row.offset_row,
                });
            }
            plan.push((partition, rows));
        }
        self.wal
            .append(LogRecord::DeleteMetrics {
                mtr_id,
                table_id: self.table_id,
                range_group_id: self.range_group_id,
                primary_tag: primary_tag.to_vec(),
                spans: spans.to_vec(),
                row_spans,
            })
            .map_err(|e| {
                self.fail();
                e
            })?;

        let mut count = 0u64;
        for (partition, rows) in plan {
            count += partition.apply_tombstones(&rows);
        }
        Ok(count)
    }

    /// Delete rows of every entity whose primary-tag hash point falls
    /// in `hash_span`.
    pub fn delete_range_data(
        &self,
        ctx: &OpContext,
        hash_span: HashSpan,
        spans: &[TsSpan],
        mtr_id: MtrId,
    ) -> Result<u64> {
        let mut count = 0u64;
        for row in self.tag_table.scan(&[])? {
            ctx.check()?;
            if hash_span.contains(hash_point(&row.primary_tag)) {
                count += self.delete_data(ctx, &row.primary_tag, spans, mtr_id)?;
            }
        }
        Ok(count)
    }

    /// Drop entities entirely: metric tombstones plus tag delete marks.
    pub fn delete_entities(
        &self,
        ctx: &OpContext,
        primary_tags: &[Vec<u8>],
        mtr_id: MtrId,
    ) -> Result<u64> {
        let _shared = self.drop_lock.read();
        self.check_failed()?;
        let mut count = 0u64;
        for tag in primary_tags {
            ctx.check()?;
            let (sub, entity) = match self.tag_table.get_entity_id_group_id(tag) {
                Some(found) => found,
                None => continue,
            };
            self.wal.append(LogRecord::DeleteTags {
                mtr_id,
                table_id: self.table_id,
                range_group_id: self.range_group_id,
                primary_tag: tag.clone(),
                sub_group_id: sub,
                entity_id: entity,
            })?;
            let subgroup = self.subgroups.subgroup(sub)?;
            for partition in subgroup.all_partitions()? {
                count += partition.delete_entity(entity)?;
            }
            self.tag_table.delete_tag_record(tag)?;
        }
        Ok(count)
    }

    // ========================================================================
    // Durability
    // ========================================================================

    /// Flush data files and the WAL buffer.
    pub fn flush(&self) -> Result<()> {
        self.subgroups.flush()?;
        self.tag_table.sync()?;
        self.wal.flush(true)
    }

    /// Durable checkpoint: flush everything, persist the applied-index
    /// map, then drop the replayed WAL.
    pub fn checkpoint(&self) -> Result<()> {
        self.check_failed()?;
        let result = (|| -> Result<()> {
            self.flush()?;
            let meta = GroupMeta {
                applied: self.mtr.applied_map(),
                checkpoint_lsn: self.wal.current_lsn(),
            };
            let image = bincode::serialize(&meta)?;
            self.wal.append_sync(LogRecord::Checkpoint {
                image: image.clone(),
            })?;
            std::fs::write(self.dir.join(GROUP_META_FILE), &image)?;
            self.wal.truncate()?;
            self.mtr.gc();
            Ok(())
        })();
        if result.is_err() {
            self.fail();
        } else {
            info!(range_group = self.range_group_id, "checkpoint complete");
        }
        result
    }

    /// Replay the WAL: redo committed mini-transactions, undo
    /// uncommitted ones. Clears the failed flag on success.
    pub fn recover(&self, schema: &Schema) -> Result<()> {
        let result = crate::wal::recovery::replay(self, schema);
        match &result {
            Ok(stats) => {
                self.failed.store(false, Ordering::Release);
                info!(
                    range_group = self.range_group_id,
                    redone = stats.redone,
                    undone = stats.undone,
                    "recovery complete"
                );
            }
            Err(e) => {
                warn!(range_group = self.range_group_id, error = %e, "recovery failed");
                self.fail();
            }
        }
        result.map(|_| ())
    }

    // ========================================================================
    // Recovery hooks
    // ========================================================================

    /// Redo one logged metric insert. Partitions whose recorded max
    /// LSN already covers the record are skipped; elsewhere OVERRIDE
    /// dedup makes the replay idempotent.
    pub(crate) fn redo_insert_metrics(
        &self,
        payload_bytes: &[u8],
        lsn: Lsn,
        schema: &Schema,
    ) -> Result<u64> {
        let mut payload = Payload::parse(payload_bytes.to_vec(), schema)?;
        let (sub, entity) = match self.tag_table.get_entity_id_group_id(payload.primary_tag()) {
            Some(found) => found,
            None => {
                let (sub, entity) = self.subgroups.allocate_entity()?;
                self.tag_table.insert_tag_record(
                    payload.primary_tag(),
                    payload.tag_row(),
                    sub,
                    entity,
                )?;
                (sub, entity)
            }
        };
        if !payload.has_data() {
            return Ok(0);
        }
        payload.set_lsn(lsn);

        let subgroup = self.subgroups.subgroup(sub)?;
        let interval = self.subgroups.partition_interval();
        let n = payload.row_count();
        let ctx = OpContext::new();
        let mut written = 0u64;
        let mut start = 0usize;
        while start < n {
            let pstart = partition_start_time(payload.timestamp(start), interval);
            let mut end = start + 1;
            while end < n && partition_start_time(payload.timestamp(end), interval) == pstart {
                end += 1;
            }
            let partition = subgroup
                .get_partition_table(payload.timestamp(start), true)?
                .ok_or_else(|| TesseraError::Internal("partition create refused".into()))?;
            if partition.max_lsn() < lsn {
                let res = partition.write_payload(
                    &ctx,
                    entity,
                    &payload,
                    start,
                    end - start,
                    schema,
                    DedupRule::Override,
                )?;
                written += res.rows_written;
            }
            start = end;
        }
        Ok(written)
    }

    /// Undo one uncommitted metric insert by tombstoning the rows that
    /// carry its LSN.
    pub(crate) fn undo_insert_metrics(
        &self,
        payload_bytes: &[u8],
        lsn: Lsn,
        schema: &Schema,
    ) -> Result<u64> {
        let payload = Payload::parse(payload_bytes.to_vec(), schema)?;
        let (sub, entity) = match self.tag_table.get_entity_id_group_id(payload.primary_tag()) {
            Some(found) => found,
            None => return Ok(0),
        };
        if !payload.has_data() {
            return Ok(0);
        }
        let subgroup = self.subgroups.subgroup(sub)?;
        let span = [TsSpan::new(payload.min_ts(), payload.max_ts())];
        let mut undone = 0u64;
        for partition in subgroup.partitions_in_spans(&span, false)? {
            undone += partition.undo_insert(entity, lsn)?;
        }
        Ok(undone)
    }

    /// Redo a logged tag insert (no-op when the key already resolves).
    pub(crate) fn redo_insert_tags(&self, payload_bytes: &[u8], schema: &Schema) -> Result<()> {
        let payload = Payload::parse(payload_bytes.to_vec(), schema)?;
        if self.tag_table.get_entity_id_group_id(payload.primary_tag()).is_some() {
            return Ok(());
        }
        let (sub, entity) = self.subgroups.allocate_entity()?;
        self.tag_table
            .insert_tag_record(payload.primary_tag(), payload.tag_row(), sub, entity)?;
        Ok(())
    }

    /// Redo a logged metric delete through its timestamp spans.
    pub(crate) fn redo_delete_metrics(&self, primary_tag: &[u8], spans: &[TsSpan]) -> Result<u64> {
        let (sub, entity) = match self.tag_table.get_entity_id_group_id(primary_tag) {
            Some(found) => found,
            None => return Ok(0),
        };
        let subgroup = self.subgroups.subgroup(sub)?;
        let mut count = 0u64;
        for partition in subgroup.partitions_in_spans(spans, false)? {
            count += partition.delete_data(entity, spans)?;
        }
        Ok(count)
    }

    /// Undo an uncommitted metric delete by clearing its tombstones.
    pub(crate) fn undo_delete_metrics(
        &self,
        primary_tag: &[u8],
        row_spans: &[DelRowSpan],
    ) -> Result<()> {
        let (sub, entity) = match self.tag_table.get_entity_id_group_id(primary_tag) {
            Some(found) => found,
            None => return Ok(()),
        };
        let subgroup = self.subgroups.subgroup(sub)?;
        for span in row_spans {
            let start_us = span.partition_start_secs * 1_000_000;
            if let Some(partition) = subgroup.get_partition_table(start_us, false)? {
                partition.undo_delete(
                    entity,
                    &[MetricRowId::new(span.block_id, span.row)],
                );
            }
        }
        Ok(())
    }

    pub(crate) fn wal(&self) -> &WalManager {
        &self.wal
    }

    pub(crate) fn mtr_manager(&self) -> &MtrManager {
        &self.mtr
    }

    pub(crate) fn options(&self) -> &EngineOptions {
        &self.opts
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    /// Drop all files of this entity-group.
    pub fn remove_files(&self) -> Result<()> {
        let _exclusive = self.drop_lock.write();
        std::fs::remove_dir_all(&self.dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::test_support::{simple_payload, simple_schema};
    use tempfile::tempdir;

    fn open_group(dir: &Path) -> (Arc<EntityGroup>, Schema) {
        let schema = simple_schema();
        let opts = EngineOptions {
            block_rows: 4,
            blocks_per_segment: 8,
            ..Default::default()
        };
        let eg = EntityGroup::open(dir, 1, 100, &TagSchema::primary_only(32), &opts).unwrap();
        (eg, schema)
    }

    fn put_rows(
        eg: &EntityGroup,
        schema: &Schema,
        tag: &[u8],
        rows: &[(i64, Option<i32>)],
    ) -> PutResult {
        let mtr = eg.mtr_begin(1, 0).unwrap();
        let mut payload = simple_payload(schema, tag, rows);
        let res = eg
            .put_data(&OpContext::new(), &mut payload, mtr, DedupRule::Override, schema)
            .unwrap();
        eg.mtr_commit(mtr).unwrap();
        res
    }

    #[test]
    fn test_put_data_creates_entity_and_rows() {
        let dir = tempdir().unwrap();
        let (eg, schema) = open_group(dir.path());

        let res = put_rows(&eg, &schema, b"e1", &[(1000, Some(10)), (2000, Some(20))]);
        assert_eq!(res.rows_written, 2);

        let (sub, entity) = eg.tag_table().get_entity_id_group_id(b"e1").unwrap();
        assert_eq!((sub, entity), (1, 1));

        let sg = eg.subgroups().subgroup(sub).unwrap();
        let p = sg.get_partition_table(1000, false).unwrap().unwrap();
        assert_eq!(p.entity_item(entity).unwrap().row_written, 2);
        // rows carry the WAL LSN
        let items = p.get_all_block_items(entity, false);
        let seg = p.segment_for_block(items[0].block_id).unwrap();
        let lsns = seg.read_lsns(items[0].block_id, 0, 2).unwrap();
        assert!(lsns[0] > 0);
        assert_eq!(lsns[0], lsns[1]);
    }

    #[test]
    fn test_rows_split_across_partitions() {
        let dir = tempdir().unwrap();
        let (eg, schema) = open_group(dir.path());
        let day = 86_400_000_000i64;
        put_rows(
            &eg,
            &schema,
            b"e1",
            &[(1000, Some(1)), (day + 1000, Some(2)), (2 * day + 1000, Some(3))],
        );
        let sg = eg.subgroups().subgroup(1).unwrap();
        assert_eq!(sg.partition_times().unwrap(), vec![0, 86400, 172800]);
    }

    #[test]
    fn test_delete_data_logs_and_applies() {
        let dir = tempdir().unwrap();
        let (eg, schema) = open_group(dir.path());
        put_rows(&eg, &schema, b"e1", &[(1000, Some(10)), (2000, Some(20)), (3000, Some(30))]);

        let mtr = eg.mtr_begin(1, 0).unwrap();
        let n = eg
            .delete_data(&OpContext::new(), b"e1", &[TsSpan::new(1500, 2500)], mtr)
            .unwrap();
        eg.mtr_commit(mtr).unwrap();
        assert_eq!(n, 1);

        // second identical delete finds nothing new
        let mtr = eg.mtr_begin(1, 0).unwrap();
        let n = eg
            .delete_data(&OpContext::new(), b"e1", &[TsSpan::new(1500, 2500)], mtr)
            .unwrap();
        eg.mtr_commit(mtr).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_delete_entities_and_range() {
        let dir = tempdir().unwrap();
        let (eg, schema) = open_group(dir.path());
        put_rows(&eg, &schema, b"e1", &[(1000, Some(10))]);
        put_rows(&eg, &schema, b"e2", &[(1000, Some(20))]);

        let mtr = eg.mtr_begin(1, 0).unwrap();
        let n = eg
            .delete_entities(&OpContext::new(), &[b"e1".to_vec()], mtr)
            .unwrap();
        eg.mtr_commit(mtr).unwrap();
        assert_eq!(n, 1);
        assert!(eg.tag_table().get_entity_id_group_id(b"e1").is_none());
        assert!(eg.tag_table().get_entity_id_group_id(b"e2").is_some());

        let mtr = eg.mtr_begin(1, 0).unwrap();
        let n = eg
            .delete_range_data(
                &OpContext::new(),
                HashSpan::all(),
                &[TsSpan::all()],
                mtr,
            )
            .unwrap();
        eg.mtr_commit(mtr).unwrap();
        assert_eq!(n, 1); // only e2 still has live rows
    }

    #[test]
    fn test_alloc_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let (eg, schema) = open_group(dir.path());
            put_rows(&eg, &schema, b"e1", &[(1000, Some(1))]);
            put_rows(&eg, &schema, b"e2", &[(1000, Some(2))]);
            eg.flush().unwrap();
        }
        let (eg, schema) = open_group(dir.path());
        // existing entities resolve to their old slots
        assert_eq!(eg.tag_table().get_entity_id_group_id(b"e1"), Some((1, 1)));
        put_rows(&eg, &schema, b"e3", &[(1000, Some(3))]);
        assert_eq!(eg.tag_table().get_entity_id_group_id(b"e3"), Some((1, 3)));
    }

    #[test]
    fn test_tsx_bracket_maps_to_mtr() {
        let dir = tempdir().unwrap();
        let (eg, schema) = open_group(dir.path());
        let uuid = [9u8; 16];
        let mtr = eg.tsx_begin(uuid).unwrap();
        let mut payload = simple_payload(&schema, b"e1", &[(1000, Some(1))]);
        eg.put_data(&OpContext::new(), &mut payload, mtr, DedupRule::Override, &schema)
            .unwrap();
        eg.tsx_commit(&uuid).unwrap();
        assert!(eg.tsx_commit(&uuid).is_err());
    }
}
