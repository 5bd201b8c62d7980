//! Engine entry point: table registry, control API, background
//! worker.
//!
//! One `TsEngine` owns a database directory (exclusively, via a file
//! lock) and every table under it. Settings, transaction managers and
//! statistics live on the engine or its entity-groups and travel
//! through explicit references; nothing is process-global.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use fs2::FileExt;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info};

use crate::context::OpContext;
use crate::data::{
    AggType, ColumnSchema, ColumnType, DedupRule, HashSpan, MtrId, RangeGroupId, Schema, TableId,
    TsSpan, TsxId,
};
use crate::iter::agg::AggSpec;
use crate::iter::{AggIterator, AggRow, BatchIterator, RawIterator, TableIterator, TagIterator};
use crate::payload::Payload;
use crate::storage::entity_group::EntityGroup;
use crate::storage::partition::PutResult;
use crate::storage::snapshot::{self, Snapshot};
use crate::storage::stats::{EngineStats, StatsSnapshot};
use crate::storage::{EngineOptions, WalLevel};
use crate::table::TsTable;
use crate::tag::TagSchema;
use crate::{Result, TesseraError};

/// Aggregate iterators chained across sub-groups: one result row per
/// entity.
pub struct AggChain {
    iters: Vec<AggIterator>,
    current: usize,
}

impl AggChain {
    pub fn next(&mut self, ctx: &OpContext) -> Result<Option<AggRow>> {
        while self.current < self.iters.len() {
            if let Some(row) = self.iters[self.current].next(ctx)? {
                return Ok(Some(row));
            }
            self.current += 1;
        }
        Ok(None)
    }
}

/// Iterator handle returned by `get_iterator`.
pub enum TsIterator {
    Raw(TableIterator),
    Agg(AggChain),
}

/// Tag iterators chained across entity-groups.
pub struct TagTableIterator {
    iters: Vec<TagIterator>,
    current: usize,
}

impl TagTableIterator {
    pub fn next(&mut self, ctx: &OpContext) -> Result<Option<Vec<crate::tag::TagRowView>>> {
        while self.current < self.iters.len() {
            if let Some(batch) = self.iters[self.current].next(ctx)? {
                return Ok(Some(batch));
            }
            self.current += 1;
        }
        Ok(None)
    }
}

struct WorkerSignal {
    stop: Mutex<bool>,
    wake: Condvar,
}

pub struct TsEngine {
    dir: PathBuf,
    options: RwLock<EngineOptions>,
    tables: RwLock<HashMap<TableId, Arc<TsTable>>>,
    snapshots: Mutex<HashMap<u64, Snapshot>>,
    next_snapshot_id: AtomicU64,
    stats: EngineStats,
    signal: Arc<WorkerSignal>,
    worker: Mutex<Option<std::thread::JoinHandle<()>>>,
    _lock_file: File,
}

impl TsEngine {
    /// Open (creating if needed) a database directory. The directory
    /// is locked against concurrent engines.
    pub fn open(dir: &Path, options: EngineOptions) -> Result<Arc<Self>> {
        std::fs::create_dir_all(dir)?;
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(dir.join("LOCK"))?;
        lock_file.try_lock_exclusive().map_err(|_| {
            TesseraError::Internal(format!("database at {} is locked", dir.display()))
        })?;

        let engine = Arc::new(Self {
            dir: dir.to_path_buf(),
            options: RwLock::new(options.clone()),
            tables: RwLock::new(HashMap::new()),
            snapshots: Mutex::new(HashMap::new()),
            next_snapshot_id: AtomicU64::new(1),
            stats: EngineStats::new(),
            signal: Arc::new(WorkerSignal {
                stop: Mutex::new(false),
                wake: Condvar::new(),
            }),
            worker: Mutex::new(None),
            _lock_file: lock_file,
        });

        // open tables already on disk
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Ok(table_id) = entry.file_name().to_string_lossy().parse::<TableId>() {
                let table = TsTable::open(dir, table_id, &options)?;
                engine.tables.write().insert(table_id, table);
            }
        }

        engine.spawn_worker();
        info!(dir = %dir.display(), tables = engine.tables.read().len(), "engine opened");
        Ok(engine)
    }

    fn spawn_worker(self: &Arc<Self>) {
        let weak: Weak<TsEngine> = Arc::downgrade(self);
        let signal = self.signal.clone();
        let handle = std::thread::Builder::new()
            .name("tessera-bg".into())
            .spawn(move || loop {
                let tick = weak
                    .upgrade()
                    .map(|e| e.options.read().background_tick_ms)
                    .unwrap_or(1000);
                {
                    let mut stop = signal.stop.lock();
                    if *stop {
                        return;
                    }
                    signal
                        .wake
                        .wait_for(&mut stop, Duration::from_millis(tick));
                    if *stop {
                        return;
                    }
                }
                let engine = match weak.upgrade() {
                    Some(e) => e,
                    None => return,
                };
                engine.background_pass();
            })
            .expect("background worker spawn");
        *self.worker.lock() = Some(handle);
    }

    /// One background sweep: drain WAL buffers to disk and reclaim
    /// idle partitions.
    fn background_pass(&self) {
        let wal_level = self.options.read().wal_level;
        for table in self.tables.read().values() {
            for eg in table.entity_groups() {
                if wal_level != WalLevel::Off {
                    if let Err(e) = eg.wal().flush(wal_level == WalLevel::Background) {
                        debug!(error = %e, "background WAL flush failed");
                    }
                }
            }
        }
    }

    /// Replace the engine options and wake the background worker so the
    /// new cadence takes effect immediately.
    pub fn update_setting(&self, options: EngineOptions) {
        *self.options.write() = options;
        self.signal.wake.notify_all();
    }

    pub fn options(&self) -> EngineOptions {
        self.options.read().clone()
    }

    /// Stop the background worker. Called by Drop; explicit callers get
    /// deterministic shutdown.
    pub fn close(&self) {
        {
            let mut stop = self.signal.stop.lock();
            *stop = true;
        }
        self.signal.wake.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    fn table(&self, table_id: TableId) -> Result<Arc<TsTable>> {
        self.tables
            .read()
            .get(&table_id)
            .cloned()
            .ok_or(TesseraError::TableNotFound(table_id))
    }

    fn entity_group(&self, table_id: TableId, rg: RangeGroupId) -> Result<Arc<EntityGroup>> {
        self.table(table_id)?.entity_group(rg)
    }

    // ========================================================================
    // DDL
    // ========================================================================

    pub fn create_ts_table(
        &self,
        _ctx: &OpContext,
        table_id: TableId,
        schema: Schema,
        tag_schema: TagSchema,
        partition_interval_secs: u64,
        range_groups: &[RangeGroupId],
    ) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.contains_key(&table_id) {
            return Err(TesseraError::TableExists(table_id));
        }
        let table = TsTable::create(
            &self.dir,
            table_id,
            schema.clone(),
            tag_schema,
            partition_interval_secs,
            range_groups,
            &self.options.read(),
        )?;
        let image = bincode::serialize(&schema)?;
        for eg in table.entity_groups() {
            eg.wal().append(crate::wal::LogRecord::DdlCreate {
                table_id,
                schema: image.clone(),
            })?;
        }
        tables.insert(table_id, table);
        Ok(())
    }

    pub fn drop_ts_table(&self, _ctx: &OpContext, table_id: TableId) -> Result<()> {
        let table = {
            let mut tables = self.tables.write();
            tables
                .remove(&table_id)
                .ok_or(TesseraError::TableNotFound(table_id))?
        };
        for eg in table.entity_groups() {
            let _ = eg.wal().append(crate::wal::LogRecord::DdlDrop { table_id });
        }
        table.remove_files()?;
        info!(table = table_id, "table dropped");
        Ok(())
    }

    pub fn add_column(&self, table_id: TableId, column: ColumnSchema) -> Result<Schema> {
        self.table(table_id)?.add_column(column)
    }

    pub fn drop_column(&self, table_id: TableId, col_id: u32) -> Result<Schema> {
        self.table(table_id)?.drop_column(col_id)
    }

    pub fn alter_column_type(
        &self,
        table_id: TableId,
        col_id: u32,
        ty: ColumnType,
    ) -> Result<Schema> {
        self.table(table_id)?.alter_column_type(col_id, ty)
    }

    pub fn alter_partition_interval(&self, table_id: TableId, secs: u64) -> Result<()> {
        self.table(table_id)?.alter_partition_interval(secs)
    }

    // ========================================================================
    // Write path
    // ========================================================================

    pub fn put_entity(
        &self,
        ctx: &OpContext,
        table_id: TableId,
        range_group_id: RangeGroupId,
        payload_bytes: Vec<u8>,
        mtr_id: MtrId,
    ) -> Result<()> {
        let table = self.table(table_id)?;
        let eg = table.entity_group(range_group_id)?;
        let payload = Payload::parse(payload_bytes, &table.schema_latest())?;
        eg.put_entity(ctx, &payload, mtr_id)
    }

    pub fn put_data(
        &self,
        ctx: &OpContext,
        table_id: TableId,
        range_group_id: RangeGroupId,
        payload_bytes: Vec<u8>,
        mtr_id: MtrId,
        dedup: Option<DedupRule>,
    ) -> Result<PutResult> {
        let table = self.table(table_id)?;
        let eg = table.entity_group(range_group_id)?;
        let schema = table.schema_latest();
        let mut payload = Payload::parse(payload_bytes, &schema)?;
        let dedup = dedup.unwrap_or(self.options.read().default_dedup);
        let res = eg.put_data(ctx, &mut payload, mtr_id, dedup, &schema)?;
        self.stats.record_write(
            res.rows_written,
            (res.discarded_rows + res.dedup_rows) as u64,
        );
        self.stats.record_wal_records(1);
        Ok(res)
    }

    // ========================================================================
    // Delete path
    // ========================================================================

    pub fn delete_data(
        &self,
        ctx: &OpContext,
        table_id: TableId,
        range_group_id: RangeGroupId,
        primary_tag: &[u8],
        spans: &[TsSpan],
        mtr_id: MtrId,
    ) -> Result<u64> {
        let n = self
            .entity_group(table_id, range_group_id)?
            .delete_data(ctx, primary_tag, spans, mtr_id)?;
        self.stats.record_delete(n);
        Ok(n)
    }

    pub fn delete_range_data(
        &self,
        ctx: &OpContext,
        table_id: TableId,
        range_group_id: RangeGroupId,
        hash_span: HashSpan,
        spans: &[TsSpan],
        mtr_id: MtrId,
    ) -> Result<u64> {
        self.entity_group(table_id, range_group_id)?
            .delete_range_data(ctx, hash_span, spans, mtr_id)
    }

    pub fn delete_entities(
        &self,
        ctx: &OpContext,
        table_id: TableId,
        range_group_id: RangeGroupId,
        primary_tags: &[Vec<u8>],
        mtr_id: MtrId,
    ) -> Result<u64> {
        self.entity_group(table_id, range_group_id)?
            .delete_entities(ctx, primary_tags, mtr_id)
    }

    // ========================================================================
    // Read path
    // ========================================================================

    /// Build an iterator over the given entities (by primary tag).
    /// Empty `agg_types` yields the raw iterator; otherwise one
    /// aggregate row per entity, with `agg_types[i]` applied to
    /// `projection[i]`.
    #[allow(clippy::too_many_arguments)]
    pub fn get_iterator(
        &self,
        _ctx: &OpContext,
        table_id: TableId,
        primary_tags: &[Vec<u8>],
        ts_spans: &[TsSpan],
        projection: &[usize],
        agg_types: &[AggType],
        reverse: bool,
        table_version: u32,
    ) -> Result<TsIterator> {
        let table = self.table(table_id)?;
        let schema = table.schema_by_version(table_version)?;
        self.stats.record_batch_read();

        let mut proj_cols = Vec::with_capacity(projection.len());
        for &idx in projection {
            let col = schema
                .column(idx)
                .ok_or(TesseraError::ColumnNotFound(idx as u32))?;
            if col.dropped {
                return Err(TesseraError::ColumnNotFound(col.id));
            }
            proj_cols.push(col.clone());
        }
        if !agg_types.is_empty() && agg_types.len() != projection.len() {
            return Err(TesseraError::Internal(
                "aggregate list and projection list must pair up".into(),
            ));
        }

        let mut raw_iters: Vec<Box<dyn BatchIterator>> = Vec::new();
        let mut agg_iters: Vec<AggIterator> = Vec::new();

        for eg in table.entity_groups() {
            let _shared = eg.drop_lock().read();
            // group requested entities by sub-group
            let mut by_sub: HashMap<u32, Vec<u32>> = HashMap::new();
            for tag in primary_tags {
                if let Some((sub, entity)) = eg.tag_table().get_entity_id_group_id(tag) {
                    by_sub.entry(sub).or_default().push(entity);
                }
            }
            for (sub, entities) in by_sub {
                let subgroup = eg.subgroups().subgroup(sub)?;
                let partitions = subgroup.partitions_in_spans(ts_spans, false)?;
                if agg_types.is_empty() {
                    raw_iters.push(Box::new(RawIterator::new(
                        partitions,
                        entities,
                        ts_spans.to_vec(),
                        proj_cols.clone(),
                        reverse,
                    )));
                } else {
                    let specs = proj_cols
                        .iter()
                        .zip(agg_types)
                        .map(|(col, &agg)| AggSpec {
                            col: col.clone(),
                            agg,
                        })
                        .collect();
                    agg_iters.push(AggIterator::new(
                        partitions,
                        entities,
                        ts_spans.to_vec(),
                        specs,
                    ));
                }
            }
        }

        if agg_types.is_empty() {
            Ok(TsIterator::Raw(TableIterator::new(raw_iters)))
        } else {
            Ok(TsIterator::Agg(AggChain {
                iters: agg_iters,
                current: 0,
            }))
        }
    }

    /// Scan the tag rows of every entity-group of the table.
    pub fn get_tag_iterator(
        &self,
        table_id: TableId,
        tag_projection: Vec<usize>,
    ) -> Result<TagTableIterator> {
        let table = self.table(table_id)?;
        let iters = table
            .entity_groups()
            .into_iter()
            .map(|eg| TagIterator::new(eg.tag_table(), tag_projection.clone()))
            .collect();
        Ok(TagTableIterator { iters, current: 0 })
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub fn mtr_begin(
        &self,
        table_id: TableId,
        range_group_id: RangeGroupId,
        range_id: u64,
        index: u64,
    ) -> Result<MtrId> {
        self.entity_group(table_id, range_group_id)?
            .mtr_begin(range_id, index)
    }

    pub fn mtr_commit(
        &self,
        table_id: TableId,
        range_group_id: RangeGroupId,
        mtr_id: MtrId,
    ) -> Result<()> {
        self.entity_group(table_id, range_group_id)?.mtr_commit(mtr_id)
    }

    pub fn mtr_rollback(
        &self,
        table_id: TableId,
        range_group_id: RangeGroupId,
        mtr_id: MtrId,
    ) -> Result<()> {
        self.entity_group(table_id, range_group_id)?
            .mtr_rollback(mtr_id)
    }

    pub fn tsx_begin(&self, table_id: TableId, tsx_id: TsxId) -> Result<()> {
        for eg in self.table(table_id)?.entity_groups() {
            eg.tsx_begin(tsx_id)?;
        }
        Ok(())
    }

    pub fn tsx_commit(&self, table_id: TableId, tsx_id: TsxId) -> Result<()> {
        for eg in self.table(table_id)?.entity_groups() {
            eg.tsx_commit(&tsx_id)?;
        }
        Ok(())
    }

    pub fn tsx_rollback(&self, table_id: TableId, tsx_id: TsxId) -> Result<()> {
        for eg in self.table(table_id)?.entity_groups() {
            eg.tsx_rollback(&tsx_id)?;
        }
        Ok(())
    }

    // ========================================================================
    // Durability
    // ========================================================================

    /// Flush every table's data files and WAL buffers.
    pub fn flush_buffer(&self) -> Result<()> {
        for table in self.tables.read().values() {
            table.flush()?;
        }
        Ok(())
    }

    /// Durable checkpoint across all tables; replayed WAL is dropped.
    pub fn create_checkpoint(&self) -> Result<()> {
        for table in self.tables.read().values() {
            table.checkpoint()?;
        }
        self.stats.record_checkpoint();
        Ok(())
    }

    /// Replay WALs: redo committed mini-transactions, undo uncommitted
    /// ones.
    pub fn recover(&self) -> Result<()> {
        for table in self.tables.read().values() {
            table.recover()?;
        }
        self.stats.record_recovery();
        Ok(())
    }

    /// Counter snapshot for operators.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Package the entities of a hash span for migration.
    pub fn create_snapshot(
        &self,
        table_id: TableId,
        range_group_id: RangeGroupId,
        hash_span: HashSpan,
    ) -> Result<u64> {
        let table = self.table(table_id)?;
        let eg = table.entity_group(range_group_id)?;
        let id = self.next_snapshot_id.fetch_add(1, Ordering::SeqCst);
        let snap = snapshot::build_snapshot(id, &eg, &table.schema_latest(), hash_span)?;
        self.snapshots.lock().insert(id, snap);
        Ok(id)
    }

    /// Next frame of a built snapshot; None when drained.
    pub fn get_snapshot_data(&self, snapshot_id: u64) -> Result<Option<Vec<u8>>> {
        let mut snaps = self.snapshots.lock();
        let snap = snaps
            .get_mut(&snapshot_id)
            .ok_or(TesseraError::SnapshotNotFound(snapshot_id))?;
        Ok(snap.next_frame())
    }

    /// Destination side: buffer one received frame, creating the
    /// snapshot slot on first use.
    pub fn write_snapshot_data(&self, snapshot_id: u64, frame: Vec<u8>) -> Result<()> {
        let mut snaps = self.snapshots.lock();
        snaps
            .entry(snapshot_id)
            .or_insert_with(|| Snapshot::empty(snapshot_id))
            .push_frame(frame);
        Ok(())
    }

    /// Apply a fully buffered snapshot into the target entity-group.
    pub fn apply_snapshot(
        &self,
        ctx: &OpContext,
        table_id: TableId,
        range_group_id: RangeGroupId,
        snapshot_id: u64,
    ) -> Result<u64> {
        let table = self.table(table_id)?;
        let eg = table.entity_group(range_group_id)?;
        let snaps = self.snapshots.lock();
        let snap = snaps
            .get(&snapshot_id)
            .ok_or(TesseraError::SnapshotNotFound(snapshot_id))?;
        if !snap.is_enabled() {
            return Err(TesseraError::SnapshotNotFound(snapshot_id));
        }
        snapshot::apply_snapshot(ctx, &eg, &table.schema_latest(), snap)
    }

    /// Mark a buffered snapshot complete and ready to apply.
    pub fn enable_snapshot(&self, snapshot_id: u64) -> Result<()> {
        let mut snaps = self.snapshots.lock();
        let snap = snaps
            .get_mut(&snapshot_id)
            .ok_or(TesseraError::SnapshotNotFound(snapshot_id))?;
        snap.set_enabled(true);
        Ok(())
    }

    pub fn drop_snapshot(&self, snapshot_id: u64) -> Result<()> {
        self.snapshots
            .lock()
            .remove(&snapshot_id)
            .map(|_| ())
            .ok_or(TesseraError::SnapshotNotFound(snapshot_id))
    }
}

impl Drop for TsEngine {
    fn drop(&mut self) {
        self.close();
    }
}
