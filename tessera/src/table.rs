//! Time-series table: the schema version chain plus one entity-group
//! per range-group.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::data::{ColumnSchema, ColumnType, RangeGroupId, Schema, TableId};
use crate::storage::entity_group::EntityGroup;
use crate::storage::EngineOptions;
use crate::tag::TagSchema;
use crate::wal::LogRecord;
use crate::{Result, TesseraError};

const TABLE_META_MAGIC: u32 = 0x5453_5442; // "TSTB"
const TABLE_META_FILE: &str = "table.meta";

#[derive(Debug, Serialize, Deserialize)]
struct TableMeta {
    magic: u32,
    table_id: TableId,
    /// Every schema version, ascending; the last is current.
    schemas: Vec<Schema>,
    tag_schema: TagSchema,
    partition_interval_secs: u64,
    range_groups: Vec<RangeGroupId>,
}

pub struct TsTable {
    table_id: TableId,
    dir: PathBuf,
    opts: EngineOptions,
    schemas: RwLock<Vec<Schema>>,
    tag_schema: TagSchema,
    partition_interval_secs: RwLock<u64>,
    entity_groups: RwLock<HashMap<RangeGroupId, Arc<EntityGroup>>>,
}

impl TsTable {
    pub fn create(
        base_dir: &Path,
        table_id: TableId,
        schema: Schema,
        tag_schema: TagSchema,
        partition_interval_secs: u64,
        range_groups: &[RangeGroupId],
        opts: &EngineOptions,
    ) -> Result<Arc<Self>> {
        let dir = base_dir.join(table_id.to_string());
        if dir.exists() {
            return Err(TesseraError::TableExists(table_id));
        }
        std::fs::create_dir_all(&dir)?;

        let table = Self {
            table_id,
            dir,
            opts: opts.clone(),
            schemas: RwLock::new(vec![schema]),
            tag_schema,
            partition_interval_secs: RwLock::new(partition_interval_secs),
            entity_groups: RwLock::new(HashMap::new()),
        };
        for &rg in range_groups {
            table.open_entity_group(rg)?;
        }
        table.persist_meta()?;
        info!(table = table_id, ranges = range_groups.len(), "table created");
        Ok(Arc::new(table))
    }

    pub fn open(base_dir: &Path, table_id: TableId, opts: &EngineOptions) -> Result<Arc<Self>> {
        let dir = base_dir.join(table_id.to_string());
        let bytes = std::fs::read(dir.join(TABLE_META_FILE))
            .map_err(|_| TesseraError::TableNotFound(table_id))?;
        let meta: TableMeta = bincode::deserialize(&bytes)
            .map_err(|e| TesseraError::Corruption(format!("table meta undecodable: {e}")))?;
        if meta.magic != TABLE_META_MAGIC {
            return Err(TesseraError::Corruption("table meta bad magic".into()));
        }

        let table = Self {
            table_id,
            dir,
            opts: opts.clone(),
            schemas: RwLock::new(meta.schemas),
            tag_schema: meta.tag_schema,
            partition_interval_secs: RwLock::new(meta.partition_interval_secs),
            entity_groups: RwLock::new(HashMap::new()),
        };
        for rg in meta.range_groups {
            table.open_entity_group(rg)?;
        }
        Ok(Arc::new(table))
    }

    fn open_entity_group(&self, range_group_id: RangeGroupId) -> Result<Arc<EntityGroup>> {
        let mut opts = self.opts.clone();
        opts.partition_interval_secs = *self.partition_interval_secs.read();
        let eg = EntityGroup::open(
            &self.dir.join(range_group_id.to_string()),
            self.table_id,
            range_group_id,
            &self.tag_schema,
            &opts,
        )?;
        self.entity_groups.write().insert(range_group_id, eg.clone());
        Ok(eg)
    }

    fn persist_meta(&self) -> Result<()> {
        let meta = TableMeta {
            magic: TABLE_META_MAGIC,
            table_id: self.table_id,
            schemas: self.schemas.read().clone(),
            tag_schema: self.tag_schema.clone(),
            partition_interval_secs: *self.partition_interval_secs.read(),
            range_groups: self.entity_groups.read().keys().copied().collect(),
        };
        let bytes = bincode::serialize(&meta)?;
        std::fs::write(self.dir.join(TABLE_META_FILE), bytes)?;
        Ok(())
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn schema_latest(&self) -> Schema {
        self.schemas.read().last().cloned().expect("schema chain never empty")
    }

    pub fn schema_by_version(&self, version: u32) -> Result<Schema> {
        if version == 0 {
            return Ok(self.schema_latest());
        }
        self.schemas
            .read()
            .iter()
            .find(|s| s.version == version)
            .cloned()
            .ok_or_else(|| {
                TesseraError::SchemaMismatch(format!(
                    "table {} has no schema version {version}",
                    self.table_id
                ))
            })
    }

    pub fn entity_group(&self, range_group_id: RangeGroupId) -> Result<Arc<EntityGroup>> {
        self.entity_groups
            .read()
            .get(&range_group_id)
            .cloned()
            .ok_or(TesseraError::RangeGroupNotFound(range_group_id))
    }

    pub fn entity_groups(&self) -> Vec<Arc<EntityGroup>> {
        self.entity_groups.read().values().cloned().collect()
    }

    // ========================================================================
    // Schema evolution
    // ========================================================================

    fn push_schema_version(&self, mutate: impl FnOnce(&mut Schema) -> Result<()>) -> Result<Schema> {
        let mut schemas = self.schemas.write();
        let mut next = schemas.last().cloned().expect("schema chain never empty");
        next.version += 1;
        mutate(&mut next)?;
        schemas.push(next.clone());
        drop(schemas);
        self.persist_meta()?;

        let image = bincode::serialize(&next)?;
        for eg in self.entity_groups() {
            // schema changes exclude in-flight readers and writers
            let _exclusive = eg.drop_lock().write();
            eg.wal().append(LogRecord::DdlAlter {
                table_id: self.table_id,
                schema: image.clone(),
            })?;
        }
        Ok(next)
    }

    pub fn add_column(&self, mut column: ColumnSchema) -> Result<Schema> {
        self.push_schema_version(|schema| {
            if schema.columns.iter().any(|c| c.id == column.id) {
                return Err(TesseraError::ColumnExists(column.id));
            }
            column.version = schema.version;
            schema.columns.push(column);
            Ok(())
        })
    }

    pub fn drop_column(&self, col_id: u32) -> Result<Schema> {
        self.push_schema_version(|schema| {
            if schema.columns[0].id == col_id {
                return Err(TesseraError::SchemaMismatch(
                    "the timestamp column cannot be dropped".into(),
                ));
            }
            let col = schema
                .columns
                .iter_mut()
                .find(|c| c.id == col_id && !c.dropped)
                .ok_or(TesseraError::ColumnNotFound(col_id))?;
            col.dropped = true;
            Ok(())
        })
    }

    pub fn alter_column_type(&self, col_id: u32, ty: ColumnType) -> Result<Schema> {
        self.push_schema_version(|schema| {
            let version = schema.version;
            let col = schema
                .columns
                .iter_mut()
                .find(|c| c.id == col_id && !c.dropped)
                .ok_or(TesseraError::ColumnNotFound(col_id))?;
            if col.ty == ColumnType::TimestampLsn {
                return Err(TesseraError::SchemaMismatch(
                    "the timestamp column cannot change type".into(),
                ));
            }
            col.ty = ty;
            col.version = version;
            Ok(())
        })
    }

    /// Applies to partitions created after the call; existing
    /// partition directories keep their span.
    pub fn alter_partition_interval(&self, secs: u64) -> Result<()> {
        *self.partition_interval_secs.write() = secs;
        for eg in self.entity_groups() {
            eg.subgroups().set_partition_interval(secs);
        }
        self.persist_meta()
    }

    // ========================================================================
    // Durability
    // ========================================================================

    pub fn flush(&self) -> Result<()> {
        for eg in self.entity_groups() {
            eg.flush()?;
        }
        Ok(())
    }

    pub fn checkpoint(&self) -> Result<()> {
        for eg in self.entity_groups() {
            eg.checkpoint()?;
        }
        Ok(())
    }

    pub fn recover(&self) -> Result<()> {
        let schema = self.schema_latest();
        for eg in self.entity_groups() {
            eg.recover(&schema)?;
        }
        Ok(())
    }

    pub fn remove_files(&self) -> Result<()> {
        for eg in self.entity_groups() {
            eg.remove_files()?;
        }
        std::fs::remove_dir_all(&self.dir)?;
        Ok(())
    }
}
