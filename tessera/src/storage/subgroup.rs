//! Sub-group: a band of entities sharing a schema instance, owning
//! partitions keyed by partition-start time.
//!
//! Open partitions are reference-counted through an LRU cache; a
//! partition with no outside references is eligible for eviction. The
//! partition interval is read at partition-creation time, so altering
//! it affects only partitions created afterwards.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;

use crate::cache::PartitionCache;
use crate::data::{partition_start_time, EntityId, Schema, SubGroupId, Timestamp, TsSpan};
use crate::storage::partition::{Partition, PartitionOptions};
use crate::Result;

pub struct SubGroup {
    id: SubGroupId,
    dir: PathBuf,
    interval_secs: Arc<AtomicU64>,
    opts: PartitionOptions,
    cache: Mutex<PartitionCache>,
}

impl std::fmt::Debug for SubGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubGroup").field("id", &self.id).finish()
    }
}

impl SubGroup {
    fn open(
        dir: PathBuf,
        id: SubGroupId,
        interval_secs: Arc<AtomicU64>,
        opts: PartitionOptions,
        cache_capacity: usize,
    ) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            id,
            dir,
            interval_secs,
            opts,
            cache: Mutex::new(PartitionCache::new(cache_capacity)),
        })
    }

    pub fn id(&self) -> SubGroupId {
        self.id
    }

    fn interval(&self) -> u64 {
        self.interval_secs.load(Ordering::Relaxed)
    }

    /// Partition start time for a row timestamp.
    pub fn partition_time(&self, ts: Timestamp) -> i64 {
        partition_start_time(ts, self.interval())
    }

    /// Open (or create) the partition containing `ts`, pinning it in
    /// the cache. Dropping the returned handle releases it.
    pub fn get_partition_table(&self, ts: Timestamp, create: bool) -> Result<Option<Arc<Partition>>> {
        let start = self.partition_time(ts);
        let mut cache = self.cache.lock();
        if let Some(p) = cache.get(start) {
            return Ok(Some(p));
        }
        let pdir = self.dir.join(start.to_string());
        if !pdir.exists() && !create {
            return Ok(None);
        }
        let p = Arc::new(Partition::open(&pdir, start, self.interval(), self.opts)?);
        cache.put(start, p.clone());
        Ok(Some(p))
    }

    /// Release interest in a partition; idle entries past the cache
    /// capacity are then reclaimed.
    pub fn release_partition_table(&self, partition: Arc<Partition>) {
        drop(partition);
        self.cache.lock().evict_idle();
    }

    /// Start times of every partition on disk, ascending.
    pub fn partition_times(&self) -> Result<Vec<i64>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Ok(start) = entry.file_name().to_string_lossy().parse::<i64>() {
                out.push(start);
            }
        }
        out.sort_unstable();
        Ok(out)
    }

    /// Partitions overlapping the spans, in time order (or reversed).
    pub fn partitions_in_spans(&self, spans: &[TsSpan], reverse: bool) -> Result<Vec<Arc<Partition>>> {
        let interval_us = self.interval() as i64 * 1_000_000;
        let mut out = Vec::new();
        for start in self.partition_times()? {
            let begin = start * 1_000_000;
            let end = begin + interval_us - 1;
            if spans.iter().any(|s| s.overlaps(begin, end)) {
                if let Some(p) = self.get_partition_table(begin, false)? {
                    out.push(p);
                }
            }
        }
        if reverse {
            out.reverse();
        }
        Ok(out)
    }

    pub fn all_partitions(&self) -> Result<Vec<Arc<Partition>>> {
        self.partitions_in_spans(&[TsSpan::all()], false)
    }

    /// Flush every partition currently on disk.
    pub fn flush(&self) -> Result<()> {
        for p in self.all_partitions()? {
            p.flush()?;
        }
        self.cache.lock().evict_idle();
        Ok(())
    }

    /// Compact partitions overlapping the spans into single sealed
    /// segments.
    pub fn compact(&self, schema: &Schema, spans: &[TsSpan]) -> Result<()> {
        for p in self.partitions_in_spans(spans, false)? {
            p.compact(schema)?;
        }
        Ok(())
    }

    /// Drop every partition file of this sub-group.
    pub fn remove_files(&self) -> Result<()> {
        std::fs::remove_dir_all(&self.dir)?;
        Ok(())
    }
}

/// Assigns entities to sub-groups and owns the open sub-group map.
pub struct SubGroupManager {
    dir: PathBuf,
    interval_secs: Arc<AtomicU64>,
    opts: PartitionOptions,
    entity_capacity: u32,
    cache_capacity: usize,
    subgroups: RwLock<HashMap<SubGroupId, Arc<SubGroup>>>,
    alloc: Mutex<(SubGroupId, u32)>,
}

impl SubGroupManager {
    pub fn open(
        dir: &Path,
        interval_secs: u64,
        opts: PartitionOptions,
        entity_capacity: u32,
        cache_capacity: usize,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mgr = Self {
            dir: dir.to_path_buf(),
            interval_secs: Arc::new(AtomicU64::new(interval_secs)),
            opts,
            entity_capacity: entity_capacity.max(1),
            cache_capacity,
            subgroups: RwLock::new(HashMap::new()),
            alloc: Mutex::new((1, 1)),
        };
        // open sub-groups already on disk
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Ok(id) = entry.file_name().to_string_lossy().parse::<SubGroupId>() {
                mgr.subgroup(id)?;
            }
        }
        Ok(mgr)
    }

    pub fn subgroup(&self, id: SubGroupId) -> Result<Arc<SubGroup>> {
        if let Some(sg) = self.subgroups.read().get(&id) {
            return Ok(sg.clone());
        }
        let mut map = self.subgroups.write();
        if let Some(sg) = map.get(&id) {
            return Ok(sg.clone());
        }
        let sg = Arc::new(SubGroup::open(
            self.dir.join(id.to_string()),
            id,
            self.interval_secs.clone(),
            self.opts,
            self.cache_capacity,
        )?);
        map.insert(id, sg.clone());
        Ok(sg)
    }

    pub fn subgroups(&self) -> Vec<Arc<SubGroup>> {
        self.subgroups.read().values().cloned().collect()
    }

    /// Assign the next free (sub-group, entity) slot.
    pub fn allocate_entity(&self) -> Result<(SubGroupId, EntityId)> {
        let mut alloc = self.alloc.lock();
        if alloc.1 > self.entity_capacity {
            alloc.0 += 1;
            alloc.1 = 1;
        }
        let out = (alloc.0, alloc.1);
        alloc.1 += 1;
        self.subgroup(out.0)?;
        Ok(out)
    }

    /// Restore the allocation cursor from recovered state (the highest
    /// slot the tag table has handed out).
    pub fn restore_alloc(&self, subgroup: SubGroupId, last_entity: EntityId) {
        let mut alloc = self.alloc.lock();
        if (subgroup, last_entity + 1) > (alloc.0, alloc.1) {
            *alloc = (subgroup.max(1), last_entity + 1);
        }
    }

    pub fn set_partition_interval(&self, secs: u64) {
        self.interval_secs.store(secs, Ordering::Relaxed);
    }

    pub fn partition_interval(&self) -> u64 {
        self.interval_secs.load(Ordering::Relaxed)
    }

    pub fn flush(&self) -> Result<()> {
        for sg in self.subgroups() {
            sg.flush()?;
        }
        Ok(())
    }

    pub fn remove_files(&self) -> Result<()> {
        std::fs::remove_dir_all(&self.dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_opts() -> PartitionOptions {
        PartitionOptions {
            block_rows: 4,
            blocks_per_segment: 8,
        }
    }

    #[test]
    fn test_partition_pick_and_reuse() {
        let dir = tempdir().unwrap();
        let mgr = SubGroupManager::open(dir.path(), 86400, small_opts(), 500, 8).unwrap();
        let sg = mgr.subgroup(1).unwrap();

        assert_eq!(sg.partition_time(0), 0);
        assert_eq!(sg.partition_time(86_400_000_000), 86400);

        let p1 = sg.get_partition_table(1_000_000, true).unwrap().unwrap();
        let p2 = sg.get_partition_table(2_000_000, true).unwrap().unwrap();
        assert!(Arc::ptr_eq(&p1, &p2));

        // absent partition without create
        assert!(sg
            .get_partition_table(90 * 86_400_000_000, false)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_partitions_in_spans_order() {
        let dir = tempdir().unwrap();
        let mgr = SubGroupManager::open(dir.path(), 1, small_opts(), 500, 8).unwrap();
        let sg = mgr.subgroup(1).unwrap();
        for secs in [3i64, 1, 2] {
            sg.get_partition_table(secs * 1_000_000, true).unwrap();
        }
        let spans = [TsSpan::new(1_000_000, 3_999_999)];
        let fwd: Vec<i64> = sg
            .partitions_in_spans(&spans, false)
            .unwrap()
            .iter()
            .map(|p| p.start_ts_secs())
            .collect();
        assert_eq!(fwd, vec![1, 2, 3]);
        let rev: Vec<i64> = sg
            .partitions_in_spans(&spans, true)
            .unwrap()
            .iter()
            .map(|p| p.start_ts_secs())
            .collect();
        assert_eq!(rev, vec![3, 2, 1]);

        let narrow = [TsSpan::new(2_000_000, 2_500_000)];
        assert_eq!(sg.partitions_in_spans(&narrow, false).unwrap().len(), 1);
    }

    #[test]
    fn test_entity_allocation_rolls_over() {
        let dir = tempdir().unwrap();
        let mgr = SubGroupManager::open(dir.path(), 86400, small_opts(), 2, 8).unwrap();
        assert_eq!(mgr.allocate_entity().unwrap(), (1, 1));
        assert_eq!(mgr.allocate_entity().unwrap(), (1, 2));
        assert_eq!(mgr.allocate_entity().unwrap(), (2, 1));
    }

    #[test]
    fn test_restore_alloc() {
        let dir = tempdir().unwrap();
        let mgr = SubGroupManager::open(dir.path(), 86400, small_opts(), 10, 8).unwrap();
        mgr.restore_alloc(3, 7);
        assert_eq!(mgr.allocate_entity().unwrap(), (3, 8));
    }

    #[test]
    fn test_interval_change_applies_to_new_partitions() {
        let dir = tempdir().unwrap();
        let mgr = SubGroupManager::open(dir.path(), 86400, small_opts(), 500, 8).unwrap();
        let sg = mgr.subgroup(1).unwrap();
        assert_eq!(sg.partition_time(86_400_000_000), 86400);
        mgr.set_partition_interval(3600);
        assert_eq!(sg.partition_time(86_400_000_000), 86400 * 1); // floor at hour 24
        assert_eq!(sg.partition_time(3_600_000_000), 3600);
    }
}
