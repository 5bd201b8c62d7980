//! WAL replay: redo committed mini-transactions, undo uncommitted
//! ones.
//!
//! Replay starts after the last Checkpoint record (normally the WAL is
//! truncated right after a checkpoint, so a surviving record means the
//! process died inside the checkpoint itself). Redo is idempotent:
//! per-partition max-LSN watermarks skip already-applied inserts, and
//! OVERRIDE dedup absorbs partial applications. Undo never shrinks a
//! block; it tombstones rows whose LSN slots name the rolled-back
//! record.

use std::collections::{HashMap, HashSet};

use tracing::{info, warn};

use crate::data::{MtrId, Schema};
use crate::storage::entity_group::EntityGroup;
use crate::wal::{LogEntry, LogRecord};
use crate::Result;

#[derive(Debug, Default)]
pub struct ReplayStats {
    pub redone: u64,
    pub undone: u64,
    pub skipped: u64,
}

/// Status of each mini-transaction found in the log tail.
struct MtrOutcomes {
    committed: HashSet<MtrId>,
    begins: HashMap<MtrId, (u64, u64)>,
    max_mtr_id: MtrId,
}

fn classify(entries: &[LogEntry]) -> MtrOutcomes {
    let mut committed = HashSet::new();
    let mut rolled_back = HashSet::new();
    let mut begins = HashMap::new();
    let mut max_mtr_id = 0;
    for entry in entries {
        match &entry.record {
            LogRecord::MtrBegin {
                mtr_id,
                range_id,
                index,
            } => {
                begins.insert(*mtr_id, (*range_id, *index));
                max_mtr_id = max_mtr_id.max(*mtr_id);
            }
            LogRecord::MtrCommit { mtr_id } => {
                committed.insert(*mtr_id);
            }
            LogRecord::MtrRollback { mtr_id } => {
                rolled_back.insert(*mtr_id);
            }
            LogRecord::TsxCommit { .. } | LogRecord::TsxRollback { .. } => {}
            _ => {}
        }
    }
    // explicit rollback and missing commit land in the same bucket
    committed.retain(|id| !rolled_back.contains(id));
    MtrOutcomes {
        committed,
        begins,
        max_mtr_id,
    }
}

/// Replay the entity-group's WAL tail against its storage.
pub fn replay(eg: &EntityGroup, schema: &Schema) -> Result<ReplayStats> {
    let all = eg.wal().read_all()?;
    let cut = all
        .iter()
        .rposition(|e| matches!(e.record, LogRecord::Checkpoint { .. }));
    let entries = match cut {
        Some(i) => {
            // restore the checkpointed watermarks before replaying past it
            if let LogRecord::Checkpoint { image } = &all[i].record {
                match bincode::deserialize::<crate::storage::entity_group::GroupMeta>(image) {
                    Ok(meta) => eg.mtr_manager().restore_applied(meta.applied),
                    Err(e) => warn!(error = %e, "checkpoint image undecodable, continuing"),
                }
            }
            &all[i + 1..]
        }
        None => &all[..],
    };
    if entries.is_empty() {
        return Ok(ReplayStats::default());
    }
    info!(records = entries.len(), "replaying WAL tail");

    let outcomes = classify(entries);
    eg.mtr_manager().bump_next_id(outcomes.max_mtr_id);

    // an MTR whose Raft applied-index is at or below the checkpointed
    // watermark already reached the data files in full
    let mut stats = ReplayStats::default();
    let already_applied = |mtr_id: &MtrId| -> bool {
        outcomes
            .begins
            .get(mtr_id)
            .map(|(range_id, index)| {
                *index != 0 && *index <= eg.mtr_manager().applied_index(*range_id)
            })
            .unwrap_or(false)
    };

    // redo committed work in log order
    for entry in entries {
        let (mtr_id, redo): (MtrId, bool) = match &entry.record {
            LogRecord::InsertMetrics { mtr_id, .. }
            | LogRecord::InsertTags { mtr_id, .. }
            | LogRecord::UpdateTags { mtr_id, .. }
            | LogRecord::DeleteMetrics { mtr_id, .. }
            | LogRecord::DeleteTags { mtr_id, .. } => (*mtr_id, true),
            _ => continue,
        };
        if !redo || !outcomes.committed.contains(&mtr_id) {
            continue;
        }
        if already_applied(&mtr_id) {
            stats.skipped += 1;
            continue;
        }
        match &entry.record {
            LogRecord::InsertMetrics { payload, .. } => {
                stats.redone += eg.redo_insert_metrics(payload, entry.lsn, schema)?;
            }
            LogRecord::InsertTags { payload, .. } => {
                eg.redo_insert_tags(payload, schema)?;
                stats.redone += 1;
            }
            LogRecord::UpdateTags { payload, .. } => {
                let p = crate::payload::Payload::parse(payload.clone(), schema)?;
                if eg.tag_table().get_entity_id_group_id(p.primary_tag()).is_some() {
                    eg.tag_table().update_tag_record(p.primary_tag(), p.tag_row())?;
                }
                stats.redone += 1;
            }
            LogRecord::DeleteMetrics {
                primary_tag, spans, ..
            } => {
                stats.redone += eg.redo_delete_metrics(primary_tag, spans)?;
            }
            LogRecord::DeleteTags { primary_tag, .. } => {
                eg.tag_table().delete_tag_record(primary_tag)?;
                stats.redone += 1;
            }
            _ => {}
        }
    }

    // undo uncommitted work in reverse log order
    for entry in entries.iter().rev() {
        let mtr_id = match &entry.record {
            LogRecord::InsertMetrics { mtr_id, .. }
            | LogRecord::InsertTags { mtr_id, .. }
            | LogRecord::DeleteMetrics { mtr_id, .. }
            | LogRecord::DeleteTags { mtr_id, .. } => *mtr_id,
            _ => continue,
        };
        if outcomes.committed.contains(&mtr_id) || already_applied(&mtr_id) {
            continue;
        }
        match &entry.record {
            LogRecord::InsertMetrics { payload, .. } => {
                stats.undone += eg.undo_insert_metrics(payload, entry.lsn, schema)?;
            }
            LogRecord::InsertTags { payload, .. } => {
                let p = crate::payload::Payload::parse(payload.clone(), schema)?;
                eg.tag_table().delete_tag_record(p.primary_tag())?;
                stats.undone += 1;
            }
            LogRecord::DeleteMetrics {
                primary_tag,
                row_spans,
                ..
            } => {
                eg.undo_delete_metrics(primary_tag, row_spans)?;
                stats.undone += row_spans.len() as u64;
            }
            LogRecord::DeleteTags { primary_tag, .. } => {
                if !eg.tag_table().restore_tag_record(primary_tag)? {
                    warn!("rolled-back tag delete had no slot to restore");
                }
                stats.undone += 1;
            }
            _ => {}
        }
    }

    // fold the committed Raft indexes into the live watermark map
    let mut applied: HashMap<u64, u64> = HashMap::new();
    for mtr_id in &outcomes.committed {
        if let Some((range_id, index)) = outcomes.begins.get(mtr_id) {
            let entry = applied.entry(*range_id).or_insert(0);
            *entry = (*entry).max(*index);
        }
    }
    eg.mtr_manager().restore_applied(applied);
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::OpContext;
    use crate::data::{DedupRule, TsSpan};
    use crate::payload::test_support::{simple_payload, simple_schema};
    use crate::storage::EngineOptions;
    use crate::tag::TagSchema;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn open_group(dir: &std::path::Path) -> Arc<EntityGroup> {
        let opts = EngineOptions {
            block_rows: 4,
            blocks_per_segment: 8,
            ..Default::default()
        };
        EntityGroup::open(dir, 1, 100, &TagSchema::primary_only(32), &opts).unwrap()
    }

    fn visible_rows(eg: &EntityGroup, tag: &[u8]) -> Vec<i64> {
        let (sub, entity) = match eg.tag_table().get_entity_id_group_id(tag) {
            Some(x) => x,
            None => return Vec::new(),
        };
        let sg = eg.subgroups().subgroup(sub).unwrap();
        let mut out = Vec::new();
        for p in sg.all_partitions().unwrap() {
            for item in p.get_all_block_items(entity, false) {
                let n = item.publish_count() as usize;
                if n == 0 {
                    continue;
                }
                let seg = p.segment_for_block(item.block_id).unwrap();
                let ts = seg.read_timestamps(item.block_id, 0, n).unwrap();
                for (row, t) in ts.into_iter().enumerate() {
                    if !item.is_deleted(row as u32) {
                        out.push(t);
                    }
                }
            }
        }
        out.sort_unstable();
        out
    }

    #[test]
    fn test_committed_insert_redone_after_data_loss() {
        let dir = tempdir().unwrap();
        let schema = simple_schema();
        {
            let eg = open_group(dir.path());
            let mtr = eg.mtr_begin(1, 7).unwrap();
            let mut payload = simple_payload(&schema, b"e1", &[(1000, Some(1)), (2000, Some(2))]);
            eg.put_data(&OpContext::new(), &mut payload, mtr, DedupRule::Override, &schema)
                .unwrap();
            eg.mtr_commit(mtr).unwrap();
            // no flush: partition manifests never hit disk
        }
        let eg = open_group(dir.path());
        // before replay the rows are gone (manifest lost)
        eg.recover(&schema).unwrap();
        assert_eq!(visible_rows(&eg, b"e1"), vec![1000, 2000]);
    }

    #[test]
    fn test_uncommitted_insert_is_invisible_after_recovery() {
        let dir = tempdir().unwrap();
        let schema = simple_schema();
        {
            let eg = open_group(dir.path());
            let mtr = eg.mtr_begin(1, 7).unwrap();
            let mut payload = simple_payload(&schema, b"e1", &[(1000, Some(1))]);
            eg.put_data(&OpContext::new(), &mut payload, mtr, DedupRule::Override, &schema)
                .unwrap();
            eg.mtr_commit(mtr).unwrap();

            let mtr2 = eg.mtr_begin(1, 8).unwrap();
            let mut payload2 = simple_payload(&schema, b"e1", &[(5000, Some(9))]);
            eg.put_data(&OpContext::new(), &mut payload2, mtr2, DedupRule::Override, &schema)
                .unwrap();
            // crash before commit: flush data so the rows ARE in the
            // files, recovery must tombstone them
            eg.flush().unwrap();
        }
        let eg = open_group(dir.path());
        eg.recover(&schema).unwrap();
        assert_eq!(visible_rows(&eg, b"e1"), vec![1000]);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let dir = tempdir().unwrap();
        let schema = simple_schema();
        {
            let eg = open_group(dir.path());
            let mtr = eg.mtr_begin(1, 7).unwrap();
            let mut payload = simple_payload(&schema, b"e1", &[(1000, Some(1))]);
            eg.put_data(&OpContext::new(), &mut payload, mtr, DedupRule::Override, &schema)
                .unwrap();
            eg.mtr_commit(mtr).unwrap();
            eg.flush().unwrap();
        }
        let eg = open_group(dir.path());
        eg.recover(&schema).unwrap();
        eg.recover(&schema).unwrap();
        assert_eq!(visible_rows(&eg, b"e1"), vec![1000]);
    }

    #[test]
    fn test_uncommitted_delete_is_undone() {
        let dir = tempdir().unwrap();
        let schema = simple_schema();
        {
            let eg = open_group(dir.path());
            let mtr = eg.mtr_begin(1, 7).unwrap();
            let mut payload =
                simple_payload(&schema, b"e1", &[(1000, Some(1)), (2000, Some(2))]);
            eg.put_data(&OpContext::new(), &mut payload, mtr, DedupRule::Override, &schema)
                .unwrap();
            eg.mtr_commit(mtr).unwrap();

            let mtr2 = eg.mtr_begin(1, 8).unwrap();
            eg.delete_data(&OpContext::new(), b"e1", &[TsSpan::new(1500, 2500)], mtr2)
                .unwrap();
            // crash before commit, tombstones flushed
            eg.flush().unwrap();
        }
        let eg = open_group(dir.path());
        eg.recover(&schema).unwrap();
        assert_eq!(visible_rows(&eg, b"e1"), vec![1000, 2000]);
    }

    #[test]
    fn test_checkpoint_truncates_and_replay_skips() {
        let dir = tempdir().unwrap();
        let schema = simple_schema();
        {
            let eg = open_group(dir.path());
            let mtr = eg.mtr_begin(1, 7).unwrap();
            let mut payload = simple_payload(&schema, b"e1", &[(1000, Some(1))]);
            eg.put_data(&OpContext::new(), &mut payload, mtr, DedupRule::Override, &schema)
                .unwrap();
            eg.mtr_commit(mtr).unwrap();
            eg.checkpoint().unwrap();
        }
        let eg = open_group(dir.path());
        let stats = replay(&eg, &schema).unwrap();
        assert_eq!(stats.redone, 0);
        assert_eq!(visible_rows(&eg, b"e1"), vec![1000]);
        // the checkpointed applied-index refuses stale begins
        assert!(eg.mtr_begin(1, 7).is_err());
        assert!(eg.mtr_begin(1, 8).is_ok());
    }
}
