//! Mini-transaction and distributed-transaction managers.
//!
//! One instance of each lives in every entity-group (there are no
//! process singletons). A mini-transaction brackets the WAL records of
//! one storage mutation batch:
//!
//! ```text
//! Begin ──insert/update/delete*──▶ Active ──Commit──▶ Committed
//!                                        └─Rollback─▶ Aborted
//! ```
//!
//! Begin carries the Raft (range_id, applied_index) pair; the
//! per-range applied-index map lets both live begins and recovery skip
//! work that already reached the storage layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::data::{MtrId, TsxId};
use crate::{Result, TesseraError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MtrStatus {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug, Clone)]
pub struct MtrState {
    pub range_id: u64,
    pub index: u64,
    pub status: MtrStatus,
}

#[derive(Debug, Default)]
pub struct MtrManager {
    next_id: AtomicU64,
    active: RwLock<HashMap<MtrId, MtrState>>,
    applied: RwLock<HashMap<u64, u64>>,
}

impl MtrManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            active: RwLock::new(HashMap::new()),
            applied: RwLock::new(HashMap::new()),
        }
    }

    /// Begin a mini-transaction for `(range_id, applied_index)`.
    /// An index at or below the stored watermark was already applied;
    /// the caller treats that as a no-op replay.
    pub fn begin(&self, range_id: u64, index: u64) -> Result<MtrId> {
        if let Some(&watermark) = self.applied.read().get(&range_id) {
            if index != 0 && index <= watermark {
                return Err(TesseraError::MtrConflict(format!(
                    "range {range_id} index {index} already applied (watermark {watermark})"
                )));
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.active.write().insert(
            id,
            MtrState {
                range_id,
                index,
                status: MtrStatus::Active,
            },
        );
        Ok(id)
    }

    pub fn commit(&self, mtr_id: MtrId) -> Result<()> {
        let mut active = self.active.write();
        let state = active
            .get_mut(&mtr_id)
            .ok_or_else(|| TesseraError::MtrConflict(format!("unknown mtr {mtr_id}")))?;
        if state.status != MtrStatus::Active {
            return Err(TesseraError::MtrConflict(format!(
                "mtr {mtr_id} is not active"
            )));
        }
        state.status = MtrStatus::Committed;
        let (range_id, index) = (state.range_id, state.index);
        drop(active);

        let mut applied = self.applied.write();
        let entry = applied.entry(range_id).or_insert(0);
        *entry = (*entry).max(index);
        Ok(())
    }

    pub fn rollback(&self, mtr_id: MtrId) -> Result<()> {
        let mut active = self.active.write();
        let state = active
            .get_mut(&mtr_id)
            .ok_or_else(|| TesseraError::MtrConflict(format!("unknown mtr {mtr_id}")))?;
        if state.status != MtrStatus::Active {
            return Err(TesseraError::MtrConflict(format!(
                "mtr {mtr_id} is not active"
            )));
        }
        state.status = MtrStatus::Aborted;
        Ok(())
    }

    pub fn status(&self, mtr_id: MtrId) -> Option<MtrStatus> {
        self.active.read().get(&mtr_id).map(|s| s.status)
    }

    pub fn applied_index(&self, range_id: u64) -> u64 {
        self.applied.read().get(&range_id).copied().unwrap_or(0)
    }

    /// Snapshot of the watermark map, serialized into checkpoints.
    pub fn applied_map(&self) -> HashMap<u64, u64> {
        self.applied.read().clone()
    }

    /// Restore watermarks from a checkpoint image.
    pub fn restore_applied(&self, map: HashMap<u64, u64>) {
        let mut applied = self.applied.write();
        for (range, index) in map {
            let entry = applied.entry(range).or_insert(0);
            *entry = (*entry).max(index);
        }
    }

    /// Keep recovered ids out of the live sequence.
    pub fn bump_next_id(&self, floor: MtrId) {
        self.next_id.fetch_max(floor + 1, Ordering::SeqCst);
    }

    /// Drop bookkeeping for finished transactions.
    pub fn gc(&self) {
        self.active
            .write()
            .retain(|_, s| s.status == MtrStatus::Active);
    }
}

/// Distributed transactions map a 16-byte coordinator id onto one
/// local mini-transaction bracket.
#[derive(Debug, Default)]
pub struct TsxManager {
    open: RwLock<HashMap<TsxId, MtrId>>,
}

impl TsxManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, tsx_id: TsxId, mtr_id: MtrId) -> Result<()> {
        let mut open = self.open.write();
        if open.contains_key(&tsx_id) {
            return Err(TesseraError::MtrConflict(
                "distributed transaction already open".into(),
            ));
        }
        open.insert(tsx_id, mtr_id);
        Ok(())
    }

    pub fn resolve(&self, tsx_id: &TsxId) -> Option<MtrId> {
        self.open.read().get(tsx_id).copied()
    }

    pub fn finish(&self, tsx_id: &TsxId) -> Option<MtrId> {
        self.open.write().remove(tsx_id)
    }
}
