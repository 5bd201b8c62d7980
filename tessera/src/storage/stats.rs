//! Engine operation statistics.
//!
//! Lock-free atomic counters on the hot paths; a snapshot call for
//! operators. Counters are cache-line aligned to avoid false sharing
//! between writer threads.

use std::sync::atomic::{AtomicU64, Ordering};

#[repr(align(64))]
struct AlignedCounter(AtomicU64);

impl AlignedCounter {
    const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    fn add(&self, val: u64) {
        self.0.fetch_add(val, Ordering::Relaxed);
    }

    #[inline]
    fn load(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Point-in-time image of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub rows_written: u64,
    pub rows_deleted: u64,
    pub rows_dedup_dropped: u64,
    pub batches_read: u64,
    pub wal_records: u64,
    pub checkpoints: u64,
    pub recoveries: u64,
}

#[derive(Default)]
pub struct EngineStats {
    rows_written: AlignedCounter,
    rows_deleted: AlignedCounter,
    rows_dedup_dropped: AlignedCounter,
    batches_read: AlignedCounter,
    wal_records: AlignedCounter,
    checkpoints: AlignedCounter,
    recoveries: AlignedCounter,
}

impl Default for AlignedCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_write(&self, rows: u64, dedup_dropped: u64) {
        self.rows_written.add(rows);
        if dedup_dropped > 0 {
            self.rows_dedup_dropped.add(dedup_dropped);
        }
    }

    pub fn record_delete(&self, rows: u64) {
        self.rows_deleted.add(rows);
    }

    pub fn record_batch_read(&self) {
        self.batches_read.add(1);
    }

    pub fn record_wal_records(&self, n: u64) {
        self.wal_records.add(n);
    }

    pub fn record_checkpoint(&self) {
        self.checkpoints.add(1);
    }

    pub fn record_recovery(&self) {
        self.recoveries.add(1);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            rows_written: self.rows_written.load(),
            rows_deleted: self.rows_deleted.load(),
            rows_dedup_dropped: self.rows_dedup_dropped.load(),
            batches_read: self.batches_read.load(),
            wal_records: self.wal_records.load(),
            checkpoints: self.checkpoints.load(),
            recoveries: self.recoveries.load(),
        }
    }
}
