//! Write-ahead log, one per entity-group.
//!
//! Segmented append-only files with group commit:
//! ```text
//! +----------------+----------------+----------------+
//! | Header (32B)   | Record 1       | Record 2 ...   |
//! +----------------+----------------+----------------+
//!
//! Header:
//! - magic: 4 bytes "TSWL"
//! - version: 2 bytes
//! - segment_id: 8 bytes
//! - checksum: 4 bytes (over the first 14 bytes)
//! - reserved: 14 bytes
//!
//! Record:
//! - payload_len: 4 bytes
//! - payload: bincode LogEntry
//! - crc32: 4 bytes (over the payload)
//! ```
//!
//! Every on-disk mutation appends its record first; the returned LSN
//! is stamped into the payload's timestamp-LSN slots so recovery can
//! tell which rows a record covered. A torn tail record is skipped
//! with a warning and scanning stops there.

pub mod mtr;
pub mod recovery;

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::data::{Lsn, MtrId, RangeGroupId, SubGroupId, TableId, TsSpan, TsxId};
use crate::{Result, TesseraError};

const WAL_MAGIC: &[u8; 4] = b"TSWL";
const WAL_VERSION: u16 = 1;
const WAL_HEADER_SIZE: usize = 32;
const MAX_WAL_SEGMENT_SIZE: u64 = 16 * 1024 * 1024;
const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// One tombstoned row location, replayable on its partition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct DelRowSpan {
    pub partition_start_secs: i64,
    pub block_id: u32,
    pub row: u32,
}

/// Record kinds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LogRecord {
    MtrBegin {
        mtr_id: MtrId,
        range_id: u64,
        index: u64,
    },
    MtrCommit {
        mtr_id: MtrId,
    },
    MtrRollback {
        mtr_id: MtrId,
    },
    TsxBegin {
        tsx_id: TsxId,
        mtr_id: MtrId,
    },
    TsxCommit {
        tsx_id: TsxId,
    },
    TsxRollback {
        tsx_id: TsxId,
    },
    InsertMetrics {
        mtr_id: MtrId,
        table_id: TableId,
        range_group_id: RangeGroupId,
        payload: Vec<u8>,
    },
    InsertTags {
        mtr_id: MtrId,
        table_id: TableId,
        range_group_id: RangeGroupId,
        payload: Vec<u8>,
    },
    UpdateTags {
        mtr_id: MtrId,
        table_id: TableId,
        range_group_id: RangeGroupId,
        payload: Vec<u8>,
    },
    DeleteMetrics {
        mtr_id: MtrId,
        table_id: TableId,
        range_group_id: RangeGroupId,
        primary_tag: Vec<u8>,
        spans: Vec<TsSpan>,
        row_spans: Vec<DelRowSpan>,
    },
    DeleteTags {
        mtr_id: MtrId,
        table_id: TableId,
        range_group_id: RangeGroupId,
        primary_tag: Vec<u8>,
        sub_group_id: SubGroupId,
        entity_id: u32,
    },
    DdlCreate {
        table_id: TableId,
        schema: Vec<u8>,
    },
    DdlDrop {
        table_id: TableId,
    },
    DdlAlter {
        table_id: TableId,
        schema: Vec<u8>,
    },
    Checkpoint {
        image: Vec<u8>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub lsn: Lsn,
    pub record: LogRecord,
}

// ============================================================================
// Segment files
// ============================================================================

struct WalSegment {
    file: BufWriter<File>,
    current_size: u64,
}

impl WalSegment {
    fn create(dir: &Path, segment_id: u64) -> Result<Self> {
        let path = dir.join(format!("{segment_id:06}.wal"));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);

        let mut header = [0u8; WAL_HEADER_SIZE];
        header[0..4].copy_from_slice(WAL_MAGIC);
        header[4..6].copy_from_slice(&WAL_VERSION.to_le_bytes());
        header[6..14].copy_from_slice(&segment_id.to_le_bytes());
        let checksum = crc32fast::hash(&header[0..14]);
        header[14..18].copy_from_slice(&checksum.to_le_bytes());
        writer.write_all(&header)?;
        writer.flush()?;

        Ok(Self {
            file: writer,
            current_size: WAL_HEADER_SIZE as u64,
        })
    }

    fn open_append(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut header = [0u8; WAL_HEADER_SIZE];
        file.read_exact(&mut header)?;
        validate_header(&header, path)?;
        let current_size = file.seek(SeekFrom::End(0))?;
        Ok(Self {
            file: BufWriter::with_capacity(WRITE_BUFFER_SIZE, file),
            current_size,
        })
    }

    fn append(&mut self, entry: &LogEntry) -> Result<()> {
        let payload = bincode::serialize(entry)?;
        let crc = crc32fast::hash(&payload);
        self.file.write_all(&(payload.len() as u32).to_le_bytes())?;
        self.file.write_all(&payload)?;
        self.file.write_all(&crc.to_le_bytes())?;
        self.current_size += 4 + payload.len() as u64 + 4;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.get_mut().sync_all()?;
        Ok(())
    }

    fn is_full(&self) -> bool {
        self.current_size >= MAX_WAL_SEGMENT_SIZE
    }
}

fn validate_header(header: &[u8; WAL_HEADER_SIZE], path: &Path) -> Result<()> {
    if &header[0..4] != WAL_MAGIC {
        return Err(TesseraError::Corruption(format!(
            "bad WAL magic in {}",
            path.display()
        )));
    }
    let stored = u32::from_le_bytes(header[14..18].try_into().unwrap());
    if crc32fast::hash(&header[0..14]) != stored {
        return Err(TesseraError::Corruption(format!(
            "WAL header checksum mismatch in {}",
            path.display()
        )));
    }
    Ok(())
}

struct WalState {
    current_segment: Option<WalSegment>,
    next_segment_id: u64,
    buffer: Vec<LogEntry>,
}

/// WAL manager: LSN allocation, buffered group-commit appends, full
/// replay reads, and post-checkpoint truncation.
pub struct WalManager {
    wal_dir: PathBuf,
    state: Mutex<WalState>,
    next_lsn: AtomicU64,
    buffer_capacity: usize,
    enabled: bool,
}

impl WalManager {
    pub fn open(base_dir: &Path, buffer_capacity: usize) -> Result<Self> {
        let wal_dir = base_dir.join("wal");
        std::fs::create_dir_all(&wal_dir)?;

        let mut next_segment_id = 1u64;
        for entry in std::fs::read_dir(&wal_dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".wal") {
                if let Ok(id) = stem.parse::<u64>() {
                    next_segment_id = next_segment_id.max(id + 1);
                }
            }
        }

        let mgr = Self {
            wal_dir,
            state: Mutex::new(WalState {
                current_segment: None,
                next_segment_id,
                buffer: Vec::new(),
            }),
            next_lsn: AtomicU64::new(1),
            buffer_capacity: buffer_capacity.max(1),
            enabled: true,
        };
        // resume the LSN sequence past everything on disk
        let max_lsn = mgr.read_all()?.iter().map(|e| e.lsn).max().unwrap_or(0);
        mgr.next_lsn.store(max_lsn + 1, Ordering::Relaxed);
        Ok(mgr)
    }

    /// A manager that accepts appends and drops them (wal_level = off).
    pub fn disabled() -> Self {
        Self {
            wal_dir: PathBuf::new(),
            state: Mutex::new(WalState {
                current_segment: None,
                next_segment_id: 1,
                buffer: Vec::new(),
            }),
            next_lsn: AtomicU64::new(1),
            buffer_capacity: 1,
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn current_lsn(&self) -> Lsn {
        self.next_lsn.load(Ordering::Relaxed).saturating_sub(1)
    }

    /// Append one record, returning its LSN. Buffered; the buffer
    /// drains on `flush` or when it reaches capacity.
    pub fn append(&self, record: LogRecord) -> Result<Lsn> {
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        if !self.enabled {
            return Ok(lsn);
        }
        let mut state = self.state.lock();
        state.buffer.push(LogEntry { lsn, record });
        if state.buffer.len() >= self.buffer_capacity {
            self.flush_locked(&mut state, false)?;
        }
        Ok(lsn)
    }

    /// Append and make durable in one step (commit records).
    pub fn append_sync(&self, record: LogRecord) -> Result<Lsn> {
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        if !self.enabled {
            return Ok(lsn);
        }
        let mut state = self.state.lock();
        state.buffer.push(LogEntry { lsn, record });
        self.flush_locked(&mut state, true)?;
        Ok(lsn)
    }

    /// Drain the buffer to the current segment; fsync when asked.
    pub fn flush(&self, sync: bool) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut state = self.state.lock();
        self.flush_locked(&mut state, sync)
    }

    fn flush_locked(&self, state: &mut WalState, sync: bool) -> Result<()> {
        if state.buffer.is_empty() {
            if sync {
                if let Some(seg) = &mut state.current_segment {
                    seg.sync()?;
                }
            }
            return Ok(());
        }
        self.ensure_segment(state)?;
        let entries = std::mem::take(&mut state.buffer);
        for entry in &entries {
            let rotate = {
                let seg = state.current_segment.as_mut().unwrap();
                seg.append(entry)?;
                seg.is_full()
            };
            if rotate {
                state.current_segment.as_mut().unwrap().sync()?;
                let next = WalSegment::create(&self.wal_dir, state.next_segment_id)?;
                state.next_segment_id += 1;
                state.current_segment = Some(next);
            }
        }
        if sync {
            state.current_segment.as_mut().unwrap().sync()?;
        }
        Ok(())
    }

    fn ensure_segment(&self, state: &mut WalState) -> Result<()> {
        let need_new = match &state.current_segment {
            None => {
                // reuse the newest segment on disk if it exists
                let tail = self.wal_dir.join(format!("{:06}.wal", state.next_segment_id - 1));
                if tail.exists() {
                    state.current_segment = Some(WalSegment::open_append(&tail)?);
                    false
                } else {
                    true
                }
            }
            Some(seg) => seg.is_full(),
        };
        if need_new {
            let seg = WalSegment::create(&self.wal_dir, state.next_segment_id)?;
            state.next_segment_id += 1;
            state.current_segment = Some(seg);
        }
        Ok(())
    }

    /// Read every record across all segments in order. A corrupt frame
    /// ends the scan of its segment.
    pub fn read_all(&self) -> Result<Vec<LogEntry>> {
        if !self.enabled {
            return Ok(Vec::new());
        }
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.wal_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map(|x| x == "wal").unwrap_or(false))
            .collect();
        paths.sort();

        let mut out = Vec::new();
        for path in paths {
            self.read_segment(&path, &mut out)?;
        }
        Ok(out)
    }

    fn read_segment(&self, path: &Path, out: &mut Vec<LogEntry>) -> Result<()> {
        let mut file = File::open(path)?;
        let mut header = [0u8; WAL_HEADER_SIZE];
        if file.read_exact(&mut header).is_err() {
            return Ok(()); // empty segment
        }
        validate_header(&header, path)?;

        loop {
            let mut len_buf = [0u8; 4];
            if file.read_exact(&mut len_buf).is_err() {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            if file.read_exact(&mut payload).is_err() {
                warn!(path = %path.display(), "torn WAL record at tail, stopping scan");
                break;
            }
            let mut crc_buf = [0u8; 4];
            if file.read_exact(&mut crc_buf).is_err() {
                warn!(path = %path.display(), "torn WAL crc at tail, stopping scan");
                break;
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                warn!(path = %path.display(), "WAL record checksum mismatch, stopping scan");
                break;
            }
            match bincode::deserialize::<LogEntry>(&payload) {
                Ok(entry) => out.push(entry),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "undecodable WAL record, stopping scan");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Drop all segments (after a durable checkpoint).
    pub fn truncate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let mut state = self.state.lock();
        state.buffer.clear();
        state.current_segment = None;
        for entry in std::fs::read_dir(&self.wal_dir)? {
            let path = entry?.path();
            if path.extension().map(|x| x == "wal").unwrap_or(false) {
                let _ = std::fs::remove_file(path);
            }
        }
        state.next_segment_id = 1;
        Ok(())
    }
}
