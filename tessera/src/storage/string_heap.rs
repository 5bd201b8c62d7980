//! Append-only variable-length value store, one per segment.
//!
//! File format:
//! ```text
//! +----------------+----------------------+
//! | header (32 B)  | entries...           |
//! +----------------+----------------------+
//!
//! Header:
//! - magic: 4 bytes "TSSH"
//! - version: 2 bytes
//! - reserved: 2 bytes
//! - used: 8 bytes (next append offset)
//! - reserved: 16 bytes
//!
//! Entry:
//! - len: 2 bytes
//! - bytes: len
//! ```
//!
//! Offsets handed out by `append` are absolute file offsets and remain
//! stable for the life of the segment; offset 0 is the "no value"
//! sentinel (the header occupies it). Appends may remap the file, so
//! all dereferences take the shared side of the lock.

use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::RwLock;

use crate::storage::mmap_file::MmapFile;
use crate::{Result, TesseraError};

const HEAP_MAGIC: &[u8; 4] = b"TSSH";
const HEAP_VERSION: u16 = 1;
const HEAP_HEADER_SIZE: usize = 32;
const USED_OFF: usize = 8;

#[derive(Debug)]
pub struct StringHeap {
    inner: RwLock<MmapFile>,
}

impl StringHeap {
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = MmapFile::open(path)?;
        if file.is_empty() {
            file.reserve(HEAP_HEADER_SIZE)?;
            file.write_at(0, HEAP_MAGIC)?;
            let mut v = [0u8; 2];
            LittleEndian::write_u16(&mut v, HEAP_VERSION);
            file.write_at(4, &v)?;
            let mut used = [0u8; 8];
            LittleEndian::write_u64(&mut used, HEAP_HEADER_SIZE as u64);
            file.write_at(USED_OFF, &used)?;
        } else {
            if file.read_at(0, 4)? != HEAP_MAGIC {
                return Err(TesseraError::Corruption(format!(
                    "bad string heap magic in {}",
                    path.display()
                )));
            }
            let used = LittleEndian::read_u64(file.read_at(USED_OFF, 8)?);
            if (used as usize) < HEAP_HEADER_SIZE || used as usize > file.len() {
                return Err(TesseraError::Corruption(format!(
                    "string heap used pointer {} out of range in {}",
                    used,
                    path.display()
                )));
            }
        }
        Ok(Self {
            inner: RwLock::new(file),
        })
    }

    /// Append one value, returning its stable offset.
    pub fn append(&self, bytes: &[u8]) -> Result<u64> {
        debug_assert!(bytes.len() <= u16::MAX as usize);
        let mut file = self.inner.write();
        let used = LittleEndian::read_u64(file.read_at(USED_OFF, 8)?) as usize;
        let need = used + 2 + bytes.len();
        file.reserve(need)?;

        let mut len = [0u8; 2];
        LittleEndian::write_u16(&mut len, bytes.len() as u16);
        file.write_at(used, &len)?;
        file.write_at(used + 2, bytes)?;

        let mut new_used = [0u8; 8];
        LittleEndian::write_u64(&mut new_used, need as u64);
        file.write_at(USED_OFF, &new_used)?;
        Ok(used as u64)
    }

    /// Read the value at `offset`. The bytes are copied out because the
    /// base pointer may move on the next append.
    pub fn get(&self, offset: u64) -> Result<Vec<u8>> {
        let file = self.inner.read();
        let off = offset as usize;
        if off < HEAP_HEADER_SIZE {
            return Err(TesseraError::Corruption(format!(
                "string heap offset {offset} inside header"
            )));
        }
        let len = LittleEndian::read_u16(file.read_at(off, 2)?) as usize;
        Ok(file.read_at(off + 2, len)?.to_vec())
    }

    /// Apply `f` to the value without copying. Used on hot compare
    /// paths; `f` must not re-enter the heap.
    pub fn with_value<T>(&self, offset: u64, f: impl FnOnce(&[u8]) -> T) -> Result<T> {
        let file = self.inner.read();
        let off = offset as usize;
        let len = LittleEndian::read_u16(file.read_at(off, 2)?) as usize;
        Ok(f(file.read_at(off + 2, len)?))
    }

    pub fn used(&self) -> u64 {
        let file = self.inner.read();
        file.read_at(USED_OFF, 8)
            .map(LittleEndian::read_u64)
            .unwrap_or(HEAP_HEADER_SIZE as u64)
    }

    pub fn sync(&self) -> Result<()> {
        self.inner.read().sync()
    }

    /// Raw image of the used part of the heap, for sealing.
    pub fn image(&self) -> Result<Vec<u8>> {
        let file = self.inner.read();
        let used = LittleEndian::read_u64(file.read_at(USED_OFF, 8)?) as usize;
        Ok(file.read_at(0, used)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_get() {
        let dir = tempdir().unwrap();
        let heap = StringHeap::open(&dir.path().join("0001.s")).unwrap();
        let a = heap.append(b"alpha").unwrap();
        let b = heap.append(b"").unwrap();
        let c = heap.append(b"gamma").unwrap();
        assert_eq!(a, 32);
        assert!(b > a && c > b);
        assert_eq!(heap.get(a).unwrap(), b"alpha");
        assert_eq!(heap.get(b).unwrap(), b"");
        assert_eq!(heap.get(c).unwrap(), b"gamma");
    }

    #[test]
    fn test_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0001.s");
        let off = {
            let heap = StringHeap::open(&path).unwrap();
            let off = heap.append(b"persist").unwrap();
            heap.sync().unwrap();
            off
        };
        let heap = StringHeap::open(&path).unwrap();
        assert_eq!(heap.get(off).unwrap(), b"persist");
        // appends continue after the recovered used pointer
        let next = heap.append(b"more").unwrap();
        assert!(next > off);
    }

    #[test]
    fn test_growth_across_pages() {
        let dir = tempdir().unwrap();
        let heap = StringHeap::open(&dir.path().join("big.s")).unwrap();
        let v = vec![7u8; 1000];
        let mut offs = Vec::new();
        for _ in 0..50 {
            offs.push(heap.append(&v).unwrap());
        }
        for off in offs {
            assert_eq!(heap.get(off).unwrap(), v);
        }
    }

    #[test]
    fn test_header_offset_rejected() {
        let dir = tempdir().unwrap();
        let heap = StringHeap::open(&dir.path().join("h.s")).unwrap();
        assert!(heap.get(0).is_err());
    }
}
