//! Growable memory-mapped file.
//!
//! Remapping moves the base pointer, so every `MmapFile` is owned
//! behind a lock chosen by its user: the string heap and the tag files
//! take an RwLock (readers dereference under the shared side), column
//! files grow only under the partition's allocation mutex.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::{Result, TesseraError};

/// Reserve granularity. mmap length is always rounded up to this.
pub const PAGE_SIZE: usize = 4096;

pub fn page_round_up(n: usize) -> usize {
    (n + PAGE_SIZE - 1) / PAGE_SIZE * PAGE_SIZE
}

pub struct MmapFile {
    path: PathBuf,
    file: File,
    map: Option<MmapMut>,
    len: usize,
}

impl std::fmt::Debug for MmapFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MmapFile")
            .field("path", &self.path)
            .field("len", &self.len)
            .finish()
    }
}

impl MmapFile {
    /// Open (creating if absent) and map the whole file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len() as usize;
        let map = if len == 0 {
            None
        } else {
            // Safety: the engine holds an exclusive flock on the db
            // root, so no other process truncates the file under us.
            Some(unsafe { MmapMut::map_mut(&file)? })
        };
        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
            len,
        })
    }

    /// Open and immediately reserve at least `min_len` bytes.
    pub fn open_with_len(path: &Path, min_len: usize) -> Result<Self> {
        let mut f = Self::open(path)?;
        if f.len < min_len {
            f.reserve(min_len)?;
        }
        Ok(f)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Grow the file to hold at least `new_len` bytes (page-rounded)
    /// and remap. No-op when already large enough. The base pointer is
    /// invalid afterwards; callers must hold their exclusive lock.
    pub fn reserve(&mut self, new_len: usize) -> Result<()> {
        if new_len <= self.len {
            return Ok(());
        }
        let rounded = page_round_up(new_len);
        self.file
            .set_len(rounded as u64)
            .map_err(|_| TesseraError::NoSpace)?;
        let map = unsafe { MmapMut::map_mut(&self.file) }.map_err(|_| TesseraError::NoSpace)?;
        self.map = Some(map);
        self.len = rounded;
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.map.as_deref_mut().unwrap_or(&mut [])
    }

    pub fn read_at(&self, off: usize, len: usize) -> Result<&[u8]> {
        if off + len > self.len {
            return Err(TesseraError::Corruption(format!(
                "read past end of {} ({} + {} > {})",
                self.path.display(),
                off,
                len,
                self.len
            )));
        }
        Ok(&self.as_slice()[off..off + len])
    }

    pub fn write_at(&mut self, off: usize, data: &[u8]) -> Result<()> {
        if off + data.len() > self.len {
            return Err(TesseraError::Internal(format!(
                "write past reserved end of {}",
                self.path.display()
            )));
        }
        self.as_mut_slice()[off..off + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Flush dirty pages to disk.
    pub fn sync(&self) -> Result<()> {
        if let Some(map) = &self.map {
            map.flush()?;
        }
        Ok(())
    }

    /// Remove the backing file. The mapping dies with `self`.
    pub fn remove(self) -> Result<()> {
        let path = self.path.clone();
        drop(self);
        std::fs::remove_file(path)?;
        Ok(())
    }
}
