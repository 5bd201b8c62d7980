//! In-memory hash index from primary-tag bytes to tag row number.
//!
//! Memory-resident with optional persistence; on open the tag table
//! rebuilds it from `tag.pri`, so the saved image is just a warm-start
//! shortcut. Uses AHash for fast non-cryptographic hashing.

use std::io;
use std::path::{Path, PathBuf};

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::data::TagTableRowId;

#[derive(Debug, Default)]
pub struct TagHashIndex {
    map: AHashMap<Vec<u8>, TagTableRowId>,
    path: Option<PathBuf>,
    dirty: bool,
}

#[derive(Serialize, Deserialize)]
struct IndexImage {
    entries: Vec<(Vec<u8>, TagTableRowId)>,
}

impl TagHashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self {
            map: AHashMap::new(),
            path: Some(path),
            dirty: false,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Insert a key → row mapping. Primary tags are unique; an existing
    /// live mapping is an error the caller turns into AlreadyExists.
    pub fn put(&mut self, key: &[u8], row: TagTableRowId) -> io::Result<()> {
        if self.map.contains_key(key) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "duplicate primary tag in hash index",
            ));
        }
        self.map.insert(key.to_vec(), row);
        self.dirty = true;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Option<TagTableRowId> {
        self.map.get(key).copied()
    }

    /// Remove a key. The tag row slot itself stays allocated.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        let removed = self.map.remove(key).is_some();
        if removed {
            self.dirty = true;
        }
        removed
    }

    /// Rebuild the table, dropping tombstoned buckets and shrinking to
    /// the live population.
    pub fn rehash(&mut self) {
        let entries: Vec<_> = self.map.drain().collect();
        let mut fresh = AHashMap::with_capacity(entries.len());
        fresh.extend(entries);
        self.map = fresh;
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    pub fn save(&mut self) -> io::Result<()> {
        let path = match &self.path {
            Some(p) if self.dirty => p.clone(),
            _ => return Ok(()),
        };
        let image = IndexImage {
            entries: self.map.iter().map(|(k, v)| (k.clone(), *v)).collect(),
        };
        let bytes = bincode::serialize(&image)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, bytes)?;
        self.dirty = false;
        Ok(())
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let image: IndexImage = bincode::deserialize(&bytes)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut map = AHashMap::with_capacity(image.entries.len());
        map.extend(image.entries);
        Ok(Self {
            map,
            path: Some(path.to_path_buf()),
            dirty: false,
        })
    }
}
