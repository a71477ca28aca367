//! Process-wide mmap pool
//!
//! Cache files are mapped read-only once and shared across sessions. The
//! pool is the sole long-lived owner; views hand out `Arc` clones, so a
//! release here only drops the pooled reference and outstanding views stay
//! valid until they are themselves dropped.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use parking_lot::RwLock;

use crate::error::Result;

#[derive(Default)]
pub struct MmapManager {
    maps: RwLock<HashMap<PathBuf, Arc<Mmap>>>,
}

impl MmapManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map a file read-only, reusing a live mapping for the same path.
    pub fn get_or_map(&self, path: &Path) -> Result<Arc<Mmap>> {
        if let Some(m) = self.maps.read().get(path) {
            return Ok(m.clone());
        }

        let file = std::fs::File::open(path)?;
        // Safety: mappings are read-only and cache files are only ever
        // replaced via rename, so a mapped inode never changes under us.
        let mmap = Arc::new(unsafe { Mmap::map(&file)? });

        let mut maps = self.maps.write();
        // A racing thread may have mapped it first; keep the winner.
        let entry = maps.entry(path.to_path_buf()).or_insert_with(|| mmap.clone());
        Ok(entry.clone())
    }

    /// Drop the pooled mapping for one path.
    pub fn release(&self, path: &Path) {
        self.maps.write().remove(path);
    }

    /// Drop every pooled mapping whose path sits under `dir`. Called when a
    /// volume is unmounted or swapped away.
    pub fn release_under(&self, dir: &Path) {
        self.maps.write().retain(|p, _| !p.starts_with(dir));
    }

    /// Drop all pooled mappings.
    pub fn release_all(&self) {
        self.maps.write().clear();
    }

    pub fn len(&self) -> usize {
        self.maps.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.read().is_empty()
    }
}
