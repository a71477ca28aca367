//! Cache file format
//!
//! A cache file is a 32-byte header followed by a flat record array:
//!
//! ```text
//! magic       4 B   "SIDX" (frame index) or "VPOS" (VPS positions)
//! version     u32   record layout revision
//! count       u32   number of records
//! file_hash   16 B  identity hash of the source container
//! reserved    4 B
//! ```
//!
//! Frame-index records are `FrameRecord` written at its native layout, so
//! a read is a bytemuck cast over the mapping rather than a decode pass;
//! `SIDX_VERSION` pins that layout and readers refuse a mismatch. VPS
//! records are plain little-endian `u32` offsets.
//!
//! Readers never re-check `file_hash` against the source: the cache path
//! itself is derived from the hash, so a changed container resolves to a
//! different cache file. The header copy exists for offline inspection.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use memmap2::Mmap;

use super::ContentHash;
use crate::error::{DvrError, Result};
use crate::format::FrameRecord;

pub const HEADER_LEN: usize = 32;

pub const SIDX_MAGIC: &[u8; 4] = b"SIDX";
pub const VPOS_MAGIC: &[u8; 4] = b"VPOS";

/// Bump when `FrameRecord`'s layout changes.
pub const SIDX_VERSION: u32 = 1;
pub const VPOS_VERSION: u32 = 1;

fn write_header(out: &mut Vec<u8>, magic: &[u8; 4], version: u32, count: u32, hash: ContentHash) {
    out.extend_from_slice(magic);
    let mut word = [0u8; 4];
    LittleEndian::write_u32(&mut word, version);
    out.extend_from_slice(&word);
    LittleEndian::write_u32(&mut word, count);
    out.extend_from_slice(&word);
    out.extend_from_slice(&hash.0);
    out.extend_from_slice(&[0u8; 4]);
}

/// Validate a header; returns the record count.
fn check_header(buf: &[u8], magic: &[u8; 4], version: u32, path: &Path) -> Result<usize> {
    if buf.len() < HEADER_LEN {
        return Err(DvrError::CacheCorrupt(format!(
            "{}: shorter than header",
            path.display()
        )));
    }
    if &buf[0..4] != magic {
        return Err(DvrError::CacheCorrupt(format!("{}: bad magic", path.display())));
    }
    let found_version = LittleEndian::read_u32(&buf[4..8]);
    if found_version != version {
        return Err(DvrError::CacheCorrupt(format!(
            "{}: version {} (want {})",
            path.display(),
            found_version,
            version
        )));
    }
    Ok(LittleEndian::read_u32(&buf[8..12]) as usize)
}

/// Write a frame-index cache. The write goes to a sibling temp file first
/// so a crash never leaves a half-written cache under the final name.
pub fn write_frame_cache(path: &Path, hash: ContentHash, records: &[FrameRecord]) -> Result<()> {
    let mut buf = Vec::with_capacity(HEADER_LEN + std::mem::size_of_val(records));
    write_header(&mut buf, SIDX_MAGIC, SIDX_VERSION, records.len() as u32, hash);
    buf.extend_from_slice(bytemuck::cast_slice(records));
    write_atomically(path, &buf)
}

/// Write a VPS-position cache.
pub fn write_vps_cache(path: &Path, hash: ContentHash, offsets: &[u32]) -> Result<()> {
    let mut buf = Vec::with_capacity(HEADER_LEN + offsets.len() * 4);
    write_header(&mut buf, VPOS_MAGIC, VPOS_VERSION, offsets.len() as u32, hash);
    let mut word = [0u8; 4];
    for &off in offsets {
        LittleEndian::write_u32(&mut word, off);
        buf.extend_from_slice(&word);
    }
    write_atomically(path, &buf)
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = std::fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Zero-copy view over a mapped frame-index cache.
///
/// The view owns a handle on the mapping, so it stays valid even after the
/// mmap manager drops its pooled reference. Callers that need records past
/// the view's lifetime copy them out.
#[derive(Clone)]
pub struct FrameCacheView {
    mmap: Arc<Mmap>,
    count: usize,
}

impl FrameCacheView {
    /// Open a view over an already-mapped cache file.
    pub fn new(mmap: Arc<Mmap>, path: &Path) -> Result<Self> {
        let count = check_header(&mmap[..], SIDX_MAGIC, SIDX_VERSION, path)?;
        let need = HEADER_LEN + count * std::mem::size_of::<FrameRecord>();
        if mmap.len() < need {
            return Err(DvrError::CacheCorrupt(format!(
                "{}: {} records do not fit in {} bytes",
                path.display(),
                count,
                mmap.len()
            )));
        }
        // Alignment sanity: the header is 32 bytes and mappings are
        // page-aligned, so the record array starts 8-aligned.
        let body = &mmap[HEADER_LEN..need];
        if bytemuck::try_cast_slice::<u8, FrameRecord>(body).is_err() {
            return Err(DvrError::CacheCorrupt(format!(
                "{}: misaligned record array",
                path.display()
            )));
        }
        Ok(Self { mmap, count })
    }

    pub fn records(&self) -> &[FrameRecord] {
        let body =
            &self.mmap[HEADER_LEN..HEADER_LEN + self.count * std::mem::size_of::<FrameRecord>()];
        bytemuck::cast_slice(body)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

impl std::fmt::Debug for FrameCacheView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCacheView").field("count", &self.count).finish()
    }
}

/// Zero-copy view over a mapped VPS-position cache.
#[derive(Clone)]
pub struct VpsCacheView {
    mmap: Arc<Mmap>,
    count: usize,
}

impl VpsCacheView {
    pub fn new(mmap: Arc<Mmap>, path: &Path) -> Result<Self> {
        let count = check_header(&mmap[..], VPOS_MAGIC, VPOS_VERSION, path)?;
        if mmap.len() < HEADER_LEN + count * 4 {
            return Err(DvrError::CacheCorrupt(format!(
                "{}: {} offsets do not fit in {} bytes",
                path.display(),
                count,
                mmap.len()
            )));
        }
        Ok(Self { mmap, count })
    }

    /// Copy the offsets out. VPS lists are small (one entry per GOP) and
    /// every caller decorates them with times, so there is no zero-copy
    /// accessor to keep alive.
    pub fn offsets(&self) -> Vec<u32> {
        let body = &self.mmap[HEADER_LEN..HEADER_LEN + self.count * 4];
        body.chunks_exact(4).map(LittleEndian::read_u32).collect()
    }

    pub fn len(&self) -> usize {
        self.count
    }
}

impl std::fmt::Debug for VpsCacheView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VpsCacheView").field("count", &self.count).finish()
    }
}
