//! Persistent index caches
//!
//! Scanning a container for its frame table and VPS positions costs two
//! linear passes over a 256 MiB file on (usually) a USB disk. The results
//! are immutable for a given container, so they are persisted under
//! `<workdir>/.index_cache/` and mmapped read-only on later runs.
//!
//! Cache files are named by a content hash of the container (basename +
//! mtime + first 4 KiB). The container's fixed size is deliberately not
//! hashed; every container shares it. Because the path already encodes the
//! hash, a cache read never re-verifies the source file.

pub mod mmap;
pub mod store;

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub use mmap::MmapManager;
pub use store::{FrameCacheView, VpsCacheView};

/// Directory under the workdir that holds cache files.
pub const CACHE_DIR_NAME: &str = ".index_cache";

/// How much of the container head goes into the identity hash.
const HASH_PREFIX_LEN: usize = 4096;

/// 16-byte container identity hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentHash(pub [u8; 16]);

impl ContentHash {
    pub fn to_hex(self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Hash a container's identity: basename, mtime seconds, first 4 KiB.
pub fn content_hash(path: &Path) -> Result<ContentHash> {
    let mut hasher = blake3::Hasher::new();

    let basename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    hasher.update(basename.as_bytes());

    let meta = std::fs::metadata(path)?;
    let mtime = meta
        .modified()?
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    hasher.update(&mtime.to_le_bytes());

    let mut head = vec![0u8; HASH_PREFIX_LEN];
    let mut file = File::open(path)?;
    let mut filled = 0;
    while filled < head.len() {
        match file.read(&mut head[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    hasher.update(&head[..filled]);

    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize().as_bytes()[..16]);
    Ok(ContentHash(out))
}

/// Path of the frame-index cache for a container hash.
pub fn sidx_path(cache_dir: &Path, hash: ContentHash) -> PathBuf {
    cache_dir.join(format!("{}.sidx", hash))
}

/// Path of the VPS-position cache for a container hash.
pub fn vpos_path(cache_dir: &Path, hash: ContentHash) -> PathBuf {
    cache_dir.join(format!("{}.vpos", hash))
}

/// Resolve (and create) the cache directory under a workdir.
pub fn cache_dir(workdir: &Path) -> Result<PathBuf> {
    let dir = workdir.join(CACHE_DIR_NAME);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
