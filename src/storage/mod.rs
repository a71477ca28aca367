//! Storage manager
//!
//! Owns everything parsed off one mounted volume: the master segment
//! table, and per-segment cached info (frame index, audio projection, VPS
//! anchors) built lazily by `builder`. All lookups the HTTP layer and the
//! stream sessions need go through here.

pub mod builder;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::cache::{self, ContentHash, FrameCacheView, MmapManager};
use crate::error::{DvrError, Result};
use crate::format::{
    container_name, AudioRecord, FrameBounds, FrameRecord, MasterIndex, Segment, DATA_REGION_END,
    MASTER_INDEX_NAME,
};
use crate::hevc::{self, VideoHeader};
use crate::seek::VpsAnchor;
use crate::stream::reader::StreamReader;

/// Window read when extracting a decoder prologue near an offset.
const HEADER_WINDOW: usize = 512 * 1024;

/// Frame records of a cached segment: a zero-copy view over the mmapped
/// cache file when one exists, an owned vector when the cache could not be
/// written (read-only workdir).
#[derive(Debug)]
pub enum FrameSlice {
    Mapped(FrameCacheView),
    Owned(Vec<FrameRecord>),
}

impl FrameSlice {
    pub fn records(&self) -> &[FrameRecord] {
        match self {
            FrameSlice::Mapped(view) => view.records(),
            FrameSlice::Owned(v) => v,
        }
    }
}

/// A segment plus everything derived from its container.
#[derive(Debug)]
pub struct CachedSegment {
    segment: Segment,
    frames: FrameSlice,
    audio: Vec<AudioRecord>,
    anchors: Vec<VpsAnchor>,
    bounds: FrameBounds,
}

impl CachedSegment {
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    pub fn frames(&self) -> &[FrameRecord] {
        self.frames.records()
    }

    pub fn audio(&self) -> &[AudioRecord] {
        &self.audio
    }

    pub fn anchors(&self) -> &[VpsAnchor] {
        &self.anchors
    }

    /// NAL payload boundaries for this container's data region.
    pub fn bounds(&self) -> &FrameBounds {
        &self.bounds
    }
}

/// Cache-construction progress, published atomically with the cached map.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheBuildStatus {
    pub building: bool,
    pub total: usize,
    pub current: usize,
    pub cached_count: usize,
}

impl CacheBuildStatus {
    pub fn progress_percent(&self) -> u32 {
        if self.total == 0 {
            return 100;
        }
        (self.current * 100 / self.total) as u32
    }
}

#[derive(Default)]
struct Inner {
    cached: HashMap<u32, Arc<CachedSegment>>,
    status: CacheBuildStatus,
}

/// Owner of one mounted volume's indices and caches.
pub struct StorageManager {
    volume_path: PathBuf,
    cache_dir: PathBuf,
    volume_hash: ContentHash,
    master: MasterIndex,
    inner: RwLock<Inner>,
    mmaps: Arc<MmapManager>,
}

impl StorageManager {
    /// Parse the master index of `volume_path` and stand up an empty
    /// manager. Fails with `VolumeNotReady` when the index is missing.
    pub fn load(volume_path: &Path, cache_dir: &Path, mmaps: Arc<MmapManager>) -> Result<Self> {
        let index_path = volume_path.join(MASTER_INDEX_NAME);
        if !index_path.is_file() {
            return Err(DvrError::VolumeNotReady(format!(
                "{} not found under {}",
                MASTER_INDEX_NAME,
                volume_path.display()
            )));
        }

        let master = crate::format::parse_master_index(&index_path)?;
        let volume_hash = cache::content_hash(&index_path)?;

        tracing::info!(
            volume = %volume_path.display(),
            segments = master.segments.len(),
            %volume_hash,
            "volume loaded"
        );

        Ok(Self {
            volume_path: volume_path.to_path_buf(),
            cache_dir: cache_dir.to_path_buf(),
            volume_hash,
            master,
            inner: RwLock::new(Inner::default()),
            mmaps,
        })
    }

    pub fn volume_path(&self) -> &Path {
        &self.volume_path
    }

    /// Identity hash of the master index; decides whether a remount can
    /// reuse this manager or must reload.
    pub fn volume_hash(&self) -> ContentHash {
        self.volume_hash
    }

    pub fn entry_count(&self) -> u32 {
        self.master.entry_count
    }

    pub fn file_count(&self) -> u32 {
        self.master.file_count
    }

    /// Immutable snapshot of every parsed segment.
    pub fn segments(&self) -> Vec<Segment> {
        self.master.segments.clone()
    }

    /// Snapshot of the segments whose caches are built, ascending by
    /// `file_index`.
    pub fn cached_segments(&self) -> Vec<Arc<CachedSegment>> {
        let inner = self.inner.read();
        let mut v: Vec<_> = inner.cached.values().cloned().collect();
        v.sort_by_key(|c| c.segment.file_index);
        v
    }

    pub fn cached_segment(&self, file_index: u32) -> Option<Arc<CachedSegment>> {
        self.inner.read().cached.get(&file_index).cloned()
    }

    pub fn is_cached(&self, file_index: u32) -> bool {
        self.inner.read().cached.contains_key(&file_index)
    }

    pub fn status(&self) -> CacheBuildStatus {
        self.inner.read().status
    }

    /// First segment containing `ts`, boundaries included. `channel`
    /// `None` matches any channel; `cached_only` restricts to segments
    /// whose cache is built (the surface the UI exposes).
    pub fn find_segment_by_time(
        &self,
        ts: u32,
        channel: Option<u16>,
        cached_only: bool,
    ) -> Option<Segment> {
        let inner = self.inner.read();
        self.master
            .segments
            .iter()
            .find(|s| {
                s.contains(ts)
                    && channel.map(|c| s.channel_id == c).unwrap_or(true)
                    && (!cached_only || inner.cached.contains_key(&s.file_index))
            })
            .cloned()
    }

    /// I-frame positions for a segment: the audio-timed VPS anchors when
    /// the scan found any, otherwise the key frames of the requested
    /// channel straight from the frame index.
    pub fn i_frame_positions(&self, file_index: u32, channel: u16) -> Vec<VpsAnchor> {
        let Some(cached) = self.cached_segment(file_index) else {
            return Vec::new();
        };
        if !cached.anchors().is_empty() {
            return cached.anchors().to_vec();
        }
        let mut keys: Vec<VpsAnchor> = cached
            .frames()
            .iter()
            .filter(|f| f.is_key() && f.channel == u32::from(channel))
            .map(|f| VpsAnchor {
                offset: u64::from(f.file_offset),
                time: f.unix_timestamp,
            })
            .collect();
        keys.sort_by_key(|a| a.offset);
        keys
    }

    /// Absolute path of a segment's container file.
    pub fn container_path(&self, file_index: u32) -> PathBuf {
        self.volume_path.join(container_name(file_index))
    }

    /// Read a 512 KiB window at `near_offset` and extract the decoder
    /// prologue. Payloads are bounded by the segment's frame index so the
    /// audio bytes interleaved after a NAL never leak into it. The
    /// returned header's offsets are translated to absolute file
    /// coordinates.
    pub async fn read_video_header(&self, file_index: u32, near_offset: u64) -> Result<VideoHeader> {
        if near_offset >= DATA_REGION_END {
            return Err(DvrError::HeaderNotFound);
        }
        let path = self.container_path(file_index);
        let mut file = tokio::fs::File::open(&path).await.map_err(|e| {
            DvrError::VolumeNotReady(format!("cannot open {}: {}", path.display(), e))
        })?;

        let want = HEADER_WINDOW.min((DATA_REGION_END - near_offset) as usize);
        let mut window = vec![0u8; want];
        file.seek(std::io::SeekFrom::Start(near_offset)).await?;
        let mut filled = 0;
        while filled < window.len() {
            let n = file.read(&mut window[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        window.truncate(filled);

        let bounds = self.nal_bounds(file_index);
        let mut header = hevc::extract_video_header_with(&window, |nal| {
            let start = near_offset + nal.start as u64;
            let scan_end = near_offset + nal.end() as u64;
            bounds
                .nal_end(start, scan_end, nal.nal_type().is_header())
                .map(|end| (end - near_offset) as usize)
        })
        .ok_or(DvrError::HeaderNotFound)?;
        header.idr_offset += near_offset as usize;
        header.end_offset += near_offset as usize;
        Ok(header)
    }

    /// Open a paced-stream reader owning its own container handle.
    pub async fn open_stream_reader(
        &self,
        file_index: u32,
        start_offset: u64,
        start_time_ms: u64,
        channel: u16,
    ) -> Result<StreamReader> {
        let path = self.container_path(file_index);
        let bounds = self.nal_bounds(file_index);
        StreamReader::open(&path, start_offset, start_time_ms, channel, bounds).await
    }

    /// Boundary map for a container; empty (start-code spans stand) when
    /// the segment has no cache yet or its frame table was never flushed.
    fn nal_bounds(&self, file_index: u32) -> FrameBounds {
        self.cached_segment(file_index)
            .map(|c| c.bounds().clone())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for StorageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageManager")
            .field("volume_path", &self.volume_path)
            .field("segments", &self.master.segments.len())
            .field("cached", &self.inner.read().cached.len())
            .finish()
    }
}
