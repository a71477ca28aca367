//! Cache construction
//!
//! Builds `CachedSegment`s on a bounded worker pool. The expected medium
//! is a USB disk, where fan-out beyond a couple of readers only fights the
//! head; hence the small default and the hard cap.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::cache::{self, MmapManager};
use crate::error::{DvrError, Result};
use crate::format::{self, container_name, Segment};
use crate::seek::{audio_time_for_offset, coarse_time_at, VpsAnchor};

use super::{CachedSegment, FrameSlice, StorageManager};

/// Concurrent container scans.
pub const DEFAULT_WORKERS: usize = 2;
pub const MAX_WORKERS: usize = 4;

/// Per-segment outcome delivered on the results channel.
struct BuildOutcome {
    file_index: u32,
    built: Option<CachedSegment>,
}

impl StorageManager {
    /// Ensure a `CachedSegment` exists for every requested segment (all
    /// segments when `file_indices` is `None`). Already-cached segments
    /// are a no-op. `on_progress` fires as `(current, total, file_index)`
    /// after each segment completes.
    pub async fn build_cache<F>(
        self: Arc<Self>,
        file_indices: Option<Vec<u32>>,
        on_progress: F,
    ) -> Result<()>
    where
        F: Fn(usize, usize, u32),
    {
        let targets: Vec<Segment> = match file_indices {
            Some(wanted) => self
                .master
                .segments
                .iter()
                .filter(|s| wanted.contains(&s.file_index))
                .cloned()
                .collect(),
            None => self.master.segments.clone(),
        };
        let total = targets.len();

        {
            let mut inner = self.inner.write();
            inner.status.building = true;
            inner.status.total = total;
            inner.status.current = 0;
            inner.status.cached_count = inner.cached.len();
        }

        let workers = DEFAULT_WORKERS.min(MAX_WORKERS).min(total.max(1));

        let (work_tx, work_rx) = mpsc::channel::<Segment>(total.max(1));
        let work_rx = Arc::new(Mutex::new(work_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<BuildOutcome>(workers);

        for segment in &targets {
            // Capacity equals the target count, so this never blocks.
            let _ = work_tx.send(segment.clone()).await;
        }
        drop(work_tx);

        for _ in 0..workers {
            let this = self.clone();
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            tokio::spawn(async move {
                loop {
                    let segment = {
                        let mut rx = work_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(segment) = segment else { break };
                    let file_index = segment.file_index;

                    let built = if this.is_cached(file_index) {
                        None
                    } else {
                        let volume = this.volume_path.clone();
                        let cache_dir = this.cache_dir.clone();
                        let mmaps = this.mmaps.clone();
                        let result = tokio::task::spawn_blocking(move || {
                            build_one(&volume, &cache_dir, &mmaps, &segment)
                        })
                        .await;
                        match result {
                            Ok(Ok(cached)) => Some(cached),
                            Ok(Err(e)) => {
                                tracing::warn!(file_index, error = %e, "segment cache build failed");
                                None
                            }
                            Err(e) => {
                                tracing::warn!(file_index, error = %e, "cache build task panicked");
                                None
                            }
                        }
                    };

                    if result_tx.send(BuildOutcome { file_index, built }).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        let mut done = 0usize;
        while let Some(outcome) = result_rx.recv().await {
            done += 1;
            {
                let mut inner = self.inner.write();
                if let Some(cached) = outcome.built {
                    inner.cached.insert(outcome.file_index, Arc::new(cached));
                }
                inner.status.current = done;
                inner.status.cached_count = inner.cached.len();
            }
            on_progress(done, total, outcome.file_index);
        }

        let mut inner = self.inner.write();
        inner.status.building = false;
        tracing::info!(cached = inner.cached.len(), total, "cache build complete");
        Ok(())
    }
}

/// Build one segment's cache: frame index and VPS positions, each served
/// from its cache file when present, otherwise derived from the container
/// and persisted. Runs on the blocking pool.
fn build_one(
    volume: &Path,
    cache_dir: &Path,
    mmaps: &MmapManager,
    segment: &Segment,
) -> Result<CachedSegment> {
    let container = volume.join(container_name(segment.file_index));
    if !container.is_file() {
        return Err(DvrError::VolumeNotReady(format!(
            "container {} missing",
            container.display()
        )));
    }

    let hash = cache::content_hash(&container)?;

    let frames = load_frames(cache_dir, mmaps, &container, hash)?;
    let audio = format::frames::audio_records(frames.records());
    let bounds = format::FrameBounds::from_records(frames.records());
    let offsets = load_vps_offsets(cache_dir, mmaps, &container, hash)?;

    let anchors = offsets
        .into_iter()
        .map(|off| VpsAnchor {
            offset: u64::from(off),
            time: audio_time_for_offset(&audio, u64::from(off))
                .unwrap_or_else(|| coarse_time_at(segment, u64::from(off)).round() as u32),
        })
        .collect();

    Ok(CachedSegment {
        segment: segment.clone(),
        frames,
        audio,
        anchors,
        bounds,
    })
}

fn load_frames(
    cache_dir: &Path,
    mmaps: &MmapManager,
    container: &Path,
    hash: cache::ContentHash,
) -> Result<FrameSlice> {
    let sidx = cache::sidx_path(cache_dir, hash);

    if sidx.is_file() {
        match mmaps
            .get_or_map(&sidx)
            .and_then(|m| cache::store::FrameCacheView::new(m, &sidx))
        {
            Ok(view) => return Ok(FrameSlice::Mapped(view)),
            Err(e) => {
                // Self-healing: drop the bad file and re-derive below.
                tracing::warn!(path = %sidx.display(), error = %e, "discarding frame cache");
                mmaps.release(&sidx);
                let _ = std::fs::remove_file(&sidx);
            }
        }
    }

    let mut file = File::open(container)?;
    let records = format::parse_frame_index(&mut file)?;

    match cache::store::write_frame_cache(&sidx, hash, &records)
        .and_then(|()| mmaps.get_or_map(&sidx))
        .and_then(|m| cache::store::FrameCacheView::new(m, &sidx))
    {
        Ok(view) => Ok(FrameSlice::Mapped(view)),
        Err(e) => {
            tracing::warn!(path = %sidx.display(), error = %e, "frame cache not persisted");
            Ok(FrameSlice::Owned(records))
        }
    }
}

fn load_vps_offsets(
    cache_dir: &Path,
    mmaps: &MmapManager,
    container: &Path,
    hash: cache::ContentHash,
) -> Result<Vec<u32>> {
    let vpos = cache::vpos_path(cache_dir, hash);

    if vpos.is_file() {
        match mmaps
            .get_or_map(&vpos)
            .and_then(|m| cache::store::VpsCacheView::new(m, &vpos))
        {
            Ok(view) => return Ok(view.offsets()),
            Err(e) => {
                tracing::warn!(path = %vpos.display(), error = %e, "discarding VPS cache");
                mmaps.release(&vpos);
                let _ = std::fs::remove_file(&vpos);
            }
        }
    }

    let mut file = File::open(container)?;
    let offsets = format::scan_vps_positions(&mut file)?;

    if let Err(e) = cache::store::write_vps_cache(&vpos, hash, &offsets) {
        tracing::warn!(path = %vpos.display(), error = %e, "VPS cache not persisted");
    }
    Ok(offsets)
}
