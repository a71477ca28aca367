//! Byte offset ↔ wall-clock interpolation and seek resolution
//!
//! The containers carry no per-byte timing, so seeking triangulates from
//! three sources of truth: segment bounds from the master index (coarse),
//! VPS positions with audio-anchored times (fine), and the audio records
//! themselves (dense, ~166/s, ground-truth wall clock good to ±1 s).

use crate::error::{DvrError, Result};
use crate::format::{AudioRecord, Segment, DATA_REGION_END};
use crate::hevc::VideoHeader;
use crate::storage::StorageManager;

/// A `(byte offset, wall-clock seconds)` pair used by the fine
/// interpolator. Produced from VPS scan positions during cache build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VpsAnchor {
    pub offset: u64,
    pub time: u32,
}

/// Coarse interpolation: proportional position in the data region mapped
/// onto the segment's interval. Only used when no anchors exist; accuracy
/// degrades when a segment does not fill its container.
pub fn coarse_time_at(segment: &Segment, offset: u64) -> f64 {
    let span = f64::from(segment.end_time - segment.start_time);
    let frac = (offset.min(DATA_REGION_END) as f64) / (DATA_REGION_END as f64);
    f64::from(segment.start_time) + frac * span
}

/// Fine interpolation between the anchors bracketing `offset`. Missing
/// brackets are synthesised from the segment bounds: `(0, start)` below,
/// `(DATA_REGION_END, end)` above.
pub fn fine_time_at(anchors: &[VpsAnchor], segment: &Segment, offset: u64) -> f64 {
    let prev = anchor_at_or_before(anchors, offset).copied().unwrap_or(VpsAnchor {
        offset: 0,
        time: segment.start_time,
    });
    let next = anchors
        .iter()
        .find(|a| a.offset > offset)
        .copied()
        .unwrap_or(VpsAnchor {
            offset: DATA_REGION_END,
            time: segment.end_time,
        });

    if next.offset <= prev.offset {
        return f64::from(prev.time);
    }
    let frac = (offset - prev.offset) as f64 / (next.offset - prev.offset) as f64;
    f64::from(prev.time) + frac * (f64::from(next.time) - f64::from(prev.time))
}

/// Greatest anchor with `offset <= target`, assuming ascending offsets.
pub fn anchor_at_or_before(anchors: &[VpsAnchor], target: u64) -> Option<&VpsAnchor> {
    let idx = anchors.partition_point(|a| a.offset <= target);
    idx.checked_sub(1).map(|i| &anchors[i])
}

/// Wall-clock time at a byte offset, from the greatest audio record at or
/// before it. Audio records are offset-ascending (they are written in
/// capture order).
pub fn audio_time_for_offset(audio: &[AudioRecord], offset: u64) -> Option<u32> {
    let idx = audio.partition_point(|a| u64::from(a.file_offset) <= offset);
    idx.checked_sub(1).map(|i| audio[i].unix_timestamp)
}

/// First audio record whose wall-clock is at or past `ts`.
pub fn audio_record_at_or_after(audio: &[AudioRecord], ts: u32) -> Option<&AudioRecord> {
    let idx = audio.partition_point(|a| a.unix_timestamp < ts);
    audio.get(idx)
}

/// A resolved playback start point.
#[derive(Debug)]
pub struct SeekTarget {
    pub segment: Segment,
    /// Decoder prologue read near the target, with absolute `end_offset`.
    pub header: VideoHeader,
    /// Absolute container offset where P-frame streaming resumes (just
    /// past the IDR).
    pub resume_offset: u64,
    /// Refined wall-clock seconds of the first delivered frame.
    pub actual_start_time: u32,
}

/// Resolve wall-clock `ts` on `channel` to a concrete start point.
///
/// Protocol: find the covering cached segment (any-channel fallback), map
/// the time to a byte offset via the audio records, snap back to the
/// nearest preceding VPS, extract the decoder prologue there, then refine
/// the start time from the audio record closest to the IDR itself.
pub async fn resolve(storage: &StorageManager, ts: u32, channel: u16) -> Result<SeekTarget> {
    let segment = storage
        .find_segment_by_time(ts, Some(channel), true)
        .or_else(|| storage.find_segment_by_time(ts, None, true))
        .ok_or(DvrError::SeekNotFound)?;

    let cached = storage.cached_segment(segment.file_index).ok_or(DvrError::SeekNotFound)?;
    let anchors = storage.i_frame_positions(segment.file_index, channel);

    // Byte offset for the requested instant. Audio is the densest signal;
    // fall back to anchors, then to the segment head.
    let target_offset = match audio_record_at_or_after(cached.audio(), ts) {
        Some(rec) => u64::from(rec.file_offset),
        None => anchors
            .iter()
            .find(|a| a.time >= ts)
            .or_else(|| anchors.last())
            .map(|a| a.offset)
            .unwrap_or(0),
    };

    // Snap to the nearest I-frame at or before the target so the prologue
    // scan starts on a GOP head instead of mid-GOP.
    let scan_from = anchor_at_or_before(&anchors, target_offset)
        .map(|a| a.offset)
        .unwrap_or(target_offset);

    let header = storage.read_video_header(segment.file_index, scan_from).await?;

    let idr_offset = header.idr_offset as u64;
    let actual_start_time = audio_time_for_offset(cached.audio(), idr_offset)
        .unwrap_or_else(|| fine_time_at(&anchors, &segment, idr_offset).round() as u32);

    tracing::debug!(
        ts,
        channel,
        file_index = segment.file_index,
        target_offset,
        scan_from,
        actual_start_time,
        "seek resolved"
    );

    Ok(SeekTarget {
        resume_offset: header.end_offset as u64,
        actual_start_time,
        segment,
        header,
    })
}
