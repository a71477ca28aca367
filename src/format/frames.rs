//! Container frame-index parser
//!
//! Each container ends with a table of 44-byte records describing every
//! frame in the data region. The table does not sit at a fixed offset; it
//! is found by scanning the first 7 MiB past the data region for the table
//! magic. Records are stored newest-first, so the parsed set is re-sorted
//! ascending by `micro_timestamp`.

use std::io::{Read, Seek, SeekFrom};

use bytemuck::{Pod, Zeroable};
use byteorder::{ByteOrder, LittleEndian};

use super::{
    is_recognised_channel, DATA_REGION_END, FRAME_INDEX_MAGIC, FRAME_INDEX_SCAN_LEN,
    FRAME_TYPE_AUDIO, FRAME_TYPE_KEY, MIN_VALID_TIME,
};
use crate::error::Result;

/// Size of one on-disk index record.
const RECORD_SIZE: usize = 44;

/// One frame-index entry, in the in-memory layout that is also the cache
/// file record layout (see `cache::store`). 32 bytes, 8-aligned, no
/// padding; the cache `version` field pins exactly this shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct FrameRecord {
    /// Monotonic microseconds since an internal origin.
    pub micro_timestamp: u64,
    /// 1 = key, 2 = predicted, 3 = audio.
    pub frame_type: u32,
    pub channel: u32,
    pub frame_seq: u32,
    /// Byte offset of the frame within the container data region.
    pub file_offset: u32,
    pub frame_size: u32,
    /// Wall-clock seconds.
    pub unix_timestamp: u32,
}

// The zero-copy cache path depends on this layout; a drift here must come
// with a cache version bump.
const _: () = assert!(std::mem::size_of::<FrameRecord>() == 32);
const _: () = assert!(std::mem::align_of::<FrameRecord>() == 8);

impl FrameRecord {
    pub fn is_key(&self) -> bool {
        self.frame_type == FRAME_TYPE_KEY
    }

    pub fn is_audio(&self) -> bool {
        self.frame_type == FRAME_TYPE_AUDIO
    }
}

/// Audio-only projection of a frame index, used for wall-clock anchoring
/// and for the session's audio flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioRecord {
    pub file_offset: u32,
    pub frame_size: u32,
    pub unix_timestamp: u32,
}

impl From<&FrameRecord> for AudioRecord {
    fn from(r: &FrameRecord) -> Self {
        Self {
            file_offset: r.file_offset,
            frame_size: r.frame_size,
            unix_timestamp: r.unix_timestamp,
        }
    }
}

/// Parse a container's trailing frame-index table.
///
/// A container whose trailing region carries no table magic parses as an
/// empty index; that is a valid outcome (the recorder crashed before the
/// flush), not an error.
pub fn parse_frame_index<R: Read + Seek>(r: &mut R) -> Result<Vec<FrameRecord>> {
    r.seek(SeekFrom::Start(DATA_REGION_END))?;

    let mut region = vec![0u8; FRAME_INDEX_SCAN_LEN];
    let len = read_up_to(r, &mut region)?;
    region.truncate(len);

    Ok(parse_frame_table(&region))
}

/// Locate and decode the frame table inside the trailing region bytes.
pub(crate) fn parse_frame_table(region: &[u8]) -> Vec<FrameRecord> {
    let Some(table_start) = find_magic(region) else {
        tracing::debug!("no frame-index magic in trailing region");
        return Vec::new();
    };

    let mut records = Vec::new();
    let mut pos = table_start;
    while pos + RECORD_SIZE <= region.len() {
        let rec = &region[pos..pos + RECORD_SIZE];
        if LittleEndian::read_u32(&rec[0..4]) != FRAME_INDEX_MAGIC {
            break;
        }
        if let Some(frame) = parse_record(rec) {
            records.push(frame);
        }
        pos += RECORD_SIZE;
    }

    // On-disk order is reverse; every consumer wants time-ascending.
    records.sort_by_key(|f| f.micro_timestamp);

    tracing::debug!(table_start, kept = records.len(), "frame index parsed");
    records
}

/// Decode one 44-byte record past its magic; `None` for filtered entries.
fn parse_record(rec: &[u8]) -> Option<FrameRecord> {
    let frame_type = LittleEndian::read_u32(&rec[4..8]);
    let channel = LittleEndian::read_u32(&rec[8..12]);
    let frame_seq = LittleEndian::read_u32(&rec[12..16]);
    let file_offset = LittleEndian::read_u32(&rec[16..20]);
    let frame_size = LittleEndian::read_u32(&rec[20..24]);
    let micro_timestamp = LittleEndian::read_u64(&rec[24..32]);
    let unix_timestamp = LittleEndian::read_u32(&rec[32..36]);
    // rec[36..44] is reserved.

    if unix_timestamp <= MIN_VALID_TIME || !is_recognised_channel(channel) {
        return None;
    }

    Some(FrameRecord {
        micro_timestamp,
        frame_type,
        channel,
        frame_seq,
        file_offset,
        frame_size,
        unix_timestamp,
    })
}

/// Collect the audio records of a sorted frame index, preserving order.
pub fn audio_records(records: &[FrameRecord]) -> Vec<AudioRecord> {
    records.iter().filter(|r| r.is_audio()).map(AudioRecord::from).collect()
}

/// NAL payload boundaries derived from the frame index.
///
/// The data region interleaves audio frames between video NALs, so the
/// next Annex-B start code is NOT where a video NAL ends: scanning by
/// start codes alone would glue the following μ-law bytes onto every
/// payload. The index records carry the exact byte size of each frame;
/// this map bounds a scanned NAL to that size. Parameter sets are not
/// indexed by the recorder and are clipped at the next indexed frame
/// instead. Bytes the index knows nothing about are not video.
#[derive(Debug, Clone, Default)]
pub struct FrameBounds {
    /// `(offset, size, is_video)`, ascending by offset.
    entries: Vec<(u32, u32, bool)>,
}

impl FrameBounds {
    pub fn from_records(records: &[FrameRecord]) -> Self {
        let mut entries: Vec<_> = records
            .iter()
            .map(|r| (r.file_offset, r.frame_size, !r.is_audio()))
            .collect();
        entries.sort_by_key(|e| e.0);
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Recorded end of the video frame starting exactly at `offset`.
    fn recorded_end(&self, offset: u64) -> Option<u64> {
        let idx = self.entries.partition_point(|e| u64::from(e.0) < offset);
        let e = self.entries.get(idx)?;
        (u64::from(e.0) == offset && e.2).then(|| u64::from(e.0) + u64::from(e.1))
    }

    /// Offset of the first indexed frame past `offset`.
    fn next_start(&self, offset: u64) -> Option<u64> {
        let idx = self.entries.partition_point(|e| u64::from(e.0) <= offset);
        self.entries.get(idx).map(|e| u64::from(e.0))
    }

    /// Payload end for a NAL whose start code sits at `offset` and whose
    /// start-code scan ran to `scan_end`.
    ///
    /// An indexed video frame ends at its recorded size. An unindexed
    /// parameter set (`is_header`) ends at the next indexed frame. Any
    /// other unindexed span is not a frame at all (interleaved audio that
    /// happened to scan like one) and yields `None`. With no index, the
    /// start-code span stands.
    pub fn nal_end(&self, offset: u64, scan_end: u64, is_header: bool) -> Option<u64> {
        if self.entries.is_empty() {
            return Some(scan_end);
        }
        if let Some(end) = self.recorded_end(offset) {
            return Some(end.min(scan_end));
        }
        if is_header {
            let clip = self.next_start(offset).unwrap_or(scan_end);
            return Some(clip.min(scan_end));
        }
        None
    }
}

/// First byte offset in `region` where the table magic occurs.
fn find_magic(region: &[u8]) -> Option<usize> {
    let needle = FRAME_INDEX_MAGIC.to_le_bytes();
    region.windows(4).position(|w| w == needle)
}

/// `read_exact` that tolerates a short final read.
fn read_up_to<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}
