//! Master segment index parser
//!
//! `TIndex00.tps` starts with a fixed header (magic, file/entry counts) and
//! carries the segment table from offset `0x4FC` as 64-byte records. A
//! record's slot number doubles as the numeric suffix of the container file
//! backing it, so discarded slots still consume an index.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use super::{MASTER_MAGIC, MIN_VALID_TIME};
use crate::error::{DvrError, Result};

/// Offset of the first segment record.
const TABLE_OFFSET: u64 = 0x4FC;

/// Size of one segment record.
const RECORD_SIZE: usize = 64;

/// Extra slots read past `entry_count` to tolerate table padding.
const ENTRY_SLACK: u32 = 8;

/// Master-index channel values that mark an unused or deleted slot.
const CH_UNUSED: u8 = 0;
const CH_DELETED: u8 = 0xFE;

/// One recorded interval on one channel, backed by exactly one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// Slot number in the master table; also the container's numeric suffix.
    pub file_index: u32,
    pub channel_id: u16,
    /// UTC seconds.
    pub start_time: u32,
    /// UTC seconds, exclusive of nothing: `end_time > start_time` holds for
    /// every parsed segment.
    pub end_time: u32,
    /// Frame-count hint from the recorder; not authoritative.
    pub frame_count: u16,
}

impl Segment {
    /// Whether `ts` falls inside this segment, boundaries included.
    pub fn contains(&self, ts: u32) -> bool {
        self.start_time <= ts && ts <= self.end_time
    }

    pub fn duration_secs(&self) -> u32 {
        self.end_time - self.start_time
    }
}

/// Parsed master index.
#[derive(Debug, Clone)]
pub struct MasterIndex {
    pub file_count: u32,
    pub entry_count: u32,
    pub segments: Vec<Segment>,
}

/// Parse the master index file of a volume.
pub fn parse_master_index(path: &Path) -> Result<MasterIndex> {
    let mut file = File::open(path).map_err(|e| {
        DvrError::VolumeNotReady(format!("cannot open {}: {}", path.display(), e))
    })?;
    parse_from(&mut file)
}

/// Parse the master index from any seekable source.
pub(crate) fn parse_from<R: Read + Seek>(r: &mut R) -> Result<MasterIndex> {
    let mut header = [0u8; 0x18];
    r.read_exact(&mut header)
        .map_err(|e| DvrError::VolumeNotReady(format!("master index header: {}", e)))?;

    let magic = LittleEndian::read_u32(&header[0..4]);
    if magic != MASTER_MAGIC {
        return Err(DvrError::VolumeNotReady(format!(
            "bad master index magic {:#010x}",
            magic
        )));
    }
    let file_count = LittleEndian::read_u32(&header[0x10..0x14]);
    let entry_count = LittleEndian::read_u32(&header[0x14..0x18]);

    r.seek(SeekFrom::Start(TABLE_OFFSET))?;

    let mut segments = Vec::new();
    let mut record = [0u8; RECORD_SIZE];
    let limit = entry_count.saturating_add(ENTRY_SLACK);

    for slot in 0..limit {
        match r.read_exact(&mut record) {
            Ok(()) => {}
            // Truncated table: keep everything up to the last whole record.
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e.into()),
        }
        if let Some(segment) = parse_record(slot, &record) {
            segments.push(segment);
        }
    }

    tracing::debug!(
        entry_count,
        file_count,
        kept = segments.len(),
        "master index parsed"
    );

    Ok(MasterIndex {
        file_count,
        entry_count,
        segments,
    })
}

/// Decode one 64-byte slot; `None` for unused/implausible records.
fn parse_record(slot: u32, record: &[u8]) -> Option<Segment> {
    let channel = record[0x04];
    let frame_count = LittleEndian::read_u16(&record[0x06..0x08]);
    let start_time = LittleEndian::read_u32(&record[0x08..0x0C]);
    let end_time = LittleEndian::read_u32(&record[0x0C..0x10]);

    if channel == CH_UNUSED || channel == CH_DELETED {
        return None;
    }
    if start_time < MIN_VALID_TIME || end_time <= start_time {
        return None;
    }

    Some(Segment {
        file_index: slot,
        channel_id: channel as u16,
        start_time,
        end_time,
        frame_count,
    })
}
