//! Synthetic volume fixtures
//!
//! Writes volumes the parsers accept bit-for-bit: a `TIndex00.tps` with
//! 64-byte segment records at `0x4FC`, and sparse `TRec######.tps`
//! containers with interleaved Annex-B video + μ-law audio at offset 0
//! and a newest-first 44-byte-record frame table past the data region.

use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};

use crate::format::{
    container_name, DATA_REGION_END, FRAME_INDEX_MAGIC, MASTER_INDEX_NAME, MASTER_MAGIC,
};

/// Wall clock of the reference recording (2025-12-18 05:07:29 UTC).
pub const T0: u32 = 1_766_034_449;

/// One segment description for the master index.
#[derive(Debug, Clone, Copy)]
pub struct SegmentSpec {
    pub channel: u8,
    pub start: u32,
    pub end: u32,
    pub frame_count: u16,
}

/// Write a master index containing the given segment slots in order.
pub fn write_master_index(volume: &Path, segments: &[SegmentSpec]) {
    let mut img = vec![0u8; 0x4FC];
    LittleEndian::write_u32(&mut img[0..4], MASTER_MAGIC);
    LittleEndian::write_u32(&mut img[0x10..0x14], segments.len() as u32);
    LittleEndian::write_u32(&mut img[0x14..0x18], segments.len() as u32);

    for spec in segments {
        let mut record = [0u8; 64];
        record[0x04] = spec.channel;
        LittleEndian::write_u16(&mut record[0x06..0x08], spec.frame_count);
        LittleEndian::write_u32(&mut record[0x08..0x0C], spec.start);
        LittleEndian::write_u32(&mut record[0x0C..0x10], spec.end);
        img.extend_from_slice(&record);
    }

    std::fs::write(volume.join(MASTER_INDEX_NAME), img).unwrap();
}

/// Accumulates a container's data region and frame table, then writes the
/// sparse file.
pub struct ContainerBuilder {
    data: Vec<u8>,
    /// Raw index records, oldest first; written reversed like the device.
    index: Vec<[u8; 44]>,
    seq: u32,
    micro: u64,
}

impl ContainerBuilder {
    pub fn new() -> Self {
        Self { data: Vec::new(), index: Vec::new(), seq: 0, micro: 0 }
    }

    fn push_record(&mut self, frame_type: u32, channel: u32, offset: u32, size: u32, unix: u32) {
        let mut rec = [0u8; 44];
        LittleEndian::write_u32(&mut rec[0..4], FRAME_INDEX_MAGIC);
        LittleEndian::write_u32(&mut rec[4..8], frame_type);
        LittleEndian::write_u32(&mut rec[8..12], channel);
        LittleEndian::write_u32(&mut rec[12..16], self.seq);
        LittleEndian::write_u32(&mut rec[16..20], offset);
        LittleEndian::write_u32(&mut rec[20..24], size);
        LittleEndian::write_u64(&mut rec[24..32], self.micro);
        LittleEndian::write_u32(&mut rec[32..36], unix);
        self.index.push(rec);
        self.seq += 1;
        self.micro += 40_000;
    }

    /// Append one Annex-B NAL and its index record.
    pub fn push_video(&mut self, nal_type: u8, body: &[u8], channel: u32, unix: u32) -> u32 {
        let offset = self.data.len() as u32;
        self.data.extend_from_slice(&[0, 0, 0, 1, nal_type << 1, 0x01]);
        self.data.extend_from_slice(body);
        let size = self.data.len() as u32 - offset;
        let frame_type = if nal_type == 19 || nal_type == 20 { 1 } else { 2 };
        // Parameter sets get no index record, matching the recorder.
        if nal_type < 32 {
            self.push_record(frame_type, channel, offset, size, unix);
        }
        offset
    }

    /// Append a μ-law audio frame and its index record.
    pub fn push_audio(&mut self, samples: usize, unix: u32) -> u32 {
        let offset = self.data.len() as u32;
        // 0x7F mid-scale silence; no byte pattern collides with start codes.
        self.data.extend_from_slice(&vec![0x7Fu8; samples]);
        self.push_record(3, 258, offset, samples as u32, unix);
        offset
    }

    /// Write the container as a sparse file: data at 0, table reversed at
    /// a small gap past the data region.
    pub fn write(self, volume: &Path, file_index: u32) {
        let path = volume.join(container_name(file_index));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&self.data).unwrap();
        file.seek(SeekFrom::Start(DATA_REGION_END + 256)).unwrap();
        for rec in self.index.iter().rev() {
            file.write_all(rec).unwrap();
        }
        file.sync_all().unwrap();
    }

    /// Write the data region only, dropping the frame table (a recorder
    /// that died before its flush).
    pub fn write_without_table(self, volume: &Path, file_index: u32) {
        let path = volume.join(container_name(file_index));
        std::fs::write(path, &self.data).unwrap();
    }
}

/// A volume with one 30-second channel-2 segment: 10 GOPs of
/// VPS/SPS/PPS/IDR + 2 P-frames, one audio frame per second.
pub fn standard_volume(volume: &Path) -> SegmentSpec {
    let spec = SegmentSpec { channel: 2, start: T0, end: T0 + 30, frame_count: 30 };
    write_master_index(volume, &[spec]);

    let mut builder = ContainerBuilder::new();
    for gop in 0..10u32 {
        let t = T0 + gop * 3;
        builder.push_video(32, &[0xAA; 16], 2, t);
        builder.push_video(33, &[0xBB; 24], 2, t);
        builder.push_video(34, &[0xCC; 8], 2, t);
        builder.push_audio(320, t);
        builder.push_video(19, &vec![0x10u8; 1024], 2, t);
        builder.push_audio(320, t + 1);
        builder.push_video(1, &vec![0x20u8; 512], 2, t + 1);
        builder.push_audio(320, t + 2);
        builder.push_video(1, &vec![0x30u8; 512], 2, t + 2);
    }
    builder.write(volume, 0);
    spec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format;

    #[test]
    fn test_standard_volume_parses() {
        let dir = tempfile::tempdir().unwrap();
        standard_volume(dir.path());

        let master =
            format::parse_master_index(&dir.path().join(MASTER_INDEX_NAME)).unwrap();
        assert_eq!(master.segments.len(), 1);
        assert_eq!(master.segments[0].channel_id, 2);

        let mut file =
            std::fs::File::open(dir.path().join(container_name(0))).unwrap();
        let records = format::parse_frame_index(&mut file).unwrap();
        // 3 video + 3 audio records per GOP.
        assert_eq!(records.len(), 60);
        assert!(records.windows(2).all(|w| w[0].micro_timestamp <= w[1].micro_timestamp));

        let mut file =
            std::fs::File::open(dir.path().join(container_name(0))).unwrap();
        let vps = format::scan_vps_positions(&mut file).unwrap();
        assert_eq!(vps.len(), 10);
        assert_eq!(vps[0], 0);
    }
}
