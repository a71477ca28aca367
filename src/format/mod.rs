//! On-disk TPS recording format
//!
//! The format was reverse-engineered from the vendor DLL. A volume holds a
//! single master index (`TIndex00.tps`, ~32 MiB) and a ring of fixed-size
//! container files (`TRec000000.tps` …). Each container is exactly 256 MiB:
//! the first `0x0F900000` bytes are interleaved H.265 Annex-B video and
//! G.711 μ-law audio, the tail holds a self-describing frame-index table.
//!
//! All on-disk structures are little-endian.

pub mod frames;
pub mod master;
pub mod vps;

pub use frames::{parse_frame_index, AudioRecord, FrameBounds, FrameRecord};
pub use master::{parse_master_index, MasterIndex, Segment};
pub use vps::scan_vps_positions;

/// Total size of one container file.
pub const CONTAINER_SIZE: u64 = 256 * 1024 * 1024;

/// End of the data region; the frame-index table lives after this.
pub const DATA_REGION_END: u64 = 0x0F90_0000;

/// How far into the trailing region to look for the frame-index magic.
pub const FRAME_INDEX_SCAN_LEN: usize = 7 * 1024 * 1024;

/// Magic that opens the frame-index table and every one of its records.
pub const FRAME_INDEX_MAGIC: u32 = 0x4C3D_2E1F;

/// Magic at offset 0 of the master index.
pub const MASTER_MAGIC: u32 = 0x1F2E_3D4C;

/// File name of the master index on the volume.
pub const MASTER_INDEX_NAME: &str = "TIndex00.tps";

/// Earliest plausible wall-clock second (2020-01-01 UTC). Records before
/// this are leftovers from an unset RTC and are dropped.
pub const MIN_VALID_TIME: u32 = 1_577_836_800;

/// Channel ids accepted in frame-index records. The vendor headers disagree
/// on which of these is secondary video vs audio; the runtime filter accepts
/// the union.
pub const CH_VIDEO_PRIMARY: u32 = 2;
pub const CH_VIDEO_SECONDARY: u32 = 3;
pub const CH_AUDIO: u32 = 258;

/// Frame types in the frame-index table.
pub const FRAME_TYPE_KEY: u32 = 1;
pub const FRAME_TYPE_PREDICTED: u32 = 2;
pub const FRAME_TYPE_AUDIO: u32 = 3;

/// Whether a frame-index channel id is one of the recognised three.
pub fn is_recognised_channel(channel: u32) -> bool {
    matches!(channel, CH_VIDEO_PRIMARY | CH_VIDEO_SECONDARY | CH_AUDIO)
}

/// Container file name for a segment's `file_index`.
pub fn container_name(file_index: u32) -> String {
    format!("TRec{:06}.tps", file_index)
}
