//! Wire framing and session JSON
//!
//! Binary frames go to the browser decoder big-endian: a 4-byte magic,
//! a millisecond timestamp, a type/format field, a payload length and the
//! raw payload (NAL units are sent without their start codes). JSON text
//! messages carry commands in and stream lifecycle events out.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::hevc::NalUnitType;

/// G.711 μ-law as the device records it.
pub const AUDIO_FORMAT: &str = "g711u";
pub const AUDIO_SAMPLE_RATE: u16 = 8000;

/// Base video rate; the pacing interval is `1 / (BASE_FPS * speed)`.
pub const BASE_FPS: f64 = 25.0;

/// Wire type byte of a video frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Predicted = 0,
    Key = 1,
    Vps = 2,
    Sps = 3,
    Pps = 4,
}

impl FrameKind {
    /// Wire kind for a NAL type; `None` for NALs that are not forwarded.
    pub fn from_nal(t: NalUnitType) -> Option<FrameKind> {
        match t {
            NalUnitType::Vps => Some(FrameKind::Vps),
            NalUnitType::Sps => Some(FrameKind::Sps),
            NalUnitType::Pps => Some(FrameKind::Pps),
            t if t.is_key() => Some(FrameKind::Key),
            t if t.is_video() => Some(FrameKind::Predicted),
            _ => None,
        }
    }
}

/// `H265` frame: magic, timestamp_ms u64, frame_type u8, data_len u32,
/// payload.
pub fn encode_video_frame(kind: FrameKind, timestamp_ms: u64, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + 8 + 1 + 4 + payload.len());
    buf.put_slice(b"H265");
    buf.put_u64(timestamp_ms);
    buf.put_u8(kind as u8);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// `G711` frame: magic, timestamp_ms u64, sample_rate u16, data_len u32,
/// payload.
pub fn encode_audio_frame(timestamp_ms: u64, sample_rate: u16, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + 8 + 2 + 4 + payload.len());
    buf.put_slice(b"G711");
    buf.put_u64(timestamp_ms);
    buf.put_u16(sample_rate);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Client → server commands.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Command {
    Play {
        channel: u16,
        timestamp: u32,
        #[serde(default = "default_speed")]
        speed: f64,
        #[serde(default)]
        audio: bool,
    },
    Seek {
        channel: u16,
        timestamp: u32,
        #[serde(default = "default_speed")]
        speed: f64,
        #[serde(default)]
        audio: bool,
    },
    Pause {},
    Speed { rate: f64 },
}

fn default_speed() -> f64 {
    1.0
}

/// Server → client lifecycle messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    StreamStart {
        channel: u16,
        segment_start: u32,
        segment_end: u32,
        actual_start_time: u32,
        has_audio: bool,
        audio_format: &'static str,
        audio_sample_rate: u16,
    },
    StreamEnd {},
}
