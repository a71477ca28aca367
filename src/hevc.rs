//! H.265 Annex-B bytestream helpers
//!
//! The containers hold a single-layer HEVC bytestream with `00 00 00 01`
//! start codes (the encoder occasionally emits the short `00 00 01` form).
//! This module finds start codes, classifies NAL units and extracts the
//! decoder prologue (VPS/SPS/PPS + IDR) needed to start playback at an
//! arbitrary point.

use bytes::Bytes;

/// HEVC NAL unit types observed in this device class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    TrailN,
    TrailR,
    IdrWRadl,
    IdrNLp,
    Vps,
    Sps,
    Pps,
    Other(u8),
}

impl NalUnitType {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => NalUnitType::TrailN,
            1 => NalUnitType::TrailR,
            19 => NalUnitType::IdrWRadl,
            20 => NalUnitType::IdrNLp,
            32 => NalUnitType::Vps,
            33 => NalUnitType::Sps,
            34 => NalUnitType::Pps,
            other => NalUnitType::Other(other),
        }
    }

    /// Decoder parameter set (VPS/SPS/PPS).
    pub fn is_header(self) -> bool {
        matches!(self, NalUnitType::Vps | NalUnitType::Sps | NalUnitType::Pps)
    }

    /// IDR picture.
    pub fn is_key(self) -> bool {
        matches!(self, NalUnitType::IdrWRadl | NalUnitType::IdrNLp)
    }

    /// Coded picture (key or trailing).
    pub fn is_video(self) -> bool {
        self.is_key() || matches!(self, NalUnitType::TrailN | NalUnitType::TrailR)
    }
}

impl std::fmt::Display for NalUnitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NalUnitType::TrailN => write!(f, "TRAIL_N"),
            NalUnitType::TrailR => write!(f, "TRAIL_R"),
            NalUnitType::IdrWRadl => write!(f, "IDR_W_RADL"),
            NalUnitType::IdrNLp => write!(f, "IDR_N_LP"),
            NalUnitType::Vps => write!(f, "VPS"),
            NalUnitType::Sps => write!(f, "SPS"),
            NalUnitType::Pps => write!(f, "PPS"),
            NalUnitType::Other(t) => write!(f, "NAL({})", t),
        }
    }
}

/// NAL type from the first payload byte: `(byte >> 1) & 0x3F`.
pub fn nal_type(first_payload_byte: u8) -> NalUnitType {
    NalUnitType::from_raw((first_payload_byte >> 1) & 0x3F)
}

/// Find the next Annex-B start code at or after `from`.
///
/// Returns `(code_start, code_len)` with `code_len` 3 or 4. The four-byte
/// form is preferred when a zero precedes a three-byte match.
pub fn next_start_code(buf: &[u8], from: usize) -> Option<(usize, usize)> {
    if buf.len() < 3 {
        return None;
    }
    let mut i = from;
    while i + 3 <= buf.len() {
        if buf[i] == 0 && buf[i + 1] == 0 {
            if buf[i + 2] == 1 {
                return Some((i, 3));
            }
            if i + 4 <= buf.len() && buf[i + 2] == 0 && buf[i + 3] == 1 {
                return Some((i, 4));
            }
            // Two zeros not followed by a code; the second zero may still
            // open the next one.
            i += 1;
        } else if buf[i + 2] == 0 {
            i += 1;
        } else {
            i += 3;
        }
    }
    None
}

/// One NAL unit located in a buffer.
#[derive(Debug, Clone, Copy)]
pub struct Nal<'a> {
    /// Offset of the start code within the scanned buffer.
    pub start: usize,
    /// Offset of the first payload byte (past the start code).
    pub payload_start: usize,
    /// Payload without the start code.
    pub payload: &'a [u8],
    /// Whether the payload was terminated by a following start code.
    /// A `false` here means the NAL runs to the end of the buffer and may
    /// be truncated.
    pub complete: bool,
}

impl Nal<'_> {
    pub fn nal_type(&self) -> NalUnitType {
        self.payload.first().map(|&b| nal_type(b)).unwrap_or(NalUnitType::Other(63))
    }

    /// Offset just past the payload.
    pub fn end(&self) -> usize {
        self.payload_start + self.payload.len()
    }
}

/// Iterator over the NAL units of an Annex-B buffer.
pub struct NalScanner<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> NalScanner<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }
}

impl<'a> Iterator for NalScanner<'a> {
    type Item = Nal<'a>;

    fn next(&mut self) -> Option<Nal<'a>> {
        let (start, code_len) = next_start_code(self.buf, self.pos)?;
        let payload_start = start + code_len;
        let (payload_end, complete) = match next_start_code(self.buf, payload_start) {
            Some((next, _)) => (next, true),
            None => (self.buf.len(), false),
        };
        self.pos = payload_end;
        Some(Nal {
            start,
            payload_start,
            payload: &self.buf[payload_start..payload_end],
            complete,
        })
    }
}

/// The decoder prologue for a playback start point.
#[derive(Debug, Clone)]
pub struct VideoHeader {
    pub vps: Bytes,
    pub sps: Bytes,
    pub pps: Bytes,
    pub idr: Bytes,
    /// Offset of the IDR's start code within the scanned buffer.
    pub idr_offset: usize,
    /// Offset within the scanned buffer just past the IDR payload. Playback
    /// of trailing pictures resumes here.
    pub end_offset: usize,
}

/// Extract the first VPS/SPS/PPS (in that order) followed by the first
/// subsequent IDR. Returns `None` if any of the four is missing before the
/// end of the buffer.
///
/// Payloads run to the next start code. When the surrounding bytestream
/// interleaves non-NAL data (this device's containers do), use
/// [`extract_video_header_with`] and a boundary callback so payloads end
/// where the frame index says the frame ends.
pub fn extract_video_header(buf: &[u8]) -> Option<VideoHeader> {
    extract_video_header_with(buf, |nal| Some(nal.end()))
}

/// [`extract_video_header`] with caller-supplied payload bounds.
///
/// `payload_end` maps each scanned NAL to the buffer offset its payload
/// really ends at, or `None` to discard the NAL as not-a-frame (a span of
/// interleaved audio that happened to scan like one).
pub fn extract_video_header_with(
    buf: &[u8],
    payload_end: impl Fn(&Nal) -> Option<usize>,
) -> Option<VideoHeader> {
    let mut vps: Option<&[u8]> = None;
    let mut sps: Option<&[u8]> = None;
    let mut pps: Option<&[u8]> = None;

    for nal in NalScanner::new(buf) {
        let Some(end) = payload_end(&nal) else { continue };
        let end = end.clamp(nal.payload_start, nal.end());
        let payload = &buf[nal.payload_start..end];

        match nal.nal_type() {
            NalUnitType::Vps if vps.is_none() => vps = Some(payload),
            NalUnitType::Sps if vps.is_some() && sps.is_none() => sps = Some(payload),
            NalUnitType::Pps if sps.is_some() && pps.is_none() => pps = Some(payload),
            t if t.is_key() && pps.is_some() => {
                return Some(VideoHeader {
                    vps: Bytes::copy_from_slice(vps?),
                    sps: Bytes::copy_from_slice(sps?),
                    pps: Bytes::copy_from_slice(pps?),
                    idr: Bytes::copy_from_slice(payload),
                    idr_offset: nal.start,
                    end_offset: end,
                });
            }
            _ => {}
        }
    }
    None
}
