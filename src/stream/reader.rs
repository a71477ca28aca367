//! Paced-stream NAL reader
//!
//! Owns a read-only container handle and a rolling buffer over the data
//! region. Each call parses out every complete NAL currently buffered; a
//! trailing partial NAL stays in the buffer for the next refill. The
//! absolute position of the buffer head is tracked so every emitted NAL
//! knows its file offset (the audio flush and the fine interpolator both
//! key on it).
//!
//! Start codes locate where NALs begin; where they END comes from the
//! frame index (`FrameBounds`): the data region interleaves μ-law audio
//! between NALs, and running every payload to the next start code would
//! hand those audio bytes to the video decoder.

use std::path::Path;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{DvrError, Result};
use crate::format::{FrameBounds, DATA_REGION_END};
use crate::hevc::{NalScanner, NalUnitType};

/// Rolling buffer high-water mark.
const BUFFER_CAP: usize = 256 * 1024;

/// Refill granularity.
const REFILL_CHUNK: usize = 64 * 1024;

/// Consecutive empty reads before the stream is treated as ended.
const MAX_EMPTY_READS: u32 = 10;

/// A complete NAL lifted out of the rolling buffer.
#[derive(Debug, Clone)]
pub struct OwnedNal {
    /// Absolute container offset of the NAL's start code.
    pub offset: u64,
    pub nal_type: NalUnitType,
    /// Payload without the start code.
    pub payload: Bytes,
}

pub struct StreamReader {
    file: tokio::fs::File,
    buf: Vec<u8>,
    /// Absolute offset of `buf[0]`.
    buffer_start_pos: u64,
    /// Next file read offset.
    read_pos: u64,
    /// NAL payload boundaries from the frame index; empty when the
    /// container never flushed its table (start-code spans then stand).
    bounds: FrameBounds,
    start_time_ms: u64,
    channel: u16,
    eof: bool,
}

impl StreamReader {
    /// Open a reader positioned at `start_offset`, owning its own handle.
    pub async fn open(
        path: &Path,
        start_offset: u64,
        start_time_ms: u64,
        channel: u16,
        bounds: FrameBounds,
    ) -> Result<Self> {
        let mut file = tokio::fs::File::open(path).await.map_err(|e| {
            DvrError::VolumeNotReady(format!("cannot open {}: {}", path.display(), e))
        })?;
        file.seek(std::io::SeekFrom::Start(start_offset))
            .await
            .map_err(DvrError::StreamIo)?;

        Ok(Self {
            file,
            buf: Vec::with_capacity(BUFFER_CAP),
            buffer_start_pos: start_offset,
            read_pos: start_offset,
            bounds,
            start_time_ms,
            channel,
            eof: false,
        })
    }

    pub fn start_time_ms(&self) -> u64 {
        self.start_time_ms
    }

    pub fn channel(&self) -> u16 {
        self.channel
    }

    /// Absolute offset of the next unparsed byte.
    pub fn position(&self) -> u64 {
        self.buffer_start_pos
    }

    /// Next batch of complete NALs, in file order. An empty batch means
    /// end of stream.
    pub async fn next_batch(&mut self) -> Result<Vec<OwnedNal>> {
        loop {
            self.refill().await?;

            let (nals, consumed) = self.extract();
            if consumed > 0 {
                self.buf.drain(..consumed);
                self.buffer_start_pos += consumed as u64;
            }
            if !nals.is_empty() {
                return Ok(nals);
            }
            if self.eof {
                return Ok(Vec::new());
            }
            if self.buf.len() >= BUFFER_CAP {
                // A full window with no start code in it: camera data gap.
                // Keep a tail that could open the next start code.
                let drop = self.buf.len() - 4;
                self.buf.drain(..drop);
                self.buffer_start_pos += drop as u64;
            }
        }
    }

    /// Top the buffer up from the data region.
    async fn refill(&mut self) -> Result<()> {
        if self.eof {
            return Ok(());
        }
        let mut empty_reads = 0u32;
        let mut chunk = vec![0u8; REFILL_CHUNK];
        while self.buf.len() < BUFFER_CAP {
            let remaining = DATA_REGION_END.saturating_sub(self.read_pos);
            if remaining == 0 {
                self.eof = true;
                return Ok(());
            }
            let want = REFILL_CHUNK.min(remaining as usize);
            let n = self.file.read(&mut chunk[..want]).await.map_err(DvrError::StreamIo)?;
            if n == 0 {
                empty_reads += 1;
                if empty_reads >= MAX_EMPTY_READS {
                    self.eof = true;
                    return Ok(());
                }
                continue;
            }
            self.buf.extend_from_slice(&chunk[..n]);
            self.read_pos += n as u64;
        }
        Ok(())
    }

    /// Parse the buffered bytes into complete NALs, each bounded to its
    /// frame-index size so interleaved audio never rides along. Returns
    /// the NALs and how many leading buffer bytes they (plus any skipped
    /// garbage) consumed. At EOF the trailing partial NAL is emitted too.
    fn extract(&self) -> (Vec<OwnedNal>, usize) {
        let mut out = Vec::new();
        let mut consumed = 0usize;

        for nal in NalScanner::new(&self.buf) {
            if !nal.complete && !self.eof {
                // Retain the partial tail; it finishes on the next refill.
                consumed = nal.start;
                break;
            }
            consumed = nal.end();
            if nal.payload.is_empty() {
                continue;
            }

            let start = self.buffer_start_pos + nal.start as u64;
            let scan_end = self.buffer_start_pos + nal.end() as u64;
            let Some(end) = self.bounds.nal_end(start, scan_end, nal.nal_type().is_header())
            else {
                // Interleaved audio that scanned like a NAL; the flusher
                // delivers those bytes through their own records.
                continue;
            };
            let end_rel =
                ((end - self.buffer_start_pos) as usize).clamp(nal.payload_start, nal.end());
            if end_rel == nal.payload_start {
                continue; // corrupt record size; nothing to deliver
            }

            out.push(OwnedNal {
                offset: start,
                nal_type: nal.nal_type(),
                payload: Bytes::copy_from_slice(&self.buf[nal.payload_start..end_rel]),
            });
        }

        (out, consumed)
    }
}

impl std::fmt::Debug for StreamReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamReader")
            .field("position", &self.buffer_start_pos)
            .field("buffered", &self.buf.len())
            .field("eof", &self.eof)
            .finish()
    }
}
