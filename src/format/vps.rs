//! VPS position scanner
//!
//! Byte-scans a container's data region for every `00 00 00 01 40`
//! sequence (Annex-B start code + HEVC NAL type 32). The device emits a
//! fresh VPS at the head of every GOP, so the hit list doubles as the
//! I-frame position list for seeking. Duplicates are expected and kept.

use std::io::{Read, Seek, SeekFrom};

use super::DATA_REGION_END;
use crate::error::Result;

/// Scan window size. Larger windows do not help on the USB-attached media
/// this runs against; 4 MiB keeps peak memory flat.
const WINDOW_SIZE: usize = 4 * 1024 * 1024;

/// Overlap so a pattern straddling a window boundary is still seen.
const WINDOW_OVERLAP: usize = 4;

/// The 5-byte VPS start sequence.
const VPS_PATTERN: [u8; 5] = [0x00, 0x00, 0x00, 0x01, 0x40];

/// Scan the data region `[0, DATA_REGION_END)` and return the absolute
/// byte offset of every VPS start sequence, in file order.
pub fn scan_vps_positions<R: Read + Seek>(r: &mut R) -> Result<Vec<u32>> {
    let mut positions = Vec::new();
    let mut window = vec![0u8; WINDOW_SIZE];
    let mut pos: u64 = 0;

    while pos < DATA_REGION_END {
        let want = WINDOW_SIZE.min((DATA_REGION_END - pos) as usize);
        r.seek(SeekFrom::Start(pos))?;
        let got = read_up_to(r, &mut window[..want])?;
        if got < VPS_PATTERN.len() {
            break;
        }

        scan_window(&window[..got], pos, &mut positions);

        if got < want {
            break; // short container, EOF
        }
        pos += (got - WINDOW_OVERLAP) as u64;
    }

    tracing::debug!(count = positions.len(), "VPS scan complete");
    Ok(positions)
}

fn scan_window(window: &[u8], base: u64, out: &mut Vec<u32>) {
    let mut i = 0;
    while i + VPS_PATTERN.len() <= window.len() {
        if window[i..i + VPS_PATTERN.len()] == VPS_PATTERN {
            let absolute = base + i as u64;
            if absolute < DATA_REGION_END {
                out.push(absolute as u32);
            }
            i += VPS_PATTERN.len();
        } else {
            i += 1;
        }
    }
}

/// `read` loop tolerating short reads.
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
