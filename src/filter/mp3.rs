//! MPEG audio frame filter
//!
//! Detects physical MPEG-1/2/2.5 audio frames (layer I/II/III) by header
//! inspection: sync pattern, then bitrate/samplerate table lookup to compute
//! the frame length. Logical frames that span several physical frames are
//! not reassembled; consumers receive physical frames.

use super::{FrameFilter, Scan};

const LAYER_I: u8 = 3;
const LAYER_III: u8 = 1;
const VERSION_1: u8 = 3;

// Bitrate tables in kbit/s, indexed by the 4-bit bitrate field. Index 0 is
// the free-format escape and index 15 is reserved; both are rejected.
const V1L1_BITRATE: [u32; 16] = [
    0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448, 0,
];
const V1L2_BITRATE: [u32; 16] = [
    0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 0,
];
const V1L3_BITRATE: [u32; 16] = [
    0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 0,
];
const V2L1_BITRATE: [u32; 16] = [
    0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256, 0,
];
const V2L2_BITRATE: [u32; 16] = [
    0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160, 0,
];

const INVALID: &[u32] = &[];

// Indexed by the 2-bit version field, then the 2-bit layer field. Version 1
// is reserved, layer 0 is reserved.
const BITRATE_TABLE: [[&[u32]; 4]; 4] = [
    [INVALID, &V2L2_BITRATE, &V2L2_BITRATE, &V2L1_BITRATE], // MPEG-2.5
    [INVALID, INVALID, INVALID, INVALID],
    [INVALID, &V2L2_BITRATE, &V2L2_BITRATE, &V2L1_BITRATE], // MPEG-2
    [INVALID, &V1L3_BITRATE, &V1L2_BITRATE, &V1L1_BITRATE], // MPEG-1
];

// Indexed by the 2-bit version field, then the 2-bit samplerate field.
const SAMPLERATE_TABLE: [&[u32]; 4] = [
    &[11025, 12000, 8000], // MPEG-2.5
    INVALID,
    &[22050, 24000, 16000], // MPEG-2
    &[44100, 48000, 32000], // MPEG-1
];

const VERSION_NAME: [&str; 4] = ["2.5", "", "2.0", "1.0"];
const LAYER_NAME: [&str; 4] = ["", "III", "II", "I"];

/// MPEG audio physical-frame boundary filter. Stateless across frames.
pub struct Mp3Filter;

impl FrameFilter for Mp3Filter {
    fn scan(&mut self, buf: &[u8]) -> Scan {
        if buf.len() < 4 {
            return Scan::Short;
        }
        if buf[0] != 0xff || buf[1] & 0xe0 != 0xe0 {
            return Scan::Invalid;
        }
        let version = (buf[1] >> 3) & 3;
        let layer = (buf[1] >> 1) & 3;

        let bitrates = BITRATE_TABLE[version as usize][layer as usize];
        let rate = ((buf[2] >> 4) & 15) as usize;
        if bitrates.len() <= rate || bitrates[rate] == 0 {
            return Scan::Invalid;
        }
        let bitrate = bitrates[rate] as usize * 1000;

        let samplerates = SAMPLERATE_TABLE[version as usize];
        let rate = ((buf[2] >> 2) & 3) as usize;
        if samplerates.len() <= rate {
            return Scan::Invalid;
        }
        let samplerate = samplerates[rate] as usize;

        let padding = ((buf[2] >> 1) & 1) as usize;
        let frame_size = if layer == LAYER_I {
            (12 * bitrate / samplerate + padding) * 4
        } else if layer == LAYER_III && version != VERSION_1 {
            // MPEG-2 and MPEG-2.5 layer III frames are half the size of
            // other layer II/III frames.
            72 * bitrate / samplerate + padding
        } else {
            144 * bitrate / samplerate + padding
        };

        if frame_size > buf.len() {
            return Scan::Short;
        }
        tracing::trace!(
            frame_size,
            len = buf.len(),
            version = VERSION_NAME[version as usize],
            layer = LAYER_NAME[layer as usize],
            bitrate,
            samplerate,
            padding,
            "mpeg frame"
        );
        Scan::Accept(frame_size)
    }
}
