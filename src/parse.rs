//! Binary decoder for earbud notification payloads.
//!
//! Every function here is pure apart from [`parse_frame`], which reads the
//! local wall clock to stamp the sample. Frames are untrusted: length and
//! both marker bytes are checked before any field is read, and anything
//! malformed is dropped with a debug log rather than reported as an error.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Local};
use log::debug;

use crate::protocol::{
    CHANNEL_OFFSETS, CHANNELS_PER_SIDE, FRAME_END, FRAME_LEN, FRAME_START, TIMESTAMP_FORMAT,
};
use crate::types::{RawSample, Side};

const SIGN_BIT: u32 = 1 << 23;
const FULL_SCALE: i64 = 1 << 24;

// ── Fields ───────────────────────────────────────────────────────────────────

/// Interpret three big-endian bytes as a two's-complement 24-bit integer.
///
/// ```
/// # use niura_rs::parse::decode_signed_24bit;
/// assert_eq!(decode_signed_24bit([0x00, 0x00, 0x01]), 1);
/// assert_eq!(decode_signed_24bit([0xFF, 0xFF, 0xFF]), -1);
/// assert_eq!(decode_signed_24bit([0x80, 0x00, 0x00]), -8_388_608);
/// ```
pub fn decode_signed_24bit(bytes: [u8; 3]) -> i32 {
    let raw = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]);
    if raw >= SIGN_BIT {
        (raw as i64 - FULL_SCALE) as i32
    } else {
        raw as i32
    }
}

/// Render a wall-clock instant the way the ingestion backend expects it.
pub fn format_timestamp(at: &DateTime<Local>) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

// ── Frames ───────────────────────────────────────────────────────────────────

/// Decode one frame, stamping it with the current local time.
///
/// Returns `None` for anything that is not a well-formed 15-byte frame.
pub fn parse_frame(data: &[u8], side: Side) -> Option<RawSample> {
    parse_frame_at(data, side, format_timestamp(&Local::now()))
}

/// Decode one frame with an explicit timestamp.
///
/// The per-channel index byte that precedes each 3-byte value is not
/// interpreted. The sequence byte is taken as-is; gaps are not detected.
pub fn parse_frame_at(data: &[u8], side: Side, timestamp: String) -> Option<RawSample> {
    if data.len() != FRAME_LEN {
        debug!("{side}: dropping frame of {} bytes, expected {FRAME_LEN}", data.len());
        return None;
    }
    if data[0] != FRAME_START {
        debug!("{side}: invalid frame start 0x{:02x}", data[0]);
        return None;
    }
    if data[FRAME_LEN - 1] != FRAME_END {
        debug!("{side}: invalid frame end 0x{:02x}", data[FRAME_LEN - 1]);
        return None;
    }

    let mut channels = [0i32; CHANNELS_PER_SIDE];
    for (value, &off) in channels.iter_mut().zip(CHANNEL_OFFSETS.iter()) {
        // off is the index byte; the value follows it.
        *value = decode_signed_24bit([data[off + 1], data[off + 2], data[off + 3]]);
    }

    Some(RawSample {
        timestamp,
        sequence: data[1],
        channels,
        side,
    })
}

/// Decode a base64-encoded characteristic value (as mobile BLE stacks and
/// captured traces deliver it) and parse the resulting frame.
pub fn decode_base64_frame(encoded: &str, side: Side) -> Option<RawSample> {
    match STANDARD.decode(encoded.trim()) {
        Ok(bytes) => parse_frame(&bytes, side),
        Err(e) => {
            debug!("{side}: payload is not valid base64: {e}");
            None
        }
    }
}
