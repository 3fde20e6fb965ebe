//! GATT UUIDs, frame layout, timing constants and commands for Niura earbuds
//! and the single-stream ESP32 board.
//!
//! Each earbud exposes its own Nordic-UART-style service: the host writes
//! ASCII commands to the RX characteristic and receives binary frames on
//! the TX characteristic. Left lives in the `6e4000xx` range, right in
//! `6e4001xx`.

use uuid::Uuid;

// ── Left earbud ──────────────────────────────────────────────────────────────

/// Advertised name of the left earbud.
pub const LEFT_DEVICE_NAME: &str = "Niura EEG BUDS L";

pub const LEFT_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);

/// Command channel (host → earbud), write without response.
pub const LEFT_RX_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);

/// Frame stream (earbud → host), notify.
pub const LEFT_TX_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

// ── Right earbud ─────────────────────────────────────────────────────────────

/// Advertised name of the right earbud.
pub const RIGHT_DEVICE_NAME: &str = "Niura EEG BUDS R";

pub const RIGHT_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e400101_b5a3_f393_e0a9_e50e24dcca9e);

pub const RIGHT_RX_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x6e400102_b5a3_f393_e0a9_e50e24dcca9e);

pub const RIGHT_TX_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0x6e400103_b5a3_f393_e0a9_e50e24dcca9e);

// ── Single-stream ESP32 board (background monitor) ───────────────────────────

pub const ESP32_SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);

/// Data characteristic carrying the board's text payloads.
pub const ESP32_DATA_CHARACTERISTIC: Uuid =
    Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8);

/// Names the board has been seen advertising under.
pub const ESP32_DEVICE_NAMES: [&str; 5] =
    ["ESP32", "ESP32_EEG", "ESP32-BLE", "NIURA-ESP32", "Niura_EEG"];

/// Any name containing this fragment is also accepted.
pub const ESP32_NAME_FRAGMENT: &str = "ESP32";

// ── Frame layout ─────────────────────────────────────────────────────────────

/// Every notification on a TX characteristic is exactly one frame:
///
/// ```text
/// [0]      0xA0 start marker
/// [1]      sequence number (wraps at 255)
/// [2..6]   ch1: index, high, mid, low
/// [6..10]  ch2: index, high, mid, low
/// [10..14] ch3: index, high, mid, low
/// [14]     0xC0 end marker
/// ```
pub const FRAME_LEN: usize = 15;
pub const FRAME_START: u8 = 0xA0;
pub const FRAME_END: u8 = 0xC0;

/// Byte offsets of the three channel blocks (each `index, high, mid, low`).
pub const CHANNEL_OFFSETS: [usize; 3] = [2, 6, 10];

/// Channels per earbud.
pub const CHANNELS_PER_SIDE: usize = 3;

/// Channels in a merged record (left 1-3, right 4-6).
pub const MERGED_CHANNELS: usize = 2 * CHANNELS_PER_SIDE;

/// Timestamp layout the backend parses, `YYYY-MM-DD HH:MM:SS.mmm`.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

// ── Timing ───────────────────────────────────────────────────────────────────

/// Length of one collection window.
pub const COLLECTION_WINDOW_MS: u64 = 2000;

/// Upper bound for a single peripheral connect.
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Upper bound for finding both earbuds.
pub const PAIR_SCAN_TIMEOUT_SECS: u64 = 30;

// ── Backend ──────────────────────────────────────────────────────────────────

/// Bulk ingestion endpoint for merged batches.
pub const DEFAULT_BACKEND_URL: &str = "http://192.168.1.42:8000/api/eeg/bulk";

// ── Commands ─────────────────────────────────────────────────────────────────

/// Start streaming frames (`b` + CR, hex `62 0D`).
pub const START_STREAMING: &[u8] = b"b\r";

/// Stop streaming frames (`s` + CR, hex `73 0D`).
pub const STOP_STREAMING: &[u8] = b"s\r";

/// Encode a one-letter command for an earbud RX characteristic: the ASCII
/// letter followed by a carriage return.
///
/// ```
/// # use niura_rs::protocol::{encode_command, START_STREAMING};
/// assert_eq!(encode_command('b'), START_STREAMING);
/// ```
pub fn encode_command(cmd: char) -> Vec<u8> {
    format!("{cmd}\r").into_bytes()
}
