use std::fmt;

use serde::Serialize;

/// Which earbud a sample or peripheral belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Left, Side::Right];

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }

    pub fn other(self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded 15-byte frame from a single earbud.
///
/// Produced by [`crate::parse::parse_frame`]; lives in the coordinator's
/// collection buffer until the next flush merges or discards it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSample {
    /// Capture time assigned on arrival, `YYYY-MM-DD HH:MM:SS.mmm` local time.
    /// The earbuds do not transmit a clock.
    pub timestamp: String,
    /// On-device packet counter (wraps 255 → 0).
    pub sequence: u8,
    /// Three signed 24-bit channel values, in frame order.
    pub channels: [i32; 3],
    pub side: Side,
}

/// A six-channel snapshot built from the LEFT and RIGHT samples that share a
/// buffer position.
///
/// Channels 0–2 come from the left earbud, 3–5 from the right. The two halves
/// are paired by arrival order only and are not guaranteed to have been
/// captured at the same instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedRecord {
    /// Timestamp of the left-hand sample.
    pub timestamp: String,
    /// Sequence number of the left-hand sample.
    pub sequence: u8,
    pub channels: [i32; 6],
}

impl MergedRecord {
    /// Combine one left and one right sample.
    ///
    /// Returns `None` unless `left` really is a left sample and `right` a
    /// right one.
    pub fn pair(left: &RawSample, right: &RawSample) -> Option<Self> {
        if left.side != Side::Left || right.side != Side::Right {
            return None;
        }
        let [l1, l2, l3] = left.channels;
        let [r1, r2, r3] = right.channels;
        Some(Self {
            timestamp: left.timestamp.clone(),
            sequence: left.sequence,
            channels: [l1, l2, l3, r1, r2, r3],
        })
    }
}

/// Coordinator lifecycle.
///
/// ```text
/// Disconnected → Scanning → Connecting → ConnectedBoth → Collecting
///       ↑____________________________________________________|
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Scanning,
    Connecting,
    ConnectedBoth,
    Collecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Scanning => "scanning",
            ConnectionState::Connecting => "connecting",
            ConnectionState::ConnectedBoth => "connected",
            ConnectionState::Collecting => "collecting",
        };
        f.write_str(s)
    }
}

/// Read-only connection snapshot handed to status listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ConnectionStatus {
    pub is_connected: bool,
    pub left_connected: bool,
    pub right_connected: bool,
}
