//! Error type shared by the coordinator, the background monitor and the
//! btleplug backend.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::types::Side;

/// Everything that can go wrong while finding, connecting to, or streaming
/// from the earbuds.
///
/// Malformed frames are deliberately absent: the decoder drops them and
/// never reports them as errors.
#[derive(Debug, Error)]
pub enum BudsError {
    /// Platform BLE stack error (adapter missing, connect refused, GATT
    /// failure, ...).
    #[error("bluetooth error: {0}")]
    Bluetooth(String),

    /// A bounded BLE operation did not complete in time.
    #[error("{operation} timed out after {}s", .timeout.as_secs_f64())]
    Timeout {
        operation: String,
        timeout: Duration,
    },

    /// The pair scan ended without finding every side.
    #[error(
        "Could not find {} earbud(s). Make sure both earbuds are powered on and in pairing mode.",
        describe_sides(.missing)
    )]
    DevicesNotFound { missing: Vec<Side> },

    /// The background monitor's scan found no acceptable device.
    #[error("no matching device found after {}s", .timeout.as_secs_f64())]
    DeviceNotFound { timeout: Duration },

    /// Discovery finished but the expected characteristic is absent.
    #[error("characteristic {characteristic} not found in service {service}")]
    CharacteristicNotFound { service: Uuid, characteristic: Uuid },

    /// The profile declares no write characteristic to send commands to.
    #[error("{0} has no command characteristic")]
    NoCommandCharacteristic(String),

    /// The operation needs an established connection.
    #[error("{0}")]
    NotConnected(&'static str),

    /// The underlying BLE stack handle was released by `cleanup()`.
    #[error("BLE stack has been released")]
    Released,

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a non-2xx status.
    #[error("HTTP {status}: {reason}")]
    HttpStatus { status: u16, reason: String },

    #[error("invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    /// A settings value is out of range.
    #[error("invalid setting: {0}")]
    InvalidSetting(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<btleplug::Error> for BudsError {
    fn from(e: btleplug::Error) -> Self {
        BudsError::Bluetooth(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BudsError>;

fn describe_sides(sides: &[Side]) -> String {
    sides
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(" and ")
}
