//! Configuration for the dual-earbud coordinator and the background monitor.
//!
//! Both structs default to the values the earbuds and backend expect, so
//! `Default::default()` is a working setup. A JSON file may override any
//! subset of fields:
//!
//! ```json
//! {
//!   "buds": { "backend_url": "http://localhost:8000/api/eeg/bulk" },
//!   "monitor": { "poll_interval_ms": 500 }
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BudsError, Result};
use crate::protocol::{
    COLLECTION_WINDOW_MS, CONNECT_TIMEOUT_SECS, DEFAULT_BACKEND_URL, PAIR_SCAN_TIMEOUT_SECS,
};
use crate::session::DeviceProfile;

// ── BudsConfig ───────────────────────────────────────────────────────────────

/// Configuration for [`crate::coordinator::EegBudsService`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudsConfig {
    pub left: DeviceProfile,
    pub right: DeviceProfile,
    /// How long to look for both earbuds before giving up. Default: `30`.
    pub scan_timeout_secs: u64,
    /// Per-earbud connect deadline. Default: `10`.
    pub connect_timeout_secs: u64,
    /// Length of one collection window. Default: `2000`.
    pub collection_window_ms: u64,
    /// Where merged batches are POSTed.
    pub backend_url: String,
}

impl Default for BudsConfig {
    fn default() -> Self {
        Self {
            left: DeviceProfile::left_bud(),
            right: DeviceProfile::right_bud(),
            scan_timeout_secs: PAIR_SCAN_TIMEOUT_SECS,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            collection_window_ms: COLLECTION_WINDOW_MS,
            backend_url: DEFAULT_BACKEND_URL.into(),
        }
    }
}

impl BudsConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Never shorter than 1 ms.
    pub fn collection_window(&self) -> Duration {
        Duration::from_millis(self.collection_window_ms.max(1))
    }
}

// ── MonitorConfig ────────────────────────────────────────────────────────────

/// Configuration for [`crate::monitor::BackgroundMonitor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub device: DeviceProfile,
    /// Delay between watchdog iterations. Default: `1000`.
    pub poll_interval_ms: u64,
    /// Reconnect attempts allowed per cooldown window. Default: `3`.
    pub max_attempts: u32,
    /// Pause once the attempts are used up. Default: `60`.
    pub cooldown_secs: u64,
    /// Scan length for one reconnect attempt. Default: `10`.
    pub scan_timeout_secs: u64,
    /// Connect deadline for one reconnect attempt. Default: `5`.
    pub connect_timeout_secs: u64,
    /// Base back-off after a failed iteration, multiplied by
    /// `attempts + 1`. Default: `5000`.
    pub error_backoff_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            device: DeviceProfile::esp32(),
            poll_interval_ms: 1000,
            max_attempts: 3,
            cooldown_secs: 60,
            scan_timeout_secs: 10,
            connect_timeout_secs: 5,
            error_backoff_ms: 5000,
        }
    }
}

impl MonitorConfig {
    /// Never shorter than 1 ms.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

// ── AppConfig ────────────────────────────────────────────────────────────────

/// Both configurations, as stored in a settings file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub buds: BudsConfig,
    pub monitor: MonitorConfig,
}

impl AppConfig {
    /// Read a JSON settings file. Missing fields keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    /// Parse and validate settings. Zero-length windows and poll intervals
    /// are rejected.
    pub fn from_json(contents: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buds.collection_window_ms == 0 {
            return Err(BudsError::InvalidSetting(
                "buds.collection_window_ms must be greater than zero".into(),
            ));
        }
        if self.monitor.poll_interval_ms == 0 {
            return Err(BudsError::InvalidSetting(
                "monitor.poll_interval_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
