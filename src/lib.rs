//! # niura-rs
//!
//! Async Rust library and CLI for streaming EEG from Niura earbuds over
//! Bluetooth Low Energy.
//!
//! The earbuds are two independent peripherals, one per ear, each streaming
//! three channels in fixed 15-byte frames. [`coordinator::EegBudsService`]
//! connects to both, merges their streams into six-channel records and posts
//! one batch to the backend every collection window.
//! [`monitor::BackgroundMonitor`] is a separate watchdog that keeps a single
//! ESP32 board connected and forwards its raw notifications.
//!
//! ## Supported hardware
//!
//! | Device | Advertised name | Channels | Commands |
//! |---|---|---|---|
//! | Left earbud | `Niura EEG BUDS L` | 3 | `b\r` start, `s\r` stop |
//! | Right earbud | `Niura EEG BUDS R` | 3 | `b\r` start, `s\r` stop |
//! | ESP32 board | `ESP32`, `Niura_EEG`, … | raw text | none |
//!
//! ## Quick start
//!
//! ```no_run
//! use niura_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = BudsConfig::default();
//!     let sink = HttpUploader::new(config.backend_url.clone());
//!     let service = EegBudsService::new(BtleCentral::new().await?, sink, config);
//!
//!     service.set_on_error(|msg| eprintln!("{msg}"));
//!     service.connect().await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     service.disconnect().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`prelude`] | One-line glob import of the most commonly needed types |
//! | [`coordinator`] | Dual-earbud connect, merge, batch and upload |
//! | [`monitor`] | Single-device reconnect watchdog |
//! | [`session`] | Device matching and one connected peripheral |
//! | [`transport`] | BLE traits the services are written against |
//! | [`btle`] | `btleplug` implementation of [`transport`] |
//! | [`parse`] | 15-byte frame decoder |
//! | [`batch`] | Index pairing and batch payloads |
//! | [`uploader`] | HTTP delivery of batches |
//! | [`protocol`] | GATT UUIDs, device names, commands and timing constants |
//! | [`config`] | Serde-backed settings with defaults |
//! | [`types`] | Samples, records and connection state |
//! | [`error`] | [`error::BudsError`] |

pub mod batch;
pub mod btle;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod monitor;
pub mod parse;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod types;
pub mod uploader;

// ── Prelude ───────────────────────────────────────────────────────────────────

/// Convenience re-exports for downstream crates.
pub mod prelude {
    // ── Services ──────────────────────────────────────────────────────────────
    pub use crate::btle::{BtleCentral, BtleLink};
    pub use crate::coordinator::EegBudsService;
    pub use crate::monitor::BackgroundMonitor;
    pub use crate::uploader::{BatchSink, HttpUploader};

    // ── Configuration and errors ──────────────────────────────────────────────
    pub use crate::config::{AppConfig, BudsConfig, MonitorConfig};
    pub use crate::error::{BudsError, Result};
    pub use crate::session::DeviceProfile;

    // ── Data types ────────────────────────────────────────────────────────────
    pub use crate::batch::Batch;
    pub use crate::types::{ConnectionState, ConnectionStatus, MergedRecord, RawSample, Side};
}
