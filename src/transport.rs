//! The seam between session logic and a concrete BLE stack.
//!
//! [`crate::btle`] implements these traits on `btleplug`; tests use an
//! in-memory double. Everything above this module (sessions, the dual
//! coordinator, the background monitor) only sees these traits.

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;

/// What a scan reports about one nearby peripheral.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Advertisement {
    /// Platform identifier (UUID on macOS/Windows, MAC address on Linux).
    pub id: String,
    /// GAP device name, when the platform reports it separately.
    pub name: Option<String>,
    /// Name from the advertising payload.
    pub local_name: Option<String>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
}

impl Advertisement {
    /// Best human-readable label for logs.
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .or(self.local_name.as_deref())
            .unwrap_or("Unknown")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Ask the stack to keep reconnecting on its own when the link drops.
    pub auto_connect: bool,
}

/// Adapter-level notifications independent of any one peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterEvent {
    PoweredOn,
    PoweredOff,
}

/// A BLE central (adapter) able to scan and open links.
#[async_trait]
pub trait BleCentral: Send + Sync + 'static {
    type Link: BleLink;

    /// Start an unfiltered scan. Advertisements arrive on the returned
    /// channel until [`BleCentral::stop_scan`] is called or the receiver is
    /// dropped.
    async fn start_scan(&self) -> Result<mpsc::Receiver<Advertisement>>;

    async fn stop_scan(&self) -> Result<()>;

    /// Connect to a previously advertised peripheral. No timeout is applied
    /// here; callers bound it themselves.
    async fn connect(&self, peripheral: &Advertisement, opts: ConnectOptions)
        -> Result<Self::Link>;

    /// Adapter power-state changes.
    async fn adapter_events(&self) -> Result<mpsc::Receiver<AdapterEvent>>;
}

/// One connected peripheral.
#[async_trait]
pub trait BleLink: Send + Sync + 'static {
    fn id(&self) -> String;

    /// Discover every service and characteristic. Also used as a cheap
    /// liveness probe on an established link.
    async fn discover(&self) -> Result<()>;

    async fn write_without_response(
        &self,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<()>;

    /// Enable notifications on a characteristic. Each value arrives as one
    /// message; the channel closes when the link goes down.
    async fn subscribe(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>>;

    async fn is_connected(&self) -> bool;

    /// Cancel the connection. Safe to call on a link that already dropped.
    async fn disconnect(&self) -> Result<()>;
}
