//! One peripheral's worth of BLE plumbing: matching advertisements,
//! connecting with a deadline, discovery, command writes and notification
//! subscription.
//!
//! A session never retries. Retry policy lives in the dual coordinator and
//! the background monitor.
//!
//! A link is owned by its session from the moment `connect` returns. If the
//! last handle is dropped without [`DeviceSession::close`] (an aborted task,
//! a cancelled `connect()` future) the link is disconnected in the
//! background, so cancellation never leaves a peripheral connected.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{BudsError, Result};
use crate::protocol::{
    ESP32_DATA_CHARACTERISTIC, ESP32_DEVICE_NAMES, ESP32_NAME_FRAGMENT, ESP32_SERVICE_UUID,
    LEFT_DEVICE_NAME, LEFT_RX_CHARACTERISTIC, LEFT_SERVICE_UUID, LEFT_TX_CHARACTERISTIC,
    RIGHT_DEVICE_NAME, RIGHT_RX_CHARACTERISTIC, RIGHT_SERVICE_UUID, RIGHT_TX_CHARACTERISTIC,
};
use crate::transport::{Advertisement, BleCentral, BleLink, ConnectOptions};
use crate::types::Side;

// ── DeviceProfile ────────────────────────────────────────────────────────────

/// How to recognise a peripheral and which GATT endpoints to use on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    /// Name used in logs and error messages.
    pub label: String,
    /// Exact names (compared case-insensitively) the device advertises.
    #[serde(default)]
    pub device_names: Vec<String>,
    /// Any advertised name containing one of these is accepted as well.
    #[serde(default)]
    pub name_fragments: Vec<String>,
    pub service_uuid: Uuid,
    /// Command characteristic; `None` for notify-only devices.
    #[serde(default)]
    pub write_characteristic: Option<Uuid>,
    pub notify_characteristic: Uuid,
}

impl DeviceProfile {
    /// The left earbud.
    pub fn left_bud() -> Self {
        Self {
            label: LEFT_DEVICE_NAME.into(),
            device_names: vec![LEFT_DEVICE_NAME.into()],
            name_fragments: vec![],
            service_uuid: LEFT_SERVICE_UUID,
            write_characteristic: Some(LEFT_RX_CHARACTERISTIC),
            notify_characteristic: LEFT_TX_CHARACTERISTIC,
        }
    }

    /// The right earbud.
    pub fn right_bud() -> Self {
        Self {
            label: RIGHT_DEVICE_NAME.into(),
            device_names: vec![RIGHT_DEVICE_NAME.into()],
            name_fragments: vec![],
            service_uuid: RIGHT_SERVICE_UUID,
            write_characteristic: Some(RIGHT_RX_CHARACTERISTIC),
            notify_characteristic: RIGHT_TX_CHARACTERISTIC,
        }
    }

    /// The single-stream ESP32 board watched by the background monitor.
    pub fn esp32() -> Self {
        Self {
            label: "ESP32".into(),
            device_names: ESP32_DEVICE_NAMES.iter().map(|s| s.to_string()).collect(),
            name_fragments: vec![ESP32_NAME_FRAGMENT.into()],
            service_uuid: ESP32_SERVICE_UUID,
            write_characteristic: None,
            notify_characteristic: ESP32_DATA_CHARACTERISTIC,
        }
    }

    /// `true` if `adv` advertises one of our names, contains one of our name
    /// fragments, or lists our service UUID.
    pub fn matches(&self, adv: &Advertisement) -> bool {
        // Uuid equality is case-insensitive by construction.
        self.matches_name(adv) || adv.services.contains(&self.service_uuid)
    }

    /// Name-only test: the GAP name or local name equals one of our names or
    /// contains one of our fragments.
    pub fn matches_name(&self, adv: &Advertisement) -> bool {
        let names = [adv.name.as_deref(), adv.local_name.as_deref()];
        names.iter().flatten().any(|name| {
            self.device_names
                .iter()
                .any(|n| n.eq_ignore_ascii_case(name))
                || self
                    .name_fragments
                    .iter()
                    .any(|f| !f.is_empty() && name.contains(f.as_str()))
        })
    }
}

// ── Classification ───────────────────────────────────────────────────────────

/// Outcome of testing one advertisement against both earbud profiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Side(Side),
    /// Matched both profiles; never used.
    Ambiguous,
    Unrelated,
}

pub fn classify(adv: &Advertisement, left: &DeviceProfile, right: &DeviceProfile) -> Classification {
    match (left.matches(adv), right.matches(adv)) {
        (true, true) => Classification::Ambiguous,
        (true, false) => Classification::Side(Side::Left),
        (false, true) => Classification::Side(Side::Right),
        (false, false) => Classification::Unrelated,
    }
}

/// Candidates collected during one pair scan.
///
/// The first peripheral classified for a side keeps it; later candidates for
/// that side are ignored, and a peripheral already holding one side is never
/// assigned the other.
#[derive(Debug, Default)]
pub struct PairCandidates {
    left: Option<Advertisement>,
    right: Option<Advertisement>,
}

impl PairCandidates {
    /// Offer one advertisement. Returns the side it was assigned to, if any.
    pub fn offer(
        &mut self,
        adv: &Advertisement,
        left: &DeviceProfile,
        right: &DeviceProfile,
    ) -> Option<Side> {
        let side = match classify(adv, left, right) {
            Classification::Side(side) => side,
            Classification::Ambiguous => {
                warn!(
                    "Ignoring {} ({}): matches both left and right",
                    adv.display_name(),
                    adv.id
                );
                return None;
            }
            Classification::Unrelated => return None,
        };

        let taken_by_other = self
            .get(side.other())
            .is_some_and(|other| other.id == adv.id);
        let slot = match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        };
        if slot.is_some() || taken_by_other {
            return None;
        }
        *slot = Some(adv.clone());
        Some(side)
    }

    pub fn get(&self, side: Side) -> Option<&Advertisement> {
        match side {
            Side::Left => self.left.as_ref(),
            Side::Right => self.right.as_ref(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.left.is_some() && self.right.is_some()
    }

    /// Sides still without a candidate.
    pub fn missing(&self) -> Vec<Side> {
        Side::BOTH
            .into_iter()
            .filter(|&s| self.get(s).is_none())
            .collect()
    }

    /// Both candidates, once complete.
    pub fn into_pair(self) -> Option<(Advertisement, Advertisement)> {
        Some((self.left?, self.right?))
    }
}

// ── DeviceSession ────────────────────────────────────────────────────────────

/// Disconnects the link when the last session handle goes away unless
/// [`DeviceSession::close`] already did.
struct CloseOnDrop<L: BleLink> {
    link: Arc<L>,
    label: String,
    armed: AtomicBool,
}

impl<L: BleLink> CloseOnDrop<L> {
    fn disarm(&self) {
        self.armed.store(false, Ordering::SeqCst);
    }
}

impl<L: BleLink> Drop for CloseOnDrop<L> {
    fn drop(&mut self) {
        if !*self.armed.get_mut() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("{}: dropped outside a runtime, link left open", self.label);
            return;
        };
        debug!("{}: session dropped while open, disconnecting", self.label);
        let link = Arc::clone(&self.link);
        let label = std::mem::take(&mut self.label);
        runtime.spawn(async move {
            if let Err(e) = link.disconnect().await {
                debug!("{label}: disconnect of dropped session failed: {e}");
            }
        });
    }
}

/// A connected, fully discovered peripheral.
pub struct DeviceSession<L: BleLink> {
    profile: DeviceProfile,
    link: Arc<L>,
    guard: Arc<CloseOnDrop<L>>,
}

impl<L: BleLink> Clone for DeviceSession<L> {
    fn clone(&self) -> Self {
        Self {
            profile: self.profile.clone(),
            link: Arc::clone(&self.link),
            guard: Arc::clone(&self.guard),
        }
    }
}

impl<L: BleLink> DeviceSession<L> {
    /// Connect to `adv` within `connect_timeout`, then discover all services.
    ///
    /// If discovery fails the fresh connection is cancelled before the error
    /// is returned, so a failed open never leaves a link behind. Dropping
    /// the future mid-discovery cancels it too.
    pub async fn open<C>(
        central: &C,
        profile: DeviceProfile,
        adv: &Advertisement,
        opts: ConnectOptions,
        connect_timeout: Duration,
    ) -> Result<Self>
    where
        C: BleCentral<Link = L>,
    {
        info!("Connecting to {} ({}) …", profile.label, adv.id);
        let link = tokio::time::timeout(connect_timeout, central.connect(adv, opts))
            .await
            .map_err(|_| BudsError::Timeout {
                operation: format!("connect to {}", profile.label),
                timeout: connect_timeout,
            })??;
        let link = Arc::new(link);
        let session = Self {
            guard: Arc::new(CloseOnDrop {
                link: Arc::clone(&link),
                label: profile.label.clone(),
                armed: AtomicBool::new(true),
            }),
            profile,
            link,
        };

        if let Err(e) = session.link.discover().await {
            warn!("{}: service discovery failed: {e}", session.profile.label);
            session.close().await;
            return Err(e);
        }
        info!("Connected and services discovered: {}", session.profile.label);
        Ok(session)
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    /// Fire-and-forget write to the command characteristic.
    pub async fn send_command(&self, command: &[u8]) -> Result<()> {
        let characteristic = self
            .profile
            .write_characteristic
            .ok_or_else(|| BudsError::NoCommandCharacteristic(self.profile.label.clone()))?;
        debug!("{}: sending command {:02x?}", self.profile.label, command);
        self.link
            .write_without_response(self.profile.service_uuid, characteristic, command)
            .await
    }

    /// Subscribe to the notify characteristic.
    pub async fn subscribe(&self) -> Result<mpsc::Receiver<Vec<u8>>> {
        self.link
            .subscribe(self.profile.service_uuid, self.profile.notify_characteristic)
            .await
    }

    /// Re-run discovery as a lightweight "is the peripheral still answering"
    /// probe.
    pub async fn check_alive(&self) -> Result<()> {
        if !self.link.is_connected().await {
            return Err(BudsError::NotConnected("link is down"));
        }
        self.link.discover().await
    }

    /// Cancel the connection. Errors are logged, not returned.
    pub async fn close(&self) {
        self.guard.disarm();
        match self.link.disconnect().await {
            Ok(()) => info!("Disconnected from {}", self.profile.label),
            Err(e) => warn!("{}: disconnect failed: {e}", self.profile.label),
        }
    }
}
