//! `btleplug` implementation of the transport traits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::{BudsError, Result};
use crate::transport::{AdapterEvent, Advertisement, BleCentral, BleLink, ConnectOptions};

const CHANNEL_CAPACITY: usize = 256;

/// Hard ceiling on `discover_services()`.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── BtleCentral ──────────────────────────────────────────────────────────────

/// The first Bluetooth adapter on this machine.
pub struct BtleCentral {
    adapter: Adapter,
    /// Everything seen by a scan, so `connect` can find it again by id.
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleCentral {
    /// Open the first adapter.
    ///
    /// On macOS, `CBCentralManager` starts in an unknown state and drops
    /// scans issued before it reaches *PoweredOn*, so this waits up to 3 s
    /// for that transition.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| BudsError::Bluetooth("No Bluetooth adapter found".into()))?;

        #[cfg(target_os = "macos")]
        {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
            loop {
                match adapter.adapter_state().await {
                    Ok(CentralState::PoweredOn) => {
                        info!("macOS: adapter is PoweredOn");
                        break;
                    }
                    Ok(state) if tokio::time::Instant::now() >= deadline => {
                        warn!("macOS: adapter still in state {state:?} after 3 s, proceeding anyway");
                        break;
                    }
                    Ok(state) => debug!("macOS: adapter state = {state:?}, waiting…"),
                    Err(e) => {
                        warn!("macOS: adapter_state() error: {e}");
                        break;
                    }
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }

        Ok(Self {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            scan_task: Mutex::new(None),
        })
    }
}

async fn advertisement(peripheral: &Peripheral) -> Option<Advertisement> {
    let props = peripheral.properties().await.ok().flatten()?;
    Some(Advertisement {
        id: peripheral.id().to_string(),
        name: None,
        local_name: props.local_name,
        services: props.services,
    })
}

#[async_trait]
impl BleCentral for BtleCentral {
    type Link = BtleLink;

    async fn start_scan(&self) -> Result<mpsc::Receiver<Advertisement>> {
        let mut events = self.adapter.events().await?;
        self.adapter.start_scan(ScanFilter::default()).await?;
        debug!("Scan started");

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

        // Peripherals the OS already knows about may never produce a fresh
        // DeviceDiscovered event.
        for p in self.adapter.peripherals().await.unwrap_or_default() {
            if let Some(adv) = advertisement(&p).await {
                lock(&self.peripherals).insert(adv.id.clone(), p);
                let _ = tx.try_send(adv);
            }
        }

        let adapter = self.adapter.clone();
        let known = Arc::clone(&self.peripherals);
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ServicesAdvertisement { id, .. } => id,
                    _ => continue,
                };
                let Ok(p) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Some(adv) = advertisement(&p).await else {
                    continue;
                };
                lock(&known).insert(adv.id.clone(), p);
                if tx.send(adv).await.is_err() {
                    break;
                }
            }
        });
        if let Some(old) = lock(&self.scan_task).replace(task) {
            old.abort();
        }
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<()> {
        if let Some(task) = lock(&self.scan_task).take() {
            task.abort();
        }
        self.adapter.stop_scan().await?;
        debug!("Scan stopped");
        Ok(())
    }

    async fn connect(&self, adv: &Advertisement, opts: ConnectOptions) -> Result<BtleLink> {
        let peripheral = lock(&self.peripherals)
            .get(&adv.id)
            .cloned()
            .ok_or_else(|| BudsError::Bluetooth(format!("peripheral {} was not seen by a scan", adv.id)))?;
        if opts.auto_connect {
            debug!("auto_connect is not supported by btleplug; connecting once");
        }
        peripheral.connect().await?;
        Ok(BtleLink {
            id: peripheral.id(),
            peripheral,
            adapter: self.adapter.clone(),
            discovered: AtomicBool::new(false),
            forwarders: Mutex::new(Vec::new()),
        })
    }

    async fn adapter_events(&self) -> Result<mpsc::Receiver<AdapterEvent>> {
        let mut events = self.adapter.events().await?;
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let mapped = match event {
                    CentralEvent::StateUpdate(CentralState::PoweredOn) => AdapterEvent::PoweredOn,
                    CentralEvent::StateUpdate(CentralState::PoweredOff) => AdapterEvent::PoweredOff,
                    _ => continue,
                };
                if tx.send(mapped).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }
}

// ── BtleLink ─────────────────────────────────────────────────────────────────

pub struct BtleLink {
    id: PeripheralId,
    peripheral: Peripheral,
    adapter: Adapter,
    discovered: AtomicBool,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl BtleLink {
    fn find_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<Characteristic> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or(BudsError::CharacteristicNotFound {
                service,
                characteristic,
            })
    }
}

#[async_trait]
impl BleLink for BtleLink {
    fn id(&self) -> String {
        self.id.to_string()
    }

    async fn discover(&self) -> Result<()> {
        // BlueZ reports the connection before its GATT cache is filled; an
        // immediate discover_services() can come back empty.
        #[cfg(target_os = "linux")]
        if !self.discovered.load(Ordering::Relaxed) {
            tokio::time::sleep(Duration::from_millis(600)).await;
        }

        tokio::time::timeout(DISCOVERY_TIMEOUT, self.peripheral.discover_services())
            .await
            .map_err(|_| BudsError::Timeout {
                operation: "discover_services()".into(),
                timeout: DISCOVERY_TIMEOUT,
            })??;
        self.discovered.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn write_without_response(
        &self,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<()> {
        let c = self.find_characteristic(service, characteristic)?;
        self.peripheral
            .write(&c, data, WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<mpsc::Receiver<Vec<u8>>> {
        let c = self.find_characteristic(service, characteristic)?;
        self.peripheral.subscribe(&c).await?;

        let mut notifications = self.peripheral.notifications().await?;
        let mut adapter_events = self.adapter.events().await?;
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let id = self.id.clone();

        // Ends, and so closes `rx`, on DeviceDisconnected or when the
        // notification stream itself finishes.
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    notif = notifications.next() => {
                        let Some(notif) = notif else { break };
                        if notif.uuid != characteristic {
                            continue;
                        }
                        if tx.send(notif.value).await.is_err() {
                            break;
                        }
                    }
                    event = adapter_events.next() => {
                        match event {
                            Some(CentralEvent::DeviceDisconnected(gone)) if gone == id => {
                                info!("Device {id} disconnected");
                                break;
                            }
                            Some(_) => {}
                            None => break,
                        }
                    }
                }
            }
        });
        lock(&self.forwarders).push(task);
        Ok(rx)
    }

    async fn is_connected(&self) -> bool {
        self.peripheral.is_connected().await.unwrap_or(false)
    }

    async fn disconnect(&self) -> Result<()> {
        for task in lock(&self.forwarders).drain(..) {
            task.abort();
        }
        self.peripheral.disconnect().await?;
        Ok(())
    }
}
