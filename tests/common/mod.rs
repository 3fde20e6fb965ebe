//! In-memory BLE stack and batch sinks shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use niura_rs::batch::Batch;
use niura_rs::error::{BudsError, Result};
use niura_rs::protocol::{
    FRAME_END, FRAME_START, LEFT_DEVICE_NAME, LEFT_SERVICE_UUID, RIGHT_DEVICE_NAME,
    RIGHT_SERVICE_UUID,
};
use niura_rs::transport::{AdapterEvent, Advertisement, BleCentral, BleLink, ConnectOptions};
use niura_rs::uploader::BatchSink;

// ── Advertisements and frames ────────────────────────────────────────────────

pub fn left_adv() -> Advertisement {
    Advertisement {
        id: "AA:00:00:00:00:01".into(),
        name: None,
        local_name: Some(LEFT_DEVICE_NAME.into()),
        services: vec![LEFT_SERVICE_UUID],
    }
}

pub fn right_adv() -> Advertisement {
    Advertisement {
        id: "AA:00:00:00:00:02".into(),
        name: None,
        local_name: Some(RIGHT_DEVICE_NAME.into()),
        services: vec![RIGHT_SERVICE_UUID],
    }
}

pub fn esp32_adv() -> Advertisement {
    Advertisement {
        id: "BB:00:00:00:00:01".into(),
        name: Some("Niura_EEG".into()),
        local_name: None,
        services: vec![],
    }
}

pub fn unrelated_adv() -> Advertisement {
    Advertisement {
        id: "CC:00:00:00:00:01".into(),
        name: Some("Muse-1234".into()),
        local_name: None,
        services: vec![],
    }
}

/// A well-formed 15-byte frame carrying three signed 24-bit values.
pub fn frame(seq: u8, channels: [i32; 3]) -> Vec<u8> {
    let mut f = vec![FRAME_START, seq];
    for (i, value) in channels.iter().enumerate() {
        let raw = (*value as u32) & 0x00FF_FFFF;
        f.push(i as u8);
        f.extend_from_slice(&raw.to_be_bytes()[1..]);
    }
    f.push(FRAME_END);
    f
}

// ── MockLink ─────────────────────────────────────────────────────────────────

/// Test-side view of one connection.
pub struct LinkState {
    pub id: String,
    pub opts: ConnectOptions,
    connected: AtomicBool,
    discover_fails: AtomicBool,
    discover_delay: Duration,
    discovers: AtomicUsize,
    writes: Mutex<Vec<(Uuid, Uuid, Vec<u8>)>>,
    notify_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
}

impl LinkState {
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().iter().map(|(_, _, d)| d.clone()).collect()
    }

    pub fn write_targets(&self) -> Vec<(Uuid, Uuid)> {
        self.writes.lock().unwrap().iter().map(|(s, c, _)| (*s, *c)).collect()
    }

    pub fn discovers(&self) -> usize {
        self.discovers.load(Ordering::SeqCst)
    }

    pub fn set_discover_fails(&self, fails: bool) {
        self.discover_fails.store(fails, Ordering::SeqCst);
    }

    /// Deliver one notification to the subscriber.
    pub async fn notify(&self, payload: Vec<u8>) {
        let tx = self.notify_tx.lock().unwrap().clone();
        tx.expect("nobody subscribed")
            .send(payload)
            .await
            .expect("subscriber gone");
    }

    /// Simulate the peripheral going away: the link reports disconnected and
    /// the notification stream closes.
    pub fn drop_link(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.notify_tx.lock().unwrap().take();
    }
}

pub struct MockLink {
    state: Arc<LinkState>,
}

#[async_trait]
impl BleLink for MockLink {
    fn id(&self) -> String {
        self.state.id.clone()
    }

    async fn discover(&self) -> Result<()> {
        self.state.discovers.fetch_add(1, Ordering::SeqCst);
        if !self.state.discover_delay.is_zero() {
            tokio::time::sleep(self.state.discover_delay).await;
        }
        if self.state.discover_fails.load(Ordering::SeqCst) {
            return Err(BudsError::Bluetooth("discovery failed".into()));
        }
        Ok(())
    }

    async fn write_without_response(
        &self,
        service: Uuid,
        characteristic: Uuid,
        data: &[u8],
    ) -> Result<()> {
        if !self.state.is_connected() {
            return Err(BudsError::NotConnected("link is down"));
        }
        self.state
            .writes
            .lock()
            .unwrap()
            .push((service, characteristic, data.to_vec()));
        Ok(())
    }

    async fn subscribe(&self, _service: Uuid, _characteristic: Uuid) -> Result<mpsc::Receiver<Vec<u8>>> {
        let (tx, rx) = mpsc::channel(64);
        *self.state.notify_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn is_connected(&self) -> bool {
        self.state.is_connected()
    }

    async fn disconnect(&self) -> Result<()> {
        self.state.drop_link();
        Ok(())
    }
}

// ── MockCentral ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct CentralState {
    adverts: Mutex<Vec<Advertisement>>,
    scan_senders: Mutex<Vec<mpsc::Sender<Advertisement>>>,
    scans: AtomicUsize,
    stop_scans: AtomicUsize,
    failing_connect: Mutex<HashSet<String>>,
    hanging_connect: Mutex<HashSet<String>>,
    failing_discover: Mutex<HashSet<String>>,
    slow_discover: Mutex<HashMap<String, Duration>>,
    links: Mutex<HashMap<String, Vec<Arc<LinkState>>>>,
    adapter_senders: Mutex<Vec<mpsc::Sender<AdapterEvent>>>,
}

/// Scans report every registered advertisement at once and then stay open
/// until `stop_scan`, so scan deadlines are exercised.
#[derive(Clone, Default)]
pub struct MockCentral {
    state: Arc<CentralState>,
}

impl MockCentral {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_adverts(adverts: impl IntoIterator<Item = Advertisement>) -> Self {
        let central = Self::new();
        for adv in adverts {
            central.advertise(adv);
        }
        central
    }

    pub fn advertise(&self, adv: Advertisement) {
        self.state.adverts.lock().unwrap().push(adv);
    }

    pub fn fail_connect(&self, id: &str) {
        self.state.failing_connect.lock().unwrap().insert(id.into());
    }

    pub fn hang_connect(&self, id: &str) {
        self.state.hanging_connect.lock().unwrap().insert(id.into());
    }

    pub fn fail_discover(&self, id: &str) {
        self.state.failing_discover.lock().unwrap().insert(id.into());
    }

    /// Every discovery on links to `id` takes `delay`.
    pub fn slow_discover(&self, id: &str, delay: Duration) {
        self.state.slow_discover.lock().unwrap().insert(id.into(), delay);
    }

    /// Most recent link opened to `id`.
    pub fn link(&self, id: &str) -> Arc<LinkState> {
        self.links(id).pop().expect("no link opened")
    }

    /// Every link opened to `id`, oldest first.
    pub fn links(&self, id: &str) -> Vec<Arc<LinkState>> {
        self.state
            .links
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn scans(&self) -> usize {
        self.state.scans.load(Ordering::SeqCst)
    }

    pub fn stop_scans(&self) -> usize {
        self.state.stop_scans.load(Ordering::SeqCst)
    }

    pub async fn power_off(&self) {
        let senders = self.state.adapter_senders.lock().unwrap().clone();
        for tx in senders {
            let _ = tx.send(AdapterEvent::PoweredOff).await;
        }
    }
}

#[async_trait]
impl BleCentral for MockCentral {
    type Link = MockLink;

    async fn start_scan(&self) -> Result<mpsc::Receiver<Advertisement>> {
        self.state.scans.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(64);
        for adv in self.state.adverts.lock().unwrap().iter() {
            let _ = tx.try_send(adv.clone());
        }
        self.state.scan_senders.lock().unwrap().push(tx);
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<()> {
        self.state.stop_scans.fetch_add(1, Ordering::SeqCst);
        self.state.scan_senders.lock().unwrap().clear();
        Ok(())
    }

    async fn connect(&self, peripheral: &Advertisement, opts: ConnectOptions) -> Result<MockLink> {
        let id = peripheral.id.clone();
        if self.state.hanging_connect.lock().unwrap().contains(&id) {
            std::future::pending::<()>().await;
        }
        if self.state.failing_connect.lock().unwrap().contains(&id) {
            return Err(BudsError::Bluetooth(format!("connect to {id} refused")));
        }
        let state = Arc::new(LinkState {
            id: id.clone(),
            opts,
            connected: AtomicBool::new(true),
            discover_fails: AtomicBool::new(self.state.failing_discover.lock().unwrap().contains(&id)),
            discover_delay: self
                .state
                .slow_discover
                .lock()
                .unwrap()
                .get(&id)
                .copied()
                .unwrap_or_default(),
            discovers: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
            notify_tx: Mutex::new(None),
        });
        self.state
            .links
            .lock()
            .unwrap()
            .entry(id)
            .or_default()
            .push(Arc::clone(&state));
        Ok(MockLink { state })
    }

    async fn adapter_events(&self) -> Result<mpsc::Receiver<AdapterEvent>> {
        let (tx, rx) = mpsc::channel(8);
        self.state.adapter_senders.lock().unwrap().push(tx);
        Ok(rx)
    }
}

// ── Sinks ────────────────────────────────────────────────────────────────────

/// Keeps every batch it is given.
#[derive(Clone, Default)]
pub struct RecordingSink {
    batches: Arc<Mutex<Vec<Batch>>>,
}

impl RecordingSink {
    pub fn batches(&self) -> Vec<Batch> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl BatchSink for RecordingSink {
    async fn send(&self, batch: &Batch) -> Result<()> {
        self.batches.lock().unwrap().push(batch.clone());
        Ok(())
    }
}

/// Rejects every batch the way a backend answering 500 would.
#[derive(Clone, Default)]
pub struct FailingSink {
    calls: Arc<AtomicUsize>,
}

impl FailingSink {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchSink for FailingSink {
    async fn send(&self, _batch: &Batch) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(BudsError::HttpStatus {
            status: 500,
            reason: "Internal Server Error".into(),
        })
    }
}

/// Collects listener callbacks.
#[derive(Clone, Default)]
pub struct Events<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T: Clone + Send + 'static> Events<T> {
    pub fn push(&self, item: T) {
        self.items.lock().unwrap().push(item);
    }

    pub fn all(&self) -> Vec<T> {
        self.items.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}
