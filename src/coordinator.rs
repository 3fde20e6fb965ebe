//! Dual-earbud coordinator.
//!
//! [`EegBudsService`] finds the LEFT and RIGHT earbuds in one scan, opens
//! both sessions, tells both to start streaming and merges the two
//! notification streams into six-channel records that are posted to the
//! backend once per collection window.
//!
//! The pair is all-or-nothing: if either side fails to connect, or drops
//! later, both sides are torn down and the service returns to
//! [`ConnectionState::Disconnected`].
//!
//! ## Tasks
//!
//! While collecting, three tasks run: one notification pump per side and the
//! batching loop. They share the sample buffer through a `std::sync::Mutex`
//! that is only ever held for a push or a swap. Teardown aborts all of them,
//! so nothing is rescheduled after `disconnect()` returns.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::batch::BatchBuilder;
use crate::config::BudsConfig;
use crate::error::{BudsError, Result};
use crate::parse::parse_frame;
use crate::protocol::{START_STREAMING, STOP_STREAMING};
use crate::session::{DeviceSession, PairCandidates};
use crate::transport::{AdapterEvent, Advertisement, BleCentral, BleLink, ConnectOptions};
use crate::types::{ConnectionState, ConnectionStatus, RawSample, Side};
use crate::uploader::BatchSink;

type StatusListener = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;
type ErrorListener = Arc<dyn Fn(String) + Send + Sync>;

/// Packets logged per side before switching to every 500th.
const VERBOSE_PACKETS: u64 = 3;

// ── EegBudsService ───────────────────────────────────────────────────────────

/// Coordinator for the LEFT + RIGHT earbud pair.
///
/// Cloning is cheap and every clone drives the same pair.
///
/// # Example
///
/// ```no_run
/// use niura_rs::prelude::*;
///
/// # async fn run() -> anyhow::Result<()> {
/// let config = BudsConfig::default();
/// let central = BtleCentral::new().await?;
/// let sink = HttpUploader::new(config.backend_url.clone());
/// let service = EegBudsService::new(central, sink, config);
///
/// service.set_on_connection_status_changed(|s| println!("connected: {}", s.is_connected));
/// service.set_on_error(|msg| eprintln!("error: {msg}"));
/// service.connect().await?;
/// # Ok(())
/// # }
/// ```
pub struct EegBudsService<C: BleCentral, S> {
    core: Arc<Core<C, S>>,
}

impl<C: BleCentral, S> Clone for EegBudsService<C, S> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

struct Core<C: BleCentral, S> {
    central: C,
    sink: S,
    config: BudsConfig,
    state: Mutex<State<C::Link>>,
    listeners: Mutex<Listeners>,
    /// Serialises connect, collection start and teardown.
    ops: tokio::sync::Mutex<()>,
}

struct State<L: BleLink> {
    connection: ConnectionState,
    left: Option<DeviceSession<L>>,
    right: Option<DeviceSession<L>>,
    buffer: Vec<RawSample>,
    batches: BatchBuilder,
    /// Pumps, batching loop and adapter watcher of the current pair.
    tasks: Vec<JoinHandle<()>>,
    /// Bumped on every teardown so stale tasks cannot tear down a newer pair.
    generation: u64,
}

#[derive(Default)]
struct Listeners {
    status: Option<StatusListener>,
    error: Option<ErrorListener>,
}

impl<C: BleCentral, S: BatchSink> EegBudsService<C, S> {
    pub fn new(central: C, sink: S, config: BudsConfig) -> Self {
        let batches = BatchBuilder::new(config.collection_window());
        Self {
            core: Arc::new(Core {
                central,
                sink,
                config,
                state: Mutex::new(State {
                    connection: ConnectionState::Disconnected,
                    left: None,
                    right: None,
                    buffer: Vec::new(),
                    batches,
                    tasks: Vec::new(),
                    generation: 0,
                }),
                listeners: Mutex::new(Listeners::default()),
                ops: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Scan for both earbuds, connect to them and start collecting.
    ///
    /// Any previous pair is released first. On failure the error is passed
    /// to the error listener once, returned, and the service is left
    /// disconnected with no open links.
    ///
    /// Cancel-safe: dropping this future (e.g. under `tokio::time::timeout`)
    /// disconnects any earbud it had already opened, in the background.
    /// Call [`EegBudsService::disconnect`] afterwards to reset the state.
    pub async fn connect(&self) -> Result<()> {
        let _op = self.core.ops.lock().await;
        let result = Arc::clone(&self.core).connect_pair().await;
        if let Err(e) = &result {
            error!("Connecting to earbuds failed: {e}");
            self.core.set_connection(ConnectionState::Disconnected);
            self.core.report_error(e.to_string());
        }
        result
    }

    /// Send START to both earbuds and begin merging their streams.
    ///
    /// Requires both sides to be connected. Does nothing if collection is
    /// already running.
    pub async fn start_data_collection(&self) -> Result<()> {
        let _op = self.core.ops.lock().await;
        Arc::clone(&self.core).start_collection().await
    }

    /// Write a raw command to both earbuds at once.
    pub async fn send_command(&self, command: &[u8]) -> Result<()> {
        let (left, right) = {
            let st = self.core.lock_state();
            match (st.left.clone(), st.right.clone()) {
                (Some(left), Some(right)) => (left, right),
                _ => {
                    return Err(BudsError::NotConnected(
                        "Both earbuds must be connected to send commands",
                    ))
                }
            }
        };
        futures::future::try_join(left.send_command(command), right.send_command(command))
            .await?;
        Ok(())
    }

    /// Stop collecting and release both earbuds.
    ///
    /// Safe to call at any time; with nothing connected it does nothing.
    pub async fn disconnect(&self) -> Result<()> {
        let _op = self.core.ops.lock().await;
        if self.core.teardown().await {
            self.core.notify_status();
        }
        Ok(())
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.core.status()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.core.lock_state().connection
    }

    pub fn is_data_collection_active(&self) -> bool {
        self.connection_state() == ConnectionState::Collecting
    }

    /// Samples received since the last flush.
    pub fn buffered_samples(&self) -> usize {
        self.core.lock_state().buffer.len()
    }

    /// Replace the connection status listener.
    pub fn set_on_connection_status_changed<F>(&self, listener: F)
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        self.core.lock_listeners().status = Some(Arc::new(listener));
    }

    /// Replace the error listener.
    pub fn set_on_error<F>(&self, listener: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.core.lock_listeners().error = Some(Arc::new(listener));
    }
}

// ── Core ─────────────────────────────────────────────────────────────────────

impl<C: BleCentral, S: BatchSink> Core<C, S> {
    fn lock_state(&self) -> MutexGuard<'_, State<C::Link>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_connection(&self, connection: ConnectionState) {
        let mut st = self.lock_state();
        if st.connection != connection {
            debug!("Connection state: {} → {}", st.connection, connection);
            st.connection = connection;
        }
    }

    fn status(&self) -> ConnectionStatus {
        let st = self.lock_state();
        let left_connected = st.left.is_some();
        let right_connected = st.right.is_some();
        ConnectionStatus {
            is_connected: left_connected && right_connected,
            left_connected,
            right_connected,
        }
    }

    fn notify_status(&self) {
        let status = self.status();
        let listener = self.lock_listeners().status.clone();
        if let Some(listener) = listener {
            listener(status);
        }
    }

    fn report_error(&self, message: String) {
        let listener = self.lock_listeners().error.clone();
        if let Some(listener) = listener {
            listener(message);
        }
    }

    // ── connect ──────────────────────────────────────────────────────────────

    async fn connect_pair(self: Arc<Self>) -> Result<()> {
        if self.teardown().await {
            self.notify_status();
        }

        self.set_connection(ConnectionState::Scanning);
        let (left_adv, right_adv) = self.scan_for_pair().await?;

        self.set_connection(ConnectionState::Connecting);
        let timeout = self.config.connect_timeout();
        let opts = ConnectOptions::default();
        let (left, right) = tokio::join!(
            DeviceSession::open(&self.central, self.config.left.clone(), &left_adv, opts, timeout),
            DeviceSession::open(&self.central, self.config.right.clone(), &right_adv, opts, timeout),
        );
        let (left, right) = match (left, right) {
            (Ok(left), Ok(right)) => (left, right),
            (Ok(connected), Err(e)) | (Err(e), Ok(connected)) => {
                connected.close().await;
                return Err(e);
            }
            (Err(e), Err(other)) => {
                debug!("Both earbuds failed to connect; second error: {other}");
                return Err(e);
            }
        };

        let generation = {
            let mut st = self.lock_state();
            st.left = Some(left);
            st.right = Some(right);
            st.connection = ConnectionState::ConnectedBoth;
            st.generation
        };
        info!("Connected to both earbuds");
        self.watch_adapter(generation).await;
        self.notify_status();

        if let Err(e) = Arc::clone(&self).start_collection().await {
            self.teardown().await;
            self.notify_status();
            return Err(e);
        }
        Ok(())
    }

    /// One unfiltered scan until both sides are seen, the deadline passes or
    /// the scan stream ends.
    async fn scan_for_pair(&self) -> Result<(Advertisement, Advertisement)> {
        let scan_timeout = self.config.scan_timeout();
        info!("Scanning for earbuds ({}s) …", scan_timeout.as_secs());

        let mut adverts = self.central.start_scan().await?;
        let mut candidates = PairCandidates::default();
        let deadline = tokio::time::sleep(scan_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    debug!("Pair scan deadline reached");
                    break;
                }
                adv = adverts.recv() => {
                    let Some(adv) = adv else {
                        debug!("Scan stream ended");
                        break;
                    };
                    if let Some(side) = candidates.offer(&adv, &self.config.left, &self.config.right) {
                        info!("Found {side} earbud: {} ({})", adv.display_name(), adv.id);
                    }
                    if candidates.is_complete() {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.central.stop_scan().await {
            warn!("Failed to stop scan: {e}");
        }

        let missing = candidates.missing();
        candidates
            .into_pair()
            .ok_or(BudsError::DevicesNotFound { missing })
    }

    /// Tear the pair down if the adapter powers off while it is connected.
    async fn watch_adapter(self: &Arc<Self>, generation: u64) {
        let mut events = match self.central.adapter_events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Adapter state events unavailable: {e}");
                return;
            }
        };
        let core = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                debug!("Adapter event: {event:?}");
                if event == AdapterEvent::PoweredOff {
                    warn!("Bluetooth adapter powered off");
                    core.schedule_teardown(generation, "Bluetooth adapter powered off".into());
                    break;
                }
            }
        });
        self.lock_state().tasks.push(handle);
    }

    // ── collection ───────────────────────────────────────────────────────────

    async fn start_collection(self: Arc<Self>) -> Result<()> {
        let (left, right, generation) = {
            let mut st = self.lock_state();
            if st.connection == ConnectionState::Collecting {
                debug!("Data collection already running");
                return Ok(());
            }
            let (Some(left), Some(right)) = (st.left.clone(), st.right.clone()) else {
                return Err(BudsError::NotConnected(
                    "Both earbuds must be connected to start data collection",
                ));
            };
            st.buffer.clear();
            st.batches.reset();
            (left, right, st.generation)
        };

        info!("Starting EEG data collection …");
        futures::future::try_join(
            left.send_command(START_STREAMING),
            right.send_command(START_STREAMING),
        )
        .await?;
        let (left_rx, right_rx) =
            futures::future::try_join(left.subscribe(), right.subscribe()).await?;

        let pumps = [
            tokio::spawn(pump(Arc::clone(&self), Side::Left, left_rx, generation)),
            tokio::spawn(pump(Arc::clone(&self), Side::Right, right_rx, generation)),
            tokio::spawn(batch_loop(Arc::clone(&self))),
        ];
        let mut st = self.lock_state();
        st.tasks.extend(pumps);
        st.connection = ConnectionState::Collecting;
        Ok(())
    }

    // ── teardown ─────────────────────────────────────────────────────────────

    /// Stop every task, send STOP if collecting, and close both links.
    ///
    /// Returns `false` when there was nothing to tear down. The caller holds
    /// `ops`.
    async fn teardown(&self) -> bool {
        let (tasks, left, right, was_collecting) = {
            let mut st = self.lock_state();
            st.generation += 1;
            let active = st.left.is_some() || st.right.is_some() || !st.tasks.is_empty();
            if !active {
                st.connection = ConnectionState::Disconnected;
                return false;
            }
            let was_collecting = st.connection == ConnectionState::Collecting;
            st.connection = ConnectionState::Disconnected;
            st.buffer.clear();
            (
                std::mem::take(&mut st.tasks),
                st.left.take(),
                st.right.take(),
                was_collecting,
            )
        };

        info!("Disconnecting from earbuds …");
        for task in tasks {
            task.abort();
        }

        let stop_timeout = self.config.connect_timeout();
        tokio::join!(
            release(left, was_collecting, stop_timeout),
            release(right, was_collecting, stop_timeout),
        );
        true
    }

    /// Tear down from inside a task owned by the pair. Runs on its own task
    /// so teardown can abort the caller.
    fn schedule_teardown(self: &Arc<Self>, generation: u64, reason: String) {
        let core = Arc::clone(self);
        tokio::spawn(async move {
            let _op = core.ops.lock().await;
            if core.lock_state().generation != generation {
                debug!("Ignoring stale teardown: {reason}");
                return;
            }
            if core.teardown().await {
                core.report_error(reason);
                core.notify_status();
            }
        });
    }
}

/// Best-effort STOP, then cancel the link.
async fn release<L: BleLink>(session: Option<DeviceSession<L>>, send_stop: bool, stop_timeout: Duration) {
    let Some(session) = session else {
        return;
    };
    if send_stop {
        let label = &session.profile().label;
        match tokio::time::timeout(stop_timeout, session.send_command(STOP_STREAMING)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("{label}: STOP not delivered: {e}"),
            Err(_) => debug!("{label}: STOP timed out"),
        }
    }
    session.close().await;
}

// ── tasks ────────────────────────────────────────────────────────────────────

/// Decode one side's notifications into the shared buffer until the stream
/// closes.
async fn pump<C: BleCentral, S: BatchSink>(
    core: Arc<Core<C, S>>,
    side: Side,
    mut notifications: mpsc::Receiver<Vec<u8>>,
    generation: u64,
) {
    let mut packets: u64 = 0;
    let mut dropped: u64 = 0;
    while let Some(payload) = notifications.recv().await {
        packets += 1;
        if packets <= VERBOSE_PACKETS || packets % 500 == 0 {
            debug!("{side} packet #{packets}: {} bytes, {dropped} dropped so far", payload.len());
        }
        match parse_frame(&payload, side) {
            Some(sample) => {
                core.lock_state().buffer.push(sample);
            }
            None => dropped += 1,
        }
    }
    warn!("{side} earbud notification stream closed after {packets} packets");
    core.schedule_teardown(generation, format!("{side} earbud disconnected"));
}

/// Every window: swap the buffer out, merge it and hand the batch to the
/// sink. The next window starts after the send completes.
async fn batch_loop<C: BleCentral, S: BatchSink>(core: Arc<Core<C, S>>) {
    let window: Duration = core.config.collection_window();
    loop {
        tokio::time::sleep(window).await;

        let batch = {
            let mut st = core.lock_state();
            let drained = std::mem::take(&mut st.buffer);
            if drained.is_empty() {
                None
            } else {
                let batch = st.batches.build(&drained);
                if batch.is_none() {
                    debug!("No left/right pairs in {} buffered samples", drained.len());
                }
                batch
            }
        };
        let Some(batch) = batch else {
            continue;
        };

        if let Err(e) = core.sink.send(&batch).await {
            warn!("Dropping batch of {} records: {e}", batch.len());
        }
    }
}
