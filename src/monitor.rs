//! Background watchdog that keeps one notify-only device connected.
//!
//! [`BackgroundMonitor`] runs a poll loop: when the device is missing it
//! scans and reconnects (limited by a [`RetryBudget`]); when connected it
//! re-runs service discovery as a liveness probe and drops the link if the
//! probe fails. Every notification is forwarded to the data callback as a
//! lossily decoded UTF-8 string.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::MonitorConfig;
use crate::error::{BudsError, Result};
use crate::session::DeviceSession;
use crate::transport::{AdapterEvent, BleCentral, BleLink, ConnectOptions};

type DataCallback = Arc<dyn Fn(String) + Send + Sync>;

// ── RetryBudget ──────────────────────────────────────────────────────────────

/// What the watchdog should do about a missing device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try to reconnect; `attempt` is 1-based within the current window.
    Attempt { attempt: u32 },
    /// Attempts used up: sleep the cooldown, then start over.
    CoolDown,
}

/// Reconnect attempts allowed per cooldown window.
///
/// A window opens at the first attempt and is extended by every later one.
/// Once `cooldown` has elapsed since the window was last touched, the count
/// starts again from zero.
#[derive(Debug, Clone)]
pub struct RetryBudget {
    max_attempts: u32,
    cooldown: Duration,
    attempts: u32,
    last_attempt: Option<Instant>,
}

impl RetryBudget {
    pub fn new(max_attempts: u32, cooldown: Duration) -> Self {
        Self {
            max_attempts,
            cooldown,
            attempts: 0,
            last_attempt: None,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn decide(&mut self, now: Instant) -> RetryDecision {
        let stale = self
            .last_attempt
            .map_or(true, |at| now.saturating_duration_since(at) > self.cooldown);
        if stale {
            self.attempts = 0;
            self.last_attempt = Some(now);
        }
        if self.attempts < self.max_attempts {
            RetryDecision::Attempt {
                attempt: self.attempts + 1,
            }
        } else {
            RetryDecision::CoolDown
        }
    }

    /// Count an attempt, successful or not.
    pub fn record_attempt(&mut self, now: Instant) {
        self.attempts += 1;
        self.last_attempt = Some(now);
    }

    /// The cooldown sleep finished.
    pub fn cooled_down(&mut self) {
        self.attempts = 0;
    }

    /// The device answered; forget every earlier attempt.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.last_attempt = None;
    }
}

// ── BackgroundMonitor ────────────────────────────────────────────────────────

/// Single-device watchdog.
///
/// Cloning is cheap and every clone controls the same loop.
pub struct BackgroundMonitor<C: BleCentral> {
    inner: Arc<Inner<C>>,
}

impl<C: BleCentral> Clone for BackgroundMonitor<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<C: BleCentral> {
    config: MonitorConfig,
    /// `None` once `cleanup()` has released the stack.
    central: Mutex<Option<Arc<C>>>,
    state: Mutex<MonitorState<C::Link>>,
    callback: Mutex<Option<DataCallback>>,
}

struct MonitorState<L: BleLink> {
    task: Option<JoinHandle<()>>,
    adapter_watch: Option<JoinHandle<()>>,
    session: Option<DeviceSession<L>>,
    forwarder: Option<JoinHandle<()>>,
    scanning: bool,
}

impl<C: BleCentral> BackgroundMonitor<C> {
    pub fn new(central: C, config: MonitorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                central: Mutex::new(Some(Arc::new(central))),
                state: Mutex::new(MonitorState {
                    task: None,
                    adapter_watch: None,
                    session: None,
                    forwarder: None,
                    scanning: false,
                }),
                callback: Mutex::new(None),
            }),
        }
    }

    /// Replace the callback that receives every notification payload.
    pub fn set_data_callback<F>(&self, callback: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        *self
            .inner
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(callback));
    }

    /// Spawn the watchdog loop. Does nothing if it is already running.
    pub fn start(&self) -> Result<()> {
        let central = self.inner.central()?;
        let mut st = self.inner.lock_state();
        if st.task.as_ref().is_some_and(|t| !t.is_finished()) {
            info!("Background monitor already running");
            return Ok(());
        }
        info!("Starting background monitor for {}", self.inner.config.device.label);
        st.task = Some(tokio::spawn(run(Arc::clone(&self.inner), central)));
        Ok(())
    }

    /// Stop the watchdog loop. An established connection stays open.
    pub async fn stop(&self) {
        let (task, watch, scanning) = {
            let mut st = self.inner.lock_state();
            let scanning = std::mem::take(&mut st.scanning);
            (st.task.take(), st.adapter_watch.take(), scanning)
        };
        if task.is_none() {
            return;
        }
        for handle in task.into_iter().chain(watch) {
            handle.abort();
        }
        if scanning {
            if let Ok(central) = self.inner.central() {
                if let Err(e) = central.stop_scan().await {
                    debug!("Stopping in-flight scan: {e}");
                }
            }
        }
        info!("Background monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .lock_state()
            .task
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// `true` while a device session is held.
    pub fn is_connected(&self) -> bool {
        self.inner.lock_state().session.is_some()
    }

    /// Stop everything, close the device and release the BLE stack.
    ///
    /// Idempotent. After cleanup, [`BackgroundMonitor::start`] returns
    /// [`BudsError::Released`].
    pub async fn cleanup(&self) {
        self.stop().await;
        self.inner.drop_session().await;
        if self
            .inner
            .central
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            info!("BLE stack released");
        }
    }
}

// ── loop ─────────────────────────────────────────────────────────────────────

impl<C: BleCentral> Inner<C> {
    fn lock_state(&self) -> MutexGuard<'_, MonitorState<C::Link>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn central(&self) -> Result<Arc<C>> {
        self.central
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(BudsError::Released)
    }

    /// One watchdog pass.
    async fn iterate(self: &Arc<Self>, central: &C, budget: &mut RetryBudget) -> Result<()> {
        let session = self.lock_state().session.clone();
        let Some(session) = session else {
            match budget.decide(Instant::now()) {
                RetryDecision::Attempt { attempt } => {
                    info!(
                        "Attempting to reconnect, attempt {attempt}/{}",
                        self.config.max_attempts
                    );
                    budget.record_attempt(Instant::now());
                    self.scan_and_connect(central).await?;
                }
                RetryDecision::CoolDown => {
                    info!(
                        "Max retry attempts reached, cooling down for {}s",
                        self.config.cooldown_secs
                    );
                    tokio::time::sleep(self.config.cooldown()).await;
                    budget.cooled_down();
                }
            }
            return Ok(());
        };

        match session.check_alive().await {
            Ok(()) => budget.reset(),
            Err(e) => {
                warn!("Lost contact with {}: {e}", session.profile().label);
                self.drop_session().await;
            }
        }
        Ok(())
    }

    async fn scan_and_connect(self: &Arc<Self>, central: &C) -> Result<()> {
        let profile = &self.config.device;
        let scan_timeout = self.config.scan_timeout();

        let mut adverts = central.start_scan().await?;
        self.lock_state().scanning = true;
        let found = tokio::time::timeout(scan_timeout, async {
            while let Some(adv) = adverts.recv().await {
                if profile.matches_name(&adv) {
                    return Some(adv);
                }
            }
            None
        })
        .await;
        self.lock_state().scanning = false;
        if let Err(e) = central.stop_scan().await {
            warn!("Failed to stop scan: {e}");
        }

        let Ok(Some(adv)) = found else {
            return Err(BudsError::DeviceNotFound {
                timeout: scan_timeout,
            });
        };
        info!("Found {} ({})", adv.display_name(), adv.id);

        let opts = ConnectOptions { auto_connect: true };
        let session =
            DeviceSession::open(central, profile.clone(), &adv, opts, self.config.connect_timeout())
                .await?;
        let notifications = match session.subscribe().await {
            Ok(rx) => rx,
            Err(e) => {
                session.close().await;
                return Err(e);
            }
        };

        let forwarder = tokio::spawn(forward(Arc::clone(self), notifications));
        let mut st = self.lock_state();
        st.session = Some(session);
        st.forwarder = Some(forwarder);
        info!("Monitoring {}", profile.label);
        Ok(())
    }

    /// Forget the current device: stop forwarding and cancel the link.
    async fn drop_session(&self) {
        let (session, forwarder) = {
            let mut st = self.lock_state();
            (st.session.take(), st.forwarder.take())
        };
        if let Some(forwarder) = forwarder {
            forwarder.abort();
        }
        if let Some(session) = session {
            session.close().await;
        }
    }

    async fn watch_adapter(self: &Arc<Self>, central: &C) {
        let mut events = match central.adapter_events().await {
            Ok(events) => events,
            Err(e) => {
                warn!("Adapter state events unavailable: {e}");
                return;
            }
        };
        let inner = Arc::clone(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                debug!("Adapter event: {event:?}");
                if event == AdapterEvent::PoweredOff {
                    warn!("Bluetooth adapter powered off; dropping device");
                    inner.drop_session().await;
                }
            }
        });
        if let Some(old) = self.lock_state().adapter_watch.replace(handle) {
            old.abort();
        }
    }
}

async fn run<C: BleCentral>(inner: Arc<Inner<C>>, central: Arc<C>) {
    inner.watch_adapter(&central).await;
    let mut budget = RetryBudget::new(inner.config.max_attempts, inner.config.cooldown());
    loop {
        match inner.iterate(&central, &mut budget).await {
            Ok(()) => tokio::time::sleep(inner.config.poll_interval()).await,
            Err(e) => {
                let backoff = inner.config.error_backoff() * (budget.attempts() + 1);
                warn!("Background monitor: {e}; retrying in {}s", backoff.as_secs_f64());
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

async fn forward<C: BleCentral>(inner: Arc<Inner<C>>, mut notifications: mpsc::Receiver<Vec<u8>>) {
    let mut count: u64 = 0;
    while let Some(payload) = notifications.recv().await {
        count += 1;
        let text = String::from_utf8_lossy(&payload).into_owned();
        if count <= 3 || count % 500 == 0 {
            debug!("Received value #{count}: {text:?}");
        }
        let callback = inner
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(callback) = callback {
            callback(text);
        }
    }
    info!("{} notification stream closed", inner.config.device.label);
}
