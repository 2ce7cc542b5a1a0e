//! Aggregator main loop.
//!
//! Owns the registry, the display device, the warning trackers and the
//! history store. Every mutation flows through `apply` on this task, so
//! bus readers always see a consistent snapshot: server connection tasks
//! send `BusCall`s over a channel and await a oneshot reply instead of
//! touching state.
//!
//! Change signals are coalesced per device inside a 200 ms window;
//! add/remove and OnBattery transitions go out immediately.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use up_core::{
    constants::signal as signal_consts, DaemonConfig, DeviceRegistry, HistoryStore, SourceAdapter,
    SourceEvent, UpDevice, UpowerError, WarningPolicy, WarningTracker,
};
use up_error::Result;
use up_protocol::{
    DaemonState, DeviceKind, DeviceSnapshot, EventEnvelope, HistoryKind, HistoryPoint, Signal,
    StatisticsKind, StatisticsPoint, WarningLevel, DISPLAY_DEVICE_PATH,
};

use crate::backend::{Backend, Mutation};

/// Requests from server connection tasks, answered over oneshots.
#[derive(Debug)]
pub enum BusCall {
    EnumerateDevices {
        reply: oneshot::Sender<Vec<String>>,
    },
    GetDisplayDevice {
        reply: oneshot::Sender<String>,
    },
    GetCriticalAction {
        reply: oneshot::Sender<String>,
    },
    GetDaemonState {
        reply: oneshot::Sender<DaemonState>,
    },
    GetDevice {
        path: String,
        reply: oneshot::Sender<Result<DeviceSnapshot>>,
    },
    RefreshDevice {
        path: String,
        reply: oneshot::Sender<Result<()>>,
    },
    GetHistory {
        path: String,
        kind: HistoryKind,
        timespan: u32,
        resolution: u32,
        reply: oneshot::Sender<Result<Vec<HistoryPoint>>>,
    },
    GetStatistics {
        path: String,
        kind: StatisticsKind,
        reply: oneshot::Sender<Result<Vec<StatisticsPoint>>>,
    },
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Exit after this many seconds without bus or source activity
    pub timed_exit: Option<u64>,
    /// Exit right after coldplug has produced the first events
    pub immediate_exit: bool,
}

/// Channel endpoints the server side needs.
pub struct DaemonHandles {
    pub calls: mpsc::Sender<BusCall>,
    pub signals: broadcast::Sender<EventEnvelope>,
}

pub struct Daemon {
    config: DaemonConfig,
    policy: WarningPolicy,
    options: RunOptions,
    version: String,

    registry: DeviceRegistry,
    history: HistoryStore,
    backend: Backend,

    identity_by_path: HashMap<String, String>,
    trackers: HashMap<String, WarningTracker>,
    display: UpDevice,
    display_tracker: WarningTracker,
    on_battery: bool,

    events_rx: mpsc::UnboundedReceiver<SourceEvent>,
    calls_rx: mpsc::Receiver<BusCall>,
    signals_tx: broadcast::Sender<EventEnvelope>,
    seq: u64,
    pending_changed: HashMap<String, DeviceSnapshot>,

    shutdown: watch::Receiver<bool>,
    last_activity: Instant,
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Daemon {
    pub fn new(
        config: DaemonConfig,
        options: RunOptions,
        version: impl Into<String>,
        adapters: Vec<Box<dyn SourceAdapter>>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(Self, DaemonHandles)> {
        let history = HistoryStore::new(&config.history_dir, config.history_file_cap)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let backend = Backend::new(adapters, &config, move |event| {
            // Lossless: workers enqueue, the main loop drains
            let _ = events_tx.send(event);
        });

        let (calls_tx, calls_rx) = mpsc::channel(64);
        let (signals_tx, _) = broadcast::channel(256);

        let policy = config.warning_policy();
        let daemon = Self {
            policy,
            options,
            version: version.into(),
            registry: DeviceRegistry::new(),
            history,
            backend,
            identity_by_path: HashMap::new(),
            trackers: HashMap::new(),
            display: UpDevice::new(DISPLAY_DEVICE_PATH, "", DeviceKind::Unknown),
            display_tracker: WarningTracker::new(),
            on_battery: false,
            events_rx,
            calls_rx,
            signals_tx: signals_tx.clone(),
            seq: 0,
            pending_changed: HashMap::new(),
            shutdown,
            last_activity: Instant::now(),
            config,
        };

        let handles = DaemonHandles {
            calls: calls_tx,
            signals: signals_tx,
        };
        Ok((daemon, handles))
    }

    pub async fn run(mut self) -> Result<()> {
        let mutations = self.backend.coldplug(unix_now());
        let device_count = mutations.len();
        self.apply(mutations);
        self.flush_pending();
        info!(
            "daemon ready: {} devices, on_battery={}",
            device_count, self.on_battery
        );

        if self.options.immediate_exit {
            info!("immediate-exit requested, shutting down after coldplug");
            self.shutdown_sequence();
            return Ok(());
        }

        let mut coalesce =
            tokio::time::interval(Duration::from_millis(signal_consts::COALESCE_WINDOW_MS));
        coalesce.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    info!("shutdown requested");
                    break;
                }
                Some(event) = self.events_rx.recv() => {
                    self.last_activity = Instant::now();
                    let mutations = self.backend.handle_event(event, unix_now());
                    self.apply(mutations);
                }
                Some(call) = self.calls_rx.recv() => {
                    self.last_activity = Instant::now();
                    self.handle_call(call);
                }
                _ = coalesce.tick() => {
                    let due = self
                        .backend
                        .next_deadline()
                        .map(|deadline| deadline <= Instant::now())
                        .unwrap_or(false);
                    if due {
                        let mutations = self.backend.tick(unix_now());
                        self.apply(mutations);
                    }
                    self.flush_pending();
                    if let Some(limit) = self.options.timed_exit {
                        if self.last_activity.elapsed() >= Duration::from_secs(limit) {
                            info!("timed-exit: {} s of inactivity", limit);
                            break;
                        }
                    }
                }
            }
        }

        self.shutdown_sequence();
        Ok(())
    }

    /// Close adapters and flush history. Bounded by construction: adapter
    /// workers poll with 1 s timeouts and the history flush is one write
    /// per series.
    fn shutdown_sequence(&mut self) {
        self.backend.close();
        self.history.flush();
        info!("daemon stopped");
    }

    fn apply(&mut self, mutations: Vec<Mutation>) {
        if mutations.is_empty() {
            return;
        }

        let line_power_flipped = self.apply_batch(mutations);
        if line_power_flipped {
            // Batteries lag the AC adapter; re-read them right away so the
            // charging/discharging flip is not a poll interval late
            let extra = self.backend.refresh_system_batteries(unix_now());
            self.apply_batch(extra);
        }

        self.recompute_global();
    }

    /// Apply one batch; returns whether a line-power online value changed.
    fn apply_batch(&mut self, mutations: Vec<Mutation>) -> bool {
        let mut line_power_flipped = false;
        for mutation in mutations {
            match mutation {
                Mutation::Added { identity, mut device } => {
                    let path = device.object_path.clone();
                    let tracker = self.trackers.entry(path.clone()).or_default();
                    device.warning_level = tracker.update(&self.policy, &device);
                    self.identity_by_path.insert(path, identity.clone());
                    self.history.record(&identity, &device);
                    let snapshot = device.snapshot();
                    self.registry.insert(device);
                    self.emit(Signal::DeviceAdded { device: snapshot });
                }
                Mutation::Updated { identity, mut device } => {
                    let path = device.object_path.clone();
                    let tracker = self.trackers.entry(path.clone()).or_default();
                    device.warning_level = tracker.update(&self.policy, &device);
                    self.history.record(&identity, &device);

                    if device.kind == DeviceKind::LinePower {
                        if let Some(old) = self.registry.get(&path) {
                            if old.online != device.online {
                                line_power_flipped = true;
                            }
                        }
                    }

                    let changed = self
                        .registry
                        .get(&path)
                        .map(|old| !props_equal(old, &device))
                        .unwrap_or(true);
                    let snapshot = device.snapshot();
                    self.registry.insert(device);
                    if changed {
                        // Coalesced: flushed on the next window tick
                        self.pending_changed.insert(path, snapshot);
                    }
                }
                Mutation::Removed { object_path } => {
                    self.registry.remove(&object_path);
                    self.trackers.remove(&object_path);
                    self.identity_by_path.remove(&object_path);
                    self.pending_changed.remove(&object_path);
                    self.emit(Signal::DeviceRemoved { path: object_path });
                }
            }
        }
        line_power_flipped
    }

    /// Re-derive OnBattery, the display device and the global warning
    /// level after any mutation batch.
    fn recompute_global(&mut self) {
        let now = unix_now();

        let worst_supplying = self
            .registry
            .iter()
            .filter(|d| d.is_supplying())
            .map(|d| d.warning_level)
            .max()
            .unwrap_or(WarningLevel::None);

        let mut display = self.registry.synthesize_display(now);
        display.warning_level = self
            .display_tracker
            .update(&self.policy, &display)
            .max(worst_supplying);

        if !props_equal(&self.display, &display) {
            self.pending_changed
                .insert(DISPLAY_DEVICE_PATH.to_string(), display.snapshot());
        }
        self.display = display;

        let on_battery = self.registry.on_battery();
        if on_battery != self.on_battery {
            self.on_battery = on_battery;
            debug!("on_battery = {}", on_battery);
            let daemon = self.daemon_state();
            self.emit(Signal::DaemonChanged { daemon });
        }
    }

    fn daemon_state(&self) -> DaemonState {
        DaemonState {
            daemon_version: self.version.clone(),
            on_battery: self.on_battery,
            // No lid hardware support yet; absent hardware reads as
            // not-present, not-closed
            lid_is_closed: false,
            lid_is_present: false,
        }
    }

    fn emit(&mut self, signal: Signal) {
        self.seq += 1;
        let _ = self.signals_tx.send(EventEnvelope {
            seq: self.seq,
            signal,
        });
    }

    fn flush_pending(&mut self) {
        if self.pending_changed.is_empty() {
            return;
        }
        let pending: Vec<DeviceSnapshot> = self.pending_changed.drain().map(|(_, d)| d).collect();
        for device in pending {
            self.emit(Signal::DeviceChanged { device });
        }
    }

    fn handle_call(&mut self, call: BusCall) {
        match call {
            BusCall::EnumerateDevices { reply } => {
                let _ = reply.send(self.registry.paths());
            }
            BusCall::GetDisplayDevice { reply } => {
                let _ = reply.send(DISPLAY_DEVICE_PATH.to_string());
            }
            BusCall::GetCriticalAction { reply } => {
                let _ = reply.send(self.config.critical_power_action.clone());
            }
            BusCall::GetDaemonState { reply } => {
                let _ = reply.send(self.daemon_state());
            }
            BusCall::GetDevice { path, reply } => {
                let result = if path == DISPLAY_DEVICE_PATH {
                    Ok(self.display.snapshot())
                } else {
                    self.registry
                        .get(&path)
                        .map(|d| d.snapshot())
                        .ok_or(UpowerError::DeviceNotFound(path))
                };
                let _ = reply.send(result);
            }
            BusCall::RefreshDevice { path, reply } => {
                let result = match self.backend.refresh_object_path(&path, unix_now()) {
                    Some(mutation) => {
                        self.apply(vec![mutation]);
                        Ok(())
                    }
                    None => Err(UpowerError::DeviceNotFound(path)),
                };
                let _ = reply.send(result);
            }
            BusCall::GetHistory {
                path,
                kind,
                timespan,
                resolution,
                reply,
            } => {
                let result = match self.identity_by_path.get(&path) {
                    Some(identity) => Ok(self.history.read(
                        identity,
                        kind,
                        timespan,
                        resolution,
                        unix_now(),
                    )),
                    None => Err(UpowerError::DeviceNotFound(path)),
                };
                let _ = reply.send(result);
            }
            BusCall::GetStatistics { path, kind, reply } => {
                let result = match self.identity_by_path.get(&path) {
                    Some(identity) => Ok(self.history.statistics(identity, kind, unix_now())),
                    None => Err(UpowerError::DeviceNotFound(path)),
                };
                let _ = reply.send(result);
            }
        }
    }
}

/// Property equality modulo update_time; spurious signals are the enemy.
fn props_equal(a: &UpDevice, b: &UpDevice) -> bool {
    let mut a = a.clone();
    a.update_time = b.update_time;
    a == *b
}

#[cfg(test)]
mod tests {
    use super::*;
    use up_core::{DummyAdapter, DummyHandle, RawSnapshot, RawSource};
    use up_protocol::DeviceState;

    fn ac_source(online: &str) -> (RawSource, RawSnapshot) {
        let source = RawSource {
            identity: "AC".into(),
            native_path: "/mock/AC".into(),
            kind: DeviceKind::LinePower,
            power_supply: true,
        };
        let mut snap = RawSnapshot::new();
        snap.insert_str("type", "Mains");
        snap.insert_str("online", online);
        (source, snap)
    }

    fn battery_source(energy_now: &str) -> (RawSource, RawSnapshot) {
        let source = RawSource {
            identity: "BAT0".into(),
            native_path: "/mock/BAT0".into(),
            kind: DeviceKind::Battery,
            power_supply: true,
        };
        let mut snap = RawSnapshot::new();
        snap.insert_str("present", "1");
        snap.insert_str("status", "Discharging");
        snap.insert_str("energy_full", "60000000");
        snap.insert_str("energy_full_design", "80000000");
        snap.insert_str("energy_now", energy_now);
        snap.insert_str("voltage_now", "12000000");
        (source, snap)
    }

    struct Fixture {
        daemon: Daemon,
        handles: DaemonHandles,
        dummy: DummyHandle,
        _shutdown: watch::Sender<bool>,
        _tmp: tempfile::TempDir,
    }

    fn daemon_with(sources: Vec<(RawSource, RawSnapshot)>) -> Fixture {
        let (adapter, dummy) = DummyAdapter::new();
        for (source, snap) in sources {
            dummy.add_source(source, snap);
        }
        let tmp = tempfile::tempdir().unwrap();
        let mut config = DaemonConfig::default();
        config.history_dir = tmp.path().join("history");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (daemon, handles) = Daemon::new(
            config,
            RunOptions::default(),
            "0.2.0-test",
            vec![Box::new(adapter)],
            shutdown_rx,
        )
        .unwrap();
        Fixture {
            daemon,
            handles,
            dummy,
            _shutdown: shutdown_tx,
            _tmp: tmp,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_coldplug_populates_registry_and_on_battery() {
        let mut fx = daemon_with(vec![ac_source("0"), battery_source("48000000")]);
        let daemon = &mut fx.daemon;

        let mutations = daemon.backend.coldplug(unix_now());
        daemon.apply(mutations);

        assert_eq!(daemon.registry.len(), 2);
        assert!(daemon.on_battery);
        assert_eq!(daemon.display.state, DeviceState::Discharging);
        assert!((daemon.display.percentage - 80.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_signals_on_coldplug_and_change() {
        let mut fx = daemon_with(vec![ac_source("0"), battery_source("48000000")]);
        let mut signals = fx.handles.signals.subscribe();
        let daemon = &mut fx.daemon;

        let mutations = daemon.backend.coldplug(unix_now());
        daemon.apply(mutations);
        daemon.flush_pending();

        let mut added = 0;
        let mut daemon_changed = 0;
        while let Ok(envelope) = signals.try_recv() {
            match envelope.signal {
                Signal::DeviceAdded { .. } => added += 1,
                Signal::DaemonChanged { daemon } => {
                    daemon_changed += 1;
                    assert!(daemon.on_battery);
                }
                _ => {}
            }
        }
        assert_eq!(added, 2);
        assert_eq!(daemon_changed, 1);

        // AC comes back: OnBattery flips, battery change coalesces
        let (_, ac_online) = ac_source("1");
        fx.dummy.set_snapshot("AC", ac_online);
        let daemon = &mut fx.daemon;
        let mutations = daemon
            .backend
            .handle_event(SourceEvent::Changed { sysname: "AC".into() }, unix_now());
        daemon.apply(mutations);
        daemon.flush_pending();

        let mut saw_daemon_changed = false;
        while let Ok(envelope) = signals.try_recv() {
            if let Signal::DaemonChanged { daemon } = envelope.signal {
                saw_daemon_changed = true;
                assert!(!daemon.on_battery);
            }
        }
        assert!(saw_daemon_changed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_spurious_change_signals_on_identical_refresh() {
        let mut fx = daemon_with(vec![battery_source("48000000")]);
        let mut signals = fx.handles.signals.subscribe();
        let daemon = &mut fx.daemon;

        let now = unix_now();
        let mutations = daemon.backend.coldplug(now);
        daemon.apply(mutations);
        daemon.flush_pending();
        while signals.try_recv().is_ok() {}

        // Same raw inputs again: no published property changes
        let mutations = daemon
            .backend
            .handle_event(SourceEvent::Changed { sysname: "BAT0".into() }, now);
        daemon.apply(mutations);
        daemon.flush_pending();

        assert!(signals.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_bus_calls() {
        let mut fx = daemon_with(vec![ac_source("0"), battery_source("1500000")]);
        let daemon = &mut fx.daemon;
        let mutations = daemon.backend.coldplug(unix_now());
        daemon.apply(mutations);

        let (tx, rx) = oneshot::channel();
        daemon.handle_call(BusCall::EnumerateDevices { reply: tx });
        let paths = rx.await.unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().any(|p| p.contains("battery_BAT0")));

        let (tx, rx) = oneshot::channel();
        daemon.handle_call(BusCall::GetDisplayDevice { reply: tx });
        assert_eq!(rx.await.unwrap(), DISPLAY_DEVICE_PATH);

        let (tx, rx) = oneshot::channel();
        daemon.handle_call(BusCall::GetCriticalAction { reply: tx });
        assert_eq!(rx.await.unwrap(), "HybridSleep");

        let battery_path = paths
            .iter()
            .find(|p| p.contains("battery_BAT0"))
            .unwrap()
            .clone();
        let (tx, rx) = oneshot::channel();
        daemon.handle_call(BusCall::GetDevice {
            path: battery_path.clone(),
            reply: tx,
        });
        let snapshot = rx.await.unwrap().unwrap();
        assert!((snapshot.percentage - 2.5).abs() < 1e-9);
        assert_eq!(snapshot.warning_level, WarningLevel::Critical);

        let (tx, rx) = oneshot::channel();
        daemon.handle_call(BusCall::GetHistory {
            path: battery_path,
            kind: HistoryKind::Charge,
            timespan: 600,
            resolution: 10,
            reply: tx,
        });
        let history = rx.await.unwrap().unwrap();
        assert!(!history.is_empty());

        let (tx, rx) = oneshot::channel();
        daemon.handle_call(BusCall::GetDevice {
            path: "/org/freedesktop/UPower/devices/battery_NOPE".into(),
            reply: tx,
        });
        assert!(rx.await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_display_device_warning_follows_worst_supplying() {
        let mut fx = daemon_with(vec![ac_source("0"), battery_source("1500000")]);
        let daemon = &mut fx.daemon;
        let mutations = daemon.backend.coldplug(unix_now());
        daemon.apply(mutations);

        // 2.5% discharging: per-device critical surfaces on the display
        assert_eq!(daemon.display.warning_level, WarningLevel::Critical);
    }
}
