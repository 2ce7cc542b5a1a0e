//! Backend: adapter ownership and refresh scheduling.
//!
//! Translates raw source events into registry mutations and owns the
//! per-device refresh cadence. All methods run on the daemon main loop;
//! adapter event workers only touch the event channel.
//!
//! Scheduling rules: line power and peripherals poll every 30 s, system
//! batteries every 60 s, and any device that just changed state polls at
//! 10 s for two minutes so the rate estimate converges. A battery stuck
//! reporting an unknown state also gets the fast cadence, capped at 30
//! attempts. Change events trigger an immediate refresh on top of the
//! schedule.
//!
//! Peripheral removals are quarantined for two seconds: the kernel
//! re-creates bluetooth peripherals on wake, and holding the device over
//! that window keeps its object path and history alive through the bounce.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use up_core::{
    constants::{poll, quarantine},
    normalize, DaemonConfig, NormalizeEnv, RateEstimator, RawSnapshot, RawSource, SourceAdapter,
    SourceEvent, Subscription, UpDevice,
};
use up_protocol::{DeviceKind, DeviceState};

/// Registry mutation produced by the backend; the daemon applies these to
/// the authoritative device set and fans out signals.
#[derive(Debug, Clone)]
pub enum Mutation {
    Added { identity: String, device: UpDevice },
    Updated { identity: String, device: UpDevice },
    Removed { object_path: String },
}

struct ManagedSource {
    source: RawSource,
    adapter_idx: usize,
    estimator: RateEstimator,
    prior: Option<UpDevice>,
    next_refresh: Instant,
    fast_until: Option<Instant>,
    unknown_retries: u32,
    quarantined_until: Option<Instant>,
}

pub struct Backend {
    adapters: Vec<Box<dyn SourceAdapter>>,
    /// Held for their Drop side: workers stop when these go away
    subscriptions: Vec<Subscription>,
    sources: HashMap<String, ManagedSource>,
    hidups_poll: Duration,
    /// Cached from the line-power sources this backend has seen
    on_ac: bool,
}

impl Backend {
    /// Build the backend and subscribe every adapter to the given sink.
    /// Adapters without change events just fall back to polling.
    pub fn new(
        mut adapters: Vec<Box<dyn SourceAdapter>>,
        config: &DaemonConfig,
        sink: impl Fn(SourceEvent) + Send + Sync + Clone + 'static,
    ) -> Self {
        let mut subscriptions = Vec::new();
        for adapter in adapters.iter_mut() {
            let sink = sink.clone();
            match adapter.subscribe(Box::new(sink)) {
                Ok(sub) => {
                    debug!("adapter {} delivering change events", adapter.name());
                    subscriptions.push(sub);
                }
                Err(e) => {
                    info!("adapter {} is poll-only: {}", adapter.name(), e);
                }
            }
        }

        Self {
            adapters,
            subscriptions,
            sources: HashMap::new(),
            hidups_poll: Duration::from_secs(config.hidups_poll_secs.max(1)),
            on_ac: false,
        }
    }

    /// Initial enumeration: every adapter's current inventory becomes a
    /// device before the daemon declares itself ready.
    pub fn coldplug(&mut self, now_unix: u64) -> Vec<Mutation> {
        let mut mutations = Vec::new();
        for idx in 0..self.adapters.len() {
            let sources = match self.adapters[idx].enumerate() {
                Ok(sources) => sources,
                Err(e) => {
                    warn!(
                        "adapter {} failed to enumerate, disabling: {}",
                        self.adapters[idx].name(),
                        e
                    );
                    continue;
                }
            };
            for source in sources {
                self.admit_source(source, idx);
            }
        }

        // Line power first, so batteries coldplug with the right AC hint
        let mut identities: Vec<String> = self.sources.keys().cloned().collect();
        identities.sort_by_key(|identity| {
            (
                self.sources[identity].source.kind != DeviceKind::LinePower,
                identity.clone(),
            )
        });
        for identity in identities {
            if let Some(mutation) = self.refresh_source(&identity, now_unix) {
                mutations.push(mutation);
            }
        }
        info!("coldplug complete: {} devices", mutations.len());
        mutations
    }

    /// Handle one event from an adapter worker.
    pub fn handle_event(&mut self, event: SourceEvent, now_unix: u64) -> Vec<Mutation> {
        match event {
            SourceEvent::Added(source) => {
                // Adapters that can name the new source directly skip the
                // rescan round-trip
                self.admit_named_source(source, now_unix)
            }
            SourceEvent::Changed { sysname } => {
                match self.identity_by_sysname(&sysname) {
                    Some(identity) => self
                        .refresh_source(&identity, now_unix)
                        .into_iter()
                        .collect(),
                    None => {
                        // A source we have not admitted yet; the diff pass
                        // will pick it up
                        self.rescan(now_unix)
                    }
                }
            }
            SourceEvent::Removed { sysname } => match self.identity_by_sysname(&sysname) {
                Some(identity) => self.retire_source(&identity).into_iter().collect(),
                None => Vec::new(),
            },
            SourceEvent::Rescan => self.rescan(now_unix),
        }
    }

    /// Timer tick: expire quarantines and run due refreshes. Returns the
    /// resulting mutations; `next_deadline` says when to call again.
    pub fn tick(&mut self, now_unix: u64) -> Vec<Mutation> {
        let now = Instant::now();
        let mut mutations = Vec::new();

        // Quarantine expiries first: a peripheral that never came back is
        // gone for real
        let expired: Vec<String> = self
            .sources
            .iter()
            .filter(|(_, m)| m.quarantined_until.map(|t| now >= t).unwrap_or(false))
            .map(|(identity, _)| identity.clone())
            .collect();
        for identity in expired {
            if let Some(managed) = self.sources.remove(&identity) {
                if let Some(prior) = managed.prior {
                    debug!("quarantine expired for {}", identity);
                    mutations.push(Mutation::Removed {
                        object_path: prior.object_path,
                    });
                }
            }
        }

        let due: Vec<String> = self
            .sources
            .iter()
            .filter(|(_, m)| m.quarantined_until.is_none() && m.next_refresh <= now)
            .map(|(identity, _)| identity.clone())
            .collect();
        for identity in due {
            if let Some(mutation) = self.refresh_source(&identity, now_unix) {
                mutations.push(mutation);
            }
        }

        mutations
    }

    /// Earliest instant at which `tick` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sources
            .values()
            .map(|m| m.quarantined_until.unwrap_or(m.next_refresh))
            .min()
    }

    /// Refresh every system battery now. The daemon calls this when a
    /// line-power source flips, because batteries notice mains later than
    /// the AC adapter does.
    pub fn refresh_system_batteries(&mut self, now_unix: u64) -> Vec<Mutation> {
        let identities: Vec<String> = self
            .sources
            .iter()
            .filter(|(_, m)| {
                m.source.power_supply
                    && matches!(m.source.kind, DeviceKind::Battery | DeviceKind::Ups)
                    && m.quarantined_until.is_none()
            })
            .map(|(identity, _)| identity.clone())
            .collect();
        identities
            .iter()
            .filter_map(|identity| self.refresh_source(identity, now_unix))
            .collect()
    }

    /// Bus-triggered refresh of one device by object path.
    pub fn refresh_object_path(&mut self, object_path: &str, now_unix: u64) -> Option<Mutation> {
        let identity = self
            .sources
            .iter()
            .find(|(_, m)| {
                m.prior
                    .as_ref()
                    .map(|p| p.object_path == object_path)
                    .unwrap_or(false)
            })
            .map(|(identity, _)| identity.clone())?;
        self.refresh_source(&identity, now_unix)
    }

    fn identity_by_sysname(&self, sysname: &str) -> Option<String> {
        self.sources
            .iter()
            .find(|(_, m)| {
                m.source
                    .native_path
                    .trim_end_matches('/')
                    .rsplit('/')
                    .next()
                    .map(|base| base == sysname)
                    .unwrap_or(false)
            })
            .map(|(identity, _)| identity.clone())
    }

    /// Insert a newly seen source without refreshing it yet.
    fn admit_source(&mut self, source: RawSource, adapter_idx: usize) {
        if let Some(existing) = self.sources.get_mut(&source.identity) {
            if existing.quarantined_until.is_some() {
                // Same stable identity back inside the hold window: the
                // kernel re-created the device, not the user
                info!("resurrecting quarantined device {}", source.identity);
                existing.quarantined_until = None;
                existing.source = source;
                existing.next_refresh = Instant::now();
            }
            return;
        }
        self.sources.insert(
            source.identity.clone(),
            ManagedSource {
                source,
                adapter_idx,
                estimator: RateEstimator::new(),
                prior: None,
                next_refresh: Instant::now(),
                fast_until: None,
                unknown_retries: 0,
                quarantined_until: None,
            },
        );
    }

    fn admit_named_source(&mut self, source: RawSource, now_unix: u64) -> Vec<Mutation> {
        let identity = source.identity.clone();
        // Named adds come from adapters that already know the source; pin
        // them on the adapter that owns that kind of source, falling back
        // to the first adapter
        let adapter_idx = self
            .sources
            .get(&identity)
            .map(|m| m.adapter_idx)
            .unwrap_or(0);
        self.admit_source(source, adapter_idx);
        self.refresh_source(&identity, now_unix).into_iter().collect()
    }

    /// Removal entry point: peripherals are quarantined, system supplies
    /// go immediately.
    fn retire_source(&mut self, identity: &str) -> Option<Mutation> {
        let managed = self.sources.get_mut(identity)?;
        if !managed.source.power_supply {
            debug!("quarantining removed peripheral {}", identity);
            managed.quarantined_until =
                Some(Instant::now() + Duration::from_millis(quarantine::HOLD_MS));
            return None;
        }
        let managed = self.sources.remove(identity)?;
        managed.prior.map(|prior| Mutation::Removed {
            object_path: prior.object_path,
        })
    }

    /// Re-enumerate every adapter and diff against the current set.
    fn rescan(&mut self, now_unix: u64) -> Vec<Mutation> {
        let mut seen: HashMap<String, (RawSource, usize)> = HashMap::new();
        for idx in 0..self.adapters.len() {
            match self.adapters[idx].enumerate() {
                Ok(sources) => {
                    for source in sources {
                        seen.insert(source.identity.clone(), (source, idx));
                    }
                }
                Err(e) => warn!("rescan: adapter {} failed: {}", self.adapters[idx].name(), e),
            }
        }

        let mut mutations = Vec::new();

        let missing: Vec<String> = self
            .sources
            .iter()
            .filter(|(identity, m)| {
                !seen.contains_key(*identity) && m.quarantined_until.is_none()
            })
            .map(|(identity, _)| identity.clone())
            .collect();
        for identity in missing {
            mutations.extend(self.retire_source(&identity));
        }

        for (identity, (source, idx)) in seen {
            let is_new = !self.sources.contains_key(&identity)
                || self.sources[&identity].quarantined_until.is_some();
            self.admit_source(source, idx);
            if is_new {
                mutations.extend(self.refresh_source(&identity, now_unix));
            }
        }

        mutations
    }

    fn refresh_source(&mut self, identity: &str, now_unix: u64) -> Option<Mutation> {
        let on_ac = self.on_ac;
        let managed = self.sources.get_mut(identity)?;
        if managed.quarantined_until.is_some() {
            return None;
        }
        let adapter = &self.adapters[managed.adapter_idx];

        let started = std::time::Instant::now();
        let snapshot = match adapter.refresh(&managed.source) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                // Transient read failure: publish unknown fields, retry on
                // the next tick
                warn!("refresh of {} failed: {}", identity, e);
                RawSnapshot::new()
            }
        };
        let elapsed = started.elapsed();
        if elapsed > Duration::from_secs(poll::SOURCE_BUDGET_SECS) {
            warn!(
                "refresh of {} blew its budget ({} ms)",
                identity,
                elapsed.as_millis()
            );
        }

        let env = NormalizeEnv {
            now: now_unix,
            on_ac,
        };
        let device = normalize(
            &managed.source,
            &snapshot,
            managed.prior.as_ref(),
            &mut managed.estimator,
            &env,
        );

        let state_changed = managed.prior.as_ref().map(|p| p.state) != Some(device.state);
        if state_changed && managed.prior.is_some() {
            managed.fast_until =
                Some(Instant::now() + Duration::from_secs(poll::FAST_WINDOW_SECS));
        }
        if device.state == DeviceState::Unknown {
            managed.unknown_retries = managed.unknown_retries.saturating_add(1);
        } else {
            managed.unknown_retries = 0;
        }

        let interval = next_interval(managed, self.hidups_poll);
        managed.next_refresh = Instant::now() + interval;

        let was_new = managed.prior.is_none();
        managed.prior = Some(device.clone());
        self.recompute_on_ac();

        Some(if was_new {
            Mutation::Added {
                identity: identity.to_string(),
                device,
            }
        } else {
            Mutation::Updated {
                identity: identity.to_string(),
                device,
            }
        })
    }

    fn recompute_on_ac(&mut self) {
        self.on_ac = self.sources.values().any(|m| {
            m.prior
                .as_ref()
                .map(|p| p.kind == DeviceKind::LinePower && p.power_supply && p.online)
                .unwrap_or(false)
        });
    }

    /// Drop all subscriptions, stopping adapter workers. Part of shutdown.
    pub fn close(&mut self) {
        self.subscriptions.clear();
    }
}

fn next_interval(managed: &ManagedSource, hidups_poll: Duration) -> Duration {
    let now = Instant::now();
    let fast_window = managed.fast_until.map(|t| now < t).unwrap_or(false);
    let unknown_fast = managed
        .prior
        .as_ref()
        .map(|p| p.state == DeviceState::Unknown)
        .unwrap_or(false)
        && managed.unknown_retries < poll::UNKNOWN_RETRIES;

    if fast_window || unknown_fast {
        return Duration::from_secs(poll::FAST_INTERVAL_SECS);
    }

    match managed.source.kind {
        DeviceKind::LinePower => Duration::from_secs(poll::LINE_POWER_INTERVAL_SECS),
        DeviceKind::Ups => hidups_poll,
        DeviceKind::Battery if managed.source.power_supply => {
            Duration::from_secs(poll::BATTERY_INTERVAL_SECS)
        }
        _ => Duration::from_secs(poll::PERIPHERAL_INTERVAL_SECS),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use up_core::{DummyAdapter, DummyHandle};

    fn mouse_source() -> RawSource {
        RawSource {
            identity: "Logitech:Fancy BT mouse:aa:bb:cc".into(),
            native_path: "/mock/hidpp_battery_0".into(),
            kind: DeviceKind::Mouse,
            power_supply: false,
        }
    }

    fn mouse_snapshot(capacity: &str) -> RawSnapshot {
        let mut snap = RawSnapshot::new();
        snap.insert_str("present", "1");
        snap.insert_str("status", "Discharging");
        snap.insert_str("capacity", capacity);
        snap.insert_str("model_name", "Fancy BT mouse");
        snap
    }

    fn backend_with_mouse() -> (Backend, DummyHandle) {
        let (adapter, handle) = DummyAdapter::new();
        handle.add_source(mouse_source(), mouse_snapshot("30"));
        let backend = Backend::new(
            vec![Box::new(adapter)],
            &DaemonConfig::default(),
            |_event| {},
        );
        (backend, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_coldplug_adds_devices() {
        let (mut backend, _handle) = backend_with_mouse();
        let mutations = backend.coldplug(1000);
        assert_eq!(mutations.len(), 1);
        let Mutation::Added { device, .. } = &mutations[0] else {
            panic!("expected Added");
        };
        assert_eq!(device.kind, DeviceKind::Mouse);
        assert!((device.percentage - 30.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_peripheral_reconnect_within_quarantine() {
        let (mut backend, handle) = backend_with_mouse();
        let mutations = backend.coldplug(1000);
        let Mutation::Added { device, .. } = &mutations[0] else {
            panic!("expected Added");
        };
        let original_path = device.object_path.clone();

        // Kernel removes the device...
        handle.remove_source("Logitech:Fancy BT mouse:aa:bb:cc");
        let mutations = backend.handle_event(
            SourceEvent::Removed {
                sysname: "hidpp_battery_0".into(),
            },
            1001,
        );
        // ...but nothing is published yet
        assert!(mutations.is_empty());

        // One second later the same identity is back
        tokio::time::advance(Duration::from_secs(1)).await;
        handle.add_source(mouse_source(), mouse_snapshot("30"));
        let mutations = backend.handle_event(SourceEvent::Added(mouse_source()), 1002);

        assert_eq!(mutations.len(), 1);
        let Mutation::Updated { device, .. } = &mutations[0] else {
            panic!("expected Updated, not a second Added: {:?}", mutations[0]);
        };
        assert_eq!(device.object_path, original_path);
        assert!((device.percentage - 30.0).abs() < 1e-9);

        // Quarantine never fires later
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(backend.tick(1010).iter().all(|m| !matches!(m, Mutation::Removed { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_peripheral_quarantine_expires() {
        let (mut backend, handle) = backend_with_mouse();
        let mutations = backend.coldplug(1000);
        let Mutation::Added { device, .. } = &mutations[0] else {
            panic!("expected Added");
        };
        let path = device.object_path.clone();

        handle.remove_source("Logitech:Fancy BT mouse:aa:bb:cc");
        backend.handle_event(
            SourceEvent::Removed {
                sysname: "hidpp_battery_0".into(),
            },
            1001,
        );

        tokio::time::advance(Duration::from_secs(3)).await;
        let mutations = backend.tick(1004);
        assert_eq!(mutations.len(), 1);
        let Mutation::Removed { object_path } = &mutations[0] else {
            panic!("expected Removed");
        };
        assert_eq!(*object_path, path);
    }

    #[tokio::test(start_paused = true)]
    async fn test_system_battery_removed_immediately() {
        let (adapter, handle) = DummyAdapter::new();
        let bat = RawSource {
            identity: "BAT0".into(),
            native_path: "/mock/BAT0".into(),
            kind: DeviceKind::Battery,
            power_supply: true,
        };
        let mut snap = RawSnapshot::new();
        snap.insert_str("present", "1");
        snap.insert_str("status", "Discharging");
        snap.insert_str("capacity", "50");
        handle.add_source(bat, snap);

        let mut backend = Backend::new(
            vec![Box::new(adapter)],
            &DaemonConfig::default(),
            |_event| {},
        );
        backend.coldplug(1000);

        handle.remove_source("BAT0");
        let mutations = backend.handle_event(
            SourceEvent::Removed {
                sysname: "BAT0".into(),
            },
            1001,
        );
        assert!(matches!(mutations[0], Mutation::Removed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_event_triggers_immediate_refresh() {
        let (mut backend, handle) = backend_with_mouse();
        backend.coldplug(1000);

        handle.set_snapshot("Logitech:Fancy BT mouse:aa:bb:cc", mouse_snapshot("25"));
        let mutations = backend.handle_event(
            SourceEvent::Changed {
                sysname: "hidpp_battery_0".into(),
            },
            1030,
        );
        assert_eq!(mutations.len(), 1);
        let Mutation::Updated { device, .. } = &mutations[0] else {
            panic!("expected Updated");
        };
        assert!((device.percentage - 25.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rescan_diffs_inventory() {
        let (adapter, handle) = DummyAdapter::new();
        let mut backend = Backend::new(
            vec![Box::new(adapter)],
            &DaemonConfig::default(),
            |_event| {},
        );
        assert!(backend.coldplug(1000).is_empty());

        handle.add_source(mouse_source(), mouse_snapshot("30"));
        let mutations = backend.handle_event(SourceEvent::Rescan, 1001);
        assert!(matches!(mutations[0], Mutation::Added { .. }));

        // Second rescan with no changes is a no-op
        assert!(backend.handle_event(SourceEvent::Rescan, 1002).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_poll_after_state_transition() {
        let (mut backend, handle) = backend_with_mouse();
        backend.coldplug(1000);
        let before = backend.next_deadline().unwrap();
        // Peripheral cadence is 30 s
        assert!(before >= Instant::now() + Duration::from_secs(29));

        let mut charging = mouse_snapshot("30");
        charging.insert_str("status", "Charging");
        handle.set_snapshot("Logitech:Fancy BT mouse:aa:bb:cc", charging);
        backend.handle_event(
            SourceEvent::Changed {
                sysname: "hidpp_battery_0".into(),
            },
            1030,
        );

        // State changed, so the next refresh lands on the fast cadence
        let after = backend.next_deadline().unwrap();
        assert!(after <= Instant::now() + Duration::from_secs(10));
    }
}
