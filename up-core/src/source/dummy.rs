//! Programmable adapter for tests.
//!
//! Holds a fixed inventory that test code mutates through a `DummyHandle`;
//! every mutation also fires the subscribed sink, so backend event handling
//! can be exercised without a kernel.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use up_error::{Result, UpowerError};

use super::{EventSink, RawSnapshot, RawSource, SourceAdapter, SourceEvent, Subscription};

#[derive(Default)]
struct Shared {
    inventory: BTreeMap<String, (RawSource, RawSnapshot)>,
    sink: Option<EventSink>,
}

pub struct DummyAdapter {
    shared: Arc<Mutex<Shared>>,
}

/// Test-side handle for mutating the dummy inventory.
#[derive(Clone)]
pub struct DummyHandle {
    shared: Arc<Mutex<Shared>>,
}

impl DummyAdapter {
    pub fn new() -> (Self, DummyHandle) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        (
            Self {
                shared: shared.clone(),
            },
            DummyHandle { shared },
        )
    }
}

impl DummyHandle {
    fn emit(&self, event: SourceEvent) {
        let guard = self.shared.lock().unwrap();
        if let Some(sink) = guard.sink.as_ref() {
            sink(event);
        }
    }

    pub fn add_source(&self, source: RawSource, snapshot: RawSnapshot) {
        {
            let mut guard = self.shared.lock().unwrap();
            guard
                .inventory
                .insert(source.identity.clone(), (source.clone(), snapshot));
        }
        self.emit(SourceEvent::Added(source));
    }

    /// Replace a source's snapshot and fire a change event.
    pub fn set_snapshot(&self, identity: &str, snapshot: RawSnapshot) {
        let sysname = {
            let mut guard = self.shared.lock().unwrap();
            match guard.inventory.get_mut(identity) {
                Some((source, snap)) => {
                    *snap = snapshot;
                    Some(sysname_of(source))
                }
                None => None,
            }
        };
        if let Some(sysname) = sysname {
            self.emit(SourceEvent::Changed { sysname });
        }
    }

    pub fn remove_source(&self, identity: &str) {
        let sysname = {
            let mut guard = self.shared.lock().unwrap();
            guard
                .inventory
                .remove(identity)
                .map(|(source, _)| sysname_of(&source))
        };
        if let Some(sysname) = sysname {
            self.emit(SourceEvent::Removed { sysname });
        }
    }

    pub fn rescan(&self) {
        self.emit(SourceEvent::Rescan);
    }
}

fn sysname_of(source: &RawSource) -> String {
    source
        .native_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(&source.native_path)
        .to_string()
}

impl SourceAdapter for DummyAdapter {
    fn name(&self) -> &'static str {
        "dummy"
    }

    fn enumerate(&mut self) -> Result<Vec<RawSource>> {
        let guard = self.shared.lock().unwrap();
        Ok(guard
            .inventory
            .values()
            .map(|(source, _)| source.clone())
            .collect())
    }

    fn subscribe(&mut self, sink: EventSink) -> Result<Subscription> {
        let mut guard = self.shared.lock().unwrap();
        guard.sink = Some(sink);
        Ok(Subscription::noop())
    }

    fn refresh(&self, source: &RawSource) -> Result<RawSnapshot> {
        let guard = self.shared.lock().unwrap();
        guard
            .inventory
            .get(&source.identity)
            .map(|(_, snap)| snap.clone())
            .ok_or_else(|| UpowerError::SourceNotFound(source.identity.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use up_protocol::DeviceKind;

    fn battery_source() -> RawSource {
        RawSource {
            identity: "BAT0".into(),
            native_path: "/dummy/BAT0".into(),
            kind: DeviceKind::Battery,
            power_supply: true,
        }
    }

    #[test]
    fn test_inventory_round_trip() {
        let (mut adapter, handle) = DummyAdapter::new();
        let mut snap = RawSnapshot::new();
        snap.insert_str("status", "Discharging");
        handle.add_source(battery_source(), snap);

        let sources = adapter.enumerate().unwrap();
        assert_eq!(sources.len(), 1);
        let refreshed = adapter.refresh(&sources[0]).unwrap();
        assert_eq!(refreshed.get_str("status"), Some("Discharging"));

        handle.remove_source("BAT0");
        assert!(adapter.enumerate().unwrap().is_empty());
        assert!(adapter.refresh(&sources[0]).is_err());
    }

    #[test]
    fn test_events_reach_sink() {
        let (mut adapter, handle) = DummyAdapter::new();
        let count = Arc::new(AtomicUsize::new(0));
        let sink_count = count.clone();
        adapter
            .subscribe(Box::new(move |_| {
                sink_count.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        handle.add_source(battery_source(), RawSnapshot::new());
        handle.set_snapshot("BAT0", RawSnapshot::new());
        handle.remove_source("BAT0");
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
