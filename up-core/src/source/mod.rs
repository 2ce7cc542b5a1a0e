//! Native source abstraction.
//!
//! Each OS adapter exposes the same three operations: enumerate the raw
//! power sources it can see, subscribe a sink to change events, and read a
//! snapshot of one source. Everything transport-specific (sysfs attribute
//! files, APM ioctls, HID reports) stays behind this boundary; the
//! normalizer only ever sees `RawSnapshot` maps.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use up_error::Result;
use up_protocol::DeviceKind;

pub mod dummy;
pub mod sysfs;

#[cfg(target_os = "linux")]
pub mod hidups;
#[cfg(target_os = "linux")]
mod uevent;

#[cfg(target_os = "openbsd")]
pub mod apm;

/// A raw power source as enumerated by an adapter.
///
/// `identity` is the stable identifier used for registry bookkeeping and
/// history file naming; it survives remove/re-add cycles of the same
/// logical device. Peripherals derive it from vendor+model+serial, system
/// supplies from the kernel entry name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSource {
    pub identity: String,
    /// Transport-specific handle, also published as the device's native_path
    pub native_path: String,
    pub kind: DeviceKind,
    /// Whether this source can power the host
    pub power_supply: bool,
}

/// A flat map of attribute name to raw bytes, exactly as the OS handed
/// them over. Values keep trailing newlines and junk; accessors trim.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawSnapshot {
    attrs: BTreeMap<String, Vec<u8>>,
}

impl RawSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.attrs.insert(key.into(), value);
    }

    pub fn insert_str(&mut self, key: impl Into<String>, value: &str) {
        self.attrs.insert(key.into(), value.as_bytes().to_vec());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.attrs.contains_key(key)
    }

    pub fn raw(&self, key: &str) -> Option<&[u8]> {
        self.attrs.get(key).map(|v| v.as_slice())
    }

    /// Attribute as trimmed UTF-8 text; None when absent or not decodable.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.attrs
            .get(key)
            .and_then(|v| std::str::from_utf8(v).ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get_str(key)?.parse().ok()
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get_str(key)?.parse().ok()
    }

    /// Kernel boolean attributes are "0"/"1".
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get_str(key)? {
            "0" => Some(false),
            "1" => Some(true),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.attrs.len()
    }
}

/// Change notifications delivered by adapter workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    /// A new source appeared
    Added(RawSource),
    /// Attributes of a known source changed; `sysname` is the transport's
    /// short name (the native path basename)
    Changed { sysname: String },
    /// A source disappeared
    Removed { sysname: String },
    /// Something moved on a related bus; the backend should re-enumerate
    Rescan,
}

/// Sink adapter workers publish events into. Workers run on plain threads,
/// so the daemon side bridges this into its channel with a blocking send.
pub type EventSink = Box<dyn Fn(SourceEvent) + Send + Sync + 'static>;

/// Handle to a running event worker. Dropping it asks the worker to stop;
/// workers poll their kernel primitive with a bounded timeout so shutdown
/// completes within the daemon's 2 s budget.
pub struct Subscription {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(stop: Arc<AtomicBool>, handle: JoinHandle<()>) -> Self {
        Self {
            stop,
            handle: Some(handle),
        }
    }

    /// A subscription with no worker behind it (in-process adapters).
    pub fn noop() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Uniform operation set every native adapter implements.
pub trait SourceAdapter: Send {
    fn name(&self) -> &'static str;

    /// List the sources currently visible to this adapter.
    fn enumerate(&mut self) -> Result<Vec<RawSource>>;

    /// Start delivering change events to `sink`. Adapters without a kernel
    /// notification primitive return `EventsNotSupported`; the backend then
    /// falls back to polling at the slow cadence.
    fn subscribe(&mut self, sink: EventSink) -> Result<Subscription>;

    /// Read the current attributes of one source. Individual unreadable
    /// attributes are skipped; only a vanished source is an error.
    fn refresh(&self, source: &RawSource) -> Result<RawSnapshot>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_accessors() {
        let mut snap = RawSnapshot::new();
        snap.insert_str("status", "Discharging\n");
        snap.insert_str("capacity", " 42 ");
        snap.insert_str("online", "1");
        snap.insert("garbage", vec![0xff, 0xfe]);

        assert_eq!(snap.get_str("status"), Some("Discharging"));
        assert_eq!(snap.get_f64("capacity"), Some(42.0));
        assert_eq!(snap.get_bool("online"), Some(true));
        assert_eq!(snap.get_str("garbage"), None);
        assert_eq!(snap.get_str("absent"), None);
        assert!(snap.contains("garbage"));
    }

    #[test]
    fn test_snapshot_empty_value_reads_absent() {
        let mut snap = RawSnapshot::new();
        snap.insert_str("manufacturer", "\n");
        assert_eq!(snap.get_str("manufacturer"), None);
    }
}
