//! Linux power_supply class adapter.
//!
//! Enumerates entries of a power_supply class directory, classifies them by
//! their `type`/`scope` attributes plus the surrounding device tree, and
//! reads attribute files on demand. Change events come from a kernel uevent
//! netlink socket; when the adapter is pointed at a mock tree it is
//! poll-only.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, trace, warn};

use up_error::{Result, UpowerError};
use up_protocol::DeviceKind;

use super::{EventSink, RawSnapshot, RawSource, SourceAdapter, Subscription};
use crate::constants::{env as env_vars, paths};
use crate::device::sanitize_text;

/// Attribute files read on every refresh. Missing or unreadable files are
/// simply absent from the snapshot.
const ATTRIBUTES: &[&str] = &[
    "type",
    "scope",
    "online",
    "present",
    "status",
    "capacity",
    "capacity_level",
    "energy_now",
    "energy_avg",
    "energy_empty",
    "energy_full",
    "energy_full_design",
    "charge_now",
    "charge_avg",
    "charge_empty",
    "charge_full",
    "charge_full_design",
    "current_now",
    "power_now",
    "voltage_now",
    "voltage_avg",
    "voltage_min_design",
    "voltage_max_design",
    "voltage_present",
    "temp",
    "technology",
    "manufacturer",
    "model_name",
    "serial_number",
    "cycle_count",
];

pub struct SysfsAdapter {
    root: PathBuf,
    /// True when pointed at a mock tree; no netlink then
    mock: bool,
}

impl SysfsAdapter {
    /// Adapter over the real kernel tree, unless the mock-tree environment
    /// variable redirects it.
    pub fn new() -> Self {
        match std::env::var(env_vars::SYSFS_PATH) {
            Ok(root) if !root.is_empty() => {
                debug!("sysfs adapter using mock tree at {}", root);
                Self {
                    root: PathBuf::from(root),
                    mock: true,
                }
            }
            _ => Self {
                root: PathBuf::from(paths::SYSFS_POWER_SUPPLY),
                mock: false,
            },
        }
    }

    /// Adapter rooted at an explicit power_supply-shaped directory.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mock: true,
        }
    }

    fn read_attr(dir: &Path, name: &str) -> Option<Vec<u8>> {
        let path = dir.join(name);
        match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                trace!("unreadable attribute {:?}: {}", path, e);
                None
            }
        }
    }

    fn read_attr_str(dir: &Path, name: &str) -> Option<String> {
        Self::read_attr(dir, name).map(|b| sanitize_text(&b))
    }

    fn classify(dir: &Path) -> (DeviceKind, bool) {
        let supply_type = Self::read_attr_str(dir, "type").unwrap_or_default();
        let scope = Self::read_attr_str(dir, "scope").unwrap_or_default();
        let is_device_scope = scope.eq_ignore_ascii_case("device");

        match supply_type.as_str() {
            t if t.eq_ignore_ascii_case("mains") || t.eq_ignore_ascii_case("usb") => {
                (DeviceKind::LinePower, !is_device_scope)
            }
            t if t.eq_ignore_ascii_case("ups") => (DeviceKind::Ups, true),
            _ => {
                if is_device_scope {
                    (Self::classify_peripheral(dir), false)
                } else {
                    (DeviceKind::Battery, true)
                }
            }
        }
    }

    /// Decide what kind of peripheral owns this battery: first the input
    /// device names under the parent, then the model name, then whether a
    /// bluetooth ancestor exists.
    fn classify_peripheral(dir: &Path) -> DeviceKind {
        if let Some(kind) = Self::classify_from_input_names(dir) {
            return kind;
        }

        if let Some(model) = Self::read_attr_str(dir, "model_name") {
            if let Some(kind) = kind_from_keywords(&model) {
                return kind;
            }
        }

        if Self::has_bluetooth_ancestor(dir) {
            return DeviceKind::BluetoothGeneric;
        }

        DeviceKind::Battery
    }

    fn classify_from_input_names(dir: &Path) -> Option<DeviceKind> {
        let parent = fs::canonicalize(dir.join("device")).ok()?;
        let input_dir = parent.join("input");
        let entries = fs::read_dir(&input_dir).ok()?;
        for entry in entries.flatten() {
            let name_file = entry.path().join("name");
            if let Ok(name) = fs::read_to_string(&name_file) {
                if let Some(kind) = kind_from_keywords(&name) {
                    return Some(kind);
                }
            }
        }
        None
    }

    fn has_bluetooth_ancestor(dir: &Path) -> bool {
        let Ok(mut cur) = fs::canonicalize(dir.join("device")) else {
            return false;
        };
        for _ in 0..10 {
            let subsystem = cur.join("subsystem");
            if let Ok(target) = fs::read_link(&subsystem) {
                if target
                    .file_name()
                    .map(|n| n == "bluetooth")
                    .unwrap_or(false)
                {
                    return true;
                }
            }
            match cur.parent() {
                Some(p) => cur = p.to_path_buf(),
                None => break,
            }
        }
        false
    }

    /// Stable identity: system supplies are identified by their entry name
    /// (BAT0, AC), peripherals by vendor+model+serial so a re-created
    /// kernel device maps back onto the same logical peripheral.
    fn stable_identity(dir: &Path, sysname: &str, power_supply: bool) -> String {
        if power_supply {
            return sysname.to_string();
        }
        let vendor = Self::read_attr_str(dir, "manufacturer").unwrap_or_default();
        let model = Self::read_attr_str(dir, "model_name").unwrap_or_default();
        let serial = Self::read_attr_str(dir, "serial_number").unwrap_or_default();
        if vendor.is_empty() && model.is_empty() && serial.is_empty() {
            sysname.to_string()
        } else {
            format!("{}:{}:{}", vendor, model, serial)
        }
    }
}

impl Default for SysfsAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Peripheral keyword table; checked against input device names and model
/// strings, case-insensitively.
fn kind_from_keywords(name: &str) -> Option<DeviceKind> {
    let lower = name.to_ascii_lowercase();
    if lower.contains("mouse") || lower.contains("trackball") {
        Some(DeviceKind::Mouse)
    } else if lower.contains("keyboard") || lower.contains("kbd") {
        Some(DeviceKind::Keyboard)
    } else if lower.contains("gamepad") || lower.contains("controller") || lower.contains("joystick")
    {
        Some(DeviceKind::GamingInput)
    } else if lower.contains("phone") {
        Some(DeviceKind::Phone)
    } else if lower.contains("tablet") || lower.contains("pen") {
        Some(DeviceKind::Tablet)
    } else {
        None
    }
}

impl SourceAdapter for SysfsAdapter {
    fn name(&self) -> &'static str {
        "sysfs"
    }

    fn enumerate(&mut self) -> Result<Vec<RawSource>> {
        let mut sources = Vec::new();

        let entries = fs::read_dir(&self.root).map_err(|e| UpowerError::AdapterUnavailable {
            adapter: "sysfs",
            reason: format!("cannot read {:?}: {}", self.root, e),
        })?;

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!("skipping unreadable power_supply entry: {}", e);
                    continue;
                }
            };
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let sysname = entry.file_name().to_string_lossy().to_string();
            let (kind, power_supply) = Self::classify(&path);
            let identity = Self::stable_identity(&path, &sysname, power_supply);
            trace!(
                sysname = %sysname,
                kind = kind.as_str(),
                power_supply,
                "found power supply"
            );
            sources.push(RawSource {
                identity,
                native_path: path.to_string_lossy().to_string(),
                kind,
                power_supply,
            });
        }

        debug!("sysfs enumeration found {} sources", sources.len());
        Ok(sources)
    }

    fn subscribe(&mut self, sink: EventSink) -> Result<Subscription> {
        if self.mock {
            return Err(UpowerError::EventsNotSupported("sysfs"));
        }
        #[cfg(target_os = "linux")]
        {
            super::uevent::spawn_watcher(sink)
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = sink;
            Err(UpowerError::EventsNotSupported("sysfs"))
        }
    }

    fn refresh(&self, source: &RawSource) -> Result<RawSnapshot> {
        let dir = PathBuf::from(&source.native_path);
        if !dir.is_dir() {
            return Err(UpowerError::SourceNotFound(source.identity.clone()));
        }

        let mut snap = RawSnapshot::new();
        for attr in ATTRIBUTES {
            if let Some(bytes) = Self::read_attr(&dir, attr) {
                snap.insert(*attr, bytes);
            }
        }

        if snap.is_empty() {
            warn!(
                "source {} produced an empty snapshot; treating fields as unknown",
                source.identity
            );
        }
        Ok(snap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_attrs(dir: &Path, attrs: &[(&str, &str)]) {
        fs::create_dir_all(dir).unwrap();
        for (name, value) in attrs {
            fs::write(dir.join(name), format!("{}\n", value)).unwrap();
        }
    }

    #[test]
    fn test_enumerate_and_classify() {
        let tmp = tempfile::tempdir().unwrap();
        write_attrs(
            &tmp.path().join("AC"),
            &[("type", "Mains"), ("online", "1")],
        );
        write_attrs(
            &tmp.path().join("BAT0"),
            &[
                ("type", "Battery"),
                ("status", "Discharging"),
                ("present", "1"),
            ],
        );
        write_attrs(
            &tmp.path().join("hidpp_battery_0"),
            &[
                ("type", "Battery"),
                ("scope", "Device"),
                ("model_name", "Fancy BT mouse"),
                ("capacity", "30"),
            ],
        );

        let mut adapter = SysfsAdapter::with_root(tmp.path());
        let mut sources = adapter.enumerate().unwrap();
        sources.sort_by(|a, b| a.native_path.cmp(&b.native_path));
        assert_eq!(sources.len(), 3);

        let ac = sources.iter().find(|s| s.identity == "AC").unwrap();
        assert_eq!(ac.kind, DeviceKind::LinePower);
        assert!(ac.power_supply);

        let bat = sources.iter().find(|s| s.identity == "BAT0").unwrap();
        assert_eq!(bat.kind, DeviceKind::Battery);
        assert!(bat.power_supply);

        let mouse = sources
            .iter()
            .find(|s| s.kind == DeviceKind::Mouse)
            .unwrap();
        assert!(!mouse.power_supply);
        // identity comes from vendor+model+serial, not the kernel entry name
        assert_eq!(mouse.identity, ":Fancy BT mouse:");
    }

    #[test]
    fn test_refresh_skips_unreadable_attributes() {
        let tmp = tempfile::tempdir().unwrap();
        let bat = tmp.path().join("BAT0");
        write_attrs(
            &bat,
            &[
                ("type", "Battery"),
                ("status", "Charging"),
                ("energy_now", "48000000"),
            ],
        );

        let adapter = SysfsAdapter::with_root(tmp.path());
        let source = RawSource {
            identity: "BAT0".into(),
            native_path: bat.to_string_lossy().to_string(),
            kind: DeviceKind::Battery,
            power_supply: true,
        };
        let snap = adapter.refresh(&source).unwrap();
        assert_eq!(snap.get_str("status"), Some("Charging"));
        assert_eq!(snap.get_f64("energy_now"), Some(48000000.0));
        assert!(!snap.contains("voltage_now"));
    }

    #[test]
    fn test_refresh_vanished_source_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = SysfsAdapter::with_root(tmp.path());
        let source = RawSource {
            identity: "BAT9".into(),
            native_path: tmp.path().join("BAT9").to_string_lossy().to_string(),
            kind: DeviceKind::Battery,
            power_supply: true,
        };
        assert!(adapter.refresh(&source).is_err());
    }

    #[test]
    fn test_mock_adapter_has_no_events() {
        let tmp = tempfile::tempdir().unwrap();
        let mut adapter = SysfsAdapter::with_root(tmp.path());
        let result = adapter.subscribe(Box::new(|_| {}));
        assert!(matches!(result, Err(UpowerError::EventsNotSupported(_))));
    }
}
