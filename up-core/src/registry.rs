//! Device registry and system-wide derived state.
//!
//! The registry owns the authoritative device values, keyed by object
//! path. All mutation happens on the daemon's main loop, so readers always
//! observe a consistent snapshot. The derived computations (OnBattery, the
//! display device, the global warning level input set) are pure functions
//! of the current device set and commutative over update order.

use std::collections::BTreeMap;

use up_protocol::{DeviceKind, DeviceState, WarningLevel, DISPLAY_DEVICE_PATH};

use crate::constants::time_estimate;
use crate::device::UpDevice;

#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: BTreeMap<String, UpDevice>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, device: UpDevice) {
        self.devices.insert(device.object_path.clone(), device);
    }

    pub fn remove(&mut self, object_path: &str) -> Option<UpDevice> {
        self.devices.remove(object_path)
    }

    pub fn get(&self, object_path: &str) -> Option<&UpDevice> {
        self.devices.get(object_path)
    }

    pub fn contains(&self, object_path: &str) -> bool {
        self.devices.contains_key(object_path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &UpDevice> {
        self.devices.values()
    }

    pub fn paths(&self) -> Vec<String> {
        self.devices.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Whether any system line-power source is online.
    pub fn on_ac(&self) -> bool {
        self.devices
            .values()
            .any(|d| d.kind == DeviceKind::LinePower && d.power_supply && d.online)
    }

    /// System-wide OnBattery.
    ///
    /// True when a system battery is discharging with no online mains, or
    /// when a UPS is discharging; a UPS running down counts regardless of
    /// what any separate AC source claims.
    pub fn on_battery(&self) -> bool {
        let ups_discharging = self
            .devices
            .values()
            .any(|d| d.kind == DeviceKind::Ups && d.is_supplying());
        if ups_discharging {
            return true;
        }

        let battery_discharging = self
            .devices
            .values()
            .any(|d| d.kind == DeviceKind::Battery && d.is_present && d.is_supplying());
        battery_discharging && !self.on_ac()
    }

    /// Synthesize the aggregate display device over every system battery
    /// and UPS.
    pub fn synthesize_display(&self, now: u64) -> UpDevice {
        let batteries: Vec<&UpDevice> = self
            .devices
            .values()
            .filter(|d| d.is_system_battery())
            .collect();

        let mut display = UpDevice::new(DISPLAY_DEVICE_PATH, "", DeviceKind::Unknown);
        display.power_supply = true;
        display.update_time = now;

        match batteries.len() {
            0 => {
                // Nothing to run out of; UI reads this as "all good"
                display.state = DeviceState::FullyCharged;
                display.warning_level = WarningLevel::None;
            }
            1 => {
                let only = batteries[0];
                display = only.clone();
                display.object_path = DISPLAY_DEVICE_PATH.to_string();
                display.update_time = now;
            }
            _ => {
                let mut energy = 0.0;
                let mut energy_full = 0.0;
                let mut energy_full_design = 0.0;
                let mut energy_rate = 0.0;
                let mut any_charging = false;
                let mut any_discharging = false;
                let mut all_full = true;

                for dev in &batteries {
                    energy += dev.energy;
                    energy_full += dev.energy_full;
                    energy_full_design += dev.energy_full_design;
                    energy_rate += dev.energy_rate;
                    match dev.state {
                        DeviceState::Charging => any_charging = true,
                        DeviceState::Discharging => any_discharging = true,
                        _ => {}
                    }
                    if dev.state != DeviceState::FullyCharged {
                        all_full = false;
                    }
                }

                display.kind = DeviceKind::Battery;
                display.is_present = true;
                display.is_rechargeable = true;
                display.energy = energy;
                display.energy_full = energy_full;
                display.energy_full_design = energy_full_design;
                display.energy_rate = energy_rate;
                display.state = if any_charging {
                    DeviceState::Charging
                } else if all_full {
                    DeviceState::FullyCharged
                } else if any_discharging {
                    DeviceState::Discharging
                } else {
                    DeviceState::Unknown
                };
                if energy_full > 0.0 {
                    display.percentage = (100.0 * energy / energy_full).clamp(0.0, 100.0);
                }
                if energy_rate > 0.0 {
                    match display.state {
                        DeviceState::Discharging => {
                            display.time_to_empty = clamp_estimate(energy / energy_rate * 3600.0);
                        }
                        DeviceState::Charging => {
                            display.time_to_full =
                                clamp_estimate((energy_full - energy) / energy_rate * 3600.0);
                        }
                        _ => {}
                    }
                }
            }
        }

        display
    }
}

fn clamp_estimate(seconds: f64) -> i64 {
    let rounded = seconds.round() as i64;
    if (time_estimate::MIN_SECS..=time_estimate::MAX_SECS).contains(&rounded) {
        rounded
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn battery(path: &str, state: DeviceState, energy: f64, energy_full: f64) -> UpDevice {
        let mut dev = UpDevice::new(path, path, DeviceKind::Battery);
        dev.power_supply = true;
        dev.is_present = true;
        dev.state = state;
        dev.energy = energy;
        dev.energy_full = energy_full;
        dev.energy_full_design = energy_full;
        dev.percentage = if energy_full > 0.0 {
            100.0 * energy / energy_full
        } else {
            0.0
        };
        dev
    }

    fn line_power(path: &str, online: bool) -> UpDevice {
        let mut dev = UpDevice::new(path, path, DeviceKind::LinePower);
        dev.power_supply = true;
        dev.is_present = true;
        dev.online = online;
        dev
    }

    #[test]
    fn test_on_battery_truth_table() {
        let mut reg = DeviceRegistry::new();

        // No devices at all: not on battery
        assert!(!reg.on_battery());

        // Discharging battery, no line power
        reg.insert(battery("/b0", DeviceState::Discharging, 48.0, 60.0));
        assert!(reg.on_battery());

        // Mains comes online: kernel may lag the battery state
        reg.insert(line_power("/ac", true));
        assert!(!reg.on_battery());

        // Mains offline again
        reg.insert(line_power("/ac", false));
        assert!(reg.on_battery());

        // Battery charges: not on battery even with mains offline
        reg.insert(battery("/b0", DeviceState::Charging, 48.0, 60.0));
        assert!(!reg.on_battery());
    }

    #[test]
    fn test_on_battery_pending_discharge_counts() {
        let mut reg = DeviceRegistry::new();
        reg.insert(battery("/b0", DeviceState::PendingDischarge, 48.0, 60.0));
        assert!(reg.on_battery());
    }

    #[test]
    fn test_ups_on_battery_overrides_online_ac() {
        let mut reg = DeviceRegistry::new();
        let mut ups = battery("/ups", DeviceState::Discharging, 100.0, 200.0);
        ups.kind = DeviceKind::Ups;
        reg.insert(ups);
        reg.insert(line_power("/ac", true));
        assert!(reg.on_battery());
    }

    #[test]
    fn test_peripheral_does_not_affect_on_battery() {
        let mut reg = DeviceRegistry::new();
        let mut mouse = battery("/mouse", DeviceState::Discharging, 0.0, 0.0);
        mouse.kind = DeviceKind::Mouse;
        mouse.power_supply = false;
        reg.insert(mouse);
        assert!(!reg.on_battery());
    }

    #[test]
    fn test_display_no_batteries() {
        let reg = DeviceRegistry::new();
        let display = reg.synthesize_display(1000);
        assert_eq!(display.kind, DeviceKind::Unknown);
        assert_eq!(display.state, DeviceState::FullyCharged);
        assert_eq!(display.warning_level, WarningLevel::None);
        assert_eq!(display.object_path, DISPLAY_DEVICE_PATH);
    }

    #[test]
    fn test_display_single_battery_mirrors() {
        let mut reg = DeviceRegistry::new();
        reg.insert(battery("/b0", DeviceState::Discharging, 48.0, 60.0));
        let display = reg.synthesize_display(1000);
        assert_eq!(display.object_path, DISPLAY_DEVICE_PATH);
        assert_eq!(display.state, DeviceState::Discharging);
        assert!((display.percentage - 80.0).abs() < 1e-9);
        assert!((display.energy - 48.0).abs() < 1e-9);
    }

    #[test]
    fn test_display_multiple_batteries_sums() {
        // Scenario: BAT0 at 48/60 Wh plus BAT1 at 1.5/60 Wh
        let mut reg = DeviceRegistry::new();
        reg.insert(battery("/b0", DeviceState::Discharging, 48.0, 60.0));
        reg.insert(battery("/b1", DeviceState::Discharging, 1.5, 60.0));

        let display = reg.synthesize_display(1000);
        assert_eq!(display.kind, DeviceKind::Battery);
        assert_eq!(display.state, DeviceState::Discharging);
        assert!((display.energy - 49.5).abs() < 1e-9);
        assert!((display.energy_full - 120.0).abs() < 1e-9);
        assert!((display.percentage - 41.25).abs() < 1e-9);
    }

    #[test]
    fn test_display_state_precedence() {
        let mut reg = DeviceRegistry::new();
        reg.insert(battery("/b0", DeviceState::Discharging, 30.0, 60.0));
        reg.insert(battery("/b1", DeviceState::Charging, 30.0, 60.0));
        assert_eq!(
            reg.synthesize_display(0).state,
            DeviceState::Charging
        );

        reg.insert(battery("/b1", DeviceState::FullyCharged, 60.0, 60.0));
        assert_eq!(
            reg.synthesize_display(0).state,
            DeviceState::Discharging
        );

        reg.insert(battery("/b0", DeviceState::FullyCharged, 60.0, 60.0));
        assert_eq!(
            reg.synthesize_display(0).state,
            DeviceState::FullyCharged
        );
    }

    #[test]
    fn test_display_recomputes_times_from_sums() {
        let mut reg = DeviceRegistry::new();
        let mut b0 = battery("/b0", DeviceState::Discharging, 24.0, 60.0);
        b0.energy_rate = 6.0;
        let mut b1 = battery("/b1", DeviceState::Discharging, 24.0, 60.0);
        b1.energy_rate = 6.0;
        reg.insert(b0);
        reg.insert(b1);

        let display = reg.synthesize_display(0);
        assert!((display.energy_rate - 12.0).abs() < 1e-9);
        // 48 Wh at 12 W = 4 h
        assert_eq!(display.time_to_empty, 4 * 3600);
    }
}
