//! Snapshot normalization.
//!
//! Turns one `RawSnapshot` plus the prior device value into a fresh
//! `UpDevice`. This is a pure function over its inputs; the only carried
//! state is the per-device `RateEstimator` the backend owns.
//!
//! Kernel units are micro-units (µWh, µAh, µV, µW, µA) and tenths of a
//! degree for temperature; everything is normalized to Wh / V / W / °C
//! here. Sources that only report charge (Ah) or a bare capacity
//! percentage are converted using the design voltage when available.

use tracing::{debug, warn};

use up_protocol::{DeviceKind, DeviceState, WarningLevel};

use crate::constants::{rate, time_estimate, CHARGED_THRESHOLD_PCT, EMPTY_EPSILON_WH};
use crate::device::{sanitize_text, technology_from_str, UpDevice};
use crate::source::{RawSnapshot, RawSource};

/// Ambient facts normalization needs beyond the snapshot itself.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeEnv {
    /// Seconds since the epoch
    pub now: u64,
    /// Whether any system line-power source is currently online
    pub on_ac: bool,
}

/// Per-device rate smoothing state.
///
/// Keeps an exponentially weighted moving average of the energy flow and
/// the last usable energy sample. Deltas closer together than the minimum
/// spacing are ignored, and a sign flip inside the flip window discards the
/// sample so charge/discharge bounce does not pollute the estimate.
#[derive(Debug, Default, Clone)]
pub struct RateEstimator {
    ewma: Option<f64>,
    anchor: Option<(f64, u64)>,
    direction: Option<i8>,
    last_flip: u64,
}

impl RateEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything; used when a device enters fully_charged/empty or
    /// vanishes.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Drop the delta anchor across a state transition so the first sample
    /// of the new state does not span two regimes.
    pub fn reset_anchor(&mut self) {
        self.anchor = None;
        self.direction = None;
    }

    /// Record an energy reading without deriving a rate from it, keeping
    /// the anchor fresh for later derived samples.
    pub fn note_energy(&mut self, energy: f64, now: u64) {
        self.anchor = Some((energy, now));
    }

    /// Blend a directly reported power reading into the average.
    pub fn smooth(&mut self, watts: f64) -> f64 {
        let blended = match self.ewma {
            Some(prev) => rate::SMOOTHING_FACTOR * watts + (1.0 - rate::SMOOTHING_FACTOR) * prev,
            None => watts,
        };
        self.ewma = Some(blended);
        blended
    }

    /// Derive a rate from successive energy readings. Returns the current
    /// estimate, which may be a held previous value when this sample is
    /// unusable, or None when no estimate exists yet.
    pub fn derive(&mut self, energy: f64, now: u64) -> Option<f64> {
        let Some((old_energy, old_time)) = self.anchor else {
            self.anchor = Some((energy, now));
            return self.ewma;
        };

        let dt = now.saturating_sub(old_time);
        if dt < rate::MIN_SAMPLE_SPACING_SECS {
            return self.ewma;
        }

        self.anchor = Some((energy, now));
        let delta = energy - old_energy;
        if delta.abs() < 1e-9 {
            return self.ewma;
        }

        let direction: i8 = if delta > 0.0 { 1 } else { -1 };
        if let Some(prev) = self.direction {
            if prev != direction && now.saturating_sub(self.last_flip) < rate::SIGN_FLIP_WINDOW_SECS
            {
                self.last_flip = now;
                self.direction = Some(direction);
                return self.ewma;
            }
        }
        if self.direction != Some(direction) {
            self.last_flip = now;
        }
        self.direction = Some(direction);

        let watts = delta.abs() * 3600.0 / dt as f64;
        Some(self.smooth(watts))
    }

    pub fn current(&self) -> Option<f64> {
        self.ewma
    }
}

/// Normalize one snapshot into a fresh device value.
pub fn normalize(
    source: &RawSource,
    snap: &RawSnapshot,
    prior: Option<&UpDevice>,
    estimator: &mut RateEstimator,
    env: &NormalizeEnv,
) -> UpDevice {
    match source.kind {
        DeviceKind::LinePower => normalize_line_power(source, snap, env),
        _ => normalize_battery(source, snap, prior, estimator, env),
    }
}

fn base_device(source: &RawSource, env: &NormalizeEnv) -> UpDevice {
    let mut dev = UpDevice::new(
        up_protocol::object_path_for(source.kind, &source.native_path),
        source.native_path.clone(),
        source.kind,
    );
    dev.power_supply = source.power_supply;
    dev.update_time = env.now;
    dev
}

fn normalize_line_power(source: &RawSource, snap: &RawSnapshot, env: &NormalizeEnv) -> UpDevice {
    let mut dev = base_device(source, env);
    dev.online = snap.get_bool("online").unwrap_or(false);
    dev.is_present = true;
    dev.warning_level = WarningLevel::None;
    dev
}

fn normalize_battery(
    source: &RawSource,
    snap: &RawSnapshot,
    prior: Option<&UpDevice>,
    estimator: &mut RateEstimator,
    env: &NormalizeEnv,
) -> UpDevice {
    let mut dev = base_device(source, env);

    dev.is_present = snap.get_bool("present").unwrap_or(true);
    if !dev.is_present {
        // Just been yanked; publish a blank present=false device
        estimator.reset();
        dev.warning_level = WarningLevel::None;
        return dev;
    }

    dev.is_rechargeable = true;
    if let Some(raw) = snap.raw("manufacturer") {
        dev.vendor = sanitize_text(raw);
    }
    if let Some(raw) = snap.raw("model_name") {
        dev.model = sanitize_text(raw);
    }
    if let Some(raw) = snap.raw("serial_number") {
        dev.serial = sanitize_text(raw);
    }
    if let Some(tech) = snap.get_str("technology") {
        dev.technology = technology_from_str(tech);
    }

    let voltage_now = micro(snap, "voltage_now").or_else(|| micro(snap, "voltage_avg"));
    dev.voltage = voltage_now.unwrap_or(0.0);
    if let Some(tenths) = snap.get_f64("temp") {
        dev.temperature = tenths / 10.0;
    }

    // Voltage used to convert charge (Ah) into energy (Wh): the design
    // voltage when the firmware reports one, the present voltage otherwise
    let conv_voltage = micro(snap, "voltage_max_design")
        .filter(|v| *v >= 1.0)
        .or_else(|| micro(snap, "voltage_min_design").filter(|v| *v >= 1.0))
        .or_else(|| micro(snap, "voltage_present").filter(|v| *v >= 1.0))
        .or(voltage_now);

    // Energy derivation, in the precedence order of the table: energy_*
    // attributes win, charge_* × voltage next, capacity-scaled last
    let mut energy = micro(snap, "energy_now").or_else(|| micro(snap, "energy_avg"));
    let mut energy_full = micro(snap, "energy_full");
    let mut energy_full_design = micro(snap, "energy_full_design");

    if let Some(volts) = conv_voltage {
        if energy.is_none() {
            if let Some(charge) = micro(snap, "charge_now").or_else(|| micro(snap, "charge_avg")) {
                energy = Some(charge * volts);
            }
        }
        if energy_full.is_none() {
            if let Some(charge_full) = micro(snap, "charge_full") {
                energy_full = Some(charge_full * volts);
            }
        }
        if energy_full_design.is_none() {
            if let Some(cfd) = micro(snap, "charge_full_design") {
                energy_full_design = Some(cfd * volts);
            }
        }
    }

    let capacity_attr = snap.get_f64("capacity");
    if energy.is_none() {
        if let (Some(cap), Some(full)) = (capacity_attr, energy_full) {
            energy = Some(full * cap / 100.0);
        }
    }
    if energy_full.is_none() && energy_full_design.is_some() {
        debug!(
            "{}: no last-full reading, falling back to the design value",
            source.identity
        );
        energy_full = energy_full_design;
    }

    // Repair the energy <= energy_full <= energy_full_design chain by
    // raising the upper bounds; packs routinely hold more than they claim
    if let (Some(e), Some(full)) = (energy, energy_full) {
        if e > full {
            warn!(
                "{}: energy {:.1} Wh above last full {:.1} Wh; raising full",
                source.identity, e, full
            );
            energy_full = Some(e);
        }
    }
    if let (Some(full), Some(design)) = (energy_full, energy_full_design) {
        if full > design {
            energy_full_design = Some(full);
        }
    }

    let mut percentage = match (energy, energy_full) {
        (Some(e), Some(full)) if full > 0.0 => 100.0 * e / full,
        _ => capacity_attr.unwrap_or(0.0),
    };
    percentage = percentage.clamp(0.0, 100.0);

    let mut state = parse_status(snap.get_str("status"), &source.identity);

    // Unknown-state resolution ladder
    if state == DeviceState::Unknown {
        if let Some(e) = energy {
            if e < EMPTY_EPSILON_WH {
                debug!("{}: unknown state with no charge, publishing empty", source.identity);
                state = DeviceState::Empty;
            }
        }
    }
    if state == DeviceState::Unknown && percentage >= CHARGED_THRESHOLD_PCT {
        state = DeviceState::FullyCharged;
    }
    if state == DeviceState::Unknown {
        match prior.filter(|p| p.update_time > 0 && p.is_present) {
            Some(p) => {
                if let Some(e) = energy {
                    if e > p.energy + 1e-6 {
                        state = DeviceState::Charging;
                    } else if e < p.energy - 1e-6 {
                        state = DeviceState::Discharging;
                    }
                    // flat and not full stays unknown
                }
            }
            None => {
                state = if env.on_ac {
                    DeviceState::Charging
                } else {
                    DeviceState::Discharging
                };
            }
        }
    }

    // Rate: directly reported power is preferred, still smoothed; derived
    // |dE/dt| otherwise. Garbage readings read as unknown.
    let direct_watts = direct_rate(snap, conv_voltage);
    if prior.map(|p| p.state) != Some(state) {
        estimator.reset_anchor();
    }
    let energy_rate = match state {
        DeviceState::FullyCharged | DeviceState::Empty => {
            estimator.reset();
            0.0
        }
        DeviceState::Charging | DeviceState::Discharging => match direct_watts {
            Some(watts) => {
                if let Some(e) = energy {
                    estimator.note_energy(e, env.now);
                }
                estimator.smooth(watts)
            }
            None => match energy {
                Some(e) => estimator.derive(e, env.now).unwrap_or(0.0),
                None => 0.0,
            },
        },
        _ => {
            if let Some(e) = energy {
                estimator.note_energy(e, env.now);
            }
            0.0
        }
    };

    // Time estimates from the smoothed rate; implausible results are
    // unknown rather than wrong
    let mut time_to_empty = 0;
    let mut time_to_full = 0;
    if energy_rate > 0.0 {
        match state {
            DeviceState::Discharging => {
                if let Some(e) = energy {
                    time_to_empty = clamp_estimate(e / energy_rate * 3600.0);
                }
            }
            DeviceState::Charging => {
                if let (Some(e), Some(full)) = (energy, energy_full) {
                    time_to_full = clamp_estimate((full - e) / energy_rate * 3600.0);
                }
            }
            _ => {}
        }
    }
    // Firmware-provided estimates fill in when no rate is available
    if time_to_empty == 0 && state == DeviceState::Discharging {
        if let Some(minutes) = snap.get_f64("minutes_left") {
            time_to_empty = clamp_estimate(minutes * 60.0);
        }
        if let Some(seconds) = snap.get_f64("runtime_to_empty") {
            time_to_empty = clamp_estimate(seconds);
        }
    }

    dev.energy = energy.unwrap_or(0.0);
    dev.energy_empty = micro(snap, "energy_empty")
        .or_else(|| conv_voltage.and_then(|v| micro(snap, "charge_empty").map(|c| c * v)))
        .unwrap_or(0.0);
    dev.energy_full = energy_full.unwrap_or(0.0);
    dev.energy_full_design = energy_full_design.unwrap_or(0.0);
    dev.percentage = percentage;
    dev.state = state;
    dev.energy_rate = energy_rate;
    dev.time_to_empty = time_to_empty;
    dev.time_to_full = time_to_full;
    if let (Some(full), Some(design)) = (energy_full, energy_full_design) {
        if design > 0.0 {
            dev.capacity = (100.0 * full / design).clamp(0.0, 100.0);
        }
    }
    dev.warning_level = prior
        .map(|p| p.warning_level)
        .unwrap_or(WarningLevel::Unknown);

    dev
}

/// Scale a micro-unit attribute down to its base unit.
fn micro(snap: &RawSnapshot, key: &str) -> Option<f64> {
    snap.get_f64(key).map(|v| v / 1_000_000.0)
}

fn parse_status(status: Option<&str>, identity: &str) -> DeviceState {
    let Some(status) = status else {
        return DeviceState::Unknown;
    };
    let lower = status.to_ascii_lowercase();
    match lower.as_str() {
        "charging" => DeviceState::Charging,
        "discharging" => DeviceState::Discharging,
        "full" => DeviceState::FullyCharged,
        "empty" => DeviceState::Empty,
        "not charging" => DeviceState::PendingCharge,
        "unknown" => DeviceState::Unknown,
        _ => {
            warn!("{}: unknown status string {:?}", identity, status);
            DeviceState::Unknown
        }
    }
}

/// Directly reported energy flow, when present and sane.
fn direct_rate(snap: &RawSnapshot, conv_voltage: Option<f64>) -> Option<f64> {
    // ACPI reports the "Ones" sentinel when it cannot compute a rate
    if snap.get_u64("power_now") == Some(rate::ACPI_ONES)
        || snap.get_u64("current_now") == Some(rate::ACPI_ONES)
    {
        return None;
    }

    let watts = match micro(snap, "power_now") {
        Some(power) => power.abs(),
        None => {
            let amps = micro(snap, "current_now")?;
            (amps * conv_voltage?).abs()
        }
    };

    if watts <= 0.0 || watts > rate::MAX_SANE_WATTS {
        return None;
    }
    Some(watts)
}

fn clamp_estimate(seconds: f64) -> i64 {
    let rounded = seconds.round() as i64;
    if (time_estimate::MIN_SECS..=time_estimate::MAX_SECS).contains(&rounded) {
        rounded
    } else {
        0
    }
}
