//! The normalized device model.
//!
//! A `UpDevice` is plain data: the backend produces new values through
//! normalization and the aggregator owns the authoritative copy. There is no
//! behavior attached beyond conversion helpers.

use up_protocol::{
    DeviceKind, DeviceSnapshot, DeviceState, Technology, WarningLevel,
};

/// Normalized view of one power source.
#[derive(Debug, Clone, PartialEq)]
pub struct UpDevice {
    pub object_path: String,
    pub native_path: String,
    pub kind: DeviceKind,
    pub state: DeviceState,
    /// Line power only: whether mains is connected
    pub online: bool,
    pub is_present: bool,
    pub is_rechargeable: bool,
    /// True for sources that can power the host (system batteries, mains, UPS)
    pub power_supply: bool,
    /// Charge in [0, 100]
    pub percentage: f64,
    /// Wh
    pub energy: f64,
    pub energy_empty: f64,
    pub energy_full: f64,
    pub energy_full_design: f64,
    /// W, magnitude of energy flow
    pub energy_rate: f64,
    /// V
    pub voltage: f64,
    /// °C
    pub temperature: f64,
    /// Seconds; 0 means unknown
    pub time_to_empty: i64,
    pub time_to_full: i64,
    /// energy_full / energy_full_design × 100
    pub capacity: f64,
    pub technology: Technology,
    pub warning_level: WarningLevel,
    pub vendor: String,
    pub model: String,
    pub serial: String,
    /// Seconds since the epoch of the last refresh
    pub update_time: u64,
}

impl Default for UpDevice {
    fn default() -> Self {
        Self {
            object_path: String::new(),
            native_path: String::new(),
            kind: DeviceKind::Unknown,
            state: DeviceState::Unknown,
            online: false,
            is_present: false,
            is_rechargeable: false,
            power_supply: false,
            percentage: 0.0,
            energy: 0.0,
            energy_empty: 0.0,
            energy_full: 0.0,
            energy_full_design: 0.0,
            energy_rate: 0.0,
            voltage: 0.0,
            temperature: 0.0,
            time_to_empty: 0,
            time_to_full: 0,
            capacity: 0.0,
            technology: Technology::Unknown,
            warning_level: WarningLevel::Unknown,
            vendor: String::new(),
            model: String::new(),
            serial: String::new(),
            update_time: 0,
        }
    }
}

impl UpDevice {
    pub fn new(object_path: impl Into<String>, native_path: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            object_path: object_path.into(),
            native_path: native_path.into(),
            kind,
            ..Self::default()
        }
    }

    /// True for devices that count as "the machine's battery": system
    /// batteries and UPSes that can power the host.
    pub fn is_system_battery(&self) -> bool {
        self.power_supply && matches!(self.kind, DeviceKind::Battery | DeviceKind::Ups)
    }

    /// True while this device is the thing keeping the host running.
    pub fn is_supplying(&self) -> bool {
        self.is_system_battery()
            && matches!(
                self.state,
                DeviceState::Discharging | DeviceState::PendingDischarge
            )
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            object_path: self.object_path.clone(),
            native_path: self.native_path.clone(),
            kind: self.kind,
            state: self.state,
            online: self.online,
            is_present: self.is_present,
            is_rechargeable: self.is_rechargeable,
            power_supply: self.power_supply,
            percentage: self.percentage,
            energy: self.energy,
            energy_empty: self.energy_empty,
            energy_full: self.energy_full,
            energy_full_design: self.energy_full_design,
            energy_rate: self.energy_rate,
            voltage: self.voltage,
            temperature: self.temperature,
            time_to_empty: self.time_to_empty,
            time_to_full: self.time_to_full,
            capacity: self.capacity,
            technology: self.technology,
            warning_level: self.warning_level,
            vendor: self.vendor.clone(),
            model: self.model.clone(),
            serial: self.serial.clone(),
            update_time: self.update_time,
        }
    }
}

/// Sanitize kernel-supplied text for the bus surface.
///
/// Bytes that do not form valid UTF-8 are dropped, control characters are
/// dropped, and surrounding whitespace is trimmed.
pub fn sanitize_text(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                out.push_str(valid);
                break;
            }
            Err(e) => {
                let (valid, after) = rest.split_at(e.valid_up_to());
                // valid_up_to() guarantees this slice is well-formed
                out.push_str(std::str::from_utf8(valid).unwrap_or(""));
                match e.error_len() {
                    Some(len) => rest = &after[len..],
                    None => break,
                }
            }
        }
    }
    out.retain(|c| !c.is_control());
    out.trim().to_string()
}

/// Map a kernel technology string onto the technology enum.
///
/// Every case combination of Li-Ion is seen in the wild, so matching is
/// case-insensitive.
pub fn technology_from_str(raw: &str) -> Technology {
    match raw.trim().to_ascii_lowercase().as_str() {
        "li-ion" | "lion" | "li-i" | "lithium-ion" => Technology::LithiumIon,
        "lip" | "lipo" | "li-poly" | "li-po" | "lithium-polymer" => Technology::LithiumPolymer,
        "lifo" | "life" | "lifepo4" => Technology::LithiumIronPhosphate,
        "pb" | "pbac" | "lead-acid" => Technology::LeadAcid,
        "nicd" | "ni-cd" => Technology::NickelCadmium,
        "nimh" | "ni-mh" => Technology::NickelMetalHydride,
        _ => Technology::Unknown,
    }
}
