//! Warning-level engine.
//!
//! Classifies batteries and UPSes into severity levels from their charge
//! and remaining runtime, with per-device hysteresis so a reading that
//! hovers around a threshold cannot flap the level.

use up_protocol::{DeviceKind, DeviceState, WarningLevel};

use crate::device::UpDevice;

/// Thresholds driving level computation; built from the daemon config.
#[derive(Debug, Clone, PartialEq)]
pub struct WarningPolicy {
    pub low_percentage: f64,
    pub critical_percentage: f64,
    pub action_percentage: f64,
    /// Seconds of runtime left
    pub low_time: i64,
    pub critical_time: i64,
    pub action_time: i64,
    /// When set, runtime estimates are ignored for policy
    pub use_percentage_for_policy: bool,
}

impl Default for WarningPolicy {
    fn default() -> Self {
        Self {
            low_percentage: 10.0,
            critical_percentage: 5.0,
            action_percentage: 2.0,
            low_time: 600,
            critical_time: 300,
            action_time: 120,
            use_percentage_for_policy: false,
        }
    }
}

/// Mouse/keyboard fuel gauges are coarse; warn earlier so the first report
/// a user sees is not already critical.
const PERIPHERAL_CRITICAL_PCT: f64 = 13.0;
const PERIPHERAL_LOW_PCT: f64 = 26.0;

/// Compute the raw (hysteresis-free) warning level for a device.
pub fn compute_raw(policy: &WarningPolicy, device: &UpDevice) -> WarningLevel {
    if device.state != DeviceState::Discharging {
        return WarningLevel::None;
    }

    match device.kind {
        DeviceKind::Mouse | DeviceKind::Keyboard => {
            return if device.percentage < PERIPHERAL_CRITICAL_PCT {
                WarningLevel::Critical
            } else if device.percentage < PERIPHERAL_LOW_PCT {
                WarningLevel::Low
            } else {
                WarningLevel::None
            };
        }
        DeviceKind::LinePower => return WarningLevel::None,
        _ => {}
    }

    // A UPS that has started discharging is always at least worth telling
    // the session about
    let default_level = if device.kind == DeviceKind::Ups {
        WarningLevel::Discharging
    } else {
        WarningLevel::None
    };

    let percentage_level = ladder(
        device.percentage,
        policy.low_percentage,
        policy.critical_percentage,
        policy.action_percentage,
        default_level,
    );

    // Runtime clauses apply only when an estimate exists and percentage
    // policy is not forced
    let time_level = if device.power_supply
        && !policy.use_percentage_for_policy
        && device.time_to_empty > 0
    {
        ladder(
            device.time_to_empty as f64,
            policy.low_time as f64,
            policy.critical_time as f64,
            policy.action_time as f64,
            default_level,
        )
    } else {
        default_level
    };

    percentage_level.max(time_level)
}

fn ladder(value: f64, low: f64, critical: f64, action: f64, default_level: WarningLevel) -> WarningLevel {
    if value > low {
        default_level
    } else if value > critical {
        WarningLevel::Low
    } else if value > action {
        WarningLevel::Critical
    } else {
        WarningLevel::Action
    }
}

/// Per-device hysteresis state.
///
/// Once a device reaches low/critical/action it only de-escalates when it
/// is no longer discharging and its percentage has risen at least one
/// point above the threshold that triggered the level.
#[derive(Debug, Clone, Default)]
pub struct WarningTracker {
    level: WarningLevel,
    entry_threshold: f64,
}

impl WarningTracker {
    pub fn new() -> Self {
        Self {
            level: WarningLevel::None,
            entry_threshold: 0.0,
        }
    }

    pub fn level(&self) -> WarningLevel {
        self.level
    }

    /// Feed the latest device value through the policy and return the
    /// published level.
    pub fn update(&mut self, policy: &WarningPolicy, device: &UpDevice) -> WarningLevel {
        let raw = compute_raw(policy, device);

        if raw >= self.level {
            if raw > self.level && raw >= WarningLevel::Low {
                self.entry_threshold = entry_threshold_for(policy, raw);
            }
            self.level = raw;
            return self.level;
        }

        // De-escalation request
        if self.level >= WarningLevel::Low {
            let can_leave = device.state != DeviceState::Discharging
                && device.percentage >= self.entry_threshold + 1.0;
            if can_leave {
                self.level = raw;
            }
        } else {
            self.level = raw;
        }
        self.level
    }
}

fn entry_threshold_for(policy: &WarningPolicy, level: WarningLevel) -> f64 {
    match level {
        WarningLevel::Action => policy.action_percentage,
        WarningLevel::Critical => policy.critical_percentage,
        _ => policy.low_percentage,
    }
}
