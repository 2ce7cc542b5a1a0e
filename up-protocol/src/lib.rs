use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Global request ID counter for correlation
static REQUEST_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Maximum message size for IPC (512 KiB; history replies are the largest frames)
pub const MAX_MESSAGE_SIZE: usize = 512 * 1024;

/// Maximum object-path length accepted from clients
const MAX_PATH_LENGTH: usize = 256;

/// Upper bound on a history query window (30 days, seconds)
pub const MAX_HISTORY_TIMESPAN: u32 = 30 * 24 * 60 * 60;

/// Upper bound on requested history points per query
pub const MAX_HISTORY_RESOLUTION: u32 = 4096;

/// Manager object path
pub const MANAGER_PATH: &str = "/org/freedesktop/UPower";

/// Prefix under which per-device objects live
pub const DEVICES_PREFIX: &str = "/org/freedesktop/UPower/devices/";

/// Synthetic aggregate device path
pub const DISPLAY_DEVICE_PATH: &str = "/org/freedesktop/UPower/devices/DisplayDevice";

/// Generate a unique request ID for correlation
pub fn generate_request_id() -> u64 {
    REQUEST_ID_COUNTER.fetch_add(1, Ordering::SeqCst)
}

// ============================================================================
// Device Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    #[default]
    Unknown,
    LinePower,
    Battery,
    Ups,
    Mouse,
    Keyboard,
    Pda,
    Phone,
    MediaPlayer,
    Tablet,
    Computer,
    GamingInput,
    BluetoothGeneric,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Unknown => "unknown",
            DeviceKind::LinePower => "line_power",
            DeviceKind::Battery => "battery",
            DeviceKind::Ups => "ups",
            DeviceKind::Mouse => "mouse",
            DeviceKind::Keyboard => "keyboard",
            DeviceKind::Pda => "pda",
            DeviceKind::Phone => "phone",
            DeviceKind::MediaPlayer => "media_player",
            DeviceKind::Tablet => "tablet",
            DeviceKind::Computer => "computer",
            DeviceKind::GamingInput => "gaming_input",
            DeviceKind::BluetoothGeneric => "bluetooth_generic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceState {
    #[default]
    Unknown,
    Charging,
    Discharging,
    Empty,
    FullyCharged,
    PendingCharge,
    PendingDischarge,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Unknown => "unknown",
            DeviceState::Charging => "charging",
            DeviceState::Discharging => "discharging",
            DeviceState::Empty => "empty",
            DeviceState::FullyCharged => "fully_charged",
            DeviceState::PendingCharge => "pending_charge",
            DeviceState::PendingDischarge => "pending_discharge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "unknown" => DeviceState::Unknown,
            "charging" => DeviceState::Charging,
            "discharging" => DeviceState::Discharging,
            "empty" => DeviceState::Empty,
            "fully_charged" => DeviceState::FullyCharged,
            "pending_charge" => DeviceState::PendingCharge,
            "pending_discharge" => DeviceState::PendingDischarge,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Technology {
    #[default]
    Unknown,
    LithiumIon,
    LithiumPolymer,
    LithiumIronPhosphate,
    LeadAcid,
    NickelCadmium,
    NickelMetalHydride,
}

/// Severity classification, ordered from benign to urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WarningLevel {
    Unknown,
    #[default]
    None,
    Discharging,
    Low,
    Critical,
    Action,
}

impl WarningLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            WarningLevel::Unknown => "unknown",
            WarningLevel::None => "none",
            WarningLevel::Discharging => "discharging",
            WarningLevel::Low => "low",
            WarningLevel::Critical => "critical",
            WarningLevel::Action => "action",
        }
    }
}

/// One of the four per-device history series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HistoryKind {
    Rate,
    Charge,
    TimeFull,
    TimeEmpty,
}

impl HistoryKind {
    pub const ALL: [HistoryKind; 4] = [
        HistoryKind::Rate,
        HistoryKind::Charge,
        HistoryKind::TimeFull,
        HistoryKind::TimeEmpty,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryKind::Rate => "rate",
            HistoryKind::Charge => "charge",
            HistoryKind::TimeFull => "time-full",
            HistoryKind::TimeEmpty => "time-empty",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "rate" => HistoryKind::Rate,
            "charge" => HistoryKind::Charge,
            "time-full" => HistoryKind::TimeFull,
            "time-empty" => HistoryKind::TimeEmpty,
            _ => return None,
        })
    }
}

/// Statistics are profiled per charge direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatisticsKind {
    Charging,
    Discharging,
}

// ============================================================================
// Wire DTOs
// ============================================================================

/// Published view of a device: every attribute a client can read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub object_path: String,
    pub native_path: String,
    pub kind: DeviceKind,
    pub state: DeviceState,
    pub online: bool,
    pub is_present: bool,
    pub is_rechargeable: bool,
    pub power_supply: bool,
    pub percentage: f64,
    pub energy: f64,
    pub energy_empty: f64,
    pub energy_full: f64,
    pub energy_full_design: f64,
    pub energy_rate: f64,
    pub voltage: f64,
    pub temperature: f64,
    pub time_to_empty: i64,
    pub time_to_full: i64,
    pub capacity: f64,
    pub technology: Technology,
    pub warning_level: WarningLevel,
    pub vendor: String,
    pub model: String,
    pub serial: String,
    pub update_time: u64,
}

/// Manager-level properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonState {
    pub daemon_version: String,
    pub on_battery: bool,
    pub lid_is_closed: bool,
    pub lid_is_present: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HistoryPoint {
    pub time: u64,
    pub value: f64,
    pub state: DeviceState,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatisticsPoint {
    pub value: f64,
    pub accuracy: f64,
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    /// Unique request ID for correlation and debugging
    pub id: u64,
    /// The actual request
    #[serde(flatten)]
    pub request: Request,
}

impl RequestEnvelope {
    pub fn new(request: Request) -> Self {
        Self {
            id: generate_request_id(),
            request,
        }
    }

    pub fn with_id(request: Request, id: u64) -> Self {
        Self { id, request }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "data")]
pub enum Request {
    Ping,
    Version,
    /// Object paths of every registered device
    EnumerateDevices,
    /// Object path of the synthetic aggregate device
    GetDisplayDevice,
    /// Configured action string for the session agent
    GetCriticalAction,
    /// Manager properties (DaemonVersion, OnBattery, lid state)
    GetDaemonState,
    /// Full property snapshot of one device
    GetDevice { path: String },
    /// Force an immediate re-read of one device
    RefreshDevice { path: String },
    GetHistory {
        path: String,
        kind: HistoryKind,
        timespan: u32,
        resolution: u32,
    },
    GetStatistics {
        path: String,
        kind: StatisticsKind,
    },
    /// Switch this connection to an event stream
    Subscribe,
}

impl Request {
    /// Validate request parameters before dispatch
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Request::Ping
            | Request::Version
            | Request::EnumerateDevices
            | Request::GetDisplayDevice
            | Request::GetCriticalAction
            | Request::GetDaemonState
            | Request::Subscribe => Ok(()),

            Request::GetDevice { path } | Request::RefreshDevice { path } => {
                validate_object_path(path)
            }

            Request::GetHistory {
                path,
                kind: _,
                timespan,
                resolution,
            } => {
                validate_object_path(path)?;
                if *timespan == 0 || *timespan > MAX_HISTORY_TIMESPAN {
                    return Err(format!(
                        "Timespan out of range (1-{} seconds)",
                        MAX_HISTORY_TIMESPAN
                    ));
                }
                if *resolution == 0 || *resolution > MAX_HISTORY_RESOLUTION {
                    return Err(format!(
                        "Resolution out of range (1-{} points)",
                        MAX_HISTORY_RESOLUTION
                    ));
                }
                Ok(())
            }

            Request::GetStatistics { path, kind: _ } => validate_object_path(path),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Request::Ping => "Ping",
            Request::Version => "Version",
            Request::EnumerateDevices => "EnumerateDevices",
            Request::GetDisplayDevice => "GetDisplayDevice",
            Request::GetCriticalAction => "GetCriticalAction",
            Request::GetDaemonState => "GetDaemonState",
            Request::GetDevice { .. } => "GetDevice",
            Request::RefreshDevice { .. } => "RefreshDevice",
            Request::GetHistory { .. } => "GetHistory",
            Request::GetStatistics { .. } => "GetStatistics",
            Request::Subscribe => "Subscribe",
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Request ID this response corresponds to
    pub id: u64,
    /// The actual response
    #[serde(flatten)]
    pub response: Response,
}

impl ResponseEnvelope {
    pub fn new(id: u64, response: Response) -> Self {
        Self { id, response }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum Response {
    #[serde(rename = "ok")]
    Ok(ResponseData),
    #[serde(rename = "error")]
    Error { name: String, message: String },
}

/// Response payload - at most one field is populated per reply
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paths: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daemon: Option<DaemonState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<HistoryPoint>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub statistics: Option<Vec<StatisticsPoint>>,
}

impl ResponseData {
    pub fn none() -> Self {
        Self::default()
    }
    pub fn string(v: impl Into<String>) -> Self {
        Self { value: Some(v.into()), ..Self::default() }
    }
    pub fn paths(p: Vec<String>) -> Self {
        Self { paths: Some(p), ..Self::default() }
    }
    pub fn device(d: DeviceSnapshot) -> Self {
        Self { device: Some(d), ..Self::default() }
    }
    pub fn daemon(d: DaemonState) -> Self {
        Self { daemon: Some(d), ..Self::default() }
    }
    pub fn history(h: Vec<HistoryPoint>) -> Self {
        Self { history: Some(h), ..Self::default() }
    }
    pub fn statistics(s: Vec<StatisticsPoint>) -> Self {
        Self { statistics: Some(s), ..Self::default() }
    }
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok(ResponseData::none())
    }

    pub fn ok_string(s: impl Into<String>) -> Self {
        Response::Ok(ResponseData::string(s))
    }

    pub fn error(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Response::Error {
            name: name.into(),
            message: msg.into(),
        }
    }

    pub fn invalid_args(msg: impl Into<String>) -> Self {
        Response::error("InvalidArgs", msg)
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Response::error("Failed", msg)
    }
}

// ============================================================================
// Signals
// ============================================================================

/// Broadcast frames pushed to subscribed connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "signal", content = "data")]
pub enum Signal {
    DeviceAdded { device: DeviceSnapshot },
    DeviceRemoved { path: String },
    DeviceChanged { device: DeviceSnapshot },
    DaemonChanged { daemon: DaemonState },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Monotonic per-daemon sequence number
    pub seq: u64,
    #[serde(flatten)]
    pub signal: Signal,
}

// ============================================================================
// Object Paths
// ============================================================================

/// Build the stable object path for a device from its kind and native path.
///
/// The slug is `<kind>_<basename>` with every byte outside
/// `[A-Za-z0-9]` mapped to `_`, which keeps paths stable across refreshes
/// of the same source.
pub fn object_path_for(kind: DeviceKind, native_path: &str) -> String {
    let base = native_path
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(native_path);
    let mut slug = String::with_capacity(base.len());
    for c in base.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else {
            slug.push('_');
        }
    }
    if slug.is_empty() {
        slug.push_str("unnamed");
    }
    format!("{}{}_{}", DEVICES_PREFIX, kind.as_str(), slug)
}

/// Validate a client-supplied object path.
pub fn validate_object_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("Object path cannot be empty".into());
    }

    if path.len() > MAX_PATH_LENGTH {
        return Err(format!(
            "Object path too long: {} > {} chars",
            path.len(),
            MAX_PATH_LENGTH
        ));
    }

    if path == MANAGER_PATH || path == DISPLAY_DEVICE_PATH {
        return Ok(());
    }

    if !path.starts_with(DEVICES_PREFIX) {
        return Err(format!("Object path must start with {}", DEVICES_PREFIX));
    }

    let slug = &path[DEVICES_PREFIX.len()..];
    if slug.is_empty() {
        return Err("Object path has an empty device slug".into());
    }

    for c in slug.chars() {
        if !c.is_ascii_alphanumeric() && c != '_' {
            return Err(format!("Object path contains invalid character: {:?}", c));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_path_for_sysfs_battery() {
        assert_eq!(
            object_path_for(DeviceKind::Battery, "/sys/class/power_supply/BAT0"),
            "/org/freedesktop/UPower/devices/battery_BAT0"
        );
    }

    #[test]
    fn test_object_path_slug_sanitized() {
        let path = object_path_for(DeviceKind::Mouse, "/sys/class/power_supply/hid-aa:bb:cc-battery");
        assert_eq!(
            path,
            "/org/freedesktop/UPower/devices/mouse_hid_aa_bb_cc_battery"
        );
        assert!(validate_object_path(&path).is_ok());
    }

    #[test]
    fn test_object_path_stable_across_calls() {
        let a = object_path_for(DeviceKind::Battery, "/sys/class/power_supply/BAT0");
        let b = object_path_for(DeviceKind::Battery, "/sys/class/power_supply/BAT0/");
        assert_eq!(a, b);
    }

    #[test]
    fn test_validate_object_path() {
        assert!(validate_object_path(MANAGER_PATH).is_ok());
        assert!(validate_object_path(DISPLAY_DEVICE_PATH).is_ok());
        assert!(validate_object_path("/org/freedesktop/UPower/devices/battery_BAT0").is_ok());
        assert!(validate_object_path("").is_err());
        assert!(validate_object_path("/org/freedesktop/UPower/devices/").is_err());
        assert!(validate_object_path("/org/freedesktop/UPower/devices/../etc").is_err());
        assert!(validate_object_path("/somewhere/else").is_err());
        assert!(validate_object_path(&"x".repeat(300)).is_err());
    }

    #[test]
    fn test_history_request_validation() {
        let ok = Request::GetHistory {
            path: "/org/freedesktop/UPower/devices/battery_BAT0".into(),
            kind: HistoryKind::Rate,
            timespan: 3600,
            resolution: 100,
        };
        assert!(ok.validate().is_ok());

        let zero_res = Request::GetHistory {
            path: "/org/freedesktop/UPower/devices/battery_BAT0".into(),
            kind: HistoryKind::Charge,
            timespan: 3600,
            resolution: 0,
        };
        assert!(zero_res.validate().is_err());

        let huge_span = Request::GetHistory {
            path: "/org/freedesktop/UPower/devices/battery_BAT0".into(),
            kind: HistoryKind::Charge,
            timespan: MAX_HISTORY_TIMESPAN + 1,
            resolution: 10,
        };
        assert!(huge_span.validate().is_err());
    }

    #[test]
    fn test_request_envelope_round_trip() {
        let env = RequestEnvelope::new(Request::GetHistory {
            path: "/org/freedesktop/UPower/devices/battery_BAT0".into(),
            kind: HistoryKind::TimeEmpty,
            timespan: 600,
            resolution: 50,
        });
        let json = serde_json::to_string(&env).unwrap();
        let back: RequestEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, env.id);
        assert_eq!(back.request.type_name(), "GetHistory");
    }

    #[test]
    fn test_history_kind_names() {
        for kind in HistoryKind::ALL {
            assert_eq!(HistoryKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(HistoryKind::parse("bogus"), None);
    }

    #[test]
    fn test_warning_level_ordering() {
        assert!(WarningLevel::Action > WarningLevel::Critical);
        assert!(WarningLevel::Critical > WarningLevel::Low);
        assert!(WarningLevel::Low > WarningLevel::Discharging);
        assert!(WarningLevel::Discharging > WarningLevel::None);
    }
}
