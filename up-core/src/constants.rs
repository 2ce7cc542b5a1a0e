//! Workspace-wide tunables and well-known paths.

/// Refresh cadence settings
pub mod poll {
    /// Line-power sources poll interval (seconds)
    pub const LINE_POWER_INTERVAL_SECS: u64 = 30;

    /// Peripheral battery poll interval (seconds)
    pub const PERIPHERAL_INTERVAL_SECS: u64 = 30;

    /// System battery poll interval while rate smoothing is active (seconds)
    pub const BATTERY_INTERVAL_SECS: u64 = 60;

    /// Fast poll interval right after a state transition (seconds)
    pub const FAST_INTERVAL_SECS: u64 = 10;

    /// How long the fast cadence is held after a state transition (seconds)
    pub const FAST_WINDOW_SECS: u64 = 120;

    /// Cap on consecutive fast polls while a battery reports an unknown state
    pub const UNKNOWN_RETRIES: u32 = 30;

    /// Per-source refresh budget; exceeding it logs a warning (seconds)
    pub const SOURCE_BUDGET_SECS: u64 = 2;
}

/// Peripheral hot-unplug tolerance
pub mod quarantine {
    /// How long a removed peripheral is retained awaiting re-enumeration (milliseconds)
    pub const HOLD_MS: u64 = 2000;
}

/// Signal emission
pub mod signal {
    /// Property-change signals are coalesced per device within this window (milliseconds)
    pub const COALESCE_WINDOW_MS: u64 = 200;
}

/// Energy-rate smoothing
pub mod rate {
    /// EWMA blend factor for successive rate samples
    pub const SMOOTHING_FACTOR: f64 = 0.5;

    /// Energy deltas closer together than this are discarded (seconds)
    pub const MIN_SAMPLE_SPACING_SECS: u64 = 10;

    /// Window within which a sign flip invalidates a delta sample (seconds)
    pub const SIGN_FLIP_WINDOW_SECS: u64 = 30;

    /// Rates above this are hardware garbage and read as unknown (watts)
    pub const MAX_SANE_WATTS: f64 = 300.0;

    /// The ACPI "Ones" sentinel some firmware reports instead of a rate
    pub const ACPI_ONES: u64 = 0xffff;
}

/// A battery in an unknown state above this charge is treated as full (%)
pub const CHARGED_THRESHOLD_PCT: f64 = 95.0;

/// Energy below this is indistinguishable from empty (Wh)
pub const EMPTY_EPSILON_WH: f64 = 0.01;

/// Time-to-empty/full clamp window; outside it the estimate is unknown
pub mod time_estimate {
    pub const MIN_SECS: i64 = 60;
    pub const MAX_SECS: i64 = 240 * 3600;
}

/// History store settings
pub mod history {
    /// In-memory ring per series: 10 minutes at 1 Hz-equivalent resolution
    pub const RING_CAPACITY: usize = 600;

    /// Persist one downsampled record per series at most this often (seconds)
    pub const PERSIST_INTERVAL_SECS: u64 = 120;

    /// Persisted records older than this are pruned on rotation (seconds)
    pub const MAX_AGE_SECS: u64 = 7 * 24 * 3600;

    /// Default rotation cap per series file (bytes)
    pub const DEFAULT_FILE_CAP_BYTES: u64 = 100 * 1024;
}

/// Well-known filesystem locations
pub mod paths {
    /// Default daemon configuration file
    pub const DEFAULT_CONF_FILE: &str = "/etc/upowerd/upowerd.conf";

    /// Default history persistence directory
    pub const DEFAULT_HISTORY_DIR: &str = "/var/lib/upowerd/history";

    /// Linux power_supply class directory
    pub const SYSFS_POWER_SUPPLY: &str = "/sys/class/power_supply";
}

/// Environment variables recognized by the daemon
pub mod env {
    /// Overrides the config file location
    pub const CONF_FILE: &str = "UPOWER_CONF_FILE_NAME";

    /// Overrides the history persistence directory
    pub const HISTORY_DIR: &str = "UPOWER_HISTORY_DIR";

    /// Test-only: points the sysfs adapter at a mock power_supply tree
    pub const SYSFS_PATH: &str = "UPOWER_SYSFS_PATH";

    /// Log filter (tracing EnvFilter syntax)
    pub const LOG: &str = "UPOWER_LOG";
}
