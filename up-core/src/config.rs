//! Daemon configuration.
//!
//! A small key=value file (`#` comments, `[Section]` headers tolerated and
//! ignored) plus a handful of environment overrides. Unknown keys and
//! unparsable values warn and fall back to the defaults; a missing file is
//! not an error.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use up_error::{Result, UpowerError};

use crate::constants::{env as env_vars, history, paths};
use crate::warning::WarningPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    pub percentage_low: f64,
    pub percentage_critical: f64,
    pub percentage_action: f64,
    /// Seconds
    pub time_low: i64,
    pub time_critical: i64,
    pub time_action: i64,
    pub use_percentage_for_policy: bool,
    /// Opaque string handed to the session agent via GetCriticalAction
    pub critical_power_action: String,
    pub history_dir: PathBuf,
    pub history_file_cap: u64,
    /// HID UPS feature-report poll cadence (seconds)
    pub hidups_poll_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            percentage_low: 10.0,
            percentage_critical: 5.0,
            percentage_action: 2.0,
            time_low: 600,
            time_critical: 300,
            time_action: 120,
            use_percentage_for_policy: false,
            critical_power_action: "HybridSleep".to_string(),
            history_dir: PathBuf::from(paths::DEFAULT_HISTORY_DIR),
            history_file_cap: history::DEFAULT_FILE_CAP_BYTES,
            hidups_poll_secs: 30,
        }
    }
}

impl DaemonConfig {
    /// Load from the default location, honoring the environment overrides.
    pub fn load() -> Self {
        let path = std::env::var(env_vars::CONF_FILE)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(paths::DEFAULT_CONF_FILE));

        let mut config = match Self::load_from(&path) {
            Ok(config) => config,
            Err(UpowerError::FileRead { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                debug!("no config file at {:?}, using defaults", path);
                Self::default()
            }
            Err(e) => {
                warn!("failed to load config from {:?}: {}", path, e);
                Self::default()
            }
        };

        if let Ok(dir) = std::env::var(env_vars::HISTORY_DIR) {
            if !dir.is_empty() {
                config.history_dir = PathBuf::from(dir);
            }
        }

        config
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| UpowerError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut config = Self::default();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                warn!("{:?}:{}: not a key=value line, skipping", path, lineno + 1);
                continue;
            };
            config.apply(key.trim(), value.trim());
        }
        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &str) {
        fn parse<T: std::str::FromStr>(key: &str, value: &str, slot: &mut T) {
            match value.parse() {
                Ok(parsed) => *slot = parsed,
                Err(_) => warn!("invalid value {:?} for {}, keeping default", value, key),
            }
        }

        match key {
            "PercentageLow" => parse(key, value, &mut self.percentage_low),
            "PercentageCritical" => parse(key, value, &mut self.percentage_critical),
            "PercentageAction" => parse(key, value, &mut self.percentage_action),
            "TimeLow" => parse(key, value, &mut self.time_low),
            "TimeCritical" => parse(key, value, &mut self.time_critical),
            "TimeAction" => parse(key, value, &mut self.time_action),
            "UsePercentageForPolicy" => match value.to_ascii_lowercase().as_str() {
                "true" | "1" => self.use_percentage_for_policy = true,
                "false" | "0" => self.use_percentage_for_policy = false,
                _ => warn!("invalid value {:?} for {}, keeping default", value, key),
            },
            "CriticalPowerAction" => self.critical_power_action = value.to_string(),
            "HistoryFileCapBytes" => parse(key, value, &mut self.history_file_cap),
            "HidUpsPollSeconds" => parse(key, value, &mut self.hidups_poll_secs),
            _ => warn!("unknown config key {:?}, ignoring", key),
        }
    }

    pub fn warning_policy(&self) -> WarningPolicy {
        WarningPolicy {
            low_percentage: self.percentage_low,
            critical_percentage: self.percentage_critical,
            action_percentage: self.percentage_action,
            low_time: self.time_low,
            critical_time: self.time_critical,
            action_time: self.time_action,
            use_percentage_for_policy: self.use_percentage_for_policy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = DaemonConfig::default();
        assert_eq!(config.percentage_low, 10.0);
        assert_eq!(config.percentage_critical, 5.0);
        assert_eq!(config.percentage_action, 2.0);
        assert_eq!(config.time_low, 600);
        assert_eq!(config.time_critical, 300);
        assert_eq!(config.time_action, 120);
        assert!(!config.use_percentage_for_policy);
        assert_eq!(config.critical_power_action, "HybridSleep");
    }

    #[test]
    fn test_parse_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("upowerd.conf");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "# thresholds").unwrap();
        writeln!(file, "[UPower]").unwrap();
        writeln!(file, "PercentageLow=15").unwrap();
        writeln!(file, "PercentageCritical = 7").unwrap();
        writeln!(file, "UsePercentageForPolicy=true").unwrap();
        writeln!(file, "CriticalPowerAction=PowerOff").unwrap();
        writeln!(file, "TimeAction=90").unwrap();
        writeln!(file, "NotARealKey=1").unwrap();
        writeln!(file, "PercentageAction=badvalue").unwrap();

        let config = DaemonConfig::load_from(&path).unwrap();
        assert_eq!(config.percentage_low, 15.0);
        assert_eq!(config.percentage_critical, 7.0);
        assert!(config.use_percentage_for_policy);
        assert_eq!(config.critical_power_action, "PowerOff");
        assert_eq!(config.time_action, 90);
        // Bad value keeps the default
        assert_eq!(config.percentage_action, 2.0);
    }

    #[test]
    fn test_missing_file_is_an_error_from_load_from() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(DaemonConfig::load_from(&tmp.path().join("nope.conf")).is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        let tmp = tempfile::tempdir().unwrap();
        let conf = tmp.path().join("custom.conf");
        fs::write(&conf, "PercentageLow=20\n").unwrap();

        std::env::set_var(env_vars::CONF_FILE, &conf);
        std::env::set_var(env_vars::HISTORY_DIR, tmp.path().join("hist"));
        let config = DaemonConfig::load();
        std::env::remove_var(env_vars::CONF_FILE);
        std::env::remove_var(env_vars::HISTORY_DIR);

        assert_eq!(config.percentage_low, 20.0);
        assert_eq!(config.history_dir, tmp.path().join("hist"));
    }

    #[test]
    fn test_warning_policy_conversion() {
        let mut config = DaemonConfig::default();
        config.percentage_low = 12.0;
        config.use_percentage_for_policy = true;
        let policy = config.warning_policy();
        assert_eq!(policy.low_percentage, 12.0);
        assert!(policy.use_percentage_for_policy);
    }
}
