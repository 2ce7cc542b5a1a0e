//! upowerd core library
//!
//! The backend-agnostic heart of the daemon: native source adapters, the
//! normalized device model, warning levels, history, and configuration.
//!
//! # Module Structure
//!
//! - `source/` - Native source abstraction (sysfs, APM, HID UPS, dummy)
//! - `normalize` - RawSnapshot → UpDevice derivation
//! - `registry` - Device set plus OnBattery and the display device
//! - `warning` - Threshold engine with hysteresis
//! - `history` - Per-device time series with bounded persistence
//! - `config` - key=value configuration with environment overrides

pub mod config;
pub mod constants;
pub mod device;
pub mod history;
pub mod normalize;
pub mod registry;
pub mod source;
pub mod warning;

pub use config::DaemonConfig;
pub use device::{sanitize_text, technology_from_str, UpDevice};
pub use history::{identity_hash, HistoryStore};
pub use normalize::{normalize, NormalizeEnv, RateEstimator};
pub use registry::DeviceRegistry;
pub use source::{
    dummy::{DummyAdapter, DummyHandle},
    sysfs::SysfsAdapter,
    EventSink, RawSnapshot, RawSource, SourceAdapter, SourceEvent, Subscription,
};
pub use warning::{compute_raw, WarningPolicy, WarningTracker};

#[cfg(target_os = "linux")]
pub use source::hidups::HidUpsAdapter;

#[cfg(target_os = "openbsd")]
pub use source::apm::ApmAdapter;

pub use up_error::{Result, UpowerError};
