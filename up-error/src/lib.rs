//! Unified error handling for upowerd
//!
//! This crate provides a single error type used across all upowerd components.
//! It uses thiserror for ergonomic error definitions with proper Display and Error trait impls.

use std::io;
use std::path::PathBuf;

/// Result type alias using UpowerError
pub type Result<T> = std::result::Result<T, UpowerError>;

/// Wire-level error names exposed to bus clients.
///
/// Internal errors are collapsed onto these three names before they leave
/// the daemon; the detailed message travels alongside for logging only.
pub const BUS_ERROR_INVALID_ARGS: &str = "InvalidArgs";
pub const BUS_ERROR_FAILED: &str = "Failed";
pub const BUS_ERROR_NOT_AUTHORIZED: &str = "NotAuthorized";

/// Unified error type for all upowerd operations
#[derive(thiserror::Error, Debug)]
pub enum UpowerError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    // ============================================================================
    // Native Source Errors
    // ============================================================================
    #[error("Failed to read attribute {attribute} of {source_id}: {reason}")]
    AttributeRead {
        source_id: String,
        attribute: String,
        reason: String,
    },

    #[error("Power source not found: {0}")]
    SourceNotFound(String),

    #[error("Adapter {adapter} unavailable: {reason}")]
    AdapterUnavailable {
        adapter: &'static str,
        reason: String,
    },

    #[error("Change events not supported by adapter {0}")]
    EventsNotSupported(&'static str),

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration value for {key}: {reason}")]
    InvalidConfig {
        key: String,
        reason: String,
    },

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    // ============================================================================
    // Registry and Device Errors
    // ============================================================================
    #[error("No such device: {0}")]
    DeviceNotFound(String),

    #[error("Invalid object path {path}: {reason}")]
    InvalidObjectPath {
        path: String,
        reason: String,
    },

    // ============================================================================
    // History Store Errors
    // ============================================================================
    #[error("History error for {series}: {reason}")]
    History {
        series: String,
        reason: String,
    },

    // ============================================================================
    // Bus Surface Errors
    // ============================================================================
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("IPC protocol error: {0}")]
    IpcProtocol(String),

    #[error("Message too large: {size} bytes (max {max_size} bytes)")]
    MessageTooLarge {
        size: usize,
        max_size: usize,
    },

    #[error("Failed to acquire bus socket: {0}")]
    BusAcquire(String),

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl UpowerError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid-arguments error from a string
    pub fn invalid_args(msg: impl Into<String>) -> Self {
        Self::InvalidArgs(msg.into())
    }

    /// Create an attribute-read error
    pub fn attribute_read(
        source_id: impl Into<String>,
        attribute: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::AttributeRead {
            source_id: source_id.into(),
            attribute: attribute.into(),
            reason: reason.into(),
        }
    }

    /// The wire error name a bus client sees for this error.
    ///
    /// Only three names are ever emitted: InvalidArgs, NotAuthorized, Failed.
    pub fn bus_name(&self) -> &'static str {
        match self {
            Self::InvalidArgs(_)
            | Self::InvalidConfig { .. }
            | Self::InvalidObjectPath { .. }
            | Self::DeviceNotFound(_)
            | Self::MessageTooLarge { .. } => BUS_ERROR_INVALID_ARGS,
            Self::NotAuthorized(_) => BUS_ERROR_NOT_AUTHORIZED,
            _ => BUS_ERROR_FAILED,
        }
    }
}

// Allow converting from String to UpowerError
impl From<String> for UpowerError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to UpowerError
impl From<&str> for UpowerError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bus_name_mapping() {
        assert_eq!(
            UpowerError::invalid_args("bad timespan").bus_name(),
            BUS_ERROR_INVALID_ARGS
        );
        assert_eq!(
            UpowerError::DeviceNotFound("battery_BAT9".into()).bus_name(),
            BUS_ERROR_INVALID_ARGS
        );
        assert_eq!(
            UpowerError::NotAuthorized("peer uid 1000".into()).bus_name(),
            BUS_ERROR_NOT_AUTHORIZED
        );
        assert_eq!(UpowerError::generic("boom").bus_name(), BUS_ERROR_FAILED);
        assert_eq!(
            UpowerError::Timeout("refresh budget".into()).bus_name(),
            BUS_ERROR_FAILED
        );
    }

    #[test]
    fn test_from_string() {
        let err: UpowerError = "something failed".into();
        assert!(matches!(err, UpowerError::Generic(_)));
    }
}
