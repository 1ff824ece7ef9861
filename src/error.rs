//! Error types for Linepulse
//!
//! This module defines all error types used throughout the library.

use thiserror::Error;

/// Result type alias for Linepulse operations
pub type Result<T> = std::result::Result<T, LinepulseError>;

/// Main error type for Linepulse operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinepulseError {
    /// Pulse rejected during validation
    #[error("Pulse error: {0}")]
    Pulse(#[from] PulseError),

    /// Pulse or assignment store failure
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Errors raised when a raw pulse record is malformed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PulseError {
    /// Machine id absent or blank
    #[error("Pulse has no machine id")]
    MissingMachineId,

    /// Timestamp absent
    #[error("Pulse for machine {machine_id} has no timestamp")]
    MissingTimestamp { machine_id: String },
}

/// Errors from the pulse or assignment stores
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Range read failed
    #[error("Read failed: {reason}")]
    ReadFailed { reason: String },

    /// Append or upsert failed
    #[error("Write failed: {reason}")]
    WriteFailed { reason: String },

    /// Journal line could not be decoded
    #[error("Corrupt journal record at line {line}: {reason}")]
    CorruptRecord { line: usize, reason: String },

    /// Underlying I/O failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<std::io::Error> for LinepulseError {
    fn from(err: std::io::Error) -> Self {
        LinepulseError::Store(err.into())
    }
}

/// Errors in configuration values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A duration that must be positive is zero
    #[error("{field} must be greater than zero")]
    ZeroDuration { field: &'static str },

    /// UTC offset outside +/- 24h
    #[error("UTC offset {minutes} minutes is out of range")]
    OffsetOutOfRange { minutes: i32 },

    /// Duration too large to represent
    #[error("{field} = {value} is out of range")]
    DurationOutOfRange { field: &'static str, value: u64 },

    /// Check interval longer than the staleness timeout
    #[error("check interval ({interval_ms}ms) exceeds staleness timeout ({timeout_ms}ms)")]
    IntervalExceedsTimeout { interval_ms: u64, timeout_ms: u64 },

    /// Config file could not be read or parsed
    #[error("Failed to load config: {0}")]
    Load(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LinepulseError::Pulse(PulseError::MissingTimestamp {
            machine_id: "press-7".to_string(),
        });
        let msg = format!("{}", err);
        assert!(msg.contains("timestamp"));
        assert!(msg.contains("press-7"));
    }

    #[test]
    fn test_error_conversion() {
        let store_err = StoreError::ReadFailed {
            reason: "timeout".to_string(),
        };
        let err: LinepulseError = store_err.into();
        assert!(matches!(err, LinepulseError::Store(_)));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: LinepulseError = io.into();
        assert!(matches!(err, LinepulseError::Store(StoreError::Io(_))));
    }
}
