//! Custom error types for the measurement core.
//!
//! This module defines the primary error type, `DaqError`, shared by the
//! instrument drivers, the scan routine, the measurement worker and the
//! environment poller. Using the `thiserror` crate, it provides a single,
//! consistent taxonomy so that every stage can propagate failures with `?` and
//! the top-level run wrapper can decide how to react.
//!
//! ## Error Hierarchy
//!
//! - **`Connection`**: An instrument resource could not be opened or the
//!   transport failed mid-transaction. Retried by the environment poller, fatal
//!   to a measurement run.
//! - **`Instrument`**: The instrument answered, but reported an error (for
//!   example a non-empty `:SYST:ERR?` queue) or produced an unparsable reply.
//! - **`Compliance`**: The SMU tripped its total current compliance.
//! - **`SingleCompliance`**: One sensor exceeded its limit. Only logged; the
//!   sensor is faulted and the run continues.
//! - **`ConfigurationVerification`**: An instrument read-back disagrees with the
//!   commanded value. Setup aborts immediately.
//! - **`ProtocolDesync`**: The multimeter returned a different number of
//!   readings than channels were scanned.
//! - **`AbortRequested`**: Cooperative abort. Not a failure; swallowed by the
//!   run wrapper.
//! - **`Configuration`**: Semantic validation errors in the settings.
//! - **`Config`**, **`Io`**, **`Csv`**: Wrapped errors from underlying crates.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type DaqResult<T> = std::result::Result<T, DaqError>;

/// Errors of the measurement core.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Settings failed validation
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Log file could not be written or parsed
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Resource unreachable or transport failed
    #[error("Connection error on '{resource}': {message}")]
    Connection { resource: String, message: String },

    /// Instrument reported an error
    #[error("Instrument error on '{resource}': {message}")]
    Instrument { resource: String, message: String },

    /// Reply could not be interpreted
    #[error("Failed to parse reply {reply:?} to {command:?}")]
    Parse { command: String, reply: String },

    /// SMU tripped its total current compliance
    #[error("SMU in compliance (total compliance {limit:e} A)")]
    Compliance { limit: f64 },

    /// Per-sensor fault; the sensor is switched off, the run continues.
    #[error("Sensor {index} current {current:e} A exceeds single compliance {limit:e} A")]
    SingleCompliance { index: u8, current: f64, limit: f64 },

    /// Read-back value differs from the written one
    #[error("Verification failed for {setting}: wrote {expected}, read back {actual}")]
    ConfigurationVerification {
        setting: String,
        expected: String,
        actual: String,
    },

    /// Scan returned a different number of readings than channels
    #[error("Multimeter returned {received} readings for {expected} channels")]
    ProtocolDesync { expected: usize, received: usize },

    /// Calibration resistance not positive
    #[error("Sensor {index} has invalid calibration resistance {resistivity} Ohm")]
    InvalidResistivity { index: u8, resistivity: f64 },

    /// Sensor edits refused during a run
    #[error("Sensor registry is locked by an active measurement")]
    RegistryLocked,

    /// Run stopped by the abort flag
    #[error("Measurement aborted by user")]
    AbortRequested,
}

impl DaqError {
    /// Build a connection error for the named resource.
    pub fn connection(resource: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Connection {
            resource: resource.into(),
            message: message.to_string(),
        }
    }

    /// Build an instrument error for the named resource.
    pub fn instrument(resource: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Instrument {
            resource: resource.into(),
            message: message.to_string(),
        }
    }

    /// True for transport level failures that may succeed on a later attempt.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Io(_))
    }

    /// True for the cooperative abort signal.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::AbortRequested)
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::instrument("smu", "-113,\"Undefined header\"");
        assert_eq!(
            err.to_string(),
            "Instrument error on 'smu': -113,\"Undefined header\""
        );
    }

    #[test]
    fn test_desync_message() {
        let err = DaqError::ProtocolDesync {
            expected: 3,
            received: 4,
        };
        assert!(err.to_string().contains("4 readings for 3 channels"));
    }

    #[test]
    fn test_classification() {
        assert!(DaqError::connection("dmm", "refused").is_connection());
        assert!(!DaqError::Compliance { limit: 1e-3 }.is_connection());
        assert!(DaqError::AbortRequested.is_abort());
    }
}
