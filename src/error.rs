//! Error types and handling for Phoebus
//!
//! This module defines the error types used throughout the application,
//! providing consistent error handling and reporting. Telemetry and vehicle
//! errors are recoverable within a control tick; configuration errors are
//! fatal at startup only.

use thiserror::Error;

/// Result type alias for Phoebus operations
pub type Result<T> = std::result::Result<T, PhoebusError>;

/// Errors from a single telemetry property read
///
/// All variants are non-fatal: a failing property yields an unknown snapshot
/// field, never a process crash.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TelemetryError {
    /// The device did not answer within the read timeout
    #[error("Telemetry timeout: {message}")]
    Timeout { message: String },

    /// The device answered with a frame we could not interpret
    #[error("Malformed telemetry response: {message}")]
    MalformedResponse { message: String },

    /// The device could not be reached at all
    #[error("Telemetry device unreachable: {message}")]
    DeviceUnreachable { message: String },
}

impl TelemetryError {
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        TelemetryError::Timeout {
            message: message.into(),
        }
    }

    pub fn malformed<S: Into<String>>(message: S) -> Self {
        TelemetryError::MalformedResponse {
            message: message.into(),
        }
    }

    pub fn unreachable<S: Into<String>>(message: S) -> Self {
        TelemetryError::DeviceUnreachable {
            message: message.into(),
        }
    }
}

/// Errors from the vehicle state and command client
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VehicleError {
    /// The vehicle API did not answer within the request timeout
    #[error("Vehicle API timeout: {message}")]
    Timeout { message: String },

    /// The bearer credential was rejected; the caller should refresh and retry
    #[error("Vehicle credential expired: {message}")]
    AuthExpired { message: String },

    /// A command was refused by the local sliding-window rate limiter or the
    /// remote API itself
    #[error("Vehicle command rate limited: {message}")]
    RateLimited { message: String },

    /// The vehicle API could not be reached
    #[error("Vehicle API unreachable: {message}")]
    Unreachable { message: String },

    /// The vehicle did not come online within the wake timeout
    #[error("Vehicle wake timeout: {message}")]
    WakeTimeout { message: String },

    /// The API answered but reported a command failure
    #[error("Vehicle API error: {message}")]
    Api { message: String },
}

impl VehicleError {
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        VehicleError::Timeout {
            message: message.into(),
        }
    }

    pub fn auth_expired<S: Into<String>>(message: S) -> Self {
        VehicleError::AuthExpired {
            message: message.into(),
        }
    }

    pub fn rate_limited<S: Into<String>>(message: S) -> Self {
        VehicleError::RateLimited {
            message: message.into(),
        }
    }

    pub fn unreachable<S: Into<String>>(message: S) -> Self {
        VehicleError::Unreachable {
            message: message.into(),
        }
    }

    pub fn wake_timeout<S: Into<String>>(message: S) -> Self {
        VehicleError::WakeTimeout {
            message: message.into(),
        }
    }

    pub fn api<S: Into<String>>(message: S) -> Self {
        VehicleError::Api {
            message: message.into(),
        }
    }
}

/// Main error type for Phoebus
#[derive(Debug, Error)]
pub enum PhoebusError {
    /// Configuration-related errors (fatal at startup)
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Telemetry read errors
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    /// Vehicle client errors
    #[error(transparent)]
    Vehicle(#[from] VehicleError),

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Network-related errors
    #[error("Network error: {message}")]
    Network { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl PhoebusError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        PhoebusError::Config {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        PhoebusError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        PhoebusError::Io {
            message: message.into(),
        }
    }

    /// Create a new network error
    pub fn network<S: Into<String>>(message: S) -> Self {
        PhoebusError::Network {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        PhoebusError::Generic {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for PhoebusError {
    fn from(err: std::io::Error) -> Self {
        PhoebusError::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for PhoebusError {
    fn from(err: serde_yaml::Error) -> Self {
        PhoebusError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for PhoebusError {
    fn from(err: serde_json::Error) -> Self {
        PhoebusError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for PhoebusError {
    fn from(err: reqwest::Error) -> Self {
        PhoebusError::network(err.to_string())
    }
}

impl From<chrono::ParseError> for PhoebusError {
    fn from(err: chrono::ParseError) -> Self {
        PhoebusError::validation("datetime", &err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = PhoebusError::config("test config error");
        assert!(matches!(err, PhoebusError::Config { .. }));

        let err = PhoebusError::from(TelemetryError::timeout("read timed out"));
        assert!(matches!(err, PhoebusError::Telemetry(_)));

        let err = PhoebusError::validation("field", "test validation error");
        assert!(matches!(err, PhoebusError::Validation { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = PhoebusError::config("test error");
        assert_eq!(format!("{}", err), "Configuration error: test error");

        let err = VehicleError::rate_limited("2 commands in window");
        assert_eq!(
            format!("{}", err),
            "Vehicle command rate limited: 2 commands in window"
        );

        let err = PhoebusError::validation("test_field", "invalid value");
        assert_eq!(
            format!("{}", err),
            "Validation error: test_field - invalid value"
        );
    }

    #[test]
    fn test_transparent_wrapping() {
        let inner = VehicleError::wake_timeout("no response after 60s");
        let outer: PhoebusError = inner.clone().into();
        assert_eq!(format!("{}", outer), format!("{}", inner));
    }
}
