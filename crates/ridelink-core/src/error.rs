//! Error types for ridelink-core.
//!
//! Errors fall into four groups, and each surfaces in a different place:
//!
//! | Failure | Where it surfaces |
//! |---------|-------------------|
//! | Malformed notification payload | Nowhere: the decoder yields `None` and the frame is dropped |
//! | Initial selection or connection failure | `Err` from [`SensorFactory::connect`](crate::SensorFactory::connect), never retried |
//! | Link loss mid-session | [`ConnectionStatus::Disconnected`](ridelink_types::ConnectionStatus) then `Reconnecting` |
//! | Reconnection exhausted | [`ConnectionStatus::Failed`](ridelink_types::ConnectionStatus), terminal |
//!
//! Only the second group is represented by [`Error`]; the others are status
//! events on the connection's bus.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur when talking to fitness sensors.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error from the host stack.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// No matching device could be selected.
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceNotFoundReason),

    /// The user dismissed the device picker.
    #[error("Device selection cancelled")]
    SelectionCancelled,

    /// Operation attempted on a device that is not connected.
    #[error("Not connected to device")]
    NotConnected,

    /// The measurement characteristic is missing on the device.
    #[error("Characteristic not found: {uuid}")]
    CharacteristicNotFound {
        /// The UUID that was not found.
        uuid: String,
    },

    /// Operation timed out.
    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The timeout duration.
        duration: Duration,
    },

    /// Operation was cancelled by a manual disconnect.
    #[error("Operation cancelled")]
    Cancelled,

    /// Connection failed with a specific reason.
    #[error("Connection failed: {reason}")]
    ConnectionFailed {
        /// The device identifier that failed to connect.
        device_id: Option<String>,
        /// The structured reason for the failure.
        reason: ConnectionFailureReason,
    },

    /// The native bridge reported an error or went away.
    #[error("Bridge error: {0}")]
    Bridge(String),

    /// A bridge message could not be encoded or decoded.
    #[error("Bridge protocol error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Structured reasons for connection failures.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionFailureReason {
    /// The host refused or failed the connection.
    Rejected(String),
    /// The transport itself went away during the attempt.
    TransportClosed,
    /// Other/unknown error.
    Other(String),
}

impl std::fmt::Display for ConnectionFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected(msg) => write!(f, "rejected: {}", msg),
            Self::TransportClosed => write!(f, "transport closed"),
            Self::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Reason why a device was not found.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DeviceNotFoundReason {
    /// No device with the requested service appeared before the scan ended.
    ScanTimeout {
        /// How long the scan ran.
        duration: Duration,
    },
    /// Device with the specified identifier is unknown to the transport.
    NotFound {
        /// The identifier that was looked up.
        identifier: String,
    },
    /// No Bluetooth adapter available.
    NoAdapter,
}

impl std::fmt::Display for DeviceNotFoundReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ScanTimeout { duration } => write!(f, "scan timed out after {:?}", duration),
            Self::NotFound { identifier } => write!(f, "device '{}' not found", identifier),
            Self::NoAdapter => write!(f, "no Bluetooth adapter available"),
        }
    }
}

impl Error {
    /// Create a device not found error for a specific identifier.
    pub fn device_not_found(identifier: impl Into<String>) -> Self {
        Self::DeviceNotFound(DeviceNotFoundReason::NotFound {
            identifier: identifier.into(),
        })
    }

    /// Create a timeout error with operation context.
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a characteristic not found error.
    pub fn characteristic_not_found(uuid: impl ToString) -> Self {
        Self::CharacteristicNotFound {
            uuid: uuid.to_string(),
        }
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create a connection failure with structured reason.
    pub fn connection_failed(device_id: Option<String>, reason: ConnectionFailureReason) -> Self {
        Self::ConnectionFailed { device_id, reason }
    }

    /// Create a connection failure with a string reason.
    pub fn connection_failed_str(device_id: Option<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            device_id,
            reason: ConnectionFailureReason::Other(reason.into()),
        }
    }
}

impl From<ridelink_types::ParseError> for Error {
    fn from(err: ridelink_types::ParseError) -> Self {
        Error::InvalidConfig(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::InvalidConfig(err.to_string())
    }
}

/// Result type alias using ridelink-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::device_not_found("HRM-Pro 4412");
        assert!(err.to_string().contains("HRM-Pro 4412"));

        assert_eq!(Error::NotConnected.to_string(), "Not connected to device");
        assert_eq!(
            Error::SelectionCancelled.to_string(),
            "Device selection cancelled"
        );

        let err = Error::characteristic_not_found("00002a63-0000-1000-8000-00805f9b34fb");
        assert!(err.to_string().contains("2a63"));

        let err = Error::timeout("connect", Duration::from_secs(10));
        assert!(err.to_string().contains("connect"));
        assert!(err.to_string().contains("10s"));
    }

    #[test]
    fn test_device_not_found_reasons() {
        let err = Error::DeviceNotFound(DeviceNotFoundReason::NoAdapter);
        assert!(err.to_string().contains("no Bluetooth adapter"));

        let err = Error::DeviceNotFound(DeviceNotFoundReason::ScanTimeout {
            duration: Duration::from_secs(30),
        });
        assert!(err.to_string().contains("30s"));
    }

    #[test]
    fn test_connection_failed_display() {
        let err = Error::connection_failed(
            Some("dev-1".to_string()),
            ConnectionFailureReason::Rejected("gatt error 133".to_string()),
        );
        assert!(err.to_string().contains("gatt error 133"));

        let err = Error::connection_failed_str(None, "mock failure");
        assert_eq!(err.to_string(), "Connection failed: mock failure");
    }

    #[test]
    fn test_btleplug_error_conversion() {
        fn _assert_from_impl<T: From<btleplug::Error>>() {}
        _assert_from_impl::<Error>();
    }

    #[test]
    fn test_parse_error_conversion() {
        let err: Error = ridelink_types::ParseError::UnknownSensorKind("rowing".into()).into();
        assert!(matches!(err, Error::InvalidConfig(_)));
        assert!(err.to_string().contains("rowing"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }
}
