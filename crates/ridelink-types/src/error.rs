//! Error types for ridelink-types.

use thiserror::Error;

/// Errors that can occur when parsing textual representations of
/// ridelink types (sensor kinds, configuration values).
///
/// Notification payloads never produce this error: the GATT decoders are
/// total and report unusable input as `None`.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// The string does not name a known sensor kind.
    #[error("Unknown sensor kind: '{0}' (expected power, heart-rate, cadence or treadmill)")]
    UnknownSensorKind(String),

    /// A value was syntactically valid but out of range.
    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Result type alias using ridelink-types' ParseError type.
pub type ParseResult<T> = std::result::Result<T, ParseError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_kind_display() {
        let err = ParseError::UnknownSensorKind("rowing".to_string());
        assert!(err.to_string().contains("rowing"));
        assert!(err.to_string().contains("treadmill"));
    }
}
