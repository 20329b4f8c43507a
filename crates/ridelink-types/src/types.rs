//! Core types for BLE fitness sensor data.

use core::fmt;
use core::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::ParseError;
use crate::uuid::{
    CSC_MEASUREMENT, CSC_SERVICE, CYCLING_POWER_MEASUREMENT, CYCLING_POWER_SERVICE,
    FITNESS_MACHINE_SERVICE, HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE, TREADMILL_DATA,
};

/// Kind of fitness sensor.
///
/// Each kind maps to exactly one GATT service and one measurement
/// characteristic; see [`SensorKind::profile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum SensorKind {
    /// Cycling power meter (Cycling Power service).
    Power,
    /// Heart rate strap (Heart Rate service).
    HeartRate,
    /// Crank cadence sensor (Cycling Speed and Cadence service).
    Cadence,
    /// Treadmill (Fitness Machine service, Treadmill Data).
    Treadmill,
}

impl SensorKind {
    /// All supported sensor kinds.
    pub const ALL: [SensorKind; 4] = [
        SensorKind::Power,
        SensorKind::HeartRate,
        SensorKind::Cadence,
        SensorKind::Treadmill,
    ];

    /// The GATT service/characteristic pair carrying this kind's measurements.
    #[must_use]
    pub const fn profile(&self) -> GattProfile {
        match self {
            SensorKind::Power => GattProfile::new(CYCLING_POWER_SERVICE, CYCLING_POWER_MEASUREMENT),
            SensorKind::HeartRate => GattProfile::new(HEART_RATE_SERVICE, HEART_RATE_MEASUREMENT),
            SensorKind::Cadence => GattProfile::new(CSC_SERVICE, CSC_MEASUREMENT),
            SensorKind::Treadmill => GattProfile::new(FITNESS_MACHINE_SERVICE, TREADMILL_DATA),
        }
    }

    /// Unit of the scalar value produced by this kind.
    #[must_use]
    pub fn unit(&self) -> &'static str {
        match self {
            SensorKind::Power => "W",
            SensorKind::HeartRate => "bpm",
            SensorKind::Cadence => "rpm",
            SensorKind::Treadmill => "km/h",
        }
    }

    /// Stable lowercase identifier, the inverse of [`FromStr`].
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Power => "power",
            SensorKind::HeartRate => "heart-rate",
            SensorKind::Cadence => "cadence",
            SensorKind::Treadmill => "treadmill",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SensorKind::Power => write!(f, "Power Meter"),
            SensorKind::HeartRate => write!(f, "Heart Rate"),
            SensorKind::Cadence => write!(f, "Cadence"),
            SensorKind::Treadmill => write!(f, "Treadmill"),
        }
    }
}

impl FromStr for SensorKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "power" | "cycling-power" => Ok(SensorKind::Power),
            "heart-rate" | "heartrate" | "hr" => Ok(SensorKind::HeartRate),
            "cadence" | "csc" => Ok(SensorKind::Cadence),
            "treadmill" | "ftms" => Ok(SensorKind::Treadmill),
            _ => Err(ParseError::UnknownSensorKind(s.to_string())),
        }
    }
}

/// A GATT service and the notifying characteristic within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GattProfile {
    /// Service UUID.
    pub service: uuid::Uuid,
    /// Measurement characteristic UUID.
    pub characteristic: uuid::Uuid,
}

impl GattProfile {
    /// Create a profile from a service/characteristic pair.
    pub const fn new(service: uuid::Uuid, characteristic: uuid::Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

/// One scalar sample: power in watts, heart rate in bpm, cadence in rpm.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Measurement {
    /// Wall-clock time in milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// The sample value.
    pub value: f64,
}

impl Measurement {
    /// Create a measurement.
    pub fn new(timestamp: u64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Composite sample from the treadmill protocol.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TreadmillMeasurement {
    /// Wall-clock time in milliseconds since the Unix epoch.
    pub timestamp: u64,
    /// Instantaneous speed in km/h, if the frame carried it.
    pub speed: Option<f64>,
    /// Inclination in percent, if the frame carried it.
    pub incline: Option<f64>,
}

/// A decoded sample delivered to measurement listeners.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
pub enum Reading {
    /// Scalar sample (power, heart rate, cadence).
    Measurement(Measurement),
    /// Treadmill speed/incline sample.
    Treadmill(TreadmillMeasurement),
}

impl Reading {
    /// Timestamp of the sample in milliseconds since the Unix epoch.
    pub fn timestamp(&self) -> u64 {
        match self {
            Reading::Measurement(m) => m.timestamp,
            Reading::Treadmill(t) => t.timestamp,
        }
    }

    /// The scalar value, if this is a scalar sample.
    pub fn value(&self) -> Option<f64> {
        match self {
            Reading::Measurement(m) => Some(m.value),
            Reading::Treadmill(_) => None,
        }
    }
}

impl From<Measurement> for Reading {
    fn from(m: Measurement) -> Self {
        Reading::Measurement(m)
    }
}

impl From<TreadmillMeasurement> for Reading {
    fn from(t: TreadmillMeasurement) -> Self {
        Reading::Treadmill(t)
    }
}

/// Lifecycle signal of a sensor connection. Not a measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ConnectionStatus {
    /// The link is up and notifications are flowing.
    Connected,
    /// The link was lost unexpectedly.
    Disconnected,
    /// A reconnect attempt is in progress.
    Reconnecting,
    /// Reconnection was exhausted. Terminal.
    Failed,
}

impl ConnectionStatus {
    /// Whether this status ends the connection's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionStatus::Failed)
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Reconnecting => write!(f, "reconnecting"),
            ConnectionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Default upper bound for heart rate in bpm (inclusive).
pub const DEFAULT_MAX_HEART_RATE: u16 = 300;

/// Default upper bound for instantaneous power in watts (inclusive).
pub const DEFAULT_MAX_POWER: i16 = 3000;

/// Default upper bound for cadence in rpm (exclusive).
pub const DEFAULT_MAX_CADENCE: u16 = 300;

/// Application-level plausibility limits applied by the decoders.
///
/// These are a sanity filter, not a protocol requirement: the Cycling Power
/// specification permits negative (regenerative) power, for example. Values
/// outside the bounds are reported as absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SanityBounds {
    /// Highest accepted heart rate, inclusive.
    pub max_heart_rate: u16,
    /// Highest accepted power, inclusive. Negative power is always rejected.
    pub max_power: i16,
    /// Cadence must be strictly below this value.
    pub max_cadence: u16,
}

impl Default for SanityBounds {
    fn default() -> Self {
        Self {
            max_heart_rate: DEFAULT_MAX_HEART_RATE,
            max_power: DEFAULT_MAX_POWER,
            max_cadence: DEFAULT_MAX_CADENCE,
        }
    }
}

impl SanityBounds {
    /// Accept a heart rate in `[0, max_heart_rate]`.
    pub fn heart_rate(&self, bpm: u16) -> Option<u16> {
        (bpm <= self.max_heart_rate).then_some(bpm)
    }

    /// Accept a power value in `[0, max_power]`.
    pub fn power(&self, watts: i16) -> Option<i16> {
        (0..=self.max_power).contains(&watts).then_some(watts)
    }

    /// Accept a cadence in `[0, max_cadence)`.
    pub fn cadence(&self, rpm: f64) -> Option<u16> {
        if rpm.is_finite() && rpm >= 0.0 && rpm < f64::from(self.max_cadence) {
            Some(rpm as u16)
        } else {
            None
        }
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    u64::try_from(nanos / 1_000_000).unwrap_or(0)
}
