//! Platform-agnostic types and GATT decoders for BLE fitness sensors.
//!
//! This crate holds everything about fitness sensors that does not need a
//! Bluetooth stack: the sensor kinds and their GATT profiles, the decoded
//! measurement model, plausibility bounds, and the notification decoders.
//! It is shared by `ridelink-core` and the `ridelink` CLI.
//!
//! # Supported Profiles
//!
//! | Sensor | Service | Characteristic | Value |
//! |--------|---------|----------------|-------|
//! | Power | Cycling Power (0x1818) | 0x2A63 | watts |
//! | Heart rate | Heart Rate (0x180D) | 0x2A37 | bpm |
//! | Cadence | Cycling Speed and Cadence (0x1816) | 0x2A5B | rpm |
//! | Treadmill | Fitness Machine (0x1826) | 0x2ACD | km/h, % incline |
//!
//! # Example
//!
//! ```
//! use ridelink_types::{SensorKind, SanityBounds};
//!
//! let mut decoder = SensorKind::HeartRate.decoder(SanityBounds::default());
//! let reading = decoder.decode(&[0x00, 150], 1_700_000_000_000).unwrap();
//! assert_eq!(reading.value(), Some(150.0));
//! ```

pub mod decode;
pub mod error;
pub mod types;
pub mod uuid;

pub use decode::{
    decode_csc_crank_data, decode_cycling_power, decode_heart_rate, decode_treadmill_ftms,
    CrankSample, CrankState, NotificationDecoder, TreadmillData,
};
pub use error::{ParseError, ParseResult};
pub use types::{
    now_millis, ConnectionStatus, GattProfile, Measurement, Reading, SanityBounds, SensorKind,
    TreadmillMeasurement,
};
pub use uuid as uuids;
