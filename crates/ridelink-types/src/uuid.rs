//! Bluetooth UUIDs for the GATT fitness profiles.
//!
//! All four profiles are standard Bluetooth SIG assignments, so every UUID
//! here is a 16-bit short UUID expanded onto the Bluetooth base UUID.

use uuid::{Uuid, uuid};

// --- Service UUIDs ---

/// Heart Rate service (0x180D).
pub const HEART_RATE_SERVICE: Uuid = uuid!("0000180d-0000-1000-8000-00805f9b34fb");

/// Cycling Power service (0x1818).
pub const CYCLING_POWER_SERVICE: Uuid = uuid!("00001818-0000-1000-8000-00805f9b34fb");

/// Cycling Speed and Cadence service (0x1816).
pub const CSC_SERVICE: Uuid = uuid!("00001816-0000-1000-8000-00805f9b34fb");

/// Fitness Machine service (0x1826).
pub const FITNESS_MACHINE_SERVICE: Uuid = uuid!("00001826-0000-1000-8000-00805f9b34fb");

// --- Measurement Characteristic UUIDs ---

/// Heart Rate Measurement characteristic (0x2A37).
pub const HEART_RATE_MEASUREMENT: Uuid = uuid!("00002a37-0000-1000-8000-00805f9b34fb");

/// Cycling Power Measurement characteristic (0x2A63).
pub const CYCLING_POWER_MEASUREMENT: Uuid = uuid!("00002a63-0000-1000-8000-00805f9b34fb");

/// CSC Measurement characteristic (0x2A5B).
pub const CSC_MEASUREMENT: Uuid = uuid!("00002a5b-0000-1000-8000-00805f9b34fb");

/// Treadmill Data characteristic (0x2ACD).
pub const TREADMILL_DATA: Uuid = uuid!("00002acd-0000-1000-8000-00805f9b34fb");

/// Expand a 16-bit SIG-assigned UUID onto the Bluetooth base UUID.
pub const fn from_short(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}
