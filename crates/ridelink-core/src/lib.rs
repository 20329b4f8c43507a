//! Resilient BLE connections for fitness sensors.
//!
//! This crate connects to power meters, heart-rate straps, cadence sensors
//! and treadmills, decodes their notifications with `ridelink-types`, and
//! keeps the link alive across drop-outs.
//!
//! # Features
//!
//! - **One connection engine**: every sensor kind runs through the same
//!   [`SensorLink`], parameterized by the kind's GATT profile and decoder
//! - **Interchangeable hosts**: the in-process BLE stack ([`BtleplugTransport`]),
//!   an external BLE host over a line protocol ([`BridgeTransport`]), or
//!   synthetic sensors ([`MockTransport`])
//! - **Auto-reconnection**: bounded exponential backoff with status events
//! - **Fan-out**: synchronous listeners plus a serializable event channel
//!
//! # Connection lifecycle
//!
//! The first connect either succeeds or returns an error; it is never
//! retried. After that, link loss is reported as `disconnected`, each
//! reconnect attempt as `reconnecting`, and success as `connected` again.
//! After five failed attempts (1 s, 2 s, 4 s, 8 s and 16 s apart by default)
//! the connection reports `failed` and stays down.
//!
//! # Quick Start
//!
//! ```no_run
//! use ridelink_core::{SensorConfig, SensorFactory};
//! use ridelink_types::SensorKind;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let factory = SensorFactory::new(SensorConfig::default());
//!     let power = factory.connect(SensorKind::Power).await?;
//!     println!("Connected to {}", power.device_name());
//!
//!     power.add_listener(|reading| {
//!         if let Some(watts) = reading.value() {
//!             println!("{} W", watts);
//!         }
//!     });
//!     power.on_status_change(|status| println!("link {}", status));
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(60)).await;
//!     power.disconnect().await?;
//!     Ok(())
//! }
//! ```

pub mod bus;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod factory;
pub mod link;
pub mod mock;
pub mod supervisor;
pub mod transport;

pub use bus::{MeasurementBus, MeasurementListener, StatusListener};
pub use config::{HostPreference, MockConfig, ReconnectConfig, SensorConfig, TransportConfig};
pub use connection::{ConnectionOptions, SensorConnection};
pub use error::{ConnectionFailureReason, DeviceNotFoundReason, Error, Result};
pub use events::{EventDispatcher, EventReceiver, EventSender, SensorEvent};
pub use factory::{RuntimeHost, SensorFactory};
pub use link::SensorLink;
pub use mock::{FrameGenerator, MockTransport};
pub use supervisor::{Link, ReconnectPolicy, StatusSink, Supervisor, SupervisorState};
pub use transport::{
    BridgeTransport, BtleplugOptions, BtleplugTransport, DeviceHandle, DisconnectHandler,
    NotificationHandler, Transport,
};

// Re-export from ridelink-types
pub use ridelink_types::uuids;
pub use ridelink_types::{
    ConnectionStatus, Measurement, Reading, SanityBounds, SensorKind, TreadmillMeasurement,
};
