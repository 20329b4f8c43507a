//! Serializable event stream for sensor connections.
//!
//! Every reading and status change delivered to a connection's listeners is
//! also published here as a [`SensorEvent`], so consumers that prefer a
//! channel (loggers, recorders, the CLI's JSON output) can subscribe
//! without registering callbacks.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use ridelink_types::{ConnectionStatus, Reading, SensorKind};

use crate::transport::DeviceHandle;

/// Default capacity of a connection's event channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 100;

/// Events emitted by a sensor connection.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new event types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SensorEvent {
    /// A notification decoded into a reading.
    Reading {
        device: DeviceHandle,
        kind: SensorKind,
        reading: Reading,
    },
    /// The connection changed state.
    Status {
        device: DeviceHandle,
        kind: SensorKind,
        status: ConnectionStatus,
    },
}

impl SensorEvent {
    /// The device the event concerns.
    pub fn device(&self) -> &DeviceHandle {
        match self {
            SensorEvent::Reading { device, .. } | SensorEvent::Status { device, .. } => device,
        }
    }
}

/// Sender for sensor events.
pub type EventSender = broadcast::Sender<SensorEvent>;

/// Receiver for sensor events.
pub type EventReceiver = broadcast::Receiver<SensorEvent>;

/// Create a new event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    broadcast::channel(capacity)
}

/// Event dispatcher for sending events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: EventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: SensorEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
