//! Listener registry and fan-out for one sensor connection.
//!
//! Listeners are called synchronously, in registration order, on the task
//! that delivered the notification. Registering the same callback twice
//! means it is called twice. The registry lock is never held while a
//! listener runs, so listeners may register further listeners. A listener
//! that panics is logged and skipped; the rest still run.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, PoisonError, RwLock};

use ridelink_types::{ConnectionStatus, Reading, SensorKind};
use tracing::error;

use crate::events::{EventDispatcher, EventReceiver, SensorEvent};
use crate::transport::DeviceHandle;

/// Callback receiving decoded readings.
pub type MeasurementListener = Arc<dyn Fn(&Reading) + Send + Sync>;

/// Callback receiving connection status changes.
pub type StatusListener = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Fan-out point for one connection's readings and statuses.
pub struct MeasurementBus {
    device: DeviceHandle,
    kind: SensorKind,
    listeners: RwLock<Vec<MeasurementListener>>,
    status_listeners: RwLock<Vec<StatusListener>>,
    status: RwLock<Option<ConnectionStatus>>,
    events: EventDispatcher,
}

impl std::fmt::Debug for MeasurementBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeasurementBus")
            .field("device", &self.device)
            .field("kind", &self.kind)
            .field("listeners", &self.listener_count())
            .field("status", &self.status())
            .finish()
    }
}

impl MeasurementBus {
    /// Create a bus for `device`, with an event channel of `capacity`.
    pub fn new(device: DeviceHandle, kind: SensorKind, capacity: usize) -> Self {
        Self {
            device,
            kind,
            listeners: RwLock::new(Vec::new()),
            status_listeners: RwLock::new(Vec::new()),
            status: RwLock::new(None),
            events: EventDispatcher::new(capacity),
        }
    }

    /// The device this bus serves.
    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// Register a reading listener.
    pub fn add_listener(&self, listener: MeasurementListener) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Register a status listener.
    pub fn add_status_listener(&self, listener: StatusListener) {
        self.status_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// Number of reading listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// The most recently published status.
    pub fn status(&self) -> Option<ConnectionStatus> {
        *self.status.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to the serialized event stream.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// Deliver a reading to every listener, then to the event stream.
    pub fn publish(&self, reading: Reading) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for (index, listener) in listeners.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| listener(&reading))).is_err() {
                error!("Reading listener #{} panicked on {}", index, self.device);
            }
        }
        self.events.send(SensorEvent::Reading {
            device: self.device.clone(),
            kind: self.kind,
            reading,
        });
    }

    /// Record and deliver a status change.
    pub fn publish_status(&self, status: ConnectionStatus) {
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = Some(status);
        let listeners = self
            .status_listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for (index, listener) in listeners.iter().enumerate() {
            if catch_unwind(AssertUnwindSafe(|| listener(status))).is_err() {
                error!("Status listener #{} panicked on {}", index, self.device);
            }
        }
        self.events.send(SensorEvent::Status {
            device: self.device.clone(),
            kind: self.kind,
            status,
        });
    }
}
