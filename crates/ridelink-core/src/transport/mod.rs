//! Transport abstraction over host BLE stacks.
//!
//! A [`Transport`] is the capability set the connection engine needs from a
//! Bluetooth host: pick a device advertising a sensor kind's service, open
//! a GATT link, subscribe to one characteristic, and tear it all down. The
//! same engine runs unchanged over every implementation:
//!
//! - [`BtleplugTransport`]: the host Bluetooth stack driven in-process.
//! - [`BridgeTransport`]: an external BLE host speaking newline-delimited
//!   JSON over a byte stream.
//! - [`MockTransport`](crate::mock::MockTransport): synthetic sensors.

pub mod bridge;
pub mod native;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use ridelink_types::SensorKind;

use crate::error::{Error, Result};

pub use self::bridge::BridgeTransport;
pub use self::native::{BtleplugOptions, BtleplugTransport};

/// Callback invoked with the raw bytes of each notification.
pub type NotificationHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Callback invoked when the host reports an unsolicited link loss.
pub type DisconnectHandler = Arc<dyn Fn() + Send + Sync>;

/// A device chosen by [`Transport::select_device`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle {
    /// Transport-specific identifier (peripheral ID, bridge device ID).
    pub id: String,
    /// Advertised name, if known.
    pub name: Option<String>,
}

impl DeviceHandle {
    /// Create a handle without a name.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    /// Create a handle with a name.
    pub fn with_name(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: Some(name.into()),
        }
    }

    /// The name if known, otherwise the identifier.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

impl std::fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Capability set of a host BLE stack.
///
/// Implementations must deliver the notifications of one subscription in
/// order, and must call the disconnect handler only for link losses the
/// caller did not request through [`Transport::disconnect`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short name of the transport, for logs.
    fn name(&self) -> &'static str;

    /// Select a device advertising the service of `kind`.
    async fn select_device(&self, kind: SensorKind) -> Result<DeviceHandle>;

    /// Open a GATT link to `device`.
    ///
    /// `on_disconnect` is retained until the next `connect` or `disconnect`
    /// for the same device.
    async fn connect(&self, device: &DeviceHandle, on_disconnect: DisconnectHandler)
    -> Result<()>;

    /// Subscribe to notifications of `characteristic` within `service`.
    ///
    /// Replaces any existing subscription to the same characteristic.
    async fn start_notifications(
        &self,
        device: &DeviceHandle,
        service: Uuid,
        characteristic: Uuid,
        on_value: NotificationHandler,
    ) -> Result<()>;

    /// Stop a subscription started with [`Transport::start_notifications`].
    async fn stop_notifications(
        &self,
        device: &DeviceHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()>;

    /// Close the link to `device`.
    async fn disconnect(&self, device: &DeviceHandle) -> Result<()>;
}

/// Await `fut`, bounded by `limit` when one is configured.
pub(crate) async fn with_optional_timeout<T, F>(
    limit: Option<Duration>,
    operation: &str,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(duration) => tokio::time::timeout(duration, fut)
            .await
            .map_err(|_| Error::timeout(operation, duration))?,
        None => fut.await,
    }
}
