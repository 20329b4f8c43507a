//! The caller-facing handle for one connected sensor.

use std::sync::Arc;

use tracing::{debug, info};

use ridelink_types::{ConnectionStatus, Reading, SanityBounds, SensorKind};

use crate::bus::MeasurementBus;
use crate::error::Result;
use crate::events::{DEFAULT_EVENT_CAPACITY, EventReceiver};
use crate::link::SensorLink;
use crate::supervisor::{Link, ReconnectPolicy, StatusSink, Supervisor, SupervisorState};
use crate::transport::{DeviceHandle, Transport};

/// Options applied to a single connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOptions {
    /// Reconnection behaviour after link loss.
    pub policy: ReconnectPolicy,
    /// Limits outside which readings are dropped.
    pub bounds: SanityBounds,
    /// Capacity of the [`SensorConnection::events`] channel.
    pub event_capacity: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            policy: ReconnectPolicy::default(),
            bounds: SanityBounds::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl ConnectionOptions {
    /// Set the reconnect policy.
    pub fn policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the sanity bounds.
    pub fn bounds(mut self, bounds: SanityBounds) -> Self {
        self.bounds = bounds;
        self
    }
}

/// A connected sensor.
///
/// Readings are delivered to listeners registered with
/// [`add_listener`](Self::add_listener), status changes to those registered
/// with [`on_status_change`](Self::on_status_change). Both are called
/// synchronously, in registration order. Link loss is handled in the
/// background; the handle only learns of it through status changes.
///
/// The initial `connected` status is published before [`open`](Self::open)
/// returns, so it is visible through [`status`](Self::status) rather than
/// through listeners registered afterwards.
///
/// Dropping the handle stops supervision and closes the link in the
/// background; call [`disconnect`](Self::disconnect) to wait for it.
pub struct SensorConnection {
    kind: SensorKind,
    bus: Arc<MeasurementBus>,
    supervisor: Arc<Supervisor<SensorLink>>,
}

impl std::fmt::Debug for SensorConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorConnection")
            .field("device", self.bus.device())
            .field("kind", &self.kind)
            .field("state", &self.supervisor.state())
            .finish()
    }
}

impl SensorConnection {
    /// Select a device for `kind` on `transport`, connect and subscribe.
    ///
    /// Fails without retrying if selection, connection or subscription
    /// fails. Reconnection only applies to links lost after this returns.
    #[tracing::instrument(level = "info", skip_all, fields(transport = transport.name(), kind = %kind))]
    pub async fn open(
        transport: Arc<dyn Transport>,
        kind: SensorKind,
        options: ConnectionOptions,
    ) -> Result<Self> {
        options.policy.validate()?;

        let device = transport.select_device(kind).await?;
        info!("Selected {}", device);

        let bus = Arc::new(MeasurementBus::new(
            device.clone(),
            kind,
            options.event_capacity,
        ));
        let link = SensorLink::new(transport, device, kind, options.bounds, Arc::clone(&bus));

        let status_bus = Arc::clone(&bus);
        let sink: StatusSink = Arc::new(move |status| status_bus.publish_status(status));
        let supervisor = Supervisor::new(link, options.policy, sink);
        supervisor.start().await?;

        Ok(Self {
            kind,
            bus,
            supervisor,
        })
    }

    /// Register a reading listener.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(&Reading) + Send + Sync + 'static,
    {
        self.bus.add_listener(Arc::new(listener));
    }

    /// Register a status listener.
    pub fn on_status_change<F>(&self, listener: F)
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        self.bus.add_status_listener(Arc::new(listener));
    }

    /// Subscribe to the serialized event stream of this connection.
    pub fn events(&self) -> EventReceiver {
        self.bus.subscribe()
    }

    /// Disconnect and stop reconnecting.
    ///
    /// No status is published once this is called. Calling it again does
    /// nothing.
    pub async fn disconnect(&self) -> Result<()> {
        self.supervisor.disconnect().await
    }

    /// The device name, or its identifier when it advertised none.
    pub fn device_name(&self) -> &str {
        self.bus.device().display_name()
    }

    /// The connected device.
    pub fn device(&self) -> &DeviceHandle {
        self.bus.device()
    }

    /// The sensor kind.
    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    /// The last published status.
    pub fn status(&self) -> Option<ConnectionStatus> {
        self.bus.status()
    }

    /// The supervisor's lifecycle state.
    pub fn state(&self) -> SupervisorState {
        self.supervisor.state()
    }

    /// Reconnection attempts made since the link was last up.
    pub fn reconnect_attempts(&self) -> u32 {
        self.supervisor.attempts()
    }
}

impl Drop for SensorConnection {
    fn drop(&mut self) {
        if !self.supervisor.cancel() {
            return;
        }
        // Without a runtime the transport's own cleanup has to do.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let link = Arc::clone(self.supervisor.link());
            runtime.spawn(async move {
                if let Err(e) = link.close().await {
                    debug!("Close on drop failed: {}", e);
                }
            });
        }
    }
}
