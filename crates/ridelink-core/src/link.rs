//! The parameterized connection engine.
//!
//! One [`SensorLink`] drives any sensor kind over any [`Transport`]: it
//! connects, subscribes to the kind's characteristic, and feeds every
//! notification through a decoder into the [`MeasurementBus`].

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tracing::{debug, error, info, trace};

use ridelink_types::{GattProfile, SanityBounds, SensorKind, now_millis};

use crate::bus::MeasurementBus;
use crate::error::Result;
use crate::supervisor::Link;
use crate::transport::{DeviceHandle, DisconnectHandler, NotificationHandler, Transport};

/// A sensor's GATT link over a transport.
pub struct SensorLink {
    transport: Arc<dyn Transport>,
    device: DeviceHandle,
    kind: SensorKind,
    profile: GattProfile,
    bounds: SanityBounds,
    bus: Arc<MeasurementBus>,
}

impl std::fmt::Debug for SensorLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorLink")
            .field("transport", &self.transport.name())
            .field("device", &self.device)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl SensorLink {
    /// Create a link to `device` for `kind`, publishing into `bus`.
    pub fn new(
        transport: Arc<dyn Transport>,
        device: DeviceHandle,
        kind: SensorKind,
        bounds: SanityBounds,
        bus: Arc<MeasurementBus>,
    ) -> Self {
        Self {
            transport,
            device,
            kind,
            profile: kind.profile(),
            bounds,
            bus,
        }
    }

    /// The device this link connects to.
    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// The sensor kind.
    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    /// Build the handler for one subscription.
    ///
    /// Each handler owns a fresh decoder, so rolling state such as the
    /// crank counters starts empty on every (re)connect.
    fn notification_handler(&self) -> NotificationHandler {
        let decoder = Mutex::new(self.kind.decoder(self.bounds));
        let bus = Arc::clone(&self.bus);
        let kind = self.kind;

        Arc::new(move |data: &[u8]| {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                let reading = decoder
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .decode(data, now_millis());
                match reading {
                    Some(reading) => bus.publish(reading),
                    None => trace!("Dropped {} notification ({} bytes)", kind, data.len()),
                }
            }));
            if outcome.is_err() {
                error!("Panic while handling {} notification, reading dropped", kind);
            }
        })
    }
}

#[async_trait]
impl Link for SensorLink {
    #[tracing::instrument(level = "info", skip_all, fields(device = %self.device, kind = %self.kind))]
    async fn open(&self, on_disconnect: DisconnectHandler) -> Result<()> {
        self.transport.connect(&self.device, on_disconnect).await?;

        let subscribed = self
            .transport
            .start_notifications(
                &self.device,
                self.profile.service,
                self.profile.characteristic,
                self.notification_handler(),
            )
            .await;
        if let Err(e) = subscribed {
            // Leave no half-open link behind.
            if let Err(close) = self.transport.disconnect(&self.device).await {
                debug!("Disconnect after failed subscribe: {}", close);
            }
            return Err(e);
        }

        info!(
            "Subscribed to {} over {}",
            self.profile.characteristic,
            self.transport.name()
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if let Err(e) = self
            .transport
            .stop_notifications(
                &self.device,
                self.profile.service,
                self.profile.characteristic,
            )
            .await
        {
            debug!("Failed to stop notifications: {}", e);
        }
        self.transport.disconnect(&self.device).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ridelink_types::Reading;

    use crate::mock::MockTransport;

    async fn link_with_mock(kind: SensorKind) -> (Arc<MockTransport>, SensorLink, Arc<MeasurementBus>) {
        let mock = Arc::new(MockTransport::silent());
        let device = mock.select_device(kind).await.unwrap();
        let bus = Arc::new(MeasurementBus::new(device.clone(), kind, 16));
        let transport: Arc<dyn Transport> = mock.clone();
        let link = SensorLink::new(transport, device, kind, SanityBounds::default(), Arc::clone(&bus));
        (mock, link, bus)
    }

    fn recorder(bus: &MeasurementBus) -> Arc<Mutex<Vec<Reading>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.add_listener(Arc::new(move |reading: &Reading| sink.lock().unwrap().push(*reading)));
        seen
    }

    #[tokio::test]
    async fn test_open_subscribes_and_decodes() {
        let (mock, link, bus) = link_with_mock(SensorKind::HeartRate).await;
        let seen = recorder(&bus);

        link.open(Arc::new(|| {})).await.unwrap();
        assert!(mock.is_connected(&link.device().id));

        let characteristic = SensorKind::HeartRate.profile().characteristic;
        assert!(mock.push_notification(&link.device().id, characteristic, &[0x00, 150]));
        // Malformed frames are dropped without a reading.
        assert!(mock.push_notification(&link.device().id, characteristic, &[]));

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].value(), Some(150.0));
    }

    #[tokio::test]
    async fn test_reopen_resets_crank_state() {
        let (mock, link, bus) = link_with_mock(SensorKind::Cadence).await;
        let seen = recorder(&bus);
        let id = link.device().id.clone();
        let characteristic = SensorKind::Cadence.profile().characteristic;

        link.open(Arc::new(|| {})).await.unwrap();
        mock.push_notification(&id, characteristic, &[0x02, 100, 0, 0x00, 0x04]);
        mock.push_notification(&id, characteristic, &[0x02, 101, 0, 0x00, 0x08]);
        assert_eq!(seen.lock().unwrap().len(), 1);

        link.close().await.unwrap();
        link.open(Arc::new(|| {})).await.unwrap();

        // First sample after reopen has no prior pair, so no rpm.
        mock.push_notification(&id, characteristic, &[0x02, 102, 0, 0x00, 0x0c]);
        assert_eq!(seen.lock().unwrap().len(), 1);
        mock.push_notification(&id, characteristic, &[0x02, 103, 0, 0x00, 0x10]);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_listener_panic_is_contained() {
        let (mock, link, bus) = link_with_mock(SensorKind::Power).await;
        bus.add_listener(Arc::new(|_: &Reading| panic!("listener bug")));
        let seen = recorder(&bus);
        let id = link.device().id.clone();
        let characteristic = SensorKind::Power.profile().characteristic;

        link.open(Arc::new(|| {})).await.unwrap();
        mock.push_notification(&id, characteristic, &[0, 0, 0xc8, 0]);
        mock.push_notification(&id, characteristic, &[0, 0, 0xc9, 0]);

        // Listeners after the panicking one still see every reading.
        let values: Vec<_> = seen.lock().unwrap().iter().map(|r| r.value()).collect();
        assert_eq!(values, vec![Some(200.0), Some(201.0)]);
        assert!(mock.is_connected(&id));
    }

    #[tokio::test]
    async fn test_close_unsubscribes() {
        let (mock, link, _bus) = link_with_mock(SensorKind::Treadmill).await;
        link.open(Arc::new(|| {})).await.unwrap();
        assert_eq!(mock.subscription_count(&link.device().id), 1);

        link.close().await.unwrap();
        assert_eq!(mock.subscription_count(&link.device().id), 0);
        assert!(!mock.is_connected(&link.device().id));
    }

    #[tokio::test]
    async fn test_open_failure_propagates() {
        let (mock, link, _bus) = link_with_mock(SensorKind::Power).await;
        mock.fail_next_connects(1);
        assert!(link.open(Arc::new(|| {})).await.is_err());
        assert!(!mock.is_connected(&link.device().id));
    }
}
