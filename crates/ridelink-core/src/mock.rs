//! Mock transport for testing and development.
//!
//! [`MockTransport`] implements [`Transport`] without any Bluetooth
//! hardware. Each selected device is a synthetic sensor that, while
//! subscribed, emits valid wire frames for its kind on a fixed interval.
//!
//! # Features
//!
//! - **Failure injection**: fail the next N connects, or cancel selection
//! - **Link loss**: simulate an unsolicited disconnect with [`MockTransport::trigger_disconnect`]
//! - **Scripted frames**: deliver exact payloads with [`MockTransport::push_notification`]
//! - **Latency simulation**: delay connects to exercise in-flight cancellation

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use ridelink_types::SensorKind;

use crate::error::{Error, Result};
use crate::transport::{DeviceHandle, DisconnectHandler, NotificationHandler, Transport};

/// Produces plausible notification payloads for one sensor kind.
///
/// Frames are encoded exactly as a real sensor would send them, so they
/// exercise the same decoders.
#[derive(Debug, Clone)]
pub struct FrameGenerator {
    kind: SensorKind,
    crank_revs: u16,
    crank_time: u16,
}

impl FrameGenerator {
    /// Create a generator for `kind`.
    pub fn new(kind: SensorKind) -> Self {
        Self {
            kind,
            crank_revs: 0,
            crank_time: 0,
        }
    }

    /// The next frame.
    pub fn next_frame(&mut self) -> Vec<u8> {
        match self.kind {
            SensorKind::Power => {
                let watts: i16 = rand::random_range(150..=250);
                let mut frame = vec![0x00, 0x00];
                frame.extend_from_slice(&watts.to_le_bytes());
                frame
            }
            SensorKind::HeartRate => vec![0x00, rand::random_range(110..=160)],
            SensorKind::Cadence => {
                // One revolution per frame at 80-100 rpm; both counters roll over naturally.
                let rpm: u32 = rand::random_range(80..=100);
                let ticks = (60 * 1024 / rpm) as u16;
                self.crank_revs = self.crank_revs.wrapping_add(1);
                self.crank_time = self.crank_time.wrapping_add(ticks);
                let mut frame = vec![0x02];
                frame.extend_from_slice(&self.crank_revs.to_le_bytes());
                frame.extend_from_slice(&self.crank_time.to_le_bytes());
                frame
            }
            SensorKind::Treadmill => {
                // speed + inclination/ramp angle
                let speed: u16 = rand::random_range(900..=1100);
                let incline: i16 = rand::random_range(0..=30);
                let mut frame = vec![0x08, 0x00];
                frame.extend_from_slice(&speed.to_le_bytes());
                frame.extend_from_slice(&incline.to_le_bytes());
                frame.extend_from_slice(&0i16.to_le_bytes());
                frame
            }
        }
    }
}

/// Per-device state of the mock.
struct MockPeripheral {
    kind: SensorKind,
    connected: bool,
    on_disconnect: Option<DisconnectHandler>,
    subscriptions: HashMap<Uuid, Subscription>,
}

struct Subscription {
    handler: NotificationHandler,
    generator: Option<JoinHandle<()>>,
}

impl Subscription {
    fn cancel(self) {
        if let Some(task) = self.generator {
            task.abort();
        }
    }
}

impl MockPeripheral {
    fn drop_link(&mut self) {
        self.connected = false;
        for (_, subscription) in self.subscriptions.drain() {
            subscription.cancel();
        }
    }
}

/// A mock BLE host for testing.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use ridelink_core::{MockTransport, Transport};
/// use ridelink_types::SensorKind;
///
/// #[tokio::main]
/// async fn main() {
///     let mock = MockTransport::new(Duration::ZERO);
///     let device = mock.select_device(SensorKind::Power).await.unwrap();
///     assert!(device.name.unwrap().contains("Power"));
/// }
/// ```
pub struct MockTransport {
    interval: Duration,
    devices: Mutex<HashMap<String, MockPeripheral>>,
    fail_selection: AtomicBool,
    /// Number of connects to fail before succeeding.
    remaining_failures: AtomicU32,
    connect_count: AtomicU32,
    /// Simulated connect latency in milliseconds (0 = no delay).
    connect_latency_ms: AtomicU64,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("interval", &self.interval)
            .field("connect_count", &self.connect_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl MockTransport {
    /// Create a mock whose sensors emit a frame every `interval`.
    ///
    /// `Duration::ZERO` disables the generator; frames are then delivered
    /// only through [`MockTransport::push_notification`].
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            devices: Mutex::new(HashMap::new()),
            fail_selection: AtomicBool::new(false),
            remaining_failures: AtomicU32::new(0),
            connect_count: AtomicU32::new(0),
            connect_latency_ms: AtomicU64::new(0),
        }
    }

    /// A mock with the generator disabled.
    pub fn silent() -> Self {
        Self::new(Duration::ZERO)
    }

    fn devices(&self) -> std::sync::MutexGuard<'_, HashMap<String, MockPeripheral>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make device selection fail as if the user dismissed the picker.
    pub fn fail_selection(&self, fail: bool) {
        self.fail_selection.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `count` connect attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.remaining_failures.store(count, Ordering::SeqCst);
    }

    /// Delay every connect by `latency`.
    pub fn set_connect_latency(&self, latency: Duration) {
        self.connect_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of connect attempts made, successful or not.
    pub fn connect_count(&self) -> u32 {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// Whether `device_id` currently has an open link.
    pub fn is_connected(&self, device_id: &str) -> bool {
        self.devices()
            .get(device_id)
            .is_some_and(|device| device.connected)
    }

    /// Number of active subscriptions on `device_id`.
    pub fn subscription_count(&self, device_id: &str) -> usize {
        self.devices()
            .get(device_id)
            .map_or(0, |device| device.subscriptions.len())
    }

    /// Simulate the sensor dropping the link.
    ///
    /// Returns `false` if the device was not connected.
    pub fn trigger_disconnect(&self, device_id: &str) -> bool {
        let handler = {
            let mut devices = self.devices();
            let Some(device) = devices.get_mut(device_id) else {
                return false;
            };
            if !device.connected {
                return false;
            }
            device.drop_link();
            device.on_disconnect.take()
        };
        debug!("Mock link loss on {}", device_id);
        if let Some(handler) = handler {
            handler();
        }
        true
    }

    /// Deliver `data` to the subscription on `characteristic`, if any.
    ///
    /// Returns `false` if nothing was subscribed.
    pub fn push_notification(&self, device_id: &str, characteristic: Uuid, data: &[u8]) -> bool {
        let handler = self
            .devices()
            .get(device_id)
            .and_then(|device| device.subscriptions.get(&characteristic))
            .map(|subscription| Arc::clone(&subscription.handler));
        match handler {
            Some(handler) => {
                handler(data);
                true
            }
            None => false,
        }
    }

    fn spawn_generator(&self, kind: SensorKind, handler: NotificationHandler) -> Option<JoinHandle<()>> {
        if self.interval.is_zero() {
            return None;
        }
        let period = self.interval;
        Some(tokio::spawn(async move {
            let mut generator = FrameGenerator::new(kind);
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                handler(&generator.next_frame());
            }
        }))
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn select_device(&self, kind: SensorKind) -> Result<DeviceHandle> {
        if self.fail_selection.load(Ordering::SeqCst) {
            return Err(Error::SelectionCancelled);
        }

        let handle = DeviceHandle::with_name(
            format!("MOCK-{:06X}", rand::random::<u32>() % 0xFFFFFF),
            format!("Mock {} sensor", kind),
        );
        self.devices().insert(
            handle.id.clone(),
            MockPeripheral {
                kind,
                connected: false,
                on_disconnect: None,
                subscriptions: HashMap::new(),
            },
        );
        Ok(handle)
    }

    async fn connect(
        &self,
        device: &DeviceHandle,
        on_disconnect: DisconnectHandler,
    ) -> Result<()> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);

        let latency = self.connect_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        // Transient failure injection
        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::connection_failed_str(
                Some(device.id.clone()),
                "mock connect failure",
            ));
        }

        let mut devices = self.devices();
        let peripheral = devices
            .get_mut(&device.id)
            .ok_or_else(|| Error::device_not_found(&device.id))?;
        peripheral.connected = true;
        peripheral.on_disconnect = Some(on_disconnect);
        Ok(())
    }

    async fn start_notifications(
        &self,
        device: &DeviceHandle,
        service: Uuid,
        characteristic: Uuid,
        on_value: NotificationHandler,
    ) -> Result<()> {
        let kind = {
            let devices = self.devices();
            let peripheral = devices
                .get(&device.id)
                .ok_or_else(|| Error::device_not_found(&device.id))?;
            if !peripheral.connected {
                return Err(Error::NotConnected);
            }
            let profile = peripheral.kind.profile();
            if profile.service != service || profile.characteristic != characteristic {
                return Err(Error::characteristic_not_found(characteristic));
            }
            peripheral.kind
        };

        let generator = self.spawn_generator(kind, Arc::clone(&on_value));
        let mut devices = self.devices();
        let Some(peripheral) = devices.get_mut(&device.id) else {
            if let Some(task) = generator {
                task.abort();
            }
            return Err(Error::device_not_found(&device.id));
        };
        let subscription = Subscription {
            handler: on_value,
            generator,
        };
        if let Some(old) = peripheral.subscriptions.insert(characteristic, subscription) {
            old.cancel();
        }
        Ok(())
    }

    async fn stop_notifications(
        &self,
        device: &DeviceHandle,
        _service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        if let Some(subscription) = self
            .devices()
            .get_mut(&device.id)
            .and_then(|peripheral| peripheral.subscriptions.remove(&characteristic))
        {
            subscription.cancel();
        }
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceHandle) -> Result<()> {
        let mut devices = self.devices();
        let peripheral = devices
            .get_mut(&device.id)
            .ok_or_else(|| Error::device_not_found(&device.id))?;
        peripheral.drop_link();
        peripheral.on_disconnect = None;
        Ok(())
    }
}

impl Drop for MockTransport {
    fn drop(&mut self) {
        for device in self.devices().values_mut() {
            device.drop_link();
        }
    }
}
