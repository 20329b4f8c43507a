//! In-process transport over the host Bluetooth stack (btleplug).
//!
//! Device selection scans with a service filter for the requested sensor
//! kind and takes the first peripheral that advertises the service (and,
//! if configured, whose name contains the requested fragment). Link loss is
//! observed through the adapter's central event stream; notifications are
//! pumped from the peripheral's notification stream by one tracked task
//! per subscription.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{Stream, StreamExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};
use uuid::Uuid;

use ridelink_types::SensorKind;

use super::{
    DeviceHandle, DisconnectHandler, NotificationHandler, Transport, with_optional_timeout,
};
use crate::error::{DeviceNotFoundReason, Error, Result};

/// Default time to scan before giving up on device selection.
pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

/// How often scan results are polled while selecting a device.
const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Options for [`BtleplugTransport`].
#[derive(Debug, Clone)]
pub struct BtleplugOptions {
    /// How long device selection scans before failing.
    pub scan_timeout: Duration,
    /// Only select devices whose advertised name contains this fragment.
    pub name_filter: Option<String>,
    /// Upper bound on connect plus service discovery. `None` waits as long
    /// as the host stack does.
    pub connect_timeout: Option<Duration>,
}

impl Default for BtleplugOptions {
    fn default() -> Self {
        Self {
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
            name_filter: None,
            connect_timeout: None,
        }
    }
}

impl BtleplugOptions {
    /// Set the scan timeout.
    pub fn scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Only select devices whose name contains `fragment`.
    pub fn name_filter(mut self, fragment: impl Into<String>) -> Self {
        self.name_filter = Some(fragment.into());
        self
    }

    /// Bound connect plus service discovery.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    fn name_matches(&self, name: Option<&str>) -> bool {
        match (&self.name_filter, name) {
            (None, _) => true,
            (Some(fragment), Some(name)) => name.to_lowercase().contains(&fragment.to_lowercase()),
            (Some(_), None) => false,
        }
    }
}

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters
        .into_iter()
        .next()
        .ok_or(Error::DeviceNotFound(DeviceNotFoundReason::NoAdapter))
}

/// Transport driving the host Bluetooth stack in-process.
pub struct BtleplugTransport {
    adapter: Adapter,
    options: BtleplugOptions,
    /// Peripherals returned by selection, by device ID.
    peripherals: Mutex<HashMap<String, Peripheral>>,
    /// Disconnect watcher per connected device.
    watchers: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Notification pump per (device, characteristic).
    pumps: Mutex<HashMap<(String, Uuid), JoinHandle<()>>>,
}

impl std::fmt::Debug for BtleplugTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugTransport")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl BtleplugTransport {
    /// Create a transport on the first available adapter.
    pub async fn new(options: BtleplugOptions) -> Result<Self> {
        let adapter = get_adapter().await?;
        Ok(Self::with_adapter(adapter, options))
    }

    /// Create a transport on a specific adapter.
    pub fn with_adapter(adapter: Adapter, options: BtleplugOptions) -> Self {
        Self {
            adapter,
            options,
            peripherals: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
            pumps: Mutex::new(HashMap::new()),
        }
    }

    async fn peripheral(&self, device: &DeviceHandle) -> Result<Peripheral> {
        self.peripherals
            .lock()
            .await
            .get(&device.id)
            .cloned()
            .ok_or_else(|| Error::device_not_found(&device.id))
    }

    /// Look for an already-discovered peripheral advertising `service`.
    async fn find_advertising(&self, service: Uuid) -> Result<Option<(Peripheral, Option<String>)>> {
        for peripheral in self.adapter.peripherals().await? {
            let Some(properties) = peripheral.properties().await? else {
                continue;
            };
            if !properties.services.contains(&service) {
                continue;
            }
            let name = properties.local_name;
            if self.options.name_matches(name.as_deref()) {
                return Ok(Some((peripheral, name)));
            }
        }
        Ok(None)
    }

    async fn abort_pumps(&self, device_id: &str) {
        let mut pumps = self.pumps.lock().await;
        pumps.retain(|(id, _), handle| {
            if id == device_id {
                handle.abort();
                false
            } else {
                true
            }
        });
    }
}

/// Disconnect a peripheral whose link setup failed part-way.
async fn release(peripheral: &Peripheral) {
    if peripheral.is_connected().await.unwrap_or(false)
        && let Err(e) = peripheral.disconnect().await
    {
        debug!("Disconnect after failed setup: {}", e);
    }
}

/// Call `on_disconnect` once, on the first event matching `is_lost`.
fn watch_for_disconnect<S, F>(
    mut events: S,
    is_lost: F,
    device_id: String,
    on_disconnect: DisconnectHandler,
) -> JoinHandle<()>
where
    S: Stream + Unpin + Send + 'static,
    S::Item: Send,
    F: Fn(&S::Item) -> bool + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            if is_lost(&event) {
                info!("Device {} disconnected", device_id);
                on_disconnect();
                return;
            }
        }
        debug!("Adapter event stream ended for {}", device_id);
    })
}

#[async_trait]
impl Transport for BtleplugTransport {
    fn name(&self) -> &'static str {
        "btleplug"
    }

    #[tracing::instrument(level = "info", skip(self), fields(kind = %kind))]
    async fn select_device(&self, kind: SensorKind) -> Result<DeviceHandle> {
        let service = kind.profile().service;
        let filter = ScanFilter {
            services: vec![service],
        };

        info!("Scanning for {} sensors...", kind);
        self.adapter.start_scan(filter).await?;

        let deadline = Instant::now() + self.options.scan_timeout;
        let found = loop {
            match self.find_advertising(service).await {
                Ok(Some(found)) => break Some(found),
                Ok(None) => {}
                Err(e) => debug!("Scan poll failed: {}", e),
            }
            if Instant::now() >= deadline {
                break None;
            }
            sleep(SCAN_POLL_INTERVAL).await;
        };

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }

        let Some((peripheral, name)) = found else {
            return Err(match &self.options.name_filter {
                Some(fragment) => Error::device_not_found(fragment),
                None => Error::DeviceNotFound(DeviceNotFoundReason::ScanTimeout {
                    duration: self.options.scan_timeout,
                }),
            });
        };

        let handle = DeviceHandle {
            id: peripheral.id().to_string(),
            name,
        };
        info!("Selected {}", handle);
        self.peripherals
            .lock()
            .await
            .insert(handle.id.clone(), peripheral);
        Ok(handle)
    }

    #[tracing::instrument(level = "info", skip_all, fields(device = %device))]
    async fn connect(
        &self,
        device: &DeviceHandle,
        on_disconnect: DisconnectHandler,
    ) -> Result<()> {
        let peripheral = self.peripheral(device).await?;

        // Stop watching the previous link before opening a new one.
        if let Some(old) = self.watchers.lock().await.remove(&device.id) {
            old.abort();
        }

        // Taken before connecting so a drop during discovery is still seen.
        let events = self.adapter.events().await?;

        let opened = with_optional_timeout(self.options.connect_timeout, "connect to device", async {
            info!("Connecting to device...");
            if !peripheral.is_connected().await.unwrap_or(false) {
                peripheral.connect().await?;
            }
            info!("Discovering services...");
            peripheral.discover_services().await?;
            Ok(())
        })
        .await;
        if let Err(e) = opened {
            release(&peripheral).await;
            return Err(e);
        }

        let peripheral_id = peripheral.id();
        let watcher = watch_for_disconnect(
            events,
            move |event| matches!(event, CentralEvent::DeviceDisconnected(id) if *id == peripheral_id),
            device.id.clone(),
            on_disconnect,
        );

        if !peripheral.is_connected().await.unwrap_or(false) {
            watcher.abort();
            release(&peripheral).await;
            warn!("Link dropped during service discovery");
            return Err(Error::NotConnected);
        }
        info!("Connected!");
        self.watchers.lock().await.insert(device.id.clone(), watcher);

        Ok(())
    }

    async fn start_notifications(
        &self,
        device: &DeviceHandle,
        service: Uuid,
        characteristic: Uuid,
        on_value: NotificationHandler,
    ) -> Result<()> {
        let peripheral = self.peripheral(device).await?;
        if !peripheral.is_connected().await.unwrap_or(false) {
            return Err(Error::NotConnected);
        }

        let target = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
            .ok_or_else(|| Error::characteristic_not_found(characteristic))?;

        peripheral.subscribe(&target).await?;

        // Set up notification handler
        let mut stream = peripheral.notifications().await?;
        let handle = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid == characteristic {
                    on_value(&notification.value);
                }
            }
            debug!("Notification stream for {} ended", characteristic);
        });

        if let Some(old) = self
            .pumps
            .lock()
            .await
            .insert((device.id.clone(), characteristic), handle)
        {
            old.abort();
        }

        debug!("Subscribed to {} on {}", characteristic, device);
        Ok(())
    }

    async fn stop_notifications(
        &self,
        device: &DeviceHandle,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<()> {
        if let Some(handle) = self
            .pumps
            .lock()
            .await
            .remove(&(device.id.clone(), characteristic))
        {
            handle.abort();
        }

        let peripheral = self.peripheral(device).await?;
        if !peripheral.is_connected().await.unwrap_or(false) {
            return Ok(());
        }
        if let Some(target) = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic && c.service_uuid == service)
        {
            peripheral.unsubscribe(&target).await?;
        }
        Ok(())
    }

    #[tracing::instrument(level = "info", skip_all, fields(device = %device))]
    async fn disconnect(&self, device: &DeviceHandle) -> Result<()> {
        info!("Disconnecting from device...");

        // Drop the watcher first so a requested disconnect is not reported as link loss.
        if let Some(watcher) = self.watchers.lock().await.remove(&device.id) {
            watcher.abort();
        }
        self.abort_pumps(&device.id).await;

        let peripheral = self.peripheral(device).await?;
        if peripheral.is_connected().await.unwrap_or(false) {
            peripheral.disconnect().await?;
        }
        Ok(())
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        if let Ok(watchers) = self.watchers.try_lock() {
            watchers.values().for_each(JoinHandle::abort);
        }
        if let Ok(pumps) = self.pumps.try_lock() {
            pumps.values().for_each(JoinHandle::abort);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_default() {
        let opts = BtleplugOptions::default();
        assert_eq!(opts.scan_timeout, DEFAULT_SCAN_TIMEOUT);
        assert!(opts.name_filter.is_none());
        assert!(opts.connect_timeout.is_none());
    }

    #[test]
    fn test_options_builder() {
        let opts = BtleplugOptions::default()
            .scan_timeout(Duration::from_secs(3))
            .name_filter("HRM")
            .connect_timeout(Duration::from_secs(15));
        assert_eq!(opts.scan_timeout, Duration::from_secs(3));
        assert_eq!(opts.name_filter.as_deref(), Some("HRM"));
        assert_eq!(opts.connect_timeout, Some(Duration::from_secs(15)));
    }

    #[tokio::test]
    async fn test_disconnect_seen_when_queued_before_watch() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicUsize, Ordering};

        let (tx, rx) = futures::channel::mpsc::unbounded::<u32>();
        // Queued while the link was still being set up.
        tx.unbounded_send(1).unwrap();
        tx.unbounded_send(7).unwrap();
        tx.unbounded_send(7).unwrap();
        drop(tx);

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let watcher = watch_for_disconnect(
            rx,
            |event| *event == 7,
            "dev".to_string(),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        watcher.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unrelated_events_ignored() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let (tx, rx) = futures::channel::mpsc::unbounded::<u32>();
        tx.unbounded_send(1).unwrap();
        tx.unbounded_send(2).unwrap();
        drop(tx);

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        watch_for_disconnect(
            rx,
            |event| *event == 7,
            "dev".to_string(),
            Arc::new(move || flag.store(true, Ordering::SeqCst)),
        )
        .await
        .unwrap();
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_name_matching() {
        let any = BtleplugOptions::default();
        assert!(any.name_matches(None));
        assert!(any.name_matches(Some("Wahoo KICKR")));

        let filtered = BtleplugOptions::default().name_filter("kickr");
        assert!(filtered.name_matches(Some("Wahoo KICKR 1A2B")));
        assert!(!filtered.name_matches(Some("Polar H10")));
        assert!(!filtered.name_matches(None));
    }
}
