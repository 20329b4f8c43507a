//! Transport over a native BLE bridge.
//!
//! Some hosts cannot drive the radio from this process (a mobile app shell
//! owns it, or the sensor is paired to another machine). A bridge exposes
//! that host's BLE stack over any byte stream using the line protocol in
//! [`protocol`]. The CLI reaches bridges over TCP.
//!
//! A background reader task routes each inbound line: responses complete
//! the pending request with the same `id`, notification events go to the
//! handler registered for that device and characteristic, and disconnect
//! events invoke the device's disconnect handler. If the stream itself
//! ends, every pending request fails and every connected device is
//! reported as disconnected.

pub mod protocol;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ridelink_types::SensorKind;

use self::protocol::{
    BridgeEvent, Inbound, Request, RequestEnvelope, Response, SELECTION_CANCELLED, decode_inbound,
    encode_line,
};
use super::{
    DeviceHandle, DisconnectHandler, NotificationHandler, Transport, with_optional_timeout,
};
use crate::error::{ConnectionFailureReason, Error, Result};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Callbacks registered for one bridged device.
#[derive(Default)]
struct DeviceCallbacks {
    on_disconnect: Option<DisconnectHandler>,
    notifications: HashMap<Uuid, NotificationHandler>,
}

/// State shared between the transport and its reader task.
#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<Response>>>,
    devices: Mutex<HashMap<String, DeviceCallbacks>>,
    closed: AtomicBool,
}

impl Shared {
    fn route(&self, inbound: Inbound) {
        match inbound {
            Inbound::Response(response) => {
                let waiter = self
                    .pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&response.id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!("Dropping response to unknown request {}", response.id),
                }
            }
            Inbound::Event(BridgeEvent::Notification {
                device_id,
                characteristic,
                value,
            }) => {
                let handler = self
                    .devices
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&device_id)
                    .and_then(|d| d.notifications.get(&characteristic).cloned());
                if let Some(handler) = handler {
                    handler(&value);
                }
            }
            Inbound::Event(BridgeEvent::Disconnected { device_id }) => {
                info!("Bridge reports {} disconnected", device_id);
                if let Some(handler) = self.take_disconnect(&device_id) {
                    handler();
                }
            }
        }
    }

    /// Forget a device's callbacks and hand back its disconnect handler.
    fn take_disconnect(&self, device_id: &str) -> Option<DisconnectHandler> {
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        let callbacks = devices.get_mut(device_id)?;
        callbacks.notifications.clear();
        callbacks.on_disconnect.take()
    }

    /// The stream ended: fail pending requests and report every link lost.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let handlers: Vec<DisconnectHandler> = self
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values_mut()
            .filter_map(|d| {
                d.notifications.clear();
                d.on_disconnect.take()
            })
            .collect();
        for handler in handlers {
            handler();
        }
    }
}

/// Transport talking to a native BLE bridge over a byte stream.
pub struct BridgeTransport {
    writer: tokio::sync::Mutex<BoxedWriter>,
    shared: Arc<Shared>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
    request_timeout: Option<Duration>,
    name_prefix: Option<String>,
}

impl std::fmt::Debug for BridgeTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeTransport")
            .field("closed", &self.is_closed())
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl BridgeTransport {
    /// Speak the bridge protocol over `stream`.
    ///
    /// Must be called within a Tokio runtime; the reader task is spawned
    /// immediately.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let shared = Arc::new(Shared::default());

        let reader_shared = Arc::clone(&shared);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match decode_inbound(&line) {
                        Ok(inbound) => reader_shared.route(inbound),
                        Err(e) => warn!("Ignoring malformed bridge line: {}", e),
                    },
                    Ok(None) => {
                        info!("Bridge closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!("Bridge read failed: {}", e);
                        break;
                    }
                }
            }
            reader_shared.close();
        });

        Self {
            writer: tokio::sync::Mutex::new(Box::new(write_half)),
            shared,
            next_id: AtomicU64::new(1),
            reader,
            request_timeout: None,
            name_prefix: None,
        }
    }

    /// Connect to a bridge listening on TCP.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn connect_tcp(addr: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        info!("Connected to bridge at {}", stream.peer_addr()?);
        Ok(Self::new(stream))
    }

    /// Fail requests the bridge does not answer within `timeout`.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Ask the bridge to only offer devices whose name starts with `prefix`.
    pub fn with_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = Some(prefix.into());
        self
    }

    /// Whether the underlying stream has ended.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Send a request and wait for its response.
    ///
    /// Returns the response only if the bridge reported success.
    async fn call(&self, request: Request) -> Result<Response> {
        if self.is_closed() {
            return Err(Error::Bridge("bridge connection closed".to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let op = request.op();
        let line = encode_line(&RequestEnvelope { id, request })?;

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);

        debug!("-> {} #{}", op, id);
        let sent = async {
            let mut writer = self.writer.lock().await;
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = sent {
            self.forget(id);
            return Err(e.into());
        }

        let response = with_optional_timeout(self.request_timeout, op, async {
            rx.await
                .map_err(|_| Error::Bridge("bridge connection closed".to_string()))
        })
        .await;
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.forget(id);
                return Err(e);
            }
        };

        debug!("<- {} #{} ok={}", op, id, response.ok);
        if response.ok {
            Ok(response)
        } else {
            Err(Error::Bridge(
                response
                    .error
                    .unwrap_or_else(|| format!("{} failed", op)),
            ))
        }
    }

    fn forget(&self, id: u64) {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
    }

    fn with_device<R>(&self, device_id: &str, f: impl FnOnce(&mut DeviceCallbacks) -> R) -> R {
        let mut devices = self
            .shared
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        f(devices.entry(device_id.to_string()).or_default())
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    fn name(&self) -> &'static str {
        "bridge"
    }

    #[tracing::instrument(level = "info", skip(self), fields(kind = %kind))]
    async fn select_device(&self, kind: SensorKind) -> Result<DeviceHandle> {
        let request = Request::RequestDevice {
            services: vec![kind.profile().service],
            name_prefix: self.name_prefix.clone(),
        };
        let response = match self.call(request).await {
            Ok(response) => response,
            Err(Error::Bridge(msg)) if msg == SELECTION_CANCELLED => {
                return Err(Error::SelectionCancelled);
            }
            Err(e) => return Err(e),
        };

        let device: DeviceHandle = response
            .device
            .ok_or_else(|| Error::Bridge("requestDevice response carried no device".to_string()))?
            .into();
        info!("Selected {}", device);
        Ok(device)
    }

    #[tracing::instrument(level = "info", skip_all, fields(device = %device))]
    async fn connect(
        &self,
        device: &DeviceHandle,
        on_disconnect: DisconnectHandler,
    ) -> Result<()> {
        let request = Request::Connect {
            device_id: device.id.clone(),
        };
        match self.call(request).await {
            Ok(_) => {}
            Err(Error::Bridge(msg)) if self.is_closed() => {
                debug!("Bridge closed during connect: {}", msg);
                return Err(Error::connection_failed(
                    Some(device.id.clone()),
                    ConnectionFailureReason::TransportClosed,
                ));
            }
            Err(Error::Bridge(msg)) => {
                return Err(Error::connection_failed(
                    Some(device.id.clone()),
                    ConnectionFailureReason::Rejected(msg),
                ));
            }
            Err(e) => return Err(e),
        }

        self.with_device(&device.id, |d| d.on_disconnect = Some(on_disconnect));
        info!("Connected!");
        Ok(())
    }

    async fn start_notifications(
        &self,
        device: &DeviceHandle,
        service: Uuid,
        characteristic: Uuid,
        on_value: NotificationHandler,
    ) -> Result<()> {
        // Register first so values sent right after the response are not lost.
        self.with_device(&device.id, |d| {
            d.notifications.insert(characteristic, on_value)
        });

        let request = Request::StartNotifications {
            device_id: device.id.clone(),
            service,
            characteristic,
        };
        if let Err(e) = self.call(request).await {
            self.with_device(&device.id, |d| d.notifications.remove(&characteristic));
            return Err(e);
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
        self.with_device(&device.id, |d| d.notifications.remove(&characteristic));
        let request = Request::StopNotifications {
            device_id: device.id.clone(),
            service,
            characteristic,
        };
        self.call(request).await.map(|_| ())
    }

    #[tracing::instrument(level = "info", skip_all, fields(device = %device))]
    async fn disconnect(&self, device: &DeviceHandle) -> Result<()> {
        info!("Disconnecting from device...");
        self.shared
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&device.id);

        if self.is_closed() {
            return Ok(());
        }
        let request = Request::Disconnect {
            device_id: device.id.clone(),
        };
        self.call(request).await.map(|_| ())
    }
}

impl Drop for BridgeTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
