//! Wire protocol spoken with a native BLE bridge.
//!
//! One JSON object per line, in both directions. Requests carry an `id`
//! that the bridge echoes in its response; events are unsolicited and
//! carry an `event` tag instead.
//!
//! ```text
//! -> {"id":1,"op":"requestDevice","services":["0000180d-0000-1000-8000-00805f9b34fb"]}
//! <- {"id":1,"ok":true,"device":{"deviceId":"C1:7F:22","name":"Polar H10"}}
//! -> {"id":2,"op":"connect","deviceId":"C1:7F:22"}
//! <- {"id":2,"ok":true}
//! <- {"event":"notification","deviceId":"C1:7F:22","characteristic":"00002a37-...","value":[0,72]}
//! <- {"event":"disconnected","deviceId":"C1:7F:22"}
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::transport::DeviceHandle;

/// Error string a bridge returns when the user dismissed the device picker.
pub const SELECTION_CANCELLED: &str = "cancelled";

/// An operation requested of the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Request {
    /// Show a device picker filtered to the given services.
    RequestDevice {
        services: Vec<Uuid>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name_prefix: Option<String>,
    },
    /// Open a GATT link.
    Connect { device_id: String },
    /// Subscribe to a characteristic.
    StartNotifications {
        device_id: String,
        service: Uuid,
        characteristic: Uuid,
    },
    /// Unsubscribe from a characteristic.
    StopNotifications {
        device_id: String,
        service: Uuid,
        characteristic: Uuid,
    },
    /// Close the GATT link.
    Disconnect { device_id: String },
}

impl Request {
    /// The `op` name, for logs.
    pub fn op(&self) -> &'static str {
        match self {
            Request::RequestDevice { .. } => "requestDevice",
            Request::Connect { .. } => "connect",
            Request::StartNotifications { .. } => "startNotifications",
            Request::StopNotifications { .. } => "stopNotifications",
            Request::Disconnect { .. } => "disconnect",
        }
    }
}

/// A request with its correlation ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    #[serde(flatten)]
    pub request: Request,
}

/// Device description returned by `requestDevice`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeDevice {
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl From<BridgeDevice> for DeviceHandle {
    fn from(device: BridgeDevice) -> Self {
        DeviceHandle {
            id: device.device_id,
            name: device.name,
        }
    }
}

/// Reply to a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<BridgeDevice>,
}

impl Response {
    /// A successful reply with no payload.
    pub fn ok(id: u64) -> Self {
        Self {
            id,
            ok: true,
            error: None,
            device: None,
        }
    }

    /// A failed reply.
    pub fn error(id: u64, message: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            error: Some(message.into()),
            device: None,
        }
    }

    /// A successful `requestDevice` reply.
    pub fn device(id: u64, device_id: impl Into<String>, name: Option<String>) -> Self {
        Self {
            device: Some(BridgeDevice {
                device_id: device_id.into(),
                name,
            }),
            ..Self::ok(id)
        }
    }
}

/// Unsolicited message from the bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum BridgeEvent {
    /// A characteristic value changed.
    Notification {
        device_id: String,
        characteristic: Uuid,
        value: Vec<u8>,
    },
    /// The link to a device was lost.
    Disconnected { device_id: String },
}

/// Any line the bridge may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Inbound {
    Event(BridgeEvent),
    Response(Response),
}

/// Serialize a message as one protocol line, newline included.
pub fn encode_line<T: Serialize>(message: &T) -> Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parse one line received from the bridge.
pub fn decode_inbound(line: &str) -> Result<Inbound> {
    Ok(serde_json::from_str(line.trim())?)
}
