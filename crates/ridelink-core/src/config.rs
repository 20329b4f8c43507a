//! Sensor configuration.
//!
//! Every field has a default, so an empty document is a valid config:
//!
//! ```toml
//! [reconnect]
//! max_attempts = 5
//! initial_delay_ms = 1000
//! max_delay_ms = 60000
//! backoff_multiplier = 2.0
//!
//! [bounds]
//! max_heart_rate = 300
//! max_power = 3000
//! max_cadence = 300
//!
//! [transport]
//! host = "auto"          # auto | native | bridge | mock
//! bridge = "127.0.0.1:7878"
//! device = "Stages"
//!
//! [mock]
//! interval_ms = 1000
//! ```

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ridelink_types::SanityBounds;

use crate::connection::ConnectionOptions;
use crate::error::{Error, Result};
use crate::events::DEFAULT_EVENT_CAPACITY;
use crate::supervisor::ReconnectPolicy;
use crate::transport::BtleplugOptions;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Reconnection settings.
    pub reconnect: ReconnectConfig,
    /// Plausibility limits for decoded values.
    pub bounds: SanityBounds,
    /// Host selection and transport settings.
    pub transport: TransportConfig,
    /// Synthetic sensor settings.
    pub mock: MockConfig,
}

impl SensorConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.reconnect_policy().validate()?;
        if self.bounds.max_power < 0 {
            return Err(Error::invalid_config("bounds.max_power must be >= 0"));
        }
        if self.transport.host == HostPreference::Bridge && self.transport.bridge.is_none() {
            return Err(Error::invalid_config(
                "transport.host = \"bridge\" requires transport.bridge",
            ));
        }
        if matches!(&self.transport.bridge, Some(addr) if addr.trim().is_empty()) {
            return Err(Error::invalid_config("transport.bridge cannot be empty"));
        }
        if self.transport.scan_timeout_secs == 0 {
            return Err(Error::invalid_config(
                "transport.scan_timeout_secs must be > 0",
            ));
        }
        Ok(())
    }

    /// The reconnect policy described by `[reconnect]`.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        let reconnect = &self.reconnect;
        ReconnectPolicy {
            max_attempts: (!reconnect.unlimited).then_some(reconnect.max_attempts),
            initial_delay: Duration::from_millis(reconnect.initial_delay_ms),
            max_delay: Duration::from_millis(reconnect.max_delay_ms),
            backoff_multiplier: reconnect.backoff_multiplier,
        }
    }

    /// Options for each connection.
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            policy: self.reconnect_policy(),
            bounds: self.bounds,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Options for the in-process BLE transport.
    pub fn btleplug_options(&self) -> BtleplugOptions {
        let transport = &self.transport;
        let mut options =
            BtleplugOptions::default().scan_timeout(Duration::from_secs(transport.scan_timeout_secs));
        if let Some(device) = &transport.device {
            options = options.name_filter(device.clone());
        }
        if let Some(secs) = transport.connect_timeout_secs {
            options = options.connect_timeout(Duration::from_secs(secs));
        }
        options
    }
}

/// `[reconnect]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// Ignore `max_attempts` and retry forever.
    pub unlimited: bool,
    /// Delay before the first attempt.
    pub initial_delay_ms: u64,
    /// Upper bound on any delay.
    pub max_delay_ms: u64,
    /// Growth factor between attempts.
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            unlimited: false,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Which BLE host to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostPreference {
    /// The bridge if an endpoint is configured, otherwise the in-process stack.
    #[default]
    Auto,
    /// The in-process BLE stack.
    Native,
    /// An external BLE host over the bridge protocol.
    Bridge,
    /// Synthetic sensors.
    Mock,
}

impl FromStr for HostPreference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(HostPreference::Auto),
            "native" | "btleplug" => Ok(HostPreference::Native),
            "bridge" => Ok(HostPreference::Bridge),
            "mock" => Ok(HostPreference::Mock),
            _ => Err(Error::invalid_config(format!(
                "unknown host '{}', expected auto, native, bridge or mock",
                s
            ))),
        }
    }
}

impl std::fmt::Display for HostPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HostPreference::Auto => "auto",
            HostPreference::Native => "native",
            HostPreference::Bridge => "bridge",
            HostPreference::Mock => "mock",
        };
        f.write_str(name)
    }
}

/// `[transport]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Host selection.
    pub host: HostPreference,
    /// Bridge endpoint (`host:port`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge: Option<String>,
    /// Only select devices whose name contains this.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// How long device selection scans.
    pub scan_timeout_secs: u64,
    /// Bound on connect; unbounded when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,
    /// Bound on each bridge request; unbounded when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            host: HostPreference::Auto,
            bridge: None,
            device: None,
            scan_timeout_secs: 10,
            connect_timeout_secs: None,
            request_timeout_secs: None,
        }
    }
}

/// `[mock]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MockConfig {
    /// Period of generated frames; 0 disables the generator.
    pub interval_ms: u64,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self { interval_ms: 1000 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        let config = SensorConfig::from_toml_str("").unwrap();
        assert_eq!(config, SensorConfig::default());
        assert_eq!(config.reconnect_policy(), ReconnectPolicy::default());
        assert_eq!(config.bounds, SanityBounds::default());
    }

    #[test]
    fn test_partial_sections() {
        let config = SensorConfig::from_toml_str(
            r#"
            [reconnect]
            max_attempts = 3
            initial_delay_ms = 500

            [bounds]
            max_power = 2000

            [transport]
            host = "bridge"
            bridge = "127.0.0.1:7878"
            "#,
        )
        .unwrap();

        let policy = config.reconnect_policy();
        assert_eq!(policy.max_attempts, Some(3));
        assert_eq!(policy.initial_delay, Duration::from_millis(500));
        assert_eq!(policy.max_delay, Duration::from_secs(60));
        assert_eq!(config.bounds.max_power, 2000);
        assert_eq!(config.bounds.max_heart_rate, 300);
        assert_eq!(config.transport.host, HostPreference::Bridge);
        assert_eq!(config.mock.interval_ms, 1000);
    }

    #[test]
    fn test_unlimited_reconnects() {
        let config = SensorConfig::from_toml_str("[reconnect]\nunlimited = true\n").unwrap();
        assert_eq!(config.reconnect_policy().max_attempts, None);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            SensorConfig::from_toml_str("[reconnect]\nbackoff_multiplier = 0.5\n"),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            SensorConfig::from_toml_str("[transport]\nhost = \"bridge\"\n"),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            SensorConfig::from_toml_str("[transport]\nhost = \"bluetooth\"\n"),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            SensorConfig::from_toml_str("[bounds]\nmax_power = -1\n"),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_host_preference_parse() {
        assert_eq!("Auto".parse::<HostPreference>().unwrap(), HostPreference::Auto);
        assert_eq!("btleplug".parse::<HostPreference>().unwrap(), HostPreference::Native);
        assert_eq!(HostPreference::Mock.to_string(), "mock");
        assert!("wifi".parse::<HostPreference>().is_err());
    }

    #[test]
    fn test_btleplug_options() {
        let config = SensorConfig::from_toml_str(
            "[transport]\ndevice = \"KICKR\"\nscan_timeout_secs = 5\nconnect_timeout_secs = 20\n",
        )
        .unwrap();
        let options = config.btleplug_options();
        assert_eq!(options.scan_timeout, Duration::from_secs(5));
        assert_eq!(options.name_filter.as_deref(), Some("KICKR"));
        assert_eq!(options.connect_timeout, Some(Duration::from_secs(20)));
    }

    #[test]
    fn test_config_serializes() {
        let config = SensorConfig::default();
        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("[reconnect]"));
        assert_eq!(SensorConfig::from_toml_str(&text).unwrap(), config);
    }
}
