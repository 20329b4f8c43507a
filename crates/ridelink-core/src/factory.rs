//! Choosing a transport and assembling connections.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::OnceCell;
use tracing::info;

use ridelink_types::SensorKind;

use crate::config::{HostPreference, SensorConfig, TransportConfig};
use crate::connection::SensorConnection;
use crate::error::{Error, Result};
use crate::mock::MockTransport;
use crate::transport::{BridgeTransport, BtleplugTransport, Transport};

/// The BLE host a factory talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuntimeHost {
    /// The in-process BLE stack.
    Native,
    /// An external BLE host over the bridge protocol.
    Bridge,
    /// Synthetic sensors.
    Mock,
}

impl RuntimeHost {
    /// Resolve the configured preference. `auto` picks the bridge when an
    /// endpoint is configured, otherwise the in-process stack.
    pub fn detect(config: &TransportConfig) -> Self {
        match config.host {
            HostPreference::Native => RuntimeHost::Native,
            HostPreference::Bridge => RuntimeHost::Bridge,
            HostPreference::Mock => RuntimeHost::Mock,
            HostPreference::Auto if config.bridge.is_some() => RuntimeHost::Bridge,
            HostPreference::Auto => RuntimeHost::Native,
        }
    }
}

impl std::fmt::Display for RuntimeHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeHost::Native => write!(f, "native"),
            RuntimeHost::Bridge => write!(f, "bridge"),
            RuntimeHost::Mock => write!(f, "mock"),
        }
    }
}

/// Builds [`SensorConnection`]s over the transport for the detected host.
///
/// The transport is created on first use and shared by every connection
/// the factory makes.
pub struct SensorFactory {
    config: SensorConfig,
    host: RuntimeHost,
    transport: OnceCell<Arc<dyn Transport>>,
}

impl std::fmt::Debug for SensorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorFactory")
            .field("host", &self.host)
            .field("transport", &self.transport.get().map(|t| t.name()))
            .finish_non_exhaustive()
    }
}

impl SensorFactory {
    /// Create a factory for the host `config` selects.
    pub fn new(config: SensorConfig) -> Self {
        let host = RuntimeHost::detect(&config.transport);
        Self {
            config,
            host,
            transport: OnceCell::new(),
        }
    }

    /// The detected host.
    pub fn host(&self) -> RuntimeHost {
        self.host
    }

    /// The configuration in use.
    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    /// The shared transport, created on first call.
    pub async fn transport(&self) -> Result<Arc<dyn Transport>> {
        self.transport
            .get_or_try_init(|| self.build_transport())
            .await
            .cloned()
    }

    async fn build_transport(&self) -> Result<Arc<dyn Transport>> {
        info!("Creating {} transport", self.host);
        let settings = &self.config.transport;
        let transport: Arc<dyn Transport> = match self.host {
            RuntimeHost::Native => {
                Arc::new(BtleplugTransport::new(self.config.btleplug_options()).await?)
            }
            RuntimeHost::Bridge => {
                let addr = settings
                    .bridge
                    .as_deref()
                    .ok_or_else(|| Error::invalid_config("no bridge endpoint configured"))?;
                let mut bridge = BridgeTransport::connect_tcp(addr).await?;
                if let Some(secs) = settings.request_timeout_secs {
                    bridge = bridge.with_request_timeout(Duration::from_secs(secs));
                }
                if let Some(prefix) = &settings.device {
                    bridge = bridge.with_name_prefix(prefix.clone());
                }
                Arc::new(bridge)
            }
            RuntimeHost::Mock => Arc::new(MockTransport::new(Duration::from_millis(
                self.config.mock.interval_ms,
            ))),
        };
        Ok(transport)
    }

    /// Connect to a sensor of `kind` on the host's transport.
    #[tracing::instrument(level = "info", skip(self), fields(host = %self.host))]
    pub async fn connect(&self, kind: SensorKind) -> Result<SensorConnection> {
        let transport = self.transport().await?;
        self.connect_with(transport, kind).await
    }

    /// Connect to a sensor of `kind` on an explicit transport.
    pub async fn connect_with(
        &self,
        transport: Arc<dyn Transport>,
        kind: SensorKind,
    ) -> Result<SensorConnection> {
        SensorConnection::open(transport, kind, self.config.connection_options()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use ridelink_types::ConnectionStatus;

    fn mock_config() -> SensorConfig {
        let mut config = SensorConfig::default();
        config.transport.host = HostPreference::Mock;
        config.mock.interval_ms = 0;
        config
    }

    #[test]
    fn test_detect_host() {
        let mut transport = TransportConfig::default();
        assert_eq!(RuntimeHost::detect(&transport), RuntimeHost::Native);

        transport.bridge = Some("127.0.0.1:7878".to_string());
        assert_eq!(RuntimeHost::detect(&transport), RuntimeHost::Bridge);

        transport.host = HostPreference::Native;
        assert_eq!(RuntimeHost::detect(&transport), RuntimeHost::Native);

        transport.host = HostPreference::Mock;
        assert_eq!(RuntimeHost::detect(&transport), RuntimeHost::Mock);
    }

    #[tokio::test]
    async fn test_mock_connect() {
        let factory = SensorFactory::new(mock_config());
        assert_eq!(factory.host(), RuntimeHost::Mock);

        let connection = factory.connect(SensorKind::Power).await.unwrap();
        assert_eq!(connection.kind(), SensorKind::Power);
        assert_eq!(connection.status(), Some(ConnectionStatus::Connected));
        assert!(connection.device_name().starts_with("Mock"));
        connection.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_transport_shared() {
        let factory = SensorFactory::new(mock_config());
        let a = factory.transport().await.unwrap();
        let b = factory.transport().await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.name(), "mock");
    }

    #[tokio::test]
    async fn test_bridge_unreachable() {
        let mut config = SensorConfig::default();
        // Port 9 (discard) on loopback is almost never listening.
        config.transport.bridge = Some("127.0.0.1:9".to_string());
        let factory = SensorFactory::new(config);
        assert_eq!(factory.host(), RuntimeHost::Bridge);
        assert!(factory.connect(SensorKind::HeartRate).await.is_err());
    }
}
