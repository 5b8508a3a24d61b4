//! High-level gateway facade.
//!
//! The [`Gateway`] is the single owner of the process-wide BLE session. All
//! other components go through it to connect, send, scan and pair; none of
//! them ever hold the session themselves.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::bus::{ADAPTER_INTERFACE, Bus, BusValue, DEFAULT_ADAPTER_PATH, DEVICE_INTERFACE,
    device_path};
use crate::error::{Error, Result};
use crate::event::{Event, EventDispatcher, Subscription};
use crate::protocol;
use crate::tasks;
use crate::transport::{BleConfig, BleTransport, ConnectionState, DEFAULT_MAX_RETRIES};

/// Configuration for the gateway.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Adapter object path devices hang off.
    pub adapter_path: String,
    /// Connect attempts per connect request.
    pub max_retries: u32,
    /// Keepalive poll interval for live sessions.
    pub keepalive_interval: Duration,
}

impl GatewayConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            adapter_path: DEFAULT_ADAPTER_PATH.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            keepalive_interval: tasks::KEEPALIVE_INTERVAL,
        }
    }

    /// Sets the adapter object path.
    #[must_use]
    pub fn adapter_path(mut self, path: impl Into<String>) -> Self {
        self.adapter_path = path.into();
        self
    }

    /// Sets the number of connect attempts.
    #[must_use]
    pub const fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets the keepalive poll interval.
    #[must_use]
    pub const fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Gateway between the mesh device and the rest of the system.
///
/// Holds the one session pointer. A session is created on the first connect
/// request and destroyed by [`Gateway::close`]; a later connect constructs
/// a fresh session from only the hardware address.
pub struct Gateway {
    config: GatewayConfig,
    bus: Arc<dyn Bus>,
    dispatcher: EventDispatcher,
    session: Option<Arc<BleTransport>>,
}

impl Gateway {
    /// Creates a gateway over the given bus with default configuration.
    #[must_use]
    pub fn new(bus: Arc<dyn Bus>) -> Self {
        Self::with_config(bus, GatewayConfig::new())
    }

    /// Creates a gateway with custom configuration.
    #[must_use]
    pub fn with_config(bus: Arc<dyn Bus>, config: GatewayConfig) -> Self {
        Self {
            config,
            bus,
            dispatcher: EventDispatcher::new(256),
            session: None,
        }
    }

    /// Subscribes to gateway events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        self.dispatcher.subscribe()
    }

    /// Current connection state, `Disconnected` without a session.
    pub async fn state(&self) -> ConnectionState {
        match &self.session {
            Some(session) => session.state().await,
            None => ConnectionState::Disconnected,
        }
    }

    /// Connects to a device by hardware address.
    ///
    /// Fails fast with [`Error::AlreadyConnected`] when a session is live
    /// rather than creating a second one. On connect failure the half-built
    /// session is discarded so the next request starts fresh.
    pub async fn connect(&mut self, address: &str) -> Result<()> {
        if self.session.is_some() {
            return Err(Error::AlreadyConnected);
        }

        let config = BleConfig::new(address)
            .adapter_path(self.config.adapter_path.clone())
            .max_retries(self.config.max_retries)
            .keepalive_interval(self.config.keepalive_interval);
        let session = BleTransport::new(Arc::clone(&self.bus), config, self.dispatcher.clone());

        match session.connect().await {
            Ok(()) => {
                self.session = Some(session);
                Ok(())
            }
            Err(e) => {
                let _ = session.close().await;
                Err(e)
            }
        }
    }

    /// Disconnects the link, keeping the session for a later reconnect.
    pub async fn disconnect(&self) -> Result<()> {
        self.session()?.disconnect().await
    }

    /// Destroys the session: disconnects, closes the bus session and nulls
    /// the pointer.
    pub async fn close(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            let _ = session.disconnect().await;
            session.close().await?;
        }
        Ok(())
    }

    /// Sends a text message to a group.
    pub async fn send_text(&self, message: &str, group: u32) -> Result<()> {
        self.session()?
            .send(protocol::text_message(group, message))
            .await
    }

    /// Sends pre-encoded command bytes.
    pub async fn send_raw_command(&self, frame: Bytes) -> Result<()> {
        self.session()?.send(frame).await
    }

    /// Sends an in-band text command (e.g. `--pos`).
    pub async fn send_command(&self, command: &str) -> Result<()> {
        self.session()?.send(protocol::raw_command(command)).await
    }

    /// Sets the device clock to the host's current time.
    pub async fn set_time_command(&self) -> Result<()> {
        self.session()?
            .send(protocol::set_time(tasks::now_unix()))
            .await
    }

    /// Feeds a GPS fix to the coalescing time-sync task.
    pub fn report_gps_fix(&self, lat: f64, lon: f64) -> Result<()> {
        self.session()?.trigger_time_sync(lat, lon);
        Ok(())
    }

    /// Scans for nearby devices.
    ///
    /// Runs discovery for the given duration and returns the addresses of
    /// the device objects the adapter exposes afterwards.
    pub async fn scan(&self, timeout: Duration) -> Result<Vec<String>> {
        self.bus.open().await?;
        self.bus
            .call_method(
                &self.config.adapter_path,
                ADAPTER_INTERFACE,
                "StartDiscovery",
                vec![],
                None,
            )
            .await?;
        tokio::time::sleep(timeout).await;
        if let Err(e) = self
            .bus
            .call_method(
                &self.config.adapter_path,
                ADAPTER_INTERFACE,
                "StopDiscovery",
                vec![],
                None,
            )
            .await
        {
            tracing::warn!("stop discovery failed (ignored): {e}");
        }

        let tree = self.bus.introspect(&self.config.adapter_path).await?;
        let devices: Vec<String> = tree
            .children
            .iter()
            .filter_map(|node| {
                node.path
                    .rsplit('/')
                    .next()
                    .and_then(|segment| segment.strip_prefix("dev_"))
                    .map(|raw| raw.replace('_', ":"))
            })
            .collect();

        tracing::info!("scan found {} devices", devices.len());
        self.dispatcher.dispatch(Event::ScanResult {
            devices: devices.clone(),
        });
        Ok(devices)
    }

    /// Pairs a device, forwarding the PIN to the stack.
    pub async fn pair(&self, address: &str, pin: &str) -> Result<()> {
        self.bus.open().await?;
        let path = device_path(&self.config.adapter_path, address);
        let result = self
            .bus
            .call_method(
                &path,
                DEVICE_INTERFACE,
                "Pair",
                vec![BusValue::Str(pin.to_string())],
                None,
            )
            .await;

        self.dispatcher.dispatch(Event::PairResult {
            address: address.to_string(),
            success: result.is_ok(),
        });
        result.map(|_| ())
    }

    /// Removes a device from the adapter.
    pub async fn unpair(&self, address: &str) -> Result<()> {
        self.bus.open().await?;
        let path = device_path(&self.config.adapter_path, address);
        let result = self
            .bus
            .call_method(
                &self.config.adapter_path,
                ADAPTER_INTERFACE,
                "RemoveDevice",
                vec![BusValue::Str(path)],
                None,
            )
            .await;

        self.dispatcher.dispatch(Event::UnpairResult {
            address: address.to_string(),
            success: result.is_ok(),
        });
        result.map(|_| ())
    }

    fn session(&self) -> Result<&Arc<BleTransport>> {
        self.session.as_ref().ok_or(Error::NotConnected)
    }
}
