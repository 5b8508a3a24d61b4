//! BLE transport implementation over the abstracted bus.
//!
//! Owns the connection state machine described in the module docs: bounded
//! connect retries with cleanup between attempts, the service-discovery
//! wait, characteristic binding, the notify drain task, and the liveness
//! check that folds mid-session failures back into the same reconnect path
//! used at startup.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use crate::bus::{
    Bus, BusValue, DEFAULT_ADAPTER_PATH, DEVICE_INTERFACE, GATT_CHARACTERISTIC_INTERFACE,
    PropertyChange, device_path,
};
use crate::error::{DecodeError, Error, Result};
use crate::event::{Event, EventDispatcher};
use crate::gatt::{
    self, GattEndpoint, NOTIFY_CHARACTERISTIC_UUID, WRITE_CHARACTERISTIC_UUID,
};
use crate::protocol;
use crate::tasks::{self, KEEPALIVE_INTERVAL, TimeSyncSlot};
use crate::transport::ConnectionState;
use crate::types::DecodedMessage;

/// Default number of connect attempts.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Configuration for the BLE transport.
#[derive(Debug, Clone)]
pub struct BleConfig {
    /// Device hardware address (`AA:BB:CC:DD:EE:FF`).
    pub address: String,
    /// Adapter object path the device hangs off.
    pub adapter_path: String,
    /// Connect attempts before giving up.
    pub max_retries: u32,
    /// Timeout for the device connect call.
    pub connect_timeout: Duration,
    /// Total time to wait for service discovery.
    pub discovery_timeout: Duration,
    /// Poll interval while waiting for service discovery.
    pub discovery_poll: Duration,
    /// Delay between failed connect attempts.
    pub retry_delay: Duration,
    /// Timeout for a single characteristic write.
    pub write_timeout: Duration,
    /// Timeout for the best-effort device disconnect.
    pub disconnect_timeout: Duration,
    /// Settle delay before the bus session closes.
    pub settle_delay: Duration,
    /// Keepalive poll interval.
    pub keepalive_interval: Duration,
}

impl BleConfig {
    /// Creates a configuration with default timings for a device address.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            adapter_path: DEFAULT_ADAPTER_PATH.to_string(),
            max_retries: DEFAULT_MAX_RETRIES,
            connect_timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(10),
            discovery_poll: Duration::from_millis(500),
            retry_delay: Duration::from_secs(1),
            write_timeout: Duration::from_secs(5),
            disconnect_timeout: Duration::from_secs(3),
            settle_delay: Duration::from_secs(1),
            keepalive_interval: KEEPALIVE_INTERVAL,
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

    /// Sets the delay between failed connect attempts.
    #[must_use]
    pub const fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sets the settle delay used by `close`.
    #[must_use]
    pub const fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Sets the keepalive poll interval.
    #[must_use]
    pub const fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }
}

/// Mutable session state behind the link mutex.
struct Link {
    state: ConnectionState,
    endpoint: Option<GattEndpoint>,
    notifying: bool,
    notify_task: Option<JoinHandle<()>>,
    keepalive_task: Option<JoinHandle<()>>,
    time_sync_task: Option<JoinHandle<()>>,
    /// Bumped on every successful connect; background tasks of an older
    /// generation exit on their own.
    generation: u64,
}

/// One BLE device session.
///
/// The transport exclusively owns the resolved [`GattEndpoint`] and the bus
/// session for its lifetime. Background tasks hold only weak
/// back-references.
pub struct BleTransport {
    config: BleConfig,
    bus: Arc<dyn Bus>,
    dispatcher: EventDispatcher,
    device_path: String,
    link: Mutex<Link>,
    /// Only one connect sequence runs at a time.
    connect_gate: Mutex<()>,
    /// Writes are not pipelined; the characteristic exposes one
    /// outstanding operation.
    write_gate: Mutex<()>,
    time_sync: Arc<TimeSyncSlot>,
}

impl BleTransport {
    /// Creates a new transport for the configured device.
    #[must_use]
    pub fn new(bus: Arc<dyn Bus>, config: BleConfig, dispatcher: EventDispatcher) -> Arc<Self> {
        let path = device_path(&config.adapter_path, &config.address);
        Arc::new(Self {
            config,
            bus,
            dispatcher,
            device_path: path,
            link: Mutex::new(Link {
                state: ConnectionState::Disconnected,
                endpoint: None,
                notifying: false,
                notify_task: None,
                keepalive_task: None,
                time_sync_task: None,
                generation: 0,
            }),
            connect_gate: Mutex::new(()),
            write_gate: Mutex::new(()),
            time_sync: Arc::new(TimeSyncSlot::new()),
        })
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        self.link.lock().await.state
    }

    /// Device object path this session is bound to.
    #[must_use]
    pub fn device_path(&self) -> &str {
        &self.device_path
    }

    pub(crate) async fn task_generation(&self) -> u64 {
        self.link.lock().await.generation
    }

    /// Feeds a GPS fix into the time-sync slot.
    ///
    /// Overwrites any coordinates a previous fix left behind; the sync task
    /// acts on the latest pair only.
    pub fn trigger_time_sync(&self, lat: f64, lon: f64) {
        self.time_sync.trigger(lat, lon);
    }

    /// Connects to the device with bounded retries.
    ///
    /// No-op when already `Ready`. A second caller while a sequence is in
    /// flight observes [`Error::AlreadyConnecting`] without touching the
    /// bus. The final failed attempt publishes a single terminal
    /// [`Event::ConnectFailed`] and leaves the state `Failed`.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.state().await == ConnectionState::Ready {
            tracing::debug!("already connected");
            return Ok(());
        }
        let Ok(_gate) = self.connect_gate.try_lock() else {
            return Err(Error::AlreadyConnecting);
        };
        if self.state().await == ConnectionState::Ready {
            return Ok(());
        }

        let attempts = self.config.max_retries.max(1);
        let mut last_error: Option<Error> = None;

        for attempt in 1..=attempts {
            tracing::info!(
                "connect attempt {attempt}/{attempts} to {}",
                self.config.address
            );
            match self.try_connect().await {
                Ok(()) => {
                    self.set_state(ConnectionState::Ready).await;
                    self.start_background_tasks().await;
                    tracing::info!("connected to {}", self.config.address);
                    self.dispatcher.dispatch(Event::Connected);
                    return Ok(());
                }
                Err(e @ Error::NotPaired { .. }) => {
                    // Interface binding failure is terminal for the whole
                    // connect, not retried.
                    self.cleanup_failed_attempt().await;
                    self.set_state(ConnectionState::Failed).await;
                    self.dispatcher.dispatch(Event::ConnectFailed {
                        message: e.to_string(),
                    });
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!("connect attempt {attempt} failed: {e}");
                    self.cleanup_failed_attempt().await;
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                }
            }
        }

        let message = last_error.map_or_else(|| "unknown error".to_string(), |e| e.to_string());
        self.set_state(ConnectionState::Failed).await;
        self.dispatcher.dispatch(Event::ConnectFailed {
            message: message.clone(),
        });
        Err(Error::ConnectFailed { attempts, message })
    }

    /// Runs one connect attempt through the full state sequence.
    async fn try_connect(self: &Arc<Self>) -> Result<()> {
        self.set_state(ConnectionState::Connecting).await;
        self.bus.open().await?;

        // Binding the device object only fails for devices the stack has
        // never seen, i.e. an unpaired address.
        self.bus
            .introspect(&self.device_path)
            .await
            .map_err(|_| Error::NotPaired {
                address: self.config.address.clone(),
            })?;

        let connected = self
            .bus
            .get_property(&self.device_path, DEVICE_INTERFACE, "Connected")
            .await?
            .as_bool()
            .unwrap_or(false);
        if !connected {
            self.bus
                .call_method(
                    &self.device_path,
                    DEVICE_INTERFACE,
                    "Connect",
                    vec![],
                    Some(self.config.connect_timeout),
                )
                .await?;
        }

        self.set_state(ConnectionState::AwaitingServiceDiscovery).await;
        self.wait_services_resolved().await?;

        self.set_state(ConnectionState::ResolvingCharacteristics).await;
        let notify_path = gatt::resolve_characteristic(
            self.bus.as_ref(),
            &self.device_path,
            NOTIFY_CHARACTERISTIC_UUID,
        )
        .await?
        .ok_or_else(|| Error::CharacteristicNotFound {
            uuid: NOTIFY_CHARACTERISTIC_UUID.to_string(),
        })?;
        let write_path = gatt::resolve_characteristic(
            self.bus.as_ref(),
            &self.device_path,
            WRITE_CHARACTERISTIC_UUID,
        )
        .await?
        .ok_or_else(|| Error::CharacteristicNotFound {
            uuid: WRITE_CHARACTERISTIC_UUID.to_string(),
        })?;

        {
            let mut link = self.link.lock().await;
            link.endpoint = Some(GattEndpoint {
                notify_path,
                write_path,
            });
        }
        self.start_notify().await?;
        Ok(())
    }

    /// Polls `ServicesResolved` until set or the discovery timeout elapses.
    async fn wait_services_resolved(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.discovery_timeout;
        loop {
            if self.services_resolved().await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Timeout {
                    timeout_ms: self.config.discovery_timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(self.config.discovery_poll).await;
        }
    }

    pub(crate) async fn services_resolved(&self) -> Result<bool> {
        Ok(self
            .bus
            .get_property(&self.device_path, DEVICE_INTERFACE, "ServicesResolved")
            .await?
            .as_bool()
            .unwrap_or(false))
    }

    /// Subscribes to notifications from the read characteristic.
    ///
    /// Idempotent: returns immediately when already notifying.
    pub async fn start_notify(self: &Arc<Self>) -> Result<()> {
        let mut link = self.link.lock().await;
        if link.notifying {
            return Ok(());
        }
        let endpoint = link.endpoint.clone().ok_or(Error::NotConnected)?;

        let rx = self.bus.subscribe_property_changes(&self.device_path).await?;
        self.bus
            .call_method(
                &endpoint.notify_path,
                GATT_CHARACTERISTIC_INTERFACE,
                "StartNotify",
                vec![],
                None,
            )
            .await?;

        let confirmed = self
            .bus
            .get_property(
                &endpoint.notify_path,
                GATT_CHARACTERISTIC_INTERFACE,
                "Notifying",
            )
            .await?
            .as_bool()
            .unwrap_or(false);
        if !confirmed {
            tracing::warn!("device did not confirm the notify subscription");
        }

        let bus = Arc::clone(&self.bus);
        let dispatcher = self.dispatcher.clone();
        let path = self.device_path.clone();
        link.notify_task = Some(tokio::spawn(run_notify_loop(bus, dispatcher, path, rx)));
        link.notifying = true;
        tracing::info!("notify subscription live on {}", endpoint.notify_path);
        Ok(())
    }

    /// Writes a frame to the write characteristic.
    ///
    /// Runs the liveness check first; writes are serialized and bounded by
    /// the write timeout. Failures are published as [`Event::WriteFailed`]
    /// and not retried here.
    pub async fn send(self: &Arc<Self>, frame: Bytes) -> Result<()> {
        self.check_connection().await?;

        let _write = self.write_gate.lock().await;
        let endpoint = {
            let link = self.link.lock().await;
            link.endpoint.clone().ok_or(Error::NotConnected)?
        };

        tracing::debug!("writing {} bytes to {}", frame.len(), endpoint.write_path);
        let call = self.bus.call_method(
            &endpoint.write_path,
            GATT_CHARACTERISTIC_INTERFACE,
            "WriteValue",
            vec![BusValue::Bytes(frame.to_vec())],
            Some(self.config.write_timeout),
        );
        let result = match tokio::time::timeout(self.config.write_timeout, call).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout {
                timeout_ms: self.config.write_timeout.as_millis() as u64,
            }),
        };

        if let Err(e) = &result {
            tracing::warn!("write failed: {e}");
            self.dispatcher.dispatch(Event::WriteFailed {
                message: e.to_string(),
            });
        }
        result
    }

    pub(crate) async fn send_keepalive_query(self: &Arc<Self>) -> Result<()> {
        self.send(protocol::raw_command("--pos")).await
    }

    /// Sends the offset correction and set-time commands for a GPS fix.
    pub(crate) async fn sync_device_time(self: &Arc<Self>, lat: f64, lon: f64) -> Result<()> {
        let offset_hours = tasks::utc_offset_for(lat, lon);
        tracing::info!("syncing device time, offset {offset_hours}h");
        self.send(protocol::utc_offset(offset_hours)).await?;
        self.send(protocol::set_time(tasks::now_unix())).await?;
        self.dispatcher.dispatch(Event::TimeSynced { offset_hours });
        Ok(())
    }

    /// Liveness check run before privileged operations.
    ///
    /// Reads the live `Connected` property; when it has dropped, tears the
    /// session down and immediately re-enters the same retry path used at
    /// startup.
    pub(crate) async fn check_connection(self: &Arc<Self>) -> Result<()> {
        {
            let link = self.link.lock().await;
            if link.state != ConnectionState::Ready || link.endpoint.is_none() {
                return Err(Error::NotConnected);
            }
        }
        let connected = self
            .bus
            .get_property(&self.device_path, DEVICE_INTERFACE, "Connected")
            .await
            .ok()
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if connected {
            return Ok(());
        }

        tracing::warn!("link to {} lost, reconnecting", self.config.address);
        self.stop_background_tasks().await;
        self.stop_notify().await;
        self.best_effort_disconnect().await;
        let _ = self.bus.close().await;
        {
            let mut link = self.link.lock().await;
            link.endpoint = None;
            link.state = ConnectionState::Disconnected;
        }
        self.connect().await
    }

    /// Orderly disconnect: stops background tasks, unsubscribes, issues the
    /// best-effort device disconnect and publishes the result.
    pub async fn disconnect(self: &Arc<Self>) -> Result<()> {
        self.set_state(ConnectionState::Disconnecting).await;
        self.stop_background_tasks().await;
        self.stop_notify().await;
        self.best_effort_disconnect().await;

        {
            let mut link = self.link.lock().await;
            link.endpoint = None;
            link.state = ConnectionState::Disconnected;
        }
        self.dispatcher.dispatch(Event::Disconnected);
        Ok(())
    }

    /// Closes the bus session and clears all handles.
    pub async fn close(self: &Arc<Self>) -> Result<()> {
        self.stop_background_tasks().await;
        // Let in-flight bus work settle before the session goes away.
        tokio::time::sleep(self.config.settle_delay).await;
        let _ = self.bus.close().await;

        let mut link = self.link.lock().await;
        if let Some(task) = link.notify_task.take() {
            task.abort();
        }
        link.endpoint = None;
        link.notifying = false;
        link.state = ConnectionState::Disconnected;
        tracing::debug!("session closed");
        Ok(())
    }

    async fn set_state(&self, state: ConnectionState) {
        let mut link = self.link.lock().await;
        if link.state != state {
            tracing::debug!("state {:?} -> {:?}", link.state, state);
            link.state = state;
        }
    }

    /// Best-effort disconnect of a partially or fully connected attempt,
    /// dropping all handles. Keeps the session reusable for the next try.
    async fn cleanup_failed_attempt(self: &Arc<Self>) {
        tracing::debug!("cleaning up failed connect attempt");
        self.stop_background_tasks().await;
        self.stop_notify().await;
        self.best_effort_disconnect().await;

        let mut link = self.link.lock().await;
        link.endpoint = None;
        link.state = ConnectionState::Disconnected;
    }

    async fn best_effort_disconnect(&self) {
        let call = self.bus.call_method(
            &self.device_path,
            DEVICE_INTERFACE,
            "Disconnect",
            vec![],
            Some(self.config.disconnect_timeout),
        );
        match tokio::time::timeout(self.config.disconnect_timeout, call).await {
            Ok(Ok(_)) => tracing::debug!("device disconnected"),
            Ok(Err(e)) => tracing::warn!("disconnect failed (ignored): {e}"),
            Err(_) => tracing::warn!("disconnect timed out (ignored)"),
        }
    }

    /// Stops the notify drain task and unsubscribes.
    ///
    /// The absence of an active notify session is tolerated, not an error.
    async fn stop_notify(&self) {
        let (task, endpoint, was_notifying) = {
            let mut link = self.link.lock().await;
            (
                link.notify_task.take(),
                link.endpoint.clone(),
                std::mem::take(&mut link.notifying),
            )
        };
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        if was_notifying {
            if let Err(e) = self.bus.unsubscribe(&self.device_path).await {
                tracing::debug!("unsubscribe failed (ignored): {e}");
            }
            if let Some(endpoint) = endpoint {
                if let Err(e) = self
                    .bus
                    .call_method(
                        &endpoint.notify_path,
                        GATT_CHARACTERISTIC_INTERFACE,
                        "StopNotify",
                        vec![],
                        None,
                    )
                    .await
                {
                    tracing::debug!("stop notify failed (ignored): {e}");
                }
            }
        }
    }

    async fn start_background_tasks(self: &Arc<Self>) {
        let mut link = self.link.lock().await;
        link.generation += 1;
        let generation = link.generation;
        let weak = Arc::downgrade(self);
        link.keepalive_task = Some(tokio::spawn(tasks::run_keepalive(
            weak.clone(),
            self.config.keepalive_interval,
            generation,
        )));
        link.time_sync_task = Some(tokio::spawn(tasks::run_time_sync(
            weak,
            Arc::clone(&self.time_sync),
            generation,
        )));
    }

    /// Cancels both background tasks and awaits their termination, so no
    /// cancelled-but-still-running tick can touch a freed bus handle.
    async fn stop_background_tasks(&self) {
        let (keepalive, time_sync) = {
            let mut link = self.link.lock().await;
            (link.keepalive_task.take(), link.time_sync_task.take())
        };
        if let Some(task) = time_sync {
            stop_task(task).await;
        }
        if let Some(task) = keepalive {
            stop_task(task).await;
        }
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        if let Ok(mut link) = self.link.try_lock() {
            let tasks = [
                link.notify_task.take(),
                link.keepalive_task.take(),
                link.time_sync_task.take(),
            ];
            for task in tasks.into_iter().flatten() {
                task.abort();
            }
        }
    }
}

/// Aborts a background task and awaits it.
///
/// A task that reaches here while stopping itself (the keepalive tick that
/// detected liveness loss) is left running: it exits on its own once its
/// generation is stale, and aborting it would kill the recovery mid-flight.
async fn stop_task(handle: JoinHandle<()>) {
    if tokio::task::try_id() == Some(handle.id()) {
        return;
    }
    handle.abort();
    let _ = handle.await;
}

/// Drains property changes from the notify subscription.
///
/// Filters to the GATT characteristic interface, decodes `Value` changes
/// and publishes the result. The live `Connected` property is re-read per
/// frame for observability only; failure handling stays with the keepalive
/// path.
async fn run_notify_loop(
    bus: Arc<dyn Bus>,
    dispatcher: EventDispatcher,
    device_path: String,
    mut rx: mpsc::Receiver<PropertyChange>,
) {
    while let Some(change) = rx.recv().await {
        if change.interface != GATT_CHARACTERISTIC_INTERFACE {
            continue;
        }
        let Some(BusValue::Bytes(data)) = change.changed.get("Value") else {
            continue;
        };
        tracing::trace!("notify frame: {}", hex::encode(data));

        match protocol::decode(data) {
            Ok(message) => dispatcher.dispatch(Event::Frame(message)),
            Err(e @ DecodeError::UnknownFormat { .. }) => {
                tracing::warn!("unrecognized frame: {e}");
                dispatcher.dispatch(Event::Frame(DecodedMessage::Unrecognized {
                    data: data.clone(),
                }));
            }
            Err(e) => {
                tracing::warn!("dropping frame: {e}");
            }
        }

        if let Ok(value) = bus
            .get_property(&device_path, DEVICE_INTERFACE, "Connected")
            .await
        {
            tracing::trace!("device connected: {:?}", value.as_bool());
        }
    }
    tracing::debug!("notify channel closed");
}
