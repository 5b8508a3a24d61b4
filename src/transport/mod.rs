//! Transport layer for the BLE mesh link.
//!
//! One [`BleTransport`] owns one device session: connect with bounded
//! retries, service-discovery wait, characteristic binding, notify
//! subscription, and disconnect/cleanup. Exactly one session is live per
//! process; the gateway facade is the only component that creates or
//! destroys it.

pub mod ble;

pub use ble::{BleConfig, BleTransport, DEFAULT_MAX_RETRIES};

/// Connection lifecycle of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link; the initial and final state.
    Disconnected,
    /// Opening the bus session and binding the device object.
    Connecting,
    /// Waiting for the BLE stack to finish service discovery.
    AwaitingServiceDiscovery,
    /// Walking the GATT tree for the notify/write characteristic pair.
    ResolvingCharacteristics,
    /// Link established, notify subscription live.
    Ready,
    /// Orderly teardown in progress.
    Disconnecting,
    /// All connect attempts exhausted.
    Failed,
}

impl ConnectionState {
    /// Returns true while a connect sequence is in flight.
    #[must_use]
    pub const fn is_attempting(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::AwaitingServiceDiscovery | Self::ResolvingCharacteristics
        )
    }
}
