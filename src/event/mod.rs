//! Event system for link status and decoded traffic.
//!
//! The transport publishes every decoded notify frame and every status
//! change here; the rest of the gateway (UDP forwarder, WebSocket fan-out)
//! subscribes and never touches the link directly.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::types::DecodedMessage;

/// Events published on the gateway message bus.
#[derive(Debug, Clone)]
pub enum Event {
    /// BLE link established and notify subscription live.
    Connected,
    /// BLE link closed.
    Disconnected,
    /// All connect attempts exhausted. Published once per connect request,
    /// not once per attempt.
    ConnectFailed {
        /// Human-readable failure reason.
        message: String,
    },
    /// A decoded notify frame.
    Frame(DecodedMessage),
    /// An outgoing write failed; the caller decides whether to resend.
    WriteFailed {
        /// Human-readable failure reason.
        message: String,
    },
    /// Scan finished with the discovered device addresses.
    ScanResult {
        /// Addresses of discovered devices.
        devices: Vec<String>,
    },
    /// Pairing finished.
    PairResult {
        /// Device address.
        address: String,
        /// Whether pairing succeeded.
        success: bool,
    },
    /// Unpairing finished.
    UnpairResult {
        /// Device address.
        address: String,
        /// Whether unpairing succeeded.
        success: bool,
    },
    /// Device clock and UTC offset were synchronized.
    TimeSynced {
        /// Offset sent to the device, in hours.
        offset_hours: i32,
    },
}

/// A subscription to gateway events.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
}

impl Subscription {
    /// Receives the next event.
    ///
    /// Returns `None` once the dispatcher is gone. A lagged receiver skips
    /// ahead instead of failing.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

struct EventDispatcherInner {
    sender: broadcast::Sender<Event>,
}

/// Dispatches events to subscribers.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<EventDispatcherInner>,
}

impl EventDispatcher {
    /// Creates a new event dispatcher with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(EventDispatcherInner { sender }),
        }
    }

    /// Dispatches an event to all subscribers.
    ///
    /// Having no subscribers is fine; the event is dropped.
    pub fn dispatch(&self, event: Event) {
        let _ = self.inner.sender.send(event);
    }

    /// Subscribes to events.
    #[must_use]
    pub fn subscribe(&self) -> Subscription {
        Subscription {
            receiver: self.inner.sender.subscribe(),
        }
    }
}
