//! Background tasks bound to the transport lifecycle.
//!
//! Two tasks run while a session is `Ready`:
//!
//! - a keepalive poller that verifies service discovery is still intact and
//!   otherwise funnels the link into the reconnect path, and
//! - a coalescing time-sync task driven by GPS fixes.
//!
//! Both hold only a weak back-reference to the transport; the transport owns
//! the task handles and awaits their cancellation before tearing down bus
//! resources.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

use crate::transport::{BleTransport, ConnectionState};

/// Default keepalive interval.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(300);

/// Single-slot trigger buffer for the time-sync task.
///
/// Each new GPS fix overwrites the slot and wakes the task; only the most
/// recently arrived coordinates are acted upon. Intermediate triggers are
/// silently superseded, which is the intended debounce.
#[derive(Default)]
pub struct TimeSyncSlot {
    slot: Mutex<Option<(f64, f64)>>,
    wake: Notify,
}

impl TimeSyncSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Stores a coordinate pair and wakes the task.
    pub fn trigger(&self, lat: f64, lon: f64) {
        *self.slot.lock().unwrap() = Some((lat, lon));
        self.wake.notify_one();
    }

    /// Waits for the next wake signal.
    pub(crate) async fn notified(&self) {
        self.wake.notified().await;
    }

    /// Re-arms the wake signal without touching the slot.
    pub(crate) fn renotify(&self) {
        self.wake.notify_one();
    }

    fn take(&self) -> Option<(f64, f64)> {
        self.slot.lock().unwrap().take()
    }
}

/// Gets the current Unix timestamp as a u32.
pub(crate) fn now_unix() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

/// Resolves the UTC offset in hours for a coordinate pair.
///
/// Uses the solar estimate of one hour per 15 degrees of longitude. The
/// (0, 0) pair is the firmware's "no fix" sentinel and falls back to the
/// host's local offset.
pub(crate) fn utc_offset_for(lat: f64, lon: f64) -> i32 {
    if lat == 0.0 && lon == 0.0 {
        chrono::Local::now().offset().local_minus_utc() / 3600
    } else {
        let hours = (lon / 15.0).round();
        (hours as i32).clamp(-12, 12)
    }
}

/// Keepalive poller.
///
/// Every interval tick, while the link is `Ready` and this task generation
/// is current: `ServicesResolved` still true sends a harmless position
/// query; anything else hands the link to the reconnect path and exits
/// (the reconnected link runs its own keepalive).
pub(crate) fn run_keepalive(
    transport: Weak<BleTransport>,
    interval: Duration,
    generation: u64,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    // Boxed as an explicitly-`Send` future so the `tokio::spawn` bound is
    // satisfied by declaration, breaking the `Send` auto-trait inference
    // cycle through `check_connection` -> `connect` ->
    // `start_background_tasks` -> `run_keepalive`.
    Box::pin(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // consume the immediate first tick

        loop {
            ticker.tick().await;
            let Some(transport) = transport.upgrade() else {
                return;
            };
            if transport.task_generation().await != generation
                || transport.state().await != ConnectionState::Ready
            {
                return;
            }

            match transport.services_resolved().await {
                Ok(true) => {
                    tracing::debug!("keepalive tick");
                    if let Err(e) = transport.send_keepalive_query().await {
                        tracing::warn!("keepalive query failed: {e}");
                    }
                }
                _ => {
                    tracing::warn!("services no longer resolved, entering reconnect path");
                    let _ = transport.check_connection().await;
                    return;
                }
            }
        }
    })
}

/// Coalescing time-sync task.
///
/// Waits on the slot's wake signal; a wake without data is reported and
/// skipped. With data, resolves the UTC offset for the coordinates and
/// sends the offset correction followed by the set-time command.
pub(crate) fn run_time_sync(
    transport: Weak<BleTransport>,
    slot: Arc<TimeSyncSlot>,
    generation: u64,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    // Boxed as an explicitly-`Send` future for the same reason as
    // `run_keepalive`: it reaches `check_connection` via `sync_device_time`.
    Box::pin(async move {
        loop {
            slot.notified().await;
            let Some(transport) = transport.upgrade() else {
                return;
            };
            if transport.task_generation().await != generation {
                // Hand the pending wake-up to the successor task.
                slot.renotify();
                return;
            }
            let Some((lat, lon)) = slot.take() else {
                tracing::debug!("time-sync woke without coordinates, skipping");
                continue;
            };
            if let Err(e) = transport.sync_device_time(lat, lon).await {
                tracing::warn!("time sync failed: {e}");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utc_offset_from_longitude() {
        assert_eq!(utc_offset_for(48.1, 11.5), 1);
        assert_eq!(utc_offset_for(40.7, -74.0), -5);
        assert_eq!(utc_offset_for(-33.9, 151.2), 10);
        // Clamped at the date-line extremes.
        assert_eq!(utc_offset_for(1.0, 179.9), 12);
        assert_eq!(utc_offset_for(1.0, -179.9), -12);
    }

    #[test]
    fn test_utc_offset_zero_fix_uses_local() {
        let local = chrono::Local::now().offset().local_minus_utc() / 3600;
        assert_eq!(utc_offset_for(0.0, 0.0), local);
    }

    #[test]
    fn test_slot_overwrites_and_single_wake() {
        let slot = TimeSyncSlot::new();
        slot.trigger(1.0, 2.0);
        slot.trigger(48.1, 11.5);
        // Latest coordinates win; the slot drains in one take.
        assert_eq!(slot.take(), Some((48.1, 11.5)));
        assert_eq!(slot.take(), None);
    }

    #[tokio::test]
    async fn test_slot_wake_signal() {
        let slot = Arc::new(TimeSyncSlot::new());
        slot.trigger(1.0, 1.0);
        // A stored permit completes immediately.
        tokio::time::timeout(Duration::from_millis(50), slot.notified())
            .await
            .expect("wake signal pending");
    }
}
