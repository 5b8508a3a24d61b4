//! # meshcom-ble
//!
//! A Rust BLE gateway library for `MeshCom` mesh-radio devices.
//!
//! This library speaks the binary wire protocol of `MeshCom` firmware over
//! a GATT notify/write characteristic pair and keeps that link alive under
//! real-world radio and Bluetooth flakiness.
//!
//! ## Features
//!
//! - Async/await based API using Tokio
//! - Typed decoding of text, position, ack and status frames
//! - Connection state machine with bounded retries and liveness recovery
//! - Event-driven architecture for decoded traffic and link status
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use meshcom_ble::{Gateway, bus::Bus};
//!
//! async fn run(bus: Arc<dyn Bus>) -> Result<(), meshcom_ble::Error> {
//!     let mut gateway = Gateway::new(bus);
//!     let mut events = gateway.subscribe();
//!
//!     gateway.connect("AA:BB:CC:DD:EE:FF").await?;
//!     gateway.send_text("Hello Mesh", 20).await?;
//!
//!     while let Some(event) = events.recv().await {
//!         println!("{event:?}");
//!     }
//!
//!     gateway.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`protocol`] - Pure byte-level frame codec (decode, encode, FCS)
//! - [`types`] - Decoded message structures
//! - [`bus`] - Abstracted bus contract over the platform Bluetooth stack
//! - [`gatt`] - GATT characteristic resolution
//! - [`transport`] - Connection state machine and notify handling
//! - [`tasks`] - Keepalive and coalescing time-sync background tasks
//! - [`event`] - Async event system for decoded traffic and link status
//! - [`gateway`] - High-level [`Gateway`] facade

pub mod bus;
pub mod error;
pub mod event;
pub mod gatt;
pub mod gateway;
pub mod protocol;
pub mod tasks;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use error::{DecodeError, Error, Result};
pub use event::{Event, EventDispatcher, Subscription};
pub use gateway::{Gateway, GatewayConfig};
pub use gatt::{GattEndpoint, NOTIFY_CHARACTERISTIC_UUID, WRITE_CHARACTERISTIC_UUID};
pub use transport::{BleConfig, BleTransport, ConnectionState};
pub use types::{AckType, DecodedMessage, DeviceStatus, MeshAck, MeshMessage};
