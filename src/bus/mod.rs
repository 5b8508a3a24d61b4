//! Abstracted bus contract standing in for the platform Bluetooth stack.
//!
//! The transport layer never talks to a concrete Bluetooth daemon; it goes
//! through the [`Bus`] trait, which models the handful of operations the
//! stack exposes: object-tree introspection, property access, method calls
//! and property-change subscriptions. Property changes are delivered over a
//! channel rather than a callback, so no shared mutable state is touched
//! outside the receiving task.

#[cfg(test)]
pub(crate) mod mock;

use std::collections::HashMap;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::error::Result;

/// Adapter object interface.
pub const ADAPTER_INTERFACE: &str = "org.bluez.Adapter1";

/// Device object interface.
pub const DEVICE_INTERFACE: &str = "org.bluez.Device1";

/// GATT characteristic object interface.
pub const GATT_CHARACTERISTIC_INTERFACE: &str = "org.bluez.GattCharacteristic1";

/// Default adapter object path.
pub const DEFAULT_ADAPTER_PATH: &str = "/org/bluez/hci0";

/// Derives the device object path for a hardware address.
///
/// The address colons are replaced by underscores, e.g.
/// `AA:BB:CC:DD:EE:FF` under `/org/bluez/hci0` becomes
/// `/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF`.
#[must_use]
pub fn device_path(adapter: &str, address: &str) -> String {
    format!("{adapter}/dev_{}", address.replace(':', "_"))
}

/// A value carried over the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum BusValue {
    /// No value (void method return).
    Unit,
    /// Boolean property.
    Bool(bool),
    /// Unsigned integer.
    U32(u32),
    /// String property.
    Str(String),
    /// Raw byte payload.
    Bytes(Vec<u8>),
    /// List of values.
    List(Vec<BusValue>),
}

impl BusValue {
    /// Returns the boolean value, if this is a `Bool`.
    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the string value, if this is a `Str`.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the byte payload, if this is `Bytes`.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

/// One node of the bus object tree returned by introspection.
#[derive(Debug, Clone, Default)]
pub struct BusNode {
    /// Full object path of this node.
    pub path: String,
    /// Child nodes.
    pub children: Vec<BusNode>,
}

/// A property-change notification delivered by the bus.
#[derive(Debug, Clone)]
pub struct PropertyChange {
    /// Object path the change occurred on.
    pub path: String,
    /// Interface the changed properties belong to.
    pub interface: String,
    /// Changed property values.
    pub changed: HashMap<String, BusValue>,
}

/// Trait for bus implementations.
///
/// All operations are asynchronous bus round-trips; every call is a
/// suspension point for the calling task.
pub trait Bus: Send + Sync {
    /// Opens the bus session if it is not already open. Idempotent.
    fn open(&self) -> BoxFuture<'_, Result<()>>;

    /// Introspects the object tree rooted at `path`.
    fn introspect<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<BusNode>>;

    /// Reads a property.
    fn get_property<'a>(
        &'a self,
        path: &'a str,
        interface: &'a str,
        name: &'a str,
    ) -> BoxFuture<'a, Result<BusValue>>;

    /// Writes a property.
    fn set_property<'a>(
        &'a self,
        path: &'a str,
        interface: &'a str,
        name: &'a str,
        value: BusValue,
    ) -> BoxFuture<'a, Result<()>>;

    /// Calls a method on an object, optionally bounded by a timeout.
    fn call_method<'a>(
        &'a self,
        path: &'a str,
        interface: &'a str,
        method: &'a str,
        args: Vec<BusValue>,
        timeout: Option<Duration>,
    ) -> BoxFuture<'a, Result<BusValue>>;

    /// Subscribes to property changes under `path`.
    ///
    /// Changes arrive on the returned channel until [`Bus::unsubscribe`]
    /// is called or the session closes.
    fn subscribe_property_changes<'a>(
        &'a self,
        path: &'a str,
    ) -> BoxFuture<'a, Result<mpsc::Receiver<PropertyChange>>>;

    /// Removes the property-change subscription for `path`.
    fn unsubscribe<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Closes the bus session.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_path_derivation() {
        assert_eq!(
            device_path(DEFAULT_ADAPTER_PATH, "AA:BB:CC:DD:EE:FF"),
            "/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF"
        );
    }

    #[test]
    fn test_bus_value_accessors() {
        assert_eq!(BusValue::Bool(true).as_bool(), Some(true));
        assert_eq!(BusValue::Str("x".into()).as_str(), Some("x"));
        assert_eq!(BusValue::Bytes(vec![1]).as_bytes(), Some(&[1u8][..]));
        assert_eq!(BusValue::Unit.as_bool(), None);
    }
}
