//! GATT endpoint resolution.
//!
//! After service discovery the device exposes its GATT tree as bus objects
//! under the device path. The resolver walks that tree looking for the
//! characteristic objects the MeshCom firmware serves its UART link on.

use crate::bus::{Bus, GATT_CHARACTERISTIC_INTERFACE};
use crate::error::Result;

/// UART service UUID served by MeshCom firmware.
pub const UART_SERVICE_UUID: &str = "6e400001-b5a3-f393-e0a9-e50e24dcca9e";

/// Write characteristic UUID (host → device).
pub const WRITE_CHARACTERISTIC_UUID: &str = "6e400002-b5a3-f393-e0a9-e50e24dcca9e";

/// Notify characteristic UUID (device → host).
pub const NOTIFY_CHARACTERISTIC_UUID: &str = "6e400003-b5a3-f393-e0a9-e50e24dcca9e";

/// The characteristic pair a live session is bound to.
///
/// Resolved once per connection and invalidated on disconnect.
#[derive(Debug, Clone)]
pub struct GattEndpoint {
    /// Object path of the notify characteristic.
    pub notify_path: String,
    /// Object path of the write characteristic.
    pub write_path: String,
}

/// Finds the first characteristic under `device_path` with the given UUID.
///
/// Walks the introspected object tree depth-first. A node without the
/// characteristic interface (the UUID property read fails) is skipped, not
/// an error; only exhausting the whole tree yields `None`.
///
/// # Errors
///
/// Returns an error if the device object itself cannot be introspected.
pub async fn resolve_characteristic(
    bus: &dyn Bus,
    device_path: &str,
    uuid: &str,
) -> Result<Option<String>> {
    let root = bus.introspect(device_path).await?;

    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        match bus
            .get_property(&node.path, GATT_CHARACTERISTIC_INTERFACE, "UUID")
            .await
        {
            Ok(value) => {
                if value
                    .as_str()
                    .is_some_and(|u| u.eq_ignore_ascii_case(uuid))
                {
                    tracing::debug!("resolved characteristic {} at {}", uuid, node.path);
                    return Ok(Some(node.path));
                }
            }
            Err(_) => {
                // Not a characteristic object; descend anyway.
            }
        }
        // Reverse keeps first-child-first order on the stack.
        stack.extend(node.children.into_iter().rev());
    }

    Ok(None)
}
