//! Command encoding for writes to the MeshCom write characteristic.
//!
//! Outgoing writes are length-prefixed:
//!
//! ```text
//! [total_length:1] [command_byte:1] [payload...]           text / raw
//! [total_length:1] [command_byte:1] [payload...] [0x4B]    settings
//! ```
//!
//! `total_length` counts the whole frame: payload + 2 for text commands,
//! payload + 3 for settings writes with their trailing terminator.

use bytes::{BufMut, Bytes, BytesMut};

/// Command byte for text and raw in-band commands.
pub const CMD_TEXT: u8 = 0xA0;

/// Command byte for the set-time settings write.
pub const CMD_SET_TIME: u8 = 0x20;

/// Terminator byte closing every settings write.
pub const SETTINGS_TERMINATOR: u8 = 0x4B;

/// Encodes a raw in-band command (e.g. `--pos`).
#[must_use]
pub fn raw_command(command: &str) -> Bytes {
    encode_text_payload(command.as_bytes())
}

/// Encodes a text message addressed to a group.
///
/// The payload is prefixed with `"{<group>}"` before the length is measured.
#[must_use]
pub fn text_message(group: u32, text: &str) -> Bytes {
    let payload = format!("{{{group}}}{text}");
    encode_text_payload(payload.as_bytes())
}

/// Encodes a set-time settings write carrying a UNIX timestamp.
#[must_use]
pub fn set_time(unix_secs: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(7);
    buf.put_u8(4 + 3); // timestamp payload + prefix, command and terminator
    buf.put_u8(CMD_SET_TIME);
    buf.put_u32_le(unix_secs);
    buf.put_u8(SETTINGS_TERMINATOR);
    buf.freeze()
}

/// Encodes the UTC offset correction sent ahead of a set-time write.
#[must_use]
pub fn utc_offset(hours: i32) -> Bytes {
    raw_command(&format!("--utcoff {hours}"))
}

fn encode_text_payload(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 2);
    buf.put_u8((payload.len() + 2) as u8);
    buf.put_u8(CMD_TEXT);
    buf.put_slice(payload);
    buf.freeze()
}
