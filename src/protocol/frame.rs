//! Frame decoding for the MeshCom notify characteristic.
//!
//! Frames are dispatched by their leading bytes:
//!
//! ```text
//! D{ ...json... 00            device status (JSON body, opaque)
//! @  A  <header> <ack>        acknowledgment
//! @  :  <header> <body>       text message (payload type 58)
//! @  !  <header> <body>       position report (payload type 33)
//! ```
//!
//! Text/position frames carry a fixed trailer before the terminating NUL:
//!
//! ```text
//! [zero:1] [hw_id:1] [lora_mod:1] [fcs:2LE] [firmware:1] [last_hw:1]
//! [fw_sub:1] [ending:1] [node_timestamp_ms:4LE]
//! ```
//!
//! All decoding is pure: no I/O, no state. A checksum mismatch is recorded
//! in the decoded message, never rejected.

use crate::error::DecodeError;
use crate::types::{
    AckType, DecodedMessage, DeviceStatus, MeshAck, MeshMessage, PAYLOAD_TYPE_POSITION,
    PAYLOAD_TYPE_TEXT,
};

/// Frame marker for mesh traffic.
pub const FRAME_MARKER: u8 = b'@';

/// Leading byte of JSON status frames.
pub const STATUS_MARKER: u8 = b'D';

/// Fixed trailer length of text/position frames (excluding the NUL).
const TRAILER_LEN: usize = 13;

/// Minimum text/position frame: marker + 6-byte header + trailer + NUL.
const MIN_MESH_FRAME: usize = 7 + TRAILER_LEN + 1;

/// Minimum ack frame: marker + payload type + msg id + flags.
const MIN_ACK_FRAME: usize = 7;

/// Computes the frame check sequence over a byte span.
///
/// The FCS is the plain sum of all byte values truncated to 16 bits, then
/// byte-swapped: `((sum & 0xFF00) >> 8) | ((sum & 0x00FF) << 8)`.
#[must_use]
pub fn compute_fcs(bytes: &[u8]) -> u16 {
    let sum: u32 = bytes.iter().map(|&b| u32::from(b)).sum();
    (sum as u16).swap_bytes()
}

/// Decodes a notify frame into a typed message.
///
/// # Errors
///
/// Returns a [`DecodeError`] for unknown markers, malformed JSON status
/// bodies, or frames shorter than their fixed layout. All decode errors are
/// non-fatal: the caller logs and drops (or republishes) the frame.
pub fn decode(frame: &[u8]) -> Result<DecodedMessage, DecodeError> {
    if frame.starts_with(b"D{") {
        return decode_status(frame);
    }
    if frame.first() == Some(&FRAME_MARKER) {
        return match frame.get(1) {
            Some(&b'A') => decode_ack(frame),
            Some(&b':') | Some(&b'!') => decode_mesh(frame),
            _ => Err(unknown_format(frame)),
        };
    }
    Err(unknown_format(frame))
}

fn unknown_format(frame: &[u8]) -> DecodeError {
    let leading = hex::encode(&frame[..frame.len().min(4)]);
    DecodeError::UnknownFormat { leading }
}

/// Decodes a `D{` JSON status frame.
///
/// The leading `D` is dropped and trailing NUL padding stripped; the
/// remainder must be a JSON object.
fn decode_status(frame: &[u8]) -> Result<DecodedMessage, DecodeError> {
    let trimmed = trim_trailing_nuls(&frame[1..]);
    let text = std::str::from_utf8(trimmed).map_err(|e| DecodeError::MalformedStatus {
        reason: format!("invalid UTF-8: {e}"),
    })?;

    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(serde_json::Value::Object(fields)) => {
            Ok(DecodedMessage::DeviceStatus(DeviceStatus { fields }))
        }
        Ok(_) => Err(DecodeError::MalformedStatus {
            reason: "status body is not a JSON object".into(),
        }),
        Err(e) => Err(DecodeError::MalformedStatus {
            reason: e.to_string(),
        }),
    }
}

/// Decodes an `@A` acknowledgment frame.
///
/// Structured layout (frames of 12 bytes and more):
///
/// ```text
/// [@] [payload_type:1] [msg_id:4LE] [flags:1] [ack_id:4LE] [ack_type:1] [00]
/// ```
///
/// Shorter legacy frames carry only the header; their `ack_id` is read from
/// the last five bytes minus the trailing NUL.
fn decode_ack(frame: &[u8]) -> Result<DecodedMessage, DecodeError> {
    if frame.len() < MIN_ACK_FRAME {
        return Err(DecodeError::Truncated {
            expected: MIN_ACK_FRAME,
            got: frame.len(),
        });
    }

    let payload_type = frame[1];
    let msg_id = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]);
    let flags = frame[6];
    let server_flag = flags & 0x80 != 0;
    let hop_count = flags & 0x7F;

    let mut ack = MeshAck {
        payload_type,
        msg_id,
        server_flag,
        hop_count,
        ack_id: 0,
        ack_type: None,
        gateway_id: None,
        ack_id_part: None,
    };

    if frame.len() >= 12 {
        ack.ack_id = u32::from_le_bytes([frame[7], frame[8], frame[9], frame[10]]);
        let ack_type = AckType::from_byte(frame[11]);
        if ack_type == AckType::Gateway {
            ack.gateway_id = Some((msg_id >> 10) & 0x3F_FFFF);
            ack.ack_id_part = Some(msg_id & 0x3FF);
        }
        ack.ack_type = Some(ack_type);
    } else {
        // Legacy firmware: ack id sits in the last 5 bytes minus the NUL.
        let tail = &frame[frame.len() - 5..frame.len() - 1];
        ack.ack_id = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    }

    Ok(DecodedMessage::Ack(ack))
}

/// Decodes an `@:` text or `@!` position frame.
fn decode_mesh(frame: &[u8]) -> Result<DecodedMessage, DecodeError> {
    if frame.len() < MIN_MESH_FRAME {
        return Err(DecodeError::Truncated {
            expected: MIN_MESH_FRAME,
            got: frame.len(),
        });
    }

    let payload_type = frame[1];
    let msg_id = u32::from_le_bytes([frame[2], frame[3], frame[4], frame[5]]);
    let max_hop_raw = frame[6];
    let max_hop = max_hop_raw & 0x0F;
    let mesh_info = max_hop_raw >> 4;

    // The trailer sits before the terminating NUL; tolerate a missing NUL.
    let end = if frame.last() == Some(&0) {
        frame.len() - 1
    } else {
        frame.len()
    };
    let trailer_start = end - TRAILER_LEN;
    let trailer = &frame[trailer_start..end];

    let hardware_id = trailer[1];
    let lora_mod = trailer[2];
    let fcs = u16::from_le_bytes([trailer[3], trailer[4]]);
    let firmware = trailer[5];
    let last_hw = trailer[6];
    let fw_sub = trailer[7] as char;
    let node_timestamp_ms = u32::from_le_bytes([trailer[9], trailer[10], trailer[11], trailer[12]]);

    let last_hw_id = last_hw & 0x7F;
    let last_sending = last_hw & 0x80 != 0;

    // FCS covers byte 1 up to (not including) the FCS field itself.
    let checksum_ok = compute_fcs(&frame[1..trailer_start + 3]) == fcs;

    let body = trim_trailing_nuls(&frame[7..trailer_start]);
    let (path, rest) = split_path(body);

    // The destination terminator depends on the payload type: text frames
    // end it at the first ':', position reports include the first '*'.
    let (destination, message) = match payload_type {
        PAYLOAD_TYPE_TEXT => split_at_byte(rest, b':', false),
        PAYLOAD_TYPE_POSITION => split_at_byte(rest, b'*', true),
        _ => (rest, &[][..]),
    };

    let message = MeshMessage {
        payload_type,
        msg_id,
        max_hop,
        mesh_info,
        path: String::from_utf8_lossy(path).into_owned(),
        destination: String::from_utf8_lossy(destination).into_owned(),
        message: String::from_utf8_lossy(take_until_nul(message)).into_owned(),
        hardware_id,
        lora_mod,
        firmware,
        fw_sub,
        last_hw_id,
        last_sending,
        node_timestamp_ms,
        checksum_ok,
    };

    Ok(if payload_type == PAYLOAD_TYPE_POSITION {
        DecodedMessage::Position(message)
    } else {
        DecodedMessage::Text(message)
    })
}

/// Splits the body at the first `>` into path (inclusive) and remainder.
fn split_path(body: &[u8]) -> (&[u8], &[u8]) {
    match body.iter().position(|&b| b == b'>') {
        Some(idx) => (&body[..=idx], &body[idx + 1..]),
        None => (&[][..], body),
    }
}

/// Splits at the first occurrence of `sep`.
///
/// With `inclusive` the separator stays on the left side; otherwise it is
/// dropped. Missing separator leaves everything on the left.
fn split_at_byte(data: &[u8], sep: u8, inclusive: bool) -> (&[u8], &[u8]) {
    match data.iter().position(|&b| b == sep) {
        Some(idx) if inclusive => (&data[..=idx], &data[idx + 1..]),
        Some(idx) => (&data[..idx], &data[idx + 1..]),
        None => (data, &[][..]),
    }
}

fn take_until_nul(data: &[u8]) -> &[u8] {
    match data.iter().position(|&b| b == 0) {
        Some(idx) => &data[..idx],
        None => data,
    }
}

fn trim_trailing_nuls(data: &[u8]) -> &[u8] {
    let mut end = data.len();
    while end > 0 && data[end - 1] == 0 {
        end -= 1;
    }
    &data[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a text/position frame with a valid FCS and trailing NUL.
    fn build_mesh_frame(payload_type: u8, msg_id: u32, hop_byte: u8, body: &[u8]) -> Vec<u8> {
        let mut frame = vec![FRAME_MARKER, payload_type];
        frame.extend_from_slice(&msg_id.to_le_bytes());
        frame.push(hop_byte);
        frame.extend_from_slice(body);

        // Trailer: zero, hw_id, lora_mod, fcs (patched below), firmware,
        // last_hw, fw_sub, ending, timestamp.
        let trailer_start = frame.len();
        frame.extend_from_slice(&[0x00, 0x09, 0x08, 0x00, 0x00, 0x04, 0x89, b'x', 0x00]);
        frame.extend_from_slice(&0x0001_E240_u32.to_le_bytes());
        frame.push(0x00);

        let fcs = compute_fcs(&frame[1..trailer_start + 3]);
        let fcs_bytes = fcs.to_le_bytes();
        frame[trailer_start + 3] = fcs_bytes[0];
        frame[trailer_start + 4] = fcs_bytes[1];
        frame
    }

    #[test]
    fn test_fcs_swap_consistency() {
        let data = [0x01u8, 0xFF, 0x7A, 0x00, 0x33];
        let sum: u32 = data.iter().map(|&b| u32::from(b)).sum();
        let fcs = compute_fcs(&data);
        assert_eq!(fcs.swap_bytes(), (sum & 0xFFFF) as u16);
    }

    #[test]
    fn test_fcs_byte_order() {
        // Sum 0x0102 swaps to 0x0201.
        let data = [0xFFu8, 0x03];
        assert_eq!(compute_fcs(&data), 0x0201);
    }

    #[test]
    fn test_decode_structured_ack() {
        let mut frame = vec![FRAME_MARKER, b'A'];
        frame.extend_from_slice(&0x0000_0042_u32.to_le_bytes());
        frame.push(0x02);
        frame.extend_from_slice(&0x0000_0007_u32.to_le_bytes());
        frame.push(0x00);
        frame.push(0x00);

        let decoded = decode(&frame).unwrap();
        let DecodedMessage::Ack(ack) = decoded else {
            panic!("expected ack");
        };
        assert_eq!(ack.payload_type, b'A');
        assert_eq!(ack.msg_id, 0x0000_0042);
        assert!(!ack.server_flag);
        assert_eq!(ack.hop_count, 2);
        assert_eq!(ack.ack_id, 0x0000_0007);
        assert_eq!(ack.ack_type, Some(AckType::Node));
        assert_eq!(ack.gateway_id, None);
        assert_eq!(ack.msg_id_hex(), "00000042");
    }

    #[test]
    fn test_decode_gateway_ack_id_split() {
        let msg_id = 0x12AB_CDEF_u32;
        let mut frame = vec![FRAME_MARKER, b'A'];
        frame.extend_from_slice(&msg_id.to_le_bytes());
        frame.push(0x83); // server flag + 3 hops
        frame.extend_from_slice(&0x0000_1234_u32.to_le_bytes());
        frame.push(0x01); // gateway ack
        frame.push(0x00);

        let DecodedMessage::Ack(ack) = decode(&frame).unwrap() else {
            panic!("expected ack");
        };
        assert!(ack.server_flag);
        assert_eq!(ack.hop_count, 3);
        assert_eq!(ack.ack_type, Some(AckType::Gateway));
        assert_eq!(ack.gateway_id, Some((msg_id >> 10) & 0x3F_FFFF));
        assert_eq!(ack.ack_id_part, Some(msg_id & 0x3FF));
    }

    #[test]
    fn test_decode_legacy_short_ack() {
        // 11 bytes: below the structured threshold, ack id comes from the
        // last 5 bytes minus the NUL.
        let mut frame = vec![FRAME_MARKER, b'A'];
        frame.extend_from_slice(&0x0000_0099_u32.to_le_bytes());
        frame.push(0x01);
        frame.extend_from_slice(&[0x56, 0x34, 0x12, 0x00]);
        assert_eq!(frame.len(), 11);

        let DecodedMessage::Ack(ack) = decode(&frame).unwrap() else {
            panic!("expected ack");
        };
        assert_eq!(ack.msg_id, 0x0000_0099);
        assert_eq!(ack.hop_count, 1);
        assert_eq!(ack.ack_id, 0x1234_5601);
        assert_eq!(ack.ack_type, None);
        assert_eq!(ack.gateway_id, None);
    }

    #[test]
    fn test_decode_text_frame() {
        let frame = build_mesh_frame(
            PAYLOAD_TYPE_TEXT,
            0xDEAD_BEEF,
            0x25,
            b"OE1ABC-1>OE5XYZ-12:Hello Mesh",
        );

        let DecodedMessage::Text(msg) = decode(&frame).unwrap() else {
            panic!("expected text");
        };
        assert_eq!(msg.msg_id, 0xDEAD_BEEF);
        assert_eq!(msg.max_hop, 5);
        assert_eq!(msg.mesh_info, 2);
        assert_eq!(msg.path, "OE1ABC-1>");
        assert_eq!(msg.destination, "OE5XYZ-12");
        assert_eq!(msg.message, "Hello Mesh");
        assert_eq!(msg.hardware_id, 0x09);
        assert_eq!(msg.lora_mod, 0x08);
        assert_eq!(msg.firmware, 0x04);
        assert_eq!(msg.fw_sub, 'x');
        assert_eq!(msg.last_hw_id, 0x09);
        assert!(msg.last_sending);
        assert_eq!(msg.node_timestamp_ms, 123_456);
        assert!(msg.checksum_ok);
    }

    #[test]
    fn test_decode_position_frame_keeps_star() {
        let frame = build_mesh_frame(
            PAYLOAD_TYPE_POSITION,
            0x0000_0001,
            0x03,
            b"OE1ABC-1>OE5XYZ-12*4812.34N/01122.56E",
        );

        let DecodedMessage::Position(msg) = decode(&frame).unwrap() else {
            panic!("expected position");
        };
        assert_eq!(msg.destination, "OE5XYZ-12*");
        assert_eq!(msg.message, "4812.34N/01122.56E");
    }

    #[test]
    fn test_decode_checksum_mismatch_kept() {
        let mut frame = build_mesh_frame(PAYLOAD_TYPE_TEXT, 1, 0x01, b"A>B:hi");
        let fcs_at = frame.len() - 1 - TRAILER_LEN + 3;
        frame[fcs_at] ^= 0xFF;

        let DecodedMessage::Text(msg) = decode(&frame).unwrap() else {
            panic!("expected text");
        };
        assert!(!msg.checksum_ok);
    }

    #[test]
    fn test_decode_device_status() {
        let mut frame = b"D{\"TYP\":\"G\",\"LAT\":48.1,\"LON\":11.5}".to_vec();
        frame.push(0x00);

        let DecodedMessage::DeviceStatus(status) = decode(&frame).unwrap() else {
            panic!("expected status");
        };
        assert_eq!(status.get("TYP"), Some(&serde_json::json!("G")));
        assert_eq!(status.get("LAT"), Some(&serde_json::json!(48.1)));
        assert_eq!(status.get("LON"), Some(&serde_json::json!(11.5)));
    }

    #[test]
    fn test_decode_malformed_status() {
        let frame = b"D{\"TYP\":".to_vec();
        assert!(matches!(
            decode(&frame),
            Err(DecodeError::MalformedStatus { .. })
        ));
    }

    #[test]
    fn test_decode_unknown_marker() {
        assert!(matches!(
            decode(b"\x01\x02\x03"),
            Err(DecodeError::UnknownFormat { .. })
        ));
        assert!(matches!(
            decode(b"@Zxxxx"),
            Err(DecodeError::UnknownFormat { .. })
        ));
    }

    #[test]
    fn test_decode_truncated() {
        assert!(matches!(
            decode(b"@A\x01"),
            Err(DecodeError::Truncated { .. })
        ));
        assert!(matches!(
            decode(b"@:\x01\x02"),
            Err(DecodeError::Truncated { .. })
        ));
    }
}
