//! Decoded message types for frames received over the notify characteristic.

use serde_json::{Map, Value};

/// Payload type byte for text messages (`:`).
pub const PAYLOAD_TYPE_TEXT: u8 = 0x3A;

/// Payload type byte for position reports (`!`).
pub const PAYLOAD_TYPE_POSITION: u8 = 0x21;

/// Payload type byte for acknowledgments (`A`).
pub const PAYLOAD_TYPE_ACK: u8 = 0x41;

/// A message decoded from a single notify frame.
///
/// Closed tagged variant per message kind. Frames the codec cannot place
/// are carried as [`DecodedMessage::Unrecognized`] so downstream consumers
/// still observe them.
#[derive(Debug, Clone)]
pub enum DecodedMessage {
    /// Text message (`@:` frames, payload type 58).
    Text(MeshMessage),
    /// Position report (`@!` frames, payload type 33).
    Position(MeshMessage),
    /// Acknowledgment (`@A` frames).
    Ack(MeshAck),
    /// JSON device status (`D{` frames), passed through opaquely.
    DeviceStatus(DeviceStatus),
    /// Frame with an unknown leading marker.
    Unrecognized {
        /// Raw frame bytes as received.
        data: Vec<u8>,
    },
}

/// A text message or position report from the mesh.
///
/// Both kinds share the same wire layout; only the destination terminator
/// differs (see the frame codec).
#[derive(Debug, Clone)]
pub struct MeshMessage {
    /// Payload type byte (58 = text, 33 = position).
    pub payload_type: u8,
    /// Message id.
    pub msg_id: u32,
    /// Maximum hop count, 0-15 (low nibble of the hop byte).
    pub max_hop: u8,
    /// Mesh info bits, 0-15 (high nibble of the hop byte).
    pub mesh_info: u8,
    /// Routing path up to and including the terminating `>`.
    pub path: String,
    /// Destination field.
    pub destination: String,
    /// Message payload text.
    pub message: String,
    /// Hardware id of the originating node.
    pub hardware_id: u8,
    /// LoRa modulation setting.
    pub lora_mod: u8,
    /// Firmware major version.
    pub firmware: u8,
    /// Firmware sub-version (ASCII character).
    pub fw_sub: char,
    /// Hardware id of the last relaying node (low 7 bits).
    pub last_hw_id: u8,
    /// True if the last relaying node was still sending.
    pub last_sending: bool,
    /// Device clock timestamp in milliseconds.
    pub node_timestamp_ms: u32,
    /// True if the frame checksum matched.
    pub checksum_ok: bool,
}

impl MeshMessage {
    /// Renders the message id as the 8-hex-digit form used by the mesh.
    #[must_use]
    pub fn msg_id_hex(&self) -> String {
        format!("{:08X}", self.msg_id)
    }
}

/// Acknowledgment kind carried in structured ack frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckType {
    /// Acknowledged by a node.
    Node,
    /// Acknowledged by a gateway.
    Gateway,
    /// Unknown ack type byte.
    Unknown(u8),
}

impl AckType {
    /// Parses an ack type from its wire byte.
    #[must_use]
    pub const fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => Self::Node,
            0x01 => Self::Gateway,
            n => Self::Unknown(n),
        }
    }
}

impl std::fmt::Display for AckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Node => write!(f, "Node ACK"),
            Self::Gateway => write!(f, "Gateway ACK"),
            Self::Unknown(n) => write!(f, "Unknown({n})"),
        }
    }
}

/// An acknowledgment frame referencing an earlier message id.
#[derive(Debug, Clone)]
pub struct MeshAck {
    /// Payload type byte (0x41).
    pub payload_type: u8,
    /// Message id of the ack frame itself.
    pub msg_id: u32,
    /// True if the server flag bit was set.
    pub server_flag: bool,
    /// Hop count, 0-127.
    pub hop_count: u8,
    /// Id of the acknowledged message.
    pub ack_id: u32,
    /// Ack type. Absent on legacy short frames.
    pub ack_type: Option<AckType>,
    /// Gateway id extracted from the message id (gateway acks only).
    pub gateway_id: Option<u32>,
    /// Low 10 bits of the message id (gateway acks only).
    pub ack_id_part: Option<u32>,
}

impl MeshAck {
    /// Renders the message id as the 8-hex-digit form used by the mesh.
    #[must_use]
    pub fn msg_id_hex(&self) -> String {
        format!("{:08X}", self.msg_id)
    }
}

/// Device status decoded from a `D{` JSON frame.
///
/// The key/value body is firmware-defined and passed through opaquely.
#[derive(Debug, Clone)]
pub struct DeviceStatus {
    /// Decoded JSON object.
    pub fields: Map<String, Value>,
}

impl DeviceStatus {
    /// Returns a field by key, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}
