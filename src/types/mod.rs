//! Data types for decoded mesh traffic.
//!
//! This module contains the message structures produced by the frame codec:
//! - Text messages and position reports
//! - Acknowledgments
//! - JSON device status

pub mod message;

pub use message::{
    AckType, DecodedMessage, DeviceStatus, MeshAck, MeshMessage, PAYLOAD_TYPE_ACK,
    PAYLOAD_TYPE_POSITION, PAYLOAD_TYPE_TEXT,
};
