//! Protocol definitions for MeshCom BLE communication.
//!
//! This module contains the pure byte-level codec:
//! - Frame decoding (notify characteristic → typed messages)
//! - Command encoding (typed commands → write characteristic bytes)
//! - Frame check sequence

pub mod command;
pub mod frame;

pub use command::{CMD_SET_TIME, CMD_TEXT, SETTINGS_TERMINATOR, raw_command, set_time,
    text_message, utc_offset};
pub use frame::{FRAME_MARKER, STATUS_MARKER, compute_fcs, decode};
