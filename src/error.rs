//! Error types for the meshcom-ble library.

use thiserror::Error;

/// The main error type for gateway operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Bus-level failure (session unavailable, method call failed).
    #[error("bus error: {message}")]
    Bus { message: String },

    /// The device object could not be bound on the bus.
    ///
    /// Raised when the device path does not exist, which on a real stack
    /// means the device was never paired. Terminal for the whole connect,
    /// not retried.
    #[error("device not paired: {address}")]
    NotPaired { address: String },

    /// Frame decoding error.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A required GATT characteristic was not found on the device.
    #[error("characteristic not found: {uuid}")]
    CharacteristicNotFound { uuid: String },

    /// Protocol-level error reported by the device or the link.
    #[error("protocol error: {message}")]
    Protocol { message: String },

    /// Operation timed out.
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Connection is not established.
    #[error("not connected")]
    NotConnected,

    /// A session is already live; only one per process is permitted.
    #[error("already connected")]
    AlreadyConnected,

    /// A connect sequence is already in progress.
    #[error("already connecting")]
    AlreadyConnecting,

    /// All connect attempts were exhausted.
    #[error("connect failed after {attempts} attempts: {message}")]
    ConnectFailed { attempts: u32, message: String },

    /// Channel receive error.
    #[error("channel closed")]
    ChannelClosed,
}

impl Error {
    /// Wraps a bus failure message.
    pub fn bus(message: impl Into<String>) -> Self {
        Self::Bus {
            message: message.into(),
        }
    }
}

/// Frame decoding errors.
///
/// All of these are protocol-level: the caller logs them and drops the
/// frame; none of them ever tears down the link.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Frame marker did not match any known format.
    #[error("unknown frame format (leading bytes {leading})")]
    UnknownFormat { leading: String },

    /// A `D{`-prefixed status frame held invalid JSON or UTF-8.
    #[error("malformed status frame: {reason}")]
    MalformedStatus { reason: String },

    /// Frame shorter than its fixed layout requires.
    #[error("truncated frame: need at least {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
}

/// Result type alias for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;
