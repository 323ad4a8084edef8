//! Error types for the tinkamo library.

use thiserror::Error;

use crate::types::DeviceId;

/// The main error type for tinkamo operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Packet encoding/decoding error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The transport reported a failure.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The transport link went away.
    #[error("transport lost")]
    TransportLost,

    /// The session has no live link to write to.
    #[error("not connected")]
    NotConnected,

    /// A newer connection attempt replaced this one before it completed.
    #[error("connection attempt superseded")]
    Superseded,

    /// No session is registered under this device id.
    #[error("unknown device: {0}")]
    UnknownDevice(DeviceId),

    /// Channel receive error.
    #[error("channel closed")]
    ChannelClosed,
}

impl Error {
    /// Creates a transport error from any displayable cause.
    pub fn transport(message: impl std::fmt::Display) -> Self {
        Self::Transport {
            message: message.to_string(),
        }
    }
}

/// Packet-level errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Packet shorter than the fixed header; dropped without side effects.
    #[error("packet truncated: need at least 10 bytes, got {len}")]
    Truncated { len: usize },

    /// No top interpretation exists for this module type id.
    #[error("unknown module type: {0}")]
    UnknownModuleType(u8),

    /// Argument bytes do not fit the one-byte length field.
    #[error("payload too long: {len} bytes exceeds maximum {max}")]
    PayloadTooLong { len: usize, max: usize },

    /// A verified write has not been echoed by the module yet.
    #[error("write 0x{command_id:02x} unacknowledged after {attempts} attempts")]
    WriteUnacknowledged { command_id: u8, attempts: u32 },
}

/// Result type alias for tinkamo operations.
pub type Result<T> = std::result::Result<T, Error>;
