//! Error types for the protocol layer.
//!
//! Each crate in dronelink defines its own error enum. A `ProtocolError`
//! always means the bytes or field values were wrong, never that the link
//! misbehaved.

/// Errors that can occur while building or decoding packets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The frame is too short to hold a header and a checksum.
    ///
    /// Every frame carries at least two bytes: the header byte and the
    /// trailing checksum byte. Anything shorter cannot be a packet.
    #[error("frame truncated: {len} bytes, need at least 2")]
    Truncated { len: usize },

    /// The trailing checksum byte disagrees with the header and payload.
    ///
    /// `expected` is what we computed from the received bytes, `actual` is
    /// the byte found at the end of the frame.
    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    /// A port number outside 0–15.
    #[error("invalid port {0}: must be 0-15")]
    InvalidPort(u8),

    /// A channel number outside 0–3.
    #[error("invalid channel {0}: must be 0-3")]
    InvalidChannel(u8),

    /// The packet decoded fine but does not carry the expected message.
    ///
    /// For example, asking for a [`Setpoint`](crate::Setpoint) from a
    /// packet addressed to the logging port.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
