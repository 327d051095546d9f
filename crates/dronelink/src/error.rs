//! Unified error type for dronelink.

use dronelink_protocol::ProtocolError;
use dronelink_transport::LinkError;

/// Top-level error that wraps the layer-specific errors.
///
/// The `#[from]` variants let `?` lift link and codec errors; the
/// remaining variants describe session-level failures.
#[derive(Debug, thiserror::Error)]
pub enum DronelinkError {
    /// A link-level error (send, receive, close).
    #[error(transparent)]
    Link(#[from] LinkError),

    /// A framing error (truncated frame, bad checksum, bad address).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The driver recognised the URI but failed while opening it. The
    /// session is back in `Disconnected` and can be reused.
    #[error("couldn't load link driver for {uri}: {source}")]
    OpenFailed {
        uri: String,
        #[source]
        source: LinkError,
    },

    /// An operation needed an open link and there was none.
    #[error("no link is open")]
    NotConnected,

    /// The configuration could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Failure reported by a packet handler.
///
/// The dispatcher logs it and moves on to the next handler; it never
/// reaches the caller of any session operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}
