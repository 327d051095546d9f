//! The lifecycle and traffic events a session publishes.

use std::fmt;

use dronelink_events::EventBus;
use dronelink_protocol::Packet;

/// Payload of `connection_failed` and `connection_lost`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkFailure {
    pub uri: String,
    pub message: String,
}

impl fmt::Display for LinkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.uri, self.message)
    }
}

/// One [`EventBus`] per event kind.
///
/// Subscribers run synchronously on whichever task publishes: the receive
/// loop for `packet_received`, the link driver's callback thread for
/// `link_quality_updated` and the error path, the caller for the rest.
pub struct LinkEvents {
    /// `open_link` was called with this URI.
    pub connection_requested: EventBus<str>,
    /// The first packet came back over the link.
    pub link_established: EventBus<str>,
    /// Opening failed, or the link died before it was established.
    pub connection_failed: EventBus<LinkFailure>,
    /// An established link died.
    pub connection_lost: EventBus<LinkFailure>,
    /// The link is gone, whether closed or lost.
    pub disconnected: EventBus<str>,
    /// Setup finished; the session is fully connected.
    pub connected: EventBus<str>,
    /// A packet was handed to the link, resends included.
    pub packet_sent: EventBus<Packet>,
    /// A packet arrived, before any port handler saw it.
    pub packet_received: EventBus<Packet>,
    /// The driver reported link quality, in percent.
    pub link_quality_updated: EventBus<f32>,
}

impl LinkEvents {
    pub(crate) fn new() -> Self {
        Self {
            connection_requested: EventBus::new("connection_requested"),
            link_established: EventBus::new("link_established"),
            connection_failed: EventBus::new("connection_failed"),
            connection_lost: EventBus::new("connection_lost"),
            disconnected: EventBus::new("disconnected"),
            connected: EventBus::new("connected"),
            packet_sent: EventBus::new("packet_sent"),
            packet_received: EventBus::new("packet_received"),
            link_quality_updated: EventBus::new("link_quality_updated"),
        }
    }
}

impl fmt::Debug for LinkEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkEvents")
            .field("packet_received", &self.packet_received.len())
            .field("packet_sent", &self.packet_sent.len())
            .finish_non_exhaustive()
    }
}
