//! # dronelink
//!
//! Reliability and dispatch layer between an unreliable datagram link and
//! the code that talks to a small quadcopter.
//!
//! A [`LinkSession`] opens a link through a [`LinkResolver`], watches for
//! the vehicle's first answer, hands inbound packets to handlers registered
//! by port and channel, and resends requests that expect a reply until the
//! reply arrives. Every lifecycle step is published on [`LinkEvents`].
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use dronelink::prelude::*;
//!
//! # async fn demo() -> Result<(), DronelinkError> {
//! dronelink::init_tracing();
//!
//! let resolver = LoopbackResolver::new();
//! let peer = resolver.endpoint("bench");
//! let session = LinkSession::new(resolver);
//!
//! let console = Arc::new(|packet: &Packet| {
//!     println!("console: {:?}", packet.payload());
//!     Ok::<(), HandlerError>(())
//! });
//! session.register_port_handler(Port::CONSOLE.value(), &console);
//!
//! session.open_link(&peer.uri()).await?;
//! session
//!     .send_expecting(&Packet::with_address(Port::PARAM, Channel::new(0)?, vec![0x01]), &[0x01])
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod dispatcher;
mod error;
mod events;
mod logging;
mod session;
mod setup;
mod state;

pub use config::{LinkConfig, RETRY_TIMEOUT_ENV, URI_ENV};
pub use dispatcher::{ALL_PORTS, ANY, Dispatcher, EXACT, PacketHandler};
pub use error::{DronelinkError, HandlerError};
pub use events::{LinkEvents, LinkFailure};
pub use logging::{init_tracing, init_tracing_for_tests};
pub use session::{LinkSession, LinkSessionBuilder};
pub use setup::{ConnectionSetup, SetupHandle};
pub use state::ConnectionState;

pub use dronelink_events::{EventBus, SubscriptionId};
pub use dronelink_protocol::{
    Channel, ChecksumCodec, Codec, Header, Packet, Port, ProtocolError, Setpoint,
};
pub use dronelink_retry::{Backoff, MAX_RETRY_DELAY, ReplyPattern, RetryMetrics, RetryPolicy};
pub use dronelink_transport::{LoopbackLink, LoopbackPeer, LoopbackResolver};
pub use dronelink_transport::{LinkCallbacks, LinkDriver, LinkError, LinkId, LinkResolver, LinkUri};

/// Common imports for dronelink users.
///
/// ```rust
/// use dronelink::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Channel, ConnectionSetup, ConnectionState, DronelinkError, HandlerError, Header,
        LinkConfig, LinkEvents, LinkFailure, LinkResolver, LinkSession, Packet, PacketHandler,
        Port, RetryPolicy, SetupHandle, Setpoint,
    };
    pub use crate::{LoopbackPeer, LoopbackResolver};
}
