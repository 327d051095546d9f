//! Link driver abstraction for dronelink.
//!
//! Provides the [`LinkResolver`] and [`LinkDriver`] traits that abstract
//! over the physical link to the vehicle (UDP, radio dongle, USB). No real
//! driver lives here; concrete drivers are external collaborators.
//!
//! # Feature Flags
//!
//! - `loopback` (default): in-memory link pair for tests and demos

mod error;
#[cfg(feature = "loopback")]
mod loopback;
mod uri;

pub use error::LinkError;
#[cfg(feature = "loopback")]
pub use loopback::{LoopbackLink, LoopbackPeer, LoopbackResolver};
pub use uri::LinkUri;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Opaque identifier for an opened link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(u64);

impl LinkId {
    /// Creates a new `LinkId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

type QualityFn = dyn Fn(f32) + Send + Sync;
type ErrorFn = dyn Fn(String) + Send + Sync;

/// Callbacks a driver invokes asynchronously, possibly from its own thread.
///
/// - link quality, as a percentage in `0.0..=100.0`
/// - fatal link errors, as a human-readable message
///
/// Cheap to clone: both callbacks are reference counted.
#[derive(Clone)]
pub struct LinkCallbacks {
    quality: Arc<QualityFn>,
    error: Arc<ErrorFn>,
}

impl LinkCallbacks {
    pub fn new(
        quality: impl Fn(f32) + Send + Sync + 'static,
        error: impl Fn(String) + Send + Sync + 'static,
    ) -> Self {
        Self {
            quality: Arc::new(quality),
            error: Arc::new(error),
        }
    }

    /// Callbacks that ignore everything.
    pub fn noop() -> Self {
        Self::new(|_| {}, |_| {})
    }

    /// Reports a new link quality measurement.
    pub fn link_quality(&self, percentage: f32) {
        (self.quality)(percentage)
    }

    /// Reports a fatal link error. The link is unusable afterwards.
    pub fn link_error(&self, message: impl Into<String>) {
        (self.error)(message.into())
    }
}

impl fmt::Debug for LinkCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkCallbacks").finish_non_exhaustive()
    }
}

/// Resolves a URI to a link driver and opens it.
pub trait LinkResolver: Send + Sync + 'static {
    /// The link type produced by this resolver.
    type Link: LinkDriver;

    /// Opens a link for `uri`.
    ///
    /// Returns `Ok(None)` when no driver handles the URI (unknown scheme,
    /// malformed URI). Returns `Err` when a driver was found but failed to
    /// come up.
    fn open(
        &self,
        uri: &str,
        callbacks: LinkCallbacks,
    ) -> impl Future<Output = Result<Option<Self::Link>, LinkError>> + Send;
}

/// An open link that sends and receives whole frames.
///
/// All methods take `&self`: the receive loop and the send path hold the
/// same link concurrently, so implementations synchronise internally.
pub trait LinkDriver: Send + Sync + 'static {
    /// Sends one frame to the vehicle.
    fn send(&self, data: &[u8]) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Waits up to `timeout` for the next frame.
    ///
    /// Returns `Ok(None)` if nothing arrived in time. That is not an error.
    fn recv(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, LinkError>> + Send;

    /// Closes the link.
    fn close(&self) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// `true` if the link may silently drop frames, so requests that
    /// expect a reply must be resent by the caller until it arrives.
    fn needs_resending(&self) -> bool;

    /// Returns the unique identifier for this link.
    fn id(&self) -> LinkId;
}
