//! In-memory link driver for `loopback://<name>` URIs.
//!
//! A [`LoopbackResolver`] owns named endpoints. Each endpoint has two
//! sides: the [`LoopbackLink`] handed to whoever opens the URI, and a
//! [`LoopbackPeer`] that plays the vehicle. The peer sees every frame the
//! link sends, injects frames for the link to receive, and can fire the
//! quality and error callbacks the way a real driver would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, Notify, mpsc};

use crate::{LinkCallbacks, LinkDriver, LinkError, LinkId, LinkResolver, LinkUri};

/// Counter for generating unique link IDs.
static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

/// URI scheme served by [`LoopbackResolver`].
const SCHEME: &str = "loopback";

/// Shared state of one named endpoint.
///
/// Both channel ends live here so neither channel ever reports "closed";
/// link closure is tracked per [`LoopbackLink`] instead.
struct Endpoint {
    name: String,
    needs_resending: bool,
    to_link_tx: mpsc::UnboundedSender<Vec<u8>>,
    to_link_rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    from_link_tx: mpsc::UnboundedSender<Vec<u8>>,
    from_link_rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    callbacks: Mutex<Option<LinkCallbacks>>,
    fail_next_open: Mutex<Option<String>>,
    open: AtomicBool,
    opens: AtomicU64,
}

impl Endpoint {
    fn new(name: &str, needs_resending: bool) -> Self {
        let (to_link_tx, to_link_rx) = mpsc::unbounded_channel();
        let (from_link_tx, from_link_rx) = mpsc::unbounded_channel();
        Self {
            name: name.to_string(),
            needs_resending,
            to_link_tx,
            to_link_rx: AsyncMutex::new(to_link_rx),
            from_link_tx,
            from_link_rx: AsyncMutex::new(from_link_rx),
            callbacks: Mutex::new(None),
            fail_next_open: Mutex::new(None),
            open: AtomicBool::new(false),
            opens: AtomicU64::new(0),
        }
    }

    fn callbacks(&self) -> Option<LinkCallbacks> {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// A [`LinkResolver`] serving `loopback://<name>` URIs.
///
/// URIs with another scheme, malformed URIs, and names that were never
/// registered resolve to `None` ("no driver").
#[derive(Default)]
pub struct LoopbackResolver {
    endpoints: Mutex<HashMap<String, Arc<Endpoint>>>,
}

impl LoopbackResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or looks up) an endpoint that behaves like an unreliable
    /// datagram link: it reports `needs_resending() == true`.
    pub fn endpoint(&self, name: &str) -> LoopbackPeer {
        self.register(name, true)
    }

    /// Registers (or looks up) an endpoint that claims reliable delivery,
    /// so callers skip retry bookkeeping.
    pub fn reliable_endpoint(&self, name: &str) -> LoopbackPeer {
        self.register(name, false)
    }

    fn register(&self, name: &str, needs_resending: bool) -> LoopbackPeer {
        let mut endpoints = self
            .endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let endpoint = endpoints
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Endpoint::new(name, needs_resending)));
        LoopbackPeer {
            endpoint: Arc::clone(endpoint),
        }
    }

    fn lookup(&self, name: &str) -> Option<Arc<Endpoint>> {
        self.endpoints
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

impl LinkResolver for LoopbackResolver {
    type Link = LoopbackLink;

    async fn open(
        &self,
        uri: &str,
        callbacks: LinkCallbacks,
    ) -> Result<Option<Self::Link>, LinkError> {
        let parsed: LinkUri = match uri.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::debug!(uri, error = %e, "loopback resolver: malformed uri");
                return Ok(None);
            }
        };
        if parsed.scheme() != SCHEME {
            return Ok(None);
        }
        let Some(endpoint) = self.lookup(parsed.address()) else {
            tracing::debug!(uri, "loopback resolver: no such endpoint");
            return Ok(None);
        };

        let failure = endpoint
            .fail_next_open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(message) = failure {
            return Err(LinkError::OpenFailed(message));
        }

        *endpoint
            .callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(callbacks);
        endpoint.open.store(true, Ordering::SeqCst);
        endpoint.opens.fetch_add(1, Ordering::SeqCst);

        let id = LinkId::new(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(%id, name = %endpoint.name, "opened loopback link");

        Ok(Some(LoopbackLink {
            id,
            endpoint,
            closed: AtomicBool::new(false),
            closing: Notify::new(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Link side
// ---------------------------------------------------------------------------

/// The link half handed out by [`LoopbackResolver::open`].
pub struct LoopbackLink {
    id: LinkId,
    endpoint: Arc<Endpoint>,
    closed: AtomicBool,
    /// Wakes a `recv` that is still waiting when the link closes.
    closing: Notify,
}

impl LoopbackLink {
    fn ensure_open(&self) -> Result<(), LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::ConnectionClosed(format!(
                "{} is closed",
                self.id
            )));
        }
        Ok(())
    }
}

impl LinkDriver for LoopbackLink {
    async fn send(&self, data: &[u8]) -> Result<(), LinkError> {
        self.ensure_open()?;
        self.endpoint
            .from_link_tx
            .send(data.to_vec())
            .map_err(|_| LinkError::Shutdown)
    }

    async fn recv(&self, timeout: Duration) -> Result<Option<Vec<u8>>, LinkError> {
        // Registered before the closed check so a concurrent `close` is
        // never missed.
        let closing = self.closing.notified();
        tokio::pin!(closing);
        closing.as_mut().enable();
        self.ensure_open()?;

        let next_frame = async {
            let mut rx = self.endpoint.to_link_rx.lock().await;
            rx.recv().await
        };
        tokio::select! {
            biased;
            () = &mut closing => Err(LinkError::ConnectionClosed(format!("{} is closed", self.id))),
            received = tokio::time::timeout(timeout, next_frame) => match received {
                Ok(Some(frame)) => Ok(Some(frame)),
                Ok(None) => Err(LinkError::Shutdown),
                Err(_) => Ok(None),
            },
        }
    }

    async fn close(&self) -> Result<(), LinkError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.endpoint.open.store(false, Ordering::SeqCst);
            self.endpoint
                .callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            self.closing.notify_waiters();
            tracing::debug!(id = %self.id, "closed loopback link");
        }
        Ok(())
    }

    fn needs_resending(&self) -> bool {
        self.endpoint.needs_resending
    }

    fn id(&self) -> LinkId {
        self.id
    }
}

// ---------------------------------------------------------------------------
// Peer side
// ---------------------------------------------------------------------------

/// The vehicle side of a loopback endpoint.
///
/// Frames injected before the link is opened are queued and delivered
/// once it is.
#[derive(Clone)]
pub struct LoopbackPeer {
    endpoint: Arc<Endpoint>,
}

impl LoopbackPeer {
    /// The URI that opens this endpoint.
    pub fn uri(&self) -> String {
        format!("{SCHEME}://{}", self.endpoint.name)
    }

    /// Queues a frame for the link to receive.
    pub fn inject(&self, frame: impl Into<Vec<u8>>) {
        let _ = self.endpoint.to_link_tx.send(frame.into());
    }

    /// Waits up to `timeout` for the next frame the link sent.
    pub async fn recv_sent(&self, timeout: Duration) -> Option<Vec<u8>> {
        let mut rx = self.endpoint.from_link_rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    /// Returns every frame the link sent since the last drain.
    pub async fn drain_sent(&self) -> Vec<Vec<u8>> {
        let mut rx = self.endpoint.from_link_rx.lock().await;
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Fires the link-quality callback of the currently open link.
    pub fn report_quality(&self, percentage: f32) {
        if let Some(callbacks) = self.endpoint.callbacks() {
            callbacks.link_quality(percentage);
        }
    }

    /// Fires the fatal-error callback of the currently open link.
    ///
    /// The callbacks are cloned out first so the receiver may close the
    /// link from inside the callback.
    pub fn raise_error(&self, message: &str) {
        if let Some(callbacks) = self.endpoint.callbacks() {
            callbacks.link_error(message);
        }
    }

    /// Makes the next `open` of this endpoint fail with
    /// [`LinkError::OpenFailed`].
    pub fn fail_next_open(&self, message: &str) {
        *self
            .endpoint
            .fail_next_open
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(message.to_string());
    }

    /// `true` while a link to this endpoint is open.
    pub fn is_open(&self) -> bool {
        self.endpoint.open.load(Ordering::SeqCst)
    }

    /// How many times this endpoint has been opened successfully.
    pub fn open_count(&self) -> u64 {
        self.endpoint.opens.load(Ordering::SeqCst)
    }
}
