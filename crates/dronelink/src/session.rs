//! `LinkSession`: connection lifecycle, send path and receive loop.
//!
//! A session ties the layers together: the resolver opens links, the
//! codec frames packets, the retry register resends unanswered requests,
//! the dispatcher fans inbound packets out to port handlers, and every
//! step is announced on [`LinkEvents`].
//!
//! Two background tasks live as long as the session: the receive loop and
//! the resend task that drains fired retry timers. Both hold only a weak
//! reference to the session state and are aborted when the session drops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use dronelink_events::SubscriptionId;
use dronelink_protocol::{ChecksumCodec, Codec, Packet, Setpoint};
use dronelink_retry::{ResendRequest, RetryMetrics, RetryRegister};
use dronelink_transport::{LinkCallbacks, LinkDriver, LinkResolver};
use tokio::runtime::Handle;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::dispatcher::{Dispatcher, PacketHandler};
use crate::setup::{ConnectionSetup, SetupHandle, SetupTarget};
use crate::{ConnectionState, DronelinkError, LinkConfig, LinkEvents, LinkFailure};
use crate::state::StateCell;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for a [`LinkSession`].
///
/// # Example
///
/// ```rust,no_run
/// use dronelink::prelude::*;
///
/// # async fn demo() -> Result<(), DronelinkError> {
/// let resolver = LoopbackResolver::new();
/// let peer = resolver.endpoint("bench");
///
/// let session = LinkSession::builder(resolver)
///     .config(LinkConfig::from_env())
///     .build();
/// session.open_link(&peer.uri()).await?;
/// # Ok(())
/// # }
/// ```
pub struct LinkSessionBuilder<R: LinkResolver> {
    resolver: R,
    config: LinkConfig,
    setup: Option<Arc<dyn ConnectionSetup>>,
}

impl<R: LinkResolver> LinkSessionBuilder<R> {
    /// Sets the session configuration. It is validated on `build`.
    pub fn config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the collaborator started after every successful open.
    pub fn setup(mut self, setup: impl ConnectionSetup) -> Self {
        self.setup = Some(Arc::new(setup));
        self
    }

    /// Builds the session and spawns its background tasks.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn build(self) -> LinkSession<R> {
        let config = self.config.validated();
        let (retries, resend_rx) = RetryRegister::new(config.retry.clone());

        let inner = Arc::new(Inner {
            config,
            resolver: self.resolver,
            codec: ChecksumCodec,
            setup: self.setup,
            state: StateCell::new(),
            connection: AtomicU64::new(0),
            link: Mutex::new(None),
            link_uri: Mutex::new(String::new()),
            connected_since: Mutex::new(None),
            initial_packet: Mutex::new(None),
            send_lock: AsyncMutex::new(()),
            retries,
            dispatcher: Dispatcher::new(),
            events: LinkEvents::new(),
            runtime: Handle::current(),
        });

        // First subscriber: replies cancel retries before anyone else sees
        // the packet.
        let session = Arc::downgrade(&inner);
        inner.events.packet_received.subscribe(move |packet| {
            if let Some(inner) = session.upgrade() {
                inner.retries.on_packet_received(packet);
            }
        });

        let tasks = vec![
            tokio::spawn(receive_loop(Arc::downgrade(&inner))),
            tokio::spawn(resend_loop(Arc::downgrade(&inner), resend_rx)),
        ];
        debug!(uri = %inner.config.uri, "link session created");

        LinkSession { inner, tasks }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A connection to one vehicle at a time.
///
/// All operations take `&self`; the session can be shared behind an `Arc`
/// between the task that drives it and the tasks that send through it.
pub struct LinkSession<R: LinkResolver> {
    inner: Arc<Inner<R>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<R: LinkResolver> LinkSession<R> {
    /// Creates a builder that opens links through `resolver`.
    pub fn builder(resolver: R) -> LinkSessionBuilder<R> {
        LinkSessionBuilder {
            resolver,
            config: LinkConfig::default(),
            setup: None,
        }
    }

    /// A session with the default configuration and no setup collaborator.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(resolver: R) -> Self {
        Self::builder(resolver).build()
    }

    // --- Lifecycle ---

    /// Opens a link to `uri`.
    ///
    /// Emits `connection_requested`, then either stores the link and waits
    /// for the first packet, or emits `connection_failed`. The state only
    /// becomes `Initialized` once the resolver has produced a link; a URI
    /// no driver accepts leaves it `Disconnected` and is not an error for
    /// the caller. A driver that fails while opening is, and the session
    /// stays `Disconnected` and reusable.
    ///
    /// An active link is closed first.
    pub async fn open_link(&self, uri: &str) -> Result<(), DronelinkError> {
        let inner = &self.inner;
        inner.events.connection_requested.publish(uri);

        if inner.state.get() != ConnectionState::Disconnected || inner.current_link().is_some() {
            warn!(previous = %inner.link_uri(), uri, "link already active, closing it first");
            self.close_link().await;
        }
        *lock(&inner.link_uri) = uri.to_string();
        let connection = inner.connection.fetch_add(1, Ordering::SeqCst) + 1;
        info!(uri, "opening link");

        match inner.resolver.open(uri, inner.callbacks(connection)).await {
            Ok(Some(link)) => {
                let link = Arc::new(link);
                if !inner.attach(connection, Arc::clone(&link)) {
                    debug!(uri, "link closed while it was being opened");
                    if let Err(e) = link.close().await {
                        debug!(uri, error = %e, "closing abandoned link failed");
                    }
                    return Ok(());
                }
                info!(
                    uri,
                    link = %link.id(),
                    needs_resending = link.needs_resending(),
                    "link opened, waiting for first packet"
                );
                inner.start_setup(uri, connection);
                Ok(())
            }
            Ok(None) => {
                let message = format!("No driver found or malformed URI: {uri}");
                warn!(uri, "{message}");
                inner.events.connection_failed.publish(&LinkFailure {
                    uri: uri.to_string(),
                    message,
                });
                Ok(())
            }
            Err(source) => {
                error!(uri, error = %source, "couldn't load link driver");
                inner.events.connection_failed.publish(&LinkFailure {
                    uri: uri.to_string(),
                    message: format!("Couldn't load link driver: {source}"),
                });
                Err(DronelinkError::OpenFailed {
                    uri: uri.to_string(),
                    source,
                })
            }
        }
    }

    /// Opens the link named by [`LinkConfig::uri`].
    pub async fn open_default_link(&self) -> Result<(), DronelinkError> {
        let uri = self.inner.config.uri.clone();
        self.open_link(&uri).await
    }

    /// Closes the link, if any, and emits `disconnected`.
    ///
    /// Sends a neutral setpoint first so the vehicle stops acting on the
    /// last command. Pending retries are cancelled before this returns.
    /// Calling it again, or without a link, only emits `disconnected`.
    pub async fn close_link(&self) {
        let inner = &self.inner;
        let uri = inner.link_uri();
        info!(%uri, "closing link");

        if inner.current_link().is_some() {
            if let Err(e) = inner.send(&Setpoint::zero().to_packet(), None).await {
                debug!(%uri, error = %e, "stop setpoint not sent");
            }
        }

        inner.state.replace(ConnectionState::Disconnected);
        if let Some(link) = inner.teardown() {
            if let Err(e) = link.close().await {
                warn!(%uri, error = %e, "closing link failed");
            }
        }
        inner.events.disconnected.publish(&uri);
    }

    /// Marks the connection setup as complete: `Connected → SetupFinished`,
    /// records the connection time and emits `connected`.
    ///
    /// Returns `false` (and changes nothing) in any other state.
    pub fn setup_finished(&self) -> bool {
        self.inner.mark_setup_finished()
    }

    // --- Sending ---

    /// Sends a packet that expects no reply.
    pub async fn send_packet(&self, packet: &Packet) -> Result<(), DronelinkError> {
        self.inner.send(packet, None).await
    }

    /// Sends a packet and resends it every [`LinkConfig::retry_timeout`]
    /// until a reply starting with `header | prefix` arrives.
    ///
    /// Retries only apply to links that need resending, and only for a
    /// non-empty `prefix`.
    pub async fn send_expecting(&self, packet: &Packet, prefix: &[u8]) -> Result<(), DronelinkError> {
        let timeout = self.inner.config.retry_timeout;
        self.inner.send(packet, Some((prefix, timeout))).await
    }

    /// Like [`send_expecting`](Self::send_expecting) with an explicit
    /// timeout.
    pub async fn send_expecting_within(
        &self,
        packet: &Packet,
        prefix: &[u8],
        timeout: Duration,
    ) -> Result<(), DronelinkError> {
        self.inner.send(packet, Some((prefix, timeout))).await
    }

    // --- Handlers ---

    /// Registers `handler` for every channel of `port`. The session keeps
    /// only a weak reference.
    pub fn register_port_handler<H: PacketHandler>(&self, port: u8, handler: &Arc<H>) {
        self.inner.dispatcher.register_port_handler(port, handler);
    }

    /// Registers `handler` with explicit masks. See [`Dispatcher`].
    pub fn register_masked_handler<H: PacketHandler>(
        &self,
        handler: &Arc<H>,
        port: u8,
        channel: u8,
        port_mask: u8,
        channel_mask: u8,
    ) {
        self.inner
            .dispatcher
            .register_masked_handler(handler, port, channel, port_mask, channel_mask);
    }

    /// Removes `handler` from `port`. Returns `true` if it was registered.
    pub fn unregister_port_handler<H: PacketHandler>(&self, port: u8, handler: &Arc<H>) -> bool {
        self.inner.dispatcher.unregister(port, handler)
    }

    // --- Accessors ---

    pub fn events(&self) -> &LinkEvents {
        &self.inner.events
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.get()
    }

    /// URI of the current or most recent link.
    pub fn link_uri(&self) -> String {
        self.inner.link_uri()
    }

    /// When setup last finished on the current link.
    pub fn connected_since(&self) -> Option<Instant> {
        *lock(&self.inner.connected_since)
    }

    /// `true` once setup has finished on the current link.
    pub fn is_connected(&self) -> bool {
        self.connected_since().is_some()
    }

    /// `true` while a link is attached, whether or not it answered yet.
    pub fn has_link(&self) -> bool {
        self.inner.current_link().is_some()
    }

    /// Registered handlers that are still alive.
    pub fn handler_count(&self) -> usize {
        self.inner.dispatcher.len()
    }

    pub fn pending_retries(&self) -> usize {
        self.inner.retries.pending_count()
    }

    pub fn retry_metrics(&self) -> RetryMetrics {
        self.inner.retries.metrics()
    }
}

impl<R: LinkResolver> Drop for LinkSession<R> {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Inner<R: LinkResolver> {
    config: LinkConfig,
    resolver: R,
    codec: ChecksumCodec,
    setup: Option<Arc<dyn ConnectionSetup>>,
    state: StateCell,
    /// Bumped on every open and every teardown. Callbacks and setup handles
    /// carry the value they were issued with and go quiet once it changes.
    connection: AtomicU64,
    link: Mutex<Option<Arc<R::Link>>>,
    link_uri: Mutex<String>,
    connected_since: Mutex<Option<Instant>>,
    initial_packet: Mutex<Option<SubscriptionId>>,
    /// Serialises every write to the link, resends included.
    send_lock: AsyncMutex<()>,
    retries: RetryRegister,
    dispatcher: Dispatcher,
    events: LinkEvents,
    runtime: Handle,
}

impl<R: LinkResolver> Inner<R> {
    fn link_uri(&self) -> String {
        lock(&self.link_uri).clone()
    }

    fn current_link(&self) -> Option<Arc<R::Link>> {
        lock(&self.link).clone()
    }

    fn is_current(&self, link: &Arc<R::Link>) -> bool {
        lock(&self.link)
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, link))
    }

    fn is_current_connection(&self, connection: u64) -> bool {
        self.connection.load(Ordering::SeqCst) == connection
    }

    /// Stores `link`, arms the first-packet detector and enters
    /// `Initialized`, unless the connection it was opened for is gone.
    fn attach(self: &Arc<Self>, connection: u64, link: Arc<R::Link>) -> bool {
        let mut slot = lock(&self.link);
        if !self.is_current_connection(connection) {
            return false;
        }
        self.arm_initial_packet_detector(connection);
        self.state.replace(ConnectionState::Initialized);
        *slot = Some(link);
        true
    }

    /// Detaches the link and drops everything tied to it. Returns the link
    /// so the caller can close it.
    fn teardown(&self) -> Option<Arc<R::Link>> {
        let link = {
            let mut slot = lock(&self.link);
            self.connection.fetch_add(1, Ordering::SeqCst);
            slot.take()
        };
        self.remove_initial_packet_detector();
        let cleared = self.retries.clear();
        *lock(&self.connected_since) = None;
        if cleared > 0 {
            debug!(cleared, "dropped pending retries");
        }
        link
    }

    fn callbacks(self: &Arc<Self>, connection: u64) -> LinkCallbacks {
        let quality = Arc::downgrade(self);
        let failure = Arc::downgrade(self);
        LinkCallbacks::new(
            move |percentage| {
                if let Some(inner) = quality.upgrade() {
                    inner.events.link_quality_updated.publish(&percentage);
                }
            },
            move |message| {
                if let Some(inner) = failure.upgrade() {
                    inner.on_link_error(connection, message);
                }
            },
        )
    }

    fn on_link_error(&self, connection: u64, message: String) {
        if !self.is_current_connection(connection) {
            debug!(error = %message, "ignoring error from a closed link");
            return;
        }
        let uri = self.link_uri();
        let previous = self.state.replace(ConnectionState::Disconnected);
        warn!(%uri, state = %previous, error = %message, "link error");

        if let Some(link) = self.teardown() {
            self.runtime.spawn(async move {
                if let Err(e) = link.close().await {
                    debug!(error = %e, "closing failed link");
                }
            });
        }

        let failure = LinkFailure {
            uri: uri.clone(),
            message,
        };
        match previous {
            ConnectionState::Initialized => self.events.connection_failed.publish(&failure),
            ConnectionState::Connected | ConnectionState::SetupFinished => {
                self.events.disconnected.publish(&uri);
                self.events.connection_lost.publish(&failure);
            }
            ConnectionState::Disconnected => {}
        }
    }

    // --- First packet ---

    fn arm_initial_packet_detector(self: &Arc<Self>, connection: u64) {
        let session = Arc::downgrade(self);
        let id = self.events.packet_received.subscribe(move |_| {
            if let Some(inner) = session.upgrade() {
                inner.on_first_packet(connection);
            }
        });
        let previous = lock(&self.initial_packet).replace(id);
        if let Some(previous) = previous {
            self.events.packet_received.unsubscribe(previous);
        }
    }

    fn remove_initial_packet_detector(&self) {
        let id = lock(&self.initial_packet).take();
        if let Some(id) = id {
            self.events.packet_received.unsubscribe(id);
        }
    }

    fn on_first_packet(&self, connection: u64) {
        if !self.is_current_connection(connection) {
            return;
        }
        self.remove_initial_packet_detector();
        if self
            .state
            .compare_and_set(ConnectionState::Initialized, ConnectionState::Connected)
        {
            let uri = self.link_uri();
            info!(%uri, "link established");
            self.events.link_established.publish(&uri);
        }
    }

    // --- Setup ---

    fn start_setup(self: &Arc<Self>, uri: &str, connection: u64) {
        let Some(setup) = &self.setup else {
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        let target: Weak<dyn SetupTarget> = weak;
        debug!(uri, "starting connection setup");
        setup.start(uri, SetupHandle::new(target, connection));
    }

    fn mark_setup_finished(&self) -> bool {
        let mut since = lock(&self.connected_since);
        if !self
            .state
            .compare_and_set(ConnectionState::Connected, ConnectionState::SetupFinished)
        {
            debug!(state = %self.state.get(), "setup finished outside Connected, ignoring");
            return false;
        }
        *since = Some(Instant::now());
        drop(since);

        let uri = self.link_uri();
        info!(%uri, "connection setup finished");
        self.events.connected.publish(&uri);
        true
    }

    // --- Send path ---

    async fn send(
        &self,
        packet: &Packet,
        expect: Option<(&[u8], Duration)>,
    ) -> Result<(), DronelinkError> {
        let _guard = self.send_lock.lock().await;
        let link = self.current_link().ok_or(DronelinkError::NotConnected)?;

        if let Some((prefix, timeout)) = expect {
            if link.needs_resending() && !prefix.is_empty() {
                self.retries.arm(packet, prefix, timeout);
            }
        }

        link.send(&self.codec.encode(packet)).await?;
        trace!(%packet, "packet sent");
        self.events.packet_sent.publish(packet);
        Ok(())
    }

    async fn resend(&self, request: &ResendRequest) {
        let _guard = self.send_lock.lock().await;
        let Some(link) = self.current_link() else {
            return;
        };
        let Some(packet) = self.retries.rearm(request) else {
            return;
        };

        match link.send(&self.codec.encode(&packet)).await {
            Ok(()) => {
                trace!(%packet, pattern = %request.pattern, "packet resent");
                self.events.packet_sent.publish(&packet);
            }
            Err(e) => warn!(pattern = %request.pattern, error = %e, "resend failed"),
        }
    }

    // --- Receive path ---

    fn handle_frame(&self, frame: &[u8]) {
        match self.codec.decode(frame) {
            Ok(packet) => {
                trace!(%packet, "packet received");
                self.events.packet_received.publish(&packet);
                self.dispatcher.dispatch(&packet);
            }
            Err(e) => debug!(len = frame.len(), error = %e, "dropping undecodable frame"),
        }
    }
}

impl<R: LinkResolver> SetupTarget for Inner<R> {
    fn finish_setup(&self, connection: u64) -> bool {
        if !self.is_current_connection(connection) {
            debug!("setup finished for a closed link, ignoring");
            return false;
        }
        self.mark_setup_finished()
    }
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

/// Polls the current link and dispatches what arrives. Sleeps one idle
/// interval while no link is attached and after a receive error.
async fn receive_loop<R: LinkResolver>(session: Weak<Inner<R>>) {
    loop {
        let Some(inner) = session.upgrade() else {
            break;
        };
        let idle = inner.config.idle_poll_interval;
        let Some(link) = inner.current_link() else {
            drop(inner);
            time::sleep(idle).await;
            continue;
        };

        match link.recv(inner.config.receive_timeout).await {
            Ok(Some(frame)) => {
                if inner.is_current(&link) {
                    inner.handle_frame(&frame);
                } else {
                    trace!(len = frame.len(), "dropping frame from a detached link");
                }
            }
            Ok(None) => {}
            Err(e) => {
                if !inner.is_current(&link) {
                    trace!(link = %link.id(), "receive ended on a detached link");
                    continue;
                }
                warn!(link = %link.id(), error = %e, "receive failed");
                drop(inner);
                time::sleep(idle).await;
            }
        }
    }
    debug!("receive loop stopped");
}

/// Sends again whatever the retry register asks for.
async fn resend_loop<R: LinkResolver>(
    session: Weak<Inner<R>>,
    mut requests: mpsc::UnboundedReceiver<ResendRequest>,
) {
    while let Some(request) = requests.recv().await {
        let Some(inner) = session.upgrade() else {
            break;
        };
        inner.resend(&request).await;
    }
    debug!("resend loop stopped");
}
