//! Routes inbound packets to the handlers registered for their address.
//!
//! Handlers are registered with a port/channel value and a mask for each.
//! A packet reaches a handler when `packet.port & port_mask == port` and
//! `packet.channel & channel_mask == channel`, so `0xFF` masks mean an
//! exact match and a `0` mask makes the field a wildcard.
//!
//! The dispatcher does not own handlers. It keeps a [`Weak`] reference to
//! each; a handler whose last `Arc` is dropped simply stops being called
//! and its entry is pruned on the next dispatch.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use dronelink_protocol::Packet;
use tracing::{debug, error, trace};

use crate::HandlerError;

/// Port value of an entry that sees every packet regardless of port.
///
/// Such an entry is a passthrough listener: it never counts toward a
/// packet being "handled".
pub const ALL_PORTS: u8 = 0xFF;

/// Mask that makes a field match exactly.
pub const EXACT: u8 = 0xFF;

/// Mask that makes a field match anything.
pub const ANY: u8 = 0x00;

/// Something that consumes inbound packets.
///
/// Implemented for every `Fn(&Packet) -> Result<(), HandlerError>`, so a
/// closure in an `Arc` is a handler.
pub trait PacketHandler: Send + Sync + 'static {
    fn handle(&self, packet: &Packet) -> Result<(), HandlerError>;
}

impl<F> PacketHandler for F
where
    F: Fn(&Packet) -> Result<(), HandlerError> + Send + Sync + 'static,
{
    fn handle(&self, packet: &Packet) -> Result<(), HandlerError> {
        self(packet)
    }
}

#[derive(Clone)]
struct CallbackEntry {
    port: u8,
    port_mask: u8,
    channel: u8,
    channel_mask: u8,
    handler: Weak<dyn PacketHandler>,
}

impl CallbackEntry {
    fn matches(&self, packet: &Packet) -> bool {
        let port_ok =
            self.port == ALL_PORTS || packet.port().value() & self.port_mask == self.port;
        port_ok && packet.channel().value() & self.channel_mask == self.channel
    }

    fn is_handler<H: PacketHandler>(&self, handler: &Arc<H>) -> bool {
        std::ptr::addr_eq(self.handler.as_ptr(), Arc::as_ptr(handler))
    }
}

/// Ordered list of callback entries.
#[derive(Default)]
pub struct Dispatcher {
    entries: Mutex<Vec<CallbackEntry>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for every channel of `port`.
    pub fn register_port_handler<H: PacketHandler>(&self, port: u8, handler: &Arc<H>) {
        debug!(port, "adding port handler");
        self.register_masked_handler(handler, port, 0, EXACT, ANY);
    }

    /// Registers `handler` for packets whose masked port and channel equal
    /// `port` and `channel`.
    pub fn register_masked_handler<H: PacketHandler>(
        &self,
        handler: &Arc<H>,
        port: u8,
        channel: u8,
        port_mask: u8,
        channel_mask: u8,
    ) {
        let weak: Weak<H> = Arc::downgrade(handler);
        let handler: Weak<dyn PacketHandler> = weak;
        self.lock().push(CallbackEntry {
            port,
            port_mask,
            channel,
            channel_mask,
            handler,
        });
    }

    /// Removes every entry for `port` that points at `handler`.
    ///
    /// Returns `true` if anything was removed.
    pub fn unregister<H: PacketHandler>(&self, port: u8, handler: &Arc<H>) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|entry| !(entry.port == port && entry.is_handler(handler)));
        let removed = entries.len() != before;
        if removed {
            debug!(port, "removed port handler");
        }
        removed
    }

    /// Entries whose handler is still alive.
    pub fn len(&self) -> usize {
        self.lock()
            .iter()
            .filter(|entry| entry.handler.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls every matching handler in registration order.
    ///
    /// A handler that returns an error or panics is logged and skipped.
    /// Returns `true` if a handler other than an [`ALL_PORTS`] listener
    /// matched.
    pub fn dispatch(&self, packet: &Packet) -> bool {
        let snapshot = {
            let mut entries = self.lock();
            entries.retain(|entry| entry.handler.strong_count() > 0);
            entries.clone()
        };

        let mut handled = false;
        for entry in snapshot.iter().filter(|entry| entry.matches(packet)) {
            let Some(handler) = entry.handler.upgrade() else {
                continue;
            };
            match catch_unwind(AssertUnwindSafe(|| handler.handle(packet))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(port = %packet.port(), channel = %packet.channel(), error = %e, "packet handler failed");
                }
                Err(_) => {
                    error!(port = %packet.port(), channel = %packet.channel(), "packet handler panicked");
                }
            }
            if entry.port != ALL_PORTS {
                handled = true;
            }
        }

        if !handled {
            trace!(header = %packet.header(), "no handler for packet");
        }
        handled
    }

    fn lock(&self) -> MutexGuard<'_, Vec<CallbackEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
