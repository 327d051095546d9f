//! Hook for the metadata download that follows a successful open.

use std::fmt;
use std::sync::Weak;

/// Implemented by the session so a [`SetupHandle`] can reach it without
/// knowing its resolver type.
pub(crate) trait SetupTarget: Send + Sync {
    fn finish_setup(&self, connection: u64) -> bool;
}

/// Starts whatever has to happen between "link open" and "fully
/// connected": typically platform info, then the log table, then memories,
/// then the parameter table.
///
/// `start` is called once per successful [`open_link`] and must not block.
/// The collaborator runs its own chain of requests and calls
/// [`SetupHandle::finish`] when the last one completes.
///
/// [`open_link`]: crate::LinkSession::open_link
pub trait ConnectionSetup: Send + Sync + 'static {
    fn start(&self, uri: &str, handle: SetupHandle);
}

/// Completion token for one connection's setup.
///
/// A handle only affects the connection it was issued for: finishing it
/// after the link was closed or reopened does nothing.
#[derive(Clone)]
pub struct SetupHandle {
    target: Weak<dyn SetupTarget>,
    connection: u64,
}

impl SetupHandle {
    pub(crate) fn new(target: Weak<dyn SetupTarget>, connection: u64) -> Self {
        Self { target, connection }
    }

    /// Marks setup as done. Returns `true` if the session moved to
    /// `SetupFinished`.
    pub fn finish(&self) -> bool {
        self.target
            .upgrade()
            .is_some_and(|target| target.finish_setup(self.connection))
    }
}

impl fmt::Debug for SetupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SetupHandle")
            .field("connection", &self.connection)
            .finish_non_exhaustive()
    }
}
