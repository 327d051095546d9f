//! Connection lifecycle state.

use std::fmt;
use std::sync::{Mutex, PoisonError};

/// Where a session is in bringing its link up.
///
/// ```text
/// Disconnected ──open──→ Initialized ──first packet──→ Connected ──setup done──→ SetupFinished
///      ↑                      │                           │                          │
///      └──────────────────────┴──── close / link error ───┴──────────────────────────┘
/// ```
///
/// - **Disconnected**: no link. Initial state, and the state after every
///   close or link error.
/// - **Initialized**: a link was requested and is being resolved, or is
///   open but nothing has come back yet.
/// - **Connected**: the vehicle answered at least once.
/// - **SetupFinished**: the metadata setup completed; the session counts
///   as fully connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Initialized,
    Connected,
    SetupFinished,
}

impl ConnectionState {
    /// Returns `true` once the vehicle has answered.
    pub fn is_established(self) -> bool {
        matches!(self, Self::Connected | Self::SetupFinished)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Initialized => write!(f, "Initialized"),
            Self::Connected => write!(f, "Connected"),
            Self::SetupFinished => write!(f, "SetupFinished"),
        }
    }
}

/// The single authoritative state value. Every mutation goes through the
/// lock, so a transition observes the state it replaces.
#[derive(Debug)]
pub(crate) struct StateCell(Mutex<ConnectionState>);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(Mutex::new(ConnectionState::Disconnected))
    }

    pub(crate) fn get(&self) -> ConnectionState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Sets `next` and returns the previous state.
    pub(crate) fn replace(&self, next: ConnectionState) -> ConnectionState {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *state, next)
    }

    /// Moves to `next` only if the current state is `expected`.
    pub(crate) fn compare_and_set(&self, expected: ConnectionState, next: ConnectionState) -> bool {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != expected {
            return false;
        }
        *state = next;
        true
    }
}
