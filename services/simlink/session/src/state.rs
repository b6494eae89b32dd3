//! Session lifecycle state machine.

use std::fmt;
use tracing::{trace, warn};

/// Lifecycle states of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Configuration known, nothing looked up yet
    Unresolved,
    /// Address lookup in progress
    Resolving,
    /// Client dialling (including retry waits)
    ClientConnecting,
    /// Server creating and binding its socket
    ServerBinding,
    /// Server waiting for its single peer
    Listening,
    /// TLS handshake in progress
    SecureHandshake,
    /// Data plane usable
    Established,
    /// Teardown in progress
    Closing,
    /// Teardown finished
    Closed,
    /// Establishment failed
    Failed,
}

impl SessionState {
    /// Closed and Failed accept no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Whether `self -> next` is a legal edge
    pub fn can_transition(&self, next: SessionState) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }
        if next == Failed {
            return true;
        }
        matches!(
            (self, next),
            (Unresolved, Resolving)
                | (Resolving, ClientConnecting)
                | (Resolving, ServerBinding)
                | (ServerBinding, Listening)
                | (ClientConnecting, SecureHandshake)
                | (ClientConnecting, Established)
                | (Listening, SecureHandshake)
                | (Listening, Established)
                | (SecureHandshake, Established)
                | (Established, Closing)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Tracks the current state and refuses illegal transitions
#[derive(Debug)]
pub struct Lifecycle {
    label: &'static str,
    state: SessionState,
}

impl Lifecycle {
    /// Start in [`SessionState::Unresolved`]
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            state: SessionState::Unresolved,
        }
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`; returns false and leaves the state unchanged if illegal
    pub fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition(next) {
            warn!(
                "{}: ignoring illegal state transition {} -> {}",
                self.label, self.state, next
            );
            return false;
        }
        trace!("{}: {} -> {}", self.label, self.state, next);
        self.state = next;
        true
    }

    /// Shorthand for a transition to [`SessionState::Failed`]
    pub fn fail(&mut self) {
        self.transition(SessionState::Failed);
    }
}
