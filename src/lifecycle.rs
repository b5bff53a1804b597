//! Session lifecycle state

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// `Created → Starting → Running → Closing → Closed`, with
/// `Starting → Closed` when startup fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Starting,
    Running,
    Closing,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Starting => "starting",
            SessionState::Running => "running",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Shared between the server controller and the tunnel controller.
///
/// `shutdown` fires once, either on `close()` or when the tunnel gives up
/// reconnecting; the accept loop and reconnect backoff both watch it.
pub struct Lifecycle {
    state: Mutex<SessionState>,
    shutdown: CancellationToken,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Created),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Running means started and not yet told to stop.
    pub fn is_running(&self) -> bool {
        self.state() == SessionState::Running && !self.shutdown.is_cancelled()
    }

    /// Move to `next` if the transition is legal; returns whether it happened.
    pub fn transition(&self, next: SessionState) -> bool {
        use SessionState::*;
        let mut state = self.state.lock();
        let allowed = matches!(
            (*state, next),
            (Created, Starting)
                | (Starting, Running)
                | (Starting, Closed)
                | (Running, Closing)
                | (Closing, Closed)
        );
        if allowed {
            *state = next;
        }
        allowed
    }

    /// Stop accepting work without tearing anything down.
    pub fn halt(&self) {
        self.shutdown.cancel();
    }

    pub fn is_halted(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let lc = Lifecycle::new();
        assert!(!lc.is_running());
        assert!(lc.transition(SessionState::Starting));
        assert!(lc.transition(SessionState::Running));
        assert!(lc.is_running());
        assert!(lc.transition(SessionState::Closing));
        assert!(lc.transition(SessionState::Closed));
        assert!(!lc.transition(SessionState::Running));
        assert_eq!(lc.state(), SessionState::Closed);
    }

    #[test]
    fn test_failed_start_skips_running() {
        let lc = Lifecycle::new();
        lc.transition(SessionState::Starting);
        assert!(lc.transition(SessionState::Closed));
        assert!(!lc.transition(SessionState::Closing));
    }

    #[test]
    fn test_halt_stops_running() {
        let lc = Lifecycle::new();
        lc.transition(SessionState::Starting);
        lc.transition(SessionState::Running);
        lc.halt();
        assert!(!lc.is_running());
        assert_eq!(lc.state(), SessionState::Running);
    }
}
