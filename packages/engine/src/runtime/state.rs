// packages/engine/src/runtime/state.rs
//! Session lifecycle state machine
//!
//! ```text
//! NotStarted → Starting → Ready ⇄ Evaluating → Terminating → Terminated
//!                  │         │         │             │
//!                  └─────────┴─────────┴─────────────┴──→ Crashed
//! ```
//!
//! A session may also be terminated before it starts or while it is
//! starting. `Terminated` and `Crashed` are terminal. `Evaluating` is only held while
//! at least one request is outstanding.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of one kernel session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    NotStarted = 0,
    Starting = 1,
    Ready = 2,
    Evaluating = 3,
    Terminating = 4,
    Terminated = 5,
    Crashed = 6,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::NotStarted,
            1 => SessionState::Starting,
            2 => SessionState::Ready,
            3 => SessionState::Evaluating,
            4 => SessionState::Terminating,
            5 => SessionState::Terminated,
            _ => SessionState::Crashed,
        }
    }

    /// No further transitions are possible
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Terminated | SessionState::Crashed)
    }

    /// Requests may be submitted
    pub fn accepts_requests(self) -> bool {
        matches!(self, SessionState::Ready | SessionState::Evaluating)
    }

    /// Whether the machine allows moving from `self` to `next`
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Crashed) => true,
            (NotStarted, Starting) => true,
            (Starting, Ready) => true,
            (Ready, Evaluating) | (Evaluating, Ready) => true,
            (Ready, Terminating) | (Evaluating, Terminating) => true,
            // A kernel that never became ready is still shut down in order
            (NotStarted, Terminating) | (Starting, Terminating) => true,
            (Terminating, Terminated) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::NotStarted => "not-started",
            SessionState::Starting => "starting",
            SessionState::Ready => "ready",
            SessionState::Evaluating => "evaluating",
            SessionState::Terminating => "terminating",
            SessionState::Terminated => "terminated",
            SessionState::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// Atomic holder for a [`SessionState`]
///
/// Every write goes through [`StateCell::transition`], which refuses moves the
/// state machine does not allow.
#[derive(Debug)]
pub struct StateCell {
    value: AtomicU8,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            value: AtomicU8::new(SessionState::NotStarted as u8),
        }
    }

    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.value.load(Ordering::Acquire))
    }

    /// Move `from → to` if the cell currently holds `from`
    pub fn compare_transition(&self, from: SessionState, to: SessionState) -> bool {
        if !from.can_transition_to(to) {
            return false;
        }
        self.value
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to `to` from whatever the current state is, if allowed.
    ///
    /// Returns the previous state on success.
    pub fn transition(&self, to: SessionState) -> Result<SessionState, SessionState> {
        let mut current = self.get();
        loop {
            if !current.can_transition_to(to) {
                return Err(current);
            }
            match self.value.compare_exchange(
                current as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current),
                Err(actual) => current = SessionState::from_u8(actual),
            }
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), SessionState::NotStarted);

        assert_eq!(cell.transition(SessionState::Starting), Ok(SessionState::NotStarted));
        assert!(cell.transition(SessionState::Ready).is_ok());
        assert!(cell.compare_transition(SessionState::Ready, SessionState::Evaluating));
        assert!(cell.compare_transition(SessionState::Evaluating, SessionState::Ready));
        assert!(cell.transition(SessionState::Terminating).is_ok());
        assert!(cell.transition(SessionState::Terminated).is_ok());
        assert_eq!(cell.get(), SessionState::Terminated);
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let cell = StateCell::new();
        cell.transition(SessionState::Starting).unwrap();
        cell.transition(SessionState::Crashed).unwrap();

        assert_eq!(cell.transition(SessionState::Ready), Err(SessionState::Crashed));
        assert_eq!(cell.transition(SessionState::Crashed), Err(SessionState::Crashed));
        assert_eq!(cell.transition(SessionState::Terminating), Err(SessionState::Crashed));
    }

    #[test]
    fn test_illegal_moves_rejected() {
        let cell = StateCell::new();
        assert_eq!(cell.transition(SessionState::Ready), Err(SessionState::NotStarted));
        assert!(!cell.compare_transition(SessionState::NotStarted, SessionState::Evaluating));
        // Stale expected state
        assert!(!cell.compare_transition(SessionState::Ready, SessionState::Evaluating));
        assert_eq!(cell.transition(SessionState::Terminated), Err(SessionState::NotStarted));
    }

    #[test]
    fn test_terminate_before_start() {
        let cell = StateCell::new();
        assert!(cell.transition(SessionState::Terminating).is_ok());
        assert_eq!(cell.transition(SessionState::Starting), Err(SessionState::Terminating));
        assert!(cell.transition(SessionState::Terminated).is_ok());
    }

    #[test]
    fn test_request_acceptance() {
        assert!(SessionState::Ready.accepts_requests());
        assert!(SessionState::Evaluating.accepts_requests());
        assert!(!SessionState::Starting.accepts_requests());
        assert!(!SessionState::Crashed.accepts_requests());
    }
}
