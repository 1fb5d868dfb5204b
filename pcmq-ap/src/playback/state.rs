//! Session state cell
//!
//! The session state is the single source of truth shared by the control
//! thread, the feeder thread and the device callback. It lives in one
//! `AtomicU8` and only changes through compare-and-swap along the edges of
//! the session state machine.

use pcmq_common::SessionState;
use std::sync::atomic::{AtomicU8, Ordering};

/// True if `from → to` is an edge of the session state machine
pub fn is_legal_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    matches!(
        (from, to),
        (Idle, Priming)
            | (Idle, Stopped)
            | (Priming, Playing)
            | (Priming, Draining)
            | (Priming, Stopped)
            | (Priming, Failed)
            | (Playing, Draining)
            | (Playing, Stopped)
            | (Playing, Failed)
            | (Draining, Stopped)
            | (Draining, Failed)
    )
}

/// Atomic session state
#[derive(Debug)]
pub struct SessionStateCell(AtomicU8);

impl SessionStateCell {
    pub fn new(initial: SessionState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub fn load(&self) -> SessionState {
        // Only valid discriminants are ever stored
        SessionState::from_u8(self.0.load(Ordering::Acquire)).unwrap_or(SessionState::Failed)
    }

    /// Move `from → to` if the state is still `from`
    ///
    /// Returns false if another context changed the state first or the edge
    /// is not part of the state machine.
    pub fn transition(&self, from: SessionState, to: SessionState) -> bool {
        if !is_legal_transition(from, to) {
            debug_assert!(false, "illegal session transition {} -> {}", from, to);
            return false;
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Move to terminal state `to` from whatever non-terminal state is current
    ///
    /// Returns the previous state, or None if the session already ended.
    pub fn terminate(&self, to: SessionState) -> Option<SessionState> {
        debug_assert!(to.is_terminal());
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let from = SessionState::from_u8(current)?;
            if from.is_terminal() || !is_legal_transition(from, to) {
                return None;
            }
            match self.0.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(from),
                Err(actual) => current = actual,
            }
        }
    }

    /// True while completions should trigger refills or drain accounting
    pub fn accepts_completions(&self) -> bool {
        self.load().is_active()
    }
}
