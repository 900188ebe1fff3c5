// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use tracing::warn;

/// Per-session turn state machine.
///
/// `Idle → ReceivingUser → Thinking → Speaking → Idle`, with
/// `Speaking → Interrupted → Idle` on barge-in and
/// `Thinking|Speaking → Switching → Speaking` on handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    ReceivingUser,
    Thinking,
    Speaking,
    Interrupted,
    Switching,
}

impl TurnPhase {
    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: TurnPhase) -> bool {
        use TurnPhase::*;
        matches!(
            (self, next),
            (Idle, ReceivingUser)
                | (Idle, Thinking)
                | (ReceivingUser, Thinking)
                | (ReceivingUser, Idle)
                | (Thinking, Speaking)
                | (Thinking, Switching)
                | (Thinking, Interrupted)
                | (Thinking, Idle)
                | (Speaking, Idle)
                | (Speaking, Interrupted)
                | (Speaking, Switching)
                | (Speaking, Thinking)
                | (Interrupted, Idle)
                | (Interrupted, ReceivingUser)
                | (Switching, Speaking)
                | (Switching, Thinking)
                | (Switching, Interrupted)
                | (Switching, Idle)
        )
    }
}

impl std::fmt::Display for TurnPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TurnPhase::Idle => "idle",
            TurnPhase::ReceivingUser => "receiving_user",
            TurnPhase::Thinking => "thinking",
            TurnPhase::Speaking => "speaking",
            TurnPhase::Interrupted => "interrupted",
            TurnPhase::Switching => "switching",
        };
        write!(f, "{s}")
    }
}

/// Shared handle on the session's phase; owned by the pipeline driver,
/// observed by the barge-in controller.
#[derive(Clone)]
pub struct SharedPhase {
    inner: Arc<Mutex<TurnPhase>>,
}

impl SharedPhase {
    pub fn new() -> Self {
        Self { inner: Arc::new(Mutex::new(TurnPhase::Idle)) }
    }

    pub fn get(&self) -> TurnPhase {
        *self.inner.lock().unwrap()
    }

    /// Transition, enforcing the legal graph.  Illegal transitions are
    /// refused and logged — the state machine must never go inconsistent
    /// because of a racing event.
    pub fn transition(&self, next: TurnPhase) -> bool {
        let mut phase = self.inner.lock().unwrap();
        if *phase == next {
            return true;
        }
        if phase.can_transition_to(next) {
            *phase = next;
            true
        } else {
            warn!(from = %*phase, to = %next, "illegal phase transition refused");
            false
        }
    }
}

impl Default for SharedPhase {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_cycle() {
        use TurnPhase::*;
        assert!(Idle.can_transition_to(ReceivingUser));
        assert!(ReceivingUser.can_transition_to(Thinking));
        assert!(Thinking.can_transition_to(Speaking));
        assert!(Speaking.can_transition_to(Idle));
    }

    #[test]
    fn barge_in_path() {
        use TurnPhase::*;
        assert!(Speaking.can_transition_to(Interrupted));
        // Barge-in can land before the first audio chunk.
        assert!(Thinking.can_transition_to(Interrupted));
        assert!(Switching.can_transition_to(Interrupted));
        assert!(Interrupted.can_transition_to(ReceivingUser));
        assert!(Interrupted.can_transition_to(Idle));
    }

    #[test]
    fn handoff_path() {
        use TurnPhase::*;
        assert!(Thinking.can_transition_to(Switching));
        assert!(Speaking.can_transition_to(Switching));
        assert!(Switching.can_transition_to(Speaking));
        assert!(Switching.can_transition_to(Thinking));
    }

    #[test]
    fn illegal_transitions_rejected() {
        use TurnPhase::*;
        assert!(!Idle.can_transition_to(Speaking));
        assert!(!Idle.can_transition_to(Interrupted));
        assert!(!Interrupted.can_transition_to(Speaking));
    }

    #[test]
    fn shared_phase_starts_idle() {
        let p = SharedPhase::new();
        assert_eq!(p.get(), TurnPhase::Idle);
    }

    #[test]
    fn shared_phase_refuses_illegal() {
        let p = SharedPhase::new();
        assert!(!p.transition(TurnPhase::Speaking));
        assert_eq!(p.get(), TurnPhase::Idle);
        assert!(p.transition(TurnPhase::Thinking));
        assert_eq!(p.get(), TurnPhase::Thinking);
    }

    #[test]
    fn shared_phase_self_transition_is_noop_true() {
        let p = SharedPhase::new();
        assert!(p.transition(TurnPhase::Idle));
    }
}
