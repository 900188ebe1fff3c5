// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Barge-in: caller speech interrupting synthesized playback.
//!
//! The controller is armed with the current turn's cancellation token and
//! fires it when speech starts while the session is `Thinking` or
//! `Speaking`.  Firing is idempotent within one turn and a no-op once the
//! turn has returned to `Idle`.  The pipeline performs the TTS drain and
//! transport stop when `fire` reports a fresh interruption; the timestamps
//! recorded here feed the ≤250ms contract check.

use std::sync::Mutex;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{SharedPhase, TurnPhase};

struct ArmedTurn {
    token: CancellationToken,
    fired: bool,
}

pub struct BargeInController {
    phase: SharedPhase,
    armed: Mutex<Option<ArmedTurn>>,
    /// Instant of the most recent fresh fire, for latency telemetry.
    last_fire: Mutex<Option<Instant>>,
}

impl BargeInController {
    pub fn new(phase: SharedPhase) -> Self {
        Self { phase, armed: Mutex::new(None), last_fire: Mutex::new(None) }
    }

    /// Arm for a new turn.  Replaces any previous arming.
    pub fn arm(&self, token: CancellationToken) {
        *self.armed.lock().unwrap() = Some(ArmedTurn { token, fired: false });
    }

    /// Disarm at turn end; a late speech-start must not cancel the next turn.
    pub fn disarm(&self) {
        *self.armed.lock().unwrap() = None;
    }

    /// Handle a speech-start event.  Returns `true` only on a fresh
    /// interruption of an in-flight turn: the caller then drains TTS and
    /// signals the transport.  Repeated fires within one turn and fires
    /// while `Idle`/`ReceivingUser` return `false`.
    pub fn fire(&self) -> bool {
        let phase = self.phase.get();
        if !matches!(phase, TurnPhase::Thinking | TurnPhase::Speaking | TurnPhase::Switching) {
            return false;
        }
        let mut armed = self.armed.lock().unwrap();
        match armed.as_mut() {
            Some(turn) if !turn.fired => {
                turn.fired = true;
                turn.token.cancel();
                *self.last_fire.lock().unwrap() = Some(Instant::now());
                self.phase.transition(TurnPhase::Interrupted);
                debug!("barge-in fired; turn cancelled");
                true
            }
            _ => false,
        }
    }

    /// Instant of the last fresh fire, if any.
    pub fn last_fire(&self) -> Option<Instant> {
        *self.last_fire.lock().unwrap()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
