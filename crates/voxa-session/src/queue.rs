// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Bounded speech-event queue between the recognizer and the turn driver.
//!
//! Discipline: on overflow the oldest PARTIAL is evicted first — a final
//! transcript is never evicted.  Enqueueing a final against a queue full of
//! finals waits a bounded time for the driver to catch up; failing that the
//! turn is lost and a warning is logged.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::warn;

use voxa_speech::TranscriptEvent;

pub struct SpeechEventQueue {
    capacity: usize,
    final_enqueue_wait: Duration,
    items: Mutex<VecDeque<TranscriptEvent>>,
    /// Signalled on push (wakes the consumer) and on pop (wakes a blocked
    /// final-transcript producer).
    changed: Notify,
}

impl SpeechEventQueue {
    pub fn new(capacity: usize, final_enqueue_wait: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            final_enqueue_wait,
            items: Mutex::new(VecDeque::new()),
            changed: Notify::new(),
        }
    }

    /// Enqueue one event.  Returns `false` if the event was dropped.
    pub async fn push(&self, event: TranscriptEvent) -> bool {
        if !event.is_final() {
            let mut items = self.items.lock().unwrap();
            if items.len() >= self.capacity {
                // Partials are disposable; the newest hypothesis wins.
                if !evict_oldest_partial(&mut items) {
                    warn!("speech queue full of finals; dropping partial");
                    return false;
                }
            }
            items.push_back(event);
            drop(items);
            self.changed.notify_waiters();
            return true;
        }

        // Final transcript: try immediately, evicting a partial if needed,
        // then wait (bounded) for space.  The notified future is registered
        // BEFORE each capacity check so a pop between check and await cannot
        // be missed.
        let deadline = tokio::time::Instant::now() + self.final_enqueue_wait;
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut items = self.items.lock().unwrap();
                if items.len() < self.capacity || evict_oldest_partial(&mut items) {
                    items.push_back(event);
                    drop(items);
                    self.changed.notify_waiters();
                    return true;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!("speech queue full; final transcript lost");
                return false;
            }
        }
    }

    /// Dequeue the next event, waiting until one is available.
    pub async fn pop(&self) -> TranscriptEvent {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut items = self.items.lock().unwrap();
                if let Some(ev) = items.pop_front() {
                    drop(items);
                    self.changed.notify_waiters();
                    return ev;
                }
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn evict_oldest_partial(items: &mut VecDeque<TranscriptEvent>) -> bool {
    if let Some(pos) = items.iter().position(|e| !e.is_final()) {
        items.remove(pos);
        true
    } else {
        false
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
