// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Streaming speech-to-text interface.
//!
//! A recognizer stream consumes audio frames and emits transcript events.
//! The backend contract: a `Final` transcript is committed (never withdrawn)
//! and arrives within the VAD hang window of end-of-speech.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::AudioFrame;

#[derive(Debug, Error)]
pub enum SpeechError {
    #[error("speech backend fault: {0}")]
    Backend(String),
    #[error("speech stream closed")]
    Closed,
}

/// Events emitted by a recognizer stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    /// Voice activity began; fires barge-in when the agent is speaking.
    SpeechStarted,
    /// Unstable hypothesis; may be revised by later partials.
    Partial { text: String },
    /// Committed transcript for one utterance.
    Final { text: String, ts_ms: u64 },
}

impl TranscriptEvent {
    pub fn is_final(&self) -> bool {
        matches!(self, TranscriptEvent::Final { .. })
    }
}

/// One live recognition stream, exclusive to a session.
#[async_trait]
pub trait SttStream: Send {
    /// Feed one audio frame (internal 16 kHz PCM).
    async fn push_audio(&mut self, frame: AudioFrame) -> Result<(), SpeechError>;
    /// Next transcript event; `None` when the stream ends.
    async fn next_event(&mut self) -> Option<TranscriptEvent>;
}

/// A leasable recognizer client; opens one stream per call.
#[async_trait]
pub trait SttClient: Send + Sync {
    async fn open_stream(&self) -> Result<Box<dyn SttStream>, SpeechError>;
}

// ─── Test double ──────────────────────────────────────────────────────────────

/// Channel-backed recognizer for tests and the call simulator: transcript
/// events are injected through the handle instead of being recognized from
/// audio.  Pushed audio is counted so tests can assert frames arrived.
pub struct ChannelStt {
    rx: mpsc::UnboundedReceiver<TranscriptEvent>,
    bytes_seen: usize,
}

#[derive(Clone)]
pub struct ChannelSttHandle {
    tx: mpsc::UnboundedSender<TranscriptEvent>,
}

impl ChannelSttHandle {
    pub fn speech_started(&self) {
        let _ = self.tx.send(TranscriptEvent::SpeechStarted);
    }

    pub fn partial(&self, text: impl Into<String>) {
        let _ = self.tx.send(TranscriptEvent::Partial { text: text.into() });
    }

    pub fn final_transcript(&self, text: impl Into<String>) {
        let ts_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let _ = self.tx.send(TranscriptEvent::Final { text: text.into(), ts_ms });
    }
}

impl ChannelStt {
    pub fn pair() -> (ChannelSttHandle, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelSttHandle { tx }, Self { rx, bytes_seen: 0 })
    }

    pub fn bytes_seen(&self) -> usize {
        self.bytes_seen
    }
}

#[async_trait]
impl SttStream for ChannelStt {
    async fn push_audio(&mut self, frame: AudioFrame) -> Result<(), SpeechError> {
        self.bytes_seen += frame.bytes.len();
        Ok(())
    }

    async fn next_event(&mut self) -> Option<TranscriptEvent> {
        self.rx.recv().await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
