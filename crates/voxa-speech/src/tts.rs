// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Streaming text-to-speech interface.
//!
//! A synthesis stream accepts text chunks as they arrive from the model and
//! yields audio frames.  Mid-stream cancellation is part of the contract:
//! barge-in must be able to silence the line without waiting for pending
//! chunks to render.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{AudioFrame, SpeechError};

/// Voice parameters resolved from the active agent's voice config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceSelection {
    pub voice: String,
    #[serde(default)]
    pub style: Option<String>,
    /// Speaking rate multiplier; 1.0 is neutral.
    #[serde(default = "default_rate")]
    pub rate: f32,
    /// Pitch shift in semitones; 0.0 is neutral.
    #[serde(default)]
    pub pitch: f32,
}

fn default_rate() -> f32 {
    1.0
}

impl Default for VoiceSelection {
    fn default() -> Self {
        Self { voice: String::new(), style: None, rate: 1.0, pitch: 0.0 }
    }
}

/// One live synthesis stream, exclusive to a session.
#[async_trait]
pub trait TtsStream: Send {
    /// Queue a text chunk for synthesis.
    async fn push_text(&mut self, chunk: &str) -> Result<(), SpeechError>;
    /// Signal that no more text follows for this turn.
    async fn finish(&mut self) -> Result<(), SpeechError>;
    /// Next synthesized frame; `None` once the stream is drained.
    async fn next_audio(&mut self) -> Option<AudioFrame>;
    /// Stop synthesis and drop queued chunks.  Idempotent.
    fn cancel(&mut self);
}

/// A leasable synthesizer client; opens one stream per turn.
#[async_trait]
pub trait TtsClient: Send + Sync {
    async fn open_stream(&self, voice: &VoiceSelection) -> Result<Box<dyn TtsStream>, SpeechError>;
}

// ─── Test double ──────────────────────────────────────────────────────────────

/// Synthesizer double: each text chunk becomes one PCM frame whose payload is
/// the chunk's UTF-8 bytes, so tests can assert both ordering and content of
/// "audio" reaching the transport.
pub struct CollectingTts {
    tx: mpsc::UnboundedSender<AudioFrame>,
    rx: mpsc::UnboundedReceiver<AudioFrame>,
    cancelled: Arc<AtomicBool>,
    spoken: Arc<Mutex<Vec<String>>>,
    finished: bool,
}

impl CollectingTts {
    fn new(cancelled: Arc<AtomicBool>, spoken: Arc<Mutex<Vec<String>>>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx, cancelled, spoken, finished: false }
    }
}

#[async_trait]
impl TtsStream for CollectingTts {
    async fn push_text(&mut self, chunk: &str) -> Result<(), SpeechError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.spoken.lock().unwrap().push(chunk.to_string());
        let _ = self.tx.send(AudioFrame::pcm16k(chunk.as_bytes().to_vec()));
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), SpeechError> {
        self.finished = true;
        Ok(())
    }

    async fn next_audio(&mut self) -> Option<AudioFrame> {
        if self.cancelled.load(Ordering::SeqCst) {
            // Drain-and-stop: cancellation drops everything still queued.
            while self.rx.try_recv().is_ok() {}
            return None;
        }
        if self.finished {
            match self.rx.try_recv() {
                Ok(f) => Some(f),
                Err(_) => None,
            }
        } else {
            self.rx.recv().await
        }
    }

    fn cancel(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Client that opens [`CollectingTts`] streams and exposes what was spoken
/// and whether any stream was cancelled.
#[derive(Default)]
pub struct CollectingTtsClient {
    cancelled: Arc<AtomicBool>,
    spoken: Arc<Mutex<Vec<String>>>,
    voices: Arc<Mutex<Vec<VoiceSelection>>>,
}

impl CollectingTtsClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// All text chunks pushed across every stream, in order.
    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Voices requested per opened stream (agent switches change the voice).
    pub fn voices(&self) -> Vec<VoiceSelection> {
        self.voices.lock().unwrap().clone()
    }

    /// Reset the cancel flag so the next turn's stream starts clean.
    pub fn clear_cancelled(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl TtsClient for CollectingTtsClient {
    async fn open_stream(&self, voice: &VoiceSelection) -> Result<Box<dyn TtsStream>, SpeechError> {
        self.voices.lock().unwrap().push(voice.clone());
        Ok(Box::new(CollectingTts::new(
            Arc::clone(&self.cancelled),
            Arc::clone(&self.spoken),
        )))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collecting_tts_round_trips_chunks_in_order() {
        let client = CollectingTtsClient::new();
        let mut stream = client.open_stream(&VoiceSelection::default()).await.unwrap();
        stream.push_text("hello ").await.unwrap();
        stream.push_text("world").await.unwrap();
        stream.finish().await.unwrap();

        let a = stream.next_audio().await.unwrap();
        let b = stream.next_audio().await.unwrap();
        assert_eq!(a.bytes, b"hello ".to_vec());
        assert_eq!(b.bytes, b"world".to_vec());
        assert!(stream.next_audio().await.is_none());
        assert_eq!(client.spoken(), vec!["hello ", "world"]);
    }

    #[tokio::test]
    async fn cancel_drops_queued_audio() {
        let client = CollectingTtsClient::new();
        let mut stream = client.open_stream(&VoiceSelection::default()).await.unwrap();
        stream.push_text("about to be interrupted").await.unwrap();
        stream.cancel();
        assert!(stream.next_audio().await.is_none());
        assert!(client.was_cancelled());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let client = CollectingTtsClient::new();
        let mut stream = client.open_stream(&VoiceSelection::default()).await.unwrap();
        stream.cancel();
        stream.cancel();
        assert!(stream.next_audio().await.is_none());
    }

    #[tokio::test]
    async fn push_after_cancel_is_silent() {
        let client = CollectingTtsClient::new();
        let mut stream = client.open_stream(&VoiceSelection::default()).await.unwrap();
        stream.cancel();
        stream.push_text("too late").await.unwrap();
        assert!(client.spoken().is_empty());
    }

    #[tokio::test]
    async fn client_records_requested_voices() {
        let client = CollectingTtsClient::new();
        let voice = VoiceSelection { voice: "en-GB-warm".into(), ..Default::default() };
        let _ = client.open_stream(&voice).await.unwrap();
        assert_eq!(client.voices()[0].voice, "en-GB-warm");
    }

    #[test]
    fn voice_selection_defaults_are_neutral() {
        let v = VoiceSelection::default();
        assert_eq!(v.rate, 1.0);
        assert_eq!(v.pitch, 0.0);
        assert!(v.style.is_none());
    }
}
