// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Bidirectional speech-LLM service events.
//!
//! The realtime pipeline exchanges JSON events with an external service that
//! does STT, LLM and TTS in one connection.  The enums here mirror the wire
//! (`type`-tagged JSON, audio as base64 in `ResponseAudioDelta`); the
//! [`RealtimeClient`] trait is the seam the session handler drives and the
//! scripted mock implements.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::SpeechError;

/// Server-side voice-activity turn detection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub silence_duration_ms: u64,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self { kind: "server_vad".into(), threshold: 0.5, silence_duration_ms: 500 }
    }
}

/// The session-update payload: the active agent projected into the shape the
/// service applies atomically on its next update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RealtimeSessionConfig {
    pub instructions: String,
    pub voice: String,
    pub modalities: Vec<String>,
    pub input_audio_format: String,
    pub output_audio_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcription_model: Option<String>,
    /// Tool schemas in the service's function-tool JSON shape.
    #[serde(default)]
    pub tools: Vec<serde_json::Value>,
}

/// Events the runtime sends to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Replace the session configuration (new agent after a handoff).
    SessionUpdate { session: RealtimeSessionConfig },
    /// Ask the service to produce the next response.
    ResponseCreate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        additional_instructions: Option<String>,
    },
    /// Post a completed function call's output back to the conversation.
    FunctionCallOutput { call_id: String, output: String },
    /// Cancel the in-flight response (barge-in, handoff).
    ResponseCancel,
    /// Append caller audio to the input buffer (base64).
    InputAudioAppend { audio: String },
}

/// Events the service sends to the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RealtimeEvent {
    /// The last `SessionUpdate` has been applied.
    SessionUpdated,
    /// Caller utterance transcript committed.
    InputTranscriptCompleted { text: String },
    /// Text portion of the response (the service synthesizes audio itself).
    ResponseTextDelta { text: String },
    /// Synthesized audio chunk, base64.
    ResponseAudioDelta { audio: String },
    /// The model requested a function call; arguments are complete.
    FunctionCallCompleted { call_id: String, name: String, arguments: String },
    /// The response (and therefore the turn) finished.
    ResponseDone,
    /// Caller started speaking during playback.
    SpeechStarted,
    Error { message: String },
}

/// The connection to a bidirectional speech-LLM service.
#[async_trait]
pub trait RealtimeClient: Send {
    async fn send(&mut self, event: ClientEvent) -> Result<(), SpeechError>;
    /// Next server event; `None` when the service disconnects.
    async fn next_event(&mut self) -> Option<RealtimeEvent>;
}

// ─── Test double ──────────────────────────────────────────────────────────────

/// Scripted realtime service for tests: server events are injected through
/// the handle, client events are recorded for assertions.  `SessionUpdate`
/// is acknowledged with `SessionUpdated` automatically (the service applies
/// updates asynchronously; the mock preserves that ordering contract).
pub struct ScriptedRealtime {
    server_rx: mpsc::UnboundedReceiver<RealtimeEvent>,
    server_tx: mpsc::UnboundedSender<RealtimeEvent>,
    sent: Arc<Mutex<Vec<ClientEvent>>>,
    auto_ack_session_update: bool,
}

#[derive(Clone)]
pub struct ScriptedRealtimeHandle {
    tx: mpsc::UnboundedSender<RealtimeEvent>,
    sent: Arc<Mutex<Vec<ClientEvent>>>,
}

impl ScriptedRealtimeHandle {
    pub fn push(&self, event: RealtimeEvent) {
        let _ = self.tx.send(event);
    }

    /// Everything the runtime sent to the service so far.
    pub fn sent(&self) -> Vec<ClientEvent> {
        self.sent.lock().unwrap().clone()
    }

    /// Count of sent events matching a predicate.
    pub fn sent_count(&self, pred: impl Fn(&ClientEvent) -> bool) -> usize {
        self.sent.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

impl ScriptedRealtime {
    pub fn pair() -> (ScriptedRealtimeHandle, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let handle = ScriptedRealtimeHandle { tx: tx.clone(), sent: Arc::clone(&sent) };
        (
            handle,
            Self { server_rx: rx, server_tx: tx, sent, auto_ack_session_update: true },
        )
    }

    /// Disable the automatic `SessionUpdated` ack; the test drives it manually.
    pub fn manual_ack(mut self) -> Self {
        self.auto_ack_session_update = false;
        self
    }
}

#[async_trait]
impl RealtimeClient for ScriptedRealtime {
    async fn send(&mut self, event: ClientEvent) -> Result<(), SpeechError> {
        let is_session_update = matches!(event, ClientEvent::SessionUpdate { .. });
        self.sent.lock().unwrap().push(event);
        if is_session_update && self.auto_ack_session_update {
            let _ = self.server_tx.send(RealtimeEvent::SessionUpdated);
        }
        Ok(())
    }

    async fn next_event(&mut self) -> Option<RealtimeEvent> {
        self.server_rx.recv().await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_event_wire_tagging() {
        let ev = ClientEvent::ResponseCreate {
            additional_instructions: Some("carry this".into()),
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains(r#""type":"response_create""#));
        assert!(json.contains("carry this"));
        let back: ClientEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn response_create_omits_empty_instructions() {
        let ev = ClientEvent::ResponseCreate { additional_instructions: None };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(!json.contains("additional_instructions"));
    }

    #[test]
    fn server_event_round_trip() {
        let ev = RealtimeEvent::FunctionCallCompleted {
            call_id: "c1".into(),
            name: "handoff_fraud".into(),
            arguments: r#"{"reason":"stolen card"}"#.into(),
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: RealtimeEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }

    #[tokio::test]
    async fn scripted_auto_acks_session_update() {
        let (_handle, mut rt) = ScriptedRealtime::pair();
        rt.send(ClientEvent::SessionUpdate { session: RealtimeSessionConfig::default() })
            .await
            .unwrap();
        assert_eq!(rt.next_event().await, Some(RealtimeEvent::SessionUpdated));
    }

    #[tokio::test]
    async fn scripted_manual_ack_stays_silent() {
        let (handle, rt) = ScriptedRealtime::pair();
        let mut rt = rt.manual_ack();
        rt.send(ClientEvent::SessionUpdate { session: RealtimeSessionConfig::default() })
            .await
            .unwrap();
        handle.push(RealtimeEvent::ResponseDone);
        // No SessionUpdated was queued; the next event is the manual one.
        assert_eq!(rt.next_event().await, Some(RealtimeEvent::ResponseDone));
    }

    #[tokio::test]
    async fn scripted_records_sent_events() {
        let (handle, mut rt) = ScriptedRealtime::pair();
        rt.send(ClientEvent::FunctionCallOutput { call_id: "c2".into(), output: "{}".into() })
            .await
            .unwrap();
        rt.send(ClientEvent::ResponseCancel).await.unwrap();
        assert_eq!(handle.sent().len(), 2);
        assert_eq!(
            handle.sent_count(|e| matches!(e, ClientEvent::ResponseCancel)),
            1
        );
    }

    #[test]
    fn turn_detection_default_is_server_vad() {
        let td = TurnDetection::default();
        assert_eq!(td.kind, "server_vad");
        assert!(td.silence_duration_ms > 0);
    }
}
