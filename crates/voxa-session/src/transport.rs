// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Transport framing.
//!
//! The front door (WebSocket server, auth) lives outside this crate; what
//! arrives here is a duplex frame stream.  Two sub-protocols are spoken:
//!
//! - **Browser PCM**: binary frames carry 16-bit LE PCM at 16 kHz; control
//!   messages are JSON objects with a `type` field.
//! - **Telephony µ-law**: the bridge's event envelope `{eventType, data}`
//!   with base64 µ-law payloads at 8 kHz, transcoded to the internal PCM
//!   format at this boundary.

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;

use voxa_speech::{
    downsample_16k_to_8k, pcm16_from_bytes, pcm16_to_bytes, ulaw_decode, ulaw_encode,
    upsample_8k_to_16k, AudioFormat, AudioFrame,
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// One frame exchanged with the peer, already decoded to the internal shape.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportFrame {
    /// Caller/agent audio in the internal 16 kHz PCM format.
    Audio(AudioFrame),
    /// Control message (JSON object).
    Control(Value),
}

impl TransportFrame {
    /// The control frame that tells the peer to stop playback immediately.
    pub fn stop_playback() -> Self {
        TransportFrame::Control(json!({ "type": "stop_playback" }))
    }
}

#[async_trait]
pub trait TransportSink: Send {
    async fn send(&mut self, frame: TransportFrame) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportSource: Send {
    /// Next inbound frame; `None` when the peer disconnected.
    async fn recv(&mut self) -> Option<TransportFrame>;
}

// ─── Browser PCM sub-protocol ─────────────────────────────────────────────────

pub mod browser {
    use super::*;

    /// Wire representation of one browser WebSocket frame.
    #[derive(Debug, Clone, PartialEq)]
    pub enum WireFrame {
        Binary(Vec<u8>),
        Text(String),
    }

    /// Decode one inbound wire frame.  Binary frames are raw 16 kHz PCM;
    /// text frames are `{type, ...}` JSON control messages.
    pub fn decode(frame: WireFrame) -> Result<TransportFrame, TransportError> {
        match frame {
            WireFrame::Binary(bytes) => Ok(TransportFrame::Audio(AudioFrame::pcm16k(bytes))),
            WireFrame::Text(text) => {
                let v: Value = serde_json::from_str(&text)
                    .map_err(|e| TransportError::Malformed(format!("control json: {e}")))?;
                if v.get("type").and_then(Value::as_str).is_none() {
                    return Err(TransportError::Malformed("control frame without type".into()));
                }
                Ok(TransportFrame::Control(v))
            }
        }
    }

    /// Encode one outbound frame for the browser.
    pub fn encode(frame: TransportFrame) -> WireFrame {
        match frame {
            TransportFrame::Audio(audio) => WireFrame::Binary(audio.bytes),
            TransportFrame::Control(v) => WireFrame::Text(v.to_string()),
        }
    }
}

// ─── Telephony µ-law sub-protocol ─────────────────────────────────────────────

pub mod telephony {
    use base64::Engine;

    use super::*;

    const B64: base64::engine::general_purpose::GeneralPurpose =
        base64::engine::general_purpose::STANDARD;

    /// Decode one bridge envelope.  `media` events carry base64 µ-law at
    /// 8 kHz, transcoded here to internal 16 kHz PCM; everything else passes
    /// through as a control frame.
    pub fn decode(text: &str) -> Result<TransportFrame, TransportError> {
        let v: Value = serde_json::from_str(text)
            .map_err(|e| TransportError::Malformed(format!("envelope json: {e}")))?;
        let event_type = v
            .get("eventType")
            .and_then(Value::as_str)
            .ok_or_else(|| TransportError::Malformed("envelope without eventType".into()))?;
        match event_type {
            "media" => {
                let payload = v["data"]["payload"]
                    .as_str()
                    .ok_or_else(|| TransportError::Malformed("media without payload".into()))?;
                let ulaw = B64
                    .decode(payload)
                    .map_err(|e| TransportError::Malformed(format!("payload base64: {e}")))?;
                let pcm8k = ulaw_decode(&ulaw);
                let pcm16k = upsample_8k_to_16k(&pcm8k);
                Ok(TransportFrame::Audio(AudioFrame::pcm16k(pcm16_to_bytes(&pcm16k))))
            }
            _ => Ok(TransportFrame::Control(v)),
        }
    }

    /// Encode one outbound frame into the bridge envelope.  Audio is
    /// downsampled and µ-law encoded; control frames are wrapped under
    /// their `type` as the envelope's eventType.
    pub fn encode(frame: TransportFrame) -> String {
        match frame {
            TransportFrame::Audio(audio) => {
                debug_assert_eq!(audio.format, AudioFormat::Pcm16k);
                let pcm16k = pcm16_from_bytes(&audio.bytes);
                let pcm8k = downsample_16k_to_8k(&pcm16k);
                let ulaw = ulaw_encode(&pcm8k);
                json!({
                    "eventType": "media",
                    "data": { "payload": B64.encode(ulaw) }
                })
                .to_string()
            }
            TransportFrame::Control(v) => {
                let event_type = v
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("control")
                    .to_string();
                json!({ "eventType": event_type, "data": v }).to_string()
            }
        }
    }
}

// ─── Channel transport (tests, simulator) ─────────────────────────────────────

/// In-process transport used by tests and the call simulator: inbound frames
/// are injected through the handle, outbound frames are collected from it.
pub struct ChannelTransport;

pub struct ChannelTransportHandle {
    inbound_tx: mpsc::UnboundedSender<TransportFrame>,
    outbound_rx: mpsc::UnboundedReceiver<TransportFrame>,
}

pub struct ChannelSink {
    tx: mpsc::UnboundedSender<TransportFrame>,
}

pub struct ChannelSource {
    rx: mpsc::UnboundedReceiver<TransportFrame>,
}

impl ChannelTransport {
    pub fn open() -> (ChannelTransportHandle, ChannelSink, ChannelSource) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        (
            ChannelTransportHandle { inbound_tx, outbound_rx },
            ChannelSink { tx: outbound_tx },
            ChannelSource { rx: inbound_rx },
        )
    }
}

impl ChannelTransportHandle {
    /// Inject a frame as if the peer sent it.
    pub fn push(&self, frame: TransportFrame) {
        let _ = self.inbound_tx.send(frame);
    }

    /// Simulate the peer disconnecting.
    pub fn close(self) -> mpsc::UnboundedReceiver<TransportFrame> {
        self.outbound_rx
    }

    /// Drain everything the session sent so far.
    pub fn drain_outbound(&mut self) -> Vec<TransportFrame> {
        let mut frames = Vec::new();
        while let Ok(f) = self.outbound_rx.try_recv() {
            frames.push(f);
        }
        frames
    }

    /// Await the next outbound frame.
    pub async fn next_outbound(&mut self) -> Option<TransportFrame> {
        self.outbound_rx.recv().await
    }
}

#[async_trait]
impl TransportSink for ChannelSink {
    async fn send(&mut self, frame: TransportFrame) -> Result<(), TransportError> {
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl TransportSource for ChannelSource {
    async fn recv(&mut self) -> Option<TransportFrame> {
        self.rx.recv().await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn browser_binary_frame_is_audio() {
        let f = browser::decode(browser::WireFrame::Binary(vec![1, 2, 3, 4])).unwrap();
        match f {
            TransportFrame::Audio(a) => {
                assert_eq!(a.format, AudioFormat::Pcm16k);
                assert_eq!(a.bytes, vec![1, 2, 3, 4]);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn browser_text_frame_is_typed_control() {
        let f = browser::decode(browser::WireFrame::Text(r#"{"type":"mute"}"#.into())).unwrap();
        assert!(matches!(f, TransportFrame::Control(v) if v["type"] == "mute"));
    }

    #[test]
    fn browser_control_without_type_is_malformed() {
        assert!(browser::decode(browser::WireFrame::Text(r#"{"x":1}"#.into())).is_err());
        assert!(browser::decode(browser::WireFrame::Text("not json".into())).is_err());
    }

    #[test]
    fn browser_encode_round_trip() {
        let audio = TransportFrame::Audio(AudioFrame::pcm16k(vec![9, 9]));
        assert_eq!(browser::encode(audio), browser::WireFrame::Binary(vec![9, 9]));
        let ctl = TransportFrame::stop_playback();
        match browser::encode(ctl) {
            browser::WireFrame::Text(t) => assert!(t.contains("stop_playback")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn telephony_media_round_trip_preserves_duration() {
        // 160 samples of 16 kHz PCM = 10ms; the bridge leg carries 80 µ-law
        // bytes and the far decode restores 160 samples.
        let samples: Vec<i16> = (0..160).map(|i| ((i % 32) * 500) as i16).collect();
        let outbound = TransportFrame::Audio(AudioFrame::pcm16k(pcm16_to_bytes(&samples)));
        let wire = telephony::encode(outbound);

        let v: Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(v["eventType"], "media");

        let back = telephony::decode(&wire).unwrap();
        match back {
            TransportFrame::Audio(a) => {
                assert_eq!(a.format, AudioFormat::Pcm16k);
                assert_eq!(pcm16_from_bytes(&a.bytes).len(), 160);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn telephony_non_media_event_is_control() {
        let f = telephony::decode(r#"{"eventType":"dtmf","data":{"digit":"5"}}"#).unwrap();
        assert!(matches!(f, TransportFrame::Control(v) if v["eventType"] == "dtmf"));
    }

    #[test]
    fn telephony_missing_event_type_is_malformed() {
        assert!(telephony::decode(r#"{"data":{}}"#).is_err());
    }

    #[test]
    fn telephony_control_encode_wraps_type() {
        let wire = telephony::encode(TransportFrame::stop_playback());
        let v: Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(v["eventType"], "stop_playback");
    }

    #[tokio::test]
    async fn channel_transport_duplex() {
        let (mut handle, mut sink, mut source) = ChannelTransport::open();
        handle.push(TransportFrame::Audio(AudioFrame::pcm16k(vec![1])));
        assert!(matches!(source.recv().await, Some(TransportFrame::Audio(_))));

        sink.send(TransportFrame::stop_playback()).await.unwrap();
        let out = handle.drain_outbound();
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn channel_source_ends_on_handle_drop() {
        let (handle, _sink, mut source) = ChannelTransport::open();
        drop(handle);
        assert!(source.recv().await.is_none());
    }
}
