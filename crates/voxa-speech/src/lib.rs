// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod audio;
mod realtime;
mod stt;
mod tts;

pub use audio::{
    downsample_16k_to_8k, pcm16_from_bytes, pcm16_to_bytes, ulaw_decode, ulaw_encode,
    upsample_8k_to_16k, AudioFormat, AudioFrame,
};
pub use realtime::{
    ClientEvent, RealtimeClient, RealtimeEvent, RealtimeSessionConfig, ScriptedRealtime,
    ScriptedRealtimeHandle, TurnDetection,
};
pub use stt::{ChannelStt, ChannelSttHandle, SpeechError, SttClient, SttStream, TranscriptEvent};
pub use tts::{CollectingTts, CollectingTtsClient, TtsClient, TtsStream, VoiceSelection};
