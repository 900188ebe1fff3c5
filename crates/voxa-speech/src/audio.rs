// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Audio frame types and the G.711 µ-law codec.
//!
//! The browser transport carries 16-bit little-endian PCM at 16 kHz; the
//! telephony bridge carries 8 kHz µ-law.  Both are transcoded to the
//! internal 16 kHz PCM representation at the transport boundary so the
//! recognizer and synthesizer only ever see one format.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioFormat {
    /// 16-bit LE PCM, mono, 16 kHz — the internal format.
    Pcm16k,
    /// 16-bit LE PCM, mono, 24 kHz — used by some synthesis backends.
    Pcm24k,
    /// G.711 µ-law, mono, 8 kHz — the telephony bridge format.
    Ulaw8k,
}

impl AudioFormat {
    pub fn sample_rate(&self) -> u32 {
        match self {
            AudioFormat::Pcm16k => 16_000,
            AudioFormat::Pcm24k => 24_000,
            AudioFormat::Ulaw8k => 8_000,
        }
    }
}

/// One chunk of audio in a known format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub format: AudioFormat,
    pub bytes: Vec<u8>,
}

impl AudioFrame {
    pub fn pcm16k(bytes: Vec<u8>) -> Self {
        Self { format: AudioFormat::Pcm16k, bytes }
    }

    pub fn ulaw8k(bytes: Vec<u8>) -> Self {
        Self { format: AudioFormat::Ulaw8k, bytes }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// ─── PCM byte helpers ─────────────────────────────────────────────────────────

pub fn pcm16_from_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect()
}

pub fn pcm16_to_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

// ─── G.711 µ-law ──────────────────────────────────────────────────────────────

const BIAS: i32 = 0x84;
const CLIP: i32 = 32_635;

/// Encode one linear PCM16 sample to µ-law.
pub fn ulaw_encode_sample(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let sign: u8 = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    if pcm > CLIP {
        pcm = CLIP;
    }
    pcm += BIAS;

    // Segment number: position of the highest set bit above bit 7.
    let mut segment = 0u8;
    let mut probe = pcm >> 7;
    while probe > 1 && segment < 7 {
        probe >>= 1;
        segment += 1;
    }

    let mantissa = ((pcm >> (segment + 3)) & 0x0F) as u8;
    !(sign | (segment << 4) | mantissa)
}

/// Decode one µ-law byte to a linear PCM16 sample.
pub fn ulaw_decode_sample(byte: u8) -> i16 {
    let b = !byte;
    let sign = b & 0x80;
    let segment = (b >> 4) & 0x07;
    let mantissa = (b & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + BIAS) << segment) - BIAS;
    if sign != 0 {
        -(magnitude as i16)
    } else {
        magnitude as i16
    }
}

pub fn ulaw_encode(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| ulaw_encode_sample(s)).collect()
}

pub fn ulaw_decode(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().map(|&b| ulaw_decode_sample(b)).collect()
}

// ─── Rate conversion ──────────────────────────────────────────────────────────

/// 8 kHz → 16 kHz by linear interpolation between neighbouring samples.
pub fn upsample_8k_to_16k(samples: &[i16]) -> Vec<i16> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for (i, &s) in samples.iter().enumerate() {
        out.push(s);
        let next = samples.get(i + 1).copied().unwrap_or(s);
        out.push(((s as i32 + next as i32) / 2) as i16);
    }
    out
}

/// 16 kHz → 8 kHz by averaging sample pairs.
pub fn downsample_16k_to_8k(samples: &[i16]) -> Vec<i16> {
    samples
        .chunks(2)
        .map(|pair| {
            let sum: i32 = pair.iter().map(|&s| s as i32).sum();
            (sum / pair.len() as i32) as i16
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
