// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! In-process latency aggregation.
//!
//! Exporters are out of scope; histograms are aggregated here and logged as
//! structured events at session teardown so any log shipper can pick them up.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tracing::info;

/// Fixed-bucket latency histogram (milliseconds).
pub struct Histogram {
    bounds: &'static [u64],
    counts: Mutex<Vec<u64>>,
    sum_ms: AtomicU64,
    total: AtomicU64,
}

const DEFAULT_BOUNDS_MS: &[u64] = &[10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000, 30_000];

impl Histogram {
    pub fn new() -> Self {
        Self {
            bounds: DEFAULT_BOUNDS_MS,
            counts: Mutex::new(vec![0; DEFAULT_BOUNDS_MS.len() + 1]),
            sum_ms: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    pub fn record(&self, d: Duration) {
        let ms = d.as_millis() as u64;
        let idx = self
            .bounds
            .iter()
            .position(|&b| ms <= b)
            .unwrap_or(self.bounds.len());
        self.counts.lock().unwrap()[idx] += 1;
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Mean in milliseconds; 0 when empty.
    pub fn mean_ms(&self) -> u64 {
        let n = self.count();
        if n == 0 {
            0
        } else {
            self.sum_ms.load(Ordering::Relaxed) / n
        }
    }

    /// `(upper_bound_ms, count)` pairs; the final entry is the overflow
    /// bucket with `u64::MAX` as its bound.
    pub fn buckets(&self) -> Vec<(u64, u64)> {
        let counts = self.counts.lock().unwrap();
        self.bounds
            .iter()
            .copied()
            .chain(std::iter::once(u64::MAX))
            .zip(counts.iter().copied())
            .collect()
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-session latency and handoff counters.
#[derive(Default)]
pub struct RuntimeMetrics {
    pub turn_latency: Histogram,
    pub llm_first_token: Histogram,
    pub tts_first_chunk: Histogram,
    pub tool_execution: Histogram,
    handoffs: AtomicU64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_handoff(&self) {
        self.handoffs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handoff_count(&self) -> u64 {
        self.handoffs.load(Ordering::Relaxed)
    }

    /// Structured summary, logged once at session teardown.
    pub fn log_summary(&self, session_id: &str) {
        info!(
            session_id,
            turns = self.turn_latency.count(),
            turn_mean_ms = self.turn_latency.mean_ms(),
            llm_first_token_mean_ms = self.llm_first_token.mean_ms(),
            tts_first_chunk_mean_ms = self.tts_first_chunk.mean_ms(),
            tool_calls = self.tool_execution.count(),
            tool_mean_ms = self.tool_execution.mean_ms(),
            handoffs = self.handoff_count(),
            "session metrics"
        );
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_histogram_is_zero() {
        let h = Histogram::new();
        assert_eq!(h.count(), 0);
        assert_eq!(h.mean_ms(), 0);
    }

    #[test]
    fn record_lands_in_the_right_bucket() {
        let h = Histogram::new();
        h.record(Duration::from_millis(30));
        let buckets = h.buckets();
        // 30ms falls in the ≤50 bucket.
        let (bound, count) = buckets.iter().find(|(b, _)| *b == 50).copied().unwrap();
        assert_eq!(bound, 50);
        assert_eq!(count, 1);
    }

    #[test]
    fn overflow_bucket_catches_large_values() {
        let h = Histogram::new();
        h.record(Duration::from_secs(120));
        let buckets = h.buckets();
        assert_eq!(buckets.last().unwrap().1, 1);
    }

    #[test]
    fn mean_is_sum_over_count() {
        let h = Histogram::new();
        h.record(Duration::from_millis(100));
        h.record(Duration::from_millis(300));
        assert_eq!(h.mean_ms(), 200);
        assert_eq!(h.count(), 2);
    }

    #[test]
    fn handoff_counter_increments() {
        let m = RuntimeMetrics::new();
        m.record_handoff();
        m.record_handoff();
        assert_eq!(m.handoff_count(), 2);
    }
}
