// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Retry with exponential backoff for transient upstream faults.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::UpstreamError;

/// Backoff for attempt `n` (0-based): `base × 2^n` plus up to 25% jitter.
///
/// Jitter is derived from the subsecond nanos of the system clock; it only
/// needs to decorrelate concurrent sessions, not be uniform.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.saturating_mul(1u32 << attempt.min(16));
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0) as u64;
    let jitter_ns = (exp.as_nanos() as u64 / 4).min(u64::MAX / 2);
    let jitter = if jitter_ns == 0 { 0 } else { nanos % jitter_ns };
    exp + Duration::from_nanos(jitter)
}

/// Run `op` up to `attempts` times, sleeping between tries.
///
/// Only [`UpstreamError::Transient`] is retried; fatal faults and
/// cancellation return immediately.
pub async fn with_backoff<T, F, Fut>(
    attempts: u32,
    base: Duration,
    mut op: F,
) -> Result<T, UpstreamError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, UpstreamError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < attempts => {
                let delay = backoff_delay(base, attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %e,
                      "transient upstream fault; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
